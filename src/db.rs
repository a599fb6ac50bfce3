use std::path::Path;

use rusqlite::Connection;

use crate::error::Result;
use crate::settings::Settings;

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    email TEXT NOT NULL UNIQUE COLLATE NOCASE,
    password_hash TEXT NOT NULL,
    first_name TEXT NOT NULL DEFAULT '',
    last_name TEXT NOT NULL DEFAULT '',
    photo TEXT,
    currency TEXT NOT NULL DEFAULT 'EUR',
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id INTEGER,
    csrf_token TEXT NOT NULL,
    created_at TEXT DEFAULT (datetime('now')),
    last_seen TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS transaction_types (
    id INTEGER PRIMARY KEY,
    code TEXT NOT NULL UNIQUE,
    label TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS categories (
    id INTEGER PRIMARY KEY,
    type_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    manual_budget REAL,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (type_id) REFERENCES transaction_types(id)
);

CREATE TABLE IF NOT EXISTS subcategories (
    id INTEGER PRIMARY KEY,
    category_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    icon TEXT,
    manual_budget REAL,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (category_id) REFERENCES categories(id)
);

CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    type_id INTEGER,
    type_code TEXT NOT NULL DEFAULT '',
    date TEXT NOT NULL,
    category_id INTEGER,
    subcategory_id INTEGER,
    amount REAL NOT NULL,
    amount_eur REAL,
    currency TEXT NOT NULL DEFAULT 'EUR',
    notes TEXT,
    goal_id INTEGER,
    recurring_plan_id INTEGER,
    recurring_group_id INTEGER,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (type_id) REFERENCES transaction_types(id),
    FOREIGN KEY (category_id) REFERENCES categories(id),
    FOREIGN KEY (subcategory_id) REFERENCES subcategories(id)
);

CREATE INDEX IF NOT EXISTS idx_transactions_user_date ON transactions(user_id, date);
CREATE INDEX IF NOT EXISTS idx_transactions_subcategory ON transactions(user_id, subcategory_id, type_id);
CREATE INDEX IF NOT EXISTS idx_transactions_plan ON transactions(user_id, recurring_plan_id);

CREATE TABLE IF NOT EXISTS transaction_files (
    id INTEGER PRIMARY KEY,
    transaction_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    file_path TEXT NOT NULL,
    original_name TEXT NOT NULL,
    mime TEXT NOT NULL,
    size INTEGER NOT NULL,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (transaction_id) REFERENCES transactions(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS category_budgets (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    category_id INTEGER NOT NULL,
    subcategory_id INTEGER NOT NULL DEFAULT 0,
    year INTEGER NOT NULL,
    month INTEGER NOT NULL,
    amount REAL NOT NULL,
    UNIQUE (user_id, category_id, subcategory_id, year, month)
);

CREATE TABLE IF NOT EXISTS monthly_goals (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    period_year INTEGER NOT NULL,
    period_month INTEGER NOT NULL,
    target_amount REAL NOT NULL,
    rollover_enabled INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS goals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    subcategory_id INTEGER NOT NULL,
    amount REAL NOT NULL,
    amount_eur REAL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    automatic INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (subcategory_id) REFERENCES subcategories(id)
);

CREATE TABLE IF NOT EXISTS reached_goals (
    id INTEGER PRIMARY KEY,
    goal_id INTEGER NOT NULL UNIQUE,
    user_id INTEGER NOT NULL,
    subcategory_id INTEGER NOT NULL,
    name TEXT,
    target_amount REAL NOT NULL,
    target_amount_eur REAL,
    created_date TEXT,
    reached_date TEXT,
    total_collected REAL NOT NULL,
    total_collected_eur REAL,
    progress_pct REAL NOT NULL,
    deposit_count INTEGER NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS goal_plans (
    id INTEGER PRIMARY KEY,
    goal_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    plan_type TEXT NOT NULL,
    amount REAL,
    percent REAL,
    schedule_day INTEGER NOT NULL DEFAULT 1,
    active INTEGER NOT NULL DEFAULT 1,
    last_run_date TEXT,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (goal_id) REFERENCES goals(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS recurring_plans (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    amount REAL NOT NULL,
    type_code TEXT NOT NULL,
    category TEXT,
    subcategory_id INTEGER,
    currency TEXT NOT NULL DEFAULT 'EUR',
    scheduled_at TEXT,
    frequency TEXT NOT NULL DEFAULT 'monthly',
    interval_count INTEGER NOT NULL DEFAULT 1,
    end_date TEXT,
    last_run_date TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    notes TEXT,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS ocr_feedback (
    id INTEGER PRIMARY KEY,
    user_id INTEGER,
    receipt_text_hash TEXT,
    redacted_text TEXT,
    merchant TEXT,
    invoice_hash TEXT,
    suggested_amount REAL,
    suggested_category TEXT,
    applied_amount REAL,
    applied_category TEXT,
    action TEXT NOT NULL,
    candidates TEXT,
    meta TEXT,
    created_at TEXT DEFAULT (datetime('now'))
);
";

// (id, code, label)
const DEFAULT_TYPES: &[(i64, &str, &str)] = &[
    (1, "expense", "Dépense"),
    (2, "income", "Revenu"),
    (3, "epargne", "Épargne"),
];

// (type_id, category, subcategories as (name, icon))
const DEFAULT_CATEGORIES: &[(i64, &str, &[(&str, &str)])] = &[
    (1, "Logement", &[("Loyer", "Home"), ("Électricité", "Lightning"), ("Eau", "Droplet"), ("Internet", "Laptop")]),
    (1, "Alimentation", &[("Courses", "ShoppingCart"), ("Restaurant", "Dining"), ("Café", "Coffee")]),
    (1, "Transport", &[("Carburant", "Car"), ("Taxi", "Taxi"), ("Bus", "Bus"), ("Train", "Train")]),
    (1, "Santé", &[("Pharmacie", "Pill"), ("Médecin", "Stethoscope"), ("Dentiste", "Tooth")]),
    (1, "Loisirs", &[("Cinéma", "Film"), ("Livres", "Books"), ("Voyage", "Plane")]),
    (1, "Shopping", &[("Vêtements", "Clothes"), ("Cadeaux", "Gift")]),
    (1, "Éducation", &[("Scolarité", "Graduation")]),
    (1, "Téléphone", &[("Forfait mobile", "Phone")]),
    (2, "Salaire", &[("Salaire principal", "MoneyBag")]),
    (2, "Autres revenus", &[("Remboursement", "CreditCard"), ("Prime", "MoneyWings")]),
    (3, "Objectif", &[]),
];

pub fn get_connection(db_path: &Path) -> Result<Connection> {
    get_keyed_connection(db_path, None)
}

/// Open the database, unlocking it first when a SQLCipher key is given.
pub fn get_keyed_connection(db_path: &Path, key: Option<&str>) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    if let Some(key) = key.filter(|k| !k.is_empty()) {
        conn.pragma_update(None, "key", key)?;
    }
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}

pub fn open_from_settings(settings: &Settings) -> Result<Connection> {
    get_keyed_connection(&settings.db_path(), settings.db_key.as_deref())
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    for (id, code, label) in DEFAULT_TYPES {
        conn.execute(
            "INSERT OR IGNORE INTO transaction_types (id, code, label) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, code, label],
        )?;
    }

    let count: i64 = conn.query_row("SELECT count(*) FROM categories", [], |row| row.get(0))?;
    if count == 0 {
        for (type_id, name, subs) in DEFAULT_CATEGORIES {
            conn.execute(
                "INSERT INTO categories (type_id, name) VALUES (?1, ?2)",
                rusqlite::params![type_id, name],
            )?;
            let cat_id = conn.last_insert_rowid();
            for (sub, icon) in subs.iter() {
                conn.execute(
                    "INSERT INTO subcategories (category_id, name, icon) VALUES (?1, ?2, ?3)",
                    rusqlite::params![cat_id, sub, icon],
                )?;
            }
        }
    }
    Ok(())
}

pub(crate) fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
pub(crate) fn test_db() -> (tempfile::TempDir, Connection) {
    let dir = tempfile::tempdir().unwrap();
    let conn = get_connection(&dir.path().join("test.db")).unwrap();
    init_db(&conn).unwrap();
    (dir, conn)
}

#[cfg(test)]
pub(crate) fn test_user(conn: &Connection, email: &str) -> i64 {
    conn.execute(
        "INSERT INTO users (email, password_hash) VALUES (?1, 'x')",
        [email],
    )
    .unwrap();
    conn.last_insert_rowid()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_db_creates_tables() {
        let (_dir, conn) = test_db();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        for expected in &[
            "users", "sessions", "transaction_types", "categories", "subcategories",
            "transactions", "transaction_files", "category_budgets", "monthly_goals",
            "goals", "reached_goals", "goal_plans", "recurring_plans", "ocr_feedback",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing table: {expected}");
        }
    }

    #[test]
    fn test_init_db_is_idempotent() {
        let (_dir, conn) = test_db();
        init_db(&conn).unwrap();
        let types: i64 = conn.query_row("SELECT count(*) FROM transaction_types", [], |r| r.get(0)).unwrap();
        assert_eq!(types, 3);
    }

    #[test]
    fn test_seeds_types_with_fixed_ids() {
        let (_dir, conn) = test_db();
        let code: String = conn
            .query_row("SELECT code FROM transaction_types WHERE id = 3", [], |r| r.get(0))
            .unwrap();
        assert_eq!(code, "epargne");
    }

    #[test]
    fn test_seeds_objectif_category() {
        let (_dir, conn) = test_db();
        let type_id: i64 = conn
            .query_row("SELECT type_id FROM categories WHERE name = 'Objectif'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(type_id, 3);
        let subs: i64 = conn.query_row("SELECT count(*) FROM subcategories", [], |r| r.get(0)).unwrap();
        assert!(subs >= 20, "expected seeded subcategories, got {subs}");
    }

    #[test]
    fn test_reached_goal_unique_per_goal() {
        let (_dir, conn) = test_db();
        let user_id = test_user(&conn, "a@b.fr");
        let insert = "INSERT INTO reached_goals (goal_id, user_id, subcategory_id, target_amount, total_collected, progress_pct, deposit_count) VALUES (7, ?1, 1, 10, 10, 100, 1)";
        conn.execute(insert, [user_id]).unwrap();
        let err = conn.execute(insert, [user_id]).unwrap_err();
        assert_eq!(
            err.sqlite_error_code(),
            Some(rusqlite::ErrorCode::ConstraintViolation)
        );
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(12.345678), 12.35);
        assert_eq!(round2(-3.14159), -3.14);
        // exact halves round away from zero
        assert_eq!(round2(0.125), 0.13);
        assert_eq!(round2(-0.125), -0.13);
        assert_eq!(round2(0.375), 0.38);
        assert_eq!(round2(2.675), 2.68);
        // -1.005 * 100 lands just short of the half
        assert_eq!(round2(-1.005), -1.0);
    }
}
