use std::collections::BTreeMap;

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::error::{invalid, Result, TirelireError};
use crate::models::{Category, DeleteOutcome, Subcategory};

pub const MAX_NAME_LEN: usize = 100;

pub const ALLOWED_ICONS: &[&str] = &[
    "Target", "Car", "Taxi", "SUV", "Bus", "Plane", "Train", "MoneyBag", "MoneyWings", "Bride",
    "Girl", "ManRedHair", "CableCar", "Hospital", "Shopping", "Books", "Clothes", "ShoppingCart",
    "Coffee", "Gift", "CreditCard", "Book", "Heart", "Film", "Truck", "User", "Calendar",
    "Package", "Wallet", "LowBattery", "Lightning", "Plug", "WomanWithHeadscarf", "Dining",
    "Pasta", "HaircutMan", "Construction", "Factory", "CalendarAlt", "Bank", "DoctorWoman",
    "Medical", "Pill", "Stethoscope", "HealthWorker", "Tooth", "Droplet", "Tools", "Graduation",
    "Home", "Pin", "Phone", "Laptop",
];

const EMOJI_ICONS: &[(&str, &str)] = &[
    ("🎯", "Target"),
    ("🚗", "Car"),
    ("🚕", "Taxi"),
    ("🚙", "SUV"),
    ("🚌", "Bus"),
    ("✈️", "Plane"),
    ("✈", "Plane"),
    ("🚆", "Train"),
    ("💰", "MoneyBag"),
    ("💸", "MoneyWings"),
    ("👰‍♀️", "Bride"),
    ("👧", "Girl"),
    ("👨‍🦰", "ManRedHair"),
    ("🚡", "CableCar"),
    ("🏥", "Hospital"),
    ("🛍️", "Shopping"),
    ("📚", "Books"),
    ("👕", "Clothes"),
    ("🛒", "ShoppingCart"),
    ("☕", "Coffee"),
    ("🎁", "Gift"),
    ("💳", "CreditCard"),
    ("📖", "Book"),
    ("❤️", "Heart"),
    ("🎬", "Film"),
    ("🚚", "Truck"),
    ("👤", "User"),
    ("📅", "Calendar"),
    ("👛", "Wallet"),
    ("🪫", "LowBattery"),
    ("⚡", "Lightning"),
    ("🔌", "Plug"),
    ("🧕", "WomanWithHeadscarf"),
    ("🍽️", "Dining"),
    ("🍝", "Pasta"),
    ("💇‍♂️", "HaircutMan"),
    ("📦", "Package"),
    ("🏗️", "Construction"),
    ("🏭", "Factory"),
    ("📆", "CalendarAlt"),
    ("🏦", "Bank"),
    ("👩‍⚕️", "DoctorWoman"),
    ("⚕️", "Medical"),
    ("💊", "Pill"),
    ("🩺", "Stethoscope"),
    ("🧑‍⚕️", "HealthWorker"),
    ("🦷", "Tooth"),
    ("💧", "Droplet"),
    ("🛠️", "Tools"),
    ("🎓", "Graduation"),
    ("🏠", "Home"),
    ("📌", "Pin"),
    ("📱", "Phone"),
    ("💻", "Laptop"),
];

/// Map an emoji to its icon name and check it against the whitelist.
/// Empty input means "no icon".
pub fn normalize_icon(icon: Option<&str>) -> Result<Option<String>> {
    let Some(icon) = icon.map(str::trim).filter(|i| !i.is_empty()) else {
        return Ok(None);
    };
    if ALLOWED_ICONS.contains(&icon) {
        return Ok(Some(icon.to_string()));
    }
    EMOJI_ICONS
        .iter()
        .find(|(emoji, _)| *emoji == icon)
        .map(|(_, name)| Some(name.to_string()))
        .ok_or_else(|| invalid("Icone invalide"))
}

fn check_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(invalid("Champs manquants"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(invalid(format!("Le nom ne doit pas dépasser {MAX_NAME_LEN} caractères")));
    }
    Ok(name.to_string())
}

fn row_to_category(row: &rusqlite::Row) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        type_id: row.get(1)?,
        name: row.get(2)?,
        manual_budget: row.get(3)?,
    })
}

fn row_to_subcategory(row: &rusqlite::Row) -> rusqlite::Result<Subcategory> {
    Ok(Subcategory {
        id: row.get(0)?,
        category_id: row.get(1)?,
        name: row.get(2)?,
        icon: row.get(3)?,
        manual_budget: row.get(4)?,
    })
}

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

pub fn list_categories(conn: &Connection, type_id: Option<i64>) -> Result<Vec<Category>> {
    let mut stmt = conn.prepare(
        "SELECT id, type_id, name, manual_budget FROM categories
         WHERE ?1 IS NULL OR type_id = ?1
         ORDER BY name",
    )?;
    let rows = stmt
        .query_map([type_id], row_to_category)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_category(conn: &Connection, id: i64) -> Result<Option<Category>> {
    let c = conn
        .query_row(
            "SELECT id, type_id, name, manual_budget FROM categories WHERE id = ?1",
            [id],
            row_to_category,
        )
        .optional()?;
    Ok(c)
}

/// Case-insensitive lookup, preferring a category of the given type.
pub fn category_id_by_name(conn: &Connection, name: &str, type_id: Option<i64>) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM categories WHERE lower(name) = lower(?1)
             ORDER BY CASE WHEN type_id = ?2 THEN 0 ELSE 1 END, id LIMIT 1",
            rusqlite::params![name.trim(), type_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id)
}

fn type_exists(conn: &Connection, type_id: i64) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT count(*) FROM transaction_types WHERE id = ?1",
        [type_id],
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

pub fn add_category(conn: &Connection, type_id: i64, name: &str, manual_budget: Option<f64>) -> Result<i64> {
    let name = check_name(name)?;
    if !type_exists(conn, type_id)? {
        return Err(invalid("id_type invalide"));
    }
    let dup: Option<i64> = conn
        .query_row(
            "SELECT id FROM categories WHERE type_id = ?1 AND name = ?2",
            rusqlite::params![type_id, name],
            |r| r.get(0),
        )
        .optional()?;
    if dup.is_some() {
        return Err(TirelireError::Duplicate("Catégorie déjà existante".to_string()));
    }
    conn.execute(
        "INSERT INTO categories (type_id, name, manual_budget) VALUES (?1, ?2, ?3)",
        rusqlite::params![type_id, name, manual_budget],
    )?;
    Ok(conn.last_insert_rowid())
}

/// `manual_budget`: `None` keeps the stored value, `Some(None)` clears it.
pub fn update_category(
    conn: &Connection,
    id: i64,
    name: &str,
    type_id: Option<i64>,
    manual_budget: Option<Option<f64>>,
) -> Result<()> {
    if id <= 0 {
        return Err(invalid("Champs manquants"));
    }
    let name = check_name(name)?;
    let current = get_category(conn, id)?
        .ok_or_else(|| TirelireError::NotFound("Catégorie introuvable".to_string()))?;
    let target_type = match type_id.filter(|t| *t > 0) {
        Some(t) if !type_exists(conn, t)? => return Err(invalid("id_type invalide")),
        Some(t) => t,
        None => current.type_id,
    };
    let dup: Option<i64> = conn
        .query_row(
            "SELECT id FROM categories WHERE type_id = ?1 AND name = ?2 AND id != ?3",
            rusqlite::params![target_type, name, id],
            |r| r.get(0),
        )
        .optional()?;
    if dup.is_some() {
        return Err(TirelireError::Duplicate("Catégorie déjà existante".to_string()));
    }
    let budget = manual_budget.unwrap_or(current.manual_budget);
    conn.execute(
        "UPDATE categories SET name = ?1, type_id = ?2, manual_budget = ?3 WHERE id = ?4",
        rusqlite::params![name, target_type, budget, id],
    )?;
    Ok(())
}

/// Delete a category and its subcategories. The user's transactions and
/// goals in those subcategories block the delete unless a target
/// subcategory (outside this category) is given to move them to.
pub fn delete_category(
    conn: &mut Connection,
    user_id: i64,
    id: i64,
    reassign_to: Option<i64>,
) -> Result<DeleteOutcome> {
    if get_category(conn, id)?.is_none() {
        return Err(TirelireError::NotFound("Catégorie introuvable".to_string()));
    }
    let subcategories: i64 = conn.query_row(
        "SELECT count(*) FROM subcategories WHERE category_id = ?1",
        [id],
        |r| r.get(0),
    )?;
    let transactions: i64 = conn.query_row(
        "SELECT count(*) FROM transactions WHERE user_id = ?1
         AND (category_id = ?2 OR subcategory_id IN (SELECT id FROM subcategories WHERE category_id = ?2))",
        rusqlite::params![user_id, id],
        |r| r.get(0),
    )?;
    let goals: i64 = conn.query_row(
        "SELECT count(*) FROM goals WHERE user_id = ?1
         AND subcategory_id IN (SELECT id FROM subcategories WHERE category_id = ?2)",
        rusqlite::params![user_id, id],
        |r| r.get(0),
    )?;

    if (transactions > 0 || goals > 0) && reassign_to.is_none() {
        return Ok(DeleteOutcome::ContainsRelated(BTreeMap::from([
            ("subcategories", subcategories),
            ("transactions", transactions),
            ("objectifs", goals),
        ])));
    }

    let target = match reassign_to {
        Some(t) => {
            let sub = get_subcategory(conn, t)?
                .ok_or_else(|| invalid("Sous-catégorie de réaffectation introuvable"))?;
            if sub.category_id == id {
                return Err(invalid("Impossible de réaffecter vers la catégorie supprimée"));
            }
            Some(sub)
        }
        None => None,
    };

    let tx = conn.transaction()?;
    let mut reassigned = BTreeMap::new();
    if let Some(target) = target {
        let moved_tx = tx.execute(
            "UPDATE transactions SET category_id = ?1, subcategory_id = ?2
             WHERE user_id = ?3 AND (category_id = ?4
                OR subcategory_id IN (SELECT id FROM subcategories WHERE category_id = ?4))",
            rusqlite::params![target.category_id, target.id, user_id, id],
        )?;
        let moved_goals = tx.execute(
            "UPDATE goals SET subcategory_id = ?1
             WHERE user_id = ?2 AND subcategory_id IN (SELECT id FROM subcategories WHERE category_id = ?3)",
            rusqlite::params![target.id, user_id, id],
        )?;
        reassigned.insert("transactions", moved_tx);
        reassigned.insert("objectifs", moved_goals);
    }
    // Rows of other users still pointing here lose the link.
    tx.execute(
        "UPDATE transactions SET subcategory_id = NULL
         WHERE subcategory_id IN (SELECT id FROM subcategories WHERE category_id = ?1)",
        [id],
    )?;
    tx.execute("UPDATE transactions SET category_id = NULL WHERE category_id = ?1", [id])?;
    let deleted_subs = tx.execute("DELETE FROM subcategories WHERE category_id = ?1", [id])?;
    tx.execute("DELETE FROM categories WHERE id = ?1", [id])?;
    tx.commit()?;
    reassigned.insert("deleted_subcategories", deleted_subs);
    Ok(DeleteOutcome::Deleted { reassigned })
}

// ---------------------------------------------------------------------------
// Subcategories
// ---------------------------------------------------------------------------

pub fn list_subcategories(conn: &Connection, category_id: Option<i64>) -> Result<Vec<Subcategory>> {
    let mut stmt = conn.prepare(
        "SELECT id, category_id, name, icon, manual_budget FROM subcategories
         WHERE ?1 IS NULL OR category_id = ?1
         ORDER BY name",
    )?;
    let rows = stmt
        .query_map([category_id], row_to_subcategory)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_subcategory(conn: &Connection, id: i64) -> Result<Option<Subcategory>> {
    let s = conn
        .query_row(
            "SELECT id, category_id, name, icon, manual_budget FROM subcategories WHERE id = ?1",
            [id],
            row_to_subcategory,
        )
        .optional()?;
    Ok(s)
}

/// Case-insensitive name lookup, inside `category_id` first, then anywhere.
pub fn subcategory_id_by_name(conn: &Connection, category_id: Option<i64>, name: &str) -> Result<Option<i64>> {
    let name = name.trim();
    if name.is_empty() {
        return Ok(None);
    }
    if let Some(cat) = category_id {
        let id = conn
            .query_row(
                "SELECT id FROM subcategories WHERE category_id = ?1 AND lower(name) = lower(?2) LIMIT 1",
                rusqlite::params![cat, name],
                |r| r.get(0),
            )
            .optional()?;
        if id.is_some() {
            return Ok(id);
        }
    }
    let id = conn
        .query_row(
            "SELECT id FROM subcategories WHERE lower(name) = lower(?1) ORDER BY id LIMIT 1",
            [name],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id)
}

pub fn add_subcategory(
    conn: &Connection,
    category_id: i64,
    name: &str,
    icon: Option<&str>,
    manual_budget: Option<f64>,
) -> Result<i64> {
    if category_id <= 0 {
        return Err(invalid("Champs manquants"));
    }
    let name = check_name(name)?;
    let icon = normalize_icon(icon)?;
    if get_category(conn, category_id)?.is_none() {
        return Err(invalid("category_id invalide"));
    }
    let dup: Option<i64> = conn
        .query_row(
            "SELECT id FROM subcategories WHERE category_id = ?1 AND name = ?2",
            rusqlite::params![category_id, name],
            |r| r.get(0),
        )
        .optional()?;
    if dup.is_some() {
        return Err(TirelireError::Duplicate("Sous-catégorie déjà existante".to_string()));
    }
    conn.execute(
        "INSERT INTO subcategories (category_id, name, icon, manual_budget) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![category_id, name, icon, manual_budget],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_subcategory(
    conn: &Connection,
    id: i64,
    name: &str,
    category_id: Option<i64>,
    icon: Option<&str>,
    manual_budget: Option<Option<f64>>,
) -> Result<()> {
    if id <= 0 {
        return Err(invalid("Champs manquants"));
    }
    let name = check_name(name)?;
    let current = get_subcategory(conn, id)?
        .ok_or_else(|| TirelireError::NotFound("Sous-catégorie introuvable".to_string()))?;
    let target_category = match category_id.filter(|c| *c > 0) {
        Some(c) if get_category(conn, c)?.is_none() => return Err(invalid("category_id invalide")),
        Some(c) => c,
        None => current.category_id,
    };
    let dup: Option<i64> = conn
        .query_row(
            "SELECT id FROM subcategories WHERE category_id = ?1 AND name = ?2 AND id != ?3",
            rusqlite::params![target_category, name, id],
            |r| r.get(0),
        )
        .optional()?;
    if dup.is_some() {
        return Err(TirelireError::Duplicate("Sous-catégorie déjà existante".to_string()));
    }
    let icon = match icon {
        Some(i) => normalize_icon(Some(i))?,
        None => current.icon,
    };
    let budget = manual_budget.unwrap_or(current.manual_budget);
    conn.execute(
        "UPDATE subcategories SET name = ?1, category_id = ?2, icon = ?3, manual_budget = ?4 WHERE id = ?5",
        rusqlite::params![name, target_category, icon, budget, id],
    )?;
    Ok(())
}

pub fn delete_subcategory(
    conn: &mut Connection,
    user_id: i64,
    id: i64,
    reassign_to: Option<i64>,
) -> Result<DeleteOutcome> {
    if get_subcategory(conn, id)?.is_none() {
        return Err(TirelireError::NotFound("Sous-catégorie introuvable".to_string()));
    }
    let transactions: i64 = conn.query_row(
        "SELECT count(*) FROM transactions WHERE subcategory_id = ?1 AND user_id = ?2",
        rusqlite::params![id, user_id],
        |r| r.get(0),
    )?;
    let goals: i64 = conn.query_row(
        "SELECT count(*) FROM goals WHERE subcategory_id = ?1 AND user_id = ?2",
        rusqlite::params![id, user_id],
        |r| r.get(0),
    )?;
    if (transactions > 0 || goals > 0) && reassign_to.is_none() {
        return Ok(DeleteOutcome::ContainsRelated(BTreeMap::from([
            ("transactions", transactions),
            ("objectifs", goals),
        ])));
    }

    let target = match reassign_to {
        Some(t) if t == id => return Err(invalid("Impossible de réaffecter vers la même sous-catégorie")),
        Some(t) => Some(
            get_subcategory(conn, t)?
                .ok_or_else(|| invalid("Sous-catégorie de réaffectation introuvable"))?,
        ),
        None => None,
    };

    let tx = conn.transaction()?;
    let mut reassigned = BTreeMap::new();
    if let Some(target) = target {
        let moved_tx = tx.execute(
            "UPDATE transactions SET subcategory_id = ?1, category_id = ?2 WHERE subcategory_id = ?3 AND user_id = ?4",
            rusqlite::params![target.id, target.category_id, id, user_id],
        )?;
        let moved_goals = tx.execute(
            "UPDATE goals SET subcategory_id = ?1 WHERE subcategory_id = ?2 AND user_id = ?3",
            rusqlite::params![target.id, id, user_id],
        )?;
        reassigned.insert("transactions", moved_tx);
        reassigned.insert("objectifs", moved_goals);
    }
    tx.execute("UPDATE transactions SET subcategory_id = NULL WHERE subcategory_id = ?1", [id])?;
    tx.execute("DELETE FROM subcategories WHERE id = ?1", [id])?;
    tx.commit()?;
    Ok(DeleteOutcome::Deleted { reassigned })
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CategoryMatch {
    pub id: i64,
    pub name: String,
    pub type_id: i64,
    pub type_code: String,
    pub type_label: String,
}

/// Categories whose name contains `query`: exact matches first, then
/// prefix matches, then the rest. Queries shorter than two characters
/// return nothing.
pub fn search_categories(conn: &Connection, query: &str, limit: i64) -> Result<Vec<CategoryMatch>> {
    let q = query.trim();
    if q.chars().count() < 2 {
        return Ok(Vec::new());
    }
    let limit = limit.clamp(1, 50);
    let mut stmt = conn.prepare(
        "SELECT c.id, c.name, c.type_id, tt.code, tt.label,
                CASE WHEN lower(c.name) = lower(?1) THEN 0
                     WHEN lower(c.name) LIKE lower(?1) || '%' THEN 1
                     ELSE 2 END AS sort_order
         FROM categories c
         JOIN transaction_types tt ON tt.id = c.type_id
         WHERE lower(c.name) LIKE '%' || lower(?1) || '%'
         ORDER BY sort_order, c.name
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![q, limit], |row| {
            Ok(CategoryMatch {
                id: row.get(0)?,
                name: row.get(1)?,
                type_id: row.get(2)?,
                type_code: row.get(3)?,
                type_label: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_db, test_user};

    #[test]
    fn test_normalize_icon() {
        assert_eq!(normalize_icon(Some("Car")).unwrap().as_deref(), Some("Car"));
        assert_eq!(normalize_icon(Some("🚗")).unwrap().as_deref(), Some("Car"));
        assert_eq!(normalize_icon(Some("")).unwrap(), None);
        assert_eq!(normalize_icon(None).unwrap(), None);
        assert!(normalize_icon(Some("Unicorn")).is_err());
    }

    #[test]
    fn test_add_category_rejects_duplicates() {
        let (_dir, conn) = test_db();
        let id = add_category(&conn, 1, "Animaux", Some(50.0)).unwrap();
        let cat = get_category(&conn, id).unwrap().unwrap();
        assert_eq!(cat.manual_budget, Some(50.0));
        assert!(matches!(add_category(&conn, 1, "Animaux", None), Err(TirelireError::Duplicate(_))));
        // same name under another type is fine
        assert!(add_category(&conn, 2, "Animaux", None).is_ok());
        assert!(add_category(&conn, 99, "X", None).is_err());
    }

    #[test]
    fn test_update_category() {
        let (_dir, conn) = test_db();
        let id = add_category(&conn, 1, "Animaux", Some(10.0)).unwrap();
        update_category(&conn, id, "Animaux domestiques", None, None).unwrap();
        let cat = get_category(&conn, id).unwrap().unwrap();
        assert_eq!(cat.name, "Animaux domestiques");
        assert_eq!(cat.manual_budget, Some(10.0));
        update_category(&conn, id, "Animaux domestiques", Some(2), Some(None)).unwrap();
        let cat = get_category(&conn, id).unwrap().unwrap();
        assert_eq!(cat.type_id, 2);
        assert_eq!(cat.manual_budget, None);
        assert!(matches!(update_category(&conn, 999, "x", None, None), Err(TirelireError::NotFound(_))));
        assert!(matches!(update_category(&conn, id, "x", Some(42), None), Err(TirelireError::Validation(_))));
    }

    #[test]
    fn test_delete_category_blocks_then_reassigns() {
        let (_dir, mut conn) = test_db();
        let uid = test_user(&conn, "a@b.fr");
        let cat = add_category(&conn, 1, "Animaux", None).unwrap();
        let sub = add_subcategory(&conn, cat, "Croquettes", None, None).unwrap();
        let other_cat = add_category(&conn, 1, "Divers", None).unwrap();
        let other_sub = add_subcategory(&conn, other_cat, "Autre", None, None).unwrap();
        conn.execute(
            "INSERT INTO transactions (user_id, type_id, date, category_id, subcategory_id, amount)
             VALUES (?1, 1, '2024-01-01 10:00:00', ?2, ?3, 20)",
            rusqlite::params![uid, cat, sub],
        )
        .unwrap();

        let outcome = delete_category(&mut conn, uid, cat, None).unwrap();
        match outcome {
            DeleteOutcome::ContainsRelated(counts) => {
                assert_eq!(counts["transactions"], 1);
                assert_eq!(counts["subcategories"], 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(delete_category(&mut conn, uid, cat, Some(sub)).is_err());

        let outcome = delete_category(&mut conn, uid, cat, Some(other_sub)).unwrap();
        assert!(matches!(outcome, DeleteOutcome::Deleted { ref reassigned } if reassigned["transactions"] == 1));
        let (c, s): (i64, i64) = conn
            .query_row("SELECT category_id, subcategory_id FROM transactions", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!((c, s), (other_cat, other_sub));
        assert!(get_category(&conn, cat).unwrap().is_none());
        assert!(get_subcategory(&conn, sub).unwrap().is_none());
    }

    #[test]
    fn test_delete_empty_category() {
        let (_dir, mut conn) = test_db();
        let uid = test_user(&conn, "a@b.fr");
        let cat = add_category(&conn, 1, "Vide", None).unwrap();
        add_subcategory(&conn, cat, "Rien", Some("Pin"), None).unwrap();
        let outcome = delete_category(&mut conn, uid, cat, None).unwrap();
        assert!(matches!(outcome, DeleteOutcome::Deleted { ref reassigned } if reassigned["deleted_subcategories"] == 1));
    }

    #[test]
    fn test_subcategory_crud() {
        let (_dir, mut conn) = test_db();
        let uid = test_user(&conn, "a@b.fr");
        let cat = add_category(&conn, 1, "Animaux", None).unwrap();
        let sub = add_subcategory(&conn, cat, "Véto", Some("🩺"), Some(30.0)).unwrap();
        assert_eq!(get_subcategory(&conn, sub).unwrap().unwrap().icon.as_deref(), Some("Stethoscope"));
        assert!(matches!(add_subcategory(&conn, cat, "Véto", None, None), Err(TirelireError::Duplicate(_))));
        assert!(matches!(add_subcategory(&conn, cat, "Jouets", Some("nope"), None), Err(TirelireError::Validation(_))));

        update_subcategory(&conn, sub, "Vétérinaire", None, None, None).unwrap();
        let s = get_subcategory(&conn, sub).unwrap().unwrap();
        assert_eq!(s.name, "Vétérinaire");
        assert_eq!(s.icon.as_deref(), Some("Stethoscope"));
        assert_eq!(s.manual_budget, Some(30.0));

        let outcome = delete_subcategory(&mut conn, uid, sub, None).unwrap();
        assert!(matches!(outcome, DeleteOutcome::Deleted { .. }));
        assert!(get_subcategory(&conn, sub).unwrap().is_none());
    }

    #[test]
    fn test_delete_subcategory_with_goals() {
        let (_dir, mut conn) = test_db();
        let uid = test_user(&conn, "a@b.fr");
        let cat = add_category(&conn, 3, "Projets", None).unwrap();
        let sub = add_subcategory(&conn, cat, "Vacances", None, None).unwrap();
        let target = add_subcategory(&conn, cat, "Voyage", None, None).unwrap();
        conn.execute(
            "INSERT INTO goals (user_id, subcategory_id, amount) VALUES (?1, ?2, 500)",
            rusqlite::params![uid, sub],
        )
        .unwrap();
        let outcome = delete_subcategory(&mut conn, uid, sub, None).unwrap();
        assert!(matches!(outcome, DeleteOutcome::ContainsRelated(ref c) if c["objectifs"] == 1));
        assert!(matches!(delete_subcategory(&mut conn, uid, sub, Some(sub)), Err(TirelireError::Validation(_))));
        delete_subcategory(&mut conn, uid, sub, Some(target)).unwrap();
        let moved: i64 = conn.query_row("SELECT subcategory_id FROM goals", [], |r| r.get(0)).unwrap();
        assert_eq!(moved, target);
    }

    #[test]
    fn test_subcategory_id_by_name_prefers_category() {
        let (_dir, conn) = test_db();
        let a = add_category(&conn, 1, "A", None).unwrap();
        let b = add_category(&conn, 1, "B", None).unwrap();
        let in_a = add_subcategory(&conn, a, "Divers", None, None).unwrap();
        let in_b = add_subcategory(&conn, b, "Divers", None, None).unwrap();
        assert_eq!(subcategory_id_by_name(&conn, Some(b), "divers").unwrap(), Some(in_b));
        assert_eq!(subcategory_id_by_name(&conn, None, "DIVERS").unwrap(), Some(in_a));
        assert_eq!(subcategory_id_by_name(&conn, None, "").unwrap(), None);
    }

    #[test]
    fn test_search_categories_ordering() {
        let (_dir, conn) = test_db();
        add_category(&conn, 1, "Transports en commun", None).unwrap();
        add_category(&conn, 1, "Mon transport", None).unwrap();
        let results = search_categories(&conn, "transport", 10).unwrap();
        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Transport", "Transports en commun", "Mon transport"]);
        assert!(search_categories(&conn, "t", 10).unwrap().is_empty());
        assert_eq!(search_categories(&conn, "an", 0).unwrap().len(), 1);
    }
}
