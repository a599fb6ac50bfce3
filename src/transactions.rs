use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

use crate::categories::{category_id_by_name, get_category, get_subcategory, subcategory_id_by_name};
use crate::currency;
use crate::dates;
use crate::error::{invalid, Result, TirelireError};
use crate::goals;
use crate::models::{Transaction, TYPE_EPARGNE};
use crate::search::matches_search;
use crate::types::resolve_type;
use crate::validate;

pub const MAX_NOTES_LEN: usize = 1000;

/// A row ready to be written to `transactions`.
#[derive(Debug, Clone, Default)]
pub struct NewTransaction {
    pub user_id: i64,
    pub type_id: i64,
    pub type_code: String,
    /// Stored UTC `YYYY-MM-DD HH:MM:SS`.
    pub date: String,
    pub category_id: Option<i64>,
    pub subcategory_id: Option<i64>,
    pub amount: f64,
    pub amount_eur: Option<f64>,
    pub currency: String,
    pub notes: Option<String>,
    pub goal_id: Option<i64>,
    pub recurring_plan_id: Option<i64>,
}

pub fn insert(conn: &Connection, t: &NewTransaction) -> Result<i64> {
    conn.execute(
        "INSERT INTO transactions
            (user_id, type_id, type_code, date, category_id, subcategory_id,
             amount, amount_eur, currency, notes, goal_id, recurring_plan_id, recurring_group_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
        rusqlite::params![
            t.user_id,
            t.type_id,
            t.type_code,
            t.date,
            t.category_id,
            t.subcategory_id,
            t.amount,
            t.amount_eur,
            t.currency,
            t.notes,
            t.goal_id,
            t.recurring_plan_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Validated client payload for a create or update.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionInput {
    pub date: String,
    pub type_code: String,
    pub type_id: Option<i64>,
    pub category_id: Option<i64>,
    pub category_name: Option<String>,
    pub subcategory_id: Option<i64>,
    pub subcategory_name: Option<String>,
    pub amount: f64,
    pub notes: Option<String>,
    pub currency: String,
}

impl TransactionInput {
    pub fn from_json(data: &Value) -> Result<Self> {
        for key in ["Date", "Type", "Montant"] {
            if data.get(key).map_or(true, Value::is_null) {
                return Err(invalid(format!("Champs manquants: {key}")));
            }
        }
        let date = validate::date(data.get("Date"), "Date", false)?.unwrap_or_default();
        let type_code = validate::plain_string(data.get("Type"), "Type", 50)?
            .ok_or_else(|| invalid("Le champ Type est requis"))?;
        let amount = validate::required_float(data.get("Montant"), "Montant")?;
        Ok(Self {
            date,
            type_code,
            type_id: validate::int(data.get("id_type"), "id_type", true)?,
            category_id: validate::int(data.get("category_id"), "category_id", true)?,
            category_name: validate::plain_string(data.get("Catégorie"), "Catégorie", 100)?,
            subcategory_id: validate::int(data.get("subcategory_id"), "subcategory_id", true)?,
            subcategory_name: validate::plain_string(data.get("Sous-catégorie"), "Sous-catégorie", 100)?,
            amount,
            notes: validate::string(data.get("Notes"), "Notes", 0, MAX_NOTES_LEN, true)?,
            currency: validate::currency(data.get("currency"))?,
        })
    }
}

/// Resolve category and subcategory from ids, falling back to names. The
/// subcategory name is looked up inside the category first.
fn resolve_classification(conn: &Connection, input: &TransactionInput, type_id: i64) -> Result<(Option<i64>, Option<i64>)> {
    let category_id = match input.category_id.filter(|c| *c > 0) {
        Some(id) => {
            if get_category(conn, id)?.is_none() {
                return Err(invalid("Catégorie introuvable"));
            }
            Some(id)
        }
        None => match &input.category_name {
            Some(name) => category_id_by_name(conn, name, Some(type_id))?,
            None => None,
        },
    };
    let subcategory_id = match input.subcategory_id.filter(|s| *s > 0) {
        Some(id) => {
            if get_subcategory(conn, id)?.is_none() {
                return Err(invalid("Sous-catégorie introuvable"));
            }
            Some(id)
        }
        None => match &input.subcategory_name {
            Some(name) => subcategory_id_by_name(conn, category_id, name)?,
            None => None,
        },
    };
    Ok((category_id, subcategory_id))
}

fn build_row(conn: &Connection, user_id: i64, input: &TransactionInput) -> Result<NewTransaction> {
    let ty = resolve_type(conn, input.type_id, Some(&input.type_code))?;
    let (category_id, subcategory_id) = resolve_classification(conn, input, ty.id)?;
    let amount = input.amount.abs();
    Ok(NewTransaction {
        user_id,
        type_id: ty.id,
        type_code: ty.code,
        date: dates::normalize_client_datetime(&input.date),
        category_id,
        subcategory_id,
        amount,
        amount_eur: Some(currency::to_eur(amount, &input.currency)),
        currency: input.currency.clone(),
        notes: input.notes.clone(),
        goal_id: None,
        recurring_plan_id: None,
    })
}

pub fn add_transaction(conn: &mut Connection, user_id: i64, input: &TransactionInput) -> Result<i64> {
    if input.category_id.is_none() && input.category_name.is_none() {
        return Err(invalid("Champs manquants: category_id"));
    }
    let row = build_row(conn, user_id, input)?;
    let id = insert(conn, &row)?;
    if row.type_id == TYPE_EPARGNE {
        if let Some(sub) = row.subcategory_id {
            goals::sweep_after_write(conn, user_id, sub);
        }
    }
    Ok(id)
}

/// Owner of a transaction, or `NotFound`/`Forbidden`.
fn check_owner(conn: &Connection, user_id: i64, id: i64) -> Result<Option<i64>> {
    let row: Option<(i64, Option<i64>)> = conn
        .query_row(
            "SELECT user_id, subcategory_id FROM transactions WHERE id = ?1",
            [id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    match row {
        None => Err(TirelireError::NotFound("Transaction introuvable".to_string())),
        Some((owner, _)) if owner != user_id => Err(TirelireError::Forbidden),
        Some((_, sub)) => Ok(sub),
    }
}

pub fn update_transaction(conn: &mut Connection, user_id: i64, id: i64, input: &TransactionInput) -> Result<()> {
    let previous_sub = check_owner(conn, user_id, id)?;
    let row = build_row(conn, user_id, input)?;
    conn.execute(
        "UPDATE transactions SET
            date = ?1, type_id = ?2, type_code = ?3, amount = ?4, amount_eur = ?5,
            currency = ?6, notes = ?7,
            category_id = COALESCE(?8, category_id),
            subcategory_id = COALESCE(?9, subcategory_id)
         WHERE id = ?10 AND user_id = ?11",
        rusqlite::params![
            row.date,
            row.type_id,
            row.type_code,
            row.amount,
            row.amount_eur,
            row.currency,
            row.notes,
            row.category_id,
            row.subcategory_id,
            id,
            user_id,
        ],
    )?;

    let mut affected: Vec<i64> = previous_sub.into_iter().chain(row.subcategory_id).collect();
    affected.dedup();
    for sub in affected {
        goals::sweep_after_write(conn, user_id, sub);
    }
    Ok(())
}

/// Delete one transaction and return the invoice paths that belonged to it.
pub fn delete_transaction(conn: &Connection, user_id: i64, id: i64) -> Result<Vec<String>> {
    check_owner(conn, user_id, id)?;
    let files = invoice_paths(conn, id)?;
    conn.execute(
        "DELETE FROM transactions WHERE id = ?1 AND user_id = ?2",
        rusqlite::params![id, user_id],
    )?;
    Ok(files)
}

pub fn delete_all(conn: &Connection, user_id: i64) -> Result<(usize, Vec<String>)> {
    let mut stmt = conn.prepare("SELECT file_path FROM transaction_files WHERE user_id = ?1")?;
    let files = stmt
        .query_map([user_id], |r| r.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    let deleted = conn.execute("DELETE FROM transactions WHERE user_id = ?1", [user_id])?;
    Ok((deleted, files))
}

fn invoice_paths(conn: &Connection, transaction_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT file_path FROM transaction_files WHERE transaction_id = ?1")?;
    let rows = stmt
        .query_map([transaction_id], |r| r.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

const LIST_SELECT: &str = "
    SELECT t.id, t.date, t.amount, t.amount_eur, t.currency, t.notes, t.type_id,
           COALESCE(tt.code, t.type_code), t.category_id, c.name, t.subcategory_id, s.name, s.icon,
           t.goal_id, t.recurring_plan_id,
           (SELECT group_concat(f.file_path, '||') FROM transaction_files f WHERE f.transaction_id = t.id)
    FROM transactions t
    LEFT JOIN transaction_types tt ON tt.id = t.type_id
    LEFT JOIN categories c ON c.id = t.category_id
    LEFT JOIN subcategories s ON s.id = t.subcategory_id";

pub(crate) fn row_to_transaction(row: &rusqlite::Row) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get(0)?,
        date: row.get(1)?,
        amount: row.get(2)?,
        amount_eur: row.get(3)?,
        currency: row.get(4)?,
        notes: row.get(5)?,
        type_id: row.get(6)?,
        type_code: row.get(7)?,
        category_id: row.get(8)?,
        category: row.get(9)?,
        subcategory_id: row.get(10)?,
        subcategory: row.get(11)?,
        icon: row.get(12)?,
        goal_id: row.get(13)?,
        recurring_plan_id: row.get(14)?,
        invoices: row.get(15)?,
    })
}

/// The user's transactions, newest first, optionally filtered by a
/// diacritic-insensitive search query.
pub fn list_transactions(conn: &Connection, user_id: i64, query: Option<&str>) -> Result<Vec<Transaction>> {
    let mut stmt = conn.prepare(&format!(
        "{LIST_SELECT} WHERE t.user_id = ?1 ORDER BY t.date DESC, t.id DESC"
    ))?;
    let rows = stmt
        .query_map([user_id], row_to_transaction)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(match query.filter(|q| !q.trim().is_empty()) {
        Some(q) => rows.into_iter().filter(|t| matches_search(t, q)).collect(),
        None => rows,
    })
}

/// Occurrences generated by recurring plans, last 200.
pub fn list_recurring_occurrences(conn: &Connection, user_id: i64) -> Result<Vec<Transaction>> {
    let mut stmt = conn.prepare(&format!(
        "{LIST_SELECT} WHERE t.user_id = ?1 AND t.recurring_plan_id IS NOT NULL
         ORDER BY t.date DESC, t.id DESC LIMIT 200"
    ))?;
    let rows = stmt
        .query_map([user_id], row_to_transaction)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_transaction(conn: &Connection, user_id: i64, id: i64) -> Result<Transaction> {
    check_owner(conn, user_id, id)?;
    let t = conn.query_row(&format!("{LIST_SELECT} WHERE t.id = ?1"), [id], row_to_transaction)?;
    Ok(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categories::{add_category, add_subcategory};
    use crate::db::{test_db, test_user};
    use serde_json::json;

    fn courses_ids(conn: &Connection) -> (i64, i64) {
        conn.query_row(
            "SELECT category_id, id FROM subcategories WHERE name = 'Courses'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap()
    }

    fn input(data: Value) -> TransactionInput {
        TransactionInput::from_json(&data).unwrap()
    }

    #[test]
    fn test_from_json_requires_fields() {
        assert!(TransactionInput::from_json(&json!({"Type": "expense", "Montant": 5})).is_err());
        assert!(TransactionInput::from_json(&json!({"Date": "2024-01-01", "Type": "expense", "Montant": "abc"})).is_err());
        let long = "x".repeat(1001);
        assert!(TransactionInput::from_json(&json!({
            "Date": "2024-01-01", "Type": "expense", "Montant": 5, "Notes": long
        }))
        .is_err());
        assert!(TransactionInput::from_json(&json!({
            "Date": "2024-01-01", "Type": "expense", "Montant": 5, "currency": "USD"
        }))
        .is_err());
    }

    #[test]
    fn test_add_transaction_stores_abs_amount_and_eur_backup() {
        let (_dir, mut conn) = test_db();
        let uid = test_user(&conn, "a@b.fr");
        let (cat, sub) = courses_ids(&conn);
        let id = add_transaction(
            &mut conn,
            uid,
            &input(json!({
                "Date": "2024-01-15 10:00", "Type": "dépense", "id_type": 0,
                "category_id": cat, "subcategory_id": sub, "Montant": "-6559,57", "currency": "XOF"
            })),
        )
        .unwrap();
        let t = get_transaction(&conn, uid, id).unwrap();
        assert_eq!(t.amount, 6559.57);
        assert_eq!(t.amount_eur, Some(10.0));
        assert_eq!(t.currency, "XOF");
        assert_eq!(t.type_code, "expense");
        assert_eq!(t.date, "2024-01-15 09:00:00");
        assert_eq!(t.subcategory.as_deref(), Some("Courses"));
    }

    #[test]
    fn test_add_transaction_requires_category() {
        let (_dir, mut conn) = test_db();
        let uid = test_user(&conn, "a@b.fr");
        let res = add_transaction(&mut conn, uid, &input(json!({"Date": "2024-01-15", "Type": "expense", "Montant": 3})));
        assert!(matches!(res, Err(TirelireError::Validation(_))));
        let res = add_transaction(
            &mut conn,
            uid,
            &input(json!({"Date": "2024-01-15", "Type": "expense", "Montant": 3, "category_id": 9999})),
        );
        assert!(matches!(res, Err(TirelireError::Validation(_))));
    }

    #[test]
    fn test_epargne_deposit_triggers_goal_sweep() {
        let (_dir, mut conn) = test_db();
        let uid = test_user(&conn, "a@b.fr");
        let goal = goals::create_goal(&conn, uid, "Vélo", 100.0, false).unwrap();
        let cat = get_subcategory(&conn, goal.subcategory_id).unwrap().unwrap().category_id;
        for amount in [60, 40] {
            add_transaction(
                &mut conn,
                uid,
                &input(json!({
                    "Date": "2024-02-01", "Type": "epargne", "id_type": 3,
                    "category_id": cat, "subcategory_id": goal.subcategory_id, "Montant": amount
                })),
            )
            .unwrap();
        }
        let reached = goals::list_reached(&conn, uid).unwrap();
        assert_eq!(reached.len(), 1);
        assert_eq!(reached[0].goal_id, goal.id);
        assert_eq!(reached[0].deposit_count, 2);
        assert!(goals::list_goals(&conn, uid).unwrap().is_empty());
    }

    #[test]
    fn test_update_transaction_ownership_and_name_resolution() {
        let (_dir, mut conn) = test_db();
        let alice = test_user(&conn, "a@b.fr");
        let bob = test_user(&conn, "b@b.fr");
        let (cat, sub) = courses_ids(&conn);
        let id = add_transaction(
            &mut conn,
            alice,
            &input(json!({"Date": "2024-01-15", "Type": "expense", "category_id": cat, "subcategory_id": sub, "Montant": 3})),
        )
        .unwrap();
        let other_cat = add_category(&conn, 1, "Maison", None).unwrap();
        add_subcategory(&conn, other_cat, "Courses", None, None).unwrap();
        let restaurant = add_subcategory(&conn, cat, "Brasserie", None, None).unwrap();

        let upd = input(json!({
            "Date": "2024-01-16", "Type": "expense", "Montant": 7,
            "Catégorie": "Alimentation", "Sous-catégorie": "brasserie"
        }));
        assert!(matches!(update_transaction(&mut conn, bob, id, &upd), Err(TirelireError::Forbidden)));
        assert!(matches!(update_transaction(&mut conn, alice, 999, &upd), Err(TirelireError::NotFound(_))));
        update_transaction(&mut conn, alice, id, &upd).unwrap();
        let t = get_transaction(&conn, alice, id).unwrap();
        assert_eq!(t.amount, 7.0);
        assert_eq!(t.subcategory_id, Some(restaurant));
    }

    #[test]
    fn test_delete_and_list() {
        let (_dir, mut conn) = test_db();
        let alice = test_user(&conn, "a@b.fr");
        let bob = test_user(&conn, "b@b.fr");
        let (cat, sub) = courses_ids(&conn);
        let mut ids = Vec::new();
        for (date, note) in [("2024-01-01", "Café crème"), ("2024-02-01", "Marché")] {
            ids.push(
                add_transaction(
                    &mut conn,
                    alice,
                    &input(json!({"Date": date, "Type": "expense", "category_id": cat, "subcategory_id": sub, "Montant": 3, "Notes": note})),
                )
                .unwrap(),
            );
        }
        let all = list_transactions(&conn, alice, None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, ids[1], "newest first");
        let filtered = list_transactions(&conn, alice, Some("creme")).unwrap();
        assert_eq!(filtered.len(), 1);
        assert!(list_transactions(&conn, bob, None).unwrap().is_empty());

        assert!(matches!(delete_transaction(&conn, bob, ids[0]), Err(TirelireError::Forbidden)));
        delete_transaction(&conn, alice, ids[0]).unwrap();
        let (n, _) = delete_all(&conn, alice).unwrap();
        assert_eq!(n, 1);
    }
}
