use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use rusqlite::{Connection, OptionalExtension};

use crate::error::{invalid, Result, TirelireError};
use crate::models::{DeleteOutcome, TransactionType};

fn code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9_\-]{1,50}$").expect("valid regex"))
}

/// Map the French labels clients send to canonical type codes.
pub fn canonical_code(raw: &str) -> String {
    let code = raw.trim().to_lowercase();
    match code.as_str() {
        "dépense" | "depense" | "dépenses" | "depenses" => "expense".to_string(),
        "revenu" | "revenus" => "income".to_string(),
        "épargne" | "epargne" | "eparge" => "epargne".to_string(),
        _ => code,
    }
}

pub fn list_types(conn: &Connection) -> Result<Vec<TransactionType>> {
    let mut stmt = conn.prepare("SELECT id, code, label FROM transaction_types ORDER BY id")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(TransactionType {
                id: row.get(0)?,
                code: row.get(1)?,
                label: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_type(conn: &Connection, id: i64) -> Result<Option<TransactionType>> {
    let t = conn
        .query_row(
            "SELECT id, code, label FROM transaction_types WHERE id = ?1",
            [id],
            |row| {
                Ok(TransactionType {
                    id: row.get(0)?,
                    code: row.get(1)?,
                    label: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(t)
}

pub fn type_id_by_code(conn: &Connection, code: &str) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM transaction_types WHERE code = ?1",
            [canonical_code(code)],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Resolve a type from an explicit id, falling back to the code (or its
/// French alias) when the id is missing or unknown.
pub fn resolve_type(conn: &Connection, id: Option<i64>, code: Option<&str>) -> Result<TransactionType> {
    if let Some(id) = id {
        if let Some(t) = get_type(conn, id)? {
            return Ok(t);
        }
    }
    if let Some(code) = code.filter(|c| !c.trim().is_empty()) {
        if let Some(id) = type_id_by_code(conn, code)? {
            if let Some(t) = get_type(conn, id)? {
                return Ok(t);
            }
        }
    }
    Err(invalid("Type de transaction invalide"))
}

pub fn add_type(conn: &Connection, code: &str, label: &str) -> Result<i64> {
    let code = code.trim().to_lowercase();
    let label = label.trim();
    if code.is_empty() || label.is_empty() {
        return Err(invalid("Champs manquants"));
    }
    if !code_re().is_match(&code) {
        return Err(invalid("Code invalide"));
    }
    if type_id_by_code(conn, &code)?.is_some() {
        return Err(TirelireError::Duplicate("Code déjà existant".to_string()));
    }
    conn.execute(
        "INSERT INTO transaction_types (code, label) VALUES (?1, ?2)",
        rusqlite::params![code, label],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_type(conn: &Connection, id: i64, code: Option<&str>, label: &str) -> Result<()> {
    let label = label.trim();
    if id <= 0 || label.is_empty() {
        return Err(invalid("Champs manquants"));
    }
    let code = code.map(|c| c.trim().to_lowercase()).filter(|c| !c.is_empty());
    if let Some(c) = &code {
        if !code_re().is_match(c) {
            return Err(invalid("Code invalide"));
        }
    }
    if get_type(conn, id)?.is_none() {
        return Err(TirelireError::NotFound("Type introuvable".to_string()));
    }
    match code {
        Some(c) => {
            let dup: Option<i64> = conn
                .query_row(
                    "SELECT id FROM transaction_types WHERE code = ?1 AND id != ?2",
                    rusqlite::params![c, id],
                    |r| r.get(0),
                )
                .optional()?;
            if dup.is_some() {
                return Err(TirelireError::Duplicate("Code déjà utilisé".to_string()));
            }
            conn.execute(
                "UPDATE transaction_types SET code = ?1, label = ?2 WHERE id = ?3",
                rusqlite::params![c, label, id],
            )?;
        }
        None => {
            conn.execute(
                "UPDATE transaction_types SET label = ?1 WHERE id = ?2",
                rusqlite::params![label, id],
            )?;
        }
    }
    Ok(())
}

pub fn delete_type(conn: &mut Connection, id: i64, reassign_to: Option<i64>) -> Result<DeleteOutcome> {
    if get_type(conn, id)?.is_none() {
        return Err(TirelireError::NotFound("Type introuvable".to_string()));
    }
    let categories: i64 = conn.query_row(
        "SELECT count(*) FROM categories WHERE type_id = ?1",
        [id],
        |r| r.get(0),
    )?;
    let Some(target) = reassign_to else {
        if categories > 0 {
            return Ok(DeleteOutcome::ContainsRelated(BTreeMap::from([("categories", categories)])));
        }
        conn.execute("DELETE FROM transaction_types WHERE id = ?1", [id])?;
        return Ok(DeleteOutcome::Deleted { reassigned: BTreeMap::new() });
    };
    if target == id || get_type(conn, target)?.is_none() {
        return Err(invalid("Type de réaffectation introuvable"));
    }

    let tx = conn.transaction()?;
    let moved = tx.execute(
        "UPDATE categories SET type_id = ?1 WHERE type_id = ?2",
        rusqlite::params![target, id],
    )?;
    tx.execute(
        "UPDATE transactions SET type_id = ?1 WHERE type_id = ?2",
        rusqlite::params![target, id],
    )?;
    tx.execute("DELETE FROM transaction_types WHERE id = ?1", [id])?;
    tx.commit()?;
    Ok(DeleteOutcome::Deleted {
        reassigned: BTreeMap::from([("categories", moved)]),
    })
}
