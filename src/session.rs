//! Cookie sessions stored in SQLite, each carrying one CSRF token.

use rand::RngCore;
use rusqlite::{Connection, OptionalExtension};

use crate::error::{Result, TirelireError};

pub const COOKIE_NAME: &str = "tirelire_session";

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub user_id: Option<i64>,
    pub csrf_token: String,
}

fn random_hex(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn create_session(conn: &Connection, user_id: Option<i64>) -> Result<Session> {
    let session = Session {
        id: random_hex(32),
        user_id,
        csrf_token: random_hex(32),
    };
    conn.execute(
        "INSERT INTO sessions (id, user_id, csrf_token) VALUES (?1, ?2, ?3)",
        rusqlite::params![session.id, session.user_id, session.csrf_token],
    )?;
    Ok(session)
}

pub fn load_session(conn: &Connection, id: &str) -> Result<Option<Session>> {
    let session = conn
        .query_row(
            "SELECT id, user_id, csrf_token FROM sessions WHERE id = ?1",
            [id],
            |row| {
                Ok(Session {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    csrf_token: row.get(2)?,
                })
            },
        )
        .optional()?;
    if session.is_some() {
        conn.execute(
            "UPDATE sessions SET last_seen = datetime('now') WHERE id = ?1",
            [id],
        )?;
    }
    Ok(session)
}

/// Replace a session with a fresh id bound to `user_id`. Used on login so a
/// pre-authentication id can never be reused.
pub fn regenerate(conn: &Connection, old_id: Option<&str>, user_id: i64) -> Result<Session> {
    if let Some(old) = old_id {
        destroy(conn, old)?;
    }
    create_session(conn, Some(user_id))
}

pub fn destroy(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM sessions WHERE id = ?1", [id])?;
    Ok(())
}

/// Delete sessions idle for longer than `max_idle_days`.
pub fn purge_stale(conn: &Connection, max_idle_days: i64) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM sessions WHERE last_seen < datetime('now', ?1)",
        [format!("-{max_idle_days} days")],
    )?;
    Ok(removed)
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn verify_csrf(session: &Session, provided: Option<&str>) -> Result<()> {
    match provided {
        Some(token) if !token.is_empty()
            && constant_time_eq(token.as_bytes(), session.csrf_token.as_bytes()) =>
        {
            Ok(())
        }
        _ => Err(TirelireError::Csrf),
    }
}
