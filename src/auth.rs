use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::rngs::OsRng;
use rusqlite::{Connection, OptionalExtension};

use crate::error::{invalid, Result, TirelireError};
use crate::models::User;
use crate::validate;

pub const MIN_PASSWORD_LEN: usize = 8;

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| TirelireError::Other(format!("password hashing failed: {e}")))
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

fn check_password_strength(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(invalid(format!(
            "Le mot de passe doit contenir au moins {MIN_PASSWORD_LEN} caractères"
        )));
    }
    Ok(())
}

const USER_COLUMNS: &str = "id, email, first_name, last_name, photo, currency, created_at";

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        photo: row.get(4)?,
        currency: row.get(5)?,
        created_at: row.get(6)?,
    })
}

pub fn get_user(conn: &Connection, id: i64) -> Result<User> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
        [id],
        row_to_user,
    )
    .optional()?
    .ok_or(TirelireError::Unauthenticated)
}

pub fn find_user_by_email(conn: &Connection, email: &str) -> Result<Option<User>> {
    let user = conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
            [email.trim().to_lowercase()],
            row_to_user,
        )
        .optional()?;
    Ok(user)
}

/// Look a user up by email for CLI commands.
pub fn require_user(conn: &Connection, email: &str) -> Result<User> {
    find_user_by_email(conn, email)?.ok_or_else(|| TirelireError::UnknownUser(email.to_string()))
}

pub fn list_users(conn: &Connection) -> Result<Vec<User>> {
    let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY id"))?;
    let rows = stmt
        .query_map([], row_to_user)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn register(
    conn: &Connection,
    email: &str,
    password: &str,
    first_name: &str,
    last_name: &str,
) -> Result<User> {
    if email.trim().is_empty() || password.is_empty() {
        return Err(invalid("Champs manquants"));
    }
    let email = validate::email(email)?;
    check_password_strength(password)?;
    if find_user_by_email(conn, &email)?.is_some() {
        return Err(TirelireError::Conflict("Email déjà utilisé".to_string()));
    }
    let hash = hash_password(password)?;
    conn.execute(
        "INSERT INTO users (email, password_hash, first_name, last_name) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![email, hash, first_name.trim(), last_name.trim()],
    )?;
    get_user(conn, conn.last_insert_rowid())
}

pub fn login(conn: &Connection, email: &str, password: &str) -> Result<User> {
    if email.trim().is_empty() || password.is_empty() {
        return Err(invalid("Email et mot de passe requis"));
    }
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT id, password_hash FROM users WHERE email = ?1",
            [email.trim().to_lowercase()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        Some((id, hash)) if verify_password(password, &hash) => get_user(conn, id),
        _ => Err(TirelireError::InvalidCredentials),
    }
}

pub fn change_password(conn: &Connection, user_id: i64, current: &str, new: &str) -> Result<()> {
    if current.is_empty() || new.is_empty() {
        return Err(invalid("Champs manquants"));
    }
    check_password_strength(new)?;
    let hash: String = conn
        .query_row("SELECT password_hash FROM users WHERE id = ?1", [user_id], |r| r.get(0))
        .optional()?
        .ok_or(TirelireError::Unauthenticated)?;
    if !verify_password(current, &hash) {
        return Err(TirelireError::InvalidCredentials);
    }
    let new_hash = hash_password(new)?;
    conn.execute(
        "UPDATE users SET password_hash = ?1 WHERE id = ?2",
        rusqlite::params![new_hash, user_id],
    )?;
    Ok(())
}

pub fn set_currency(conn: &Connection, user_id: i64, currency: &str) -> Result<()> {
    conn.execute(
        "UPDATE users SET currency = ?1 WHERE id = ?2",
        rusqlite::params![currency, user_id],
    )?;
    Ok(())
}

/// Split a display name on its first space into first and last name.
pub fn split_name(name: &str) -> (String, String) {
    let name = name.trim();
    match name.split_once(' ') {
        Some((first, last)) => (first.to_string(), last.trim().to_string()),
        None => (name.to_string(), String::new()),
    }
}

pub fn update_profile(conn: &Connection, user_id: i64, name: &str, email: &str) -> Result<User> {
    if name.trim().is_empty() {
        return Err(invalid("Le nom est requis"));
    }
    let email = validate::email(email)?;
    if let Some(other) = find_user_by_email(conn, &email)? {
        if other.id != user_id {
            return Err(TirelireError::Conflict("Email déjà utilisé".to_string()));
        }
    }
    let (first, last) = split_name(name);
    conn.execute(
        "UPDATE users SET first_name = ?1, last_name = ?2, email = ?3 WHERE id = ?4",
        rusqlite::params![first, last, email, user_id],
    )?;
    get_user(conn, user_id)
}

pub fn set_photo(conn: &Connection, user_id: i64, path: &str) -> Result<()> {
    conn.execute(
        "UPDATE users SET photo = ?1 WHERE id = ?2",
        rusqlite::params![path, user_id],
    )?;
    Ok(())
}
