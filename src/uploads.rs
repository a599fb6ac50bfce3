//! Invoice and avatar storage. Files land under `<data_dir>/uploads/` and
//! the database keeps paths relative to the data directory.

use std::path::{Component, Path, PathBuf};

use rand::Rng;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::warn;

use crate::auth;
use crate::error::{Result, TirelireError};
use crate::transactions;

const MAX_BASENAME_CHARS: usize = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Invoice,
    Avatar,
}

impl UploadKind {
    fn allowed_mimes(self) -> &'static [&'static str] {
        match self {
            Self::Invoice => &["image/jpeg", "image/png", "application/pdf"],
            Self::Avatar => &["image/jpeg", "image/png"],
        }
    }

    fn allowed_extensions(self) -> &'static [&'static str] {
        match self {
            Self::Invoice => &["jpg", "jpeg", "png", "pdf"],
            Self::Avatar => &["jpg", "jpeg", "png"],
        }
    }

    fn subdir(self) -> &'static str {
        match self {
            Self::Invoice => "invoices",
            Self::Avatar => "profiles",
        }
    }
}

/// Real content type from the leading magic bytes.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some("image/png")
    } else if bytes.starts_with(b"%PDF-") {
        Some("application/pdf")
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

/// Keep `[A-Za-z0-9._-]`, replace everything else with `_`, cap the length.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    base.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_BASENAME_CHARS)
        .collect()
}

fn extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoredFile {
    /// Relative to the data directory, e.g. `uploads/invoices/...`.
    pub path: String,
    pub original_name: String,
    pub mime: String,
    pub size: u64,
}

/// Validate and write an upload. Size is checked first (413), then the
/// sniffed type and the extension (415).
pub fn store(data_dir: &Path, kind: UploadKind, original_name: &str, bytes: &[u8], max_bytes: u64) -> Result<StoredFile> {
    let size = bytes.len() as u64;
    if size == 0 {
        return Err(TirelireError::Validation("Fichier manquant".to_string()));
    }
    if size > max_bytes {
        return Err(TirelireError::PayloadTooLarge);
    }
    let mime = sniff_mime(bytes)
        .filter(|m| kind.allowed_mimes().contains(m))
        .ok_or_else(|| TirelireError::UnsupportedMediaType("Type de fichier non autorisé".to_string()))?;
    if !extension(original_name).is_some_and(|e| kind.allowed_extensions().contains(&e.as_str())) {
        return Err(TirelireError::UnsupportedMediaType("Extension non autorisée".to_string()));
    }

    let random: [u8; 6] = rand::thread_rng().gen();
    let file_name = format!(
        "{}_{}_{}",
        chrono::Utc::now().timestamp(),
        hex::encode(random),
        sanitize_filename(original_name)
    );
    let relative = format!("uploads/{}/{file_name}", kind.subdir());
    let dir = data_dir.join("uploads").join(kind.subdir());
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join(&file_name), bytes)?;

    Ok(StoredFile {
        path: relative,
        original_name: original_name.to_string(),
        mime: mime.to_string(),
        size,
    })
}

/// Store an invoice for one of the user's transactions.
pub fn attach_invoice(
    conn: &Connection,
    data_dir: &Path,
    user_id: i64,
    transaction_id: i64,
    original_name: &str,
    bytes: &[u8],
    max_bytes: u64,
) -> Result<StoredFile> {
    transactions::get_transaction(conn, user_id, transaction_id)?;
    let stored = store(data_dir, UploadKind::Invoice, original_name, bytes, max_bytes)?;
    conn.execute(
        "INSERT INTO transaction_files (transaction_id, user_id, file_path, original_name, mime, size)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            transaction_id,
            user_id,
            stored.path,
            stored.original_name,
            stored.mime,
            stored.size as i64
        ],
    )?;
    Ok(stored)
}

/// Replace the user's profile photo. The previous file is removed once the
/// new path is saved.
pub fn replace_avatar(
    conn: &Connection,
    data_dir: &Path,
    user_id: i64,
    original_name: &str,
    bytes: &[u8],
    max_bytes: u64,
) -> Result<StoredFile> {
    let previous: Option<String> = conn
        .query_row("SELECT photo FROM users WHERE id = ?1", [user_id], |r| r.get(0))
        .optional()?
        .flatten();
    let stored = store(data_dir, UploadKind::Avatar, original_name, bytes, max_bytes)?;
    auth::set_photo(conn, user_id, &stored.path)?;
    if let Some(old) = previous.filter(|p| *p != stored.path) {
        remove_files(data_dir, &[old]);
    }
    Ok(stored)
}

/// Resolve a stored relative path, refusing anything outside `uploads/`.
fn resolve_stored(data_dir: &Path, relative: &str) -> Option<PathBuf> {
    let rel = Path::new(relative.trim_start_matches(['/', '\\']));
    let safe = rel.components().all(|c| matches!(c, Component::Normal(_)));
    (safe && rel.starts_with("uploads")).then(|| data_dir.join(rel))
}

/// Best-effort removal of stored files; failures are logged.
pub fn remove_files(data_dir: &Path, paths: &[String]) -> usize {
    let mut removed = 0;
    for p in paths {
        let Some(full) = resolve_stored(data_dir, p) else {
            warn!(path = %p, "refusing to remove file outside uploads");
            continue;
        };
        match std::fs::remove_file(&full) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %full.display(), error = %e, "could not remove upload"),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_db, test_user};
    use crate::transactions::{insert, NewTransaction};

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
    const PDF: &[u8] = b"%PDF-1.7\n...";

    fn tx(conn: &Connection, uid: i64) -> i64 {
        insert(
            conn,
            &NewTransaction {
                user_id: uid,
                type_id: 1,
                type_code: "expense".into(),
                date: "2024-03-01 10:00:00".into(),
                amount: 12.0,
                currency: "EUR".into(),
                ..NewTransaction::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_sniff_mime() {
        assert_eq!(sniff_mime(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(sniff_mime(PNG), Some("image/png"));
        assert_eq!(sniff_mime(PDF), Some("application/pdf"));
        assert_eq!(sniff_mime(b"RIFF\0\0\0\0WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff_mime(b"<?php echo 1;"), None);
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../../etc/pass wd.pdf"), "pass_wd.pdf");
        assert_eq!(sanitize_filename("facture été.png"), "facture__t_.png");
        assert_eq!(sanitize_filename(&"a".repeat(300)).len(), 150);
    }

    #[test]
    fn test_store_checks_size_type_and_extension() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            store(dir.path(), UploadKind::Invoice, "a.png", PNG, 4),
            Err(TirelireError::PayloadTooLarge)
        ));
        assert!(matches!(
            store(dir.path(), UploadKind::Invoice, "a.png", b"not an image", 1024),
            Err(TirelireError::UnsupportedMediaType(_))
        ));
        assert!(matches!(
            store(dir.path(), UploadKind::Invoice, "a.exe", PNG, 1024),
            Err(TirelireError::UnsupportedMediaType(_))
        ));
        assert!(matches!(
            store(dir.path(), UploadKind::Avatar, "a.pdf", PDF, 1024),
            Err(TirelireError::UnsupportedMediaType(_))
        ));
        let stored = store(dir.path(), UploadKind::Invoice, "Ticket Carrefour.PDF", PDF, 1024).unwrap();
        assert!(stored.path.starts_with("uploads/invoices/"));
        assert!(stored.path.ends_with("_Ticket_Carrefour.PDF"));
        assert_eq!(stored.mime, "application/pdf");
        assert!(dir.path().join(&stored.path).exists());
    }

    #[test]
    fn test_attach_invoice_checks_owner_and_lists_path() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, conn) = test_db();
        let alice = test_user(&conn, "a@b.fr");
        let bob = test_user(&conn, "b@b.fr");
        let id = tx(&conn, alice);
        assert!(matches!(
            attach_invoice(&conn, dir.path(), bob, id, "f.pdf", PDF, 1024),
            Err(TirelireError::Forbidden)
        ));
        let stored = attach_invoice(&conn, dir.path(), alice, id, "f.pdf", PDF, 1024).unwrap();
        let t = transactions::get_transaction(&conn, alice, id).unwrap();
        assert_eq!(t.invoices.as_deref(), Some(stored.path.as_str()));

        let paths = transactions::delete_transaction(&conn, alice, id).unwrap();
        assert_eq!(remove_files(dir.path(), &paths), 1);
        assert!(!dir.path().join(&stored.path).exists());
    }

    #[test]
    fn test_replace_avatar_removes_previous() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, conn) = test_db();
        let uid = test_user(&conn, "a@b.fr");
        let first = replace_avatar(&conn, dir.path(), uid, "me.png", PNG, 1024).unwrap();
        let second = replace_avatar(&conn, dir.path(), uid, "me2.png", PNG, 1024).unwrap();
        assert!(!dir.path().join(&first.path).exists());
        assert!(dir.path().join(&second.path).exists());
        assert_eq!(auth::get_user(&conn, uid).unwrap().photo, Some(second.path));
    }

    #[test]
    fn test_remove_files_refuses_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("keep.txt");
        std::fs::write(&outside, "x").unwrap();
        assert_eq!(remove_files(dir.path(), &["uploads/../keep.txt".to_string()]), 0);
        assert_eq!(remove_files(dir.path(), &["keep.txt".to_string()]), 0);
        assert!(outside.exists());
    }
}
