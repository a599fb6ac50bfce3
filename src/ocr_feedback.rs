//! Receipt-scanner feedback: what the scorer suggested and what the user
//! kept. Receipt text is never stored whole.

use std::io::Write;
use std::sync::OnceLock;

use chrono::{Duration, NaiveDateTime};
use regex::Regex;
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::dates::{self, DB_FORMAT};
use crate::error::{invalid, Result};
use crate::settings::Settings;
use crate::validate;

const ACTIONS: &[&str] = &["accepted", "overridden", "rejected"];
const STORED_PREFIX_CHARS: usize = 500;
const MAX_FULL_TEXT_CHARS: usize = 5000;
const EXPORTED_CANDIDATES: usize = 5;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedbackInput {
    pub action: String,
    pub merchant: Option<String>,
    pub invoice_hash: Option<String>,
    pub suggested_amount: Option<f64>,
    pub suggested_category: Option<String>,
    pub applied_amount: Option<f64>,
    pub applied_category: Option<String>,
    pub full_text: Option<String>,
    pub candidates: Option<Value>,
    pub meta: Option<Value>,
}

impl FeedbackInput {
    pub fn from_json(data: &Value) -> Result<Self> {
        let action = data.get("action").and_then(Value::as_str).unwrap_or("");
        if !ACTIONS.contains(&action) {
            return Err(invalid("Action manquante ou invalide"));
        }
        let present = |key: &str| data.get(key).filter(|v| !v.is_null()).cloned();
        Ok(Self {
            action: action.to_string(),
            merchant: validate::plain_string(data.get("merchant"), "merchant", 255)?,
            invoice_hash: validate::plain_string(data.get("invoice_hash"), "invoice_hash", 64)?,
            suggested_amount: validate::float(data.get("suggested_amount"), "suggested_amount", true)?,
            suggested_category: validate::plain_string(data.get("suggested_category"), "suggested_category", 255)?,
            applied_amount: validate::float(data.get("applied_amount"), "applied_amount", true)?,
            applied_category: validate::plain_string(data.get("applied_category"), "applied_category", 255)?,
            full_text: validate::plain_string(data.get("full_text"), "full_text", MAX_FULL_TEXT_CHARS)?,
            candidates: present("candidates"),
            meta: present("meta"),
        })
    }
}

pub fn sha256_hex(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

pub fn store_feedback(conn: &Connection, user_id: Option<i64>, input: &FeedbackInput) -> Result<i64> {
    let text_hash = input.full_text.as_deref().map(sha256_hex);
    let prefix: Option<String> = input
        .full_text
        .as_deref()
        .map(|t| t.chars().take(STORED_PREFIX_CHARS).collect());
    let candidates = input.candidates.as_ref().map(serde_json::to_string).transpose()?;
    let meta = input.meta.as_ref().map(serde_json::to_string).transpose()?;

    conn.execute(
        "INSERT INTO ocr_feedback (user_id, receipt_text_hash, redacted_text, merchant, invoice_hash,
            suggested_amount, suggested_category, applied_amount, applied_category, action, candidates, meta)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            user_id,
            text_hash,
            prefix,
            input.merchant,
            input.invoice_hash,
            input.suggested_amount,
            input.suggested_category,
            input.applied_amount,
            input.applied_category,
            input.action,
            candidates,
            meta,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid regex"))
}

/// Emails become `[EMAIL]`, every digit becomes `X`, capped at 500 chars.
pub fn redact(text: &str) -> String {
    let masked = email_re().replace_all(text, "[EMAIL]");
    masked
        .chars()
        .map(|c| if c.is_ascii_digit() { 'X' } else { c })
        .take(STORED_PREFIX_CHARS)
        .collect()
}

/// Whether the caller may export feedback: the configured admin user, or a
/// matching `X-Admin-Token`.
pub fn is_admin(settings: &Settings, user_id: Option<i64>, token: Option<&str>) -> bool {
    let by_user = matches!((settings.admin_user_id, user_id), (Some(a), Some(u)) if a == u);
    let by_token = match (settings.admin_token.as_deref(), token) {
        (Some(expected), Some(given)) if !expected.is_empty() => {
            crate::session::constant_time_eq(expected.as_bytes(), given.as_bytes())
        }
        _ => false,
    };
    by_user || by_token
}

/// Start of the export window: `since` wins, then `days`, default one day.
pub fn export_since(since: Option<&str>, days: Option<i64>, now: NaiveDateTime) -> Result<NaiveDateTime> {
    if let Some(raw) = since.filter(|s| !s.trim().is_empty()) {
        return dates::parse_naive(raw).ok_or_else(|| invalid("Paramètre since invalide"));
    }
    let days = days.unwrap_or(1).max(0);
    Ok(now - Duration::days(days))
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExportEntry {
    pub receipt_text_hash: Option<String>,
    pub redacted_text: Option<String>,
    pub merchant: Option<String>,
    pub invoice_hash: Option<String>,
    pub suggested_amount: Option<f64>,
    pub applied_amount: Option<f64>,
    pub suggested_category: Option<String>,
    pub applied_category: Option<String>,
    pub action: String,
    pub candidates: Option<Value>,
    pub meta: Option<Value>,
    pub created_at: String,
    pub exported_at: String,
}

type FeedbackRow = (
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<f64>,
    Option<f64>,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    String,
);

fn parse_json_column(raw: Option<String>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

/// Redacted feedback rows created at or after `since`, oldest first.
/// Merchants are dropped unless `include_merchant` is set.
pub fn export(conn: &Connection, since: NaiveDateTime, include_merchant: bool) -> Result<Vec<ExportEntry>> {
    let mut stmt = conn.prepare(
        "SELECT receipt_text_hash, redacted_text, merchant, invoice_hash, suggested_amount, applied_amount,
                suggested_category, applied_category, action, candidates, meta, created_at
         FROM ocr_feedback WHERE created_at >= ?1 ORDER BY created_at, id",
    )?;
    let rows = stmt
        .query_map([since.format(DB_FORMAT).to_string()], |r| -> rusqlite::Result<FeedbackRow> {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
                r.get(7)?,
                r.get(8)?,
                r.get(9)?,
                r.get(10)?,
                r.get::<_, Option<String>>(11)?.unwrap_or_default(),
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let exported_at = dates::now_utc_string();
    Ok(rows
        .into_iter()
        .map(|(hash, text, merchant, invoice, s_amt, a_amt, s_cat, a_cat, action, cands, meta, created)| {
            let candidates = parse_json_column(cands).map(|v| match v {
                Value::Array(items) => Value::Array(items.into_iter().take(EXPORTED_CANDIDATES).collect()),
                other => other,
            });
            ExportEntry {
                receipt_text_hash: hash,
                redacted_text: text.as_deref().map(redact),
                merchant: merchant.filter(|_| include_merchant).as_deref().map(redact),
                invoice_hash: invoice,
                suggested_amount: s_amt,
                applied_amount: a_amt,
                suggested_category: s_cat,
                applied_category: a_cat,
                action,
                candidates,
                meta: parse_json_column(meta),
                created_at: created,
                exported_at: exported_at.clone(),
            }
        })
        .collect())
}

pub fn write_jsonl<W: Write>(out: &mut W, entries: &[ExportEntry]) -> Result<()> {
    for entry in entries {
        serde_json::to_writer(&mut *out, entry)?;
        out.write_all(b"\n")?;
    }
    Ok(())
}

/// Flat CSV; candidates and meta are written as JSON text.
pub fn write_csv<W: Write>(out: W, entries: &[ExportEntry]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(out);
    wtr.write_record([
        "receipt_text_hash",
        "redacted_text",
        "merchant",
        "invoice_hash",
        "suggested_amount",
        "applied_amount",
        "suggested_category",
        "applied_category",
        "action",
        "candidates",
        "meta",
        "created_at",
        "exported_at",
    ])?;
    let opt = |v: &Option<String>| v.clone().unwrap_or_default();
    let num = |v: Option<f64>| v.map(|n| n.to_string()).unwrap_or_default();
    let json = |v: &Option<Value>| v.as_ref().map(Value::to_string).unwrap_or_default();
    for e in entries {
        wtr.write_record([
            opt(&e.receipt_text_hash),
            opt(&e.redacted_text),
            opt(&e.merchant),
            opt(&e.invoice_hash),
            num(e.suggested_amount),
            num(e.applied_amount),
            opt(&e.suggested_category),
            opt(&e.applied_category),
            e.action.clone(),
            json(&e.candidates),
            json(&e.meta),
            e.created_at.clone(),
            e.exported_at.clone(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}
