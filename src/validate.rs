//! Field validators for JSON payloads.
//!
//! Each validator takes the raw `serde_json::Value` of a field (or `None`
//! when the key is absent) and returns the typed value or a `Validation`
//! error whose message is shown to the user as-is.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use serde_json::Value;

use crate::error::{invalid, Result};

pub const ALLOWED_CURRENCIES: &[&str] = &["EUR", "XOF"];

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        _ => false,
    }
}

pub fn float(value: Option<&Value>, field: &str, allow_null: bool) -> Result<Option<f64>> {
    if is_blank(value) {
        if allow_null {
            return Ok(None);
        }
        return Err(invalid(format!("Le champ {field} est requis")));
    }
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().replace(' ', "").replace(',', ".").parse::<f64>().ok(),
        Some(Value::Bool(_)) | Some(Value::Array(_)) | Some(Value::Object(_)) => None,
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(invalid(format!("Le champ {field} doit être un nombre"))),
    }
}

pub fn required_float(value: Option<&Value>, field: &str) -> Result<f64> {
    float(value, field, false)?.ok_or_else(|| invalid(format!("Le champ {field} est requis")))
}

pub fn int(value: Option<&Value>, field: &str, allow_null: bool) -> Result<Option<i64>> {
    if is_blank(value) {
        if allow_null {
            return Ok(None);
        }
        return Err(invalid(format!("Le champ {field} est requis")));
    }
    let parsed = match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed
        .map(Some)
        .ok_or_else(|| invalid(format!("Le champ {field} doit être un entier")))
}

pub fn required_int(value: Option<&Value>, field: &str) -> Result<i64> {
    int(value, field, false)?.ok_or_else(|| invalid(format!("Le champ {field} est requis")))
}

/// Escape the characters that matter inside HTML text and attributes.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            _ => out.push(c),
        }
    }
    out
}

/// Trimmed string with a length bound counted in characters. The returned
/// value is HTML-escaped.
pub fn string(
    value: Option<&Value>,
    field: &str,
    min: usize,
    max: usize,
    allow_null: bool,
) -> Result<Option<String>> {
    let raw = match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(_) => return Err(invalid(format!("Le champ {field} doit être une chaîne"))),
    };
    let s = match raw {
        Some(s) if !s.is_empty() => s,
        _ if allow_null => return Ok(None),
        _ => return Err(invalid(format!("Le champ {field} est requis"))),
    };
    let len = s.chars().count();
    if len < min {
        return Err(invalid(format!("Le champ {field} doit contenir au moins {min} caractères")));
    }
    if len > max {
        return Err(invalid(format!("Le champ {field} ne doit pas dépasser {max} caractères")));
    }
    Ok(Some(escape_html(&s)))
}

/// Like [`string`] but without HTML escaping, for values used as lookup keys.
pub fn plain_string(value: Option<&Value>, field: &str, max: usize) -> Result<Option<String>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            if s.chars().count() > max {
                return Err(invalid(format!("Le champ {field} ne doit pas dépasser {max} caractères")));
            }
            Ok(Some(s.to_string()))
        }
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(invalid(format!("Le champ {field} doit être une chaîne"))),
    }
}

fn date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{4})-(\d{2})-(\d{2})(?:[ T]\d{2}:\d{2}(?::\d{2})?)?$").expect("valid regex")
    })
}

pub fn date(value: Option<&Value>, field: &str, allow_null: bool) -> Result<Option<String>> {
    let s = match value {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        None | Some(Value::Null) | Some(Value::String(_)) => {
            if allow_null {
                return Ok(None);
            }
            return Err(invalid(format!("Le champ {field} est requis")));
        }
        Some(_) => return Err(invalid(format!("Le champ {field} doit être une date"))),
    };
    let caps = date_re()
        .captures(&s)
        .ok_or_else(|| invalid(format!("Le champ {field} doit être une date valide (AAAA-MM-JJ)")))?;
    let y: i32 = caps[1].parse().unwrap_or(0);
    let m: u32 = caps[2].parse().unwrap_or(0);
    let d: u32 = caps[3].parse().unwrap_or(0);
    if NaiveDate::from_ymd_opt(y, m, d).is_none() {
        return Err(invalid(format!("Le champ {field} contient une date inexistante")));
    }
    Ok(Some(s))
}

pub fn currency(value: Option<&Value>) -> Result<String> {
    let code = match value {
        Some(Value::String(s)) => s.trim().to_uppercase(),
        None | Some(Value::Null) => String::new(),
        Some(_) => return Err(invalid("Devise invalide")),
    };
    if code.is_empty() {
        return Ok("EUR".to_string());
    }
    if !ALLOWED_CURRENCIES.contains(&code.as_str()) {
        return Err(invalid(format!("Devise non supportée: {code}")));
    }
    Ok(code)
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(?:\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}$")
            .expect("valid regex")
    })
}

pub fn email(value: &str) -> Result<String> {
    let e = value.trim().to_lowercase();
    if e.len() > 255 || !email_re().is_match(&e) {
        return Err(invalid("Email invalide"));
    }
    Ok(e)
}

/// Truthy values accepted from forms and JSON: `true`, `1`, `"1"`, `"true"`, `"on"`.
pub fn boolean(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "1" | "true" | "on" | "yes"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_float_accepts_comma_and_numbers() {
        assert_eq!(float(Some(&json!("12,5")), "Montant", false).unwrap(), Some(12.5));
        assert_eq!(float(Some(&json!(3)), "Montant", false).unwrap(), Some(3.0));
        assert_eq!(float(Some(&json!(" 1 200,50 ")), "Montant", false).unwrap(), Some(1200.5));
    }

    #[test]
    fn test_float_rejects_garbage_and_missing() {
        assert!(float(Some(&json!("abc")), "Montant", false).is_err());
        assert!(float(None, "Montant", false).is_err());
        assert_eq!(float(Some(&json!("")), "Montant", true).unwrap(), None);
    }

    #[test]
    fn test_int_parsing() {
        assert_eq!(int(Some(&json!("42")), "id", false).unwrap(), Some(42));
        assert_eq!(int(Some(&json!(7.0)), "id", false).unwrap(), Some(7));
        assert!(int(Some(&json!(7.5)), "id", false).is_err());
        assert_eq!(int(None, "id", true).unwrap(), None);
    }

    #[test]
    fn test_string_trims_escapes_and_bounds() {
        let s = string(Some(&json!("  <b>Café</b> ")), "Notes", 0, 100, false).unwrap();
        assert_eq!(s.as_deref(), Some("&lt;b&gt;Café&lt;/b&gt;"));
        assert!(string(Some(&json!("ééé")), "nom", 0, 2, false).is_err());
        assert!(string(Some(&json!("ééé")), "nom", 0, 3, false).is_ok());
        assert!(string(Some(&json!("   ")), "nom", 1, 3, false).is_err());
    }

    #[test]
    fn test_date_validation() {
        assert!(date(Some(&json!("2024-02-29")), "Date", false).is_ok());
        assert!(date(Some(&json!("2024-02-29 10:30")), "Date", false).is_ok());
        assert!(date(Some(&json!("2024-03-01T08:00:00")), "Date", false).is_ok());
        assert!(date(Some(&json!("2023-02-29")), "Date", false).is_err());
        assert!(date(Some(&json!("01/02/2024")), "Date", false).is_err());
        assert_eq!(date(None, "Date", true).unwrap(), None);
    }

    #[test]
    fn test_currency_defaults_and_allowlist() {
        assert_eq!(currency(None).unwrap(), "EUR");
        assert_eq!(currency(Some(&json!("xof"))).unwrap(), "XOF");
        assert!(currency(Some(&json!("USD"))).is_err());
    }

    #[test]
    fn test_email() {
        assert_eq!(email(" Alice@Example.com ").unwrap(), "alice@example.com");
        assert!(email("not-an-email").is_err());
        assert!(email("a@b").is_err());
    }

    #[test]
    fn test_boolean() {
        assert!(boolean(Some(&json!(true))));
        assert!(boolean(Some(&json!("1"))));
        assert!(boolean(Some(&json!(1))));
        assert!(!boolean(Some(&json!("0"))));
        assert!(!boolean(None));
    }
}
