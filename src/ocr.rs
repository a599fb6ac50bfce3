//! Receipt scorer: picks the likely total amount, the receipt date and
//! time, the merchant and a category from OCR text produced client-side.
//!
//! Every signal is a fixed weighted heuristic. Scores are integers in
//! `0..=100`.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::search::normalize;

pub const AUTO_APPLY_THRESHOLD: i64 = 80;
pub const CONFIRM_THRESHOLD: i64 = 50;

mod weights {
    pub const AMOUNT_KEYWORD: f64 = 30.0;
    pub const AMOUNT_POSITION: f64 = 20.0;
    pub const AMOUNT_SIZE: f64 = 15.0;
    pub const AMOUNT_CURRENCY: f64 = 15.0;
    pub const AMOUNT_FORMAT: f64 = 10.0;
    pub const AMOUNT_UNIQUE: f64 = 10.0;
    pub const AMOUNT_MULTIPLE_PENALTY: f64 = -20.0;

    pub const DATE_KEYWORD: f64 = 25.0;
    pub const DATE_FORMAT: f64 = 20.0;
    pub const DATE_PLAUSIBLE: f64 = 20.0;
    pub const DATE_POSITION: f64 = 15.0;
    pub const DATE_UNIQUE: f64 = 20.0;

    pub const CATEGORY_KEYWORD: f64 = 35.0;
    pub const CATEGORY_HISTORY: f64 = 25.0;
    pub const CATEGORY_CLASSIFIER: f64 = 25.0;
    pub const CATEGORY_STRUCTURE: f64 = 15.0;
}

const KEYWORD_WINDOW: usize = 50;
const DEFAULT_LINE_HEIGHT: f64 = 12.0;

macro_rules! static_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).expect("valid regex"))
        }
    };
}

static_regex!(number_re, r"[+-]?\d{1,3}(?:[ ,\x{00A0}]\d{3})*(?:[.,]\d{1,2})?");
static_regex!(float_prefix_re, r"^[+-]?(?:\d+\.?\d*|\.\d+)");
static_regex!(total_keyword_re, r"total|montant|net a payer|a payer|ttc|total à payer|total payable|somme due");
static_regex!(subtotal_re, r"subtotal|sous-total|sub total");
static_regex!(currency_re, r"(?i)[€$£]|fcfa|xof");
static_regex!(two_decimals_re, r"\d+[.,]\d{2}$");
static_regex!(decimal_sep_re, r"[.,]\d{2}$");
static_regex!(time_re, r"\b([01]?\d|2[0-3])[:h.]([0-5]\d)(?:[:h.][0-5]\d)?\b");
static_regex!(iso_date_re, r"\b(\d{4})[-/](\d{1,2})[-/](\d{1,2})\b");
static_regex!(dmy4_re, r"\b(\d{1,2})[./-](\d{1,2})[./-](\d{4})\b");
static_regex!(dmy2_re, r"\b(\d{1,2})[./-](\d{1,2})[./-](\d{2})\b");
static_regex!(
    month_name_re,
    r"(?i)\b(\d{1,2})\s+(janv(?:ier)?|f[ée]vr(?:ier)?|mars|avr(?:il)?|mai|juin|juil(?:let)?|ao[uû]t|sept(?:embre)?|oct(?:obre)?|nov(?:embre)?|d[ée]c(?:embre)?)\.?\s+(\d{4})\b"
);
static_regex!(date_format_re, r"\b(\d{4})[-/](\d{1,2})[-/](\d{1,2})\b|\b(\d{1,2})[./-](\d{1,2})[./-](\d{2,4})\b");
static_regex!(date_keyword_re, r"(?i)date|facture du|payé le");
static_regex!(numeric_line_re, r"^[0-9\s,.€$£FCAXO-]{2,}$");

// ---------------------------------------------------------------------------
// Input / output
// ---------------------------------------------------------------------------

/// One OCR word with its bounding box in image pixels.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Word {
    pub text: String,
    #[serde(default)]
    pub left: f64,
    #[serde(default)]
    pub top: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub conf: f64,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ReceiptInput {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub words: Vec<Word>,
    #[serde(default)]
    pub image_height: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AmountSignals {
    pub keyword: f64,
    pub position: f64,
    pub size: f64,
    pub currency: f64,
    pub format: f64,
    pub unique: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BBox {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Candidate {
    pub raw: String,
    pub value: f64,
    pub signals: Option<AmountSignals>,
    pub score100: i64,
    pub bbox: Option<BBox>,
    pub conf: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    AutoApply,
    Confirm,
    Manual,
}

impl Decision {
    pub fn from_score(score: Option<i64>) -> Self {
        match score {
            Some(s) if s >= AUTO_APPLY_THRESHOLD => Self::AutoApply,
            Some(s) if s >= CONFIRM_THRESHOLD => Self::Confirm,
            _ => Self::Manual,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedDate {
    /// `YYYY-MM-DD`.
    pub date: Option<String>,
    /// `HH:MM`.
    pub time: Option<String>,
    pub raw: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReceiptAnalysis {
    pub text: String,
    pub merchant: String,
    pub date: Option<String>,
    pub time: Option<String>,
    #[serde(rename = "rawDate")]
    pub raw_date: Option<String>,
    #[serde(rename = "dateScore100")]
    pub date_score100: i64,
    pub candidates: Vec<Candidate>,
    pub best: Option<Candidate>,
    pub decision: Decision,
    pub category: Option<CategorySuggestion>,
}

fn clamp_score(raw: f64) -> i64 {
    raw.round().clamp(0.0, 100.0) as i64
}

// ---------------------------------------------------------------------------
// Amounts
// ---------------------------------------------------------------------------

/// Leading float of `s`, the way a lenient number parser reads it.
fn parse_float_prefix(s: &str) -> Option<f64> {
    float_prefix_re()
        .find(s)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

fn clean_number(raw: &str) -> String {
    raw.replace(['\u{00A0}', ' '], "").replace(',', ".")
}

/// Every number-looking token in the text with its value.
pub fn find_numbers(text: &str) -> Vec<(String, f64)> {
    number_re()
        .find_iter(text)
        .filter_map(|m| {
            let raw = m.as_str().to_string();
            parse_float_prefix(&clean_number(&raw)).map(|v| (raw, v))
        })
        .collect()
}

/// Text within `radius` characters around the first occurrence of `needle`.
fn window_around(haystack: &str, needle: &str, radius: usize) -> Option<String> {
    let idx = haystack.find(needle)?;
    let before = haystack[..idx].chars().count();
    let len = needle.chars().count();
    let start = before.saturating_sub(radius);
    Some(haystack.chars().skip(start).take(before - start + len + radius).collect())
}

fn keyword_near(lower_text: &str, raw: &str) -> bool {
    window_around(lower_text, &raw.to_lowercase(), KEYWORD_WINDOW).is_some_and(|w| total_keyword_re().is_match(&w))
}

/// Score for a number found in plain text when no word boxes are known.
pub fn score_text_candidate(raw: &str, value: f64, text: &str) -> f64 {
    let lower = text.to_lowercase();
    let raw_lower = raw.to_lowercase();
    let mut score = 0.0;

    // currency marks directly around the number
    let adjacent = window_around(&lower, &raw_lower, 3).unwrap_or_else(|| raw_lower.clone());
    if currency_re().is_match(&adjacent) {
        score += 30.0;
    }
    if let Some(window) = window_around(&lower, &raw_lower, KEYWORD_WINDOW) {
        if total_keyword_re().is_match(&window) {
            score += 50.0;
        }
        if subtotal_re().is_match(&window) {
            score -= 10.0;
        }
    }
    if two_decimals_re().is_match(raw) {
        score += 10.0;
    }
    score += (value.abs() + 1.0).ln() * 2.0;
    if decimal_sep_re().is_match(raw) {
        score += 5.0;
    }
    score
}

fn median_height(words: &[Word]) -> f64 {
    let mut heights: Vec<f64> = words.iter().map(|w| w.height).filter(|h| *h > 0.0).collect();
    if heights.is_empty() {
        return DEFAULT_LINE_HEIGHT;
    }
    heights.sort_by(|a, b| a.total_cmp(b));
    heights[heights.len() / 2]
}

/// Score one word box. `count` is the number of number-looking words.
pub fn score_word_candidate(
    word: &Word,
    count: usize,
    lower_text: &str,
    median: f64,
    image_height: Option<f64>,
) -> Option<Candidate> {
    let cleaned: String = clean_number(&word.text)
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-'))
        .collect();
    let value = parse_float_prefix(&cleaned)?;

    let keyword = if keyword_near(lower_text, &word.text) { 1.0 } else { 0.0 };
    let center = word.top + word.height / 2.0;
    let position = match image_height.filter(|h| *h > 0.0) {
        Some(h) => (center / h).clamp(0.0, 1.0),
        None => 0.5,
    };
    let size_ratio = if word.height > 0.0 { word.height / median.max(1.0) } else { 0.5 };
    let size = (size_ratio / 1.5).min(1.0);
    let currency = if currency_re().is_match(&word.text) { 1.0 } else { 0.0 };
    let format = if two_decimals_re().is_match(&word.text) { 1.0 } else { 0.0 };
    let unique = if count == 1 { 1.0 } else { 0.0 };

    let mut raw = keyword * weights::AMOUNT_KEYWORD
        + position * weights::AMOUNT_POSITION
        + size * weights::AMOUNT_SIZE
        + currency * weights::AMOUNT_CURRENCY
        + format * weights::AMOUNT_FORMAT
        + unique * weights::AMOUNT_UNIQUE;
    if count > 1 {
        raw += weights::AMOUNT_MULTIPLE_PENALTY;
    }

    Some(Candidate {
        raw: word.text.clone(),
        value,
        signals: Some(AmountSignals { keyword, position, size, currency, format, unique }),
        score100: clamp_score(raw),
        bbox: Some(BBox { left: word.left, top: word.top, width: word.width, height: word.height }),
        conf: Some(word.conf),
    })
}

/// Amount candidates, best first. Word boxes are used when any of them
/// holds a number, otherwise the plain text is scanned.
pub fn amount_candidates(input: &ReceiptInput) -> Vec<Candidate> {
    let lower = input.text.to_lowercase();
    let numeric: Vec<&Word> = input.words.iter().filter(|w| number_re().is_match(&w.text)).collect();
    let median = median_height(&input.words);

    let mut candidates: Vec<Candidate> = numeric
        .iter()
        .filter_map(|w| score_word_candidate(w, numeric.len(), &lower, median, input.image_height))
        .collect();

    if candidates.is_empty() {
        candidates = find_numbers(&input.text)
            .into_iter()
            .map(|(raw, value)| Candidate {
                score100: clamp_score(score_text_candidate(&raw, value, &input.text)),
                raw,
                value,
                signals: None,
                bbox: None,
                conf: None,
            })
            .collect();
    }
    candidates.sort_by(|a, b| b.score100.cmp(&a.score100));
    candidates
}

// ---------------------------------------------------------------------------
// Date, time, merchant
// ---------------------------------------------------------------------------

fn month_number(name: &str) -> u32 {
    let n = normalize(name);
    match n.get(..3).unwrap_or(n.as_str()) {
        "jan" => 1,
        "fev" => 2,
        "mar" => 3,
        "avr" => 4,
        "mai" => 5,
        "jui" if n.starts_with("juil") => 7,
        "jui" => 6,
        "aou" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => 1,
    }
}

/// `YYYY-MM-DD` when the parts form a real calendar date.
fn valid_date(y: &str, m: &str, d: &str) -> Option<String> {
    let date = NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, d.parse().ok()?)?;
    Some(date.format("%Y-%m-%d").to_string())
}

#[derive(Debug, Clone, PartialEq)]
struct DateMatch {
    start: usize,
    date: String,
    raw: String,
}

/// Every valid date in the text: ISO first, then DD/MM/YYYY, DD/MM/YY and
/// French month names, each in text order.
fn date_matches(text: &str) -> Vec<DateMatch> {
    let mut out = Vec::new();
    let mut keep = |m: Option<regex::Match>, date: Option<String>| {
        if let (Some(m), Some(date)) = (m, date) {
            out.push(DateMatch { start: m.start(), date, raw: m.as_str().to_string() });
        }
    };
    for c in iso_date_re().captures_iter(text) {
        keep(c.get(0), valid_date(&c[1], &c[2], &c[3]));
    }
    for c in dmy4_re().captures_iter(text) {
        keep(c.get(0), valid_date(&c[3], &c[2], &c[1]));
    }
    for c in dmy2_re().captures_iter(text) {
        let yy: u32 = c[3].parse().unwrap_or(0);
        let century = if yy > 70 { "19" } else { "20" };
        keep(c.get(0), valid_date(&format!("{century}{}", &c[3]), &c[2], &c[1]));
    }
    for c in month_name_re().captures_iter(text) {
        keep(c.get(0), valid_date(&c[3], &month_number(&c[2]).to_string(), &c[1]));
    }
    out
}

/// First valid date and first time found in the text.
pub fn parse_date_time(text: &str) -> ParsedDate {
    let time = time_re()
        .captures(text)
        .map(|c| format!("{:0>2}:{:0>2}", &c[1], &c[2]));

    match date_matches(text).into_iter().next() {
        Some(m) => ParsedDate { date: Some(m.date), time, raw: Some(m.raw) },
        None => ParsedDate { date: None, time, raw: None },
    }
}

pub fn date_score(text: &str, parsed: &ParsedDate, today: NaiveDate) -> i64 {
    let Some(date) = &parsed.date else {
        return 0;
    };
    let keyword = if date_keyword_re().is_match(text) { 1.0 } else { 0.0 };
    let format = match &parsed.raw {
        Some(raw) if date_format_re().is_match(raw) => 1.0,
        _ => 0.0,
    };
    let plausible = match NaiveDate::parse_from_str(date, "%Y-%m-%d") {
        Ok(d) if d <= today => 1.0,
        _ => 0.0,
    };
    // receipts print their date near the top
    let position = match parsed.raw.as_deref().and_then(|raw| text.find(raw)) {
        Some(offset) if !text.is_empty() => 1.0 - offset as f64 / text.len() as f64,
        _ => 0.0,
    };
    let mut distinct: Vec<String> = date_matches(text).into_iter().map(|m| m.date).collect();
    distinct.sort();
    distinct.dedup();
    let unique = 1.0 / distinct.len().max(1) as f64;
    clamp_score(
        keyword * weights::DATE_KEYWORD
            + format * weights::DATE_FORMAT
            + plausible * weights::DATE_PLAUSIBLE
            + position * weights::DATE_POSITION
            + unique * weights::DATE_UNIQUE,
    )
}

/// First of the first six non-empty lines that is longer than two
/// characters and not just digits and currency marks.
pub fn guess_merchant(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(6)
        .find(|l| !numeric_line_re().is_match(l) && l.chars().count() > 2)
        .unwrap_or("")
        .to_string()
}

// ---------------------------------------------------------------------------
// Category suggestion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryRef {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubcategoryRef {
    pub id: i64,
    pub category_id: i64,
    pub name: String,
}

/// A past transaction: its note (or merchant) and category name.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub label: String,
    pub category: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CategorySignals {
    pub keyword: f64,
    pub history: f64,
    pub classifier: f64,
    pub structure: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CategoryCandidate {
    pub id_category: i64,
    pub name: String,
    pub signals: CategorySignals,
    pub score100: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SubcategoryCandidate {
    pub id_subcategory: i64,
    pub name: String,
    pub signals: HashMap<&'static str, f64>,
    pub score100: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CategorySuggestion {
    pub category_candidates: Vec<CategoryCandidate>,
    pub best_category: Option<CategoryCandidate>,
    pub sub_candidates: Vec<SubcategoryCandidate>,
    pub best_subcategory: Option<SubcategoryCandidate>,
}

fn tokens(s: &str) -> Vec<&str> {
    s.split_whitespace().collect()
}

fn mentions(text_norm: &str, merchant_norm: &str, name_norm: &str) -> bool {
    !name_norm.is_empty() && (text_norm.contains(name_norm) || merchant_norm.contains(name_norm))
}

pub fn suggest_category(
    text: &str,
    merchant: &str,
    categories: &[CategoryRef],
    subcategories: &[SubcategoryRef],
    history: &[HistoryEntry],
) -> CategorySuggestion {
    let text_norm = normalize(text);
    let merchant_norm = normalize(if merchant.is_empty() { text } else { merchant });
    let merchant_tokens = tokens(&merchant_norm);

    // how often each category was used for this merchant before
    let mut freq: HashMap<i64, usize> = HashMap::new();
    let mut matched = 0usize;
    for entry in history {
        let label = normalize(&entry.label);
        if merchant_norm.is_empty() || label.is_empty() {
            continue;
        }
        if !(label.contains(&merchant_norm) || merchant_norm.contains(&label)) {
            continue;
        }
        matched += 1;
        let cat = normalize(entry.category.trim());
        if cat.is_empty() {
            continue;
        }
        if let Some(c) = categories.iter().find(|c| {
            let n = normalize(&c.name);
            !n.is_empty() && (n == cat || n.contains(&cat) || cat.contains(&n))
        }) {
            *freq.entry(c.id).or_default() += 1;
        }
    }
    let total: usize = freq.values().sum();
    let total = if total > 0 { total } else { matched.max(1) };

    let mut candidates: Vec<CategoryCandidate> = categories
        .iter()
        .map(|c| {
            let name_norm = normalize(&c.name);
            let keyword = if mentions(&text_norm, &merchant_norm, &name_norm) { 1.0 } else { 0.0 };
            let hits = freq.get(&c.id).copied().unwrap_or(0);
            let history = if hits > 0 { (hits as f64 / total as f64).min(1.0) } else { 0.0 };
            let name_tokens = tokens(&name_norm);
            let overlap = merchant_tokens.iter().filter(|t| name_tokens.contains(t)).count();
            let classifier = if name_tokens.is_empty() {
                0.0
            } else {
                (overlap as f64 / name_tokens.len() as f64).min(1.0)
            };
            let structure = if subcategories
                .iter()
                .filter(|s| s.category_id == c.id)
                .any(|s| mentions(&text_norm, &merchant_norm, &normalize(&s.name)))
            {
                1.0
            } else {
                0.0
            };
            let raw = keyword * weights::CATEGORY_KEYWORD
                + history * weights::CATEGORY_HISTORY
                + classifier * weights::CATEGORY_CLASSIFIER
                + structure * weights::CATEGORY_STRUCTURE;
            CategoryCandidate {
                id_category: c.id,
                name: c.name.clone(),
                signals: CategorySignals { keyword, history, classifier, structure },
                score100: clamp_score(raw),
            }
        })
        .collect();
    candidates.sort_by(|a, b| b.score100.cmp(&a.score100));

    let best_category = candidates.first().cloned();
    let mut sub_candidates: Vec<SubcategoryCandidate> = match &best_category {
        Some(top) => subcategories
            .iter()
            .filter(|s| s.category_id == top.id_category)
            .map(|s| {
                let name_norm = normalize(&s.name);
                let keyword = if mentions(&text_norm, &merchant_norm, &name_norm) { 1.0 } else { 0.0 };
                let name_tokens = tokens(&name_norm);
                let classifier = if merchant_tokens.iter().any(|t| name_tokens.contains(t)) { 1.0 } else { 0.0 };
                SubcategoryCandidate {
                    id_subcategory: s.id,
                    name: s.name.clone(),
                    signals: HashMap::from([("keyword", keyword), ("classifier", classifier)]),
                    score100: clamp_score((keyword * 0.7 + classifier * 0.3) * 100.0),
                }
            })
            .collect(),
        None => Vec::new(),
    };
    sub_candidates.sort_by(|a, b| b.score100.cmp(&a.score100));

    CategorySuggestion {
        best_subcategory: sub_candidates.first().cloned(),
        category_candidates: candidates,
        best_category,
        sub_candidates,
    }
}

/// Categories, subcategories and the user's recent transaction labels.
pub fn load_category_context(
    conn: &Connection,
    user_id: i64,
) -> Result<(Vec<CategoryRef>, Vec<SubcategoryRef>, Vec<HistoryEntry>)> {
    let mut stmt = conn.prepare("SELECT id, name FROM categories ORDER BY name")?;
    let categories = stmt
        .query_map([], |r| Ok(CategoryRef { id: r.get(0)?, name: r.get(1)? }))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare("SELECT id, category_id, name FROM subcategories ORDER BY name")?;
    let subcategories = stmt
        .query_map([], |r| {
            Ok(SubcategoryRef { id: r.get(0)?, category_id: r.get(1)?, name: r.get(2)? })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT COALESCE(t.notes, ''), COALESCE(c.name, '') FROM transactions t
         LEFT JOIN categories c ON c.id = t.category_id
         WHERE t.user_id = ?1 ORDER BY t.date DESC LIMIT 500",
    )?;
    let history = stmt
        .query_map([user_id], |r| Ok(HistoryEntry { label: r.get(0)?, category: r.get(1)? }))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok((categories, subcategories, history))
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

pub fn analyze_receipt(input: &ReceiptInput, today: NaiveDate) -> ReceiptAnalysis {
    let text = input.text.trim().to_string();
    let input = ReceiptInput { text: text.clone(), ..input.clone() };
    let candidates = amount_candidates(&input);
    let best = candidates.first().cloned();
    let parsed = parse_date_time(&text);
    ReceiptAnalysis {
        merchant: guess_merchant(&text),
        date_score100: date_score(&text, &parsed, today),
        date: parsed.date,
        time: parsed.time,
        raw_date: parsed.raw,
        decision: Decision::from_score(best.as_ref().map(|b| b.score100)),
        candidates,
        best,
        category: None,
        text,
    }
}

/// Full analysis including a category suggestion drawn from the user's data.
pub fn analyze_for_user(conn: &Connection, user_id: i64, input: &ReceiptInput, today: NaiveDate) -> Result<ReceiptAnalysis> {
    let mut analysis = analyze_receipt(input, today);
    let (categories, subcategories, history) = load_category_context(conn, user_id)?;
    analysis.category = Some(suggest_category(
        &analysis.text,
        &analysis.merchant,
        &categories,
        &subcategories,
        &history,
    ));
    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECEIPT: &str = "CARREFOUR MARKET\n12 rue de la Paix\n75002 PARIS\nDate: 14/03/2024 17h29\n\
        Pain 1,20\nLait 0,95\nSous-total 2,15\nTOTAL TTC 12,50 €\nCB 12,50\n";

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    fn word(text: &str, top: f64, height: f64) -> Word {
        Word { text: text.into(), left: 10.0, top, width: 40.0, height, conf: 90.0 }
    }

    #[test]
    fn test_find_numbers() {
        let nums = find_numbers("Total 1 234,56 et 7.5 puis -3");
        let values: Vec<f64> = nums.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![1234.56, 7.5, -3.0]);
        assert_eq!(nums[0].0, "1 234,56");
    }

    #[test]
    fn test_parse_float_prefix_is_lenient() {
        assert_eq!(parse_float_prefix("1.234.56"), Some(1.234));
        assert_eq!(parse_float_prefix("12.50"), Some(12.5));
        assert_eq!(parse_float_prefix("abc"), None);
    }

    #[test]
    fn test_text_scoring_prefers_total_line() {
        let input = ReceiptInput { text: RECEIPT.into(), ..ReceiptInput::default() };
        let candidates = amount_candidates(&input);
        let best = &candidates[0];
        assert_eq!(best.value, 12.5);
        assert!(best.signals.is_none());
        // keyword 50, sous-total -10, currency 30, two decimals 10, decimal 5, ln(13.5)*2
        assert_eq!(best.score100, 90);
        assert!(candidates.iter().all(|c| c.score100 <= 100));
    }

    #[test]
    fn test_subtotal_penalty() {
        let with = score_text_candidate("2,15", 2.15, "sous-total 2,15");
        let without = score_text_candidate("2,15", 2.15, "total 2,15");
        assert!((without - with - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_word_scoring_signals() {
        let lower = "total 42,00 €".to_string();
        let w = word("42,00€", 900.0, 30.0);
        let c = score_word_candidate(&w, 1, &lower, 20.0, Some(1000.0)).unwrap();
        let s = c.signals.unwrap();
        assert_eq!(c.value, 42.0);
        assert_eq!(s.keyword, 0.0);
        assert_eq!(s.currency, 1.0);
        assert_eq!(s.format, 0.0);
        assert_eq!(s.unique, 1.0);
        assert_eq!(s.size, 1.0);
        assert!((s.position - 0.915).abs() < 1e-9);
        // 18.3 + 15 + 15 + 10
        assert_eq!(c.score100, 58);
    }

    #[test]
    fn test_word_path_multiple_penalty_and_keyword() {
        let input = ReceiptInput {
            text: "Pain 1,20\nTOTAL 12,50".into(),
            words: vec![word("Pain", 100.0, 12.0), word("1,20", 100.0, 12.0), word("TOTAL", 800.0, 12.0), word("12,50", 800.0, 18.0)],
            image_height: Some(1000.0),
        };
        let candidates = amount_candidates(&input);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].value, 12.5);
        let s = candidates[0].signals.as_ref().unwrap();
        assert_eq!(s.keyword, 1.0);
        assert_eq!(s.unique, 0.0);
        // keyword 30 + position 16.18 + size 15 (capped) + format 10 - 20
        assert_eq!(candidates[0].score100, 51);
        assert_eq!(Decision::from_score(Some(candidates[0].score100)), Decision::Confirm);
    }

    #[test]
    fn test_decision_thresholds() {
        assert_eq!(Decision::from_score(Some(80)), Decision::AutoApply);
        assert_eq!(Decision::from_score(Some(50)), Decision::Confirm);
        assert_eq!(Decision::from_score(Some(49)), Decision::Manual);
        assert_eq!(Decision::from_score(None), Decision::Manual);
    }

    #[test]
    fn test_parse_dates() {
        let p = parse_date_time("Le 2024-3-7 à 09:05");
        assert_eq!(p.date.as_deref(), Some("2024-03-07"));
        assert_eq!(p.time.as_deref(), Some("09:05"));
        assert_eq!(p.raw.as_deref(), Some("2024-3-7"));

        assert_eq!(parse_date_time("14/03/2024").date.as_deref(), Some("2024-03-14"));
        assert_eq!(parse_date_time("14-03-99").date.as_deref(), Some("1999-03-14"));
        assert_eq!(parse_date_time("14.03.24").date.as_deref(), Some("2024-03-14"));
        assert_eq!(parse_date_time("le 5 août 2023").date.as_deref(), Some("2023-08-05"));
        assert_eq!(parse_date_time("11 Juil. 2025").date.as_deref(), Some("2025-07-11"));
        assert_eq!(parse_date_time("2 juin 2025").date.as_deref(), Some("2025-06-02"));
        assert_eq!(parse_date_time("rien").date, None);
        assert_eq!(parse_date_time("payé 17h29").time.as_deref(), Some("17:29"));
    }

    #[test]
    fn test_date_score() {
        let p = parse_date_time(RECEIPT);
        assert_eq!(p.date.as_deref(), Some("2024-03-14"));
        // keyword 25 + format 20 + plausible 20 + position 15 * (1 - 53/135) + unique 20
        assert_eq!(date_score(RECEIPT, &p, today()), 94);
        let future = parse_date_time("14/03/2030");
        assert_eq!(date_score("14/03/2030", &future, today()), 55);
        assert_eq!(date_score("", &ParsedDate::default(), today()), 0);
    }

    #[test]
    fn test_invalid_calendar_dates_skipped() {
        assert_eq!(parse_date_time("2024-13-45").date, None);
        assert_eq!(parse_date_time("le 32 mai 2024").date, None);
        let p = parse_date_time("31/02/2024 puis 28/02/2024");
        assert_eq!(p.date.as_deref(), Some("2024-02-28"));
        assert_eq!(p.raw.as_deref(), Some("28/02/2024"));
    }

    #[test]
    fn test_date_score_prefers_top_of_receipt() {
        let filler = "Pain 1,20\nLait 0,95\nBeurre 2,40\nTOTAL 4,55\n";
        let top = format!("01/03/2024\n{filler}");
        let bottom = format!("{filler}01/03/2024\n");
        let top_score = date_score(&top, &parse_date_time(&top), today());
        let bottom_score = date_score(&bottom, &parse_date_time(&bottom), today());
        assert!(top_score > bottom_score, "{top_score} vs {bottom_score}");
    }

    #[test]
    fn test_date_score_penalizes_conflicting_dates() {
        let same = "01/03/2024\nrendu 01/03/2024";
        let mixed = "01/03/2024\nrendu 02/03/2024";
        let same_score = date_score(same, &parse_date_time(same), today());
        let mixed_score = date_score(mixed, &parse_date_time(mixed), today());
        assert_eq!(same_score - mixed_score, 10);
    }

    #[test]
    fn test_guess_merchant() {
        assert_eq!(guess_merchant(RECEIPT), "CARREFOUR MARKET");
        assert_eq!(guess_merchant("12,50 €\n\nAB\nBoulangerie Paul"), "Boulangerie Paul");
        assert_eq!(guess_merchant("1\n2\n3"), "");
    }

    fn catalog() -> (Vec<CategoryRef>, Vec<SubcategoryRef>) {
        (
            vec![
                CategoryRef { id: 1, name: "Alimentation".into() },
                CategoryRef { id: 2, name: "Transport".into() },
            ],
            vec![
                SubcategoryRef { id: 10, category_id: 1, name: "Courses".into() },
                SubcategoryRef { id: 11, category_id: 1, name: "Restaurant".into() },
                SubcategoryRef { id: 20, category_id: 2, name: "Essence".into() },
            ],
        )
    }

    #[test]
    fn test_category_from_history() {
        let (cats, subs) = catalog();
        let history = vec![
            HistoryEntry { label: "Carrefour Market".into(), category: "Alimentation".into() },
            HistoryEntry { label: "carrefour market".into(), category: "Alimentation".into() },
            HistoryEntry { label: "Total station".into(), category: "Transport".into() },
        ];
        let s = suggest_category("ticket", "Carrefour Market", &cats, &subs, &history);
        let best = s.best_category.unwrap();
        assert_eq!(best.id_category, 1);
        assert_eq!(best.signals.history, 1.0);
        assert_eq!(best.score100, 25);
        assert_eq!(s.sub_candidates.len(), 2);
    }

    #[test]
    fn test_category_keyword_and_subcategory() {
        let (cats, subs) = catalog();
        let s = suggest_category("Station essence\nGazole 40,00", "Station", &cats, &subs, &[]);
        let best = s.best_category.unwrap();
        assert_eq!(best.id_category, 2);
        assert_eq!(best.signals.structure, 1.0);
        assert_eq!(best.score100, 15);
        let sub = s.best_subcategory.unwrap();
        assert_eq!(sub.id_subcategory, 20);
        assert_eq!(sub.score100, 70);
    }

    #[test]
    fn test_analyze_receipt_end_to_end() {
        let input = ReceiptInput { text: format!("  {RECEIPT}  "), ..ReceiptInput::default() };
        let a = analyze_receipt(&input, today());
        assert_eq!(a.merchant, "CARREFOUR MARKET");
        assert_eq!(a.date.as_deref(), Some("2024-03-14"));
        assert_eq!(a.time.as_deref(), Some("17:29"));
        assert_eq!(a.best.as_ref().map(|b| b.value), Some(12.5));
        assert_eq!(a.decision, Decision::AutoApply);
        assert!(!a.text.starts_with(' '));
        let json = serde_json::to_value(&a).unwrap();
        assert!(json.get("dateScore100").is_some());
        assert_eq!(json["decision"], "auto_apply");
    }

    #[test]
    fn test_analyze_for_user_uses_seeded_categories() {
        let (_dir, conn) = crate::db::test_db();
        let uid = crate::db::test_user(&conn, "a@b.fr");
        let input = ReceiptInput { text: "Boulangerie\nRestaurant du coin\nTotal 18,00".into(), ..ReceiptInput::default() };
        let a = analyze_for_user(&conn, uid, &input, today()).unwrap();
        let cat = a.category.unwrap();
        assert_eq!(cat.best_category.unwrap().name, "Alimentation");
        assert_eq!(cat.best_subcategory.unwrap().name, "Restaurant");
    }
}
