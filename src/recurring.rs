//! Recurring plans and the materializer that turns due occurrences into
//! transactions.

use std::fmt;

use chrono::{Duration, NaiveDateTime, NaiveTime};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::categories::{category_id_by_name, subcategory_id_by_name};
use crate::currency;
use crate::dates::{self, DB_FORMAT};
use crate::error::{invalid, Result, TirelireError};
use crate::goals;
use crate::models::TYPE_EPARGNE;
use crate::transactions::{self, NewTransaction, MAX_NOTES_LEN};
use crate::types::resolve_type;
use crate::validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Frequency {
    /// Unknown values fall back to monthly.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "daily" => Self::Daily,
            "weekly" => Self::Weekly,
            "yearly" => Self::Yearly,
            _ => Self::Monthly,
        }
    }

    /// Next occurrence after `from`, `None` past the end of the calendar.
    pub fn advance(self, from: NaiveDateTime, interval: i64) -> Option<NaiveDateTime> {
        let n = interval.max(1);
        let months = |m: i64| dates::checked_add_months(from.date(), m).map(|d| d.and_time(from.time()));
        match self {
            Self::Daily => Duration::try_days(n).and_then(|d| from.checked_add_signed(d)),
            Self::Weekly => n
                .checked_mul(7)
                .and_then(Duration::try_days)
                .and_then(|d| from.checked_add_signed(d)),
            Self::Monthly => months(n),
            Self::Yearly => n.checked_mul(12).and_then(months),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecurringPlan {
    pub id: i64,
    pub amount: f64,
    #[serde(rename = "type")]
    pub type_code: String,
    pub category: Option<String>,
    pub subcategory_id: Option<i64>,
    pub currency: String,
    pub scheduled_at: Option<String>,
    pub frequency: Frequency,
    pub interval_count: i64,
    pub end_date: Option<String>,
    pub last_run_date: Option<String>,
    pub active: bool,
    pub notes: Option<String>,
}

const PLAN_SELECT: &str = "SELECT id, amount, type_code, category, subcategory_id, currency, scheduled_at,
        frequency, interval_count, end_date, last_run_date, active, notes
     FROM recurring_plans";

fn row_to_plan(row: &rusqlite::Row) -> rusqlite::Result<RecurringPlan> {
    let frequency: String = row.get(7)?;
    Ok(RecurringPlan {
        id: row.get(0)?,
        amount: row.get(1)?,
        type_code: row.get(2)?,
        category: row.get(3)?,
        subcategory_id: row.get(4)?,
        currency: row.get(5)?,
        scheduled_at: row.get(6)?,
        frequency: Frequency::parse_lenient(&frequency),
        interval_count: row.get(8)?,
        end_date: row.get(9)?,
        last_run_date: row.get(10)?,
        active: row.get(11)?,
        notes: row.get(12)?,
    })
}

/// Largest accepted `interval`; keeps every schedule inside the calendar.
pub const MAX_INTERVAL: i64 = 1000;

/// Missing or below 1 means every period; above [`MAX_INTERVAL`] is rejected.
fn checked_interval(interval: Option<i64>) -> Result<Option<i64>> {
    match interval {
        Some(i) if i > MAX_INTERVAL => Err(invalid(format!("Intervalle invalide (1 à {MAX_INTERVAL})"))),
        other => Ok(other.map(|i| i.max(1))),
    }
}

pub fn default_notes(plan_id: i64) -> String {
    format!("Plan récurrent (id: {plan_id})")
}

/// Client payload for a new plan.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurringInput {
    pub date: Option<String>,
    pub type_code: String,
    pub amount: f64,
    pub category: Option<String>,
    pub subcategory_id: Option<i64>,
    pub subcategory_name: Option<String>,
    pub notes: Option<String>,
    pub currency: String,
    pub frequency: Frequency,
    pub interval: i64,
    pub end_date: Option<String>,
    pub skip_initial: bool,
}

impl RecurringInput {
    pub fn from_json(data: &Value) -> Result<Self> {
        if !data.is_object() {
            return Err(invalid("Aucun payload."));
        }
        let type_code = validate::plain_string(data.get("Type"), "Type", 50)?
            .ok_or_else(|| invalid("Le champ Type est requis"))?;
        let amount = validate::required_float(data.get("Montant"), "Montant")?;
        let (subcategory_id, subcategory_name) = match data.get("Sous-catégorie").or(data.get("subcategory_id")) {
            Some(Value::Number(n)) => (n.as_i64(), None),
            Some(Value::String(s)) if s.trim().parse::<i64>().is_ok() => (s.trim().parse().ok(), None),
            Some(Value::String(s)) if !s.trim().is_empty() => (None, Some(s.trim().to_string())),
            _ => (None, None),
        };
        // `skip_initial` wins over the legacy inverse flag
        let skip_initial = match (data.get("skip_initial"), data.get("create_initial_immediately")) {
            (Some(v), _) if !v.is_null() => validate::boolean(Some(v)),
            (_, Some(v)) if !v.is_null() => !validate::boolean(Some(v)),
            _ => false,
        };
        Ok(Self {
            date: validate::date(data.get("Date"), "Date", true)?,
            type_code,
            amount,
            category: validate::plain_string(data.get("Catégorie"), "Catégorie", 255)?,
            subcategory_id,
            subcategory_name,
            notes: validate::string(data.get("Notes"), "Notes", 0, MAX_NOTES_LEN, true)?,
            currency: validate::currency(data.get("currency"))?,
            frequency: data
                .get("frequency")
                .and_then(Value::as_str)
                .map_or(Frequency::Monthly, Frequency::parse_lenient),
            interval: checked_interval(validate::int(data.get("interval"), "interval", true)?)?.unwrap_or(1),
            end_date: validate::date(data.get("end_date"), "end_date", true)?,
            skip_initial,
        })
    }
}

/// Create a plan and, unless `skip_initial`, its first occurrence (at the
/// given date or now). Returns the plan id.
pub fn add_recurring(conn: &mut Connection, user_id: i64, input: &RecurringInput, now: NaiveDateTime) -> Result<i64> {
    let ty = resolve_type(conn, None, Some(&input.type_code))?;
    let subcategory_id = match (&input.subcategory_id, &input.subcategory_name) {
        (Some(id), _) => Some(*id).filter(|id| *id > 0),
        (None, Some(name)) => subcategory_id_by_name(conn, None, name)?,
        (None, None) => None,
    };
    let scheduled_at = input.date.as_deref().map(dates::normalize_client_datetime);

    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO recurring_plans
            (user_id, amount, type_code, category, subcategory_id, currency, scheduled_at,
             frequency, interval_count, end_date, notes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            user_id,
            input.amount.abs(),
            ty.code,
            input.category,
            subcategory_id,
            input.currency,
            scheduled_at,
            input.frequency.to_string(),
            input.interval,
            input.end_date,
            input.notes,
        ],
    )?;
    let plan_id = tx.last_insert_rowid();
    if !input.skip_initial {
        let plan = tx.query_row(&format!("{PLAN_SELECT} WHERE id = ?1"), [plan_id], row_to_plan)?;
        let date = scheduled_at.unwrap_or_else(|| now.format(DB_FORMAT).to_string());
        insert_occurrence(&tx, user_id, &plan, &date)?;
    }
    tx.commit()?;
    info!(plan_id, user_id, "recurring plan created");
    if !input.skip_initial && ty.id == TYPE_EPARGNE {
        if let Some(sub) = subcategory_id {
            goals::sweep_after_write(conn, user_id, sub);
        }
    }
    Ok(plan_id)
}

pub fn list_recurring(conn: &Connection, user_id: i64) -> Result<Vec<RecurringPlan>> {
    let mut stmt = conn.prepare(&format!("{PLAN_SELECT} WHERE user_id = ?1 ORDER BY id DESC"))?;
    let rows = stmt
        .query_map([user_id], row_to_plan)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn owned_plan(conn: &Connection, user_id: i64, plan_id: i64) -> Result<RecurringPlan> {
    let owner: Option<i64> = conn
        .query_row("SELECT user_id FROM recurring_plans WHERE id = ?1", [plan_id], |r| r.get(0))
        .optional()?;
    match owner {
        None => Err(TirelireError::NotFound("Plan introuvable".to_string())),
        Some(uid) if uid != user_id => Err(TirelireError::Forbidden),
        Some(_) => Ok(conn.query_row(&format!("{PLAN_SELECT} WHERE id = ?1"), [plan_id], row_to_plan)?),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecurringUpdate {
    pub active: Option<bool>,
    pub amount: Option<f64>,
    pub notes: Option<String>,
    pub end_date: Option<Option<String>>,
    pub frequency: Option<Frequency>,
    pub interval: Option<i64>,
}

pub fn update_recurring(conn: &Connection, user_id: i64, plan_id: i64, update: &RecurringUpdate) -> Result<()> {
    let current = owned_plan(conn, user_id, plan_id)?;
    if let Some(a) = update.amount {
        if !a.is_finite() || a.abs() > currency::MAX_AMOUNT {
            return Err(invalid("Montant invalide"));
        }
    }
    let interval = checked_interval(update.interval)?;
    conn.execute(
        "UPDATE recurring_plans SET active = ?1, amount = ?2, notes = ?3, end_date = ?4,
             frequency = ?5, interval_count = ?6
         WHERE id = ?7",
        rusqlite::params![
            update.active.unwrap_or(current.active),
            update.amount.map(f64::abs).unwrap_or(current.amount),
            update.notes.clone().or(current.notes),
            update.end_date.clone().unwrap_or(current.end_date),
            update.frequency.unwrap_or(current.frequency).to_string(),
            interval.unwrap_or(current.interval_count),
            plan_id,
        ],
    )?;
    Ok(())
}

pub fn delete_recurring(conn: &Connection, user_id: i64, plan_id: i64) -> Result<()> {
    owned_plan(conn, user_id, plan_id)?;
    conn.execute("DELETE FROM recurring_plans WHERE id = ?1", [plan_id])?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Materializer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Occurrence {
    pub plan_id: i64,
    pub amount: f64,
    pub date: String,
}

/// Candidate occurrence times up to `now`, stopping once a candidate passes
/// the end date or the schedule can no longer move forward.
pub fn due_dates(plan: &RecurringPlan, now: NaiveDateTime) -> Vec<NaiveDateTime> {
    let start = match (&plan.last_run_date, &plan.scheduled_at) {
        (Some(last), _) => match dates::parse_naive(last).and_then(|l| plan.frequency.advance(l, plan.interval_count)) {
            Some(next) => next,
            None => return Vec::new(),
        },
        (None, Some(scheduled)) => match dates::parse_naive(scheduled) {
            Some(s) => s,
            None => return Vec::new(),
        },
        (None, None) => return Vec::new(),
    };
    let end = plan
        .end_date
        .as_deref()
        .and_then(dates::date_part)
        .map(|d| d.and_time(NaiveTime::MIN));

    let mut out = Vec::new();
    let mut candidate = start;
    while candidate <= now {
        if end.is_some_and(|e| candidate > e) {
            break;
        }
        out.push(candidate);
        match plan.frequency.advance(candidate, plan.interval_count) {
            Some(next) if next > candidate => candidate = next,
            _ => break,
        }
    }
    out
}

fn already_materialized(conn: &Connection, user_id: i64, plan_id: i64, day: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM transactions
         WHERE user_id = ?1 AND date(date) = ?2 AND (recurring_plan_id = ?3 OR notes LIKE ?4)",
        rusqlite::params![user_id, day, plan_id, format!("%{}%", default_notes(plan_id))],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

/// Insert one occurrence and stamp the plan's `last_run_date` with its day.
fn insert_occurrence(conn: &Connection, user_id: i64, plan: &RecurringPlan, date: &str) -> Result<i64> {
    let ty = resolve_type(conn, None, Some(&plan.type_code))?;
    let category_id = match &plan.category {
        Some(name) => category_id_by_name(conn, name, None)?,
        None => None,
    };
    let id = transactions::insert(
        conn,
        &NewTransaction {
            user_id,
            type_id: ty.id,
            type_code: ty.code,
            date: date.to_string(),
            category_id,
            subcategory_id: plan.subcategory_id,
            amount: plan.amount.abs(),
            amount_eur: Some(currency::to_eur(plan.amount.abs(), &plan.currency)),
            currency: plan.currency.clone(),
            notes: Some(plan.notes.clone().unwrap_or_else(|| default_notes(plan.id))),
            goal_id: None,
            recurring_plan_id: Some(plan.id),
        },
    )?;
    conn.execute(
        "UPDATE recurring_plans SET last_run_date = ?1 WHERE id = ?2",
        rusqlite::params![&date[..10.min(date.len())], plan.id],
    )?;
    Ok(id)
}

/// Materialize every due occurrence of the user's active plans.
pub fn process_for_user(conn: &mut Connection, user_id: i64, now: NaiveDateTime) -> Result<Vec<Occurrence>> {
    let plans = {
        let mut stmt = conn.prepare(&format!("{PLAN_SELECT} WHERE user_id = ?1 AND active = 1 ORDER BY id"))?;
        let rows = stmt
            .query_map([user_id], row_to_plan)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };

    let mut created = Vec::new();
    for plan in plans {
        let mut sweep_needed = false;
        for when in due_dates(&plan, now) {
            let date = when.format(DB_FORMAT).to_string();
            if already_materialized(conn, user_id, plan.id, &date[..10])? {
                continue;
            }
            let tx = conn.transaction()?;
            let inserted = match insert_occurrence(&tx, user_id, &plan, &date) {
                Ok(_) => tx.commit().map_err(TirelireError::from),
                Err(e) => Err(e),
            };
            match inserted {
                Ok(()) => {
                    created.push(Occurrence {
                        plan_id: plan.id,
                        amount: plan.amount.abs(),
                        date,
                    });
                    sweep_needed = true;
                }
                Err(e) => {
                    warn!(plan_id = plan.id, date = %date, error = %e, "recurring occurrence insert failed");
                    continue;
                }
            }
        }
        if sweep_needed && resolve_type(conn, None, Some(&plan.type_code)).is_ok_and(|t| t.id == TYPE_EPARGNE) {
            if let Some(sub) = plan.subcategory_id {
                goals::sweep_after_write(conn, user_id, sub);
            }
        }
    }
    if !created.is_empty() {
        info!(user_id, count = created.len(), "recurring occurrences created");
    }
    Ok(created)
}

pub fn users_with_active_plans(conn: &Connection) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT DISTINCT user_id FROM recurring_plans WHERE active = 1 ORDER BY user_id")?;
    let rows = stmt
        .query_map([], |r| r.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Run the materializer for every user with active plans. A failure for one
/// user is logged and does not stop the others.
pub fn process_all(conn: &mut Connection, now: NaiveDateTime) -> Result<Vec<(i64, Vec<Occurrence>)>> {
    let mut results = Vec::new();
    for user_id in users_with_active_plans(conn)? {
        match process_for_user(conn, user_id, now) {
            Ok(created) => results.push((user_id, created)),
            Err(e) => warn!(user_id, error = %e, "recurring processing failed"),
        }
    }
    Ok(results)
}
