//! Automatic savings plans that feed a goal: a fixed monthly amount, a
//! percentage of last month's income, or the round-up of recent expenses.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::{info, warn};

use crate::currency;
use crate::dates::{self, DB_FORMAT};
use crate::db::round2;
use crate::error::{invalid, Result, TirelireError};
use crate::goals;
use crate::models::{TYPE_EPARGNE, TYPE_EXPENSE, TYPE_INCOME};
use crate::transactions::{self, NewTransaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    Monthly,
    Percent,
    RoundUp,
}

impl FromStr for PlanType {
    type Err = TirelireError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "monthly" => Ok(Self::Monthly),
            "percent" => Ok(Self::Percent),
            "round_up" | "roundup" => Ok(Self::RoundUp),
            other => Err(invalid(format!("Type de plan invalide: {other}"))),
        }
    }
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Monthly => "monthly",
            Self::Percent => "percent",
            Self::RoundUp => "round_up",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GoalPlan {
    pub id: i64,
    pub goal_id: i64,
    #[serde(rename = "type")]
    pub plan_type: PlanType,
    pub amount: Option<f64>,
    pub percent: Option<f64>,
    pub schedule_day: i64,
    pub active: bool,
    pub last_run_date: Option<String>,
}

const PLAN_SELECT: &str =
    "SELECT id, goal_id, plan_type, amount, percent, schedule_day, active, last_run_date FROM goal_plans";

fn row_to_plan(row: &rusqlite::Row) -> rusqlite::Result<GoalPlan> {
    let raw: String = row.get(2)?;
    let plan_type = raw.parse().map_err(|e: TirelireError| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(GoalPlan {
        id: row.get(0)?,
        goal_id: row.get(1)?,
        plan_type,
        amount: row.get(3)?,
        percent: row.get(4)?,
        schedule_day: row.get(5)?,
        active: row.get(6)?,
        last_run_date: row.get(7)?,
    })
}

fn check_plan_values(plan_type: PlanType, amount: Option<f64>, percent: Option<f64>) -> Result<()> {
    match plan_type {
        PlanType::Monthly if !amount.is_some_and(|a| a > 0.0) => {
            Err(invalid("Un plan mensuel nécessite un montant positif"))
        }
        PlanType::Percent if !percent.is_some_and(|p| p > 0.0 && p <= 100.0) => {
            Err(invalid("Le pourcentage doit être compris entre 0 et 100"))
        }
        _ => Ok(()),
    }
}

pub fn add_plan(
    conn: &Connection,
    user_id: i64,
    goal_id: i64,
    plan_type: PlanType,
    amount: Option<f64>,
    percent: Option<f64>,
    schedule_day: Option<i64>,
) -> Result<i64> {
    let goal = goals::get_goal_row(conn, goal_id)?;
    if !goal.is_some_and(|g| g.user_id == user_id) {
        return Err(TirelireError::Forbidden);
    }
    check_plan_values(plan_type, amount, percent)?;
    conn.execute(
        "INSERT INTO goal_plans (goal_id, user_id, plan_type, amount, percent, schedule_day)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            goal_id,
            user_id,
            plan_type.to_string(),
            amount,
            percent,
            schedule_day.unwrap_or(1)
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list_active(conn: &Connection, user_id: i64) -> Result<Vec<GoalPlan>> {
    let mut stmt = conn.prepare(&format!(
        "{PLAN_SELECT} WHERE user_id = ?1 AND active = 1 ORDER BY id"
    ))?;
    let rows = stmt
        .query_map([user_id], row_to_plan)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Ownership is checked through the goal the plan feeds.
fn owned_plan(conn: &Connection, user_id: i64, plan_id: i64) -> Result<GoalPlan> {
    let owner: Option<i64> = conn
        .query_row(
            "SELECT g.user_id FROM goal_plans gp JOIN goals g ON g.id = gp.goal_id WHERE gp.id = ?1",
            [plan_id],
            |r| r.get(0),
        )
        .optional()?;
    match owner {
        Some(uid) if uid == user_id => {}
        _ => return Err(TirelireError::Forbidden),
    }
    let plan = conn.query_row(&format!("{PLAN_SELECT} WHERE id = ?1"), [plan_id], row_to_plan)?;
    Ok(plan)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanUpdate {
    pub plan_type: Option<PlanType>,
    pub amount: Option<f64>,
    pub percent: Option<f64>,
    pub schedule_day: Option<i64>,
    pub active: Option<bool>,
}

pub fn update_plan(conn: &Connection, user_id: i64, plan_id: i64, update: &PlanUpdate) -> Result<()> {
    let current = owned_plan(conn, user_id, plan_id)?;
    let plan_type = update.plan_type.unwrap_or(current.plan_type);
    let amount = update.amount.or(current.amount);
    let percent = update.percent.or(current.percent);
    check_plan_values(plan_type, amount, percent)?;
    conn.execute(
        "UPDATE goal_plans SET plan_type = ?1, amount = ?2, percent = ?3, schedule_day = ?4, active = ?5 WHERE id = ?6",
        rusqlite::params![
            plan_type.to_string(),
            amount,
            percent,
            update.schedule_day.unwrap_or(current.schedule_day),
            update.active.unwrap_or(current.active),
            plan_id,
        ],
    )?;
    Ok(())
}

pub fn delete_plan(conn: &Connection, user_id: i64, plan_id: i64) -> Result<()> {
    owned_plan(conn, user_id, plan_id)?;
    conn.execute("DELETE FROM goal_plans WHERE id = ?1", [plan_id])?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PlanRun {
    pub plan_id: i64,
    pub goal_id: i64,
    pub amount: f64,
    pub transaction_id: i64,
}

fn first_of_month(d: NaiveDate) -> NaiveDate {
    d.with_day(1).unwrap_or(d)
}

fn ran_this_month(plan: &GoalPlan, month_start: &str) -> bool {
    plan.last_run_date.as_deref().is_some_and(|d| d >= month_start)
}

fn last_month_income(conn: &Connection, user_id: i64, today: NaiveDate) -> Result<f64> {
    let this_month = first_of_month(today);
    let last_month = dates::add_months(this_month, -1);
    let income: f64 = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM transactions
         WHERE user_id = ?1 AND (type_id = ?2 OR type_code = 'income') AND date >= ?3 AND date < ?4",
        rusqlite::params![user_id, TYPE_INCOME, dates::midnight(last_month), dates::midnight(this_month)],
        |r| r.get(0),
    )?;
    Ok(income)
}

/// Sum of `ceil(|a|) - |a|` over expenses after `since`, ignoring
/// sub-cent roundings.
fn round_up_total(conn: &Connection, user_id: i64, since: &str) -> Result<f64> {
    let mut stmt = conn.prepare(
        "SELECT amount FROM transactions
         WHERE user_id = ?1 AND (type_id = ?2 OR type_code = 'expense') AND date > ?3",
    )?;
    let amounts = stmt
        .query_map(rusqlite::params![user_id, TYPE_EXPENSE, since], |r| r.get::<_, f64>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(amounts
        .into_iter()
        .map(|a| {
            let a = a.abs();
            a.ceil() - a
        })
        .filter(|r| *r >= 0.01)
        .sum())
}

/// Amount a plan should deposit now, if it is due.
fn due_amount(conn: &Connection, user_id: i64, plan: &GoalPlan, now: NaiveDateTime) -> Result<Option<f64>> {
    let today = now.date();
    let month_start = dates::midnight(first_of_month(today));
    let amount = match plan.plan_type {
        PlanType::Monthly => {
            let schedule_day = plan.schedule_day.clamp(1, 28) as u32;
            if ran_this_month(plan, &month_start) || today.day() < schedule_day {
                return Ok(None);
            }
            plan.amount.unwrap_or(0.0)
        }
        PlanType::Percent => {
            if ran_this_month(plan, &month_start) {
                return Ok(None);
            }
            last_month_income(conn, user_id, today)? * plan.percent.unwrap_or(0.0) / 100.0
        }
        PlanType::RoundUp => {
            let since = plan
                .last_run_date
                .clone()
                .unwrap_or_else(|| first_of_month(today).format("%Y-%m-%d").to_string());
            round_up_total(conn, user_id, &since)?
        }
    };
    let amount = round2(amount);
    Ok((amount > 0.009).then_some(amount))
}

/// Run every due plan of the user. Each run inserts an epargne deposit,
/// stamps `last_run_date` and sweeps the goal's subcategory.
pub fn run_plans(conn: &mut Connection, user_id: i64, now: NaiveDateTime) -> Result<Vec<PlanRun>> {
    let plans: Vec<(GoalPlan, i64)> = {
        let mut stmt = conn.prepare(
            "SELECT gp.id, gp.goal_id, gp.plan_type, gp.amount, gp.percent, gp.schedule_day, gp.active,
                    gp.last_run_date, g.subcategory_id
             FROM goal_plans gp JOIN goals g ON g.id = gp.goal_id
             WHERE gp.user_id = ?1 AND gp.active = 1 ORDER BY gp.id",
        )?;
        let rows = stmt
            .query_map([user_id], |r| Ok((row_to_plan(r)?, r.get(8)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };
    let currency: String = conn
        .query_row("SELECT currency FROM users WHERE id = ?1", [user_id], |r| r.get(0))
        .optional()?
        .unwrap_or_else(|| "EUR".to_string());
    let stamp = now.format(DB_FORMAT).to_string();

    let mut runs = Vec::new();
    for (plan, subcategory_id) in plans {
        let Some(amount) = due_amount(conn, user_id, &plan, now)? else {
            continue;
        };
        let category_id: Option<i64> = conn
            .query_row("SELECT category_id FROM subcategories WHERE id = ?1", [subcategory_id], |r| r.get(0))
            .optional()?;
        let tx = conn.transaction()?;
        let transaction_id = transactions::insert(
            &tx,
            &NewTransaction {
                user_id,
                type_id: TYPE_EPARGNE,
                type_code: "epargne".to_string(),
                date: stamp.clone(),
                category_id,
                subcategory_id: Some(subcategory_id),
                amount,
                amount_eur: Some(currency::to_eur(amount, &currency)),
                currency: currency.clone(),
                notes: Some(format!("Plan {} (id: {})", plan.plan_type, plan.id)),
                goal_id: None,
                recurring_plan_id: None,
            },
        )?;
        tx.execute(
            "UPDATE goal_plans SET last_run_date = ?1 WHERE id = ?2",
            rusqlite::params![stamp, plan.id],
        )?;
        if let Err(e) = tx.commit() {
            warn!(plan_id = plan.id, error = %e, "goal plan run failed");
            continue;
        }
        info!(plan_id = plan.id, amount, "goal plan executed");
        runs.push(PlanRun {
            plan_id: plan.id,
            goal_id: plan.goal_id,
            amount,
            transaction_id,
        });
        goals::sweep_after_write(conn, user_id, subcategory_id);
    }
    Ok(runs)
}

/// Users with at least one active goal plan.
pub fn users_with_active_plans(conn: &Connection) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT DISTINCT user_id FROM goal_plans WHERE active = 1 ORDER BY user_id")?;
    let rows = stmt
        .query_map([], |r| r.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
