//! Savings goals and the goal-completion sweep.
//!
//! A goal is linked to a subcategory under the `Objectif` category. Every
//! `epargne` transaction in that subcategory counts toward it (withdrawals
//! are stored as negative amounts). Once the net total reaches the target,
//! the sweep archives the goal into `reached_goals` and deletes the open row.

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::{info, warn};

use crate::currency;
use crate::dates;
use crate::db::round2;
use crate::error::{invalid, Result, TirelireError};
use crate::models::{Transaction, TYPE_EPARGNE, TYPE_EXPENSE};
use crate::transactions::{self, NewTransaction};

pub const GOAL_CATEGORY: &str = "Objectif";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Goal {
    pub id: i64,
    pub subcategory_id: i64,
    #[serde(rename = "nom")]
    pub name: Option<String>,
    #[serde(rename = "montant_objectif")]
    pub target: f64,
    pub target_eur: Option<f64>,
    #[serde(rename = "date_creation")]
    pub created_at: String,
    #[serde(rename = "automatique")]
    pub automatic: bool,
    pub total_deposits: f64,
    pub total_withdrawn: f64,
    #[serde(rename = "montant_depose")]
    pub net_deposited: f64,
    #[serde(rename = "reste")]
    pub remaining: f64,
    pub progress_pct: f64,
    #[serde(rename = "nb_versements")]
    pub deposit_count: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReachedGoal {
    pub id: i64,
    pub goal_id: i64,
    pub subcategory_id: i64,
    pub name: Option<String>,
    #[serde(rename = "montant_objectif")]
    pub target: f64,
    pub target_eur: Option<f64>,
    #[serde(rename = "date_creation")]
    pub created_date: Option<String>,
    #[serde(rename = "date_atteint")]
    pub reached_date: Option<String>,
    pub total_collected: f64,
    pub total_collected_eur: Option<f64>,
    pub progress_pct: f64,
    #[serde(rename = "nb_versements")]
    pub deposit_count: i64,
}

/// Raw open-goal row.
#[derive(Debug, Clone, PartialEq)]
pub struct GoalRow {
    pub id: i64,
    pub user_id: i64,
    pub subcategory_id: i64,
    pub amount: f64,
    pub amount_eur: Option<f64>,
    pub created_at: String,
    pub automatic: bool,
}

fn row_to_goal_row(row: &rusqlite::Row) -> rusqlite::Result<GoalRow> {
    Ok(GoalRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        subcategory_id: row.get(2)?,
        amount: row.get(3)?,
        amount_eur: row.get(4)?,
        created_at: row.get(5)?,
        automatic: row.get(6)?,
    })
}

const GOAL_ROW_SELECT: &str =
    "SELECT id, user_id, subcategory_id, amount, amount_eur, created_at, automatic FROM goals";

/// Percentage of `target` reached, capped at 100. A zero target counts as met.
pub fn progress_pct(total: f64, target: f64) -> f64 {
    if target > 0.0 {
        round2((total / target * 100.0).min(100.0))
    } else {
        100.0
    }
}

pub(crate) fn user_currency(conn: &Connection, user_id: i64) -> Result<String> {
    let cur: Option<String> = conn
        .query_row("SELECT currency FROM users WHERE id = ?1", [user_id], |r| r.get(0))
        .optional()?;
    Ok(cur.unwrap_or_else(|| "EUR".to_string()).to_uppercase())
}

/// Id of the `Objectif` category (type epargne), created on first use.
pub fn ensure_goal_category(conn: &Connection) -> Result<i64> {
    let id: Option<i64> = conn
        .query_row(
            "SELECT id FROM categories WHERE lower(name) = lower(?1) ORDER BY id LIMIT 1",
            [GOAL_CATEGORY],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(id) = id {
        return Ok(id);
    }
    conn.execute(
        "INSERT INTO categories (type_id, name) VALUES (?1, ?2)",
        rusqlite::params![TYPE_EPARGNE, GOAL_CATEGORY],
    )?;
    Ok(conn.last_insert_rowid())
}

fn ensure_goal_subcategory(conn: &Connection, category_id: i64, name: &str) -> Result<i64> {
    let id: Option<i64> = conn
        .query_row(
            "SELECT id FROM subcategories WHERE category_id = ?1 AND lower(name) = lower(?2) LIMIT 1",
            rusqlite::params![category_id, name],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(id) = id {
        return Ok(id);
    }
    conn.execute(
        "INSERT INTO subcategories (category_id, name, icon) VALUES (?1, ?2, 'Target')",
        rusqlite::params![category_id, name],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Sums of the user's epargne movements in a subcategory.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Balance {
    pub deposits: f64,
    pub withdrawn: f64,
    pub net: f64,
    pub net_eur: f64,
    pub count: i64,
}

pub fn subcategory_balance(conn: &Connection, user_id: i64, subcategory_id: i64) -> Result<Balance> {
    let b = conn.query_row(
        "SELECT COALESCE(SUM(CASE WHEN amount > 0 THEN amount ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN amount < 0 THEN -amount ELSE 0 END), 0),
                COALESCE(SUM(amount), 0),
                COALESCE(SUM(COALESCE(amount_eur, amount)), 0),
                COUNT(id)
         FROM transactions
         WHERE user_id = ?1 AND subcategory_id = ?2 AND type_id = ?3",
        rusqlite::params![user_id, subcategory_id, TYPE_EPARGNE],
        |r| {
            Ok(Balance {
                deposits: r.get(0)?,
                withdrawn: r.get(1)?,
                net: r.get(2)?,
                net_eur: r.get(3)?,
                count: r.get(4)?,
            })
        },
    )?;
    Ok(b)
}

fn summarize(conn: &Connection, g: &GoalRow) -> Result<Goal> {
    let name: Option<String> = conn
        .query_row("SELECT name FROM subcategories WHERE id = ?1", [g.subcategory_id], |r| r.get(0))
        .optional()?;
    let balance = subcategory_balance(conn, g.user_id, g.subcategory_id)?;
    // Older clients recorded withdrawals as expenses linked to the goal.
    let legacy_withdrawn: f64 = conn.query_row(
        "SELECT COALESCE(SUM(ABS(amount)), 0) FROM transactions WHERE user_id = ?1 AND goal_id = ?2 AND type_id = ?3",
        rusqlite::params![g.user_id, g.id, TYPE_EXPENSE],
        |r| r.get(0),
    )?;
    let withdrawn = round2(balance.withdrawn + legacy_withdrawn);
    let net = round2(balance.deposits - withdrawn);
    Ok(Goal {
        id: g.id,
        subcategory_id: g.subcategory_id,
        name,
        target: g.amount,
        target_eur: g.amount_eur,
        created_at: g.created_at.clone(),
        automatic: g.automatic,
        total_deposits: round2(balance.deposits),
        total_withdrawn: withdrawn,
        net_deposited: net,
        remaining: round2(g.amount - net),
        progress_pct: progress_pct(net.max(0.0), g.amount),
        deposit_count: balance.count,
    })
}

pub fn create_goal(conn: &Connection, user_id: i64, name: &str, target: f64, automatic: bool) -> Result<Goal> {
    let name = name.trim();
    if name.is_empty() || !(target > 0.0) || !target.is_finite() {
        return Err(invalid("Paramètres invalides"));
    }
    if name.chars().count() > 100 {
        return Err(invalid("Le nom ne doit pas dépasser 100 caractères"));
    }
    let category_id = ensure_goal_category(conn)?;
    let subcategory_id = ensure_goal_subcategory(conn, category_id, name)?;
    let currency = user_currency(conn, user_id)?;
    conn.execute(
        "INSERT INTO goals (user_id, subcategory_id, amount, amount_eur, automatic, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            user_id,
            subcategory_id,
            round2(target),
            currency::to_eur(target, &currency),
            automatic,
            dates::now_utc_string(),
        ],
    )?;
    let row = get_goal_row(conn, conn.last_insert_rowid())?
        .ok_or_else(|| TirelireError::Other("goal vanished after insert".to_string()))?;
    summarize(conn, &row)
}

pub fn get_goal_row(conn: &Connection, goal_id: i64) -> Result<Option<GoalRow>> {
    let g = conn
        .query_row(&format!("{GOAL_ROW_SELECT} WHERE id = ?1"), [goal_id], row_to_goal_row)
        .optional()?;
    Ok(g)
}

/// The goal if it exists and belongs to `user_id`.
pub fn owned_goal(conn: &Connection, user_id: i64, goal_id: i64) -> Result<GoalRow> {
    match get_goal_row(conn, goal_id)? {
        None => Err(TirelireError::NotFound("Objectif introuvable".to_string())),
        Some(g) if g.user_id != user_id => Err(TirelireError::Forbidden),
        Some(g) => Ok(g),
    }
}

pub fn list_goals(conn: &Connection, user_id: i64) -> Result<Vec<Goal>> {
    let mut stmt = conn.prepare(&format!(
        "{GOAL_ROW_SELECT} WHERE user_id = ?1 ORDER BY created_at DESC, id DESC"
    ))?;
    let rows = stmt
        .query_map([user_id], row_to_goal_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.iter().map(|g| summarize(conn, g)).collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GoalUpdate {
    pub amount: Option<f64>,
    pub subcategory_id: Option<i64>,
    pub automatic: Option<bool>,
}

pub fn update_goal(conn: &mut Connection, user_id: i64, goal_id: i64, update: &GoalUpdate) -> Result<()> {
    let goal = owned_goal(conn, user_id, goal_id)?;
    if let Some(amount) = update.amount {
        if !(amount > 0.0) {
            return Err(invalid("Le montant doit être positif"));
        }
        let currency = user_currency(conn, user_id)?;
        conn.execute(
            "UPDATE goals SET amount = ?1, amount_eur = ?2 WHERE id = ?3",
            rusqlite::params![round2(amount), currency::to_eur(amount, &currency), goal_id],
        )?;
    }
    if let Some(sub) = update.subcategory_id {
        let exists: i64 = conn.query_row("SELECT count(*) FROM subcategories WHERE id = ?1", [sub], |r| r.get(0))?;
        if exists == 0 {
            return Err(invalid("Sous-catégorie introuvable"));
        }
        conn.execute(
            "UPDATE goals SET subcategory_id = ?1 WHERE id = ?2",
            rusqlite::params![sub, goal_id],
        )?;
    }
    if let Some(auto) = update.automatic {
        conn.execute(
            "UPDATE goals SET automatic = ?1 WHERE id = ?2",
            rusqlite::params![auto, goal_id],
        )?;
    }
    // A lowered target or a new subcategory can complete the goal.
    let sub = update.subcategory_id.unwrap_or(goal.subcategory_id);
    sweep_after_write(conn, user_id, sub);
    Ok(())
}

/// Record an `epargne` deposit into a goal's subcategory, then sweep it.
pub fn deposit(
    conn: &mut Connection,
    user_id: i64,
    goal_id: i64,
    amount: f64,
    date: Option<&str>,
    notes: Option<&str>,
) -> Result<i64> {
    if !(amount > 0.0) || !amount.is_finite() {
        return Err(invalid("Paramètres invalides"));
    }
    let goal = owned_goal(conn, user_id, goal_id)?;
    let notes = notes
        .map(str::to_string)
        .unwrap_or_else(|| format!("Dépôt objectif #{goal_id}"));
    let tx_id = insert_movement(conn, &goal, amount, date, notes, None)?;
    sweep_after_write(conn, user_id, goal.subcategory_id);
    Ok(tx_id)
}

/// Record a withdrawal as a negative `epargne` transaction linked to the goal.
pub fn withdraw(
    conn: &Connection,
    user_id: i64,
    goal_id: i64,
    amount: f64,
    date: Option<&str>,
    notes: Option<&str>,
) -> Result<i64> {
    if !(amount > 0.0) || !amount.is_finite() {
        return Err(invalid("Paramètres invalides"));
    }
    let goal = owned_goal(conn, user_id, goal_id)?;
    let available = round2(subcategory_balance(conn, user_id, goal.subcategory_id)?.net);
    if amount > available {
        return Err(TirelireError::InsufficientFunds { available });
    }
    insert_movement(
        conn,
        &goal,
        -amount,
        date,
        notes.map(str::to_string).unwrap_or_else(|| format!("Retrait objectif #{goal_id}")),
        Some(goal_id),
    )
}

fn insert_movement(
    conn: &Connection,
    goal: &GoalRow,
    amount: f64,
    date: Option<&str>,
    notes: String,
    link_goal: Option<i64>,
) -> Result<i64> {
    let currency = user_currency(conn, goal.user_id)?;
    let category_id: Option<i64> = conn
        .query_row("SELECT category_id FROM subcategories WHERE id = ?1", [goal.subcategory_id], |r| r.get(0))
        .optional()?;
    let date = match date.map(str::trim).filter(|d| !d.is_empty()) {
        Some(d) => dates::normalize_client_datetime(d),
        None => dates::now_utc_string(),
    };
    transactions::insert(
        conn,
        &NewTransaction {
            user_id: goal.user_id,
            type_id: TYPE_EPARGNE,
            type_code: "epargne".to_string(),
            date,
            category_id,
            subcategory_id: Some(goal.subcategory_id),
            amount,
            amount_eur: Some(currency::to_eur(amount, &currency)),
            currency,
            notes: Some(notes),
            goal_id: link_goal,
            recurring_plan_id: None,
        },
    )
}

/// Deposits and withdrawals of a goal, newest first.
pub fn goal_transactions(conn: &Connection, user_id: i64, goal_id: i64) -> Result<Vec<Transaction>> {
    let goal = owned_goal(conn, user_id, goal_id)?;
    let mut stmt = conn.prepare(
        "SELECT t.id, t.date, t.amount, t.amount_eur, t.currency, t.notes, t.type_id,
                COALESCE(tt.code, t.type_code), t.category_id, c.name, t.subcategory_id, s.name, s.icon,
                t.goal_id, t.recurring_plan_id, NULL
         FROM transactions t
         LEFT JOIN transaction_types tt ON tt.id = t.type_id
         LEFT JOIN categories c ON c.id = t.category_id
         LEFT JOIN subcategories s ON s.id = t.subcategory_id
         WHERE t.user_id = ?1 AND ((t.type_id = ?2 AND t.subcategory_id = ?3) OR t.goal_id = ?4)
         ORDER BY t.date DESC, t.id DESC",
    )?;
    let rows = stmt
        .query_map(
            rusqlite::params![user_id, TYPE_EPARGNE, goal.subcategory_id, goal_id],
            transactions::row_to_transaction,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_reached(conn: &Connection, user_id: i64) -> Result<Vec<ReachedGoal>> {
    let mut stmt = conn.prepare(
        "SELECT id, goal_id, subcategory_id, name, target_amount, target_amount_eur,
                date(created_date), reached_date, total_collected, total_collected_eur,
                progress_pct, deposit_count
         FROM reached_goals
         WHERE user_id = ?1
         ORDER BY reached_date DESC, created_date DESC",
    )?;
    let rows = stmt
        .query_map([user_id], |r| {
            Ok(ReachedGoal {
                id: r.get(0)?,
                goal_id: r.get(1)?,
                subcategory_id: r.get(2)?,
                name: r.get(3)?,
                target: r.get(4)?,
                target_eur: r.get(5)?,
                created_date: r.get(6)?,
                reached_date: r.get(7)?,
                total_collected: r.get(8)?,
                total_collected_eur: r.get(9)?,
                progress_pct: r.get(10)?,
                deposit_count: r.get(11)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Sweep
// ---------------------------------------------------------------------------

/// Archive every open goal of the user in `subcategory_id` whose net
/// deposits reached its target. Runs in one IMMEDIATE transaction; the
/// UNIQUE `reached_goals.goal_id` makes concurrent sweeps archive a goal at
/// most once. Returns the ids of the goals archived by this call.
pub fn sweep_subcategory(conn: &mut Connection, user_id: i64, subcategory_id: i64) -> Result<Vec<i64>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let goals = {
        let mut stmt = tx.prepare(&format!(
            "{GOAL_ROW_SELECT} WHERE user_id = ?1 AND subcategory_id = ?2 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(rusqlite::params![user_id, subcategory_id], row_to_goal_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };
    if goals.is_empty() {
        tx.commit()?;
        return Ok(Vec::new());
    }

    let (total, total_eur, reached_date, count): (f64, f64, Option<String>, i64) = tx.query_row(
        "SELECT COALESCE(SUM(amount), 0), COALESCE(SUM(COALESCE(amount_eur, amount)), 0), MAX(date), COUNT(id)
         FROM transactions WHERE user_id = ?1 AND subcategory_id = ?2 AND type_id = ?3",
        rusqlite::params![user_id, subcategory_id, TYPE_EPARGNE],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
    )?;
    let name: Option<String> = tx
        .query_row("SELECT name FROM subcategories WHERE id = ?1", [subcategory_id], |r| r.get(0))
        .optional()?;

    let mut moved = Vec::new();
    for g in goals.iter().filter(|g| total >= g.amount) {
        let inserted = tx.execute(
            "INSERT INTO reached_goals
                (goal_id, user_id, subcategory_id, name, target_amount, target_amount_eur,
                 created_date, reached_date, total_collected, total_collected_eur,
                 progress_pct, deposit_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(goal_id) DO NOTHING",
            rusqlite::params![
                g.id,
                g.user_id,
                g.subcategory_id,
                name,
                g.amount,
                g.amount_eur,
                g.created_at,
                reached_date,
                round2(total),
                round2(total_eur),
                progress_pct(total, g.amount),
                count,
            ],
        )?;
        // an existing archive row means the goal stays open
        if inserted == 1 {
            tx.execute("DELETE FROM goals WHERE id = ?1", [g.id])?;
            info!(goal_id = g.id, subcategory_id, total, "goal reached");
            moved.push(g.id);
        }
    }
    tx.commit()?;
    Ok(moved)
}

/// Sweep after a transaction write. A failure is logged and swallowed so
/// the write that triggered it still succeeds.
pub fn sweep_after_write(conn: &mut Connection, user_id: i64, subcategory_id: i64) -> Vec<i64> {
    match sweep_subcategory(conn, user_id, subcategory_id) {
        Ok(moved) => moved,
        Err(e) => {
            warn!(user_id, subcategory_id, error = %e, "goal sweep failed");
            Vec::new()
        }
    }
}

/// Sweep every subcategory that has open goals, optionally for one user.
pub fn sweep_all(conn: &mut Connection, user_id: Option<i64>) -> Result<Vec<i64>> {
    let pairs = {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT user_id, subcategory_id FROM goals WHERE ?1 IS NULL OR user_id = ?1",
        )?;
        let rows = stmt
            .query_map([user_id], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };
    let mut moved = Vec::new();
    for (uid, sub) in pairs {
        moved.extend(sweep_subcategory(conn, uid, sub)?);
    }
    Ok(moved)
}
