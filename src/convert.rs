//! Bulk conversion of a user's stored amounts between EUR and XOF.
//!
//! `amount_eur` columns keep the EUR value of every row so a conversion to
//! XOF can be undone exactly.

use rusqlite::Connection;
use serde::Serialize;
use tracing::info;

use crate::auth;
use crate::currency::{self, MAX_AMOUNT};
use crate::db::round2;
use crate::error::{invalid, Result};
use crate::goals::{self, progress_pct};

const BATCH_SIZE: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Target {
    #[serde(rename = "EUR")]
    Eur,
    #[serde(rename = "XOF")]
    Xof,
}

impl Target {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_uppercase().as_str() {
            "EUR" => Ok(Self::Eur),
            "XOF" => Ok(Self::Xof),
            _ => Err(invalid("Devise cible non supportée")),
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::Eur => "EUR",
            Self::Xof => "XOF",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyInTarget,
    OutOfRange,
    NoMontantEur,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Skipped {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConversionReport {
    pub converted_to: Target,
    pub converted_rows: usize,
    pub skipped: Vec<Skipped>,
    pub max_allowed: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

type TxRow = (i64, f64, Option<f64>, String);

fn next_batch(conn: &Connection, user_id: i64, after: i64) -> Result<Vec<TxRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, amount, amount_eur, UPPER(COALESCE(currency, 'EUR')) FROM transactions
         WHERE user_id = ?1 AND id > ?2 ORDER BY id LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![user_id, after, BATCH_SIZE], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// EUR value of a row: the backup when set and non-zero, else the amount.
fn eur_base(amount: f64, backup: Option<f64>) -> f64 {
    backup.filter(|b| *b != 0.0).unwrap_or(amount)
}

/// Missing backups are derived from the amount: transactions by their own
/// currency, goals by the user's current display currency.
fn fill_eur_backups(conn: &Connection, user_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE transactions SET amount_eur = amount
         WHERE user_id = ?1 AND (amount_eur IS NULL OR amount_eur = 0) AND UPPER(COALESCE(currency, 'EUR')) = 'EUR'",
        [user_id],
    )?;
    let source = goals::user_currency(conn, user_id)?;
    let to_eur = currency::rate(&source, "EUR").unwrap_or(1.0);
    conn.execute(
        "UPDATE goals SET amount_eur = ROUND(amount * ?2, 2)
         WHERE user_id = ?1 AND (amount_eur IS NULL OR amount_eur = 0)",
        rusqlite::params![user_id, to_eur],
    )?;
    conn.execute(
        "UPDATE reached_goals SET target_amount_eur = ROUND(target_amount * ?2, 2)
         WHERE user_id = ?1 AND (target_amount_eur IS NULL OR target_amount_eur = 0)",
        rusqlite::params![user_id, to_eur],
    )?;
    conn.execute(
        "UPDATE reached_goals SET total_collected_eur = ROUND(total_collected * ?2, 2)
         WHERE user_id = ?1 AND (total_collected_eur IS NULL OR total_collected_eur = 0)",
        rusqlite::params![user_id, to_eur],
    )?;
    Ok(())
}

fn convert_transactions(conn: &mut Connection, user_id: i64, target: Target) -> Result<(usize, Vec<Skipped>)> {
    let rate = currency::EUR_TO_XOF;
    let mut converted = 0;
    let mut skipped = Vec::new();
    let mut last_id = 0;
    loop {
        let rows = next_batch(conn, user_id, last_id)?;
        let Some(last) = rows.last() else { break };
        last_id = last.0;

        let tx = conn.transaction()?;
        for (id, amount, amount_eur, row_currency) in rows {
            if row_currency == target.code() {
                let value = (target == Target::Xof).then_some(amount);
                skipped.push(Skipped { id, value, reason: SkipReason::AlreadyInTarget });
                continue;
            }
            let new_amount = match target {
                Target::Xof => {
                    let new = round2(eur_base(amount, amount_eur) * rate);
                    if !new.is_finite() || new.abs() > MAX_AMOUNT {
                        skipped.push(Skipped { id, value: Some(new), reason: SkipReason::OutOfRange });
                        continue;
                    }
                    new
                }
                Target::Eur => match amount_eur {
                    Some(eur) => round2(eur),
                    None => {
                        skipped.push(Skipped { id, value: None, reason: SkipReason::NoMontantEur });
                        continue;
                    }
                },
            };
            tx.execute(
                "UPDATE transactions SET amount = ?1, currency = ?2 WHERE id = ?3 AND user_id = ?4",
                rusqlite::params![new_amount, target.code(), id, user_id],
            )?;
            converted += 1;
        }
        tx.commit()?;
    }
    Ok((converted, skipped))
}

/// Open goals are recomputed from their EUR backup in either direction.
fn convert_goals(conn: &mut Connection, user_id: i64, target: Target) -> Result<()> {
    let factor = match target {
        Target::Xof => currency::EUR_TO_XOF,
        Target::Eur => 1.0,
    };
    let tx = conn.transaction()?;
    let open = {
        let mut stmt = tx.prepare("SELECT id, amount, amount_eur FROM goals WHERE user_id = ?1")?;
        let rows = stmt
            .query_map([user_id], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, f64>(1)?, r.get::<_, Option<f64>>(2)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };
    for (id, amount, amount_eur) in open {
        tx.execute(
            "UPDATE goals SET amount = ?1 WHERE id = ?2",
            rusqlite::params![round2(eur_base(amount, amount_eur) * factor), id],
        )?;
    }

    let reached = {
        let mut stmt = tx.prepare(
            "SELECT id, target_amount, total_collected, target_amount_eur, total_collected_eur
             FROM reached_goals WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([user_id], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, f64>(1)?,
                    r.get::<_, f64>(2)?,
                    r.get::<_, Option<f64>>(3)?,
                    r.get::<_, Option<f64>>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };
    for (id, target_amount, total, target_eur, total_eur) in reached {
        if target == Target::Eur && (target_eur.is_none() || total_eur.is_none()) {
            continue;
        }
        let new_target = round2(eur_base(target_amount, target_eur) * factor);
        let new_total = round2(eur_base(total, total_eur) * factor);
        let pct = if new_target != 0.0 { progress_pct(new_total, new_target) } else { 0.0 };
        tx.execute(
            "UPDATE reached_goals SET target_amount = ?1, total_collected = ?2, progress_pct = ?3 WHERE id = ?4",
            rusqlite::params![new_target, new_total, pct, id],
        )?;
    }
    tx.commit()?;
    Ok(())
}

/// Convert every stored amount of the user to `target` and record the
/// target as the user's display currency.
pub fn convert_user(conn: &mut Connection, user_id: i64, target: Target) -> Result<ConversionReport> {
    fill_eur_backups(conn, user_id)?;
    convert_goals(conn, user_id, target)?;
    let (converted_rows, skipped) = convert_transactions(conn, user_id, target)?;
    auth::set_currency(conn, user_id, target.code())?;
    info!(user_id, target = target.code(), converted_rows, skipped = skipped.len(), "currency conversion done");

    let warning = (!skipped.is_empty()).then(|| {
        "Certaines lignes ont été ignorées car la valeur convertie dépasse la plage autorisée \
         ou étaient déjà en devise cible."
            .to_string()
    });
    Ok(ConversionReport {
        converted_to: target,
        converted_rows,
        skipped,
        max_allowed: MAX_AMOUNT,
        warning,
    })
}
