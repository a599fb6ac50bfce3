//! Budget aggregation over the three complete months before a selected
//! month, per-category budget rows and monthly saving targets.

use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

use crate::dates;
use crate::db::round2;
use crate::error::{invalid, Result};
use crate::models::TYPE_EXPENSE;
use crate::validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AvgMode {
    /// Divide by three whatever the data.
    IncludeZero,
    /// Divide by the number of months with spending.
    #[default]
    IgnoreEmpty,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BudgetQuery {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub type_filter: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub avg_mode: AvgMode,
    pub only_positive: bool,
}

/// `"Tous"` / `"Toutes"` are the frontend's "no filter" values.
fn filter_value(data: &Value, key: &str, wildcard: &str) -> Option<String> {
    match data.get(key)? {
        Value::String(s) if s.trim().is_empty() || s == wildcard => None,
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl BudgetQuery {
    pub fn from_json(data: &Value) -> Self {
        let avg_mode = match data.get("avgMode").and_then(Value::as_str) {
            Some("include_zero") => AvgMode::IncludeZero,
            _ => AvgMode::IgnoreEmpty,
        };
        Self {
            year: filter_value(data, "annee", "Tous").and_then(|y| y.parse().ok()),
            month: filter_value(data, "mois", "Tous").and_then(|m| m.parse().ok()),
            type_filter: filter_value(data, "filtreType", "tous"),
            category: filter_value(data, "categorie", "Toutes"),
            subcategory: filter_value(data, "sousCategorie", "Toutes"),
            avg_mode,
            only_positive: validate::boolean(data.get("onlyPositiveBudgets")),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BudgetFigures {
    pub manual_budget: Option<f64>,
    pub budget_auto: f64,
    pub budget_used: f64,
    pub spent_this_month: f64,
    pub remaining: f64,
    pub percent_spent: Option<f64>,
    pub months_sums: BTreeMap<String, f64>,
    pub months_with_data_count: usize,
    pub budget_source: &'static str,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SubcategoryBudget {
    pub id_subcategory: i64,
    pub category_id: i64,
    pub category_name: Option<String>,
    pub name: String,
    #[serde(flatten)]
    pub figures: BudgetFigures,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CategoryBudget {
    pub id_category: i64,
    pub name: String,
    #[serde(flatten)]
    pub figures: BudgetFigures,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BudgetReport {
    pub subcategories: Vec<SubcategoryBudget>,
    pub categories: Vec<CategoryBudget>,
    pub range_start: Option<String>,
    pub range_end: Option<String>,
    pub months_considered: Vec<String>,
    pub avg_mode: AvgMode,
    pub filtered_only_positive: bool,
}

fn figures(
    months: &[String],
    history: Option<&HashMap<String, f64>>,
    manual: Option<f64>,
    spent: f64,
    mode: AvgMode,
) -> BudgetFigures {
    let months_sums: BTreeMap<String, f64> = months
        .iter()
        .map(|m| (m.clone(), history.and_then(|h| h.get(m)).copied().unwrap_or(0.0)))
        .collect();
    let sum: f64 = months_sums.values().sum();
    let with_data = months_sums.values().filter(|v| **v > 0.0).count();
    let budget_auto = match mode {
        AvgMode::IncludeZero => sum / 3.0,
        AvgMode::IgnoreEmpty if with_data > 0 => sum / with_data as f64,
        AvgMode::IgnoreEmpty => 0.0,
    };
    let used = manual.unwrap_or(budget_auto);
    BudgetFigures {
        manual_budget: manual,
        budget_auto: round2(budget_auto),
        budget_used: round2(used),
        spent_this_month: round2(spent),
        remaining: round2(used - spent),
        percent_spent: (used > 0.0).then(|| round2(spent / used * 100.0)),
        months_sums,
        months_with_data_count: with_data,
        budget_source: if manual.is_some() { "manual" } else { "auto" },
    }
}

/// Expense totals keyed by (group id, `YYYY-MM`) between two dates.
fn monthly_totals(
    conn: &Connection,
    user_id: i64,
    column: &str,
    start: &str,
    end: &str,
) -> Result<HashMap<i64, HashMap<String, f64>>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {column}, strftime('%Y-%m', date), SUM(amount) FROM transactions
         WHERE user_id = ?1 AND type_id = ?2 AND date >= ?3 AND date < ?4 AND {column} IS NOT NULL
         GROUP BY {column}, strftime('%Y-%m', date)"
    ))?;
    let rows = stmt
        .query_map(rusqlite::params![user_id, TYPE_EXPENSE, start, end], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, f64>(2)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut out: HashMap<i64, HashMap<String, f64>> = HashMap::new();
    for (id, ym, total) in rows {
        out.entry(id).or_default().insert(ym, total);
    }
    Ok(out)
}

fn period_totals(conn: &Connection, user_id: i64, column: &str, start: &str, end: &str) -> Result<HashMap<i64, f64>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {column}, SUM(amount) FROM transactions
         WHERE user_id = ?1 AND type_id = ?2 AND date >= ?3 AND date < ?4 AND {column} IS NOT NULL
         GROUP BY {column}"
    ))?;
    let rows = stmt
        .query_map(rusqlite::params![user_id, TYPE_EXPENSE, start, end], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, f64>(1)?))
        })?
        .collect::<std::result::Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

type SubRow = (i64, i64, String, Option<f64>, Option<String>);

fn budget_subcategories(conn: &Connection, query: &BudgetQuery) -> Result<Vec<SubRow>> {
    let base = "SELECT s.id, s.category_id, s.name, s.manual_budget, c.name
                FROM subcategories s LEFT JOIN categories c ON c.id = s.category_id";
    let map = |r: &rusqlite::Row| -> rusqlite::Result<SubRow> {
        Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
    };
    let rows = if let Some(name) = &query.subcategory {
        let mut stmt = conn.prepare(&format!("{base} WHERE s.name = ?1 ORDER BY s.name"))?;
        let rows = stmt.query_map([name], map)?.collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    } else if let Some(name) = &query.category {
        let mut stmt = conn.prepare(&format!("{base} WHERE c.name = ?1 ORDER BY s.name"))?;
        let rows = stmt.query_map([name], map)?.collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    } else {
        let mut stmt = conn.prepare(&format!("{base} ORDER BY s.name"))?;
        let rows = stmt.query_map([], map)?.collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };
    Ok(rows)
}

type CatRow = (i64, String, Option<f64>);

fn budget_categories(conn: &Connection, query: &BudgetQuery) -> Result<Vec<CatRow>> {
    let map = |r: &rusqlite::Row| -> rusqlite::Result<CatRow> { Ok((r.get(0)?, r.get(1)?, r.get(2)?)) };
    let rows = match &query.category {
        Some(name) => {
            let mut stmt =
                conn.prepare("SELECT id, name, manual_budget FROM categories WHERE name = ?1 ORDER BY name")?;
            let rows = stmt.query_map([name], map)?.collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare("SELECT id, name, manual_budget FROM categories ORDER BY name")?;
            let rows = stmt.query_map([], map)?.collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

/// Budgets for the selected month (default: the month of `today`).
///
/// Only subcategories with spending in the selected month are listed; an
/// income filter yields empty lists.
pub fn compute_budgets(conn: &Connection, user_id: i64, query: &BudgetQuery, today: NaiveDate) -> Result<BudgetReport> {
    if query.type_filter.as_deref() == Some("income") {
        return Ok(BudgetReport {
            subcategories: Vec::new(),
            categories: Vec::new(),
            range_start: None,
            range_end: None,
            months_considered: Vec::new(),
            avg_mode: query.avg_mode,
            filtered_only_positive: query.only_positive,
        });
    }

    let month_start = match (query.year, query.month) {
        (Some(y), Some(m)) => NaiveDate::from_ymd_opt(y, m, 1).ok_or_else(|| invalid("Période invalide"))?,
        _ => NaiveDate::from_ymd_opt(today.year(), today.month(), 1).unwrap_or(today),
    };
    let range_start = dates::add_months(month_start, -3).format("%Y-%m-%d").to_string();
    let range_end = month_start.format("%Y-%m-%d").to_string();
    let next_start = dates::add_months(month_start, 1).format("%Y-%m-%d").to_string();
    let months: Vec<String> = (1..=3)
        .map(|i| dates::add_months(month_start, -i).format("%Y-%m").to_string())
        .collect();

    let subs = budget_subcategories(conn, query)?;
    let sub_history = monthly_totals(conn, user_id, "subcategory_id", &range_start, &range_end)?;
    let sub_current = period_totals(conn, user_id, "subcategory_id", &range_end, &next_start)?;

    let mut subcategories: Vec<SubcategoryBudget> = subs
        .into_iter()
        .map(|(id, category_id, name, manual, category_name)| SubcategoryBudget {
            id_subcategory: id,
            category_id,
            category_name,
            name,
            figures: figures(
                &months,
                sub_history.get(&id),
                manual,
                sub_current.get(&id).copied().unwrap_or(0.0),
                query.avg_mode,
            ),
        })
        .filter(|s| s.figures.spent_this_month != 0.0)
        .collect();

    let cat_history = monthly_totals(conn, user_id, "category_id", &range_start, &range_end)?;
    let cat_current = period_totals(conn, user_id, "category_id", &range_end, &next_start)?;
    let mut categories: Vec<CategoryBudget> = budget_categories(conn, query)?
        .into_iter()
        .map(|(id, name, manual)| CategoryBudget {
            id_category: id,
            name,
            figures: figures(
                &months,
                cat_history.get(&id),
                manual,
                cat_current.get(&id).copied().unwrap_or(0.0),
                query.avg_mode,
            ),
        })
        .collect();

    if query.only_positive {
        subcategories.retain(|s| s.figures.budget_used > 0.0);
        categories.retain(|c| c.figures.budget_used > 0.0);
    }

    Ok(BudgetReport {
        subcategories,
        categories,
        range_start: Some(range_start),
        range_end: Some(range_end),
        months_considered: months,
        avg_mode: query.avg_mode,
        filtered_only_positive: query.only_positive,
    })
}

// ---------------------------------------------------------------------------
// Category budget rows
// ---------------------------------------------------------------------------

fn check_period(year: i64, month: i64) -> Result<()> {
    if !(1..=12).contains(&month) || !(1970..=9999).contains(&year) {
        return Err(invalid("Période invalide"));
    }
    Ok(())
}

/// Insert or replace the amount for (user, category, subcategory, year,
/// month). Returns the row id.
pub fn upsert_category_budget(
    conn: &Connection,
    user_id: i64,
    category_id: i64,
    subcategory_id: Option<i64>,
    year: i64,
    month: i64,
    amount: f64,
) -> Result<i64> {
    check_period(year, month)?;
    let sub = subcategory_id.unwrap_or(0);
    conn.execute(
        "INSERT INTO category_budgets (user_id, category_id, subcategory_id, year, month, amount)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(user_id, category_id, subcategory_id, year, month) DO UPDATE SET amount = excluded.amount",
        rusqlite::params![user_id, category_id, sub, year, month, amount],
    )?;
    let id = conn.query_row(
        "SELECT id FROM category_budgets
         WHERE user_id = ?1 AND category_id = ?2 AND subcategory_id = ?3 AND year = ?4 AND month = ?5",
        rusqlite::params![user_id, category_id, sub, year, month],
        |r| r.get(0),
    )?;
    Ok(id)
}

/// Stored budget amount. Without a subcategory any row of the category
/// for that month matches.
pub fn get_category_budget(
    conn: &Connection,
    user_id: i64,
    category_id: i64,
    year: i64,
    month: i64,
    subcategory_id: Option<i64>,
) -> Result<Option<f64>> {
    let amount = match subcategory_id {
        Some(sub) => conn
            .query_row(
                "SELECT amount FROM category_budgets
                 WHERE user_id = ?1 AND category_id = ?2 AND year = ?3 AND month = ?4 AND subcategory_id = ?5",
                rusqlite::params![user_id, category_id, year, month, sub],
                |r| r.get(0),
            )
            .optional()?,
        None => conn
            .query_row(
                "SELECT amount FROM category_budgets
                 WHERE user_id = ?1 AND category_id = ?2 AND year = ?3 AND month = ?4
                 ORDER BY subcategory_id LIMIT 1",
                rusqlite::params![user_id, category_id, year, month],
                |r| r.get(0),
            )
            .optional()?,
    };
    Ok(amount)
}

// ---------------------------------------------------------------------------
// Monthly saving targets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MonthlyGoal {
    pub id_goal: i64,
    pub period_year: i64,
    pub period_month: i64,
    pub target_amount: f64,
    pub rollover_enabled: bool,
}

pub fn set_monthly_goal(
    conn: &Connection,
    user_id: i64,
    year: i64,
    month: i64,
    target: f64,
    rollover: bool,
) -> Result<MonthlyGoal> {
    check_period(year, month)?;
    conn.execute(
        "INSERT INTO monthly_goals (user_id, period_year, period_month, target_amount, rollover_enabled)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![user_id, year, month, target, rollover],
    )?;
    Ok(MonthlyGoal {
        id_goal: conn.last_insert_rowid(),
        period_year: year,
        period_month: month,
        target_amount: target,
        rollover_enabled: rollover,
    })
}

/// The most recent target recorded for a month.
pub fn monthly_goal(conn: &Connection, user_id: i64, year: i64, month: i64) -> Result<Option<MonthlyGoal>> {
    let goal = conn
        .query_row(
            "SELECT id, period_year, period_month, target_amount, rollover_enabled FROM monthly_goals
             WHERE user_id = ?1 AND period_year = ?2 AND period_month = ?3
             ORDER BY id DESC LIMIT 1",
            rusqlite::params![user_id, year, month],
            |r| {
                Ok(MonthlyGoal {
                    id_goal: r.get(0)?,
                    period_year: r.get(1)?,
                    period_month: r.get(2)?,
                    target_amount: r.get(3)?,
                    rollover_enabled: r.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(goal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_db, test_user};
    use crate::transactions::{insert, NewTransaction};
    use serde_json::json;

    fn courses(conn: &Connection) -> (i64, i64) {
        conn.query_row(
            "SELECT category_id, id FROM subcategories WHERE name = 'Courses'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap()
    }

    fn spend(conn: &Connection, uid: i64, date: &str, amount: f64) {
        let (cat, sub) = courses(conn);
        insert(
            conn,
            &NewTransaction {
                user_id: uid,
                type_id: TYPE_EXPENSE,
                type_code: "expense".into(),
                date: date.into(),
                category_id: Some(cat),
                subcategory_id: Some(sub),
                amount,
                currency: "EUR".into(),
                ..NewTransaction::default()
            },
        )
        .unwrap();
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, 15).unwrap()
    }

    #[test]
    fn test_query_from_json_wildcards() {
        let q = BudgetQuery::from_json(&json!({
            "annee": "Tous", "mois": "3", "categorie": "Toutes", "sousCategorie": "Courses",
            "avgMode": "include_zero", "onlyPositiveBudgets": 1
        }));
        assert_eq!(q.year, None);
        assert_eq!(q.month, Some(3));
        assert_eq!(q.category, None);
        assert_eq!(q.subcategory.as_deref(), Some("Courses"));
        assert_eq!(q.avg_mode, AvgMode::IncludeZero);
        assert!(q.only_positive);
        assert_eq!(BudgetQuery::from_json(&json!({"avgMode": "weird"})).avg_mode, AvgMode::IgnoreEmpty);
    }

    #[test]
    fn test_budget_averages() {
        let (_dir, conn) = test_db();
        let uid = test_user(&conn, "a@b.fr");
        spend(&conn, uid, "2024-01-10 10:00:00", 300.0);
        spend(&conn, uid, "2024-03-05 10:00:00", 100.0);
        spend(&conn, uid, "2024-04-02 10:00:00", 50.0);

        let report = compute_budgets(&conn, uid, &BudgetQuery::default(), today()).unwrap();
        assert_eq!(report.range_start.as_deref(), Some("2024-01-01"));
        assert_eq!(report.range_end.as_deref(), Some("2024-04-01"));
        assert_eq!(report.months_considered, vec!["2024-03", "2024-02", "2024-01"]);
        assert_eq!(report.subcategories.len(), 1);
        let f = &report.subcategories[0].figures;
        assert_eq!(f.budget_auto, 200.0);
        assert_eq!(f.months_with_data_count, 2);
        assert_eq!(f.spent_this_month, 50.0);
        assert_eq!(f.remaining, 150.0);
        assert_eq!(f.percent_spent, Some(25.0));
        assert_eq!(f.budget_source, "auto");

        let zero = BudgetQuery { avg_mode: AvgMode::IncludeZero, ..BudgetQuery::default() };
        let report = compute_budgets(&conn, uid, &zero, today()).unwrap();
        assert_eq!(report.subcategories[0].figures.budget_auto, 133.33);
    }

    #[test]
    fn test_manual_budget_overrides_and_positive_filter() {
        let (_dir, conn) = test_db();
        let uid = test_user(&conn, "a@b.fr");
        let (cat, sub) = courses(&conn);
        conn.execute("UPDATE subcategories SET manual_budget = 80 WHERE id = ?1", [sub]).unwrap();
        spend(&conn, uid, "2024-04-02 10:00:00", 100.0);
        let q = BudgetQuery { only_positive: true, ..BudgetQuery::default() };
        let report = compute_budgets(&conn, uid, &q, today()).unwrap();
        let f = &report.subcategories[0].figures;
        assert_eq!(f.budget_used, 80.0);
        assert_eq!(f.remaining, -20.0);
        assert_eq!(f.percent_spent, Some(125.0));
        assert_eq!(f.budget_source, "manual");
        // the category has no history and no manual budget
        assert!(report.categories.iter().all(|c| c.id_category != cat));
    }

    #[test]
    fn test_no_budget_gives_null_percent() {
        let (_dir, conn) = test_db();
        let uid = test_user(&conn, "a@b.fr");
        spend(&conn, uid, "2024-04-02 10:00:00", 10.0);
        let report = compute_budgets(&conn, uid, &BudgetQuery::default(), today()).unwrap();
        assert_eq!(report.subcategories[0].figures.percent_spent, None);
    }

    #[test]
    fn test_income_filter_and_category_filter() {
        let (_dir, conn) = test_db();
        let uid = test_user(&conn, "a@b.fr");
        spend(&conn, uid, "2024-04-02 10:00:00", 10.0);
        let income = BudgetQuery { type_filter: Some("income".into()), ..BudgetQuery::default() };
        let report = compute_budgets(&conn, uid, &income, today()).unwrap();
        assert!(report.subcategories.is_empty() && report.categories.is_empty());
        assert!(report.range_start.is_none());

        let other = BudgetQuery { category: Some("Transport".into()), ..BudgetQuery::default() };
        let report = compute_budgets(&conn, uid, &other, today()).unwrap();
        assert!(report.subcategories.is_empty());
        assert_eq!(report.categories.len(), 1);
        assert_eq!(report.categories[0].name, "Transport");
    }

    #[test]
    fn test_explicit_period() {
        let (_dir, conn) = test_db();
        let uid = test_user(&conn, "a@b.fr");
        spend(&conn, uid, "2023-12-20 10:00:00", 40.0);
        let q = BudgetQuery { year: Some(2023), month: Some(12), ..BudgetQuery::default() };
        let report = compute_budgets(&conn, uid, &q, today()).unwrap();
        assert_eq!(report.range_start.as_deref(), Some("2023-09-01"));
        assert_eq!(report.subcategories[0].figures.spent_this_month, 40.0);
        let bad = BudgetQuery { year: Some(2023), month: Some(13), ..BudgetQuery::default() };
        assert!(compute_budgets(&conn, uid, &bad, today()).is_err());
    }

    #[test]
    fn test_category_budget_upsert() {
        let (_dir, conn) = test_db();
        let uid = test_user(&conn, "a@b.fr");
        let (cat, sub) = courses(&conn);
        let id = upsert_category_budget(&conn, uid, cat, Some(sub), 2024, 4, 300.0).unwrap();
        let again = upsert_category_budget(&conn, uid, cat, Some(sub), 2024, 4, 350.0).unwrap();
        assert_eq!(id, again);
        assert_eq!(get_category_budget(&conn, uid, cat, 2024, 4, Some(sub)).unwrap(), Some(350.0));
        assert_eq!(get_category_budget(&conn, uid, cat, 2024, 4, None).unwrap(), Some(350.0));
        assert_eq!(get_category_budget(&conn, uid, cat, 2024, 5, None).unwrap(), None);
        assert!(upsert_category_budget(&conn, uid, cat, None, 2024, 0, 1.0).is_err());
    }

    #[test]
    fn test_monthly_goals() {
        let (_dir, conn) = test_db();
        let uid = test_user(&conn, "a@b.fr");
        assert!(monthly_goal(&conn, uid, 2024, 4).unwrap().is_none());
        set_monthly_goal(&conn, uid, 2024, 4, 200.0, false).unwrap();
        let latest = set_monthly_goal(&conn, uid, 2024, 4, 250.0, true).unwrap();
        assert_eq!(monthly_goal(&conn, uid, 2024, 4).unwrap(), Some(latest));
    }
}
