//! Dashboard aggregations over a user's transactions. Amounts are taken in
//! the stored currency and months follow Paris local time.

use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, NaiveDate};
use serde::Serialize;

use crate::dates;
use crate::db::round2;
use crate::models::Transaction;
use crate::search::normalize;

/// Months with no data shown by the evolution chart.
const EMPTY_WINDOW_MONTHS: i32 = 6;
const UNCATEGORIZED: &str = "Autres";

/// Rows that carry an imported grand total rather than a real movement.
fn is_total_row(t: &Transaction) -> bool {
    t.category.as_deref().is_some_and(|c| normalize(c.trim()) == "total general")
}

// ---------------------------------------------------------------------------
// Month arithmetic
// ---------------------------------------------------------------------------

/// Months since year 0, so consecutive months differ by one.
type MonthIndex = i32;

fn month_index(date: NaiveDate) -> MonthIndex {
    date.year() * 12 + date.month0() as i32
}

fn month_parts(idx: MonthIndex) -> (i32, u32) {
    (idx.div_euclid(12), idx.rem_euclid(12) as u32 + 1)
}

fn month_key(idx: MonthIndex) -> String {
    let (y, m) = month_parts(idx);
    format!("{y:04}-{m:02}")
}

fn month_label(idx: MonthIndex) -> String {
    let (y, m) = month_parts(idx);
    format!("{m:02}/{y:04}")
}

fn local_month(t: &Transaction) -> Option<MonthIndex> {
    let utc = dates::parse_naive(&t.date)?;
    Some(month_index(dates::utc_to_paris(utc).date()))
}

// ---------------------------------------------------------------------------
// Monthly evolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EvolutionPoint {
    /// `YYYY-MM`.
    pub month: String,
    pub income: f64,
    pub expenses: f64,
}

/// Income and expenses per month from the first month with data to the
/// current month, empty months included.
pub fn monthly_evolution(transactions: &[Transaction], today: NaiveDate) -> Vec<EvolutionPoint> {
    let mut totals: BTreeMap<MonthIndex, (f64, f64)> = BTreeMap::new();
    for t in transactions.iter().filter(|t| !is_total_row(t)) {
        let Some(idx) = local_month(t) else { continue };
        let entry = totals.entry(idx).or_default();
        match t.type_code.as_str() {
            "income" => entry.0 += t.amount,
            "expense" => entry.1 += t.amount.abs(),
            _ => {}
        }
    }

    let current = month_index(today);
    let start = match totals.keys().next() {
        Some(&first) if first <= current => first,
        _ => current - (EMPTY_WINDOW_MONTHS - 1),
    };

    (start..=current)
        .map(|idx| {
            let (income, expenses) = totals.get(&idx).copied().unwrap_or_default();
            EvolutionPoint {
                month: month_key(idx),
                income: round2(income),
                expenses: round2(expenses),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Category breakdown
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CategoryShare {
    pub category: String,
    pub amount: f64,
    pub icon: Option<String>,
}

/// Expense totals per category, largest first, at most `top_n` entries.
pub fn category_breakdown(transactions: &[Transaction], top_n: usize) -> Vec<CategoryShare> {
    let mut acc: HashMap<String, CategoryShare> = HashMap::new();
    for t in transactions.iter().filter(|t| t.type_code == "expense" && !is_total_row(t)) {
        let name = t
            .category
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or(UNCATEGORIZED);
        acc.entry(name.to_string())
            .or_insert_with(|| CategoryShare {
                category: name.to_string(),
                amount: 0.0,
                icon: t.icon.clone(),
            })
            .amount += t.amount.abs();
    }
    let mut shares: Vec<CategoryShare> = acc
        .into_values()
        .map(|s| CategoryShare { amount: round2(s.amount), ..s })
        .collect();
    shares.sort_by(|a, b| b.amount.total_cmp(&a.amount).then_with(|| a.category.cmp(&b.category)));
    shares.truncate(top_n);
    shares
}

// ---------------------------------------------------------------------------
// Savings and projection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SavingPoint {
    /// `MM/YYYY`.
    pub label: String,
    /// Running balance, `None` for future months.
    pub real: Option<f64>,
    pub proj: Option<f64>,
}

/// Least-squares line through `(x, y)` points as `(slope, intercept)`.
fn linear_fit(points: &[(f64, f64)]) -> (f64, f64) {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let num: f64 = points.iter().map(|(x, y)| (x - mean_x) * (y - mean_y)).sum();
    let den: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    let slope = if den == 0.0 { 0.0 } else { num / den };
    (slope, mean_y - slope * mean_x)
}

/// Running balance per month (`balance[n] = balance[n-1] + income[n] -
/// expenses[n]`) followed by `proj_months` projected months after the
/// current one. With a single real point the projection is flat.
pub fn monthly_savings(transactions: &[Transaction], today: NaiveDate, proj_months: u32) -> Vec<SavingPoint> {
    let mut deltas: BTreeMap<MonthIndex, f64> = BTreeMap::new();
    for t in transactions.iter().filter(|t| !is_total_row(t)) {
        let delta = match t.type_code.as_str() {
            "income" => t.amount,
            "expense" => -t.amount.abs(),
            _ => continue,
        };
        if let Some(idx) = local_month(t) {
            *deltas.entry(idx).or_default() += delta;
        }
    }

    let current = month_index(today);
    let mut series: BTreeMap<MonthIndex, SavingPoint> = BTreeMap::new();
    let (Some(&first), Some(&last)) = (deltas.keys().next(), deltas.keys().next_back()) else {
        return Vec::new();
    };

    let mut running = 0.0;
    for idx in first..=last.max(current) {
        running += deltas.get(&idx).copied().unwrap_or(0.0);
        let real = (idx <= current).then(|| round2(running));
        series.insert(idx, SavingPoint { label: month_label(idx), real, proj: None });
    }

    let reals: Vec<(MonthIndex, f64)> = series
        .iter()
        .filter_map(|(idx, p)| p.real.map(|r| (*idx, r)))
        .collect();

    let projected: Vec<(MonthIndex, f64)> = match reals.as_slice() {
        [] => Vec::new(),
        [(idx, value)] => {
            let base = current.max(*idx);
            (1..=proj_months as i32).map(|m| (base + m, *value)).collect()
        }
        _ => {
            // x is the position in the series, which starts at `first`
            let points: Vec<(f64, f64)> = reals.iter().map(|(idx, v)| ((idx - first) as f64, *v)).collect();
            let (slope, intercept) = linear_fit(&points);
            let base = if series.contains_key(&current) {
                current
            } else {
                reals.iter().map(|(idx, _)| *idx).max().unwrap_or(current)
            };
            (1..=proj_months as i32)
                .map(|m| {
                    let x = (base - first + m) as f64;
                    (current + m, round2(intercept + slope * x))
                })
                .collect()
        }
    };
    for (idx, value) in projected {
        series
            .entry(idx)
            .or_insert_with(|| SavingPoint { label: month_label(idx), real: None, proj: None })
            .proj = Some(value);
    }

    let display_end = current + proj_months as i32;
    series.into_iter().filter(|(idx, _)| *idx <= display_end).map(|(_, p)| p).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(date: &str, type_code: &str, category: &str, amount: f64) -> Transaction {
        Transaction {
            id: 0,
            date: format!("{date} 12:00:00"),
            amount,
            amount_eur: None,
            currency: "EUR".into(),
            notes: None,
            type_id: None,
            type_code: type_code.into(),
            category_id: None,
            category: Some(category.into()),
            subcategory_id: None,
            subcategory: None,
            icon: None,
            goal_id: None,
            recurring_plan_id: None,
            invoices: None,
        }
    }

    fn sample() -> Vec<Transaction> {
        vec![
            tx("2025-01-15", "income", "Salaire", 1000.0),
            tx("2025-01-20", "expense", "Courses", 200.0),
            tx("2025-02-05", "income", "Salaire", 1200.0),
            tx("2025-02-12", "expense", "Transports", 100.0),
            tx("2025-03-06", "expense", "Courses", 250.0),
        ]
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_evolution_fills_gaps_up_to_current_month() {
        let points = monthly_evolution(&sample(), day("2025-05-10"));
        let months: Vec<&str> = points.iter().map(|p| p.month.as_str()).collect();
        assert_eq!(months, vec!["2025-01", "2025-02", "2025-03", "2025-04", "2025-05"]);
        assert_eq!(points[0].income, 1000.0);
        assert_eq!(points[0].expenses, 200.0);
        assert_eq!(points[2].expenses, 250.0);
        assert_eq!(points[3].income, 0.0);
    }

    #[test]
    fn test_evolution_without_data_shows_six_months() {
        let points = monthly_evolution(&[], day("2025-03-15"));
        assert_eq!(points.len(), 6);
        assert_eq!(points[0].month, "2024-10");
        assert_eq!(points[5].month, "2025-03");
    }

    #[test]
    fn test_evolution_uses_paris_month() {
        let mut late = tx("2025-01-31", "income", "Salaire", 50.0);
        late.date = "2025-01-31 23:30:00".into();
        let points = monthly_evolution(&[late], day("2025-02-10"));
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].month, "2025-02");
    }

    #[test]
    fn test_category_breakdown() {
        let mut txs = sample();
        txs.push(tx("2025-03-07", "expense", "Total général", 10_000.0));
        let shares = category_breakdown(&txs, 6);
        assert_eq!(shares.len(), 2);
        assert_eq!(shares[0].category, "Courses");
        assert_eq!(shares[0].amount, 450.0);
        assert_eq!(shares[1].amount, 100.0);
        assert_eq!(category_breakdown(&txs, 1).len(), 1);
    }

    #[test]
    fn test_savings_running_balance() {
        let txs = vec![
            tx("2024-01-10", "income", "Salaire", 2846.0),
            tx("2024-01-12", "expense", "Loyer", 2068.28),
            tx("2024-02-05", "income", "Salaire", 2428.0),
            tx("2024-02-20", "expense", "Courses", 1789.61),
        ];
        let points = monthly_savings(&txs, day("2024-02-10"), 0);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].label, "01/2024");
        assert_eq!(points[0].real, Some(777.72));
        assert_eq!(points[1].real, Some(1416.11));
        assert!(points.iter().all(|p| p.proj.is_none()));
    }

    #[test]
    fn test_savings_projection_least_squares() {
        let points = monthly_savings(&sample(), day("2025-03-15"), 2);
        let labels: Vec<&str> = points.iter().map(|p| p.label.as_str()).collect();
        assert_eq!(labels, vec!["01/2025", "02/2025", "03/2025", "04/2025", "05/2025"]);
        assert_eq!(points[0].real, Some(800.0));
        assert_eq!(points[1].real, Some(1900.0));
        assert_eq!(points[2].real, Some(1650.0));
        // slope 425, intercept 1025
        assert_eq!(points[3].real, None);
        assert_eq!(points[3].proj, Some(2300.0));
        assert_eq!(points[4].proj, Some(2725.0));
    }

    #[test]
    fn test_savings_single_point_projects_flat() {
        let txs = vec![
            tx("2025-01-15", "income", "Salaire", 1000.0),
            tx("2025-01-20", "expense", "Courses", 200.0),
            tx("2025-01-25", "income", "Total général", 10_000.0),
        ];
        let points = monthly_savings(&txs, day("2025-01-20"), 2);
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].real, Some(800.0));
        assert_eq!(points[1].proj, Some(800.0));
        assert_eq!(points[2].label, "03/2025");
        assert_eq!(points[2].proj, Some(800.0));
    }

    #[test]
    fn test_savings_empty() {
        assert!(monthly_savings(&[], day("2025-01-20"), 3).is_empty());
    }
}
