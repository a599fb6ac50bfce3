use std::collections::HashMap;

use colored::Colorize;
use comfy_table::{Cell, Table};

use crate::auth;
use crate::cli::open_db;
use crate::dates;
use crate::error::Result;
use crate::fmt::format_currency;
use crate::stats;
use crate::transactions;

/// `YYYY-MM` to the `MM/YYYY` label used by the savings series.
fn savings_label(month: &str) -> String {
    match month.split_once('-') {
        Some((year, m)) => format!("{m}/{year}"),
        None => month.to_string(),
    }
}

pub fn run(user: &str, months: usize) -> Result<()> {
    let (_, conn) = open_db()?;
    let user = auth::require_user(&conn, user)?;
    let txs = transactions::list_transactions(&conn, user.id, None)?;
    let today = dates::utc_to_paris(chrono::Utc::now().naive_utc()).date();

    let evolution = stats::monthly_evolution(&txs, today);
    let balances: HashMap<String, f64> = stats::monthly_savings(&txs, today, 0)
        .into_iter()
        .filter_map(|p| p.real.map(|r| (p.label, r)))
        .collect();

    let skip = evolution.len().saturating_sub(months);
    let mut table = Table::new();
    table.set_header(vec!["Month", "Income", "Expenses", "Net", "Balance"]);
    for point in evolution.iter().skip(skip) {
        let net = point.income - point.expenses;
        let net_cell = if net >= 0.0 {
            format_currency(net, &user.currency).green().to_string()
        } else {
            format_currency(net, &user.currency).red().to_string()
        };
        let balance = balances
            .get(&savings_label(&point.month))
            .map(|b| format_currency(*b, &user.currency))
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(&point.month),
            Cell::new(format_currency(point.income, &user.currency)),
            Cell::new(format_currency(point.expenses, &user.currency)),
            Cell::new(net_cell),
            Cell::new(balance),
        ]);
    }

    println!("{} {}", "Report".bold(), user.email);
    if evolution.is_empty() {
        println!("No transactions yet.");
        return Ok(());
    }
    println!("{table}");

    let top = stats::category_breakdown(&txs, 5);
    if !top.is_empty() {
        let mut cats = Table::new();
        cats.set_header(vec!["Category", "Spent"]);
        for share in top {
            cats.add_row(vec![
                Cell::new(share.category),
                Cell::new(format_currency(share.amount, &user.currency)),
            ]);
        }
        println!("Top expenses\n{cats}");
    }
    Ok(())
}
