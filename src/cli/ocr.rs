use std::fs::File;
use std::io::Write;

use comfy_table::{Cell, Table};

use crate::cli::open_db;
use crate::dates;
use crate::error::{invalid, Result};
use crate::ocr::{self, Decision, ReceiptInput};
use crate::ocr_feedback;

fn decision_label(decision: Decision) -> &'static str {
    match decision {
        Decision::AutoApply => "auto_apply",
        Decision::Confirm => "confirm",
        Decision::Manual => "manual",
    }
}

pub fn analyze(file: &str) -> Result<()> {
    let text = std::fs::read_to_string(file)?;
    if text.trim().is_empty() {
        return Err(invalid("Texte manquant"));
    }
    let input = ReceiptInput { text, ..ReceiptInput::default() };
    let today = dates::utc_to_paris(chrono::Utc::now().naive_utc()).date();
    let analysis = ocr::analyze_receipt(&input, today);

    println!("Merchant:   {}", if analysis.merchant.is_empty() { "(unknown)" } else { &analysis.merchant });
    println!("Date:       {}", analysis.date.as_deref().unwrap_or("(none)"));
    println!("Time:       {}", analysis.time.as_deref().unwrap_or("(none)"));
    println!("Date score: {}", analysis.date_score100);
    println!("Decision:   {}", decision_label(analysis.decision));

    let mut table = Table::new();
    table.set_header(vec!["Raw", "Value", "Score"]);
    for c in &analysis.candidates {
        table.add_row(vec![Cell::new(&c.raw), Cell::new(format!("{:.2}", c.value)), Cell::new(c.score100)]);
    }
    println!("Candidates\n{table}");
    Ok(())
}

pub fn export(
    since: Option<&str>,
    days: Option<i64>,
    format: &str,
    include_merchant: bool,
    output: Option<&str>,
) -> Result<()> {
    if format != "jsonl" && format != "csv" {
        return Err(invalid("Format must be jsonl or csv"));
    }
    let (_, conn) = open_db()?;
    let start = ocr_feedback::export_since(since, days, chrono::Utc::now().naive_utc())?;
    let entries = ocr_feedback::export(&conn, start, include_merchant)?;

    let mut out: Box<dyn Write> = match output {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(std::io::stdout().lock()),
    };
    if format == "csv" {
        ocr_feedback::write_csv(&mut out, &entries)?;
    } else {
        ocr_feedback::write_jsonl(&mut out, &entries)?;
    }
    out.flush()?;
    if let Some(path) = output {
        eprintln!("Exported {} entries to {path}", entries.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_label() {
        assert_eq!(decision_label(Decision::from_score(Some(100))), "auto_apply");
        assert_eq!(decision_label(Decision::from_score(None)), "manual");
    }
}
