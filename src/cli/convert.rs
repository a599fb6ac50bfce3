use colored::Colorize;

use crate::auth;
use crate::cli::open_db;
use crate::convert::{self, Target};
use crate::error::{invalid, Result};

pub fn run(currency: &str, user: &str, yes: bool) -> Result<()> {
    let target = Target::parse(currency)?;
    if !yes {
        return Err(invalid("Conversion rewrites every amount; pass --yes to confirm"));
    }
    let (_, mut conn) = open_db()?;
    let user = auth::require_user(&conn, user)?;
    let report = convert::convert_user(&mut conn, user.id, target)?;

    println!(
        "{} {} rows to {}",
        "Converted".green().bold(),
        report.converted_rows,
        report.converted_to.code()
    );
    if !report.skipped.is_empty() {
        println!("Skipped:    {}", report.skipped.len());
        for s in &report.skipped {
            println!("  #{} {:?}", s.id, s.reason);
        }
    }
    if let Some(warning) = report.warning {
        println!("{} {warning}", "Warning:".yellow().bold());
    }
    Ok(())
}
