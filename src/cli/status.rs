use crate::db::open_from_settings;
use crate::error::Result;
use crate::fmt::format_bytes;
use crate::settings::{load_settings, settings_file_exists};

const COUNTED: &[(&str, &str)] = &[
    ("Users:", "users"),
    ("Transactions:", "transactions"),
    ("Categories:", "categories"),
    ("Goals:", "goals"),
    ("Reached goals:", "reached_goals"),
    ("Goal plans:", "goal_plans"),
    ("Recurring:", "recurring_plans"),
    ("OCR feedback:", "ocr_feedback"),
];

pub fn run() -> Result<()> {
    let settings = load_settings();
    let db_path = settings.db_path();

    println!("Settings:   {}", if settings_file_exists() { "saved" } else { "(defaults)" });
    println!("Data dir:   {}", settings.data_dir);
    println!("Database:   {}", db_path.display());
    println!("Listen:     {}:{}", settings.host, settings.port);
    println!(
        "Runner:     {}",
        if settings.recurring_interval_secs == 0 {
            "disabled".to_string()
        } else {
            format!("every {}s", settings.recurring_interval_secs)
        }
    );
    println!("Encrypted:  {}", if settings.db_key.is_some() { "yes" } else { "no" });

    if db_path.exists() {
        let size = std::fs::metadata(&db_path)?.len();
        println!("DB size:    {}", format_bytes(size));

        let conn = open_from_settings(&settings)?;
        println!();
        for (label, table) in COUNTED {
            let count: i64 = conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |r| r.get(0))?;
            println!("{label:<15}{count}");
        }
    } else {
        println!();
        println!("Database not found. Run `tirelire init` to set up.");
    }

    Ok(())
}
