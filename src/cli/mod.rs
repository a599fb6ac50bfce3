pub mod backup;
pub mod completions;
pub mod convert;
pub mod init;
pub mod ocr;
pub mod plans;
pub mod report;
pub mod serve;
pub mod status;
pub mod users;

use clap::{Parser, Subcommand};
use rusqlite::Connection;

use crate::auth;
use crate::db::open_from_settings;
use crate::error::{Result, TirelireError};
use crate::settings::{load_settings, Settings};

/// Settings plus an open connection, failing when `init` has not run yet.
pub(crate) fn open_db() -> Result<(Settings, Connection)> {
    let settings = load_settings();
    if !settings.db_path().exists() {
        return Err(TirelireError::Settings(
            "database not found, run `tirelire init` first".to_string(),
        ));
    }
    let conn = open_from_settings(&settings)?;
    Ok((settings, conn))
}

pub(crate) fn resolve_user(conn: &Connection, email: Option<&str>) -> Result<Option<i64>> {
    match email {
        Some(email) => Ok(Some(auth::require_user(conn, email)?.id)),
        None => Ok(None),
    }
}

#[derive(Parser)]
#[command(name = "tirelire", version, about = "Personal finance API: transactions, budgets, savings goals.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write settings, create the data directory and seed the database.
    Init {
        /// Path for Tirelire data (default: ~/.local/share/tirelire)
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },
    /// Run the HTTP API.
    Serve {
        /// Address to bind (default from settings)
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (default from settings)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Show settings, database size and row counts.
    Status,
    /// Back up the database.
    Backup {
        /// Output path (default: <data_dir>/backups/tirelire-YYYYMMDD-HHMMSS.db)
        #[arg(long)]
        output: Option<String>,
    },
    /// Manage users.
    Users {
        #[command(subcommand)]
        command: UsersCommands,
    },
    /// Recurring payment plans.
    Recurring {
        #[command(subcommand)]
        command: RecurringCommands,
    },
    /// Savings goals.
    Goals {
        #[command(subcommand)]
        command: GoalsCommands,
    },
    /// Convert every amount of a user to another currency.
    Convert {
        /// Target currency: EUR or XOF
        currency: String,
        /// User email
        #[arg(long)]
        user: String,
        /// Confirm the conversion
        #[arg(long)]
        yes: bool,
    },
    /// Monthly income, expenses and savings for a user.
    Report {
        /// User email
        #[arg(long)]
        user: String,
        /// Number of months to show
        #[arg(long, default_value = "6")]
        months: usize,
    },
    /// Receipt scoring and feedback export.
    Ocr {
        #[command(subcommand)]
        command: OcrCommands,
    },
    /// Print shell completions.
    Completions {
        /// Shell: bash, zsh, fish, elvish, powershell
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
pub enum UsersCommands {
    /// Create a user. The password is prompted for.
    Add {
        email: String,
        #[arg(long = "first-name", default_value = "")]
        first_name: String,
        #[arg(long = "last-name", default_value = "")]
        last_name: String,
        /// Read the password from the first line of stdin instead of prompting
        #[arg(long = "password-stdin")]
        password_stdin: bool,
    },
    /// List all users.
    List,
}

#[derive(Subcommand)]
pub enum RecurringCommands {
    /// Materialize due recurring occurrences.
    Run {
        /// Only this user (email)
        #[arg(long)]
        user: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum GoalsCommands {
    /// Close every goal whose subcategory balance reached its target.
    Sweep {
        /// Only this user (email)
        #[arg(long)]
        user: Option<String>,
    },
    /// Execute due monthly goal plans.
    Plans {
        /// Only this user (email)
        #[arg(long)]
        user: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum OcrCommands {
    /// Score a receipt text file and print the amount candidates.
    Analyze {
        /// Path to a text file holding the recognized receipt text
        file: String,
    },
    /// Export redacted OCR feedback.
    Export {
        /// Start of the window (YYYY-MM-DD or YYYY-MM-DD HH:MM:SS)
        #[arg(long)]
        since: Option<String>,
        /// Window length in days when --since is not given
        #[arg(long)]
        days: Option<i64>,
        /// Output format: jsonl or csv
        #[arg(long, default_value = "jsonl")]
        format: String,
        /// Keep merchant names in the export
        #[arg(long = "include-merchant")]
        include_merchant: bool,
        /// Output file (default: stdout)
        #[arg(long)]
        output: Option<String>,
    },
}
