mod auth;
mod budgets;
mod categories;
mod cli;
mod convert;
mod currency;
mod dates;
mod db;
mod error;
mod fmt;
mod goal_plans;
mod goals;
mod models;
mod ocr;
mod ocr_feedback;
mod recurring;
mod search;
mod server;
mod session;
mod settings;
mod stats;
mod transactions;
mod types;
mod uploads;
mod validate;

use clap::{CommandFactory, Parser};

use cli::{Cli, Commands, GoalsCommands, OcrCommands, RecurringCommands, UsersCommands};

fn main() {
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        let _ = Cli::command().print_help();
        println!();
        return;
    };

    let result = match command {
        Commands::Init { data_dir } => cli::init::run(data_dir),
        Commands::Serve { host, port } => cli::serve::run(host, port),
        Commands::Status => cli::status::run(),
        Commands::Backup { output } => cli::backup::run(output),
        Commands::Users { command } => match command {
            UsersCommands::Add {
                email,
                first_name,
                last_name,
                password_stdin,
            } => cli::users::add(&email, &first_name, &last_name, password_stdin),
            UsersCommands::List => cli::users::list(),
        },
        Commands::Recurring { command } => match command {
            RecurringCommands::Run { user } => cli::plans::run_recurring(user.as_deref()),
        },
        Commands::Goals { command } => match command {
            GoalsCommands::Sweep { user } => cli::plans::sweep(user.as_deref()),
            GoalsCommands::Plans { user } => cli::plans::run_goal_plans(user.as_deref()),
        },
        Commands::Convert { currency, user, yes } => cli::convert::run(&currency, &user, yes),
        Commands::Report { user, months } => cli::report::run(&user, months),
        Commands::Ocr { command } => match command {
            OcrCommands::Analyze { file } => cli::ocr::analyze(&file),
            OcrCommands::Export {
                since,
                days,
                format,
                include_merchant,
                output,
            } => cli::ocr::export(since.as_deref(), days, &format, include_merchant, output.as_deref()),
        },
        Commands::Completions { shell } => cli::completions::run(shell),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
