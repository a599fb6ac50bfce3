use comfy_table::{Cell, Table};

use crate::cli::{open_db, resolve_user};
use crate::error::Result;
use crate::{goal_plans, goals, recurring};

pub fn run_recurring(user: Option<&str>) -> Result<()> {
    let (_, mut conn) = open_db()?;
    let now = chrono::Utc::now().naive_utc();
    let results = match resolve_user(&conn, user)? {
        Some(user_id) => vec![(user_id, recurring::process_for_user(&mut conn, user_id, now)?)],
        None => recurring::process_all(&mut conn, now)?,
    };

    let mut table = Table::new();
    table.set_header(vec!["User", "Plan", "Date", "Amount"]);
    let mut total = 0;
    for (user_id, occurrences) in &results {
        for o in occurrences {
            table.add_row(vec![
                Cell::new(user_id),
                Cell::new(o.plan_id),
                Cell::new(&o.date),
                Cell::new(format!("{:.2}", o.amount)),
            ]);
            total += 1;
        }
    }
    if total == 0 {
        println!("No recurring occurrence due.");
    } else {
        println!("Recurring occurrences\n{table}");
        println!("Created: {total}");
    }
    Ok(())
}

pub fn sweep(user: Option<&str>) -> Result<()> {
    let (_, mut conn) = open_db()?;
    let user_id = resolve_user(&conn, user)?;
    let moved = goals::sweep_all(&mut conn, user_id)?;
    if moved.is_empty() {
        println!("No goal reached.");
    } else {
        let ids: Vec<String> = moved.iter().map(i64::to_string).collect();
        println!("Goals reached: {}", ids.join(", "));
    }
    Ok(())
}

pub fn run_goal_plans(user: Option<&str>) -> Result<()> {
    let (_, mut conn) = open_db()?;
    let now = chrono::Utc::now().naive_utc();
    let users = match resolve_user(&conn, user)? {
        Some(user_id) => vec![user_id],
        None => goal_plans::users_with_active_plans(&conn)?,
    };

    let mut table = Table::new();
    table.set_header(vec!["User", "Plan", "Goal", "Amount", "Transaction"]);
    let mut total = 0;
    for user_id in users {
        for run in goal_plans::run_plans(&mut conn, user_id, now)? {
            table.add_row(vec![
                Cell::new(user_id),
                Cell::new(run.plan_id),
                Cell::new(run.goal_id),
                Cell::new(format!("{:.2}", run.amount)),
                Cell::new(run.transaction_id),
            ]);
            total += 1;
        }
    }
    if total == 0 {
        println!("No goal plan due.");
    } else {
        println!("Goal plans\n{table}");
    }
    Ok(())
}
