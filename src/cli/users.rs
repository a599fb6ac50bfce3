use std::io::BufRead;

use comfy_table::{Cell, Table};
use zeroize::Zeroizing;

use crate::auth;
use crate::cli::open_db;
use crate::error::{invalid, Result};

fn read_password(from_stdin: bool) -> Result<Zeroizing<String>> {
    if from_stdin {
        let mut line = Zeroizing::new(String::new());
        std::io::stdin().lock().read_line(&mut *line)?;
        let trimmed = Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string());
        return Ok(trimmed);
    }
    let password = Zeroizing::new(rpassword::prompt_password("Password: ")?);
    let confirm = Zeroizing::new(rpassword::prompt_password("Confirm password: ")?);
    if *password != *confirm {
        return Err(invalid("Passwords do not match"));
    }
    Ok(password)
}

pub fn add(email: &str, first_name: &str, last_name: &str, password_stdin: bool) -> Result<()> {
    let (_, conn) = open_db()?;
    let password = read_password(password_stdin)?;
    let user = auth::register(&conn, email, &password, first_name, last_name)?;
    println!("Added user #{}: {}", user.id, user.email);
    Ok(())
}

pub fn list() -> Result<()> {
    let (_, conn) = open_db()?;
    let users = auth::list_users(&conn)?;

    let mut table = Table::new();
    table.set_header(vec!["ID", "Email", "Name", "Currency", "Created"]);
    for user in users {
        let name = format!("{} {}", user.first_name, user.last_name);
        table.add_row(vec![
            Cell::new(user.id),
            Cell::new(user.email),
            Cell::new(name.trim()),
            Cell::new(user.currency),
            Cell::new(user.created_at.unwrap_or_default()),
        ]);
    }
    println!("Users\n{table}");
    Ok(())
}
