use std::path::PathBuf;

use colored::Colorize;

use crate::db::{init_db, open_from_settings};
use crate::error::Result;
use crate::settings::{load_settings, save_settings, shellexpand_path};

pub fn run(data_dir: Option<String>) -> Result<()> {
    let mut settings = load_settings();
    if let Some(dir) = data_dir {
        std::fs::create_dir_all(&dir)?;
        settings.data_dir = shellexpand_path(&dir);
    }

    let data_dir = PathBuf::from(&settings.data_dir);
    std::fs::create_dir_all(&data_dir)?;
    std::fs::create_dir_all(settings.uploads_dir())?;

    let conn = open_from_settings(&settings)?;
    init_db(&conn)?;
    save_settings(&settings)?;

    println!("{} {}", "Initialized".green().bold(), data_dir.display());
    println!("Database:   {}", settings.db_path().display());
    println!("Serve with `tirelire serve`, create a user with `tirelire users add <email>`.");
    Ok(())
}
