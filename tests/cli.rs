use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

struct Env {
    config: TempDir,
    data: TempDir,
}

impl Env {
    fn new() -> Self {
        Self {
            config: TempDir::new().unwrap(),
            data: TempDir::new().unwrap(),
        }
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("tirelire").unwrap();
        cmd.env("TIRELIRE_CONFIG_DIR", self.config.path())
            .env("HOME", self.config.path())
            .env_remove("TIRELIRE_CRON_SECRET");
        cmd
    }

    fn init(&self) {
        self.cmd()
            .args(["init", "--data-dir"])
            .arg(self.data.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized"));
    }
}

#[test]
fn test_no_command_prints_help() {
    let env = Env::new();
    env.cmd()
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage"));
}

#[test]
fn test_status_before_and_after_init() {
    let env = Env::new();
    env.cmd()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Database not found"));

    env.init();
    assert!(env.config.path().join("settings.json").exists());
    assert!(env.data.path().join("tirelire.db").exists());
    env.cmd()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Users:"))
        .stdout(predicate::str::contains("DB size:"));
}

#[test]
fn test_commands_need_a_database() {
    let env = Env::new();
    env.cmd()
        .args(["users", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_users_add_and_list() {
    let env = Env::new();
    env.init();
    env.cmd()
        .args(["users", "add", "Awa@Exemple.fr", "--first-name", "Awa", "--password-stdin"])
        .write_stdin("motdepasse1\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("awa@exemple.fr"));

    env.cmd()
        .args(["users", "add", "awa@exemple.fr", "--password-stdin"])
        .write_stdin("motdepasse1\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Email déjà utilisé"));

    env.cmd()
        .args(["users", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("awa@exemple.fr"))
        .stdout(predicate::str::contains("EUR"));
}

#[test]
fn test_convert_requires_confirmation() {
    let env = Env::new();
    env.init();
    env.cmd()
        .args(["convert", "XOF", "--user", "personne@exemple.fr"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--yes"));
    env.cmd()
        .args(["convert", "USD", "--user", "personne@exemple.fr", "--yes"])
        .assert()
        .failure();
}

#[test]
fn test_background_jobs_with_nothing_due() {
    let env = Env::new();
    env.init();
    env.cmd()
        .args(["recurring", "run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No recurring occurrence due."));
    env.cmd()
        .args(["goals", "sweep"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No goal reached."));
    env.cmd()
        .args(["goals", "plans", "--user", "inconnu@exemple.fr"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown user"));
}

#[test]
fn test_backup_to_explicit_path() {
    let env = Env::new();
    env.init();
    let dest = env.data.path().join("copie.db");
    env.cmd()
        .arg("backup")
        .arg("--output")
        .arg(&dest)
        .assert()
        .success()
        .stdout(predicate::str::contains("Backup saved to"));
    assert!(dest.exists());
}

#[test]
fn test_ocr_analyze_text_file() {
    let env = Env::new();
    let receipt = env.data.path().join("ticket.txt");
    std::fs::write(
        &receipt,
        "CARREFOUR MARKET\n12 rue de la Paix\nDate: 14/03/2024 17h29\nPain 1,20\nTOTAL TTC 12,50 €\nCB 12,50\n",
    )
    .unwrap();
    env.cmd()
        .args(["ocr", "analyze"])
        .arg(&receipt)
        .assert()
        .success()
        .stdout(predicate::str::contains("CARREFOUR MARKET"))
        .stdout(predicate::str::contains("2024-03-14"))
        .stdout(predicate::str::contains("12.50"));
}

#[test]
fn test_ocr_export_empty_csv() {
    let env = Env::new();
    env.init();
    env.cmd()
        .args(["ocr", "export", "--format", "csv", "--days", "7"])
        .assert()
        .success()
        .stdout(predicate::str::contains("receipt_text_hash"));
    env.cmd()
        .args(["ocr", "export", "--format", "xml"])
        .assert()
        .failure();
}

#[test]
fn test_completions() {
    let env = Env::new();
    env.cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("tirelire"));
}
