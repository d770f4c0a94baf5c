//! End-to-end CLI tests for repolens.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

fn repolens() -> Command {
    let mut cmd = cargo_bin_cmd!("repolens");
    cmd.env_remove("REPOLENS_OWNER").env_remove("RUST_LOG");
    cmd
}

mod cli_basics {
    use super::*;

    #[test]
    fn shows_help() {
        repolens()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("repolens"))
            .stdout(predicate::str::contains("analyze"))
            .stdout(predicate::str::contains("selections"));
    }

    #[test]
    fn shows_version() {
        repolens()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn analyze_help_mentions_force() {
        repolens()
            .args(["analyze", "--help"])
            .assert()
            .success()
            .stdout(predicate::str::contains("--force"));
    }

    #[test]
    fn save_requires_ids() {
        repolens()
            .args(["--owner", "alice", "save"])
            .assert()
            .failure();
    }
}

mod local_store {
    use super::*;

    #[test]
    fn owner_is_required() {
        let data = TempDir::new().unwrap();
        repolens()
            .arg("--data-dir")
            .arg(data.path())
            .arg("selections")
            .assert()
            .failure()
            .stderr(predicate::str::contains("--owner"));
    }

    #[test]
    fn empty_store_lists_no_selections() {
        let data = TempDir::new().unwrap();
        repolens()
            .arg("--data-dir")
            .arg(data.path())
            .args(["--owner", "alice", "selections"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[]"));
    }

    #[test]
    fn unknown_selection_reports_public_message() {
        let data = TempDir::new().unwrap();
        repolens()
            .arg("--data-dir")
            .arg(data.path())
            .args(["--owner", "alice", "status", "no-such-selection"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"))
            .stderr(predicate::str::contains("no-such-selection").not());
    }

    #[test]
    fn missing_config_file_is_reported() {
        let data = TempDir::new().unwrap();
        repolens()
            .arg("--config")
            .arg(data.path().join("absent.toml"))
            .args(["--owner", "alice", "selections"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("config file not found"));
    }
}
