//! Integration tests for the reconflow binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// A reconflow command isolated from the user's config, `.env` and installed tools.
fn reconflow(home: &Path) -> Command {
    let empty_path = home.join("bin");
    fs::create_dir_all(&empty_path).unwrap();
    let mut cmd = cargo_bin_cmd!("reconflow");
    cmd.current_dir(home)
        .env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"))
        .env("PATH", &empty_path)
        .env_remove("RUST_LOG")
        .env_remove("RECONFLOW_CONCURRENCY")
        .env_remove("RECONFLOW_RATE_LIMIT")
        .env_remove("RECONFLOW_DELAY")
        .env_remove("RECONFLOW_TIMEOUT");
    cmd
}

/// Checkpoint with recon through crawl complete, next phase secrets.
fn write_checkpoint(workspace: &Path) {
    fs::create_dir_all(workspace).unwrap();
    let content = format!(
        r#"{{
  "schema_version": 1,
  "session_id": "6f1c1c8e-3b0a-4c36-9a55-0d6f0f5f3a11",
  "target": "example.com",
  "workspace": "{}",
  "current_phase": "secrets",
  "started_at": "2026-10-18T08:00:00Z",
  "saved_at": "2026-10-18T08:42:00Z",
  "mode": "conservative",
  "defense": {{ "escalated": true, "provider": "Cloudflare" }},
  "completed_phases": ["recon", "takeover-check", "crawl"],
  "skipped_phases": ["port-scan"],
  "failed_phases": [],
  "budget": {{ "max_concurrency": 2, "rate_limit": 30, "period_secs": 60,
              "delay_secs": 4, "timeout_secs": 900 }}
}}"#,
        workspace.display()
    );
    fs::write(workspace.join("checkpoint.json"), content).unwrap();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let home = TempDir::new().unwrap();
        reconflow(home.path())
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("resume"));
    }

    #[test]
    fn test_version() {
        let home = TempDir::new().unwrap();
        reconflow(home.path()).arg("--version").assert().success();
    }

    #[test]
    fn test_phases_lists_canonical_order() {
        let home = TempDir::new().unwrap();
        let output = reconflow(home.path()).arg("phases").assert().success();
        let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();

        let positions: Vec<usize> = [
            "recon",
            "takeover-check",
            "port-scan",
            "crawl",
            "secrets",
            "fuzz",
            "screenshot",
            "cloud",
            "leak-search",
            "vulnerability-scan",
        ]
        .iter()
        .map(|name| stdout.find(&format!(" {} ", name)).unwrap())
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_unknown_skip_phase_is_rejected() {
        let home = TempDir::new().unwrap();
        reconflow(home.path())
            .args(["run", "example.com", "--skip", "nmap", "--no-probe"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown phase"));
    }

    #[test]
    fn test_invalid_target_is_rejected() {
        let home = TempDir::new().unwrap();
        reconflow(home.path())
            .args(["run", "https://example.com", "--no-probe"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid target"));
    }
}

// =============================================================================
// Config Command Tests
// =============================================================================

mod config_commands {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let home = TempDir::new().unwrap();
        reconflow(home.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using built-in defaults"))
            .stdout(predicate::str::contains("vulnerability-scan"));
    }

    #[test]
    fn test_config_init_creates_toml() {
        let home = TempDir::new().unwrap();
        let dir = home.path().join("conf");
        reconflow(home.path())
            .args(["config", "init", "--dir"])
            .arg(&dir)
            .assert()
            .success()
            .stdout(predicate::str::contains("Created reconflow.toml"));

        assert!(dir.join("reconflow.toml").exists());

        reconflow(home.path())
            .args(["config", "validate", "--config"])
            .arg(dir.join("reconflow.toml"))
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_config_validate_reports_problems() {
        let home = TempDir::new().unwrap();
        fs::write(
            home.path().join("reconflow.toml"),
            "[budgets.conservative]\nmax_concurrency = 0\n",
        )
        .unwrap();

        reconflow(home.path())
            .args(["config", "validate"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("max_concurrency"));
    }
}

// =============================================================================
// Session Command Tests
// =============================================================================

mod session_commands {
    use super::*;

    #[test]
    fn test_status_on_checkpoint() {
        let home = TempDir::new().unwrap();
        let ws = home.path().join("example.com");
        write_checkpoint(&ws);

        reconflow(home.path())
            .arg("status")
            .arg(&ws)
            .assert()
            .success()
            .stdout(predicate::str::contains("example.com"))
            .stdout(predicate::str::contains("Cloudflare"))
            .stdout(predicate::str::contains("Next phase: secrets"));
    }

    #[test]
    fn test_resume_missing_checkpoint_fails() {
        let home = TempDir::new().unwrap();
        reconflow(home.path())
            .arg("resume")
            .arg(home.path().join("nowhere"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("Checkpoint I/O failed"));
    }

    #[test]
    fn test_resume_corrupt_checkpoint_fails() {
        let home = TempDir::new().unwrap();
        let ws = home.path().join("example.com");
        fs::create_dir_all(&ws).unwrap();
        fs::write(ws.join("checkpoint.json"), "{ not json").unwrap();

        reconflow(home.path())
            .arg("resume")
            .arg(&ws)
            .assert()
            .failure()
            .stderr(predicate::str::contains("corrupt"));
    }

    #[test]
    fn test_invalid_env_override_fails() {
        let home = TempDir::new().unwrap();
        reconflow(home.path())
            .env("RECONFLOW_CONCURRENCY", "lots")
            .args(["run", "example.com", "--no-probe"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("RECONFLOW_CONCURRENCY"));
    }

    #[test]
    fn test_run_without_tools_skips_every_phase() {
        let home = TempDir::new().unwrap();
        let ws = home.path().join("ws");

        reconflow(home.path())
            .args(["run", "example.com", "--no-probe", "--workspace"])
            .arg(&ws)
            .assert()
            .success()
            .stdout(predicate::str::contains("not installed"));

        let checkpoint = fs::read_to_string(ws.join("checkpoint.json")).unwrap();
        assert!(checkpoint.contains("\"current_phase\": \"done\""));
        assert!(ws.join("events.jsonl").exists());
        assert!(ws.join("logs").join("reconflow.log").exists());

        reconflow(home.path())
            .arg("status")
            .arg(&ws)
            .assert()
            .success()
            .stdout(predicate::str::contains("Session finished"));

        reconflow(home.path())
            .arg("resume")
            .arg(&ws)
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing to resume"));
    }

    #[test]
    fn test_run_refuses_existing_checkpoint() {
        let home = TempDir::new().unwrap();
        let ws = home.path().join("example.com");
        write_checkpoint(&ws);

        reconflow(home.path())
            .args(["run", "example.com", "--no-probe", "--workspace"])
            .arg(&ws)
            .assert()
            .failure()
            .stderr(predicate::str::contains("reconflow resume"));
    }
}
