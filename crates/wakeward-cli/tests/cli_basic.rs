//! Basic CLI E2E tests.
//!
//! Each test runs the built binary against its own HOME so the store and
//! config live in a throwaway directory.

use std::path::Path;
use std::process::Command;

use chrono::{Duration, Utc};
use serde_json::Value;
use tempfile::TempDir;
use wakeward_core::{Database, HeartbeatLedger, ProofContext, Session};

/// Run a CLI command and return (exit code, stdout, stderr).
fn run_cli(home: &Path, args: &[&str]) -> (i32, String, String) {
    let output = Command::new(env!("CARGO_BIN_EXE_wakeward-cli"))
        .args(args)
        .env("HOME", home)
        .env("WAKEWARD_ENV", "dev")
        .env_remove("WAKEWARD_LOG")
        .output()
        .expect("Failed to execute CLI command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    (code, stdout, stderr)
}

fn json(stdout: &str) -> Value {
    serde_json::from_str(stdout).expect("stdout is JSON")
}

fn db_path(home: &Path) -> std::path::PathBuf {
    home.join(".config").join("wakeward-dev").join("wakeward.db")
}

#[test]
fn test_alarm_add_and_list() {
    let home = TempDir::new().unwrap();
    let (code, stdout, stderr) = run_cli(
        home.path(),
        &["alarm", "add", "Gym", "--id", "gym", "--time", "06:30", "--days", "weekdays"],
    );
    assert_eq!(code, 0, "alarm add failed: {stderr}");
    assert_eq!(json(&stdout)["id"], "gym");

    let (code, stdout, _) = run_cli(home.path(), &["alarm", "list"]);
    assert_eq!(code, 0);
    let alarms = json(&stdout);
    assert_eq!(alarms.as_array().unwrap().len(), 1);
    assert_eq!(alarms[0]["label"], "Gym");
}

#[test]
fn test_alarm_add_rejects_bad_channel() {
    let home = TempDir::new().unwrap();
    let (code, _, stderr) = run_cli(
        home.path(),
        &["alarm", "add", "Gym", "--time", "06:30", "--channel", "carrier_pigeon=x"],
    );
    assert_eq!(code, 1);
    assert!(stderr.contains("error:"));
}

#[test]
fn test_alarm_disable_and_remove() {
    let home = TempDir::new().unwrap();
    run_cli(home.path(), &["alarm", "add", "Nap", "--id", "nap", "--time", "14:00"]);

    let (code, stdout, _) = run_cli(home.path(), &["alarm", "disable", "nap"]);
    assert_eq!(code, 0);
    assert_eq!(json(&stdout)["enabled"], false);

    let (code, _, _) = run_cli(home.path(), &["alarm", "remove", "nap"]);
    assert_eq!(code, 0);
    let (code, _, _) = run_cli(home.path(), &["alarm", "remove", "nap"]);
    assert_eq!(code, 1);
}

#[test]
fn test_next_lists_enabled_alarms_only() {
    let home = TempDir::new().unwrap();
    run_cli(home.path(), &["alarm", "add", "On", "--id", "on", "--time", "07:00", "--days", "daily"]);
    run_cli(home.path(), &["alarm", "add", "Off", "--id", "off", "--time", "08:00", "--disabled"]);

    let (code, stdout, _) = run_cli(home.path(), &["next"]);
    assert_eq!(code, 0);
    let next = json(&stdout);
    let entries = next.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["alarm_id"], "on");
    assert!(entries[0]["session_id"].as_str().unwrap().starts_with("sess-"));
}

#[test]
fn test_config_get_set() {
    let home = TempDir::new().unwrap();
    let (code, stdout, _) = run_cli(home.path(), &["config", "get", "stale_threshold_secs"]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "30");

    let (code, _, _) = run_cli(home.path(), &["config", "set", "stale_threshold_secs", "45"]);
    assert_eq!(code, 0);
    let (_, stdout, _) = run_cli(home.path(), &["config", "get", "stale_threshold_secs"]);
    assert_eq!(stdout.trim(), "45");

    // Must stay above the heartbeat interval.
    let (code, _, _) = run_cli(home.path(), &["config", "set", "stale_threshold_secs", "5"]);
    assert_eq!(code, 1);
}

#[test]
fn test_ledger_show_empty() {
    let home = TempDir::new().unwrap();
    let (code, stdout, _) = run_cli(home.path(), &["ledger", "show"]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "null");
}

#[test]
fn test_reconcile_stale_record() {
    let home = TempDir::new().unwrap();
    // First run creates the data directory and schema.
    run_cli(home.path(), &["ledger", "show"]);

    {
        let db = Database::open_at(&db_path(home.path())).unwrap();
        let ledger = HeartbeatLedger::new(std::sync::Arc::new(db));
        let fired = Utc::now() - Duration::minutes(5);
        let session = Session::new("gym", "Gym", fired, fired, 0);
        let proof = ProofContext::new(session.id.clone(), "gym", None);
        ledger.begin_session(&session, proof, fired).unwrap();
    }

    let (code, stdout, _) = run_cli(home.path(), &["reconcile"]);
    assert_eq!(code, 0);
    let report = json(&stdout);
    assert_eq!(report["outcome"]["outcome"], "interrupted");

    // Read-only mode leaves the record in place.
    let (_, stdout, _) = run_cli(home.path(), &["ledger", "show"]);
    assert_ne!(stdout.trim(), "null");

    let (code, stdout, stderr) = run_cli(home.path(), &["reconcile", "--apply"]);
    assert_eq!(code, 0, "reconcile --apply failed: {stderr}");
    let applied = json(&stdout);
    assert!(applied["events"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e["type"] == "PunishmentDispatched"));

    let (_, stdout, _) = run_cli(home.path(), &["ledger", "show"]);
    assert_eq!(stdout.trim(), "null");
}

#[test]
fn test_ledger_clear_refuses_live_record() {
    let home = TempDir::new().unwrap();
    run_cli(home.path(), &["ledger", "show"]);

    {
        let db = Database::open_at(&db_path(home.path())).unwrap();
        let ledger = HeartbeatLedger::new(std::sync::Arc::new(db));
        let fired = Utc::now();
        let session = Session::new("gym", "Gym", fired, fired, 0);
        let proof = ProofContext::new(session.id.clone(), "gym", None);
        ledger.begin_session(&session, proof, fired).unwrap();
    }

    let (code, _, stderr) = run_cli(home.path(), &["ledger", "clear"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("--force"), "unexpected stderr: {stderr}");
    let (_, stdout, _) = run_cli(home.path(), &["ledger", "show"]);
    assert_ne!(stdout.trim(), "null");

    let (code, _, stderr) = run_cli(home.path(), &["ledger", "clear", "--force"]);
    assert_eq!(code, 0, "ledger clear --force failed: {stderr}");
    let (_, stdout, _) = run_cli(home.path(), &["ledger", "show"]);
    assert_eq!(stdout.trim(), "null");
}
