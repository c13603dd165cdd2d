#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::{json, Value};

fn rb_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_rb") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/rb");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "runbook-cli", "--bin", "rb"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build rb binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn temp_path(label: &str, extension: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "rb-contract-{label}-{}.{extension}",
        runbook_core::new_id()
    ))
}

fn cleanup_db(db_path: &Path) {
    let _ = std::fs::remove_file(db_path);
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = db_path.as_os_str().to_owned();
        sidecar.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(sidecar));
    }
}

fn rb_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(rb_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run rb command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "command failed\nstdout={}\nstderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn legacy_fixture() -> Value {
    json!({
        "playbook_index": {"playbook_ids": ["pb1"]},
        "playbook_pb1": {
            "id": "pb1",
            "title": "Database outage",
            "team_id": "team1",
            "create_public_incident": true,
            "member_ids": ["alice"],
            "checklists": [{
                "id": "cl1",
                "title": "Triage",
                "items": [{"id": "it1", "title": "Page on-call", "state": ""}]
            }]
        },
        "run_index": {"run_ids": ["r1", "r2", "missing"]},
        "run_r1": {
            "id": "r1",
            "name": "Primary down",
            "is_active": true,
            "commander_user_id": "alice",
            "team_id": "team1",
            "primary_channel_id": "chan1",
            "created_at": 1000,
            "playbook_id": "pb1",
            "playbook": {
                "id": "pb1",
                "checklists": [{
                    "id": "cl1",
                    "title": "Triage",
                    "items": [{
                        "id": "it1",
                        "title": "Page on-call",
                        "state": "closed",
                        "state_modified": "2021-01-02T03:04:05Z"
                    }]
                }]
            }
        },
        "run_r2": {
            "id": "r2",
            "name": "Replica lag",
            "is_active": false,
            "commander_user_id": "bob",
            "team_id": "team1",
            "primary_channel_id": "chan2",
            "created_at": 2000,
            "ended_at": 3000
        }
    })
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(rb_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["migrate", "runs", "playbooks", "kv"] {
        assert!(
            stdout.contains(required),
            "help output missing subcommand {required}: {stdout}"
        );
    }
}

#[test]
fn migrate_contract_reports_schema_version() {
    let db_path = temp_path("migrate", "sqlite3");

    let output = rb_output(&db_path, &["migrate"]);
    assert_success(&output);
    assert_eq!(stdout_json(&output)["schema_version"], 1);

    let conn = match Connection::open(&db_path) {
        Ok(conn) => conn,
        Err(err) => panic!("failed to reopen database: {err}"),
    };
    let tables: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('runs', 'playbooks', 'run_checklist_items')",
        [],
        |row| row.get(0),
    ) {
        Ok(value) => value,
        Err(err) => panic!("failed to inspect schema: {err}"),
    };
    assert_eq!(tables, 3);
    drop(conn);

    cleanup_db(&db_path);
}

#[test]
fn kv_import_then_migrate_exposes_runs_and_playbooks() {
    let db_path = temp_path("kv", "sqlite3");
    let fixture_path = temp_path("kv-fixture", "json");
    let fixture = match serde_json::to_vec_pretty(&legacy_fixture()) {
        Ok(value) => value,
        Err(err) => panic!("failed to encode fixture: {err}"),
    };
    if let Err(err) = std::fs::write(&fixture_path, fixture) {
        panic!("failed to write fixture: {err}");
    }
    let fixture_arg = fixture_path.to_string_lossy().to_string();

    let imported = rb_output(&db_path, &["kv", "import", "--file", &fixture_arg]);
    assert_success(&imported);
    assert_eq!(stdout_json(&imported)["imported"], 5);

    let report = rb_output(&db_path, &["kv", "migrate"]);
    assert_success(&report);
    let report = stdout_json(&report);
    assert_eq!(report["state"], "committed");
    assert_eq!(report["target_version"], 2);
    assert_eq!(report["playbooks_migrated"], 1);
    assert_eq!(report["runs_migrated"], 2);
    assert_eq!(report["skipped"][0]["key"], "run_missing");

    let again = rb_output(&db_path, &["kv", "migrate"]);
    assert_success(&again);
    assert_eq!(stdout_json(&again)["runs_migrated"], 0);

    let listed = rb_output(
        &db_path,
        &[
            "runs", "list", "--user", "root", "--admin", "--team", "team1", "--sort", "create_at",
        ],
    );
    assert_success(&listed);
    let listed = stdout_json(&listed);
    assert_eq!(listed["total_count"], 2);
    assert_eq!(listed["items"][0]["id"], "r1");
    assert_eq!(listed["items"][0]["current_status"], "InProgress");
    assert_eq!(listed["items"][1]["end_at"], 3000);

    let run = rb_output(&db_path, &["runs", "get", "--id", "r1"]);
    assert_success(&run);
    let run = stdout_json(&run);
    assert_eq!(run["playbook_id"], "pb1");
    assert_eq!(run["checklists"][0]["items"][0]["state"], "closed");
    assert_eq!(
        run["checklists"][0]["items"][0]["state_modified"],
        1_609_556_645_000_i64
    );

    let channel = rb_output(&db_path, &["runs", "channel", "--channel-id", "chan2"]);
    assert_success(&channel);
    assert_eq!(stdout_json(&channel)["run_id"], "r2");

    let playbooks = rb_output(
        &db_path,
        &["playbooks", "list", "--user", "alice", "--team", "team1"],
    );
    assert_success(&playbooks);
    let playbooks = stdout_json(&playbooks);
    assert_eq!(playbooks["total_count"], 1);
    assert_eq!(playbooks["items"][0]["title"], "Database outage");

    cleanup_db(&db_path);
    let _ = std::fs::remove_file(&fixture_path);
}

#[test]
fn failures_exit_non_zero_with_public_message() {
    let db_path = temp_path("errors", "sqlite3");

    let bad_sort = rb_output(
        &db_path,
        &["runs", "list", "--user", "u1", "--sort", "favourite"],
    );
    assert_eq!(bad_sort.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&bad_sort.stderr);
    assert!(
        stderr.contains("unsupported sort parameter 'favourite'"),
        "stderr did not name the sort field: {stderr}"
    );
    assert!(bad_sort.stdout.is_empty());

    let missing = rb_output(&db_path, &["runs", "get", "--id", "nope"]);
    assert_eq!(missing.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&missing.stderr).contains("not found"));

    cleanup_db(&db_path);
}
