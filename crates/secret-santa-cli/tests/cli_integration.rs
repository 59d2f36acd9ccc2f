use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn santa_command(db: &Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_santa"));
    command
        .env_remove("SANTA_CONFIG")
        .env_remove("SANTA_MAX_PLACEMENTS")
        .env_remove("SANTA_CALLER_EMAIL")
        .env_remove("RUST_LOG")
        .arg("--db")
        .arg(db);
    command
}

fn run_santa<I, S>(db: &Path, args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    santa_command(db)
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute santa binary: {err}"))
}

fn parse_stdout(output: &Output) -> Value {
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "santa command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_json<I, S>(db: &Path, args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    parse_stdout(&run_santa(db, args))
}

fn run_failure<I, S>(db: &Path, args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_santa(db, args);
    assert!(
        !output.status.success(),
        "santa command unexpectedly succeeded:\n{}",
        String::from_utf8_lossy(&output.stdout)
    );
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_roster(dir: &Path, name: &str, roster: &Value) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, roster.to_string())
        .unwrap_or_else(|err| panic!("failed to write roster {}: {err}", path.display()));
    path
}

fn add_participant(db: &Path, id: &str, extra: &[&str]) {
    let mut args = vec!["participant", "add", "--id", id, "--name", id];
    args.extend_from_slice(extra);
    let added = run_json(db, args);
    assert_eq!(added.get("id").and_then(Value::as_str), Some(id));
}

#[test]
fn db_commands_report_versioned_contract() {
    let dir = unique_temp_dir("santa-cli-db");
    let db = dir.join("santa.sqlite3");

    let dry_run = run_json(&db, ["db", "migrate", "--dry-run"]);
    assert_eq!(dry_run.get("contract_version").and_then(Value::as_str), Some("cli.v1"));
    assert_eq!(dry_run.get("would_apply_versions"), Some(&serde_json::json!([1])));

    let migrated = run_json(&db, ["db", "migrate"]);
    assert_eq!(as_i64(&migrated, "after_version"), 1);

    let status = run_json(&db, ["db", "schema-version"]);
    assert_eq!(status.get("up_to_date").and_then(Value::as_bool), Some(true));

    let backup = dir.join("backups/santa-backup.sqlite3");
    let backed_up = run_json(&db, ["db", "backup", "--out", path_str(&backup)]);
    assert!(backed_up.get("backup_path").is_some());
    assert!(backup.exists());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn info_logs_go_to_stderr_and_leave_json_output_intact() {
    let dir = unique_temp_dir("santa-cli-logs");
    let db = dir.join("santa.sqlite3");
    let backup = dir.join("santa-backup.sqlite3");

    let output = santa_command(&db)
        .args(["--log-level", "info", "db", "backup", "--out", path_str(&backup)])
        .output()
        .unwrap_or_else(|err| panic!("failed to execute santa binary: {err}"));

    let payload = parse_stdout(&output);
    assert!(payload.get("backup_path").is_some());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("database backup written"), "stderr: {stderr}");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn pairing_flow_runs_once_and_reveals_giftees() {
    let dir = unique_temp_dir("santa-cli-flow");
    let db = dir.join("santa.sqlite3");

    add_participant(&db, "admin", &["--admin"]);
    add_participant(&db, "john", &["--conflict", "mary", "--wishlist", "Books"]);
    add_participant(&db, "mary", &[]);
    add_participant(&db, "paul", &[]);
    add_participant(&db, "ringo", &[]);

    let denied = run_failure(&db, ["--as", "john@example.test", "pair", "run"]);
    assert!(denied.contains("PERMISSION_DENIED"), "stderr: {denied}");

    let result = run_json(&db, ["--as", "admin@example.test", "pair", "run"]);
    assert_eq!(as_i64(&result, "pairings_count"), 4);
    let warnings = result.get("warnings").and_then(Value::as_array).map_or(0, Vec::len);
    assert_eq!(warnings, 1);

    let status = run_json(&db, ["pair", "status"]);
    assert_eq!(status.get("locked").and_then(Value::as_bool), Some(true));
    assert_eq!(as_i64(&status, "paired_count"), 4);

    let giftee = run_json(&db, ["--as", "mary@example.test", "pair", "giftee"]);
    let giftee_id = giftee
        .get("giftee")
        .and_then(|g| g.get("id"))
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("mary should have a giftee: {giftee}"));
    assert_ne!(giftee_id, "mary");
    assert_ne!(giftee_id, "john");

    let again = run_failure(&db, ["--as", "admin@example.test", "pair", "run"]);
    assert!(again.contains("Pairing already completed"), "stderr: {again}");

    let listed = run_json(&db, ["participant", "list"]);
    assert!(!listed.to_string().contains("giftee_id"));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn preview_from_file_is_reproducible_with_a_seed() {
    let dir = unique_temp_dir("santa-cli-preview");
    let db = dir.join("santa.sqlite3");
    let roster = write_roster(
        &dir,
        "roster.json",
        &serde_json::json!([
            {"id": "a", "name": "A", "conflicts": ["b"]},
            {"id": "b", "name": "B", "conflicts": "not-a-list"},
            {"id": "c", "name": "C"},
            {"id": "d", "name": "D", "conflicts": [null, "c"]},
            {"id": "e"}
        ]),
    );

    let first = run_json(&db, ["pair", "preview", "--in", path_str(&roster), "--seed", "7"]);
    let second = run_json(&db, ["pair", "preview", "--in", path_str(&roster), "--seed", "7"]);

    assert_eq!(first.get("assignment"), second.get("assignment"));
    let assignment = first
        .get("assignment")
        .and_then(Value::as_object)
        .unwrap_or_else(|| panic!("assignment should be an object: {first}"));
    assert_eq!(assignment.len(), 5);
    assert_ne!(assignment.get("a").and_then(Value::as_str), Some("b"));
    assert_ne!(assignment.get("b").and_then(Value::as_str), Some("a"));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn preview_failures_carry_their_failure_kind() {
    let dir = unique_temp_dir("santa-cli-failures");
    let db = dir.join("santa.sqlite3");
    let infeasible = write_roster(
        &dir,
        "infeasible.json",
        &serde_json::json!([
            {"id": "a", "name": "A", "conflicts": ["b", "c"]},
            {"id": "b", "name": "B"},
            {"id": "c", "name": "C"}
        ]),
    );
    let free = write_roster(
        &dir,
        "free.json",
        &serde_json::json!([
            {"id": "a"}, {"id": "b"}, {"id": "c"}, {"id": "d"}, {"id": "e"}
        ]),
    );

    let stderr = run_failure(&db, ["pair", "preview", "--in", path_str(&infeasible)]);
    assert!(stderr.contains("INFEASIBLE_CONSTRAINTS"), "stderr: {stderr}");

    let output = santa_command(&db)
        .env("SANTA_MAX_PLACEMENTS", "1")
        .args(["pair", "preview", "--in", path_str(&free)])
        .output()
        .unwrap_or_else(|err| panic!("failed to execute santa binary: {err}"));
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("SEARCH_EXHAUSTED"));

    let config = dir.join("santa.yaml");
    fs::write(&config, "search:\n  max_placements: 0\n")
        .unwrap_or_else(|err| panic!("failed to write config: {err}"));
    let stderr = run_failure(&db, ["--config", path_str(&config), "pair", "status"]);
    assert!(stderr.contains("max_placements"), "stderr: {stderr}");

    let _ = fs::remove_dir_all(&dir);
}
