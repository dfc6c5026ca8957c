use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::{tempdir, TempDir};

fn tierguard(data_dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("tierguard").unwrap();
    cmd.env("TIERGUARD_DATA_DIR", data_dir);
    cmd.env_remove("RUST_LOG");
    cmd
}

fn json_stdout(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

struct Workspace {
    _root: TempDir,
    data: std::path::PathBuf,
    files: std::path::PathBuf,
}

fn workspace() -> Workspace {
    let root = tempdir().unwrap();
    let data = root.path().join("data");
    let files = root.path().join("files");
    fs::create_dir_all(&data).unwrap();
    fs::create_dir_all(&files).unwrap();
    Workspace {
        _root: root,
        data,
        files,
    }
}

#[test]
fn levels_prints_table() {
    let ws = workspace();
    tierguard(&ws.data)
        .arg("levels")
        .assert()
        .success()
        .stdout(predicate::str::contains("absolute"))
        .stdout(predicate::str::contains("confirm_backup"));
}

#[test]
fn levels_json_lists_five_classes_strictest_first() {
    let ws = workspace();
    let output = tierguard(&ws.data).args(["levels", "--json"]).output().unwrap();
    assert!(output.status.success());
    let rows = json_stdout(&output);
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[0]["class"], "absolute");
    assert_eq!(rows[4]["class"], "none");
}

#[test]
fn check_denied_exits_one() {
    let ws = workspace();
    let target = ws.files.join("RULES[超重要L10].md");
    let output = tierguard(&ws.data)
        .arg("check")
        .arg(&target)
        .arg("delete")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let decision = json_stdout(&output);
    assert_eq!(decision["allowed"], false);
    assert_eq!(decision["level"], 10);
    assert_eq!(decision["policyClass"], "absolute");
}

#[test]
fn check_defaults_to_delete_and_honours_flags() {
    let ws = workspace();
    let target = ws.files.join("NOTES[重要L7].md");
    tierguard(&ws.data).arg("check").arg(&target).assert().code(1);
    tierguard(&ws.data)
        .arg("check")
        .arg(&target)
        .args(["--confirmed", "--backup-created"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"allowed\": true"));
}

#[test]
fn check_is_audited() {
    let ws = workspace();
    let target = ws.files.join("plain.txt");
    tierguard(&ws.data)
        .arg("check")
        .arg(&target)
        .arg("read")
        .assert()
        .success();

    let output = tierguard(&ws.data).args(["audit", "--limit", "5"]).output().unwrap();
    assert!(output.status.success());
    let entries = json_stdout(&output);
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["record"]["operation"], "read");
}

#[test]
fn no_audit_logs_decisions_to_stderr() {
    let ws = workspace();
    tierguard(&ws.data)
        .args(["--no-audit", "check"])
        .arg(ws.files.join("plain.txt"))
        .assert()
        .success()
        .stderr(predicate::str::contains("decision"))
        .stderr(predicate::str::contains("plain.txt"));
    assert!(!ws.data.join("logs/audit.log").exists());
}

#[test]
fn torn_audit_line_does_not_stop_auditing() {
    let ws = workspace();
    let target = ws.files.join("plain.txt");
    tierguard(&ws.data).arg("check").arg(&target).assert().success();

    let log_path = ws.data.join("logs/audit.log");
    let mut content = fs::read(&log_path).unwrap();
    content.extend_from_slice(br#"{"seq":2,"rec"#);
    fs::write(&log_path, content).unwrap();

    tierguard(&ws.data)
        .arg("check")
        .arg(&target)
        .arg("read")
        .assert()
        .success()
        .stderr(predicate::str::contains("audit log unavailable").not());

    let output = tierguard(&ws.data).arg("audit").output().unwrap();
    assert!(output.status.success());
    let entries = json_stdout(&output);
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["seq"], 2);
    assert_eq!(entries[0]["record"]["operation"], "read");
}

#[cfg(unix)]
#[test]
fn symlinked_target_reports_json_error() {
    let ws = workspace();
    let real = ws.files.join("plain.txt");
    let link = ws.files.join("link[超重要L10].md");
    fs::write(&real, b"real").unwrap();
    std::os::unix::fs::symlink(&real, &link).unwrap();

    let output = tierguard(&ws.data).arg("safe-delete").arg(&link).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(json_stdout(&output)["error"], "symlink_refused");
    assert!(real.exists());
}

#[test]
fn safe_delete_backs_up_strict_file() {
    let ws = workspace();
    let target = ws.files.join("NOTES[重要L7].md");
    fs::write(&target, b"notes").unwrap();

    let output = tierguard(&ws.data).arg("safe-delete").arg(&target).output().unwrap();
    assert!(output.status.success());
    let outcome = json_stdout(&output);
    assert_eq!(outcome["performed"], true);
    assert!(!target.exists());

    let backup_path = outcome["backup"]["backupPath"].as_str().unwrap();
    assert!(backup_path.contains(".backups"));
    assert_eq!(fs::read(backup_path).unwrap(), b"notes");
}

#[test]
fn safe_delete_refuses_absolute_file() {
    let ws = workspace();
    let target = ws.files.join("RULES[超重要L10].md");
    fs::write(&target, b"rules").unwrap();
    tierguard(&ws.data)
        .arg("safe-delete")
        .arg(&target)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("operation_forbidden"));
    assert!(target.exists());
}

#[test]
fn missing_file_reports_json_error() {
    let ws = workspace();
    let output = tierguard(&ws.data)
        .arg("safe-delete")
        .arg(ws.files.join("gone.txt"))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let payload = json_stdout(&output);
    assert_eq!(payload["error"], "not_found");
}

#[test]
fn backup_prints_path_and_verifies() {
    let ws = workspace();
    let target = ws.files.join("draft[中重要L5].txt");
    fs::write(&target, b"draft").unwrap();

    let output = tierguard(&ws.data)
        .arg("backup")
        .arg(&target)
        .arg("before edit")
        .output()
        .unwrap();
    assert!(output.status.success());
    let backup_path = String::from_utf8(output.stdout).unwrap().trim().to_string();
    assert_eq!(fs::read(&backup_path).unwrap(), b"draft");

    tierguard(&ws.data)
        .arg("verify-backup")
        .arg(format!("{backup_path}.meta.json"))
        .assert()
        .success()
        .stdout(predicate::str::contains("\"valid\": true"));

    fs::write(&backup_path, b"tampered").unwrap();
    tierguard(&ws.data)
        .arg("verify-backup")
        .arg(format!("{backup_path}.meta.json"))
        .assert()
        .code(1);

    let output = tierguard(&ws.data).arg("backups").arg(&target).output().unwrap();
    let records = json_stdout(&output);
    assert_eq!(records.as_array().unwrap().len(), 1);
    assert_eq!(records[0]["reason"], "before edit");
}

#[test]
fn safe_modify_is_reason_gated() {
    let ws = workspace();
    let target = ws.files.join("draft[中重要L5].txt");
    fs::write(&target, b"v1").unwrap();

    tierguard(&ws.data)
        .arg("safe-modify")
        .arg(&target)
        .args(["--content", "v2"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("reason_required"));
    assert_eq!(fs::read(&target).unwrap(), b"v1");

    tierguard(&ws.data)
        .arg("safe-modify")
        .arg(&target)
        .args(["--content", "v2", "--reason", "update"])
        .assert()
        .success();
    assert_eq!(fs::read(&target).unwrap(), b"v2");
}

#[test]
fn safe_modify_reads_content_file() {
    let ws = workspace();
    let target = ws.files.join("plain.txt");
    let source = ws.files.join("source.bin");
    fs::write(&target, b"old").unwrap();
    fs::write(&source, b"from file").unwrap();

    tierguard(&ws.data)
        .arg("safe-modify")
        .arg(&target)
        .arg("--content-file")
        .arg(&source)
        .assert()
        .success()
        .stdout(predicate::str::contains("log_change"));
    assert_eq!(fs::read(&target).unwrap(), b"from file");
}

#[test]
fn scan_reports_totals() {
    let ws = workspace();
    fs::write(ws.files.join("RULES[超重要L10].md"), b"r").unwrap();
    fs::write(ws.files.join("plain.txt"), b"p").unwrap();

    let output = tierguard(&ws.data).arg("scan").arg(&ws.files).output().unwrap();
    assert!(output.status.success());
    let report = json_stdout(&output);
    assert_eq!(report["totals"]["totalFiles"], 2);
    assert_eq!(report["totals"]["highlyProtectedCount"], 1);
    assert_eq!(report["totals"]["unprotectedCount"], 1);
}

#[test]
fn config_flag_changes_backup_folder() {
    let ws = workspace();
    let config = ws.data.join("custom.json");
    fs::write(&config, r#"{ "backup_dir_name": ".snapshots" }"#).unwrap();
    let target = ws.files.join("plan[L8].md");
    fs::write(&target, b"plan").unwrap();

    let output = tierguard(&ws.data)
        .arg("--config")
        .arg(&config)
        .arg("backup")
        .arg(&target)
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains(".snapshots"));
}

#[test]
fn invalid_config_fails() {
    let ws = workspace();
    let config = ws.data.join("bad.json");
    fs::write(&config, r#"{ "backup_dir_name": "a/b" }"#).unwrap();
    tierguard(&ws.data)
        .arg("--config")
        .arg(&config)
        .arg("levels")
        .assert()
        .failure()
        .stderr(predicate::str::contains("settings"));
}
