use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

fn segctl_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_segctl"));
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to execute segctl command {args:?}: {err}"),
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

fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("segmentation-cli-smoke-{}.sqlite3", Ulid::new()))
}

fn current_period() -> String {
    let now = segmentation_core::now_utc();
    format!("{:04}-{:02}", now.year(), u8::from(now.month()))
}

#[test]
fn create_update_list_report_flow() {
    let db_path = temp_db_path();
    let user = uuid::Uuid::new_v4().to_string();

    for slug in ["TEST1", "TEST2"] {
        let output = segctl_output(&db_path, &["create-segment", "--slug", slug]);
        assert!(
            output.status.success(),
            "create-segment failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let output = segctl_output(
        &db_path,
        &[
            "update",
            "--user",
            &user,
            "--add",
            "TEST1",
            "--add",
            "TEST2",
        ],
    );
    assert!(
        output.status.success(),
        "update failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let update_json = stdout_json(&output);
    assert_eq!(
        update_json["applied"].as_array().map(Vec::len),
        Some(2),
        "both additions must be applied"
    );

    let output = segctl_output(&db_path, &["list", "--user", &user]);
    assert!(output.status.success());
    let list_json = stdout_json(&output);
    assert_eq!(list_json["segments"], serde_json::json!(["TEST1", "TEST2"]));

    let output = segctl_output(
        &db_path,
        &["update", "--user", &user, "--remove", "TEST1", "--remove", "TEST2"],
    );
    assert!(output.status.success());

    let period = current_period();
    let output = segctl_output(&db_path, &["report", "--period", &period]);
    assert!(output.status.success());
    let rows = stdout_json(&output);
    let rows = match rows.as_array() {
        Some(rows) => rows.clone(),
        None => panic!("report output must be a JSON array: {rows}"),
    };
    assert_eq!(rows.len(), 4);
    let adds = rows
        .iter()
        .filter(|row| row["action"] == serde_json::json!("add"))
        .count();
    assert_eq!(adds, 2);

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn unknown_segment_fails_with_nonzero_exit() {
    let db_path = temp_db_path();
    let user = uuid::Uuid::new_v4().to_string();

    let output = segctl_output(&db_path, &["update", "--user", &user, "--add", "GHOST"]);
    assert!(!output.status.success());
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("segment not found"),
        "stderr should surface the domain error: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn delete_segment_cascades_membership() {
    let db_path = temp_db_path();
    let user = uuid::Uuid::new_v4().to_string();

    let output = segctl_output(&db_path, &["create-segment", "--slug", "TEST1"]);
    assert!(output.status.success());
    let output = segctl_output(&db_path, &["update", "--user", &user, "--add", "TEST1"]);
    assert!(output.status.success());

    let output = segctl_output(&db_path, &["delete-segment", "--slug", "TEST1"]);
    assert!(output.status.success());

    let output = segctl_output(&db_path, &["list", "--user", &user]);
    assert!(output.status.success());
    let list_json = stdout_json(&output);
    assert_eq!(list_json["segments"], serde_json::json!([]));

    let _ = std::fs::remove_file(&db_path);
}
