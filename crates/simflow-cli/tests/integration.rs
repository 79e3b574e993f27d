#![allow(deprecated)]
use assert_cmd::Command;
use chrono::{Duration, Utc};
use predicates::prelude::*;
use simflow_core::retry::RetryPolicy;
use simflow_core::store::TaskStore;
use tempfile::TempDir;

fn simflow(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("simflow").unwrap();
    cmd.current_dir(dir.path()).env("SIMFLOW_ROOT", dir.path());
    cmd
}

fn init_project(dir: &TempDir) {
    simflow(dir).arg("init").assert().success();
}

fn json_output(cmd: &mut Command) -> serde_json::Value {
    let out = cmd.arg("--json").assert().success().get_output().stdout.clone();
    serde_json::from_slice(&out).unwrap()
}

// ---------------------------------------------------------------------------
// simflow init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_directory_tree() {
    let dir = TempDir::new().unwrap();
    simflow(&dir).arg("init").assert().success();

    assert!(dir.path().join(".simflow").is_dir());
    assert!(dir.path().join(".simflow/mailbox").is_dir());
    assert!(dir.path().join(".simflow/config.yaml").exists());
    assert!(dir.path().join(".simflow/tasks.db").exists());
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    simflow(&dir).arg("init").assert().success();
    simflow(&dir).args(["install", "Hossack_REL01"]).assert().success();
    simflow(&dir).arg("init").assert().success();

    let status = json_output(simflow(&dir).arg("status"));
    assert_eq!(status["counts"]["not_started"], 6);
}

#[test]
fn commands_require_init() {
    let dir = TempDir::new().unwrap();
    simflow(&dir)
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not initialized"));
}

// ---------------------------------------------------------------------------
// simflow install / status
// ---------------------------------------------------------------------------

#[test]
fn install_selected_stages() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    simflow(&dir)
        .args(["install", "Hossack_REL01", "Hossack_REL02", "--stages", "emod3d,hf"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Hossack_REL01: installed 2 task(s)"));

    let tasks = json_output(simflow(&dir).args(["status", "--stage", "hf", "--pattern", "%REL02"]));
    let tasks = tasks.as_array().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["run_name"], "Hossack_REL02");
    assert_eq!(tasks[0]["status"], "not_started");
}

#[test]
fn install_rejects_bad_names() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    simflow(&dir)
        .args(["install", "bad.name"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid run name"));
    simflow(&dir)
        .args(["install", "A_REL01", "--stages", "lf"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown stage"));
}

#[test]
fn status_summary_table() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    simflow(&dir).args(["install", "Alpine_REL01"]).assert().success();
    simflow(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("not_started  6"))
        .stdout(predicate::str::contains("Alpine_REL01  0/6"));
}

#[test]
fn status_reports_stalled_collection() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    simflow(&dir).args(["install", "Alpine_REL01"]).assert().success();
    {
        let store = TaskStore::open_root(dir.path(), RetryPolicy::default()).unwrap();
        store.record_poll(Utc::now() - Duration::hours(3)).unwrap();
    }

    simflow(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("COLLECTION FAILURE"));

    let status = json_output(simflow(&dir).arg("status"));
    assert_eq!(status["collection_error"]["reason"], "collection_failure");
}

#[test]
fn status_is_healthy_after_recent_poll() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    {
        let store = TaskStore::open_root(dir.path(), RetryPolicy::default()).unwrap();
        store.record_poll(Utc::now()).unwrap();
    }
    let status = json_output(simflow(&dir).arg("status"));
    assert!(status["collection_error"].is_null());
}

// ---------------------------------------------------------------------------
// simflow update / reconcile / history
// ---------------------------------------------------------------------------

#[test]
fn manual_updates_flow_through_mailbox() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    simflow(&dir).args(["install", "A_REL01"]).assert().success();

    simflow(&dir)
        .args(["update", "A_REL01", "emod3d", "queued", "--job-id", "100"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Posted"));
    simflow(&dir)
        .args(["update", "A_REL01", "emod3d", "running", "--job-id", "100"])
        .assert()
        .success();
    // running -> not_started is never permitted
    simflow(&dir)
        .args(["update", "A_REL01", "emod3d", "not_started"])
        .assert()
        .success();

    let report = json_output(simflow(&dir).arg("reconcile"));
    assert_eq!(report["applied"], 2);
    assert_eq!(report["rejected"], 1);

    let tasks = json_output(simflow(&dir).args(["status", "--run", "A_REL01", "--stage", "emod3d"]));
    assert_eq!(tasks[0]["status"], "running");
    assert_eq!(tasks[0]["job_id"], 100);

    let history = json_output(simflow(&dir).args(["history", "A_REL01", "emod3d"]));
    assert_eq!(history.as_array().unwrap().len(), 2);
    assert_eq!(history[1]["to"], "running");
}

#[test]
fn queued_update_requires_job_id() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    simflow(&dir).args(["install", "A_REL01"]).assert().success();
    simflow(&dir)
        .args(["update", "A_REL01", "emod3d", "queued"])
        .assert()
        .success();
    let report = json_output(simflow(&dir).arg("reconcile"));
    assert_eq!(report["rejected"], 1);
}

#[test]
fn history_of_unknown_task_fails() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    simflow(&dir)
        .args(["history", "Nope_REL01", "hf"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("task not found"));
}

// ---------------------------------------------------------------------------
// simflow cancel
// ---------------------------------------------------------------------------

#[test]
fn cancel_unsubmitted_task_marks_it_killed() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    simflow(&dir).args(["install", "A_REL01"]).assert().success();
    simflow(&dir).args(["cancel", "A_REL01", "bb"]).assert().success();
    simflow(&dir).arg("reconcile").assert().success();

    let tasks = json_output(simflow(&dir).args(["status", "--stage", "bb"]));
    assert_eq!(tasks[0]["status"], "killed");
    assert_eq!(tasks[0]["last_error"], "cancelled by operator");

    simflow(&dir)
        .args(["cancel", "A_REL01", "bb"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already killed"));
}

// ---------------------------------------------------------------------------
// simflow config
// ---------------------------------------------------------------------------

#[test]
fn config_validate_reports_errors() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    std::fs::write(
        dir.path().join(".simflow/config.yaml"),
        "scheduler:\n  kind: slurm\npoll_interval_seconds: 0\n",
    )
    .unwrap();
    simflow(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error] poll_interval_seconds"));
}

#[test]
fn config_show_prints_defaults() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let cfg = json_output(simflow(&dir).args(["config", "show"]));
    assert_eq!(cfg["max_concurrent"], 20);
    assert_eq!(cfg["max_retries"], 2);
    assert_eq!(cfg["scheduler"]["kind"], "auto");
}

// ---------------------------------------------------------------------------
// simflow run (against stub scheduler commands)
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn stub_scheduler(dir: &TempDir) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let bin = dir.path().join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    let scripts = [
        ("sbatch", "#!/bin/sh\necho \"Submitted batch job 4182\"\n"),
        ("squeue", "#!/bin/sh\necho \"JOBID ST\"\n"),
        ("sacct", "#!/bin/sh\nexit 0\n"),
    ];
    for (name, body) in scripts {
        let path = bin.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    bin
}

#[cfg(unix)]
#[test]
fn run_once_submits_runnable_tasks() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    std::fs::write(
        dir.path().join(".simflow/config.yaml"),
        "scheduler:\n  kind: slurm\n  user: tester\n",
    )
    .unwrap();
    simflow(&dir).args(["install", "Hossack_REL01"]).assert().success();
    let script_dir = dir.path().join("Runs/Hossack/Hossack_REL01");
    std::fs::create_dir_all(&script_dir).unwrap();
    std::fs::write(script_dir.join("run_emod3d.sl"), "#!/bin/bash\n").unwrap();

    let bin = stub_scheduler(&dir);
    let path = format!(
        "{}:{}",
        bin.display(),
        std::env::var("PATH").unwrap_or_default()
    );

    let summary = json_output(simflow(&dir).env("PATH", &path).args(["run", "--once"]));
    assert_eq!(summary["submitted"], 1);
    assert_eq!(summary["stopped"], "once");

    let tasks = json_output(simflow(&dir).args(["status", "--run", "Hossack_REL01", "--stage", "emod3d"]));
    assert_eq!(tasks[0]["status"], "queued");
    assert_eq!(tasks[0]["job_id"], 4182);
}
