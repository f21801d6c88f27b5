use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

const TASKS: &str = r#"{
  "target": {
    "host": "10.0.0.5",
    "username": "pentest",
    "credential": { "type": "password", "env": "REDPILOT_TARGET_PASSWORD" }
  },
  "global_settings": { "step_budget": 20 },
  "tasks": [
    { "id": "recon", "name": "Recon", "goal": "enumerate users" },
    { "id": "privesc", "name": "Privilege escalation", "goal": "get root", "requires": ["recon"], "step_budget": 5 }
  ]
}"#;

fn workspace() -> TempDir {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("tasks.json"), TASKS).unwrap();
    temp
}

fn redpilot(dir: &TempDir) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("redpilot");
    cmd.current_dir(dir.path())
        .env_remove("REDPILOT_CONFIG")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    let mut cmd = cargo_bin_cmd!("redpilot");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Autonomous attack session orchestrator"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("check-command"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_cli_version() {
    let mut cmd = cargo_bin_cmd!("redpilot");
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("redpilot"));
}

#[test]
fn test_cli_run_help() {
    let mut cmd = cargo_bin_cmd!("redpilot");
    cmd.args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--task"))
        .stdout(predicate::str::contains("--goal"))
        .stdout(predicate::str::contains("--max-steps"))
        .stdout(predicate::str::contains("--dry-run"))
        .stdout(predicate::str::contains("--max-parallel"));
}

#[test]
fn test_validate_prints_effective_settings() {
    let dir = workspace();
    redpilot(&dir)
        .args(["validate", "tasks.json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 task(s) in 2 wave(s)"))
        .stdout(predicate::str::contains("pentest@10.0.0.5:22"))
        .stdout(predicate::str::contains("password from $REDPILOT_TARGET_PASSWORD"))
        .stdout(predicate::str::contains("20 steps"))
        .stdout(predicate::str::contains("5 steps"));
}

#[test]
fn test_validate_json_output() {
    let dir = workspace();
    redpilot(&dir)
        .args(["-o", "json", "validate", "tasks.json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"task_count\":2"))
        .stdout(predicate::str::contains("\"step_budget\":5"));
}

#[test]
fn test_validate_reports_every_violation() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("bad.json"),
        r#"{ "tasks": [ { "id": "a", "name": "A", "goal": "x", "step_budget": 0 } ] }"#,
    )
    .unwrap();
    redpilot(&dir)
        .args(["validate", "bad.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("step_budget must be greater than 0"))
        .stderr(predicate::str::contains("target.host is required"))
        .stderr(predicate::str::contains("target.credential is required"));
}

#[test]
fn test_dry_run_needs_no_capabilities() {
    let dir = workspace();
    redpilot(&dir)
        .args(["run", "tasks.json", "--task", "privesc", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Dry run"))
        .stdout(predicate::str::contains("recon"))
        .stdout(predicate::str::contains("privesc"));
}

#[test]
fn test_goal_dry_run_uses_configured_credential() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("redpilot.toml"),
        "[defaults.target]\nusername = \"audit\"\n\n[defaults.target.credential]\ntype = \"agent\"\n",
    )
    .unwrap();
    redpilot(&dir)
        .args([
            "run", "--goal", "list listening services", "-m", "4", "--target", "10.0.0.9:2222",
            "--dry-run",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 task(s) in 1 wave(s)"))
        .stdout(predicate::str::contains("goal - Goal"))
        .stdout(predicate::str::contains("audit@10.0.0.9:2222 (ssh-agent)"))
        .stdout(predicate::str::contains("4 steps"));
}

#[test]
fn test_goal_run_is_validated_like_a_task_file() {
    let dir = TempDir::new().unwrap();
    redpilot(&dir)
        .args(["run", "-g", "list users", "--target", "10.0.0.9", "--dry-run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("target.credential is required"));
}

#[test]
fn test_run_requires_task_file_or_goal() {
    let dir = TempDir::new().unwrap();
    redpilot(&dir).arg("run").assert().failure();
}

#[test]
fn test_run_without_capabilities_fails() {
    let dir = workspace();
    redpilot(&dir)
        .args(["run", "tasks.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("capabilities.planner must be configured"));
}

#[test]
fn test_check_command_denies_destructive() {
    let dir = TempDir::new().unwrap();
    redpilot(&dir)
        .args(["-o", "json", "check-command", "rm -rf /"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"verdict\":\"deny\""))
        .stdout(predicate::str::contains("\"kind\":\"destructive\""));
}

#[test]
fn test_check_command_allows_recon() {
    let dir = TempDir::new().unwrap();
    redpilot(&dir)
        .args(["check-command", "uname -a"])
        .assert()
        .success()
        .stdout(predicate::str::contains("allowed: uname -a"));
}

#[test]
fn test_check_command_scope_exclusion() {
    let dir = TempDir::new().unwrap();
    redpilot(&dir)
        .args(["check-command", "nmap -sV 10.0.0.0/24", "--exclude", r"\bnmap\b"])
        .assert()
        .success()
        .stdout(predicate::str::contains("denied: nmap"));
}

#[test]
fn test_config_show_json() {
    let dir = TempDir::new().unwrap();
    redpilot(&dir)
        .args(["-o", "json", "config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"engine\""))
        .stdout(predicate::str::contains("\"max_parallel_sessions\": 1"));
}

#[test]
fn test_config_init_refuses_to_overwrite() {
    let dir = TempDir::new().unwrap();
    redpilot(&dir).args(["config", "init"]).assert().success();
    assert!(dir.path().join("redpilot.toml").exists());

    redpilot(&dir)
        .args(["config", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    redpilot(&dir)
        .args(["config", "init", "--force"])
        .assert()
        .success();
}
