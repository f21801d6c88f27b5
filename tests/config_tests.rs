use tempfile::TempDir;

use redpilot::config::{
    CredentialRef, DEFAULT_STEP_BUDGET, DefaultSettings, GlobalSettings, RedpilotConfig,
    TargetSpec, TaskDefinition, TaskFile, resolve,
};
use redpilot::error::PilotError;
use redpilot::utils::SizeMeasure;

fn global_with_target() -> GlobalSettings {
    GlobalSettings {
        target: TargetSpec {
            host: Some("10.0.0.5".into()),
            credential: Some(CredentialRef::Agent),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn test_default_config() {
    let config = RedpilotConfig::default();

    assert_eq!(config.defaults.step_budget, DEFAULT_STEP_BUDGET);
    assert_eq!(config.defaults.step_budget, 15);
    assert!(config.defaults.summarizer_enabled);
    assert_eq!(config.defaults.target.port, Some(22));

    assert_eq!(config.engine.max_parallel_sessions, 1);
    assert_eq!(config.engine.size_unit, SizeMeasure::Chars);
    assert_eq!(config.capabilities.max_attempts, 3);
    assert_eq!(config.channel.reconnect_attempts, 3);
    assert!(config.output.persist);
    assert!(config.validate().is_ok());
}

#[test]
fn test_global_overrides_default_when_task_is_silent() {
    let defaults = DefaultSettings::default();
    let global = GlobalSettings {
        step_budget: Some(20),
        ..global_with_target()
    };
    let task = TaskDefinition::new("recon", "Recon", "enumerate users");

    let settings = resolve(&defaults, &global, &task).unwrap();
    assert_eq!(settings.step_budget, 20);
    assert_eq!(settings.target.port, 22);
    assert_eq!(settings.target.username, "root");
}

#[test]
fn test_task_overrides_global() {
    let defaults = DefaultSettings::default();
    let global = GlobalSettings {
        step_budget: Some(20),
        ..global_with_target()
    };
    let mut task = TaskDefinition::new("recon", "Recon", "enumerate users");
    task.step_budget = Some(5);

    let settings = resolve(&defaults, &global, &task).unwrap();
    assert_eq!(settings.step_budget, 5);
}

#[test]
fn test_resolution_is_deterministic() {
    let defaults = DefaultSettings::default();
    let global = global_with_target();
    let task = TaskDefinition::new("recon", "Recon", "enumerate users");

    let first = resolve(&defaults, &global, &task).unwrap();
    let second = resolve(&defaults, &global, &task).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_all_violations_reported_together() {
    let defaults = DefaultSettings::default();
    let global = GlobalSettings::default();
    let mut task = TaskDefinition::new("broken", "Broken", "enumerate users");
    task.step_budget = Some(0);
    task.context_budget = Some(0);

    let err = resolve(&defaults, &global, &task).unwrap_err();
    let violations = err.violations();
    assert!(violations.iter().any(|v| v.contains("step_budget")));
    assert!(violations.iter().any(|v| v.contains("context_budget")));
    assert!(violations.iter().any(|v| v.contains("target.host")));
    assert!(violations.iter().any(|v| v.contains("target.credential")));
}

#[test]
fn test_task_file_violations_name_their_task() {
    let file = TaskFile::parse(
        r#"{
          "target": { "host": "10.0.0.5", "credential": { "type": "agent" } },
          "tasks": [
            { "id": "a", "name": "A", "goal": "", "step_budget": 0 },
            { "id": "b", "name": "B", "goal": "list users", "context_budget": 10 }
          ]
        }"#,
    )
    .unwrap();

    let err = file.resolve_all(&DefaultSettings::default()).unwrap_err();
    let text = err.to_string();
    assert!(text.contains("task 'a': goal must not be empty"));
    assert!(text.contains("task 'a': step_budget must be greater than 0"));
    assert!(text.contains("task 'b': context_budget must be at least"));
}

#[test]
fn test_task_ids_that_name_other_paths_are_rejected() {
    let file = TaskFile::parse(
        r#"{
          "target": { "host": "10.0.0.5", "credential": { "type": "agent" } },
          "tasks": [
            { "id": "/tmp/elsewhere", "name": "A", "goal": "x" },
            { "id": "../../etc", "name": "B", "goal": "y" },
            { "id": "recon 2", "name": "C", "goal": "z" },
            { "id": "web-01_v1.2", "name": "D", "goal": "w" }
          ]
        }"#,
    );
    let err = file.unwrap_err();
    let violations = err.violations();
    assert_eq!(violations.len(), 3);
    assert!(violations.iter().any(|v| v.contains("/tmp/elsewhere")));
    assert!(violations.iter().any(|v| v.contains("../../etc")));
    assert!(violations.iter().any(|v| v.contains("recon 2")));
}

#[test]
fn test_dependency_cycle_is_rejected() {
    let file = TaskFile::parse(
        r#"{
          "tasks": [
            { "id": "a", "name": "A", "goal": "x", "requires": ["b"] },
            { "id": "b", "name": "B", "goal": "y", "requires": ["a"] }
          ]
        }"#,
    )
    .unwrap();
    assert!(matches!(file.resolve_task_order(), Err(PilotError::TaskGraph(_))));
}

#[test]
fn test_unknown_dependency_is_rejected() {
    let file = TaskFile::parse(
        r#"{ "tasks": [ { "id": "a", "name": "A", "goal": "x", "requires": ["ghost"] } ] }"#,
    )
    .unwrap();
    let err = file.dependency_waves().unwrap_err();
    assert!(err.to_string().contains("ghost"));
}

#[test]
fn test_empty_task_list_is_invalid() {
    assert!(TaskFile::parse(r#"{ "tasks": [] }"#).is_err());
}

#[tokio::test]
async fn test_config_save_and_load() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("redpilot.toml");

    let mut config = RedpilotConfig::default();
    config.defaults.step_budget = 25;
    config.engine.max_parallel_sessions = 4;
    config.guardrail.deny_patterns.push(r"\bnc\s+-e\b".into());
    config.save(&path).await.unwrap();

    let loaded = RedpilotConfig::load(&path).await.unwrap();
    assert_eq!(loaded.defaults.step_budget, 25);
    assert_eq!(loaded.engine.max_parallel_sessions, 4);
    assert_eq!(loaded.guardrail.deny_patterns, vec![r"\bnc\s+-e\b".to_string()]);
}

#[tokio::test]
async fn test_missing_explicit_config_is_an_error() {
    let temp = TempDir::new().unwrap();
    let missing = temp.path().join("nope.toml");
    assert!(RedpilotConfig::discover(Some(&missing)).await.is_err());
}

#[tokio::test]
async fn test_partial_config_keeps_defaults() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("redpilot.toml");
    std::fs::write(&path, "[defaults]\nstep_budget = 7\n").unwrap();

    let config = RedpilotConfig::load(&path).await.unwrap();
    assert_eq!(config.defaults.step_budget, 7);
    assert!(config.defaults.summarizer_enabled);
    assert_eq!(config.capabilities.timeout_secs, 120);
}
