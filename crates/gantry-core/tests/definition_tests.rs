//! Wire-format tests for gantry-core types.

use chrono::Utc;
use gantry_core::events::*;
use gantry_core::ids::*;
use gantry_core::pipeline::*;
use gantry_core::run::*;
use pretty_assertions::assert_eq;

#[test]
fn test_run_event_is_tagged_by_type() {
    let event = RunEvent::JobSkipped(JobSkippedPayload {
        run_id: RunId::new(),
        index: InstanceIndex::new(5),
        display_name: "publish".to_string(),
        blocked_by: Some(InstanceIndex::new(2)),
    });

    let json = serde_json::to_value(&event).expect("serialize");
    assert_eq!(json["type"], "job_skipped");
    assert_eq!(json["index"], 5);
    assert_eq!(json["blocked_by"], 2);
}

#[test]
fn test_run_completed_payload_roundtrip() {
    let payload = RunCompletedPayload {
        run_id: RunId::new(),
        pipeline_name: "python-package".to_string(),
        status: RunStatus::Failed,
        succeeded: 4,
        failed: 1,
        skipped: 1,
        cancelled: 0,
        duration_ms: 12345,
        completed_at: Utc::now(),
    };

    let json = serde_json::to_string(&payload).expect("serialize");
    let parsed: RunCompletedPayload = serde_json::from_str(&json).expect("deserialize");

    assert_eq!(payload.run_id, parsed.run_id);
    assert_eq!(parsed.status, RunStatus::Failed);
    assert_eq!(parsed.skipped, 1);
}

#[test]
fn test_trigger_config_tags() {
    let push: TriggerConfig =
        serde_json::from_str(r#"{"type":"push","branches":["main"]}"#).expect("push");
    match push {
        TriggerConfig::Push {
            branches,
            paths,
            paths_ignore,
        } => {
            assert_eq!(branches, vec!["main".to_string()]);
            assert!(paths.is_empty());
            assert!(paths_ignore.is_empty());
        }
        TriggerConfig::Manual => panic!("expected push trigger"),
    }

    let manual: TriggerConfig = serde_json::from_str(r#"{"type":"manual"}"#).expect("manual");
    assert_eq!(manual.trigger_type(), TriggerType::Manual);
}

#[test]
fn test_env_value_forms() {
    let literal: EnvValue = serde_json::from_str(r#""plain""#).expect("literal");
    assert_eq!(literal, EnvValue::literal("plain"));

    let secret: EnvValue = serde_json::from_str(r#"{"secret":"PYPI_TOKEN"}"#).expect("secret");
    assert_eq!(secret.secret_name(), Some("PYPI_TOKEN"));
}

#[test]
fn test_step_kind_from_yaml() {
    let yaml = r#"
name: setup
uses: setup-runtime@v1
with:
  tool: python
  version: "3.9"
"#;
    let step: StepDefinition = serde_yaml::from_str(yaml).expect("step");
    match step.kind {
        StepKind::Action { uses, with } => {
            assert_eq!(uses, "setup-runtime@v1");
            assert_eq!(with["version"], "3.9");
        }
        StepKind::Shell { .. } => panic!("expected action step"),
    }
    assert!(!step.continue_on_error);
}

#[test]
fn test_matrix_accepts_dimensions_alias() {
    let yaml = r#"
dimensions:
  os: [linux, macos]
exclude:
  - os: macos
"#;
    let matrix: MatrixConfig = serde_yaml::from_str(yaml).expect("matrix");
    assert_eq!(matrix.axes["os"].len(), 2);
    assert_eq!(matrix.exclude.len(), 1);
}

#[test]
fn test_definition_schema_names_jobs() {
    let schema = schemars::schema_for!(PipelineDefinition);
    let json = serde_json::to_value(&schema).expect("schema");
    assert!(json["properties"]["jobs"].is_object());
    assert!(json["properties"]["triggers"].is_object());
}
