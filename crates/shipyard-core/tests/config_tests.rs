// Pipeline configuration file loading and validation.

use std::io::Write;

use shipyard_core::config::{OnFailure, PipelineConfig, PipelineConfigError};
use shipyard_core::{PipelineStepConfig, ReviewConfig, SecuritySeverity, StepKind, StepModel, StepType};

const FULL: &str = r#"{
  "version": "1.0",
  "enabled": true,
  "onFailure": "continue",
  "steps": [
    {"id": "review", "type": "review", "name": "Code review", "model": "same",
     "required": true, "autoTrigger": true, "config": {"focus": ["errors"]}},
    {"id": "security", "type": "security", "model": "different",
     "config": {"minSeverity": "high", "checks": ["secrets"]}},
    {"id": "tests", "type": "test", "model": "haiku", "required": false,
     "config": {"coverageThreshold": 75}},
    {"id": "docs", "type": "custom", "dependencies": ["review"],
     "config": {"prompt": "Update docs for {{title}}",
                "successCriteria": ["README updated"],
                "loopConfig": {"maxLoops": 3, "loopUntilSuccess": true, "delayMs": 10},
                "memoryConfig": {"enabled": true},
                "ambiguousOutcome": "fail"}}
  ]
}"#;

fn err_of(json: &str) -> PipelineConfigError {
    let e = PipelineConfig::from_json(json).unwrap_err();
    e.chain()
        .find_map(|c| c.downcast_ref::<PipelineConfigError>().cloned())
        .unwrap_or_else(|| panic!("not a PipelineConfigError: {e:#}"))
}

// =============================================================================
// Happy path
// =============================================================================

#[test]
fn test_full_config_parses() {
    let cfg = PipelineConfig::from_json(FULL).unwrap();
    assert_eq!(cfg.on_failure, OnFailure::Continue);
    assert_eq!(cfg.steps.len(), 4);

    let review = cfg.step("review").unwrap();
    assert_eq!(review.name, "Code review");
    assert_eq!(review.model, StepModel::Same);
    assert_eq!(
        review.kind,
        StepKind::Review(ReviewConfig {
            focus: vec!["errors".into()],
            checklist: vec![],
        })
    );

    let security = cfg.step("security").unwrap();
    assert_eq!(security.model, StepModel::Different);
    assert_eq!(security.name, "security", "name defaults to id");
    match &security.kind {
        StepKind::Security(c) => assert_eq!(c.min_severity, SecuritySeverity::High),
        other => panic!("unexpected kind {other:?}"),
    }

    let tests = cfg.step("tests").unwrap();
    assert!(!tests.required);
    assert_eq!(tests.model, StepModel::Explicit("haiku".into()));

    let docs = cfg.step("docs").unwrap();
    assert_eq!(docs.step_type(), StepType::Custom);
    assert_eq!(docs.dependencies, vec!["review"]);
    match &docs.kind {
        StepKind::Custom(c) => {
            assert_eq!(c.loop_config.max_loops, 3);
            assert!(c.loop_config.loop_until_success);
            assert!(c.memory_config.enabled);
            assert_eq!(c.ambiguous_outcome, shipyard_core::AmbiguousOutcome::Fail);
        }
        other => panic!("unexpected kind {other:?}"),
    }
}

#[test]
fn test_defaults_for_minimal_config() {
    let cfg = PipelineConfig::from_json(r#"{"steps": [{"id": "t", "type": "test"}]}"#).unwrap();
    assert_eq!(cfg.version, "1.0");
    assert!(cfg.enabled);
    assert_eq!(cfg.on_failure, OnFailure::Stop);
    let step = &cfg.steps[0];
    assert!(step.required);
    assert!(!step.auto_trigger);
    match &step.kind {
        StepKind::Test(c) => assert_eq!(c.coverage_threshold, 80.0),
        other => panic!("unexpected kind {other:?}"),
    }
}

#[test]
fn test_load_from_file_and_reserialize() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(FULL.as_bytes()).unwrap();

    let cfg = PipelineConfig::load(file.path()).unwrap();
    let text = serde_json::to_string(&cfg).unwrap();
    let again = PipelineConfig::from_json(&text).unwrap();
    assert_eq!(cfg, again);
}

#[test]
fn test_load_missing_file_mentions_path() {
    let e = PipelineConfig::load(std::path::Path::new("/nonexistent/pipeline.json")).unwrap_err();
    assert!(format!("{e:#}").contains("/nonexistent/pipeline.json"));
}

#[test]
fn test_builder_steps_validate() {
    let cfg = PipelineConfig {
        steps: vec![
            PipelineStepConfig::new("a", StepKind::Review(ReviewConfig::default())),
            PipelineStepConfig::new("b", StepKind::Review(ReviewConfig::default())).depends_on("a"),
        ],
        ..Default::default()
    };
    assert!(cfg.validate().is_ok());
}

// =============================================================================
// Rejections
// =============================================================================

#[test]
fn test_rejects_unsupported_version() {
    assert_eq!(
        err_of(r#"{"version": "2.0", "steps": []}"#),
        PipelineConfigError::UnsupportedVersion("2.0".into())
    );
}

#[test]
fn test_rejects_duplicate_ids() {
    let json = r#"{"steps": [{"id": "a", "type": "review"}, {"id": "a", "type": "test"}]}"#;
    assert_eq!(err_of(json), PipelineConfigError::DuplicateId("a".into()));
}

#[test]
fn test_rejects_unknown_step_type() {
    let e = PipelineConfig::from_json(r#"{"steps": [{"id": "x", "type": "lint"}]}"#).unwrap_err();
    let msg = format!("{e:#}");
    assert!(msg.contains("unknown type"), "{msg}");
    assert!(msg.contains("lint"), "{msg}");
}

#[test]
fn test_rejects_invalid_step_config() {
    let cases = [
        r#"{"steps": [{"id": "t", "type": "test", "config": {"coverageThreshold": 120}}]}"#,
        r#"{"steps": [{"id": "t", "type": "test", "config": {"coverageThreshold": "high"}}]}"#,
        r#"{"steps": [{"id": "c", "type": "custom", "config": {"prompt": "  "}}]}"#,
        r#"{"steps": [{"id": "c", "type": "custom", "config": {"prompt": "x", "loopConfig": {"maxLoops": 0}}}]}"#,
    ];
    for json in cases {
        let e = PipelineConfig::from_json(json).unwrap_err();
        assert!(format!("{e:#}").contains("invalid config"), "{json}: {e:#}");
    }
}

#[test]
fn test_rejects_unknown_and_self_dependencies() {
    let unknown = r#"{"steps": [{"id": "a", "type": "review", "dependencies": ["ghost"]}]}"#;
    assert_eq!(
        err_of(unknown),
        PipelineConfigError::UnknownDependency {
            id: "a".into(),
            dependency: "ghost".into(),
        }
    );
    let own = r#"{"steps": [{"id": "a", "type": "review", "dependencies": ["a"]}]}"#;
    assert!(matches!(err_of(own), PipelineConfigError::UnknownDependency { .. }));
}

#[test]
fn test_rejects_malformed_json() {
    assert!(PipelineConfig::from_json("{not json").is_err());
}
