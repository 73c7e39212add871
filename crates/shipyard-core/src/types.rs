use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::PipelineConfigError;
use crate::issue::Issue;

// ── Feature ──────────────────────────────────────────────────────────────

/// A requested code change moving through the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Free-form status label as tracked by the caller (e.g. "in_review").
    #[serde(default)]
    pub status: String,
    /// Model the feature was implemented with. `None` means the configured default.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

// ── Step types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Review,
    Security,
    Performance,
    Test,
    Custom,
}

impl StepType {
    pub const ALL: [StepType; 5] = [
        Self::Review,
        Self::Security,
        Self::Performance,
        Self::Test,
        Self::Custom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Review => "review",
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Test => "test",
            Self::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Per-type step configuration ──────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReviewConfig {
    /// Areas the reviewer should weigh more heavily (e.g. "error handling").
    pub focus: Vec<String>,
    /// Checklist items appended after the built-in checklist.
    pub checklist: Vec<String>,
}

/// Five-level severity scale used in security reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecuritySeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl SecuritySeverity {
    pub fn rank(self) -> u8 {
        match self {
            Self::Info => 0,
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }

    /// Lenient parse of a model-supplied label. Unknown labels read as medium.
    pub fn from_label(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Self::Critical,
            "high" => Self::High,
            "low" => Self::Low,
            "info" | "informational" => Self::Info,
            _ => Self::Medium,
        }
    }
}

impl Default for SecuritySeverity {
    fn default() -> Self {
        Self::Medium
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityConfig {
    /// Vulnerabilities below this severity are dropped from the result.
    pub min_severity: SecuritySeverity,
    /// Check families to request (e.g. "owasp", "secrets", "dependencies").
    pub checks: Vec<String>,
    /// Compliance frameworks to report against (e.g. "SOC2").
    pub compliance: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceConfig {
    pub focus_areas: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestConfig {
    /// Minimum line coverage percentage (0–100) for the step to pass.
    pub coverage_threshold: f64,
    pub test_types: Vec<String>,
    pub framework: Option<String>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            coverage_threshold: 80.0,
            test_types: vec!["unit".into()],
            framework: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoopConfig {
    pub max_loops: u32,
    pub loop_until_success: bool,
    /// Pause between attempts, in milliseconds.
    pub delay_ms: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_loops: 1,
            loop_until_success: false,
            delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeReviewConfig {
    pub enabled: bool,
    /// Fall through to the model path when the integration errors.
    pub fallback_to_model: bool,
}

impl Default for CodeReviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_to_model: true,
        }
    }
}

/// Verdict used when a reply neither confirms nor denies the success criteria.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmbiguousOutcome {
    #[default]
    Pass,
    Fail,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomConfig {
    /// Prompt template; `{{name}}` placeholders are substituted before sending.
    pub prompt: String,
    pub success_criteria: Vec<String>,
    pub variables: BTreeMap<String, String>,
    pub loop_config: LoopConfig,
    pub memory_config: MemoryConfig,
    pub code_review: Option<CodeReviewConfig>,
    pub ambiguous_outcome: AmbiguousOutcome,
}

/// Closed set of step variants, each carrying its own configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Review(ReviewConfig),
    Security(SecurityConfig),
    Performance(PerformanceConfig),
    Test(TestConfig),
    Custom(CustomConfig),
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            Self::Review(_) => StepType::Review,
            Self::Security(_) => StepType::Security,
            Self::Performance(_) => StepType::Performance,
            Self::Test(_) => StepType::Test,
            Self::Custom(_) => StepType::Custom,
        }
    }

    fn from_parts(step_type: StepType, config: Value) -> Result<Self, serde_json::Error> {
        let config = if config.is_null() {
            Value::Object(Map::new())
        } else {
            config
        };
        Ok(match step_type {
            StepType::Review => Self::Review(serde_json::from_value(config)?),
            StepType::Security => Self::Security(serde_json::from_value(config)?),
            StepType::Performance => Self::Performance(serde_json::from_value(config)?),
            StepType::Test => Self::Test(serde_json::from_value(config)?),
            StepType::Custom => Self::Custom(serde_json::from_value(config)?),
        })
    }

    fn config_value(&self) -> Value {
        let v = match self {
            Self::Review(c) => serde_json::to_value(c),
            Self::Security(c) => serde_json::to_value(c),
            Self::Performance(c) => serde_json::to_value(c),
            Self::Test(c) => serde_json::to_value(c),
            Self::Custom(c) => serde_json::to_value(c),
        };
        v.unwrap_or(Value::Null)
    }

    /// Semantic checks serde cannot express.
    fn check(&self) -> Result<(), String> {
        match self {
            Self::Test(c) if !(0.0..=100.0).contains(&c.coverage_threshold) => Err(format!(
                "coverageThreshold must be within 0..=100, got {}",
                c.coverage_threshold
            )),
            Self::Custom(c) if c.prompt.trim().is_empty() => {
                Err("custom step requires a non-empty prompt".into())
            }
            Self::Custom(c) if c.loop_config.max_loops == 0 => {
                Err("loopConfig.maxLoops must be at least 1".into())
            }
            _ => Ok(()),
        }
    }
}

/// Which model a step runs with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StepModel {
    /// Same model the feature was implemented with.
    #[default]
    Same,
    /// A model from a different family than the feature's.
    Different,
    Explicit(String),
}

impl From<String> for StepModel {
    fn from(s: String) -> Self {
        match s.as_str() {
            "" | "same" => Self::Same,
            "different" => Self::Different,
            _ => Self::Explicit(s),
        }
    }
}

impl From<StepModel> for String {
    fn from(m: StepModel) -> Self {
        match m {
            StepModel::Same => "same".into(),
            StepModel::Different => "different".into(),
            StepModel::Explicit(s) => s,
        }
    }
}

impl Serialize for StepModel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from(self.clone()))
    }
}

impl<'de> Deserialize<'de> for StepModel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

/// One configured quality gate inside a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStepConfig", into = "RawStepConfig")]
pub struct PipelineStepConfig {
    pub id: String,
    pub name: String,
    pub model: StepModel,
    pub required: bool,
    pub auto_trigger: bool,
    pub kind: StepKind,
    pub dependencies: Vec<String>,
}

impl PipelineStepConfig {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            model: StepModel::Same,
            required: true,
            auto_trigger: true,
            kind,
            dependencies: Vec::new(),
        }
    }

    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }

    pub fn with_model(mut self, model: StepModel) -> Self {
        self.model = model;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }
}

fn default_true() -> bool {
    true
}

/// Wire shape of a step entry in the pipeline file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStepConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: StepModel,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub auto_trigger: bool,
    #[serde(default)]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

impl TryFrom<RawStepConfig> for PipelineStepConfig {
    type Error = PipelineConfigError;

    fn try_from(raw: RawStepConfig) -> Result<Self, Self::Error> {
        let step_type =
            StepType::parse(&raw.step_type).ok_or_else(|| PipelineConfigError::UnknownStepType {
                id: raw.id.clone(),
                step_type: raw.step_type.clone(),
            })?;
        let kind = StepKind::from_parts(step_type, raw.config).map_err(|e| {
            PipelineConfigError::InvalidStepConfig {
                id: raw.id.clone(),
                reason: e.to_string(),
            }
        })?;
        kind.check()
            .map_err(|reason| PipelineConfigError::InvalidStepConfig {
                id: raw.id.clone(),
                reason,
            })?;
        let name = if raw.name.is_empty() {
            raw.id.clone()
        } else {
            raw.name
        };
        Ok(Self {
            id: raw.id,
            name,
            model: raw.model,
            required: raw.required,
            auto_trigger: raw.auto_trigger,
            kind,
            dependencies: raw.dependencies,
        })
    }
}

impl From<PipelineStepConfig> for RawStepConfig {
    fn from(step: PipelineStepConfig) -> Self {
        Self {
            step_type: step.kind.step_type().as_str().to_string(),
            config: step.kind.config_value(),
            id: step.id,
            name: step.name,
            model: step.model,
            required: step.required,
            auto_trigger: step.auto_trigger,
            dependencies: step.dependencies,
        }
    }
}

// ── Step results ─────────────────────────────────────────────────────────

/// Outcome of one step. Anything other than passed/failed/skipped is carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
    Other(String),
}

impl StepStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Other(s) => s,
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl From<&str> for StepStatus {
    fn from(s: &str) -> Self {
        match s {
            "passed" => Self::Passed,
            "failed" => Self::Failed,
            "skipped" => Self::Skipped,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for StepStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StepStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s.as_str()))
    }
}

/// Result of running a single pipeline step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStepResult {
    pub status: StepStatus,
    pub output: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<Issue>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
}

impl PipelineStepResult {
    pub fn new(status: StepStatus, output: impl Into<String>) -> Self {
        Self {
            status,
            output: output.into(),
            issues: Vec::new(),
            metadata: Map::new(),
            iterations: None,
        }
    }

    pub fn passed(output: impl Into<String>) -> Self {
        Self::new(StepStatus::Passed, output)
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self::new(StepStatus::Failed, output)
    }

    /// Failed result synthesized from an error message.
    pub fn from_error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::failed(message.clone()).with_metadata("error", Value::String(message))
    }

    pub fn with_issues(mut self, issues: Vec<Issue>) -> Self {
        self.issues = issues;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = Some(iterations);
        self
    }
}

// ── Step events ──────────────────────────────────────────────────────────

/// Progress/status notification emitted while a step runs.
#[derive(Debug, Clone, PartialEq)]
pub enum StepEvent {
    Started {
        step_id: String,
        step_type: StepType,
        name: String,
    },
    Progress {
        step_id: String,
        message: String,
    },
    Finished {
        step_id: String,
        status: StepStatus,
    },
    Failed {
        step_id: String,
        error: String,
    },
}

impl StepEvent {
    pub fn kind(&self) -> &str {
        match self {
            Self::Started { .. } => "step_started",
            Self::Progress { .. } => "step_progress",
            Self::Finished { .. } => "step_finished",
            Self::Failed { .. } => "step_failed",
        }
    }

    pub fn step_id(&self) -> &str {
        match self {
            Self::Started { step_id, .. }
            | Self::Progress { step_id, .. }
            | Self::Finished { step_id, .. }
            | Self::Failed { step_id, .. } => step_id,
        }
    }
}

/// Sender half used to stream [`StepEvent`]s to an observer.
pub type StepEventSender = tokio::sync::mpsc::UnboundedSender<StepEvent>;
