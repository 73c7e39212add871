use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::PipelineStepConfig;

// ── Pipeline file ────────────────────────────────────────────────────────

pub const SUPPORTED_PIPELINE_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineConfigError {
    #[error("unsupported pipeline version {0:?} (expected \"1.0\")")]
    UnsupportedVersion(String),
    #[error("duplicate step id {0:?}")]
    DuplicateId(String),
    #[error("step {id:?} has unknown type {step_type:?}")]
    UnknownStepType { id: String, step_type: String },
    #[error("step {id:?} has invalid config: {reason}")]
    InvalidStepConfig { id: String, reason: String },
    #[error("step {id:?} depends on unknown step {dependency:?}")]
    UnknownDependency { id: String, dependency: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    #[default]
    Stop,
    Continue,
}

fn default_version() -> String {
    SUPPORTED_PIPELINE_VERSION.to_string()
}

fn default_enabled() -> bool {
    true
}

/// An ordered set of steps run against a feature at one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(default)]
    pub steps: Vec<PipelineStepConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            enabled: true,
            on_failure: OnFailure::Stop,
            steps: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Parse and validate. Unknown step types and malformed per-type config
    /// are rejected while parsing, the rest by [`validate`](Self::validate).
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).context("invalid pipeline JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineConfigError> {
        if self.version != SUPPORTED_PIPELINE_VERSION {
            return Err(PipelineConfigError::UnsupportedVersion(self.version.clone()));
        }
        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(PipelineConfigError::DuplicateId(step.id.clone()));
            }
        }
        for step in &self.steps {
            for dep in &step.dependencies {
                if dep == &step.id || !ids.contains(dep.as_str()) {
                    return Err(PipelineConfigError::UnknownDependency {
                        id: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn step(&self, id: &str) -> Option<&PipelineStepConfig> {
        self.steps.iter().find(|s| s.id == id)
    }
}

// ── Engine settings ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Engine configuration. Env vars win over `.env` in the working directory.
#[derive(Debug, Clone)]
pub struct Config {
    /// Fallback model when a feature has none or a family is unknown.
    pub default_model: String,
    pub claude_bin: String,
    pub idle_timeout_ms: u64,
    /// 0 means "same as idle timeout".
    pub startup_timeout_ms: u64,
    pub strict_mode: bool,
    pub project_path: PathBuf,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_model: "sonnet".into(),
            claude_bin: "claude".into(),
            idle_timeout_ms: 300_000,
            startup_timeout_ms: 0,
            strict_mode: true,
            project_path: PathBuf::from("."),
            log_format: LogFormat::Pretty,
        }
    }
}

fn parse_dotenv(path: &Path) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(path) else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            let v = v.trim().trim_matches('"');
            map.insert(k.trim().to_string(), v.to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_env_file(Path::new(".env"))
    }

    pub fn from_env_file(dotenv_path: &Path) -> Result<Self> {
        let dotenv = parse_dotenv(dotenv_path);
        let defaults = Self::default();

        let log_format = match get_str("SHIPYARD_LOG_FORMAT", &dotenv, "pretty").as_str() {
            "json" => LogFormat::Json,
            "pretty" | "text" => LogFormat::Pretty,
            other => anyhow::bail!("SHIPYARD_LOG_FORMAT must be pretty or json, got {other:?}"),
        };

        Ok(Self {
            default_model: get_str("SHIPYARD_MODEL", &dotenv, &defaults.default_model),
            claude_bin: get_str("SHIPYARD_CLAUDE_BIN", &dotenv, &defaults.claude_bin),
            idle_timeout_ms: get_u64("SHIPYARD_IDLE_TIMEOUT_MS", &dotenv, defaults.idle_timeout_ms),
            startup_timeout_ms: get_u64(
                "SHIPYARD_STARTUP_TIMEOUT_MS",
                &dotenv,
                defaults.startup_timeout_ms,
            ),
            strict_mode: get_bool("SHIPYARD_STRICT_MODE", &dotenv, defaults.strict_mode),
            project_path: PathBuf::from(get_str("SHIPYARD_PROJECT_PATH", &dotenv, ".")),
            log_format,
        })
    }

    /// Startup timeout with the "0 = idle timeout" rule applied.
    pub fn effective_startup_timeout_ms(&self) -> u64 {
        if self.startup_timeout_ms == 0 {
            self.idle_timeout_ms
        } else {
            self.startup_timeout_ms
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
