//! Pipeline configuration.
//!
//! Resolution order (highest priority first):
//! 1. Environment variables (`OPSENSE_*`)
//! 2. TOML file passed to [`PipelineConfig::load`]
//! 3. Compiled defaults
//!
//! Every field has a default, so a TOML file only needs the keys it changes.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::EmbedModel;

/// Hard cap on evidence chunks per retrieval.
pub const MAX_RETRIEVAL_LIMIT: usize = 8;

/// Hard cap on evidence chunks in the multimodal branch.
pub const MAX_MULTIMODAL_EVIDENCE: usize = 3;

pub const DEFAULT_CHAT_MODEL: &str = "google/gemini-2.5-flash";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid value for {var}: {message}")]
    Env { var: &'static str, message: String },
    #[error("{field}: {message}")]
    Invalid { field: &'static str, message: String },
    #[error("failed to render config: {0}")]
    Render(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_limit: usize,
    pub max_limit: usize,
    pub embed_model: EmbedModel,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: 5,
            max_limit: MAX_RETRIEVAL_LIMIT,
            embed_model: EmbedModel::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatekeeperConfig {
    pub min_question_chars: usize,
    pub harmful_keywords: Vec<String>,
    pub vague_phrases: Vec<String>,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        // Intent phrases only; bare incident nouns stay answerable.
        let harmful = [
            "hack",
            "steal",
            "exfiltrate",
            "write malware",
            "create malware",
            "deploy ransomware",
            "launch a ddos",
            "launch ddos",
            "send phishing",
            "install a keylogger",
            "install keylogger",
            "bypass security",
            "crack password",
        ];
        let vague = [
            "tell me",
            "help",
            "help me",
            "something",
            "anything",
            "stuff",
            "things",
            "info",
            "information",
            "what",
            "why",
            "how",
            "idk",
            "explain",
            "more",
        ];
        Self {
            min_question_chars: 10,
            harmful_keywords: harmful.iter().map(|s| s.to_string()).collect(),
            vague_phrases: vague.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlannerConfig {
    /// Evidence count at which the strategy becomes `focused`.
    pub focused_threshold: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            focused_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalystConfig {
    pub model: String,
    /// Per-chunk excerpt budget in characters.
    pub chunk_char_budget: usize,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for AnalystConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_CHAT_MODEL.to_string(),
            chunk_char_budget: 450,
            temperature: 0.2,
            max_tokens: 1_500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditorConfig {
    /// Score used when the analyst reports no confidence.
    pub baseline_score: f32,
    pub min_answer_chars: usize,
    pub low_confidence_threshold: f32,
}

impl Default for AuditorConfig {
    fn default() -> Self {
        Self {
            baseline_score: 0.75,
            min_answer_chars: 50,
            low_confidence_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QualityGateConfig {
    pub acceptance_threshold: f32,
    /// Extra retrieve/analyse/audit passes allowed when the gate fails.
    pub max_reanalysis_passes: u32,
    /// How many more chunks each extra pass retrieves (still capped).
    pub widen_step: usize,
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: 0.7,
            max_reanalysis_passes: 0,
            widen_step: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct WriterConfig {
    /// Replace the passthrough writer with a polishing call.
    pub polish: bool,
    /// Model for the polishing call; defaults to the analyst model.
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MultimodalConfig {
    pub model: String,
    pub evidence_limit: usize,
    pub max_attachment_bytes: usize,
    pub max_tokens: u32,
}

impl Default for MultimodalConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_CHAT_MODEL.to_string(),
            evidence_limit: MAX_MULTIMODAL_EVIDENCE,
            max_attachment_bytes: 20 * 1_024 * 1_024,
            max_tokens: 2_000,
        }
    }
}

/// Stage-level retry policy for provider rate limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Timeout applied to every evidence-store and provider call.
    pub call_timeout_secs: u64,
    pub retrieval: RetrievalConfig,
    pub gatekeeper: GatekeeperConfig,
    pub planner: PlannerConfig,
    pub analyst: AnalystConfig,
    pub auditor: AuditorConfig,
    pub quality_gate: QualityGateConfig,
    pub writer: WriterConfig,
    pub multimodal: MultimodalConfig,
    pub provider: ProviderConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retrieval: RetrievalConfig::default(),
            gatekeeper: GatekeeperConfig::default(),
            planner: PlannerConfig::default(),
            analyst: AnalystConfig::default(),
            auditor: AuditorConfig::default(),
            quality_gate: QualityGateConfig::default(),
            writer: WriterConfig::default(),
            multimodal: MultimodalConfig::default(),
            provider: ProviderConfig::default(),
            call_timeout_secs: 60,
        }
    }
}

impl PipelineConfig {
    /// Defaults, then the optional TOML file, then `OPSENSE_*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_toml_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::Parse {
            path: "<string>".to_string(),
            message: e.to_string(),
        })
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Render(e.to_string()))
    }

    /// Apply overrides from a variable lookup. Takes a closure so tests don't
    /// have to mutate the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("OPSENSE_ANALYST_MODEL") {
            self.analyst.model = v;
        }
        if let Some(v) = lookup("OPSENSE_MULTIMODAL_MODEL") {
            self.multimodal.model = v;
        }
        if let Some(v) = lookup("OPSENSE_RETRIEVAL_LIMIT") {
            self.retrieval.default_limit = parse_env("OPSENSE_RETRIEVAL_LIMIT", &v)?;
        }
        if let Some(v) = lookup("OPSENSE_QUALITY_THRESHOLD") {
            self.quality_gate.acceptance_threshold = parse_env("OPSENSE_QUALITY_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("OPSENSE_MAX_REANALYSIS") {
            self.quality_gate.max_reanalysis_passes = parse_env("OPSENSE_MAX_REANALYSIS", &v)?;
        }
        if let Some(v) = lookup("OPSENSE_CALL_TIMEOUT_SECS") {
            self.call_timeout_secs = parse_env("OPSENSE_CALL_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("OPSENSE_POLISH") {
            self.writer.polish = parse_env("OPSENSE_POLISH", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |field: &'static str, value: f32| {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(ConfigError::Invalid {
                    field,
                    message: format!("must be between 0.0 and 1.0, got {value}"),
                })
            }
        };
        unit("auditor.baseline_score", self.auditor.baseline_score)?;
        unit(
            "auditor.low_confidence_threshold",
            self.auditor.low_confidence_threshold,
        )?;
        unit(
            "quality_gate.acceptance_threshold",
            self.quality_gate.acceptance_threshold,
        )?;

        if self.retrieval.default_limit == 0 {
            return Err(invalid("retrieval.default_limit", "must be at least 1"));
        }
        if self.retrieval.max_limit > MAX_RETRIEVAL_LIMIT {
            return Err(invalid(
                "retrieval.max_limit",
                format!("must not exceed {MAX_RETRIEVAL_LIMIT}"),
            ));
        }
        if self.retrieval.default_limit > self.retrieval.max_limit {
            return Err(invalid(
                "retrieval.default_limit",
                "must not exceed retrieval.max_limit",
            ));
        }
        if self.multimodal.evidence_limit > MAX_MULTIMODAL_EVIDENCE {
            return Err(invalid(
                "multimodal.evidence_limit",
                format!("must not exceed {MAX_MULTIMODAL_EVIDENCE}"),
            ));
        }
        if self.analyst.model.trim().is_empty() {
            return Err(invalid("analyst.model", "must not be empty"));
        }
        if self.multimodal.model.trim().is_empty() {
            return Err(invalid("multimodal.model", "must not be empty"));
        }
        if self.analyst.chunk_char_budget == 0 {
            return Err(invalid("analyst.chunk_char_budget", "must be at least 1"));
        }
        if self.call_timeout_secs == 0 {
            return Err(invalid("call_timeout_secs", "must be greater than 0"));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn writer_model(&self) -> &str {
        self.writer.model.as_deref().unwrap_or(&self.analyst.model)
    }
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

fn parse_env<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Env {
        var,
        message: e.to_string(),
    })
}
