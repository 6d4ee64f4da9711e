//! Capture and logging configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config:
//!
//! ```toml
//! [capture]
//! max_results = 200
//! strategy = "uniform_random"
//! seed = 7
//!
//! [capture.label_filter]
//! role = "worker"
//!
//! [log]
//! level = "debug"
//! format = "json"
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::labels::LabelFilter;
use crate::logging::LogConfig;
use crate::sampler::SamplingStrategy;

/// Deepest stack a capture will copy.
pub const MAX_STACK_DEPTH_LIMIT: usize = 1024;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Settings for one [`Capturer`](crate::capture::Capturer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Upper bound on records per capture; 0 means unbounded.
    pub max_results: usize,
    /// Frames copied per task.
    pub max_stack_depth: usize,
    /// How a capped capture picks tasks.
    pub strategy: SamplingStrategy,
    /// Buffer growth factor applied to the population estimate.
    pub growth_headroom: f64,
    /// Fill attempts before giving up on a growing population.
    pub max_retries: u32,
    /// Seed for [`SamplingStrategy::UniformRandom`]; `None` seeds from the OS.
    pub seed: Option<u64>,
    /// Label pairs every returned task must carry.
    pub label_filter: BTreeMap<String, String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_results: 0,
            max_stack_depth: 64,
            strategy: SamplingStrategy::RotatingOffset,
            growth_headroom: 1.1,
            max_retries: 16,
            seed: None,
            label_filter: BTreeMap::new(),
        }
    }
}

impl CaptureConfig {
    /// Parse a bare `CaptureConfig` table and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the capturer cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_stack_depth == 0 || self.max_stack_depth > MAX_STACK_DEPTH_LIMIT {
            return Err(Error::InvalidConfig(format!(
                "max_stack_depth must be in 1..={MAX_STACK_DEPTH_LIMIT}, got {}",
                self.max_stack_depth
            )));
        }
        if !self.growth_headroom.is_finite() || self.growth_headroom < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "growth_headroom must be a finite number >= 1.0, got {}",
                self.growth_headroom
            )));
        }
        if self.max_retries == 0 {
            return Err(Error::InvalidConfig(
                "max_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The configured label filter.
    #[must_use]
    pub fn filter(&self) -> LabelFilter {
        LabelFilter::from(self.label_filter.clone())
    }
}

/// Top-level config document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capture settings.
    pub capture: CaptureConfig,
    /// Logging settings.
    pub log: LogConfig,
}

impl Config {
    /// Parse and validate a full config document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.capture.validate()?;
        Ok(config)
    }
}
