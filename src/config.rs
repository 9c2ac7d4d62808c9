//! Improvement loop configuration
//!
//! Loaded from TOML. Every field has a default so an empty file (or no file)
//! yields the standard 24h window / 3 failures / 6h cooldown / 10+10 A/B setup.

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::ImprovementKind;

/// Configuration for the self-improvement control loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImproverConfig {
    /// Hours of history the analyzer scans
    #[serde(default = "default_analysis_window_hours")]
    pub analysis_window_hours: u64,
    /// Failures within the window needed to trigger
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,
    /// Minimum hours between automatic improvements for one agent
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: u64,
    /// Executions preceding an apply used as the A/B baseline
    #[serde(default = "default_baseline_window")]
    pub baseline_window: usize,
    /// Executions following an apply used as the A/B treatment
    #[serde(default = "default_treatment_window")]
    pub treatment_window: usize,
    /// Allowed treatment mean duration as a multiple of baseline
    #[serde(default = "default_duration_tolerance")]
    pub duration_tolerance: f64,
    /// Seconds to wait for the treatment window before rolling back
    #[serde(default = "default_treatment_timeout_secs")]
    pub treatment_timeout_secs: u64,
    /// p95/p50 ratio above which a latency candidate is proposed
    #[serde(default = "default_latency_spread_ratio")]
    pub latency_spread_ratio: f64,
    /// Capacity of the background improvement queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Kinds never applied automatically even when low risk
    #[serde(default)]
    pub disabled_kinds: Vec<ImprovementKind>,
    /// Where the file-backed stores live
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_analysis_window_hours() -> u64 { 24 }
fn default_failure_threshold() -> usize { 3 }
fn default_cooldown_hours() -> u64 { 6 }
fn default_baseline_window() -> usize { 10 }
fn default_treatment_window() -> usize { 10 }
fn default_duration_tolerance() -> f64 { 1.1 }
fn default_treatment_timeout_secs() -> u64 { 6 * 3600 }
fn default_latency_spread_ratio() -> f64 { 3.0 }
fn default_queue_capacity() -> usize { 64 }

impl Default for ImproverConfig {
    fn default() -> Self {
        Self {
            analysis_window_hours: default_analysis_window_hours(),
            failure_threshold: default_failure_threshold(),
            cooldown_hours: default_cooldown_hours(),
            baseline_window: default_baseline_window(),
            treatment_window: default_treatment_window(),
            duration_tolerance: default_duration_tolerance(),
            treatment_timeout_secs: default_treatment_timeout_secs(),
            latency_spread_ratio: default_latency_spread_ratio(),
            queue_capacity: default_queue_capacity(),
            disabled_kinds: Vec::new(),
            data_dir: None,
        }
    }
}

impl ImproverConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: ImproverConfig = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, else from the default location if it exists
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let default_path = default_config_path();
        if default_path.exists() {
            Self::load(&default_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            anyhow::bail!("failure_threshold must be at least 1");
        }
        if self.baseline_window == 0 || self.treatment_window == 0 {
            anyhow::bail!("baseline_window and treatment_window must be at least 1");
        }
        if self.analysis_window_hours == 0 {
            anyhow::bail!("analysis_window_hours must be at least 1");
        }
        // Zero leaves only the pending slot, set after apply, between two applies
        if self.cooldown_hours == 0 {
            anyhow::bail!("cooldown_hours must be at least 1");
        }
        if !(self.duration_tolerance >= 1.0) {
            anyhow::bail!("duration_tolerance must be >= 1.0, got {}", self.duration_tolerance);
        }
        if !(self.latency_spread_ratio > 1.0) {
            anyhow::bail!("latency_spread_ratio must be > 1.0, got {}", self.latency_spread_ratio);
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }
        Ok(())
    }

    pub fn analysis_window(&self) -> ChronoDuration {
        ChronoDuration::hours(self.analysis_window_hours as i64)
    }

    pub fn cooldown(&self) -> ChronoDuration {
        ChronoDuration::hours(self.cooldown_hours as i64)
    }

    pub fn treatment_timeout(&self) -> Duration {
        Duration::from_secs(self.treatment_timeout_secs)
    }

    /// Directory for the file-backed stores
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }
}

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agent-improve")
}

/// Default config file location
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agent-improve")
        .join("config.toml")
}
