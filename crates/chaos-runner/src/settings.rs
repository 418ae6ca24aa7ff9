//! Experiment settings
//!
//! Layered in order, later layers winning:
//! 1. Config file (`.toml`, `.yaml`/`.yml` or `.json`), or defaults
//! 2. Environment variables, under the names experiment pods are given
//! 3. Command-line flags

use chaos_core::{ChaosInterval, CleanupPolicy, ExperimentConfig, Sequence};
use std::ffi::OsStr;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Settings loading errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// Config file could not be read
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid for its format
    #[error("failed to parse config file {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    /// Extension does not name a known format
    #[error("unsupported config file {}, expected .toml, .yaml, .yml or .json", .0.display())]
    UnsupportedFormat(PathBuf),

    /// Environment variable holds an unusable value
    #[error("invalid value '{value}' for {var}: {reason}")]
    Env {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Command-line overrides; `None` keeps the file/environment value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub name: Option<String>,
    pub duration: Option<u64>,
    pub interval: Option<ChaosInterval>,
    pub ramp_time: Option<u64>,
    pub sequence: Option<Sequence>,
    pub percentage: Option<u8>,
}

impl Overrides {
    /// Apply every set override to `config`
    #[must_use]
    pub fn apply(&self, mut config: ExperimentConfig) -> ExperimentConfig {
        if let Some(name) = &self.name {
            config.experiment_name.clone_from(name);
        }
        if let Some(duration) = self.duration {
            config.chaos_duration = duration;
        }
        if let Some(interval) = self.interval {
            config.chaos_interval = interval;
        }
        if let Some(ramp) = self.ramp_time {
            config.ramp_time = ramp;
        }
        if let Some(sequence) = self.sequence {
            config.sequence = sequence;
        }
        if let Some(percentage) = self.percentage {
            config.affected_percentage = percentage;
        }
        config
    }
}

/// Load settings from every layer
///
/// # Errors
/// Any [`SettingsError`] from the file or environment layer
pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<ExperimentConfig, SettingsError> {
    let config = match path {
        Some(path) => from_file(path)?,
        None => ExperimentConfig::default(),
    };
    let config = apply_env(config, |var| std::env::var(var).ok())?;
    Ok(overrides.apply(config))
}

/// Read a config file, picking the format from its extension
///
/// # Errors
/// `Read`, `Parse` or `UnsupportedFormat`
pub fn from_file(path: &Path) -> Result<ExperimentConfig, SettingsError> {
    let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(path, &text)
}

fn parse(path: &Path, text: &str) -> Result<ExperimentConfig, SettingsError> {
    let extension = path
        .extension()
        .and_then(OsStr::to_str)
        .map(str::to_ascii_lowercase);

    let parsed = match extension.as_deref() {
        Some("toml") => toml::from_str(text).map_err(|e| e.to_string()),
        Some("yaml" | "yml") => serde_yaml::from_str(text).map_err(|e| e.to_string()),
        Some("json") => serde_json::from_str(text).map_err(|e| e.to_string()),
        _ => return Err(SettingsError::UnsupportedFormat(path.to_path_buf())),
    };

    parsed.map_err(|reason| SettingsError::Parse {
        path: path.to_path_buf(),
        reason,
    })
}

/// Apply environment overrides read through `lookup`
///
/// Unset and empty variables keep the current value.
///
/// # Errors
/// `SettingsError::Env` for a value that does not parse
pub fn apply_env(
    mut config: ExperimentConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ExperimentConfig, SettingsError> {
    let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

    if let Some(name) = get("EXPERIMENT_NAME") {
        config.experiment_name = name;
    }
    if let Some(v) = get("CHAOS_DURATION") {
        config.chaos_duration = parse_var("CHAOS_DURATION", &v)?;
    }
    if let Some(v) = get("CHAOS_INTERVAL") {
        config.chaos_interval = parse_var::<ChaosInterval>("CHAOS_INTERVAL", &v)?;
    }
    if let Some(v) = get("RAMP_TIME") {
        config.ramp_time = parse_var("RAMP_TIME", &v)?;
    }
    if let Some(v) = get("SEQUENCE") {
        config.sequence = parse_var::<Sequence>("SEQUENCE", &v)?;
    }
    if let Some(v) = get("TARGETS_AFFECTED_PERC") {
        config.affected_percentage = parse_var("TARGETS_AFFECTED_PERC", &v)?;
    }
    if let Some(v) = get("TIMEOUT") {
        config.timeout = parse_var("TIMEOUT", &v)?;
    }
    if let Some(v) = get("DELAY") {
        config.delay = parse_var("DELAY", &v)?;
    }
    if let Some(v) = get("JOB_CLEANUP_POLICY") {
        config.cleanup_policy = parse_var::<CleanupPolicy>("JOB_CLEANUP_POLICY", &v)?;
    }
    Ok(config)
}

fn parse_var<T>(var: &'static str, value: &str) -> Result<T, SettingsError>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse().map_err(|e: T::Err| SettingsError::Env {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
