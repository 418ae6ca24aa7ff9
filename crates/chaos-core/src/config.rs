//! Experiment configuration
//!
//! Everything an orchestrator run consumes: durations, pacing, sequence mode,
//! blast radius, and the (timeout, delay) pair behind every state check.

use crate::error::ChaosError;
use crate::types::Sequence;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Experiment run configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Experiment name, used for worker names and events
    pub experiment_name: String,
    /// Total chaos duration in seconds
    pub chaos_duration: u64,
    /// Pacing between inject and revert (fixed or range, seconds)
    pub chaos_interval: ChaosInterval,
    /// Settle period before and after the injection loop, in seconds
    pub ramp_time: u64,
    /// Serial, parallel or random
    pub sequence: Sequence,
    /// Percentage of candidates to target (0 means exactly one, above 100 means all)
    pub affected_percentage: u8,
    /// Upper bound for every state check, in seconds
    pub timeout: u64,
    /// Delay between state-check attempts, in seconds
    pub delay: u64,
    /// What to do with finished workers
    pub cleanup_policy: CleanupPolicy,
    /// Extra labels stamped on every worker
    pub worker_labels: BTreeMap<String, String>,
}

impl ExperimentConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With experiment name
    #[inline]
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.experiment_name = name.into();
        self
    }

    /// With chaos duration in seconds
    #[inline]
    #[must_use]
    pub fn with_duration(mut self, secs: u64) -> Self {
        self.chaos_duration = secs;
        self
    }

    /// With chaos interval
    #[inline]
    #[must_use]
    pub fn with_interval(mut self, interval: ChaosInterval) -> Self {
        self.chaos_interval = interval;
        self
    }

    /// With ramp time in seconds
    #[inline]
    #[must_use]
    pub fn with_ramp_time(mut self, secs: u64) -> Self {
        self.ramp_time = secs;
        self
    }

    /// With sequence mode
    #[inline]
    #[must_use]
    pub fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = sequence;
        self
    }

    /// With affected percentage
    #[inline]
    #[must_use]
    pub fn with_affected_percentage(mut self, percentage: u8) -> Self {
        self.affected_percentage = percentage;
        self
    }

    /// With state-check timeout and delay in seconds
    #[inline]
    #[must_use]
    pub fn with_checks(mut self, timeout: u64, delay: u64) -> Self {
        self.timeout = timeout;
        self.delay = delay;
        self
    }

    /// With cleanup policy
    #[inline]
    #[must_use]
    pub fn with_cleanup_policy(mut self, policy: CleanupPolicy) -> Self {
        self.cleanup_policy = policy;
        self
    }

    /// Validate the configuration before a run
    ///
    /// # Errors
    /// Returns `ChaosError::Config` for an empty name, a zero delay or an
    /// inverted interval range. A percentage above 100 is not an error; the
    /// selector clamps it
    pub fn validate(&self) -> Result<(), ChaosError> {
        if self.experiment_name.trim().is_empty() {
            return Err(ChaosError::config("experiment name must not be empty"));
        }
        if let ChaosInterval::Range { lower, upper } = self.chaos_interval {
            if lower > upper {
                return Err(ChaosError::config(format!(
                    "chaos interval range {lower}-{upper} has lower bound above upper bound"
                )));
            }
        }
        self.retry_policy()?;
        Ok(())
    }

    /// Chaos duration
    #[inline]
    #[must_use]
    pub fn chaos_duration(&self) -> Duration {
        Duration::from_secs(self.chaos_duration)
    }

    /// Ramp time
    #[inline]
    #[must_use]
    pub fn ramp_time(&self) -> Duration {
        Duration::from_secs(self.ramp_time)
    }

    /// Retry policy derived from (timeout, delay)
    ///
    /// # Errors
    /// Returns `ChaosError::Config` when delay is zero
    pub fn retry_policy(&self) -> Result<RetryPolicy, ChaosError> {
        RetryPolicy::from_timeout(
            Duration::from_secs(self.timeout),
            Duration::from_secs(self.delay),
        )
    }
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            experiment_name: "chaos-experiment".to_string(),
            chaos_duration: 30,
            chaos_interval: ChaosInterval::Fixed(10),
            ramp_time: 0,
            sequence: Sequence::Parallel,
            affected_percentage: 0,
            timeout: 180,
            delay: 2,
            cleanup_policy: CleanupPolicy::Delete,
            worker_labels: BTreeMap::new(),
        }
    }
}

/// Pacing delay, fixed or drawn uniformly from a range each time it is used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "IntervalRepr", into = "String")]
pub enum ChaosInterval {
    /// Always this many seconds
    Fixed(u64),
    /// Random seconds in `[lower, upper]`
    Range { lower: u64, upper: u64 },
}

impl ChaosInterval {
    /// Fixed interval from a duration (whole seconds)
    #[inline]
    #[must_use]
    pub fn fixed(secs: u64) -> Self {
        Self::Fixed(secs)
    }

    /// Next wait to apply
    #[must_use]
    pub fn next_wait(&self) -> Duration {
        match *self {
            Self::Fixed(secs) => Duration::from_secs(secs),
            Self::Range { lower, upper } => {
                Duration::from_secs(rand::thread_rng().gen_range(lower..=upper))
            }
        }
    }

    /// Longest wait this interval can produce
    #[inline]
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        match *self {
            Self::Fixed(secs) | Self::Range { upper: secs, .. } => Duration::from_secs(secs),
        }
    }
}

impl Default for ChaosInterval {
    fn default() -> Self {
        Self::Fixed(10)
    }
}

impl FromStr for ChaosInterval {
    type Err = ChaosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| ChaosError::config(format!("could not parse chaos interval '{s}'")))
        };
        match s.split('-').collect::<Vec<_>>().as_slice() {
            [single] => Ok(Self::Fixed(parse(single)?)),
            [lower, upper] => {
                let (lower, upper) = (parse(lower)?, parse(upper)?);
                if lower > upper {
                    return Err(ChaosError::config(format!(
                        "chaos interval range '{s}' has lower bound above upper bound"
                    )));
                }
                Ok(Self::Range { lower, upper })
            }
            _ => Err(ChaosError::config(format!(
                "could not parse chaos interval '{s}', invalid format"
            ))),
        }
    }
}

impl fmt::Display for ChaosInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(secs) => write!(f, "{secs}"),
            Self::Range { lower, upper } => write!(f, "{lower}-{upper}"),
        }
    }
}

impl From<ChaosInterval> for String {
    fn from(value: ChaosInterval) -> Self {
        value.to_string()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IntervalRepr {
    Secs(u64),
    Text(String),
}

impl TryFrom<IntervalRepr> for ChaosInterval {
    type Error = ChaosError;

    fn try_from(value: IntervalRepr) -> Result<Self, Self::Error> {
        match value {
            IntervalRepr::Secs(secs) => Ok(Self::Fixed(secs)),
            IntervalRepr::Text(text) => text.parse(),
        }
    }
}

/// Worker cleanup policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPolicy {
    /// Delete worker objects once finished
    #[default]
    Delete,
    /// Leave finished workers in place for inspection
    Retain,
}

impl FromStr for CleanupPolicy {
    type Err = ChaosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delete" => Ok(Self::Delete),
            "retain" => Ok(Self::Retain),
            other => Err(ChaosError::config(format!(
                "'{other}' cleanup policy is not supported"
            ))),
        }
    }
}

/// Bounded retry policy: `attempts` tries, `delay` apart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of attempts, always at least one
    pub attempts: u32,
    /// Sleep between attempts
    pub delay: Duration,
}

impl RetryPolicy {
    /// Create a policy with explicit attempts
    ///
    /// Zero attempts is raised to one.
    #[inline]
    #[must_use]
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Derive `attempts = timeout / delay`
    ///
    /// # Errors
    /// Returns `ChaosError::Config` when delay is zero
    pub fn from_timeout(timeout: Duration, delay: Duration) -> Result<Self, ChaosError> {
        if delay.is_zero() {
            return Err(ChaosError::config("delay must be greater than zero"));
        }
        let attempts = timeout.as_millis() / delay.as_millis().max(1);
        let attempts = u32::try_from(attempts).unwrap_or(u32::MAX);
        Ok(Self::new(attempts, delay))
    }

    /// Total time spent sleeping if every attempt fails
    #[inline]
    #[must_use]
    pub fn max_sleep(&self) -> Duration {
        self.delay * self.attempts.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ExperimentConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_delay_is_rejected() {
        let config = ExperimentConfig::new().with_checks(60, 0);
        assert!(matches!(config.validate(), Err(ChaosError::Config(_))));
    }

    #[test]
    fn percentage_above_hundred_is_accepted() {
        let config = ExperimentConfig::new().with_affected_percentage(150);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn inverted_interval_range_is_rejected() {
        let config = ExperimentConfig::new().with_interval(ChaosInterval::Range { lower: 9, upper: 3 });
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_policy_from_timeout() {
        let policy =
            RetryPolicy::from_timeout(Duration::from_secs(180), Duration::from_secs(2)).unwrap();
        assert_eq!(policy.attempts, 90);

        // timeout shorter than delay still gets one attempt
        let policy =
            RetryPolicy::from_timeout(Duration::from_secs(1), Duration::from_secs(5)).unwrap();
        assert_eq!(policy.attempts, 1);
        assert_eq!(policy.max_sleep(), Duration::ZERO);
    }

    #[test]
    fn interval_parses_fixed_and_range() {
        assert_eq!("10".parse::<ChaosInterval>().unwrap(), ChaosInterval::Fixed(10));
        assert_eq!(
            "5-15".parse::<ChaosInterval>().unwrap(),
            ChaosInterval::Range { lower: 5, upper: 15 }
        );
        assert!("15-5".parse::<ChaosInterval>().is_err());
        assert!("1-2-3".parse::<ChaosInterval>().is_err());
        assert!("abc".parse::<ChaosInterval>().is_err());
    }

    #[test]
    fn range_interval_stays_in_bounds() {
        let interval = ChaosInterval::Range { lower: 2, upper: 4 };
        for _ in 0..50 {
            let wait = interval.next_wait();
            assert!(wait >= Duration::from_secs(2) && wait <= Duration::from_secs(4));
        }
        assert_eq!(interval.max_wait(), Duration::from_secs(4));
    }

    #[test]
    fn config_deserializes_interval_from_number_or_string() {
        let json = r#"{"experiment_name":"ec2-stop","chaos_interval":"3-6","sequence":"serial"}"#;
        let config: ExperimentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.chaos_interval, ChaosInterval::Range { lower: 3, upper: 6 });
        assert_eq!(config.sequence, Sequence::Serial);
        assert_eq!(config.timeout, 180);

        let json = r#"{"chaos_interval":7}"#;
        let config: ExperimentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.chaos_interval, ChaosInterval::Fixed(7));
    }
}
