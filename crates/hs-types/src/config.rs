//! Search configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config_error;
use crate::errors::{ConfigError, HsResult};

/// Whether we are maximizing or minimizing the primary metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl Default for ObjectiveDirection {
    fn default() -> Self {
        Self::Maximize
    }
}

impl ObjectiveDirection {
    /// Strictly better; equal values are never better.
    pub fn is_better(self, candidate: f64, current: f64) -> bool {
        match self {
            Self::Maximize => candidate > current,
            Self::Minimize => candidate < current,
        }
    }
}

/// Primary metric plus the direction it is optimized in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Objective {
    pub metric: String,
    pub direction: ObjectiveDirection,
}

/// Early termination policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyConfig {
    /// Cancel trials whose best value falls outside a slack of the best trial
    /// at the same checkpoint. Exactly one of `slack_factor` or
    /// `slack_amount` must be set.
    Bandit {
        #[serde(default)]
        slack_factor: Option<f64>,
        #[serde(default)]
        slack_amount: Option<f64>,
        #[serde(default = "default_interval")]
        evaluation_interval: u64,
        #[serde(default)]
        delay_evaluation: u64,
    },
    /// Cancel trials whose best value is worse than the median of the other
    /// trials' running averages at the same checkpoint.
    MedianStopping {
        #[serde(default = "default_interval")]
        evaluation_interval: u64,
        #[serde(default)]
        delay_evaluation: u64,
    },
    /// Cancel trials ranking in the worst `truncation_percentage` percent at
    /// the same checkpoint.
    TruncationSelection {
        truncation_percentage: u32,
        #[serde(default = "default_interval")]
        evaluation_interval: u64,
        #[serde(default)]
        delay_evaluation: u64,
    },
}

fn default_interval() -> u64 {
    1
}

impl PolicyConfig {
    pub fn bandit(slack_factor: f64) -> Self {
        Self::Bandit {
            slack_factor: Some(slack_factor),
            slack_amount: None,
            evaluation_interval: 1,
            delay_evaluation: 0,
        }
    }

    pub fn validate(&self) -> HsResult<()> {
        let invalid = |message: &str| -> HsResult<()> {
            Err(ConfigError::InvalidPolicy {
                message: message.to_string(),
            }
            .into())
        };

        let interval = match self {
            Self::Bandit {
                evaluation_interval,
                ..
            }
            | Self::MedianStopping {
                evaluation_interval,
                ..
            }
            | Self::TruncationSelection {
                evaluation_interval,
                ..
            } => *evaluation_interval,
        };
        if interval == 0 {
            return invalid("evaluation_interval must be >= 1");
        }

        match self {
            Self::Bandit {
                slack_factor,
                slack_amount,
                ..
            } => match (slack_factor, slack_amount) {
                (Some(f), None) if f.is_finite() && *f >= 0.0 => Ok(()),
                (None, Some(a)) if a.is_finite() && *a >= 0.0 => Ok(()),
                (Some(_), Some(_)) | (None, None) => {
                    invalid("bandit needs exactly one of slack_factor or slack_amount")
                }
                _ => invalid("bandit slack must be a non-negative number"),
            },
            Self::MedianStopping { .. } => Ok(()),
            Self::TruncationSelection {
                truncation_percentage,
                ..
            } => {
                if (1..=99).contains(truncation_percentage) {
                    Ok(())
                } else {
                    invalid("truncation_percentage must be between 1 and 99")
                }
            }
        }
    }
}

/// Top-level configuration for a search. Immutable once the search starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_name")]
    pub name: String,

    /// Metric used to rank trials (e.g. "AUC").
    pub primary_metric: String,

    #[serde(default)]
    pub goal: ObjectiveDirection,

    pub max_total_trials: usize,

    pub max_concurrent_trials: usize,

    /// Wall-clock budget for the whole search, in milliseconds.
    #[serde(default)]
    pub max_duration_ms: Option<u64>,

    /// How long a cancelled trial may take to acknowledge before it is
    /// written off.
    #[serde(default = "default_grace_ms")]
    pub cancellation_grace_ms: u64,

    #[serde(default)]
    pub policy: Option<PolicyConfig>,
}

fn default_name() -> String {
    "hypersweep".to_string()
}

fn default_grace_ms() -> u64 {
    5_000
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            primary_metric: String::new(),
            goal: ObjectiveDirection::Maximize,
            max_total_trials: 20,
            max_concurrent_trials: 4,
            max_duration_ms: None,
            cancellation_grace_ms: default_grace_ms(),
            policy: None,
        }
    }
}

impl SearchConfig {
    pub fn new(primary_metric: &str, goal: ObjectiveDirection) -> Self {
        Self {
            primary_metric: primary_metric.to_string(),
            goal,
            ..Default::default()
        }
    }

    pub fn with_max_total_trials(mut self, n: usize) -> Self {
        self.max_total_trials = n;
        self
    }

    pub fn with_max_concurrent_trials(mut self, n: usize) -> Self {
        self.max_concurrent_trials = n;
        self
    }

    /// Kept in whole milliseconds; anything shorter than 1 ms counts as 1 ms.
    pub fn with_max_duration(mut self, duration: Duration) -> Self {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.max_duration_ms = Some(millis.max(1));
        self
    }

    pub fn with_cancellation_grace(mut self, grace: Duration) -> Self {
        self.cancellation_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_policy(mut self, policy: PolicyConfig) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn objective(&self) -> Objective {
        Objective {
            metric: self.primary_metric.clone(),
            direction: self.goal,
        }
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_ms.map(Duration::from_millis)
    }

    pub fn cancellation_grace(&self) -> Duration {
        Duration::from_millis(self.cancellation_grace_ms)
    }

    pub fn validate(&self) -> HsResult<()> {
        if self.primary_metric.trim().is_empty() {
            return Err(config_error!("primary_metric must not be empty"));
        }
        if self.max_total_trials == 0 {
            return Err(config_error!("max_total_trials must be >= 1"));
        }
        if self.max_concurrent_trials == 0 {
            return Err(config_error!("max_concurrent_trials must be >= 1"));
        }
        if self.max_duration_ms == Some(0) {
            return Err(config_error!("max_duration_ms must be >= 1 when set"));
        }
        if let Some(policy) = &self.policy {
            policy.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HsError;

    fn sample_config() -> SearchConfig {
        SearchConfig::new("AUC", ObjectiveDirection::Maximize)
            .with_max_total_trials(6)
            .with_max_concurrent_trials(4)
    }

    #[test]
    fn valid_config_passes() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn zero_limits_are_rejected() {
        let err = sample_config().with_max_total_trials(0).validate();
        assert!(matches!(
            err,
            Err(HsError::Config(ConfigError::InvalidSearch { .. }))
        ));
        assert!(sample_config()
            .with_max_concurrent_trials(0)
            .validate()
            .is_err());
    }

    #[test]
    fn sub_second_budget_is_kept() {
        let config = sample_config().with_max_duration(Duration::from_millis(250));
        assert_eq!(config.max_duration(), Some(Duration::from_millis(250)));
        assert!(config.validate().is_ok());

        let config = sample_config().with_max_duration(Duration::from_micros(10));
        assert_eq!(config.max_duration(), Some(Duration::from_millis(1)));

        let mut config = sample_config();
        config.max_duration_ms = Some(0);
        assert!(matches!(
            config.validate(),
            Err(HsError::Config(ConfigError::InvalidSearch { .. }))
        ));
    }

    #[test]
    fn empty_metric_is_rejected() {
        let config = SearchConfig::new("  ", ObjectiveDirection::Minimize);
        assert!(config.validate().is_err());
    }

    #[test]
    fn bandit_needs_exactly_one_slack() {
        let both = PolicyConfig::Bandit {
            slack_factor: Some(0.1),
            slack_amount: Some(0.2),
            evaluation_interval: 1,
            delay_evaluation: 0,
        };
        assert!(matches!(
            sample_config().with_policy(both).validate(),
            Err(HsError::Config(ConfigError::InvalidPolicy { .. }))
        ));
        assert!(sample_config()
            .with_policy(PolicyConfig::bandit(0.1))
            .validate()
            .is_ok());
    }

    #[test]
    fn truncation_percentage_bounds() {
        let policy = PolicyConfig::TruncationSelection {
            truncation_percentage: 100,
            evaluation_interval: 1,
            delay_evaluation: 0,
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn direction_comparisons() {
        assert!(ObjectiveDirection::Maximize.is_better(0.9, 0.8));
        assert!(!ObjectiveDirection::Maximize.is_better(0.8, 0.8));
        assert!(ObjectiveDirection::Minimize.is_better(0.1, 0.2));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let json = r#"{
            "primary_metric": "AUC",
            "goal": "maximize",
            "max_total_trials": 6,
            "max_concurrent_trials": 4,
            "policy": {"type": "bandit", "slack_factor": 0.2}
        }"#;
        let config: SearchConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.name, "hypersweep");
        assert_eq!(config.cancellation_grace_ms, 5_000);
        assert_eq!(config.max_duration(), None);

        let timed: SearchConfig = serde_json::from_str(
            r#"{"primary_metric": "AUC", "max_total_trials": 2, "max_concurrent_trials": 1, "max_duration_ms": 1500}"#,
        )
        .unwrap();
        assert_eq!(timed.max_duration(), Some(Duration::from_millis(1500)));
        assert_eq!(
            config.policy,
            Some(PolicyConfig::Bandit {
                slack_factor: Some(0.2),
                slack_amount: None,
                evaluation_interval: 1,
                delay_evaluation: 0,
            })
        );
        assert!(config.validate().is_ok());
    }
}
