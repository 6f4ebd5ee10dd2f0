use std::time::Duration;

use crate::constants::{
    ABNORMAL_EXIT_POLICY_ENV, COMPILE_TIMEOUT_ENV, DEFAULT_COMPILE_TIMEOUT_MS,
    DEFAULT_SAMPLE_INTERVAL_MS, DEFAULT_STRESS_DELAY_MS, DEFAULT_STRESS_TIME_LIMIT_MS,
    SAMPLE_INTERVAL_ENV, STRESS_DELAY_ENV, STRESS_TIME_LIMIT_ENV,
};
use crate::core::classify::AbnormalExitPolicy;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be a whole number of milliseconds, got {value:?}")]
    InvalidMillis { key: &'static str, value: String },
    #[error("{key} must be a positive number of milliseconds")]
    ZeroInterval { key: &'static str },
    #[error("{key} must be `null-exit-only` or `any-non-zero`, got {value:?}")]
    InvalidPolicy { key: &'static str, value: String },
}

/// Runtime knobs shared by every controller. Zero durations mean "unlimited"
/// for limits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub sample_interval: Duration,
    pub stress_delay: Duration,
    pub stress_time_limit: Duration,
    pub compile_timeout: Duration,
    pub abnormal_exit_policy: AbnormalExitPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(DEFAULT_SAMPLE_INTERVAL_MS),
            stress_delay: Duration::from_millis(DEFAULT_STRESS_DELAY_MS),
            stress_time_limit: Duration::from_millis(DEFAULT_STRESS_TIME_LIMIT_MS),
            compile_timeout: Duration::from_millis(DEFAULT_COMPILE_TIMEOUT_MS),
            abnormal_exit_policy: AbnormalExitPolicy::default(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let sample_interval = millis(&lookup, SAMPLE_INTERVAL_ENV)?
            .unwrap_or(defaults.sample_interval);
        if sample_interval.is_zero() {
            return Err(ConfigError::ZeroInterval {
                key: SAMPLE_INTERVAL_ENV,
            });
        }

        let abnormal_exit_policy = match lookup(ABNORMAL_EXIT_POLICY_ENV) {
            Some(value) => value
                .trim()
                .parse::<AbnormalExitPolicy>()
                .map_err(|value| ConfigError::InvalidPolicy {
                    key: ABNORMAL_EXIT_POLICY_ENV,
                    value,
                })?,
            None => defaults.abnormal_exit_policy,
        };

        Ok(Self {
            sample_interval,
            stress_delay: millis(&lookup, STRESS_DELAY_ENV)?.unwrap_or(defaults.stress_delay),
            stress_time_limit: millis(&lookup, STRESS_TIME_LIMIT_ENV)?
                .unwrap_or(defaults.stress_time_limit),
            compile_timeout: millis(&lookup, COMPILE_TIMEOUT_ENV)?
                .unwrap_or(defaults.compile_timeout),
            abnormal_exit_policy,
        })
    }
}

fn millis<F>(lookup: &F, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(None);
    };
    value
        .trim()
        .parse::<u64>()
        .map(|ms| Some(Duration::from_millis(ms)))
        .map_err(|_| ConfigError::InvalidMillis { key, value })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_is_set() {
        let settings = Settings::from_lookup(|_| None).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.sample_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::from_lookup(lookup_from(&[
            (SAMPLE_INTERVAL_ENV, "25"),
            (STRESS_DELAY_ENV, " 0 "),
            (STRESS_TIME_LIMIT_ENV, "60000"),
            (ABNORMAL_EXIT_POLICY_ENV, "any-non-zero"),
        ]))
        .unwrap();

        assert_eq!(settings.sample_interval, Duration::from_millis(25));
        assert_eq!(settings.stress_delay, Duration::ZERO);
        assert_eq!(settings.stress_time_limit, Duration::from_secs(60));
        assert_eq!(settings.compile_timeout, Duration::from_secs(10));
        assert_eq!(settings.abnormal_exit_policy, AbnormalExitPolicy::AnyNonZero);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert_eq!(
            Settings::from_lookup(lookup_from(&[(COMPILE_TIMEOUT_ENV, "soon")])),
            Err(ConfigError::InvalidMillis {
                key: COMPILE_TIMEOUT_ENV,
                value: "soon".to_string(),
            })
        );
        assert_eq!(
            Settings::from_lookup(lookup_from(&[(SAMPLE_INTERVAL_ENV, "0")])),
            Err(ConfigError::ZeroInterval {
                key: SAMPLE_INTERVAL_ENV,
            })
        );
        assert!(matches!(
            Settings::from_lookup(lookup_from(&[(ABNORMAL_EXIT_POLICY_ENV, "never")])),
            Err(ConfigError::InvalidPolicy { .. })
        ));
    }
}
