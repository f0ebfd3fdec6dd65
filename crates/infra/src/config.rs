//! Pipeline configuration, resolved once at startup from the environment.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `CLAIMFLOW_CONSUME_DELAY_MS` | `10000` |
//! | `CLAIMFLOW_MAX_POLLS` | `1` |
//! | `CLAIMFLOW_POLL_INTERVAL_MS` | `5000` |
//! | `CLAIMFLOW_DRAIN_BATCH` | `100` |
//! | `CLAIMFLOW_CODE_LISTS` | `LASIA_QA_LAB,LASIA_TEST_METHOD,LASIA_SAMPLE_TYPE` |
//! | `CLAIMFLOW_VALIDATION_POLICY` | `advisory` |
//! | `CLAIMFLOW_EVALUATOR_URL` | unset (claims are only logged) |
//! | `CLAIMFLOW_EVALUATOR_TIMEOUT_MS` | `10000` |
//! | `CLAIMFLOW_EVALUATOR_TOKEN` | unset |
//! | `CLAIMFLOW_EVALUATOR_TOKEN_URL` + `_CLIENT_ID` + `_CLIENT_SECRET` + `_USERNAME` + `_PASSWORD` | unset |

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CODE_LISTS: [&str; 3] = ["LASIA_QA_LAB", "LASIA_TEST_METHOD", "LASIA_SAMPLE_TYPE"];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("{0} must be set")]
    Missing(&'static str),
}

/// What the validator does with a claim whose codes are not all allow-listed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPolicy {
    /// Log the outcome and forward anyway.
    #[default]
    Advisory,
    /// Mark the entry failed and stop with `InvalidClaim`.
    Enforce,
}

impl std::str::FromStr for ValidationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "advisory" => Ok(ValidationPolicy::Advisory),
            "enforce" => Ok(ValidationPolicy::Enforce),
            other => Err(format!("expected 'advisory' or 'enforce', got '{other}'")),
        }
    }
}

/// Timing of the deferred consumption task scheduled after each dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumptionSchedule {
    /// Wait before the first drain.
    pub delay: Duration,
    /// Drains attempted per task; `1` is a single one-shot poll.
    pub max_polls: u32,
    /// Wait between an empty drain and the next one.
    pub poll_interval: Duration,
    /// Upper bound on messages taken per drain.
    pub drain_batch: usize,
}

impl Default for ConsumptionSchedule {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(10),
            max_polls: 1,
            poll_interval: Duration::from_secs(5),
            drain_batch: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub consumption: ConsumptionSchedule,
    /// Reference lists whose union is the claim allow-list (cache key order).
    pub allowed_code_lists: Vec<String>,
    pub validation_policy: ValidationPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            consumption: ConsumptionSchedule::default(),
            allowed_code_lists: DEFAULT_CODE_LISTS.iter().map(|s| s.to_string()).collect(),
            validation_policy: ValidationPolicy::default(),
        }
    }
}

/// How the admin credential for the evaluator is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialConfig {
    Static(String),
    PasswordGrant {
        token_url: String,
        client_id: String,
        client_secret: String,
        username: String,
        password: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluatorConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub credential: CredentialConfig,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Resolve from an arbitrary variable lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ConsumptionSchedule::default();
        let consumption = ConsumptionSchedule {
            delay: duration_ms(&lookup, "CLAIMFLOW_CONSUME_DELAY_MS", defaults.delay)?,
            max_polls: positive(&lookup, "CLAIMFLOW_MAX_POLLS", defaults.max_polls)?,
            poll_interval: duration_ms(&lookup, "CLAIMFLOW_POLL_INTERVAL_MS", defaults.poll_interval)?,
            drain_batch: positive(&lookup, "CLAIMFLOW_DRAIN_BATCH", defaults.drain_batch)?,
        };

        let allowed_code_lists = match lookup("CLAIMFLOW_CODE_LISTS") {
            Some(raw) => {
                let lists: Vec<String> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                if lists.is_empty() {
                    return Err(ConfigError::Invalid {
                        var: "CLAIMFLOW_CODE_LISTS",
                        reason: "at least one code list is required".to_string(),
                    });
                }
                lists
            }
            None => PipelineConfig::default().allowed_code_lists,
        };

        let validation_policy = match lookup("CLAIMFLOW_VALIDATION_POLICY") {
            Some(raw) => raw.parse().map_err(|reason| ConfigError::Invalid {
                var: "CLAIMFLOW_VALIDATION_POLICY",
                reason,
            })?,
            None => ValidationPolicy::default(),
        };

        Ok(Self {
            consumption,
            allowed_code_lists,
            validation_policy,
        })
    }
}

impl EvaluatorConfig {
    /// `None` when no evaluator URL is configured.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(base_url) = lookup("CLAIMFLOW_EVALUATOR_URL") else {
            return Ok(None);
        };
        let timeout = duration_ms(&lookup, "CLAIMFLOW_EVALUATOR_TIMEOUT_MS", Duration::from_secs(10))?;

        let credential = match (lookup("CLAIMFLOW_EVALUATOR_TOKEN"), lookup("CLAIMFLOW_EVALUATOR_TOKEN_URL")) {
            (Some(token), _) => CredentialConfig::Static(token),
            (None, Some(token_url)) => {
                let required = |var: &'static str| lookup(var).ok_or(ConfigError::Missing(var));
                CredentialConfig::PasswordGrant {
                    token_url,
                    client_id: required("CLAIMFLOW_EVALUATOR_CLIENT_ID")?,
                    client_secret: required("CLAIMFLOW_EVALUATOR_CLIENT_SECRET")?,
                    username: required("CLAIMFLOW_EVALUATOR_USERNAME")?,
                    password: required("CLAIMFLOW_EVALUATOR_PASSWORD")?,
                }
            }
            (None, None) => return Err(ConfigError::Missing("CLAIMFLOW_EVALUATOR_TOKEN")),
        };

        Ok(Some(Self {
            base_url,
            timeout,
            credential,
        }))
    }
}

fn duration_ms<F>(lookup: &F, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| ConfigError::Invalid {
                var,
                reason: e.to_string(),
            }),
        None => Ok(default),
    }
}

fn positive<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };
    let value: T = raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        reason: e.to_string(),
    })?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            var,
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_match_one_shot_advisory_pipeline() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.consumption.delay, Duration::from_secs(10));
        assert_eq!(config.consumption.max_polls, 1);
        assert_eq!(config.validation_policy, ValidationPolicy::Advisory);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("CLAIMFLOW_CONSUME_DELAY_MS", "250"),
            ("CLAIMFLOW_MAX_POLLS", "3"),
            ("CLAIMFLOW_CODE_LISTS", " A , B ,"),
            ("CLAIMFLOW_VALIDATION_POLICY", "Enforce"),
        ]))
        .unwrap();
        assert_eq!(config.consumption.delay, Duration::from_millis(250));
        assert_eq!(config.consumption.max_polls, 3);
        assert_eq!(config.allowed_code_lists, vec!["A", "B"]);
        assert_eq!(config.validation_policy, ValidationPolicy::Enforce);
    }

    #[test]
    fn zero_polls_and_unknown_policy_are_rejected() {
        assert!(matches!(
            PipelineConfig::from_lookup(lookup(&[("CLAIMFLOW_MAX_POLLS", "0")])),
            Err(ConfigError::Invalid { var: "CLAIMFLOW_MAX_POLLS", .. })
        ));
        assert!(PipelineConfig::from_lookup(lookup(&[("CLAIMFLOW_VALIDATION_POLICY", "strict")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[("CLAIMFLOW_CODE_LISTS", ",")])).is_err());
    }

    #[test]
    fn evaluator_requires_a_credential() {
        assert_eq!(EvaluatorConfig::from_lookup(lookup(&[])).unwrap(), None);
        assert_eq!(
            EvaluatorConfig::from_lookup(lookup(&[("CLAIMFLOW_EVALUATOR_URL", "http://eval")])),
            Err(ConfigError::Missing("CLAIMFLOW_EVALUATOR_TOKEN"))
        );

        let config = EvaluatorConfig::from_lookup(lookup(&[
            ("CLAIMFLOW_EVALUATOR_URL", "http://eval"),
            ("CLAIMFLOW_EVALUATOR_TOKEN", "t"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(config.credential, CredentialConfig::Static("t".to_string()));
    }
}
