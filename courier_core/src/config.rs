//! Tunables of the pipeline.

use crate::entity::EntityKind;
use crate::queue::QueueName;
use crate::retry::{Backoff, RetryPolicies, RetryPolicy};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// A value per entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerKind<T> {
    /// Value for titles.
    pub app: T,
    /// Value for bundles.
    pub package: T,
    /// Value for accounts.
    pub player: T,
    /// Value for collectives.
    pub group: T,
}

impl<T> PerKind<T> {
    /// The value for `kind`.
    pub fn get(&self, kind: EntityKind) -> &T {
        match kind {
            EntityKind::App => &self.app,
            EntityKind::Package => &self.package,
            EntityKind::Player => &self.player,
            EntityKind::Group => &self.group,
        }
    }
}

/// How long a refresh request blocks further requests for the same entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupConfig {
    /// Guard lifetime per kind.
    pub ttl: PerKind<Duration>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl: PerKind {
                app: Duration::from_secs(60),
                package: Duration::from_secs(60),
                player: Duration::from_secs(5 * 60),
                group: Duration::from_secs(5 * 60),
            },
        }
    }
}

/// How long a stored document counts as fresh enough to skip a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessConfig {
    /// Freshness window per kind.
    pub window: PerKind<Duration>,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            window: PerKind {
                app: Duration::from_secs(5 * 60),
                package: Duration::from_secs(5 * 60),
                player: Duration::from_secs(60 * 60),
                group: Duration::from_secs(60 * 60),
            },
        }
    }
}

/// What the dead-letter callback learns about a dead-lettered envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterInfo {
    /// Queue the envelope was consumed from.
    pub queue: QueueName,
    /// Handler that consumed it, if it got that far.
    pub handler: Option<String>,
    /// Queue the envelope was originally produced on, if it could be decoded.
    pub origin_queue: Option<QueueName>,
    /// Attempt the envelope was on, if it could be decoded.
    pub attempt: Option<u32>,
    /// Why it was dead-lettered.
    pub error_message: String,
}

/// Called whenever an envelope lands on the dead-letter queue.
pub trait DeadLetterCallback: Send + Sync {
    /// Observes one dead letter.
    fn on_dead_letter(&self, info: &DeadLetterInfo);
}

impl<F> DeadLetterCallback for F
where
    F: Fn(&DeadLetterInfo) + Send + Sync,
{
    fn on_dead_letter(&self, info: &DeadLetterInfo) {
        self(info)
    }
}

/// Configuration of the dispatch loops and the delay queue.
#[derive(Clone)]
pub struct PipelineConfig {
    /// How long one fetch waits for messages on an empty queue.
    pub fetch_wait: Duration,
    /// Fixed sleep per envelope on the delay queue.
    pub delay_throttle: Duration,
    /// First backoff after a failed fetch. Doubles on every consecutive failure.
    pub fetch_error_backoff: Duration,
    /// Upper bound of the fetch error backoff.
    pub max_fetch_error_backoff: Duration,
    /// Retry policies by origin queue.
    pub retry_policies: RetryPolicies,
    /// Invoked for every dead letter.
    pub on_dead_letter: Option<Arc<dyn DeadLetterCallback>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_wait: Duration::from_secs(1),
            delay_throttle: Duration::from_millis(50),
            fetch_error_backoff: Duration::from_secs(1),
            max_fetch_error_backoff: Duration::from_secs(60),
            retry_policies: RetryPolicies::default(),
            on_dead_letter: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("fetch_wait", &self.fetch_wait)
            .field("delay_throttle", &self.delay_throttle)
            .field("fetch_error_backoff", &self.fetch_error_backoff)
            .field("max_fetch_error_backoff", &self.max_fetch_error_backoff)
            .field("retry_policies", &self.retry_policies)
            .field(
                "on_dead_letter",
                &self.on_dead_letter.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

/// Returned when an environment override cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid value '{value}' for {key}")]
pub struct ConfigError {
    /// The offending variable.
    pub key: String,
    /// Its value.
    pub value: String,
}

impl PipelineConfig {
    /// Defaults overridden by `COURIER_*` environment variables.
    ///
    /// | Variable | Meaning |
    /// |---|---|
    /// | `COURIER_FETCH_WAIT_MS` | [`fetch_wait`](Self::fetch_wait) |
    /// | `COURIER_DELAY_THROTTLE_MS` | [`delay_throttle`](Self::delay_throttle) |
    /// | `COURIER_MAX_ATTEMPTS` | default policy `max_attempts` |
    /// | `COURIER_MAX_AGE_SECS` | default policy `max_age` |
    /// | `COURIER_RETRY_INITIAL_MS` | default policy exponential `initial` |
    /// | `COURIER_RETRY_MAX_MS` | default policy exponential `max` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(ms) = parse::<u64>(&lookup, "COURIER_FETCH_WAIT_MS")? {
            config.fetch_wait = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "COURIER_DELAY_THROTTLE_MS")? {
            config.delay_throttle = Duration::from_millis(ms);
        }

        let mut policy: RetryPolicy = config.retry_policies.default;
        if let Some(max_attempts) = parse::<u32>(&lookup, "COURIER_MAX_ATTEMPTS")? {
            policy.max_attempts = max_attempts;
        }
        if let Some(secs) = parse::<u64>(&lookup, "COURIER_MAX_AGE_SECS")? {
            policy.max_age = Duration::from_secs(secs);
        }
        let initial = parse::<u64>(&lookup, "COURIER_RETRY_INITIAL_MS")?;
        let max = parse::<u64>(&lookup, "COURIER_RETRY_MAX_MS")?;
        if initial.is_some() || max.is_some() {
            let (default_initial, default_max) = match policy.backoff {
                Backoff::Exponential { initial, max } => (initial, max),
                Backoff::Linear { step } => (step, step),
            };
            policy.backoff = Backoff::Exponential {
                initial: initial.map_or(default_initial, Duration::from_millis),
                max: max.map_or(default_max, Duration::from_millis),
            };
        }
        config.retry_policies.default = policy;
        Ok(config)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value.trim().parse().map(Some).map_err(|_| ConfigError {
            key: key.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn pipeline_config_has_sensible_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.fetch_wait, Duration::from_secs(1));
        assert_eq!(config.fetch_error_backoff, Duration::from_secs(1));
        assert_eq!(config.max_fetch_error_backoff, Duration::from_secs(60));
        assert!(config.on_dead_letter.is_none());
    }

    #[test]
    fn overrides_are_read_from_the_environment() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("COURIER_FETCH_WAIT_MS", "250"),
            ("COURIER_MAX_ATTEMPTS", " 4 "),
            ("COURIER_RETRY_INITIAL_MS", "500"),
        ]))
        .unwrap();
        assert_eq!(config.fetch_wait, Duration::from_millis(250));
        let policy = config.retry_policies.default;
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(
            policy.backoff,
            Backoff::Exponential {
                initial: Duration::from_millis(500),
                max: Duration::from_secs(3600),
            }
        );
    }

    #[test]
    fn unparsable_overrides_are_rejected() {
        let err =
            PipelineConfig::from_lookup(lookup(&[("COURIER_MAX_AGE_SECS", "a day")])).unwrap_err();
        assert_eq!(err.key, "COURIER_MAX_AGE_SECS");
        assert_eq!(err.value, "a day");
    }

    #[test]
    fn debug_hides_the_callback() {
        let config = PipelineConfig {
            on_dead_letter: Some(Arc::new(|_: &DeadLetterInfo| {})),
            ..PipelineConfig::default()
        };
        assert!(format!("{:?}", config).contains("Some(\"<callback>\")"));
    }

    #[test]
    fn per_kind_values() {
        let dedup = DedupConfig::default();
        assert_eq!(*dedup.ttl.get(EntityKind::App), Duration::from_secs(60));
        let freshness = FreshnessConfig::default();
        assert_eq!(
            *freshness.window.get(EntityKind::Player),
            Duration::from_secs(3600)
        );
    }
}
