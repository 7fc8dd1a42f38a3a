//! Retry policies and the decision the delay queue takes for each envelope.

use crate::envelope::Envelope;
use crate::queue::QueueName;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// How long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Waits `step * (attempt - 1)` before the given attempt.
    Linear {
        /// Increment per attempt.
        step: Duration,
    },
    /// Waits `initial * 2^(attempt - 2)` before the given attempt, capped at `max`.
    Exponential {
        /// Wait before the second attempt.
        initial: Duration,
        /// Upper bound of a single wait.
        max: Duration,
    },
}

impl Backoff {
    /// The wait before `attempt`. The first attempt never waits.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        match self {
            Backoff::Linear { step } => step.saturating_mul(attempt - 1),
            Backoff::Exponential { initial, max } => {
                // 2^63 already saturates any realistic initial delay
                let exponent = (attempt - 2).min(63);
                let initial_ms = initial.as_millis().min(u64::MAX as u128) as u64;
                let delay_ms = initial_ms.saturating_mul(2u64.saturating_pow(exponent));
                Duration::from_millis(delay_ms).min(*max)
            }
        }
    }

    /// Total wait accumulated from the first attempt up to and including `attempt`.
    ///
    /// Never decreases as `attempt` grows.
    pub fn total_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        match self {
            Backoff::Linear { step } => {
                let n = attempt as u128;
                let steps = (n - 1) * n / 2;
                let total_ms = step.as_millis().saturating_mul(steps);
                Duration::from_millis(total_ms.min(u64::MAX as u128) as u64)
            }
            Backoff::Exponential { max, .. } => {
                // Past 64 doublings every wait is capped at `max`
                let summed = attempt.min(65);
                let mut total = (2..=summed).fold(Duration::ZERO, |acc, a| {
                    acc.saturating_add(self.delay_for(a))
                });
                if attempt > summed {
                    total = total.saturating_add(max.saturating_mul(attempt - summed));
                }
                total
            }
        }
    }
}

/// Limits and pacing for retries of envelopes from one origin queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed before the envelope is dead-lettered.
    pub max_attempts: u32,
    /// Age after which the envelope is dead-lettered regardless of attempts.
    pub max_age: Duration,
    /// Pacing between attempts.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            max_age: Duration::from_secs(24 * 60 * 60),
            backoff: Backoff::Exponential {
                initial: Duration::from_secs(30),
                max: Duration::from_secs(60 * 60),
            },
        }
    }
}

impl RetryPolicy {
    /// Earliest time an envelope first seen at `first_seen` may run its `attempt`.
    pub fn next_eligible(&self, first_seen: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        TimeDelta::from_std(self.backoff.total_for(attempt))
            .ok()
            .and_then(|wait| first_seen.checked_add_signed(wait))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Retry policies by origin queue.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicies {
    /// Policy for queues without an override.
    pub default: RetryPolicy,
    overrides: HashMap<QueueName, RetryPolicy>,
}

impl RetryPolicies {
    /// Uses `default` for every queue.
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    /// Uses `policy` for envelopes originating from `queue`.
    pub fn with_override(mut self, queue: QueueName, policy: RetryPolicy) -> Self {
        self.overrides.insert(queue, policy);
        self
    }

    /// The policy for envelopes originating from `queue`.
    pub fn for_queue(&self, queue: QueueName) -> &RetryPolicy {
        self.overrides.get(&queue).unwrap_or(&self.default)
    }

    /// Decides what the delay queue does with `envelope` at `now`.
    ///
    /// `producible` tells whether this process may publish to a queue.
    pub fn evaluate<P>(
        &self,
        envelope: &Envelope<P>,
        now: DateTime<Utc>,
        producible: impl Fn(QueueName) -> bool,
    ) -> DelayVerdict {
        let origin = envelope.origin_queue;
        if origin.is_bookkeeping() || !producible(origin) {
            return DelayVerdict::DeadLetter(DeadLetterReason::Misrouted(origin));
        }

        let policy = self.for_queue(origin);
        let age = envelope.age(now);
        if TimeDelta::from_std(policy.max_age).is_ok_and(|max_age| age > max_age) {
            return DelayVerdict::DeadLetter(DeadLetterReason::AgeExceeded {
                age_secs: age.num_seconds(),
            });
        }
        if envelope.attempt > policy.max_attempts {
            return DelayVerdict::DeadLetter(DeadLetterReason::AttemptsExceeded {
                attempt: envelope.attempt,
                max_attempts: policy.max_attempts,
            });
        }
        if policy.next_eligible(envelope.first_seen, envelope.attempt) > now {
            return DelayVerdict::Park;
        }
        DelayVerdict::Release(origin)
    }
}

/// What the delay queue does with one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelayVerdict {
    /// Move the envelope to the dead-letter queue.
    DeadLetter(DeadLetterReason),
    /// Not eligible yet: put it back on the delay queue unchanged.
    Park,
    /// Eligible: return it to its origin queue.
    Release(QueueName),
}

/// Why the delay queue dead-lettered an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// The origin queue cannot take the envelope back.
    Misrouted(QueueName),
    /// The envelope outlived its policy's maximum age.
    AgeExceeded {
        /// Age of the envelope in seconds.
        age_secs: i64,
    },
    /// The envelope used up its attempts.
    AttemptsExceeded {
        /// The attempt that was about to run.
        attempt: u32,
        /// The policy ceiling.
        max_attempts: u32,
    },
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterReason::Misrouted(queue) => {
                write!(f, "origin queue '{}' cannot receive retries", queue)
            }
            DeadLetterReason::AgeExceeded { age_secs } => {
                write!(f, "envelope too old ({}s)", age_secs)
            }
            DeadLetterReason::AttemptsExceeded {
                attempt,
                max_attempts,
            } => write!(f, "attempt {} exceeds maximum of {}", attempt, max_attempts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn envelope(attempt: u32, first_seen: DateTime<Utc>, origin: QueueName) -> Envelope<()> {
        Envelope {
            message: (),
            attempt,
            first_seen,
            origin_queue: origin,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            max_age: Duration::from_secs(3600),
            backoff: Backoff::Linear {
                step: Duration::from_secs(60),
            },
        }
    }

    #[test]
    fn first_attempt_never_waits() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        };
        assert_eq!(backoff.delay_for(0), Duration::ZERO);
        assert_eq!(backoff.delay_for(1), Duration::ZERO);
        assert_eq!(backoff.delay_for(2), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(10), Duration::from_secs(60));
    }

    #[test]
    fn linear_backoff_accumulates() {
        let backoff = Backoff::Linear {
            step: Duration::from_secs(60),
        };
        assert_eq!(backoff.delay_for(3), Duration::from_secs(120));
        assert_eq!(backoff.total_for(3), Duration::from_secs(60 + 120));
    }

    #[test]
    fn backoff_is_monotone_in_attempt() {
        let policies = [
            Backoff::Linear {
                step: Duration::from_millis(250),
            },
            Backoff::Exponential {
                initial: Duration::from_secs(30),
                max: Duration::from_secs(3600),
            },
        ];
        for backoff in policies {
            let mut previous = Duration::ZERO;
            for attempt in (0..200).chain([1_000, 100_000, u32::MAX]) {
                let total = backoff.total_for(attempt);
                assert!(total >= previous, "{:?} decreased at {}", backoff, attempt);
                previous = total;
            }
        }
    }

    #[test]
    fn huge_attempts_saturate_instead_of_overflowing() {
        let policy = RetryPolicy {
            backoff: Backoff::Exponential {
                initial: Duration::from_secs(u64::MAX / 2),
                max: Duration::MAX,
            },
            ..policy()
        };
        assert_eq!(
            policy.next_eligible(t0(), u32::MAX),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[test]
    fn bookkeeping_and_undeclared_origins_are_misrouted() {
        let policies = RetryPolicies::new(policy());
        for origin in [QueueName::Delay, QueueName::Failed] {
            assert_eq!(
                policies.evaluate(&envelope(2, t0(), origin), t0(), |_| true),
                DelayVerdict::DeadLetter(DeadLetterReason::Misrouted(origin))
            );
        }
        assert_eq!(
            policies.evaluate(&envelope(2, t0(), QueueName::App), t0(), |_| false),
            DelayVerdict::DeadLetter(DeadLetterReason::Misrouted(QueueName::App))
        );
    }

    #[test]
    fn age_ceiling_wins_over_attempts() {
        let policies = RetryPolicies::new(policy());
        let now = t0() + TimeDelta::seconds(3601);
        assert_eq!(
            policies.evaluate(&envelope(2, t0(), QueueName::App), now, |_| true),
            DelayVerdict::DeadLetter(DeadLetterReason::AgeExceeded { age_secs: 3601 })
        );
    }

    #[test]
    fn attempt_ceiling_dead_letters() {
        let policies = RetryPolicies::new(policy());
        let now = t0() + TimeDelta::seconds(600);
        assert_eq!(
            policies.evaluate(&envelope(3, t0(), QueueName::App), now, |_| true),
            DelayVerdict::Release(QueueName::App)
        );
        assert_eq!(
            policies.evaluate(&envelope(4, t0(), QueueName::App), now, |_| true),
            DelayVerdict::DeadLetter(DeadLetterReason::AttemptsExceeded {
                attempt: 4,
                max_attempts: 3
            })
        );
    }

    #[test]
    fn attempt_ceiling_applies_before_the_envelope_is_eligible() {
        let policies = RetryPolicies::new(policy());
        let env = envelope(4, t0(), QueueName::App);
        let now = t0() + TimeDelta::seconds(1);
        assert!(policy().next_eligible(env.first_seen, env.attempt) > now);
        assert_eq!(
            policies.evaluate(&env, now, |_| true),
            DelayVerdict::DeadLetter(DeadLetterReason::AttemptsExceeded {
                attempt: 4,
                max_attempts: 3
            })
        );
    }

    #[test]
    fn age_ceiling_applies_on_the_first_attempt() {
        let policies = RetryPolicies::new(policy());
        let now = t0() + TimeDelta::seconds(3601);
        assert_eq!(
            policies.evaluate(&envelope(1, t0(), QueueName::App), now, |_| true),
            DelayVerdict::DeadLetter(DeadLetterReason::AgeExceeded { age_secs: 3601 })
        );
    }

    #[test]
    fn envelopes_park_until_eligible() {
        let policies = RetryPolicies::new(policy());
        let env = envelope(2, t0(), QueueName::Package);
        assert_eq!(
            policies.evaluate(&env, t0() + TimeDelta::seconds(59), |_| true),
            DelayVerdict::Park
        );
        assert_eq!(
            policies.evaluate(&env, t0() + TimeDelta::seconds(60), |_| true),
            DelayVerdict::Release(QueueName::Package)
        );
    }

    #[test]
    fn overrides_apply_per_origin_queue() {
        let strict = RetryPolicy {
            max_attempts: 1,
            ..policy()
        };
        let policies =
            RetryPolicies::new(policy()).with_override(QueueName::Changes, strict);
        assert_eq!(policies.for_queue(QueueName::Changes).max_attempts, 1);
        assert_eq!(policies.for_queue(QueueName::App).max_attempts, 3);
    }
}
