//! Restart policies and the restart decision.
//!
//! The decision itself is a pure function of the policy, the exit code, the
//! stop flag and the restart count so it can be tested without a runtime.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skiff_api::RestartPolicyDescriptor;
use skiff_common::{SkiffError, SkiffResult};

/// What to do when a container's process terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart.
    #[default]
    No,
    /// Restart after every termination.
    Always,
    /// Restart after non-zero exits, at most `max_retries` times (0 = unbounded).
    OnFailure {
        /// Retry bound; 0 means no bound.
        max_retries: u32,
    },
    /// Like `Always`, but an explicit stop is never undone by a restart.
    UnlessStopped,
}

impl RestartPolicy {
    /// Policy name as accepted on the command line.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::No => "no",
            Self::Always => "always",
            Self::OnFailure { .. } => "on-failure",
            Self::UnlessStopped => "unless-stopped",
        }
    }

    /// Retry bound, 0 for policies without one.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        match self {
            Self::OnFailure { max_retries } => *max_retries,
            _ => 0,
        }
    }

    /// Returns true unless the policy is `no`.
    #[must_use]
    pub const fn restarts(&self) -> bool {
        !matches!(self, Self::No)
    }

    /// Descriptor form reported by `inspect`.
    #[must_use]
    pub fn descriptor(&self) -> RestartPolicyDescriptor {
        RestartPolicyDescriptor {
            name: self.name().to_string(),
            maximum_retry_count: self.max_retries(),
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnFailure { max_retries } if *max_retries > 0 => {
                write!(f, "on-failure:{max_retries}")
            }
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = SkiffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, count) = match s.split_once(':') {
            Some((name, count)) => (name, Some(count)),
            None => (s, None),
        };

        let policy = match name {
            "" | "no" | "none" => Self::No,
            "always" => Self::Always,
            "unless-stopped" => Self::UnlessStopped,
            "on-failure" => {
                let max_retries = match count {
                    Some(count) => count.parse::<u32>().map_err(|_| {
                        SkiffError::validation(format!(
                            "maximum retry count must be a non-negative integer: {count}"
                        ))
                    })?,
                    None => 0,
                };
                return Ok(Self::OnFailure { max_retries });
            }
            other => {
                return Err(SkiffError::validation(format!(
                    "invalid restart policy: {other}"
                )));
            }
        };

        if count.is_some() {
            return Err(SkiffError::validation(format!(
                "maximum retry count cannot be used with restart policy '{name}'"
            )));
        }

        Ok(policy)
    }
}

/// Outcome of a restart decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Launch a new process for the container.
    Restart,
    /// Leave the container in its terminal state.
    Stay,
}

/// Decide whether a terminated container restarts.
///
/// `restart_count` is the number of policy restarts already performed. A
/// stop request always wins, whatever the policy.
#[must_use]
pub const fn decide(
    policy: RestartPolicy,
    exit_code: i64,
    stop_requested: bool,
    restart_count: u32,
) -> RestartDecision {
    if stop_requested {
        return RestartDecision::Stay;
    }

    let restart = match policy {
        RestartPolicy::No => false,
        RestartPolicy::Always | RestartPolicy::UnlessStopped => true,
        RestartPolicy::OnFailure { max_retries } => {
            exit_code != 0 && (max_retries == 0 || restart_count < max_retries)
        }
    };

    if restart {
        RestartDecision::Restart
    } else {
        RestartDecision::Stay
    }
}

/// Delay between policy restarts.
///
/// Doubles per consecutive restart from `base` up to `max`. A process that
/// stayed up for at least `reset_after` restarts after `base` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first restart.
    pub base: Duration,
    /// Upper bound on the delay.
    pub max: Duration,
    /// Run time after which the backoff starts over.
    pub reset_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(60),
            reset_after: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// A backoff that restarts immediately.
    #[must_use]
    pub const fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
            reset_after: Duration::ZERO,
        }
    }

    /// Delay before the restart following `restart_count` earlier restarts
    /// of a process that ran for `ran_for`.
    #[must_use]
    pub fn delay(&self, restart_count: u32, ran_for: Duration) -> Duration {
        if ran_for >= self.reset_after {
            return self.base.min(self.max);
        }

        let factor = 1u32.checked_shl(restart_count.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Parse a restart policy, failing with a validation error.
///
/// # Errors
///
/// Returns [`SkiffError::Validation`] for unknown policies or malformed
/// retry counts.
pub fn parse_policy(value: &str) -> SkiffResult<RestartPolicy> {
    value.parse()
}
