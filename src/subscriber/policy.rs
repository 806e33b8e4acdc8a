//! What a subscriber does with a message its handler could not process.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::BusError;

pub const DEFAULT_DEAD_LETTER_SUFFIX: &str = ".dlq";
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Handler failure policy.
///
/// Whatever the policy, the offset advances past the message afterwards so
/// one bad message cannot stall its partition. Undecodable messages are
/// never retried.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Log and move on.
    #[default]
    DropAndContinue,
    /// Run the handler up to `attempts` times in total, waiting `backoff`
    /// between tries, then drop.
    RetryThenDrop { attempts: u32, backoff: Duration },
    /// Copy the original message to `<topic><suffix>`, then move on.
    DeadLetter { suffix: String },
}

impl FailurePolicy {
    pub fn retry(attempts: u32) -> Self {
        FailurePolicy::RetryThenDrop {
            attempts: attempts.max(1),
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    pub fn dead_letter() -> Self {
        FailurePolicy::DeadLetter {
            suffix: DEFAULT_DEAD_LETTER_SUFFIX.to_string(),
        }
    }

    /// Total handler invocations allowed for one message.
    pub fn max_attempts(&self) -> u32 {
        match self {
            FailurePolicy::RetryThenDrop { attempts, .. } => (*attempts).max(1),
            _ => 1,
        }
    }

    pub fn backoff(&self) -> Duration {
        match self {
            FailurePolicy::RetryThenDrop { backoff, .. } => *backoff,
            _ => Duration::ZERO,
        }
    }

    /// Dead-letter topic for messages from `topic`, if this policy has one.
    pub fn dead_letter_topic(&self, topic: &str) -> Option<String> {
        match self {
            FailurePolicy::DeadLetter { suffix } => Some(format!("{topic}{suffix}")),
            _ => None,
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::DropAndContinue => write!(f, "drop"),
            FailurePolicy::RetryThenDrop { attempts, .. } => write!(f, "retry:{attempts}"),
            FailurePolicy::DeadLetter { suffix } if suffix == DEFAULT_DEAD_LETTER_SUFFIX => {
                write!(f, "dead-letter")
            }
            FailurePolicy::DeadLetter { suffix } => write!(f, "dead-letter:{suffix}"),
        }
    }
}

/// Parses `drop`, `retry:N` and `dead-letter[:suffix]`.
impl FromStr for FailurePolicy {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| BusError::Config {
            var: "failure-policy".into(),
            reason,
        };

        let (name, arg) = match s.trim().split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (s.trim(), None),
        };

        match (name, arg) {
            ("drop", None) => Ok(FailurePolicy::DropAndContinue),
            ("retry", Some(n)) => {
                let attempts: u32 = n
                    .parse()
                    .map_err(|_| invalid(format!("retry count {n:?} is not a number")))?;
                if attempts == 0 {
                    return Err(invalid("retry count must be at least 1".into()));
                }
                Ok(FailurePolicy::retry(attempts))
            }
            ("retry", None) => Ok(FailurePolicy::retry(3)),
            ("dead-letter", None) => Ok(FailurePolicy::dead_letter()),
            ("dead-letter", Some(suffix)) if !suffix.is_empty() => Ok(FailurePolicy::DeadLetter {
                suffix: suffix.to_string(),
            }),
            _ => Err(invalid(format!(
                "unknown policy {s:?}; expected drop, retry:N or dead-letter"
            ))),
        }
    }
}
