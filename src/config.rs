//! Connection and runtime settings.
//!
//! Library users build these directly or load them from the environment with
//! the same variables and defaults the `orderflow` binary uses:
//!
//! | Variable | Default |
//! |---|---|
//! | `ORDERFLOW_BROKERS` | `localhost:9094` |
//! | `ORDERFLOW_SHUTDOWN_GRACE_SECS` | `10` |
//! | `ORDERFLOW_PREFETCH` | `32` |
//! | `ORDERFLOW_POLL_TIMEOUT_MS` | `100` |

use std::str::FromStr;
use std::time::Duration;

use crate::error::BusError;

pub const BROKERS_ENV: &str = "ORDERFLOW_BROKERS";
pub const SHUTDOWN_GRACE_ENV: &str = "ORDERFLOW_SHUTDOWN_GRACE_SECS";
pub const PREFETCH_ENV: &str = "ORDERFLOW_PREFETCH";
pub const POLL_TIMEOUT_ENV: &str = "ORDERFLOW_POLL_TIMEOUT_MS";

pub const DEFAULT_BROKERS: &str = "localhost:9094";
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
pub const DEFAULT_PREFETCH: usize = 32;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Broker connection parameters for one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Identifies this client in broker logs and group membership
    pub client_id: String,
    /// Bootstrap addresses, `host:port`
    pub brokers: Vec<String>,
    /// How long a send may wait for the broker's acknowledgment
    pub ack_timeout: Duration,
}

impl BrokerConfig {
    pub fn new<I, S>(client_id: impl Into<String>, brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            client_id: client_id.into(),
            brokers: brokers.into_iter().map(Into::into).collect(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    /// Single local broker on the default address.
    pub fn local(client_id: impl Into<String>) -> Self {
        Self::new(client_id, [DEFAULT_BROKERS])
    }

    /// Parse a comma separated broker list such as `localhost:9094,localhost:9095`.
    pub fn parse(client_id: impl Into<String>, brokers: &str) -> Result<Self, BusError> {
        let list: Vec<String> = brokers
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(String::from)
            .collect();
        if list.is_empty() {
            return Err(BusError::Config {
                var: BROKERS_ENV.into(),
                reason: "no broker addresses given".into(),
            });
        }
        if let Some(bad) = list.iter().find(|b| !b.contains(':')) {
            return Err(BusError::Config {
                var: BROKERS_ENV.into(),
                reason: format!("broker address {bad} is missing a port"),
            });
        }
        Ok(Self::new(client_id, list))
    }

    /// Load from `ORDERFLOW_BROKERS`, falling back to the local default.
    pub fn from_env(client_id: impl Into<String>) -> Result<Self, BusError> {
        Self::from_lookup(client_id, |var| std::env::var(var).ok())
    }

    pub(crate) fn from_lookup<F>(client_id: impl Into<String>, lookup: F) -> Result<Self, BusError>
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(BROKERS_ENV) {
            Some(brokers) => Self::parse(client_id, &brokers),
            None => Ok(Self::local(client_id)),
        }
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    /// Brokers as a comma separated list, the form client libraries expect.
    pub fn brokers_list(&self) -> String {
        self.brokers.join(",")
    }
}

/// Consumer group membership: who we are and what we read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    pub group_id: String,
    pub topics: Vec<String>,
    /// New groups replay retained history when set, otherwise start at the log end
    pub from_beginning: bool,
}

impl GroupConfig {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            topics: Vec::new(),
            from_beginning: true,
        }
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        if !self.topics.contains(&topic) {
            self.topics.push(topic);
        }
        self
    }

    pub fn from_beginning(mut self, from_beginning: bool) -> Self {
        self.from_beginning = from_beginning;
        self
    }
}

/// Runtime tuning shared by the services of one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSettings {
    /// Upper bound on graceful shutdown before the process gives up
    pub shutdown_grace: Duration,
    /// Records buffered per partition between the poll loop and its worker
    pub prefetch: usize,
    /// Longest single wait for the next record
    pub poll_timeout: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            prefetch: DEFAULT_PREFETCH,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

impl ServiceSettings {
    pub fn from_env() -> Result<Self, BusError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, BusError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let grace_secs: Option<u64> = parse_var(&lookup, SHUTDOWN_GRACE_ENV)?;
        let prefetch: Option<usize> = parse_var(&lookup, PREFETCH_ENV)?;
        let poll_ms: Option<u64> = parse_var(&lookup, POLL_TIMEOUT_ENV)?;

        if prefetch == Some(0) {
            return Err(BusError::Config {
                var: PREFETCH_ENV.into(),
                reason: "must be at least 1".into(),
            });
        }

        Ok(Self {
            shutdown_grace: grace_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_grace),
            prefetch: prefetch.unwrap_or(defaults.prefetch),
            poll_timeout: poll_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_timeout),
        })
    }
}

fn parse_var<T, F>(lookup: &F, var: &str) -> Result<Option<T>, BusError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| BusError::Config {
                var: var.to_string(),
                reason: format!("{raw:?}: {e}"),
            }),
    }
}
