//! Subscriber - consumer-group worker.
//!
//! A `Subscriber` owns one consumer connection bound to a group and walks an
//! explicit state machine:
//!
//! ```text
//! Disconnected --connect--> Connected --subscribe--> Subscribed --run--> Running
//!      ^                                                  ^                 |
//!      |                                                  +-- run returns --+
//!      +------------------------- disconnect (from any state) --------------+
//! ```
//!
//! `run` polls the group's records and fans them out to one worker per
//! assigned partition. Each worker decodes, dispatches and only then commits,
//! which gives at-least-once delivery with per-partition ordering.
//!
//! ## Example
//!
//! ```ignore
//! let subscriber = Subscriber::new(cluster, BrokerConfig::local("mailer"), "mailer-service-group");
//! subscriber.connect().await?;
//! subscriber.subscribe(&["order.created".to_string()], true).await?;
//!
//! let dispatcher = Arc::new(Dispatcher::new().on::<OrderCreated, _, _>(send_confirmation));
//! let stats = subscriber.run(dispatcher, shutdown_token).await?;
//! subscriber.disconnect().await?;
//! ```

mod dispatcher;
mod policy;
mod service;
mod worker;

pub use dispatcher::{Delivery, Dispatcher};
pub use policy::{FailurePolicy, DEFAULT_DEAD_LETTER_SUFFIX, DEFAULT_RETRY_BACKOFF};
pub use service::ConsumerService;
pub use worker::RunStats;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::bus::{Connector, Consumer, Producer, TopicPartition};
use crate::config::{BrokerConfig, ServiceSettings};
use crate::error::BusError;
use worker::{Counters, PartitionWorker, WorkerContext};

/// Where a subscriber is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Disconnected,
    Connected,
    Subscribed,
    Running,
}

impl SubscriberState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriberState::Disconnected => "disconnected",
            SubscriberState::Connected => "connected",
            SubscriberState::Subscribed => "subscribed",
            SubscriberState::Running => "running",
        }
    }
}

impl fmt::Display for SubscriberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Connection<C: Connector> {
    consumer: Option<Arc<C::Consumer>>,
    dead_letter: Option<Arc<C::Producer>>,
    topics: Vec<String>,
    /// Cancels the current run
    run_token: Option<CancellationToken>,
}

/// Consumer-group member with guarded state transitions.
pub struct Subscriber<C: Connector> {
    connector: C,
    config: BrokerConfig,
    group_id: String,
    policy: FailurePolicy,
    prefetch: usize,
    poll_timeout: Duration,
    state: Mutex<SubscriberState>,
    /// Serializes transitions, which await the broker
    connection: tokio::sync::Mutex<Connection<C>>,
    /// Held for the whole duration of `run`
    running: tokio::sync::Mutex<()>,
}

impl<C: Connector> Subscriber<C> {
    pub fn new(connector: C, config: BrokerConfig, group_id: impl Into<String>) -> Self {
        let settings = ServiceSettings::default();
        Self {
            connector,
            config,
            group_id: group_id.into(),
            policy: FailurePolicy::default(),
            prefetch: settings.prefetch,
            poll_timeout: settings.poll_timeout,
            state: Mutex::new(SubscriberState::Disconnected),
            connection: tokio::sync::Mutex::new(Connection {
                consumer: None,
                dead_letter: None,
                topics: Vec::new(),
                run_token: None,
            }),
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_settings(mut self, settings: &ServiceSettings) -> Self {
        self.prefetch = settings.prefetch.max(1);
        self.poll_timeout = settings.poll_timeout;
        self
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub fn policy(&self) -> &FailurePolicy {
        &self.policy
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.lock()
    }

    /// Partitions currently owned by this member.
    pub async fn assignment(&self) -> Vec<TopicPartition> {
        let connection = self.connection.lock().await;
        connection
            .consumer
            .as_ref()
            .map(|consumer| consumer.assignment())
            .unwrap_or_default()
    }

    fn expect_state(&self, expected: SubscriberState, action: &'static str) -> Result<(), BusError> {
        let current = self.state();
        if current != expected {
            return Err(BusError::InvalidTransition {
                from: current.as_str(),
                action,
            });
        }
        Ok(())
    }

    fn set_state(&self, next: SubscriberState) {
        let mut state = self.state.lock();
        debug!(group = %self.group_id, from = %*state, to = %next, "Subscriber transition");
        *state = next;
    }

    /// Disconnected -> Connected.
    #[instrument(skip(self), fields(group = %self.group_id, client_id = %self.config.client_id))]
    pub async fn connect(&self) -> Result<(), BusError> {
        let mut connection = self.connection.lock().await;
        self.expect_state(SubscriberState::Disconnected, "connect")?;

        let consumer = self.connector.consumer(&self.config, &self.group_id).await?;
        let dead_letter = match self.policy {
            FailurePolicy::DeadLetter { .. } => match self.connector.producer(&self.config).await {
                Ok(producer) => Some(Arc::new(producer)),
                Err(e) => {
                    if let Err(close_err) = consumer.close().await {
                        warn!(error = %close_err, "Consumer did not close cleanly");
                    }
                    return Err(e);
                }
            },
            _ => None,
        };

        connection.consumer = Some(Arc::new(consumer));
        connection.dead_letter = dead_letter;
        self.set_state(SubscriberState::Connected);
        info!(brokers = %self.config.brokers_list(), "Subscriber connected");
        Ok(())
    }

    /// Connected -> Subscribed.
    #[instrument(skip(self, topics), fields(group = %self.group_id, topics = ?topics))]
    pub async fn subscribe(&self, topics: &[String], from_beginning: bool) -> Result<(), BusError> {
        let mut connection = self.connection.lock().await;
        self.expect_state(SubscriberState::Connected, "subscribe")?;
        if topics.is_empty() {
            return Err(BusError::Config {
                var: "topics".into(),
                reason: format!("group {} subscribes to no topics", self.group_id),
            });
        }

        let consumer = connection
            .consumer
            .clone()
            .ok_or_else(|| BusError::NotConnected(self.config.client_id.clone()))?;
        consumer.subscribe(topics, from_beginning).await?;

        connection.topics = topics.to_vec();
        self.set_state(SubscriberState::Subscribed);
        info!(from_beginning, "Subscribed");
        Ok(())
    }

    /// Subscribed -> Running, until `shutdown` is cancelled or `disconnect` is called.
    ///
    /// Handler failures never end the loop. On return every partition worker
    /// has finished its in-flight message and the subscriber is back in
    /// `Subscribed`, so it can run again.
    pub async fn run(
        &self,
        dispatcher: Arc<Dispatcher>,
        shutdown: CancellationToken,
    ) -> Result<RunStats, BusError> {
        let _running = self.running.lock().await;

        let (consumer, dead_letter, stop) = {
            let mut connection = self.connection.lock().await;
            self.expect_state(SubscriberState::Subscribed, "run")?;
            let consumer = connection
                .consumer
                .clone()
                .ok_or_else(|| BusError::NotConnected(self.config.client_id.clone()))?;
            let stop = shutdown.child_token();
            connection.run_token = Some(stop.clone());
            self.set_state(SubscriberState::Running);
            (consumer, connection.dead_letter.clone(), stop)
        };

        for event_type in &dispatcher.event_types() {
            debug!(group = %self.group_id, event_type, "Handler registered");
        }
        info!(group = %self.group_id, policy = %self.policy, prefetch = self.prefetch, "Subscriber running");

        let counters = Arc::new(Counters::default());
        let ctx = Arc::new(WorkerContext {
            group_id: self.group_id.clone(),
            consumer: consumer.clone(),
            dispatcher,
            policy: self.policy.clone(),
            dead_letter,
            counters: counters.clone(),
        });

        let result = self.poll_loop(&consumer, &ctx, &stop).await;

        {
            let mut connection = self.connection.lock().await;
            connection.run_token = None;
            if self.state() == SubscriberState::Running {
                self.set_state(SubscriberState::Subscribed);
            }
        }

        let stats = counters.snapshot();
        info!(
            group = %self.group_id,
            handled = stats.handled,
            failed = stats.failed,
            undecodable = stats.undecodable,
            dead_lettered = stats.dead_lettered,
            polls = stats.polls,
            "Subscriber stopped"
        );
        result.map(|()| stats)
    }

    async fn poll_loop(
        &self,
        consumer: &Arc<C::Consumer>,
        ctx: &Arc<WorkerContext<C::Consumer, C::Producer>>,
        stop: &CancellationToken,
    ) -> Result<(), BusError> {
        let mut workers: HashMap<TopicPartition, PartitionWorker> = HashMap::new();
        let mut owned: Vec<TopicPartition> = Vec::new();

        let result = loop {
            let polled = tokio::select! {
                biased;
                _ = stop.cancelled() => break Ok(()),
                polled = consumer.poll(self.poll_timeout) => polled,
            };
            ctx.counters.polled();

            // A rebalance may have happened during the poll.
            let assignment = consumer.assignment();
            if assignment != owned {
                revoke_workers(&mut workers, &assignment);
                info!(group = %self.group_id, assignment = ?assignment, "Partition assignment changed");
                owned = assignment;
            }

            let record = match polled {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(BusError::NotConnected(client)) => break Err(BusError::NotConnected(client)),
                Err(e) => {
                    warn!(group = %self.group_id, error = %e, "Poll failed");
                    tokio::select! {
                        _ = stop.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(self.poll_timeout) => continue,
                    }
                }
            };

            let tp = record.topic_partition();
            if !owned.contains(&tp) {
                debug!(partition = %tp, offset = record.offset, "Record from revoked partition left for its new owner");
                continue;
            }

            let worker = workers.entry(tp.clone()).or_insert_with(|| {
                PartitionWorker::spawn(tp.clone(), self.prefetch, stop, ctx.clone())
            });
            let delivered = tokio::select! {
                biased;
                _ = stop.cancelled() => break Ok(()),
                sent = worker.tx.send(record) => sent.is_ok(),
            };
            if !delivered {
                error!(partition = %tp, "Partition worker exited unexpectedly");
                workers.remove(&tp);
            }
        };

        // Workers finish the message they are on, then stop.
        for (tp, worker) in workers.drain() {
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await {
                error!(partition = %tp, error = %e, "Partition worker panicked");
            }
        }
        result
    }

    /// Leave the group and release the connection.
    ///
    /// Stops a running loop first and waits for its in-flight messages.
    /// Disconnecting an already disconnected subscriber does nothing.
    #[instrument(skip(self), fields(group = %self.group_id))]
    pub async fn disconnect(&self) -> Result<(), BusError> {
        {
            let connection = self.connection.lock().await;
            if let Some(token) = &connection.run_token {
                token.cancel();
            }
        }
        let _running = self.running.lock().await;

        let mut connection = self.connection.lock().await;
        if self.state() == SubscriberState::Disconnected {
            return Ok(());
        }

        connection.run_token = None;
        connection.topics.clear();
        let consumer = connection.consumer.take();
        let dead_letter = connection.dead_letter.take();
        self.set_state(SubscriberState::Disconnected);

        if let Some(producer) = dead_letter {
            if let Err(e) = producer.close().await {
                warn!(error = %e, "Dead-letter producer did not close cleanly");
            }
        }
        if let Some(consumer) = consumer {
            consumer.close().await?;
        }
        info!("Subscriber disconnected");
        Ok(())
    }
}

fn revoke_workers(workers: &mut HashMap<TopicPartition, PartitionWorker>, assignment: &[TopicPartition]) {
    workers.retain(|tp, worker| {
        let keep = assignment.contains(tp);
        if !keep {
            info!(partition = %tp, "Partition revoked; stopping its worker");
            worker.cancel.cancel();
        }
        keep
    });
}
