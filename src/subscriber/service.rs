//! ConsumerService - a subscriber run as a lifecycle-managed service.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::{Dispatcher, RunStats, Subscriber};
use crate::bus::Connector;
use crate::config::GroupConfig;
use crate::error::BusError;
use crate::lifecycle::Service;

type RunTask = (CancellationToken, JoinHandle<Result<RunStats, BusError>>);

/// Bundles a subscriber, its group membership and its handlers.
///
/// `start` connects, subscribes and spawns the run loop; `stop` cancels the
/// loop, waits for in-flight messages and leaves the group.
pub struct ConsumerService<C: Connector> {
    name: String,
    subscriber: Arc<Subscriber<C>>,
    group: GroupConfig,
    dispatcher: Arc<Dispatcher>,
    task: tokio::sync::Mutex<Option<RunTask>>,
    last_stats: Mutex<Option<RunStats>>,
}

impl<C: Connector> ConsumerService<C> {
    pub fn new(
        name: impl Into<String>,
        subscriber: Subscriber<C>,
        group: GroupConfig,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            name: name.into(),
            subscriber: Arc::new(subscriber),
            group,
            dispatcher: Arc::new(dispatcher),
            task: tokio::sync::Mutex::new(None),
            last_stats: Mutex::new(None),
        }
    }

    pub fn subscriber(&self) -> &Subscriber<C> {
        &self.subscriber
    }

    pub fn group(&self) -> &GroupConfig {
        &self.group
    }

    /// Counters of the last completed run, once stopped.
    pub fn stats(&self) -> Option<RunStats> {
        *self.last_stats.lock()
    }
}

#[async_trait]
impl<C: Connector> Service for ConsumerService<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), BusError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        self.subscriber.connect().await?;
        if let Err(e) = self
            .subscriber
            .subscribe(&self.group.topics, self.group.from_beginning)
            .await
        {
            if let Err(disconnect_err) = self.subscriber.disconnect().await {
                warn!(service = %self.name, error = %disconnect_err, "Disconnect after failed subscribe failed");
            }
            return Err(e);
        }

        let token = CancellationToken::new();
        let subscriber = self.subscriber.clone();
        let dispatcher = self.dispatcher.clone();
        let run_token = token.clone();
        let handle = tokio::spawn(async move { subscriber.run(dispatcher, run_token).await });
        *task = Some((token, handle));
        Ok(())
    }

    async fn stop(&self) -> Result<(), BusError> {
        let running = self.task.lock().await.take();
        if let Some((token, handle)) = running {
            token.cancel();
            match handle.await {
                Ok(Ok(stats)) => *self.last_stats.lock() = Some(stats),
                Ok(Err(e)) => error!(service = %self.name, error = %e, "Run loop ended with an error"),
                Err(e) => error!(service = %self.name, error = %e, "Run loop panicked"),
            }
        }
        self.subscriber.disconnect().await
    }
}
