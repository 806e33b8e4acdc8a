//! Per-partition workers.
//!
//! The poll loop hands each record to the worker of its partition over a
//! bounded channel. A worker handles its records one at a time in offset
//! order and commits each one only after its handler finished, so handling
//! within a partition is sequential while partitions proceed independently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use super::dispatcher::{Delivery, Dispatcher};
use super::policy::FailurePolicy;
use crate::bus::{Consumer, Producer, Record, TopicPartition};
use crate::envelope::RawEnvelope;
use crate::error::HandlerError;

/// Counters of a finished (or running) `run`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Messages whose handler succeeded
    pub handled: u64,
    /// Messages whose handler failed after all attempts
    pub failed: u64,
    /// Messages that could not be decoded or had no handler
    pub undecodable: u64,
    /// Messages copied to a dead-letter topic
    pub dead_lettered: u64,
    /// Poll cycles completed
    pub polls: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    handled: AtomicU64,
    failed: AtomicU64,
    undecodable: AtomicU64,
    dead_lettered: AtomicU64,
    polls: AtomicU64,
}

impl Counters {
    pub(crate) fn polled(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RunStats {
        RunStats {
            handled: self.handled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            undecodable: self.undecodable.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
        }
    }
}

/// Everything a worker needs, shared by all workers of one run.
pub(crate) struct WorkerContext<K, P> {
    pub group_id: String,
    pub consumer: Arc<K>,
    pub dispatcher: Arc<Dispatcher>,
    pub policy: FailurePolicy,
    pub dead_letter: Option<Arc<P>>,
    pub counters: Arc<Counters>,
}

pub(crate) struct PartitionWorker {
    pub tx: mpsc::Sender<Record>,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<()>,
}

impl PartitionWorker {
    pub(crate) fn spawn<K: Consumer, P: Producer>(
        tp: TopicPartition,
        prefetch: usize,
        parent: &CancellationToken,
        ctx: Arc<WorkerContext<K, P>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(prefetch.max(1));
        let cancel = parent.child_token();
        let handle = tokio::spawn(run_partition(tp, rx, cancel.clone(), ctx));
        Self { tx, cancel, handle }
    }
}

async fn run_partition<K: Consumer, P: Producer>(
    tp: TopicPartition,
    mut rx: mpsc::Receiver<Record>,
    cancel: CancellationToken,
    ctx: Arc<WorkerContext<K, P>>,
) {
    debug!(partition = %tp, group = %ctx.group_id, "Partition worker started");
    loop {
        // Cancellation is only observed between records.
        let record = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(record) => record,
                None => break,
            },
        };
        ctx.process(record).await;
    }
    debug!(partition = %tp, group = %ctx.group_id, "Partition worker stopped");
}

enum Failure {
    Undecodable(String),
    Handler(HandlerError),
}

impl<K: Consumer, P: Producer> WorkerContext<K, P> {
    #[instrument(
        skip_all,
        fields(group = %self.group_id, topic = %record.topic, partition = record.partition, offset = record.offset)
    )]
    pub(crate) async fn process(&self, record: Record) {
        let outcome = match RawEnvelope::from_record(&record) {
            Ok(raw) => self.handle(raw, Delivery::from(&record)).await,
            Err(e) => Err(Failure::Undecodable(e.to_string())),
        };

        match outcome {
            Ok(()) => {
                self.counters.handled.fetch_add(1, Ordering::Relaxed);
                debug!("Handled");
            }
            Err(Failure::Undecodable(reason)) => {
                self.counters.undecodable.fetch_add(1, Ordering::Relaxed);
                warn!(
                    reason = %reason,
                    policy = %self.policy,
                    payload = record.payload_str().unwrap_or("<binary>"),
                    "Skipping undecodable message"
                );
                self.dead_letter(&record).await;
            }
            Err(Failure::Handler(e)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, policy = %self.policy, "Handler failed");
                self.dead_letter(&record).await;
            }
        }

        if let Err(e) = self.consumer.commit(&record).await {
            warn!(error = %e, "Offset commit failed; message will be redelivered");
        }
    }

    async fn handle(&self, raw: RawEnvelope, delivery: Delivery) -> Result<(), Failure> {
        let attempts = self.policy.max_attempts();
        let mut attempt = 1;
        loop {
            match self.dispatcher.dispatch(raw.clone(), delivery.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_decode() => return Err(Failure::Undecodable(e.to_string())),
                Err(e) if attempt >= attempts => return Err(Failure::Handler(e)),
                Err(e) => {
                    warn!(error = %e, attempt, attempts, "Handler failed; retrying");
                    attempt += 1;
                    tokio::time::sleep(self.policy.backoff()).await;
                }
            }
        }
    }

    async fn dead_letter(&self, record: &Record) {
        let (Some(producer), Some(topic)) = (
            self.dead_letter.as_ref(),
            self.policy.dead_letter_topic(&record.topic),
        ) else {
            return;
        };

        let key = record
            .key
            .clone()
            .unwrap_or_else(|| format!("{}-{}", record.partition, record.offset));
        match producer.send(&topic, &key, &record.payload).await {
            Ok(report) => {
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                warn!(dead_letter_topic = %topic, dead_letter_offset = report.offset, "Message dead-lettered");
            }
            Err(e) => {
                error!(dead_letter_topic = %topic, error = %e, "Dead-lettering failed; message dropped");
            }
        }
    }
}
