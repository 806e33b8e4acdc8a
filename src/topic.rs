//! Topic Registry - declares the pipeline's topics and makes sure they exist.
//!
//! Provisioning is best-effort bootstrap: [`ensure_topics`] never fails the
//! caller. It reports what was created, what already existed and what could
//! not be created, logs failures, and always releases the admin connection.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::bus::{Admin, Connector, CreateOutcome};
use crate::config::BrokerConfig;
use crate::events;

/// Partition count used when a spec leaves it open.
pub const DEFAULT_PARTITIONS: u32 = 3;
/// Replication factor used when a spec leaves it open.
pub const DEFAULT_REPLICATION_FACTOR: u16 = 1;

/// A topic declaration; unset values fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSpec {
    pub name: String,
    #[serde(default)]
    pub partitions: Option<u32>,
    #[serde(default)]
    pub replication_factor: Option<u16>,
}

impl TopicSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partitions: None,
            replication_factor: None,
        }
    }

    pub fn partitions(mut self, partitions: u32) -> Self {
        self.partitions = Some(partitions);
        self
    }

    pub fn replication_factor(mut self, replication_factor: u16) -> Self {
        self.replication_factor = Some(replication_factor);
        self
    }

    /// Fill in defaults.
    pub fn resolve(&self) -> TopicConfig {
        TopicConfig {
            name: self.name.clone(),
            partitions: self.partitions.unwrap_or(DEFAULT_PARTITIONS),
            replication_factor: self
                .replication_factor
                .unwrap_or(DEFAULT_REPLICATION_FACTOR),
        }
    }
}

/// The configuration a topic actually has on the broker.
///
/// Partition count and replication factor never change after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicConfig {
    pub name: String,
    pub partitions: u32,
    pub replication_factor: u16,
}

impl TopicConfig {
    pub fn new(name: impl Into<String>, partitions: u32, replication_factor: u16) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication_factor,
        }
    }

    /// Check the configuration against a cluster of `brokers` brokers.
    pub fn validate(&self, brokers: u16) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("topic name is empty".into());
        }
        if self.partitions == 0 {
            return Err("partition count must be positive".into());
        }
        if self.replication_factor == 0 {
            return Err("replication factor must be positive".into());
        }
        if self.replication_factor > brokers {
            return Err(format!(
                "replication factor {} exceeds broker count {}",
                self.replication_factor, brokers
            ));
        }
        Ok(())
    }
}

/// The fixed set of topics a deployment declares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicRegistry {
    specs: Vec<TopicSpec>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Topics of the order fulfillment pipeline.
    pub fn pipeline() -> Self {
        Self::new()
            .declare(
                TopicSpec::new(events::ORDER_CREATED)
                    .partitions(3)
                    .replication_factor(1),
            )
            .declare(
                TopicSpec::new(events::USER_CREATED)
                    .partitions(1)
                    .replication_factor(1),
            )
            .declare(
                TopicSpec::new(events::USER_UPDATED)
                    .partitions(3)
                    .replication_factor(1),
            )
    }

    /// Add a declaration. A later declaration of the same name replaces the earlier one.
    pub fn declare(mut self, spec: TopicSpec) -> Self {
        self.specs.retain(|existing| existing.name != spec.name);
        self.specs.push(spec);
        self
    }

    pub fn specs(&self) -> &[TopicSpec] {
        &self.specs
    }

    pub fn names(&self) -> Vec<&str> {
        self.specs.iter().map(|s| s.name.as_str()).collect()
    }

    /// Provision every declared topic.
    pub async fn ensure<C: Connector>(
        &self,
        connector: &C,
        config: &BrokerConfig,
    ) -> ProvisioningReport {
        ensure_topics(connector, config, &self.specs).await
    }
}

/// A topic that could not be provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicFailure {
    pub topic: String,
    pub reason: String,
}

/// Per-topic outcome of [`ensure_topics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProvisioningReport {
    pub created: Vec<String>,
    pub existing: Vec<String>,
    pub failed: Vec<TopicFailure>,
}

impl ProvisioningReport {
    /// True when every requested topic exists afterwards.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn fail_all(specs: &[TopicSpec], reason: &str) -> Self {
        Self {
            failed: specs
                .iter()
                .map(|spec| TopicFailure {
                    topic: spec.name.clone(),
                    reason: reason.to_string(),
                })
                .collect(),
            ..Self::default()
        }
    }
}

/// Create every topic in `specs` that the broker does not have yet.
///
/// Existing topics are left untouched even when their configuration differs
/// from the spec. The admin connection is closed whatever happens.
pub async fn ensure_topics<C: Connector>(
    connector: &C,
    config: &BrokerConfig,
    specs: &[TopicSpec],
) -> ProvisioningReport {
    let admin = match connector.admin(config).await {
        Ok(admin) => admin,
        Err(e) => {
            error!(error = %e, brokers = %config.brokers_list(), "Admin connection failed");
            return ProvisioningReport::fail_all(specs, &e.to_string());
        }
    };
    info!(client_id = %config.client_id, "Admin client connected");

    let report = provision(&admin, specs).await;

    if let Err(e) = admin.close().await {
        warn!(error = %e, "Admin client did not close cleanly");
    }
    info!(
        created = ?report.created,
        existing = ?report.existing,
        failed = report.failed.len(),
        "Admin client disconnected"
    );
    report
}

async fn provision<A: Admin>(admin: &A, specs: &[TopicSpec]) -> ProvisioningReport {
    let current = match admin.list_topics().await {
        Ok(topics) => topics,
        Err(e) => {
            error!(error = %e, "Listing topics failed");
            return ProvisioningReport::fail_all(specs, &e.to_string());
        }
    };
    info!(topics = ?current.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(), "Existing topics");

    let mut report = ProvisioningReport::default();
    let mut missing = Vec::new();

    for spec in specs {
        let wanted = spec.resolve();
        match current.iter().find(|t| t.name == wanted.name) {
            Some(existing) => {
                if existing.partitions != wanted.partitions
                    || existing.replication_factor != wanted.replication_factor
                {
                    warn!(
                        topic = %wanted.name,
                        partitions = existing.partitions,
                        replication_factor = existing.replication_factor,
                        requested_partitions = wanted.partitions,
                        requested_replication_factor = wanted.replication_factor,
                        "Topic exists with a different configuration; existing configuration wins"
                    );
                }
                report.existing.push(wanted.name);
            }
            None if missing.iter().any(|m: &TopicConfig| m.name == wanted.name) => {}
            None => missing.push(wanted),
        }
    }

    if missing.is_empty() {
        return report;
    }

    match admin.create_topics(&missing).await {
        Ok(outcomes) => {
            for (topic, outcome) in outcomes {
                match outcome {
                    CreateOutcome::Created => report.created.push(topic),
                    CreateOutcome::AlreadyExists => report.existing.push(topic),
                    CreateOutcome::Failed(reason) => {
                        error!(topic = %topic, reason = %reason, "Topic creation failed");
                        report.failed.push(TopicFailure { topic, reason });
                    }
                }
            }
        }
        Err(e) => {
            error!(error = %e, "Topic creation request failed");
            report.failed.extend(missing.into_iter().map(|config| TopicFailure {
                topic: config.name,
                reason: e.to_string(),
            }));
        }
    }

    report
}
