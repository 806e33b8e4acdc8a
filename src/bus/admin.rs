//! Administrative side of the broker client traits.

use async_trait::async_trait;

use crate::error::BusError;
use crate::topic::TopicConfig;

/// Result of asking the broker to create one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
    Failed(String),
}

/// Topic administration.
#[async_trait]
pub trait Admin: Send + Sync + 'static {
    /// Describe every topic the broker knows about.
    async fn list_topics(&self) -> Result<Vec<TopicConfig>, BusError>;

    /// Create the given topics, reporting the outcome per topic in input order.
    async fn create_topics(
        &self,
        topics: &[TopicConfig],
    ) -> Result<Vec<(String, CreateOutcome)>, BusError>;

    /// Release the administrative connection.
    async fn close(&self) -> Result<(), BusError>;
}
