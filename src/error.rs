//! Error types for the CDC connector

use thiserror::Error;

/// Result type for connector operations
pub type Result<T> = std::result::Result<T, CdcError>;

/// Errors raised while declaring schemas, registering groups or talking to
/// the broker
///
/// Everything in this enum is fatal to the operation that produced it.
/// Per-message problems (unparseable envelopes, undecodable fields, handler
/// failures) are absorbed and logged by the router instead of surfacing
/// here, so a bad event can never halt a consumer.
#[derive(Error, Debug)]
pub enum CdcError {
    /// No broker addresses were supplied
    #[error("Broker list must not be empty")]
    MissingBrokers,

    /// The connector was configured without a source server name
    #[error("Server name must not be blank")]
    MissingServerName,

    /// A consumer group was registered without a topic
    #[error("Topic must not be empty for consumer group {0}")]
    MissingTopic(String),

    /// The Kafka protocol version string could not be parsed
    #[error("Invalid Kafka protocol version: {0}")]
    InvalidProtocolVersion(String),

    /// The partition assignment strategy name is not recognized
    #[error("Unknown partition assignor {0:?}, expected sticky, roundrobin or range")]
    UnknownAssignor(String),

    /// A consumer group name was registered twice
    #[error("Consumer group {0} is already registered")]
    DuplicateGroup(String),

    /// A registration did not name a source database
    #[error("Database must not be blank for consumer group {0}")]
    BlankDatabase(String),

    /// A record type declared an invalid schema (duplicate field, duplicate
    /// column, misplaced column override)
    #[error("Invalid schema for {record}: {reason}")]
    Schema {
        record: &'static str,
        reason: String,
    },

    /// Broker client error (creation, subscription, final offset commit)
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// A change envelope could not be deserialized
    #[error("Envelope parse error: {0}")]
    Envelope(#[from] serde_json::Error),
}

impl CdcError {
    /// True for errors produced by validation before any broker traffic,
    /// as opposed to errors reported by the Kafka client itself
    pub fn is_configuration(&self) -> bool {
        !matches!(self, CdcError::Kafka(_) | CdcError::Envelope(_))
    }
}
