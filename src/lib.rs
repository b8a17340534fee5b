//! # CDC Connector
//!
//! Consumes row-level change data capture events from Kafka, decodes each
//! event's loosely typed column map into a strongly typed record through a
//! schema declared once per type, and dispatches the decoded before/after
//! images to an ordered chain of business handlers.
//!
//! ## Model
//!
//! - **Envelope**: every message is a JSON object with `database`, `table`,
//!   `type` (insert|update|delete), `ts`, a `data` column map and an
//!   optional `old` column map with pre-change values.
//! - **Topic naming**: one captured table maps to one topic named
//!   `server.database.table`.
//! - **Schema**: a [`CdcRecord`] declares its column bindings once; the
//!   finalized table is cached per type for the life of the process.
//! - **Tolerance**: unparseable envelopes and undecodable fields are
//!   logged and skipped. A bad event can never halt a consumer.
//!
//! ## Architecture
//!
//! ```text
//! Kafka topic (server.database.table)
//!         │
//!   ConsumerRuntime ── sessions, rebalances, readiness, shutdown
//!         │
//!   EventRouter ────── parse envelope, classify the operation
//!         │
//!   decode_into ────── TableSchema<T> bindings (cached per type)
//!         │
//!   ChangeHandler ──── create / update / delete, in registration order
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cdc_connector::{
//!     CdcRecord, ChangeHandler, ConnectorConfig, ConnectorRegistry, SchemaBuilder,
//! };
//!
//! #[derive(Default)]
//! struct User {
//!     id: i64,
//!     user_name: String,
//!     deleted: bool,
//! }
//!
//! impl CdcRecord for User {
//!     fn schema() -> SchemaBuilder<Self> {
//!         SchemaBuilder::<Self>::new()
//!             .int("id", |r, v| r.id = v)
//!             .string("user_name", |r, v| r.user_name = v)
//!             .bool("deleted", |r, v| r.deleted = v)
//!     }
//! }
//!
//! struct UserSync;
//!
//! #[async_trait::async_trait]
//! impl ChangeHandler<User> for UserSync {
//!     async fn create(&self, after: &User) -> anyhow::Result<()> {
//!         // upsert into the read model
//!         tracing::info!(id = after.id, "User created");
//!         Ok(())
//!     }
//!
//!     async fn update(&self, _before: Option<&User>, _after: &User) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//!
//!     async fn delete(&self, _record: &User) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConnectorConfig::new(vec!["localhost:9092".into()], "maxwell");
//!     let mut registry = ConnectorRegistry::new(config)?;
//!     registry.register::<User>("user-sync", "app", "users", vec![Arc::new(UserSync)], 2)?;
//!     registry.start_with_signals().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Delivery semantics
//!
//! Offsets are stored after the handler chain ran, whether or not the
//! handlers succeeded: delivery to handlers is at most once per group.
//! Handlers that must not lose work own their own retry or dead-letter
//! policy.

pub mod config;
pub mod decode;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod schema;

pub use config::{ConnectorConfig, GroupSettings, PartitionAssignor, ProtocolVersion, StartOffset};
pub use decode::{decode_into, DecodeFailure};
pub use envelope::{ChangeEnvelope, ChangeOp};
pub use error::{CdcError, Result};
pub use handler::ChangeHandler;
pub use metrics::ConnectorMetrics;
pub use registry::{shutdown_signal, ConnectorRegistry, ShutdownHandle};
pub use router::EventRouter;
pub use runtime::ConsumerRuntime;
pub use schema::{
    bindings_for, CdcRecord, FieldBinding, FieldKind, FieldValue, SchemaBuilder, TableSchema,
};
