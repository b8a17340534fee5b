//! Envelope routing and dispatch

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::decode::decode_into;
use crate::envelope::{ChangeEnvelope, ChangeOp};
use crate::error::Result;
use crate::handler::ChangeHandler;
use crate::metrics::ConnectorMetrics;
use crate::schema::{bindings_for, CdcRecord, TableSchema};

/// Routes change events of one record type to its handler chain
///
/// The router owns the per-message policy: an unparseable envelope is
/// skipped, an event without the image its operation needs is skipped, a
/// failing handler is logged and the chain continues. None of these stop
/// the stream, and the consumer acknowledges the offset either way.
pub struct EventRouter<T: CdcRecord> {
    schema: Arc<TableSchema<T>>,
    handlers: Vec<Arc<dyn ChangeHandler<T>>>,
    metrics: Option<Arc<ConnectorMetrics>>,
}

impl<T: CdcRecord> EventRouter<T> {
    /// Resolve `T`'s bindings and wrap the handler chain
    ///
    /// Fails when `T`'s schema declaration is invalid, so a bad schema
    /// surfaces before any message is consumed.
    pub fn new(handlers: Vec<Arc<dyn ChangeHandler<T>>>) -> Result<Self> {
        Ok(Self {
            schema: bindings_for::<T>()?,
            handlers,
            metrics: None,
        })
    }

    /// Same as [`EventRouter::new`], with Prometheus counters attached
    pub fn new_with_metrics(
        handlers: Vec<Arc<dyn ChangeHandler<T>>>,
        metrics: Arc<ConnectorMetrics>,
    ) -> Result<Self> {
        Ok(Self {
            schema: bindings_for::<T>()?,
            handlers,
            metrics: Some(metrics),
        })
    }

    /// Process one raw message payload
    pub async fn process(&self, payload: &[u8]) {
        let envelope = match ChangeEnvelope::parse(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Skipping unparseable change event");
                if let Some(metrics) = &self.metrics {
                    metrics.envelope_parse_failures.inc();
                }
                return;
            }
        };
        self.dispatch(&envelope).await;
    }

    /// Dispatch a parsed envelope to the handler chain
    pub async fn dispatch(&self, envelope: &ChangeEnvelope) {
        match envelope.op {
            ChangeOp::Insert => {
                let columns = match &envelope.data {
                    Some(columns) => columns,
                    None => {
                        debug!(table = %envelope.table, "Insert event without row image, skipping");
                        return;
                    }
                };
                let after = self.decode(columns, envelope);
                for handler in &self.handlers {
                    if let Err(e) = handler.create(&after).await {
                        self.log_handler_error(envelope, &e);
                    }
                }
            }
            ChangeOp::Update => {
                let columns = match &envelope.data {
                    Some(columns) => columns,
                    None => {
                        warn!(
                            table = %envelope.table,
                            "Update event without post-change image, skipping"
                        );
                        return;
                    }
                };
                let after = self.decode(columns, envelope);
                let before = envelope.old.as_ref().map(|old| self.decode(old, envelope));
                for handler in &self.handlers {
                    if let Err(e) = handler.update(before.as_ref(), &after).await {
                        self.log_handler_error(envelope, &e);
                    }
                }
            }
            ChangeOp::Delete => {
                let columns = match &envelope.data {
                    Some(columns) => columns,
                    None => {
                        debug!(table = %envelope.table, "Delete event without row image, skipping");
                        return;
                    }
                };
                let record = self.decode(columns, envelope);
                for handler in &self.handlers {
                    if let Err(e) = handler.delete(&record).await {
                        self.log_handler_error(envelope, &e);
                    }
                }
            }
        }
    }

    fn decode(&self, columns: &Map<String, Value>, envelope: &ChangeEnvelope) -> T {
        let mut record = T::default();
        let failures = decode_into(columns, &self.schema, &mut record);
        for failure in &failures {
            warn!(
                record = self.schema.record_name(),
                table = %envelope.table,
                field = %failure.field,
                column = %failure.column,
                reason = %failure.reason,
                "Field decode failed"
            );
        }
        if let Some(metrics) = &self.metrics {
            if !failures.is_empty() {
                metrics.field_decode_failures.inc_by(failures.len() as u64);
            }
        }
        record
    }

    fn log_handler_error(&self, envelope: &ChangeEnvelope, e: &anyhow::Error) {
        error!(
            table = %envelope.table,
            op = %envelope.op,
            error = %e,
            "Change handler failed"
        );
        if let Some(metrics) = &self.metrics {
            metrics.handler_errors.inc();
        }
    }
}
