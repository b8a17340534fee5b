use prometheus::{IntCounter, Opts};
use tracing::warn;

/// Prometheus counters for one connector instance
///
/// Registered on the default registry; attach via the `new_with_metrics`
/// constructors so unconfigured deployments pay nothing.
#[derive(Clone)]
pub struct ConnectorMetrics {
    pub messages_consumed: IntCounter,
    pub envelope_parse_failures: IntCounter,
    pub field_decode_failures: IntCounter,
    pub handler_errors: IntCounter,
    pub rebalances: IntCounter,
}

impl ConnectorMetrics {
    pub fn new(connector: &str) -> Self {
        let registry = prometheus::default_registry();

        let messages_consumed = IntCounter::with_opts(
            Opts::new(
                "cdc_messages_consumed_total",
                "Total number of change events consumed and acknowledged",
            )
            .const_label("connector", connector.to_string()),
        )
        .expect("valid metric opts for cdc_messages_consumed_total");

        let envelope_parse_failures = IntCounter::with_opts(
            Opts::new(
                "cdc_envelope_parse_failures_total",
                "Total number of change events skipped because the envelope would not parse",
            )
            .const_label("connector", connector.to_string()),
        )
        .expect("valid metric opts for cdc_envelope_parse_failures_total");

        let field_decode_failures = IntCounter::with_opts(
            Opts::new(
                "cdc_field_decode_failures_total",
                "Total number of individual fields that failed to decode",
            )
            .const_label("connector", connector.to_string()),
        )
        .expect("valid metric opts for cdc_field_decode_failures_total");

        let handler_errors = IntCounter::with_opts(
            Opts::new(
                "cdc_handler_errors_total",
                "Total number of errors returned by change handlers",
            )
            .const_label("connector", connector.to_string()),
        )
        .expect("valid metric opts for cdc_handler_errors_total");

        let rebalances = IntCounter::with_opts(
            Opts::new(
                "cdc_rebalances_total",
                "Total number of partition revocations observed by consumer sessions",
            )
            .const_label("connector", connector.to_string()),
        )
        .expect("valid metric opts for cdc_rebalances_total");

        for metric in [
            Box::new(messages_consumed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(envelope_parse_failures.clone()),
            Box::new(field_decode_failures.clone()),
            Box::new(handler_errors.clone()),
            Box::new(rebalances.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register connector metric: {}", e);
            }
        }

        Self {
            messages_consumed,
            envelope_parse_failures,
            field_decode_failures,
            handler_errors,
            rebalances,
        }
    }
}
