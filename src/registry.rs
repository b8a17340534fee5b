//! Group registration and connector lifecycle

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{ConnectorConfig, GroupSettings};
use crate::error::{CdcError, Result};
use crate::handler::ChangeHandler;
use crate::metrics::ConnectorMetrics;
use crate::router::EventRouter;
use crate::runtime::ConsumerRuntime;
use crate::schema::{bindings_for, CdcRecord};

/// Cloneable trigger for a registry's cooperative shutdown
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Ask every runtime started from the registry to stop
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

struct PreparedRuntime {
    ready: watch::Receiver<bool>,
    launch: Box<dyn FnOnce() -> JoinHandle<Result<()>> + Send>,
}

type GroupBuilder = Box<
    dyn FnOnce(
            &GroupSettings,
            watch::Receiver<bool>,
            Option<Arc<ConnectorMetrics>>,
        ) -> Result<Vec<PreparedRuntime>>
        + Send,
>;

struct RegisteredGroup {
    name: String,
    settings: GroupSettings,
    build: GroupBuilder,
}

/// Registers consumer groups and runs them to completion
///
/// Groups are validated as they are registered, constructed together when
/// [`ConnectorRegistry::start`] is called (so one bad group aborts startup
/// before anything consumes) and then driven until shutdown.
pub struct ConnectorRegistry {
    config: ConnectorConfig,
    groups: Vec<RegisteredGroup>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    metrics: Option<Arc<ConnectorMetrics>>,
}

impl ConnectorRegistry {
    /// Validate connector-wide configuration and create an empty registry
    pub fn new(config: ConnectorConfig) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            groups: Vec::new(),
            shutdown_tx: Arc::new(shutdown_tx),
            metrics: None,
        })
    }

    /// Same as [`ConnectorRegistry::new`], with Prometheus counters
    /// attached to every runtime
    pub fn new_with_metrics(config: ConnectorConfig, metrics: Arc<ConnectorMetrics>) -> Result<Self> {
        let mut registry = Self::new(config)?;
        registry.metrics = Some(metrics);
        Ok(registry)
    }

    /// Register a consumer group for one captured table
    ///
    /// The topic is derived as `server.database.table`. A blank group name
    /// falls back to the derived topic. `fan_out` asks for that many
    /// parallel consumption units, minimum one. `T`'s schema is resolved
    /// eagerly so a declaration mistake fails here, not at start.
    pub fn register<T: CdcRecord>(
        &mut self,
        group: &str,
        database: &str,
        table: &str,
        handlers: Vec<Arc<dyn ChangeHandler<T>>>,
        fan_out: usize,
    ) -> Result<()> {
        if database.trim().is_empty() {
            return Err(CdcError::BlankDatabase(group.to_string()));
        }
        if table.trim().is_empty() {
            warn!(group, "Table name is blank, the derived topic will be malformed");
        }
        let topic = format!("{}.{}.{}", self.config.server_name, database, table);
        let mut settings = GroupSettings::new(self.config.brokers.clone(), topic);
        settings.group_id = if group.trim().is_empty() {
            None
        } else {
            Some(group.to_string())
        };
        settings.protocol_version = self.config.protocol_version.clone();
        settings.assignor = self.config.assignor;
        settings.start_offset = self.config.start_offset;
        settings.fan_out = fan_out;
        self.add_group::<T>(settings, handlers)
    }

    /// Register a consumer group with explicit broker-facing settings
    ///
    /// For groups that consume a topic not derived from this connector's
    /// server name, or that need their own brokers or offset policy.
    pub fn register_with<T: CdcRecord>(
        &mut self,
        settings: GroupSettings,
        handlers: Vec<Arc<dyn ChangeHandler<T>>>,
    ) -> Result<()> {
        self.add_group::<T>(settings, handlers)
    }

    fn add_group<T: CdcRecord>(
        &mut self,
        settings: GroupSettings,
        handlers: Vec<Arc<dyn ChangeHandler<T>>>,
    ) -> Result<()> {
        let name = settings.effective_group_id().to_string();
        if self.groups.iter().any(|g| g.name == name) {
            return Err(CdcError::DuplicateGroup(name));
        }
        if handlers.is_empty() {
            warn!(group = %name, "No handlers registered, decoded events will be dropped");
        }
        bindings_for::<T>()?;

        let build: GroupBuilder = Box::new(move |settings, shutdown, metrics| {
            let mut prepared = Vec::with_capacity(settings.effective_fan_out());
            for _ in 0..settings.effective_fan_out() {
                let router = match &metrics {
                    Some(metrics) => {
                        EventRouter::new_with_metrics(handlers.clone(), Arc::clone(metrics))?
                    }
                    None => EventRouter::new(handlers.clone())?,
                };
                let runtime = match &metrics {
                    Some(metrics) => ConsumerRuntime::new_with_metrics(
                        settings,
                        router,
                        shutdown.clone(),
                        Arc::clone(metrics),
                    )?,
                    None => ConsumerRuntime::new(settings, router, shutdown.clone())?,
                };
                let ready = runtime.ready();
                prepared.push(PreparedRuntime {
                    ready,
                    launch: Box::new(move || tokio::spawn(runtime.run())),
                });
            }
            Ok(prepared)
        });

        info!(
            group = %name,
            topic = %settings.topic,
            fan_out = settings.effective_fan_out(),
            "Consumer group registered"
        );
        self.groups.push(RegisteredGroup {
            name,
            settings,
            build,
        });
        Ok(())
    }

    /// Handle that triggers cooperative shutdown from anywhere
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Names of the registered groups, in registration order
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|g| g.name.as_str())
    }

    /// Construct every runtime, launch them, wait for each session to
    /// become ready once, then block until all of them have terminated
    ///
    /// Any construction error aborts startup before a single message is
    /// consumed. After shutdown the first runtime error, if any, is
    /// returned once every task has wound down.
    pub async fn start(mut self) -> Result<()> {
        if self.groups.is_empty() {
            warn!("No consumer groups registered, nothing to start");
            return Ok(());
        }

        let mut prepared = Vec::new();
        for group in self.groups.drain(..) {
            let shutdown = self.shutdown_tx.subscribe();
            let runtimes = (group.build)(&group.settings, shutdown, self.metrics.clone())?;
            prepared.extend(runtimes);
        }

        let mut ready_watches = Vec::with_capacity(prepared.len());
        let mut handles = Vec::with_capacity(prepared.len());
        for runtime in prepared {
            ready_watches.push(runtime.ready);
            handles.push((runtime.launch)());
        }

        for mut ready in ready_watches {
            while !*ready.borrow() {
                if ready.changed().await.is_err() {
                    // Runtime already stopped; its join result says why.
                    break;
                }
            }
        }
        info!(runtimes = handles.len(), "Consumer runtimes launched");

        let mut first_error = None;
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Consumer runtime failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Consumer task aborted");
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// [`ConnectorRegistry::start`], with SIGINT and SIGTERM wired to the
    /// shutdown handle
    pub async fn start_with_signals(self) -> Result<()> {
        let handle = self.shutdown_handle();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, stopping consumer groups");
            handle.shutdown();
        });
        self.start().await
    }
}

impl fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups: Vec<&str> = self.groups.iter().map(|g| g.name.as_str()).collect();
        f.debug_struct("ConnectorRegistry")
            .field("server_name", &self.config.server_name)
            .field("groups", &groups)
            .finish()
    }
}

/// Completes on Ctrl+C or, on unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PartitionAssignor, StartOffset};
    use crate::schema::SchemaBuilder;

    #[derive(Default)]
    struct Order;

    impl CdcRecord for Order {
        fn schema() -> SchemaBuilder<Self> {
            SchemaBuilder::new()
        }
    }

    fn test_config() -> ConnectorConfig {
        ConnectorConfig::new(vec!["localhost:9092".into()], "maxwell")
    }

    #[test]
    fn rejects_connector_config_without_brokers() {
        let err = ConnectorRegistry::new(ConnectorConfig::new(vec![], "maxwell")).unwrap_err();
        assert!(matches!(err, CdcError::MissingBrokers));
    }

    #[test]
    fn rejects_blank_server_name() {
        let config = ConnectorConfig::new(vec!["localhost:9092".into()], "  ");
        let err = ConnectorRegistry::new(config).unwrap_err();
        assert!(matches!(err, CdcError::MissingServerName));
    }

    #[test]
    fn derives_topic_and_defaults_group_name() {
        let mut registry = ConnectorRegistry::new(test_config()).unwrap();
        registry
            .register::<Order>("", "app", "orders", Vec::new(), 1)
            .unwrap();
        assert_eq!(registry.groups[0].settings.topic, "maxwell.app.orders");
        assert_eq!(registry.groups[0].name, "maxwell.app.orders");

        registry
            .register::<Order>("orders-sync", "app", "orders", Vec::new(), 3)
            .unwrap();
        assert_eq!(registry.groups[1].name, "orders-sync");
        assert_eq!(registry.groups[1].settings.effective_fan_out(), 3);
    }

    #[test]
    fn duplicate_group_names_are_rejected() {
        let mut registry = ConnectorRegistry::new(test_config()).unwrap();
        registry
            .register::<Order>("orders-sync", "app", "orders", Vec::new(), 1)
            .unwrap();
        let err = registry
            .register::<Order>("orders-sync", "app", "orders_v2", Vec::new(), 1)
            .unwrap_err();
        assert!(matches!(err, CdcError::DuplicateGroup(name) if name == "orders-sync"));
    }

    #[test]
    fn blank_database_is_fatal() {
        let mut registry = ConnectorRegistry::new(test_config()).unwrap();
        let err = registry
            .register::<Order>("orders-sync", "  ", "orders", Vec::new(), 1)
            .unwrap_err();
        assert!(matches!(err, CdcError::BlankDatabase(_)));
    }

    #[test]
    fn blank_table_warns_but_still_registers() {
        let mut registry = ConnectorRegistry::new(test_config()).unwrap();
        registry
            .register::<Order>("orders-sync", "app", "", Vec::new(), 1)
            .unwrap();
        assert_eq!(registry.groups[0].name, "orders-sync");
        assert_eq!(registry.groups[0].settings.topic, "maxwell.app.");
    }

    #[test]
    fn fan_out_is_clamped_to_one() {
        let mut registry = ConnectorRegistry::new(test_config()).unwrap();
        registry
            .register::<Order>("orders-sync", "app", "orders", Vec::new(), 0)
            .unwrap();
        assert_eq!(registry.groups[0].settings.effective_fan_out(), 1);
    }

    #[test]
    fn register_with_keeps_foreign_settings() {
        let mut registry = ConnectorRegistry::new(test_config()).unwrap();
        let mut settings = GroupSettings::new(vec!["other:9092".into()], "ticdc.app.users");
        settings.group_id = Some("user-sync".into());
        settings.assignor = PartitionAssignor::RoundRobin;
        settings.start_offset = StartOffset::Oldest;
        registry
            .register_with::<Order>(settings, Vec::new())
            .unwrap();
        assert_eq!(registry.groups[0].name, "user-sync");
        assert_eq!(
            registry.groups[0].settings.assignor,
            PartitionAssignor::RoundRobin
        );
        assert_eq!(registry.groups[0].settings.start_offset, StartOffset::Oldest);
    }

    #[test]
    fn schema_errors_surface_at_registration() {
        #[derive(Default)]
        struct Broken {
            id: i64,
        }

        impl CdcRecord for Broken {
            fn schema() -> SchemaBuilder<Self> {
                SchemaBuilder::<Self>::new()
                    .int("id", |r, v| r.id = v)
                    .int("id", |r, v| r.id = v)
            }
        }

        let mut registry = ConnectorRegistry::new(test_config()).unwrap();
        let err = registry
            .register::<Broken>("broken", "app", "broken", Vec::new(), 1)
            .unwrap_err();
        assert!(matches!(err, CdcError::Schema { .. }));
    }

    #[tokio::test]
    async fn start_with_no_groups_returns_immediately() {
        let registry = ConnectorRegistry::new(test_config()).unwrap();
        assert!(registry.start().await.is_ok());
    }
}
