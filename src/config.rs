//! Connector and consumer group configuration

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{CdcError, Result};

/// Protocol version spoken to brokers that do not advertise one
pub const DEFAULT_PROTOCOL_VERSION: &str = "2.1.1";

fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_string()
}

fn default_fan_out() -> usize {
    1
}

/// Connector-wide settings shared by every group registered through
/// [`ConnectorRegistry::register`](crate::registry::ConnectorRegistry::register)
///
/// Loading this from a file or the environment is the embedding service's
/// job; the struct only derives `Deserialize` so it slots into whatever
/// config layer the service already has.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    /// Kafka bootstrap broker addresses
    pub brokers: Vec<String>,
    /// Logical source server name, the first segment of every derived topic
    pub server_name: String,
    /// Protocol version reported to the brokers
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Partition assignment strategy
    #[serde(default)]
    pub assignor: PartitionAssignor,
    /// Where a group without committed offsets starts reading
    #[serde(default)]
    pub start_offset: StartOffset,
}

impl ConnectorConfig {
    /// Connector configuration with default version, assignor and offset
    /// policy
    pub fn new(brokers: Vec<String>, server_name: impl Into<String>) -> Self {
        Self {
            brokers,
            server_name: server_name.into(),
            protocol_version: default_protocol_version(),
            assignor: PartitionAssignor::default(),
            start_offset: StartOffset::default(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(CdcError::MissingBrokers);
        }
        if self.server_name.trim().is_empty() {
            return Err(CdcError::MissingServerName);
        }
        self.protocol_version.parse::<ProtocolVersion>()?;
        Ok(())
    }
}

/// Broker-facing settings of a single consumer group
///
/// [`ConnectorRegistry::register`](crate::registry::ConnectorRegistry::register)
/// derives these from the connector config;
/// [`ConnectorRegistry::register_with`](crate::registry::ConnectorRegistry::register_with)
/// accepts them directly for groups that consume a foreign topic or need
/// their own brokers.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupSettings {
    /// Kafka bootstrap broker addresses
    pub brokers: Vec<String>,
    /// Topic consumed by the group
    pub topic: String,
    /// Consumer group id; defaults to the topic name when absent
    #[serde(default)]
    pub group_id: Option<String>,
    /// Protocol version reported to the brokers
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Partition assignment strategy
    #[serde(default)]
    pub assignor: PartitionAssignor,
    /// Where the group starts reading without committed offsets
    #[serde(default)]
    pub start_offset: StartOffset,
    /// Parallel consumption units spawned for the group, minimum 1
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,
}

impl GroupSettings {
    /// Settings for `topic` with defaults everywhere else
    pub fn new(brokers: Vec<String>, topic: impl Into<String>) -> Self {
        Self {
            brokers,
            topic: topic.into(),
            group_id: None,
            protocol_version: default_protocol_version(),
            assignor: PartitionAssignor::default(),
            start_offset: StartOffset::default(),
            fan_out: default_fan_out(),
        }
    }

    /// Group id sent to the broker: the configured one, or the topic name
    pub fn effective_group_id(&self) -> &str {
        match &self.group_id {
            Some(group) if !group.trim().is_empty() => group,
            _ => &self.topic,
        }
    }

    /// Consumption units to spawn, never below one
    pub fn effective_fan_out(&self) -> usize {
        self.fan_out.max(1)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(CdcError::MissingBrokers);
        }
        if self.topic.trim().is_empty() {
            return Err(CdcError::MissingTopic(
                self.effective_group_id().to_string(),
            ));
        }
        self.protocol_version.parse::<ProtocolVersion>()?;
        Ok(())
    }
}

/// Partition assignment strategy offered to the group coordinator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionAssignor {
    /// Cooperative sticky assignment, keeps partitions where they are
    Sticky,
    /// Round-robin distribution over members
    RoundRobin,
    /// Contiguous ranges per member
    #[default]
    Range,
}

impl PartitionAssignor {
    /// Value for the client's `partition.assignment.strategy` property
    pub fn strategy_name(&self) -> &'static str {
        match self {
            PartitionAssignor::Sticky => "cooperative-sticky",
            PartitionAssignor::RoundRobin => "roundrobin",
            PartitionAssignor::Range => "range",
        }
    }
}

impl FromStr for PartitionAssignor {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sticky" => Ok(PartitionAssignor::Sticky),
            "roundrobin" => Ok(PartitionAssignor::RoundRobin),
            "range" => Ok(PartitionAssignor::Range),
            other => Err(CdcError::UnknownAssignor(other.to_string())),
        }
    }
}

impl fmt::Display for PartitionAssignor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionAssignor::Sticky => "sticky",
            PartitionAssignor::RoundRobin => "roundrobin",
            PartitionAssignor::Range => "range",
        };
        f.write_str(name)
    }
}

/// Start position for a group without committed offsets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartOffset {
    /// Begin at the earliest retained message
    Oldest,
    /// Begin at the head of the partition
    #[default]
    Newest,
}

impl StartOffset {
    /// Value for the client's `auto.offset.reset` property
    pub fn auto_offset_reset(&self) -> &'static str {
        match self {
            StartOffset::Oldest => "earliest",
            StartOffset::Newest => "latest",
        }
    }
}

/// Validated dotted-numeric Kafka protocol version, e.g. `2.1.1`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolVersion(String);

impl ProtocolVersion {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion(DEFAULT_PROTOCOL_VERSION.to_string())
    }
}

impl FromStr for ProtocolVersion {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        let segments: Vec<&str> = s.split('.').collect();
        let well_formed = (2..=4).contains(&segments.len())
            && segments
                .iter()
                .all(|seg| !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_digit()));
        if well_formed {
            Ok(ProtocolVersion(s.to_string()))
        } else {
            Err(CdcError::InvalidProtocolVersion(s.to_string()))
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignor_parses_known_names() {
        assert_eq!(
            "sticky".parse::<PartitionAssignor>().unwrap(),
            PartitionAssignor::Sticky
        );
        assert_eq!(
            "roundrobin".parse::<PartitionAssignor>().unwrap(),
            PartitionAssignor::RoundRobin
        );
        assert_eq!(
            "range".parse::<PartitionAssignor>().unwrap(),
            PartitionAssignor::Range
        );
    }

    #[test]
    fn assignor_rejects_unknown_names() {
        let err = "random".parse::<PartitionAssignor>().unwrap_err();
        assert!(matches!(err, CdcError::UnknownAssignor(name) if name == "random"));
    }

    #[test]
    fn assignor_maps_to_client_strategy() {
        assert_eq!(PartitionAssignor::Sticky.strategy_name(), "cooperative-sticky");
        assert_eq!(PartitionAssignor::RoundRobin.strategy_name(), "roundrobin");
        assert_eq!(PartitionAssignor::Range.strategy_name(), "range");
    }

    #[test]
    fn protocol_version_accepts_dotted_numerics() {
        assert!("2.1.1".parse::<ProtocolVersion>().is_ok());
        assert!("0.10.2.1".parse::<ProtocolVersion>().is_ok());
        assert!("3.6".parse::<ProtocolVersion>().is_ok());
    }

    #[test]
    fn protocol_version_rejects_garbage() {
        for bad in ["", "2", "2.x.1", "2..1", "latest", "2.1.1-rc1"] {
            assert!(
                bad.parse::<ProtocolVersion>().is_err(),
                "{bad:?} should not parse"
            );
        }
    }

    #[test]
    fn group_id_defaults_to_topic() {
        let mut settings =
            GroupSettings::new(vec!["localhost:9092".into()], "maxwell.app.users");
        assert_eq!(settings.effective_group_id(), "maxwell.app.users");

        settings.group_id = Some("user-sync".into());
        assert_eq!(settings.effective_group_id(), "user-sync");

        settings.group_id = Some("   ".into());
        assert_eq!(settings.effective_group_id(), "maxwell.app.users");
    }

    #[test]
    fn fan_out_never_drops_below_one() {
        let mut settings = GroupSettings::new(vec!["localhost:9092".into()], "t");
        settings.fan_out = 0;
        assert_eq!(settings.effective_fan_out(), 1);
        settings.fan_out = 4;
        assert_eq!(settings.effective_fan_out(), 4);
    }

    #[test]
    fn settings_validation_catches_blanks() {
        let settings = GroupSettings::new(vec![], "topic");
        assert!(matches!(
            settings.validate().unwrap_err(),
            CdcError::MissingBrokers
        ));

        let settings = GroupSettings::new(vec!["localhost:9092".into()], "  ");
        assert!(matches!(
            settings.validate().unwrap_err(),
            CdcError::MissingTopic(_)
        ));

        let mut settings = GroupSettings::new(vec!["localhost:9092".into()], "topic");
        settings.protocol_version = "not-a-version".into();
        assert!(matches!(
            settings.validate().unwrap_err(),
            CdcError::InvalidProtocolVersion(_)
        ));
    }

    #[test]
    fn config_defaults_follow_upstream_conventions() {
        let json = r#"{"brokers": ["localhost:9092"], "server_name": "maxwell"}"#;
        let config: ConnectorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.protocol_version, DEFAULT_PROTOCOL_VERSION);
        assert_eq!(config.assignor, PartitionAssignor::Range);
        assert_eq!(config.start_offset, StartOffset::Newest);
        assert!(config.validate().is_ok());
    }
}
