//! Wire format of row change events

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::Result;

/// Kind of row change carried by an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChangeOp::Insert => "insert",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// One row change event as published by the capture pipeline
///
/// `data` holds the column values after the change (and the deleted row's
/// values on deletes); `old` holds the pre-change values and accompanies
/// updates. Either block may be absent. Unknown envelope fields are
/// ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEnvelope {
    pub database: String,
    pub table: String,
    #[serde(rename = "type")]
    pub op: ChangeOp,
    /// Commit timestamp reported by the pipeline, epoch seconds
    #[serde(default)]
    pub ts: i64,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
    #[serde(default)]
    pub old: Option<Map<String, Value>>,
}

impl ChangeEnvelope {
    /// Parse an envelope from raw message bytes
    pub fn parse(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_insert_envelope() {
        let payload = br#"{
            "database": "app",
            "table": "users",
            "type": "insert",
            "ts": 1704067200,
            "data": {"id": 7, "name": "ada"}
        }"#;
        let envelope = ChangeEnvelope::parse(payload).unwrap();
        assert_eq!(envelope.database, "app");
        assert_eq!(envelope.table, "users");
        assert_eq!(envelope.op, ChangeOp::Insert);
        assert_eq!(envelope.ts, 1704067200);
        assert!(envelope.data.is_some());
        assert!(envelope.old.is_none());
    }

    #[test]
    fn parses_update_with_old_image() {
        let payload = br#"{
            "database": "app",
            "table": "users",
            "type": "update",
            "ts": 1704067201,
            "data": {"id": 7, "name": "ada l."},
            "old": {"name": "ada"}
        }"#;
        let envelope = ChangeEnvelope::parse(payload).unwrap();
        assert_eq!(envelope.op, ChangeOp::Update);
        let old = envelope.old.unwrap();
        assert_eq!(old.get("name").unwrap(), "ada");
    }

    #[test]
    fn parses_delete_without_old() {
        let payload = br#"{
            "database": "app",
            "table": "users",
            "type": "delete",
            "ts": 1704067202,
            "data": {"id": 7}
        }"#;
        let envelope = ChangeEnvelope::parse(payload).unwrap();
        assert_eq!(envelope.op, ChangeOp::Delete);
        assert!(envelope.old.is_none());
    }

    #[test]
    fn rejects_unknown_change_type() {
        let payload = br#"{"database": "app", "table": "users", "type": "truncate"}"#;
        assert!(ChangeEnvelope::parse(payload).is_err());
    }

    #[test]
    fn tolerates_missing_image_blocks_and_extra_fields() {
        let payload = br#"{
            "database": "app",
            "table": "users",
            "type": "update",
            "ts": 1,
            "xid": 98234,
            "commit": true
        }"#;
        let envelope = ChangeEnvelope::parse(payload).unwrap();
        assert!(envelope.data.is_none());
        assert!(envelope.old.is_none());
    }
}
