use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A database row: column name to scalar value, key-ordered.
pub type Row = serde_json::Map<String, Value>;

/// Full database state: table name to the rows in natural scan order.
pub type DbState = BTreeMap<String, Vec<Row>>;

/// A complete recording of a single service interaction: the incoming call,
/// the outgoing calls it triggered, and the database rows around it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub db_state_before: DbState,
    pub request: HttpRequest,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outgoing_requests: Vec<OutgoingRequest>,
    pub response: HttpResponse,
    pub db_state_after: DbState,
    pub db_diff: BTreeMap<String, TableDiff>,
}

/// The incoming HTTP request. `url` is the request-URI (path plus query);
/// header keys are case-folded and values joined into a single string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
}

/// The HTTP response observed from the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
}

/// An outgoing HTTP call made by the service during the incoming request,
/// with the upstream response that was observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingRequest {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<HttpResponse>,
}

/// Per-table changes between the before and after database states.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableDiff {
    pub added: Vec<Row>,
    pub removed: Vec<Row>,
    pub modified: Vec<ModifiedRow>,
}

impl TableDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// A row whose column values changed between snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifiedRow {
    pub before: Row,
    pub after: Row,
}

/// Summary of a stored snapshot for listing.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    pub id: String,
    pub path: String,
    pub service: String,
    pub method: String,
    pub url: String,
    pub status: u16,
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Generates a short random hex identifier for a new snapshot.
pub fn generate_id() -> String {
    let bytes: [u8; 6] = rand::random();
    let mut id = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(id, "{byte:02x}");
    }
    id
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::generate_id;

    #[test]
    fn generated_ids_are_twelve_hex_chars() {
        let id = generate_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generated_ids_are_unique_enough() {
        let first = generate_id();
        let second = generate_id();
        assert_ne!(first, second);
    }

    #[test]
    fn snapshot_serializes_without_empty_collections() {
        let snap = super::Snapshot {
            id: "abc123".to_owned(),
            timestamp: chrono::Utc::now(),
            service: "svc".to_owned(),
            tags: Vec::new(),
            db_state_before: Default::default(),
            request: super::HttpRequest {
                method: "GET".to_owned(),
                url: "/health".to_owned(),
                headers: Default::default(),
                body: serde_json::Value::Null,
            },
            outgoing_requests: Vec::new(),
            response: super::HttpResponse {
                status: 200,
                headers: Default::default(),
                body: json!({"ok": true}),
            },
            db_state_after: Default::default(),
            db_diff: Default::default(),
        };

        let value = serde_json::to_value(&snap).unwrap();
        assert!(value.get("tags").is_none());
        assert!(value.get("outgoing_requests").is_none());
        assert!(value["request"].get("body").is_none());
        assert_eq!(value["response"]["body"], json!({"ok": true}));
    }
}
