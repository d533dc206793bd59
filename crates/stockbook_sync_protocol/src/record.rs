//! Identifiable inventory records.
//!
//! The items partition is the one partition the engine looks inside:
//! it is a JSON array of records, each carrying a stable identity and
//! a modification timestamp. Everything besides the identity and the
//! timestamps is carried verbatim.

use serde::{Deserialize, Serialize};

/// One inventory record inside the items partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockRecord {
    /// Stable record identity.
    pub id: String,
    /// Modification timestamp, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    /// Creation timestamp, epoch milliseconds. Fallback when the
    /// record has never been edited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    /// Domain fields, carried verbatim.
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl StockRecord {
    /// The timestamp used for last-write-wins comparison:
    /// `updated_at`, falling back to `created_at`, falling back to 0.
    pub fn effective_timestamp(&self) -> i64 {
        self.updated_at.or(self.created_at).unwrap_or(0)
    }

    /// Parses an items partition value into records.
    pub fn parse_collection(json: &str) -> Result<Vec<StockRecord>, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serializes records back into an items partition value.
    pub fn serialize_collection(records: &[StockRecord]) -> Result<String, serde_json::Error> {
        serde_json::to_string(records)
    }
}
