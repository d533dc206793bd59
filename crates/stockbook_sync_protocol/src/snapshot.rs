//! Remote snapshot and row types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A device identity used as provenance metadata on pushes.
///
/// Generated once per device and persisted locally. Never used for
/// authorization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Generates a fresh random device identity.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The full synchronized state of one sync space at a point in time.
///
/// Stored serialized as the payload of the single remote row. Values
/// are keyed by tracked partition name and are opaque to the engine
/// (except the items partition, which is merged per record).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSnapshot {
    /// Declared timestamp of the write, epoch milliseconds.
    pub updated_at: i64,
    /// The device that produced this snapshot.
    pub updated_by: DeviceId,
    /// Application version of the producing device.
    pub app_version: String,
    /// Tracked partition values.
    pub values: BTreeMap<String, String>,
}

impl RemoteSnapshot {
    /// Creates a new snapshot.
    pub fn new(
        updated_at: i64,
        updated_by: DeviceId,
        app_version: impl Into<String>,
        values: BTreeMap<String, String>,
    ) -> Self {
        Self {
            updated_at,
            updated_by,
            app_version: app_version.into(),
            values,
        }
    }

    /// Serializes the snapshot to its JSON wire form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes a snapshot from its JSON wire form.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// The single remote replica row for one sync space.
///
/// `updated_at` is the server-maintained change marker. It is opaque
/// to clients and only ever compared for equality, as a cheap "did
/// anything change" check before fetching the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRow {
    /// Sync-space identifier.
    pub id: String,
    /// Serialized [`RemoteSnapshot`].
    pub payload: String,
    /// Server-maintained change marker.
    #[serde(default)]
    pub updated_at: String,
}

impl RemoteRow {
    /// Creates a row for writing. The marker is left for the server to fill.
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            updated_at: String::new(),
        }
    }

    /// Parses the payload into a [`RemoteSnapshot`].
    pub fn snapshot(&self) -> Result<RemoteSnapshot, serde_json::Error> {
        RemoteSnapshot::from_json(&self.payload)
    }
}
