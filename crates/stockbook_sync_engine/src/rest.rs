//! REST replica implementation.
//!
//! Speaks a PostgREST-style row API against the sync-space table. The
//! actual HTTP client is abstracted via a trait so different HTTP
//! libraries (or a custom service) can back the engine without
//! touching sync logic.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::remote::{RealtimeEvent, RemoteReplica};
use async_trait::async_trait;
use serde_json::json;
use stockbook_sync_protocol::RemoteRow;
use tokio::sync::mpsc;

/// An HTTP response, reduced to what the replica needs.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: String,
}

impl HttpResponse {
    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// A transport-level `Err` means the request never completed
/// (connection failure, abort, timeout) and is classified as a
/// network error; a completed response with a non-2xx status is an
/// application-level query error.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request and returns the response.
    async fn request(
        &self,
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: Option<String>,
    ) -> Result<HttpResponse, String>;
}

/// A remote replica backed by a PostgREST-style HTTP API.
pub struct RestReplica<C: HttpClient> {
    endpoint: String,
    table: String,
    api_key: String,
    client: C,
}

impl<C: HttpClient> RestReplica<C> {
    /// Creates a replica from the sync configuration.
    pub fn new(config: &SyncConfig, client: C) -> Self {
        Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            table: config.table.clone(),
            api_key: config.api_key.clone(),
            client,
        }
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            ("apikey".to_string(), self.api_key.clone()),
            (
                "Authorization".to_string(),
                format!("Bearer {}", self.api_key),
            ),
            ("Content-Type".to_string(), "application/json".to_string()),
        ]
    }

    fn table_url(&self, query: &str) -> String {
        format!("{}/{}{}", self.endpoint, self.table, query)
    }

    async fn send(
        &self,
        method: &str,
        url: &str,
        extra_headers: &[(String, String)],
        body: Option<String>,
    ) -> SyncResult<HttpResponse> {
        let mut headers = self.headers();
        headers.extend_from_slice(extra_headers);

        let response = self
            .client
            .request(method, url, &headers, body)
            .await
            .map_err(SyncError::network)?;

        if !response.is_success() {
            return Err(SyncError::Query(format!(
                "{method} {url} returned {}: {}",
                response.status, response.body
            )));
        }
        Ok(response)
    }

    fn row_body(row: &RemoteRow) -> String {
        // The marker column is server-maintained and never written.
        json!([{ "id": row.id, "payload": row.payload }]).to_string()
    }
}

#[async_trait]
impl<C: HttpClient> RemoteReplica for RestReplica<C> {
    async fn read_marker(&self, space_id: &str) -> SyncResult<Option<String>> {
        let url = self.table_url(&format!(
            "?id=eq.{}&select=updated_at",
            urlencoding::encode(space_id)
        ));
        let response = self.send("GET", &url, &[], None).await?;

        let rows: Vec<serde_json::Value> = serde_json::from_str(&response.body)
            .map_err(|e| SyncError::Query(format!("malformed marker response: {e}")))?;
        Ok(rows
            .first()
            .and_then(|row| row.get("updated_at"))
            .and_then(|marker| marker.as_str())
            .map(String::from))
    }

    async fn read_row(&self, space_id: &str) -> SyncResult<Option<RemoteRow>> {
        let url = self.table_url(&format!(
            "?id=eq.{}&select=id,payload,updated_at",
            urlencoding::encode(space_id)
        ));
        let response = self.send("GET", &url, &[], None).await?;

        let mut rows: Vec<RemoteRow> = serde_json::from_str(&response.body)
            .map_err(|e| SyncError::Query(format!("malformed row response: {e}")))?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.swap_remove(0))
        })
    }

    async fn upsert_row(&self, row: &RemoteRow) -> SyncResult<()> {
        let url = self.table_url("?on_conflict=id");
        let prefer = (
            "Prefer".to_string(),
            "resolution=merge-duplicates".to_string(),
        );
        self.send("POST", &url, &[prefer], Some(Self::row_body(row)))
            .await?;
        Ok(())
    }

    async fn update_row(&self, row: &RemoteRow) -> SyncResult<()> {
        let url = self.table_url(&format!("?id=eq.{}", urlencoding::encode(&row.id)));
        let body = json!({ "payload": row.payload }).to_string();
        self.send("PATCH", &url, &[], Some(body)).await?;
        Ok(())
    }

    async fn insert_row(&self, row: &RemoteRow) -> SyncResult<()> {
        let url = self.table_url("");
        self.send("POST", &url, &[], Some(Self::row_body(row)))
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        _space_id: &str,
    ) -> SyncResult<Option<mpsc::Receiver<RealtimeEvent>>> {
        // Plain REST has no change feed; the engine falls back to the
        // short polling interval.
        Ok(None)
    }
}
