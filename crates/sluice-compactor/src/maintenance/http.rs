//! HTTP client for a remote table maintenance service.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | count | `GET {base}/tables/{table}/delete-files/count` → `{"count": n}` |
//! | rewrite data | `POST {base}/tables/{table}/rewrite-data-files` |
//! | rewrite deletes | `POST {base}/tables/{table}/rewrite-position-deletes` |
//! | refresh | `POST {base}/tables/{table}/refresh` |
//! | expire | `POST {base}/tables/{table}/expire-snapshots` with `{"retain_last": n}` |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;

use sluice_core::TableIdentifier;

use super::{
    DeleteRewriteStats, ExpireStats, MaintenanceError, Result, RewriteOptions, RewriteStats,
    TableMaintenance,
};

/// Rewrites can run for a long time; requests are bounded well above that.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, serde::Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Serialize)]
struct ExpireRequest {
    retain_last: u32,
}

/// [`TableMaintenance`] over JSON/HTTP.
#[derive(Debug, Clone)]
pub struct HttpTableMaintenance {
    base_url: reqwest::Url,
    client: reqwest::Client,
}

impl HttpTableMaintenance {
    /// Creates a client targeting the given base URL.
    ///
    /// # Errors
    ///
    /// Returns [`MaintenanceError::Configuration`] if the URL is not an
    /// absolute http(s) URL or the client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Creates a client with a custom per-request timeout.
    ///
    /// # Errors
    ///
    /// See [`HttpTableMaintenance::new`].
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into();
        let parsed = reqwest::Url::parse(&base_url).map_err(|e| {
            MaintenanceError::Configuration(format!("invalid maintenance URL '{base_url}': {e}"))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(MaintenanceError::Configuration(format!(
                "maintenance URL '{base_url}' must be http or https"
            )));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()
            .map_err(|e| {
                MaintenanceError::Configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            base_url: parsed,
            client,
        })
    }

    /// Table components come from object keys; each is pushed as an encoded
    /// path segment.
    fn url(&self, table: &TableIdentifier, operation: &[&str]) -> reqwest::Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push("tables")
                .push(&table.to_string())
                .extend(operation);
        }
        url
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        table: &TableIdentifier,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = request.send().await.map_err(|e| MaintenanceError::Request {
            operation,
            message: e.to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| MaintenanceError::Decode {
                    operation,
                    message: e.to_string(),
                });
        }

        let body = response.text().await.unwrap_or_default();
        tracing::debug!(operation, table = %table, %status, "maintenance call failed");
        Err(MaintenanceError::Status {
            operation,
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl TableMaintenance for HttpTableMaintenance {
    async fn delete_file_count(&self, table: &TableIdentifier) -> Result<u64> {
        let request = self.client.get(self.url(table, &["delete-files", "count"]));
        let response: CountResponse = self.send("delete_file_count", table, request).await?;
        Ok(response.count)
    }

    async fn rewrite_data_files(
        &self,
        table: &TableIdentifier,
        options: RewriteOptions,
    ) -> Result<RewriteStats> {
        let request = self
            .client
            .post(self.url(table, &["rewrite-data-files"]))
            .json(&options);
        self.send("rewrite_data_files", table, request).await
    }

    async fn rewrite_position_deletes(
        &self,
        table: &TableIdentifier,
    ) -> Result<DeleteRewriteStats> {
        const OPERATION: &str = "rewrite_position_deletes";
        let request = self
            .client
            .post(self.url(table, &["rewrite-position-deletes"]))
            .json(&serde_json::json!({}));
        match self.send(OPERATION, table, request).await {
            Err(MaintenanceError::Status { status, .. })
                if status == StatusCode::NOT_FOUND.as_u16()
                    || status == StatusCode::NOT_IMPLEMENTED.as_u16() =>
            {
                Err(MaintenanceError::Unsupported {
                    operation: OPERATION,
                    table: table.to_string(),
                })
            }
            other => other,
        }
    }

    async fn refresh(&self, table: &TableIdentifier) -> Result<()> {
        let request = self
            .client
            .post(self.url(table, &["refresh"]))
            .json(&serde_json::json!({}));
        let _: serde_json::Value = self.send("refresh", table, request).await?;
        Ok(())
    }

    async fn expire_snapshots(
        &self,
        table: &TableIdentifier,
        retain_last: u32,
    ) -> Result<ExpireStats> {
        let request = self
            .client
            .post(self.url(table, &["expire-snapshots"]))
            .json(&ExpireRequest { retain_last });
        self.send("expire_snapshots", table, request).await
    }
}
