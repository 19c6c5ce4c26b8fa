//! Client of the Enterprise Search read-only mode API

use crate::association::Credentials;
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

pub const READ_ONLY_MODE_API_PATH: &str = "/api/ent/v1/internal/read_only_mode";
pub const READ_ONLY_MODE_TIMEOUT: Duration = Duration::from_secs(60);

/// One call to the read-only mode API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOnlyModeRequest {
    /// Base URL of the HTTP service, without trailing slash
    pub base_url: String,
    pub enabled: bool,
    pub credentials: Credentials,
    /// PEM certificates to trust, for HTTPS endpoints
    pub trusted_certs: Option<Vec<u8>>,
}

impl ReadOnlyModeRequest {
    pub fn url(&self) -> String {
        format!("{}{READ_ONLY_MODE_API_PATH}", self.base_url)
    }

    pub fn body(&self) -> String {
        format!("{{\"enabled\": {}}}", self.enabled)
    }
}

/// Toggles read-only mode on a running Enterprise Search
#[async_trait]
pub trait ReadOnlyModeClient: Send + Sync {
    async fn set_read_only_mode(&self, request: &ReadOnlyModeRequest) -> Result<()>;
}

/// [`ReadOnlyModeClient`] over HTTP.
///
/// A client is built per call since the trusted certificates belong to the
/// resource being reconciled.
#[derive(Debug, Clone, Default)]
pub struct HttpReadOnlyModeClient;

impl HttpReadOnlyModeClient {
    fn http_client(request: &ReadOnlyModeRequest) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().timeout(READ_ONLY_MODE_TIMEOUT);
        if let Some(pem) = request.trusted_certs.as_deref() {
            for cert in reqwest::Certificate::from_pem_bundle(pem)? {
                builder = builder.add_root_certificate(cert);
            }
        }
        Ok(builder.build()?)
    }
}

#[async_trait]
impl ReadOnlyModeClient for HttpReadOnlyModeClient {
    async fn set_read_only_mode(&self, request: &ReadOnlyModeRequest) -> Result<()> {
        let url = request.url();
        debug!(url = %url, enabled = request.enabled, "Calling read-only mode API");

        let response = Self::http_client(request)?
            .put(&url)
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .basic_auth(&request.credentials.username, Some(&request.credentials.password))
            .body(request.body())
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await?;
            return Err(OperatorError::ReadOnlyMode {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
