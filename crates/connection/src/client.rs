use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use crate::connector::Connector;
use crate::error::{ConnectionError, Result};
use crate::types::ConnectOutcome;

const STATUS_PATH: &str = "/api/status";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connector probing a device API's status endpoint over HTTP.
///
/// 2xx means connected, 401/403 means the credentials were rejected, and
/// anything else (other statuses, refused connections, timeouts) counts as
/// temporarily unreachable.
pub struct HttpConnector {
    base_url: String,
    token: Option<String>,
    client: Client,
}

impl HttpConnector {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Self::with_client(base_url, client)
    }

    /// Fails with `InvalidConfig` when `base_url` is blank, so a bad config
    /// is reported once instead of being retried as an outage.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Result<Self> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ConnectionError::InvalidConfig(
                "base_url must not be empty".to_string(),
            ));
        }
        Ok(Self {
            base_url,
            token: None,
            client,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn status_url(&self) -> String {
        format!("{}{}", self.base_url, STATUS_PATH)
    }

    fn classify(status: StatusCode) -> ConnectOutcome {
        if status.is_success() {
            ConnectOutcome::Connected
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            ConnectOutcome::Unauthorized
        } else {
            ConnectOutcome::unreachable(format!("Status {}", status))
        }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self) -> ConnectOutcome {
        let url = self.status_url();
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) => {
                let outcome = Self::classify(response.status());
                debug!(url = %url, status = %response.status(), outcome = ?outcome, "Status check");
                outcome
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Status check failed");
                ConnectOutcome::unreachable(e.to_string())
            }
        }
    }
}
