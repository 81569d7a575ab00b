//! HTTP I/O for service/send tasks (§4.4).

use crate::error::EngineError;
use async_trait::async_trait;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;

/// Pluggable backend behind `serviceTask`/`sendTask` execution — the same
/// "trait the engine talks through" shape as `ProcessStore`, so tests can
/// swap in a canned double instead of hitting the network.
#[async_trait]
pub trait ConnectorRunner: Send + Sync {
    /// `method` one of `GET`/`POST`/`PATCH` (default `GET` is the caller's
    /// responsibility to supply). `cancel` is the instance's cancellation
    /// signal; a request in flight when it fires must abort.
    async fn invoke(
        &self,
        method: &str,
        url: &str,
        query_params: &BTreeMap<String, String>,
        json_body: &Json,
        headers: &BTreeMap<String, String>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Json, EngineError>;
}

/// `reqwest`-backed implementation: 5s connect timeout, no read timeout,
/// default `content-type: application/json`, non-2xx/201 raises
/// `EngineError::Connector` carrying the response body, a non-JSON body
/// is tolerated and yields `{}`.
pub struct HttpConnectorRunner {
    client: reqwest::Client,
}

impl HttpConnectorRunner {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client })
    }
}

impl Default for HttpConnectorRunner {
    fn default() -> Self {
        Self::new().expect("failed to build reqwest client")
    }
}

#[async_trait]
impl ConnectorRunner for HttpConnectorRunner {
    async fn invoke(
        &self,
        method: &str,
        url: &str,
        query_params: &BTreeMap<String, String>,
        json_body: &Json,
        headers: &BTreeMap<String, String>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Json, EngineError> {
        let mut builder = match method.to_ascii_uppercase().as_str() {
            "POST" => self.client.post(url),
            "PATCH" => self.client.patch(url),
            _ => self.client.get(url),
        };

        builder = builder.query(query_params).json(json_body);
        if headers.is_empty() {
            builder = builder.header("content-type", "application/json");
        } else {
            for (k, v) in headers {
                builder = builder.header(k, v);
            }
        }

        let response = tokio::select! {
            res = builder.send() => res.map_err(|e| EngineError::Connector(e.to_string()))?,
            _ = cancel.changed() => {
                return Err(EngineError::Connector("instance cancelled".to_string()));
            }
        };

        let status = response.status();
        let body_text = response
            .text()
            .await
            .map_err(|e| EngineError::Connector(e.to_string()))?;

        if status.as_u16() != 200 && status.as_u16() != 201 {
            return Err(EngineError::Connector(format!(
                "status {status}: {body_text}"
            )));
        }

        Ok(serde_json::from_str(&body_text).unwrap_or_else(|_| Json::Object(Default::default())))
    }
}

/// Test double returning canned responses keyed by connector url, matching
/// the corpus's "pluggable backend behind a trait" testing idiom.
#[cfg(test)]
pub struct StubConnectorRunner {
    pub responses: std::collections::HashMap<String, Json>,
}

#[cfg(test)]
#[async_trait]
impl ConnectorRunner for StubConnectorRunner {
    async fn invoke(
        &self,
        _method: &str,
        url: &str,
        _query_params: &BTreeMap<String, String>,
        _json_body: &Json,
        _headers: &BTreeMap<String, String>,
        _cancel: &mut watch::Receiver<bool>,
    ) -> Result<Json, EngineError> {
        Ok(self
            .responses
            .get(url)
            .cloned()
            .unwrap_or_else(|| Json::Object(Default::default())))
    }
}
