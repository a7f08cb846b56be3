//! HTTP client for the pty-bridge's buffered endpoints.

use std::time::Duration;

use relay_proto::{Geometry, Message, ProtocolError};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("bridge returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitResponse {
    #[serde(default)]
    pub resized: bool,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub warning: Option<String>,
}

#[derive(Clone)]
pub struct BridgeClient {
    http: reqwest::Client,
    base_url: String,
}

impl BridgeClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BridgeError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn init(&self, geometry: Geometry, repo: Option<String>) -> Result<InitResponse, BridgeError> {
        let response = self.post("/init", &Message::init(geometry, repo)).await?;
        Ok(response.json().await?)
    }

    /// Submits a `data` or `resize` message.
    pub async fn write(&self, message: &Message) -> Result<(), BridgeError> {
        self.post("/write", message).await?;
        Ok(())
    }

    /// Drains buffered output. Malformed lines are skipped.
    pub async fn read(&self) -> Result<Vec<Message>, BridgeError> {
        let response = checked(self.http.get(self.url("/read")).send().await?).await?;
        let body = response.bytes().await?;
        let mut messages = Vec::new();
        for line in relay_proto::decode_lines(&body) {
            match line {
                Ok(message) => messages.push(message),
                Err(err) => warn!(error = %err, "skipping malformed bridge output line"),
            }
        }
        Ok(messages)
    }

    async fn post(&self, path: &str, message: &Message) -> Result<reqwest::Response, BridgeError> {
        let body = relay_proto::encode(message)?;
        let response = self
            .http
            .post(self.url(path))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        checked(response).await
    }
}

/// Turns a non-2xx response into [`BridgeError::Status`], keeping the
/// bridge's error message when it sent one.
async fn checked(response: reqwest::Response) -> Result<reqwest::Response, BridgeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await.unwrap_or_default();
    let message = match relay_proto::decode(&body) {
        Ok(Message::Error { message }) => message,
        _ => String::from_utf8_lossy(&body).trim().to_string(),
    };
    Err(BridgeError::Status {
        status: status.as_u16(),
        message,
    })
}
