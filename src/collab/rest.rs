//! REST transport seam
//!
//! Workers proxy Discord API calls through the orchestrator so a single
//! client owns the token and connection pool.

use crate::error::BoxError;
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use std::time::Duration;

/// Default Discord API base
pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Outbound API transport shared by all workers
#[async_trait]
pub trait RestTransport: Send + Sync {
    /// Perform `method url` with worker-supplied `options`
    ///
    /// Recognised options: `body` (JSON), `query` (object of string pairs),
    /// `reason` (audit log reason).
    async fn request(&self, method: &str, url: &str, options: Value) -> Result<Value, BoxError>;
}

/// reqwest-backed Discord API client
pub struct HttpRest {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpRest {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, BoxError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("DiscordBot (arrakis-cluster, ", env!("CARGO_PKG_VERSION"), ")"))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn absolute(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl RestTransport for HttpRest {
    async fn request(&self, method: &str, url: &str, options: Value) -> Result<Value, BoxError> {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())?;
        let mut req = self
            .client
            .request(method, self.absolute(url))
            .header("Authorization", format!("Bot {}", self.token));

        if let Some(query) = options.get("query").and_then(Value::as_object) {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(k, v)| {
                    let v = v.as_str().map_or_else(|| v.to_string(), str::to_string);
                    (k.clone(), v)
                })
                .collect();
            req = req.query(&pairs);
        }
        if let Some(reason) = options.get("reason").and_then(Value::as_str) {
            req = req.header("X-Audit-Log-Reason", reason);
        }
        if let Some(body) = options.get("body") {
            req = req.json(body);
        }

        let response = req.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(format!("API error ({status}): {text}").into());
        }
        if text.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}
