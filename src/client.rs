//! Work source and the node's JSON-RPC interface
//!
//! The orchestrator only sees the [`WorkSource`] trait. [`RpcWorkSource`]
//! implements it over the node's `getwork` / `submitwork` calls.

use crate::header::Header;
use crate::target::Target;
use crate::types::{Hash, Network, Work};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

/// Raw `getwork` result as sent by the node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResponse {
    pub network: String,
    /// Hex-encoded header
    pub data: String,
    /// Hex-encoded target
    pub target: String,
    pub height: Value,
    pub time: Value,
}

impl WorkResponse {
    /// Check the response against the configured network and decode it
    pub fn validate(&self, network: Network) -> Result<Work> {
        if self.network != network.as_str() {
            return Err(Error::wrong_network(network.as_str(), self.network.clone()));
        }

        let header = Header::from_hex(&self.data)?;
        let target = Target::from_hex(&self.target)?;

        let height = as_u32(&self.height)
            .ok_or_else(|| Error::bad_height(format!("{} is not a u32", self.height)))?;
        let time = as_u32(&self.time)
            .ok_or_else(|| Error::bad_time(format!("{} is not a u32", self.time)))?;

        Ok(Work {
            header,
            target,
            height,
            time,
        })
    }
}

fn as_u32(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|n| u32::try_from(n).ok())
}

/// Result of `submitwork`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResult {
    pub accepted: bool,
    pub reason: String,
}

/// Remote source of mining work
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Fetch work unless the node's current work has `identity`
    async fn get_work(&self, identity: &Hash) -> Result<Option<WorkResponse>>;

    /// Submit a finalized block
    async fn submit_work(&self, raw: &[u8]) -> Result<SubmitResult>;
}

/// Minimal JSON-RPC client with basic auth
pub struct RpcClient {
    client: Client,
    url: Url,
    user: String,
    pass: String,
    sequence: AtomicU64,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("url", &self.url.as_str())
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    pub fn new(
        url: impl AsRef<str>,
        user: impl Into<String>,
        pass: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let url = Url::parse(url.as_ref())
            .map_err(|e| Error::config(format!("Invalid RPC URL: {}", e)))?;

        let client = ClientBuilder::new().timeout(timeout).build()?;

        Ok(Self {
            client,
            url,
            user: user.into(),
            pass: pass.into(),
            sequence: AtomicU64::new(0),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Call `method` and return its `result`
    #[instrument(skip(self, params))]
    pub async fn execute(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let body = json!({
            "method": method,
            "params": params,
            "id": id,
        });

        let response = self
            .client
            .post(self.url.clone())
            .basic_auth(&self.user, Some(&self.pass))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        debug!(id, status = status.as_u16(), "RPC response");

        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthorized);
        }

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("application/json"))
            .unwrap_or(false);

        if !is_json {
            return Err(Error::protocol("Bad response (wrong content-type)."));
        }

        let bytes = response.bytes().await?;
        let json: Value = serde_json::from_slice(&bytes)?;

        if json.is_null() {
            return Err(Error::protocol("No body for JSON-RPC response."));
        }

        if let Some(error) = json.get("error").filter(|e| !e.is_null()) {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            return Err(Error::rpc(message, code));
        }

        if status != StatusCode::OK {
            return Err(Error::protocol(format!("Status code: {}.", status.as_u16())));
        }

        Ok(json.get("result").cloned().unwrap_or(Value::Null))
    }
}

/// Work source backed by the node's JSON-RPC interface
pub struct RpcWorkSource {
    rpc: RpcClient,
}

impl RpcWorkSource {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

/// Decode a `getwork` result
pub fn decode_work(result: Value) -> Result<Option<WorkResponse>> {
    if result.is_null() {
        return Ok(None);
    }

    if !result.is_object() {
        return Err(Error::protocol("Non-object sent as getwork response."));
    }

    serde_json::from_value(result)
        .map(Some)
        .map_err(|e| Error::protocol(format!("Malformed getwork response: {}", e)))
}

/// Decode a `submitwork` result
pub fn decode_submit(result: &Value) -> Result<SubmitResult> {
    let items = result
        .as_array()
        .ok_or_else(|| Error::protocol("Non-array sent as submitwork response."))?;

    let accepted = items
        .first()
        .and_then(Value::as_bool)
        .ok_or_else(|| Error::protocol("Non-boolean sent as submitwork response."))?;

    let reason = items
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::protocol("Non-string sent as submitwork response."))?;

    Ok(SubmitResult {
        accepted,
        reason: reason.to_string(),
    })
}

#[async_trait]
impl WorkSource for RpcWorkSource {
    async fn get_work(&self, identity: &Hash) -> Result<Option<WorkResponse>> {
        let result = self
            .rpc
            .execute("getwork", json!([hex::encode(identity)]))
            .await?;
        decode_work(result)
    }

    async fn submit_work(&self, raw: &[u8]) -> Result<SubmitResult> {
        let result = self
            .rpc
            .execute("submitwork", json!([hex::encode(raw)]))
            .await?;
        decode_submit(&result)
    }
}
