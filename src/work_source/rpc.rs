//! JSON-RPC work source
//!
//! Speaks the `getwork` / `submitwork` protocol over HTTP POST with optional
//! basic authentication. `getwork` answers `{"hash": <hex>, "target": <hex>}`;
//! `submitwork` takes `[<hash hex>, <nonce>]`.

use super::WorkSource;
use crate::{Error, Hash, Nonce, Problem, Result, Target};
use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Connection settings for [`RpcWorkSource`]
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub url: Url,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    /// Accept invalid TLS certificates
    pub insecure: bool,
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// `getwork` result
#[derive(Debug, Clone, Deserialize)]
pub struct GetWorkResult {
    pub hash: String,
    pub target: String,
}

impl GetWorkResult {
    /// Decode into a problem
    ///
    /// The header hash follows the right-aligned rule. Targets wider than 64
    /// bits saturate to the easiest target and log a warning.
    pub fn into_problem(self) -> Result<Problem> {
        let hash = self.hash.trim();
        if hash.is_empty() {
            return Err(Error::malformed_work("empty header hash"));
        }
        let header_hash = Hash::from_slice(&decode_hex_field("hash", hash)?);

        let target_bytes = decode_hex_field("target", self.target.trim())?;
        let (target, saturated) = Target::from_be_bytes_saturating(&target_bytes);
        if saturated {
            warn!("Target {} does not fit in 64 bits, using {}", self.target, target);
        }

        Ok(Problem::new(header_hash, target).with_wire_hash(hash))
    }
}

fn decode_hex_field(field: &str, value: &str) -> Result<Vec<u8>> {
    let value = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    if value.is_empty() {
        return Err(Error::malformed_work(format!("empty {}", field)));
    }
    let padded;
    let value = if value.len() % 2 == 1 {
        padded = format!("0{}", value);
        padded.as_str()
    } else {
        value
    };
    hex::decode(value).map_err(|e| Error::malformed_work(format!("invalid hex in {}: {}", field, e)))
}

/// Work source backed by a JSON-RPC node
pub struct RpcWorkSource {
    client: Client,
    config: RpcConfig,
    next_id: AtomicU64,
}

impl RpcWorkSource {
    /// Create a new RPC work source
    pub fn new(config: RpcConfig) -> Result<Self> {
        let client = ClientBuilder::new()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(Error::from)?;

        info!("Using RPC work source at {}", config.url);
        Ok(Self {
            client,
            config,
            next_id: AtomicU64::new(1),
        })
    }

    /// Issue one JSON-RPC call
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let request = RpcRequest {
            jsonrpc: "1.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let mut builder = self.client.post(self.config.url.clone()).json(&request);
        if let Some(user) = &self.config.user {
            builder = builder.basic_auth(user, self.config.password.as_ref());
        }

        let response = builder.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::config(format!(
                "RPC authentication failed for {} (HTTP {})",
                self.config.url, status
            )));
        }

        // Nodes report RPC errors with a 500 status and a JSON body, so the
        // body is parsed before the status is judged.
        let body = response.bytes().await?;
        let parsed: RpcResponse<T> = match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(e) if status.is_success() => {
                return Err(Error::malformed_work(format!(
                    "invalid {} response: {}",
                    method, e
                )))
            }
            Err(_) => {
                return Err(Error::work_source(format!(
                    "{} failed with HTTP {}",
                    method, status
                )))
            }
        };

        if let Some(error) = parsed.error {
            return Err(Error::rpc(error.code, error.message));
        }
        parsed
            .result
            .ok_or_else(|| Error::malformed_work(format!("{} response has no result", method)))
    }
}

#[async_trait]
impl WorkSource for RpcWorkSource {
    fn name(&self) -> &str {
        "rpc"
    }

    #[instrument(skip(self))]
    async fn fetch_problem(&self) -> Result<Problem> {
        let work: GetWorkResult = self.call("getwork", json!([])).await?;
        let problem = work.into_problem()?;
        debug!(hash = %problem.header_hash, target = %problem.target, "Fetched work");
        Ok(problem)
    }

    #[instrument(skip(self, problem))]
    async fn submit_solution(&self, problem: &Problem, nonce: Nonce) -> Result<()> {
        let hash = problem.submission_hash();
        let accepted: Value = self
            .call("submitwork", json!([hash, nonce.value()]))
            .await?;

        if accepted == Value::Bool(false) {
            return Err(Error::submission(format!(
                "node refused nonce {} for {}",
                nonce, hash
            )));
        }
        Ok(())
    }
}
