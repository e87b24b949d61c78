use serde::Deserialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

use async_trait::async_trait;

use crate::config::DownloaderSettings;
use crate::error::{PipelineError, Result};

use super::{AddUriOptions, DownloadFile, DownloadSnapshot, DownloadState, DownloaderClient};

/// JSON-RPC client for an aria2-compatible downloader daemon.
///
/// Every call carries the secret as a `token:<secret>` prefix parameter,
/// which is how the daemon authenticates RPC consumers.
#[derive(Debug, Clone)]
pub struct JsonRpcDownloader {
    http: reqwest::Client,
    rpc_url: String,
    secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Wire shape of a status object. The daemon serializes all numbers as
/// decimal strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcStatus {
    gid: String,
    status: String,
    #[serde(default)]
    total_length: Option<String>,
    #[serde(default)]
    completed_length: Option<String>,
    #[serde(default)]
    download_speed: Option<String>,
    #[serde(default)]
    dir: Option<String>,
    #[serde(default)]
    files: Vec<RpcFile>,
    #[serde(default)]
    info_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcFile {
    path: String,
    #[serde(default)]
    length: Option<String>,
}

impl JsonRpcDownloader {
    pub fn new(settings: &DownloaderSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.rpc_timeout)
            .build()
            .map_err(|e| PipelineError::Downloader(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            rpc_url: settings.rpc_url.clone(),
            secret: settings.rpc_secret.clone(),
        })
    }

    /// Issue one JSON-RPC call, prepending the secret token parameter.
    async fn call(&self, method: &str, mut params: Vec<Value>) -> Result<Value> {
        if let Some(secret) = &self.secret {
            params.insert(0, Value::String(format!("token:{secret}")));
        }

        let body = json!({
            "jsonrpc": "2.0",
            "id": Uuid::new_v4().to_string(),
            "method": method,
            "params": params,
        });

        debug!("downloader RPC {}", method);

        let response = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Downloader(format!("{method} request failed: {e}")))?;

        let rpc: RpcResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Downloader(format!("{method} returned bad JSON: {e}")))?;

        if let Some(err) = rpc.error {
            return Err(PipelineError::Downloader(format!(
                "{method} failed with code {}: {}",
                err.code, err.message
            )));
        }

        rpc.result
            .ok_or_else(|| PipelineError::Downloader(format!("{method} returned no result")))
    }
}

fn parse_len(v: &Option<String>) -> u64 {
    v.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0)
}

fn snapshot_from_status(status: RpcStatus) -> DownloadSnapshot {
    DownloadSnapshot {
        handle: status.gid,
        state: DownloadState::parse(&status.status),
        total_length: parse_len(&status.total_length),
        completed_length: parse_len(&status.completed_length),
        download_speed: parse_len(&status.download_speed),
        dir: status.dir.map(PathBuf::from),
        files: status
            .files
            .into_iter()
            .map(|f| DownloadFile {
                path: PathBuf::from(f.path),
                length: parse_len(&f.length),
            })
            .collect(),
        info_hash: status.info_hash,
    }
}

fn decode_status(value: Value) -> Result<DownloadSnapshot> {
    let status: RpcStatus = serde_json::from_value(value)
        .map_err(|e| PipelineError::Downloader(format!("malformed status object: {e}")))?;
    Ok(snapshot_from_status(status))
}

fn decode_status_list(value: Value) -> Result<Vec<DownloadSnapshot>> {
    let statuses: Vec<RpcStatus> = serde_json::from_value(value)
        .map_err(|e| PipelineError::Downloader(format!("malformed status list: {e}")))?;
    Ok(statuses.into_iter().map(snapshot_from_status).collect())
}

#[async_trait]
impl DownloaderClient for JsonRpcDownloader {
    async fn add_uri(&self, uris: Vec<String>, options: AddUriOptions) -> Result<String> {
        let mut opts = serde_json::Map::new();
        if let Some(dir) = options.dir {
            opts.insert("dir".to_string(), json!(dir.to_string_lossy()));
        }

        let result = self
            .call("aria2.addUri", vec![json!(uris), Value::Object(opts)])
            .await?;

        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PipelineError::Downloader("addUri returned a non-string handle".into()))
    }

    async fn tell_status(&self, handle: &str) -> Result<DownloadSnapshot> {
        let result = self.call("aria2.tellStatus", vec![json!(handle)]).await?;
        decode_status(result)
    }

    async fn tell_active(&self) -> Result<Vec<DownloadSnapshot>> {
        let result = self.call("aria2.tellActive", vec![]).await?;
        decode_status_list(result)
    }

    async fn tell_stopped(&self, offset: i64, count: u32) -> Result<Vec<DownloadSnapshot>> {
        let result = self
            .call("aria2.tellStopped", vec![json!(offset), json!(count)])
            .await?;
        decode_status_list(result)
    }

    async fn remove(&self, handle: &str) -> Result<()> {
        self.call("aria2.remove", vec![json!(handle)]).await?;
        Ok(())
    }
}
