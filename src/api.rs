//! Daemon HTTP API client
//!
//! A thin handle bound to the API endpoint of a running daemon. The supervisor
//! only constructs it; the full command surface of the daemon is reachable
//! through [`HttpApiClient::command`].

use crate::controller::Endpoint;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// API client errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("daemon returned {status}: {message}")]
    Status { status: StatusCode, message: String },
}

/// Client constructed by the supervisor once the daemon is up
pub trait ApiClient: Send + Sync + Sized + 'static {
    /// Bind a client to the daemon's API endpoint
    fn connect(endpoint: &Endpoint) -> Result<Self, ApiError>;
}

/// `ipfs version` response
#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "Version")]
    pub version: String,

    #[serde(rename = "Commit", default)]
    pub commit: String,

    #[serde(rename = "Repo", default)]
    pub repo: String,
}

/// `ipfs id` response
#[derive(Debug, Clone, Deserialize)]
pub struct PeerIdentity {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "AgentVersion", default)]
    pub agent_version: String,

    #[serde(rename = "Addresses", default)]
    pub addresses: Option<Vec<String>>,
}

/// Client for the daemon's `/api/v0` HTTP interface
#[derive(Debug, Clone)]
pub struct HttpApiClient {
    http: reqwest::Client,
    endpoint: Endpoint,
    base_url: String,
}

impl HttpApiClient {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, command: &str) -> String {
        format!("{}/{}", self.base_url, command.trim_start_matches('/'))
    }

    /// Call an arbitrary API command and decode the JSON reply
    pub async fn command(&self, command: &str, args: &[(&str, &str)]) -> Result<Value, ApiError> {
        let res = send(self.http.post(self.url(command)).query(args)).await?;
        Ok(res.json::<Value>().await?)
    }

    pub async fn version(&self) -> Result<VersionInfo, ApiError> {
        let res = send(self.http.post(self.url("version"))).await?;
        Ok(res.json::<VersionInfo>().await?)
    }

    pub async fn id(&self) -> Result<PeerIdentity, ApiError> {
        let res = send(self.http.post(self.url("id"))).await?;
        Ok(res.json::<PeerIdentity>().await?)
    }

    /// Fetch the content behind an `/ipfs/...` path or CID
    pub async fn cat(&self, path: &str) -> Result<Vec<u8>, ApiError> {
        let res = send(self.http.post(self.url("cat")).query(&[("arg", path)])).await?;
        Ok(res.bytes().await?.to_vec())
    }
}

impl ApiClient for HttpApiClient {
    fn connect(endpoint: &Endpoint) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            endpoint: endpoint.clone(),
            base_url: format!("http://{}/api/v0", endpoint.authority()),
        })
    }
}

async fn send(builder: RequestBuilder) -> Result<Response, ApiError> {
    let res = builder.send().await?;
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }

    let body = res.text().await?;
    Err(ApiError::Status {
        status,
        message: error_message(&body),
    })
}

/// Message from the daemon's `{"Message": ..., "Code": ...}` error body
fn error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(rename = "Message")]
        message: String,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.message,
        Err(_) => body.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        let client = HttpApiClient::connect(&Endpoint::new("127.0.0.1", 5001)).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:5001/api/v0");
        assert_eq!(client.url("/id"), "http://127.0.0.1:5001/api/v0/id");
        assert_eq!(client.endpoint().to_string(), "127.0.0.1:5001");
    }

    #[test]
    fn test_ipv6_base_url() {
        let client = HttpApiClient::connect(&Endpoint::new("::1", 5001)).unwrap();
        assert_eq!(client.base_url(), "http://[::1]:5001/api/v0");
    }

    #[test]
    fn test_error_message() {
        assert_eq!(
            error_message(r#"{"Message":"invalid path \"x\"","Code":0,"Type":"error"}"#),
            "invalid path \"x\""
        );
        assert_eq!(error_message("404 page not found\n"), "404 page not found");
    }

    #[test]
    fn test_version_decoding() {
        let info: VersionInfo =
            serde_json::from_str(r#"{"Version":"0.4.23","Commit":"","Repo":"7","System":"amd64/linux"}"#)
                .unwrap();
        assert_eq!(info.version, "0.4.23");
        assert_eq!(info.repo, "7");
    }

    #[tokio::test]
    #[ignore] // Requires a running daemon on the default API port
    async fn test_live_version() {
        let client = HttpApiClient::connect(&Endpoint::new("127.0.0.1", 5001)).unwrap();
        let info = client.version().await.unwrap();
        assert!(!info.version.is_empty());
    }
}
