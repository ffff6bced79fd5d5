//! Peer transport: the wire types and the HTTP client used between nodes.

use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::{PeerConfig, SyncTable};
use crate::error::{Error, Result};
use crate::models::ChangeEnvelope;

/// Identity a node reports to its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub ordinal: u32,
    pub node_count: u32,
    pub tables: Vec<SyncTable>,
}

/// Ask a peer for its changes after `since`.
///
/// `since` also acknowledges every change of `table` up to it: the requester
/// has already processed them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub table: SyncTable,
    pub since: i64,
    pub requester: u32,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Ordinal of the answering node
    pub origin: u32,
    pub entries: Vec<ChangeEnvelope>,
    pub has_more: bool,
}

/// Ship local changes to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub origin: u32,
    pub table: SyncTable,
    /// The sender's pull cursor for the receiver, doubling as an acknowledgement
    #[serde(default)]
    pub pull_cursor: i64,
    pub entries: Vec<ChangeEnvelope>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    /// Change ids the receiver has durably processed
    pub acked: Vec<i64>,
    #[serde(default)]
    pub applied: usize,
    #[serde(default)]
    pub duplicates: usize,
    #[serde(default)]
    pub conflicts: usize,
    #[serde(default)]
    pub rejected: usize,
}

/// How the sync engine reaches its peers.
pub trait PeerTransport: Send + Sync {
    fn node_info(&self, peer: &PeerConfig) -> impl Future<Output = Result<NodeInfo>> + Send;

    fn pull(
        &self,
        peer: &PeerConfig,
        request: &PullRequest,
    ) -> impl Future<Output = Result<PullResponse>> + Send;

    fn push(
        &self,
        peer: &PeerConfig,
        request: &PushRequest,
    ) -> impl Future<Output = Result<PushResponse>> + Send;
}

/// JSON over HTTP against a peer's `/v1` API.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|error| Error::Transport(format!("failed to build HTTP client: {error}")))?;
        Ok(Self { client })
    }

    async fn decode<T: DeserializeOwned>(peer: &PeerConfig, response: reqwest::Response) -> Result<T> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!(
                "peer {} answered {}",
                peer.ordinal,
                parse_api_error(status, &body)
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|error| request_error(peer, &error))
    }
}

impl PeerTransport for HttpTransport {
    async fn node_info(&self, peer: &PeerConfig) -> Result<NodeInfo> {
        let response = self
            .client
            .get(format!("{}/v1/node", peer.url))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|error| request_error(peer, &error))?;
        Self::decode(peer, response).await
    }

    async fn pull(&self, peer: &PeerConfig, request: &PullRequest) -> Result<PullResponse> {
        let response = self
            .client
            .get(format!("{}/v1/sync/changes", peer.url))
            .query(request)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|error| request_error(peer, &error))?;
        Self::decode(peer, response).await
    }

    async fn push(&self, peer: &PeerConfig, request: &PushRequest) -> Result<PushResponse> {
        let response = self
            .client
            .post(format!("{}/v1/sync/changes", peer.url))
            .json(request)
            .send()
            .await
            .map_err(|error| request_error(peer, &error))?;
        Self::decode(peer, response).await
    }
}

fn request_error(peer: &PeerConfig, error: &reqwest::Error) -> Error {
    let detail = if error.is_timeout() {
        "timed out"
    } else if error.is_connect() {
        "unreachable"
    } else if error.is_decode() {
        "sent an unreadable response"
    } else {
        "request failed"
    };
    Error::Transport(format!("peer {} ({}) {detail}: {error}", peer.ordinal, peer.url))
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// Readable message for a failed API call: the JSON `error`/`message` field
/// when there is one, else the compacted body.
pub fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.error.or(payload.message) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = crate::util::compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_api_error_prefers_json_message() {
        let message = parse_api_error(
            StatusCode::BAD_REQUEST,
            r#"{"error":"table logs is not synchronized"}"#,
        );
        assert_eq!(message, "table logs is not synchronized (400)");
    }

    #[test]
    fn parse_api_error_falls_back_to_status() {
        assert_eq!(parse_api_error(StatusCode::BAD_GATEWAY, "  "), "HTTP 502");
        assert_eq!(
            parse_api_error(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            "boom (500)"
        );
    }

    #[test]
    fn push_request_defaults_missing_cursor() {
        let request: PushRequest =
            serde_json::from_str(r#"{"origin":2,"table":"users","entries":[]}"#).unwrap();
        assert_eq!(request.pull_cursor, 0);
    }

    #[tokio::test]
    async fn unreachable_peer_is_a_transport_error() {
        let transport = HttpTransport::new(Duration::from_millis(200)).unwrap();
        let peer = PeerConfig {
            ordinal: 2,
            url: "http://127.0.0.1:9".to_string(),
        };
        let err = transport.node_info(&peer).await.unwrap_err();
        assert!(err.is_transient());
    }
}
