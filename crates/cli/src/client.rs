//! Daemon HTTP Client

use anyhow::{anyhow, Result};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use wgpeer_common::{
    ConsistencyReport, HealthStatus, PeerRecord, RepairReport, RuntimeStat, ServerConfig, ServerInfo,
};

#[derive(Debug, Serialize)]
struct CreatePeerRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    days_valid: Option<u32>,
}

#[derive(Debug, Serialize)]
struct DeletePeerRequest<'a> {
    public_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct DeletePeerResponse {
    deleted: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Client for communicating with the wgpeer daemon
pub struct DaemonClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl DaemonClient {
    /// Create a new daemon client
    pub fn new(addr: &str, token: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("wgpeer-cli/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: addr.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        debug!("GET {}", path);
        let response = self.authorize(self.http.get(self.url(path))).send().await?;
        decode(response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        debug!("POST {}", path);
        let response = self
            .authorize(self.http.post(self.url(path)))
            .json(body)
            .send()
            .await?;
        decode(response).await
    }

    /// Daemon health; `None` when the daemon cannot be reached
    pub async fn health(&self) -> Option<HealthStatus> {
        let response = self.http.get(self.url("/api/health")).send().await.ok()?;
        // 503 still carries a health body
        if response.status().is_success() || response.status() == StatusCode::SERVICE_UNAVAILABLE {
            response.json().await.ok()
        } else {
            None
        }
    }

    // Peer operations

    pub async fn create_peer(&self, days_valid: Option<u32>) -> Result<PeerRecord> {
        self.post("/api/peers/new", &CreatePeerRequest { days_valid }).await
    }

    pub async fn delete_peer(&self, public_key: &str) -> Result<bool> {
        let response: DeletePeerResponse = self
            .post("/api/peers/delete", &DeletePeerRequest { public_key })
            .await?;
        Ok(response.deleted)
    }

    pub async fn list_peers(&self) -> Result<Vec<PeerRecord>> {
        self.get("/api/peers/list").await
    }

    pub async fn peer_stats(&self) -> Result<Vec<RuntimeStat>> {
        self.get("/api/peers/stats").await
    }

    // Maintenance

    pub async fn check(&self) -> Result<ConsistencyReport> {
        self.get("/api/peers/check").await
    }

    pub async fn repair(&self) -> Result<RepairReport> {
        self.post("/api/repair", &serde_json::json!({})).await
    }

    // Server

    pub async fn server_config(&self) -> Result<ServerConfig> {
        self.get("/api/config").await
    }

    pub async fn server_info(&self) -> Result<ServerInfo> {
        self.get("/api/serverinfo").await
    }
}

/// Decode a success body, or turn the daemon's `{"error": ...}` into an error
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let text = response.text().await.unwrap_or_default();
    Err(anyhow!("{}", error_message(status, &text)))
}

fn error_message(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(err) => format!("daemon returned {}: {}", status, err.error),
        Err(_) if body.trim().is_empty() => format!("daemon returned {}", status),
        Err(_) => format!("daemon returned {}: {}", status, body.trim()),
    }
}
