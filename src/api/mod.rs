use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;

pub mod types;

pub use types::{
    ApiResponse, EventView, HealthResponse, LoadData, LoadedModel, ModelSummary, ReloadData,
    StatusData, UnloadData,
};

/// Thin client for the control API.
pub struct Client {
    base_url: String,
    client: reqwest::Client,
}

impl Client {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(crate::envconfig::client_host()))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn models(&self) -> Result<Vec<ModelSummary>> {
        let response = self.get("/api/models").await?;
        required(response, "models")
    }

    pub async fn status(&self) -> Result<StatusData> {
        let response = self.get("/api/status").await?;
        required(response, "status")
    }

    /// Returns the server's message together with the load data.
    pub async fn load(&self, index: i64) -> Result<(String, LoadData)> {
        let response: ApiResponse<LoadData> =
            self.post(&format!("/api/load?index={}", index)).await?;
        let message = response.message.clone().unwrap_or_default();
        Ok((message, required(response, "load")?))
    }

    pub async fn unload(&self, instance: Option<u64>) -> Result<(String, UnloadData)> {
        let path = match instance {
            Some(id) => format!("/api/unload?instance={}", id),
            None => "/api/unload".to_string(),
        };
        let response: ApiResponse<UnloadData> = self.post(&path).await?;
        let message = response.message.clone().unwrap_or_default();
        let data = response.data.unwrap_or(UnloadData { stopped: Vec::new() });
        Ok((message, data))
    }

    pub async fn reload_models(&self) -> Result<usize> {
        let response: ApiResponse<ReloadData> = self.post("/api/models/reload").await?;
        Ok(required(response, "reload")?.count)
    }

    pub async fn events(&self) -> Result<Vec<EventView>> {
        let response = self.get("/api/events").await?;
        required(response, "events")
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let url = format!("{}/api/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", self.base_url))?;

        if !response.status().is_success() {
            bail!("Health check failed: {}", response.status());
        }
        Ok(response.json().await?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<ApiResponse<T>> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", self.base_url))?;
        decode(response).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<ApiResponse<T>> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", self.base_url))?;
        decode(response).await
    }
}

/// Error responses still carry the envelope, so the message is surfaced
/// instead of the bare status code.
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<ApiResponse<T>> {
    let status = response.status();
    let body = response.text().await?;

    match serde_json::from_str::<ApiResponse<T>>(&body) {
        Ok(envelope) if envelope.success => Ok(envelope),
        Ok(envelope) => bail!(
            "{}",
            envelope
                .message
                .unwrap_or_else(|| format!("Request failed: {}", status))
        ),
        Err(e) if status.is_success() => Err(e).context("Malformed response from server"),
        Err(_) => bail!("Request failed: {}", status),
    }
}

fn required<T>(response: ApiResponse<T>, what: &str) -> Result<T> {
    response
        .data
        .with_context(|| format!("Server sent no data for {}", what))
}
