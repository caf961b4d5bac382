use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Path the inference server answers on as soon as its socket is bound.
pub const PROBE_PATH: &str = "/models";

const LOADING_MESSAGE: &str = "Loading model";

/// One-shot checks against a child server's HTTP endpoint.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `true` once the server answers with anything but the "still loading" error.
    async fn is_ready(&self, port: u16) -> bool;

    /// `true` while something still accepts connections on `port`.
    async fn is_listening(&self, port: u16) -> bool;
}

pub struct HttpProbe {
    host: String,
    ready_client: reqwest::Client,
    shutdown_client: reqwest::Client,
}

impl HttpProbe {
    /// Fails only if the HTTP client itself cannot be set up, e.g. no TLS backend.
    pub fn new(host: impl Into<String>) -> reqwest::Result<Self> {
        Ok(Self {
            host: host.into(),
            ready_client: client_with_timeout(Duration::from_secs(5))?,
            shutdown_client: client_with_timeout(Duration::from_secs(2))?,
        })
    }

    pub fn url(&self, port: u16) -> String {
        format!("http://{}:{}{}", self.host, port, PROBE_PATH)
    }
}

fn client_with_timeout(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder().timeout(timeout).build()
}

/// Matches `{"error": {"message": "Loading model", ...}}`.
pub fn is_loading_payload(body: &[u8]) -> bool {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")?
                .get("message")?
                .as_str()
                .map(|m| m == LOADING_MESSAGE)
        })
        .unwrap_or(false)
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn is_ready(&self, port: u16) -> bool {
        let response = match self.ready_client.get(self.url(port)).send().await {
            Ok(r) => r,
            Err(_) => return false,
        };

        match response.bytes().await {
            Ok(body) => !is_loading_payload(&body),
            // it answered; a broken body still means the socket is up
            Err(_) => true,
        }
    }

    async fn is_listening(&self, port: u16) -> bool {
        self.shutdown_client.get(self.url(port)).send().await.is_ok()
    }
}
