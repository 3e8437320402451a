//! Kubernetes API server client
//!
//! A thin authenticated HTTP client shared by the event source and the job
//! launcher. It talks plain REST + JSON to the API server, either directly
//! (bearer token) or through `kubectl proxy`.
//!
//! ## Endpoint discovery
//!
//! [`ClusterConfig::from_env`] resolves the API server in this order:
//!
//! 1. `KUEUER_API_SERVER` (and optional `KUEUER_TOKEN`)
//! 2. In-cluster service account (`KUBERNETES_SERVICE_HOST`/`KUBERNETES_SERVICE_PORT`)
//! 3. `kubectl proxy` on `http://127.0.0.1:8001`

use crate::error::{KueuerError, Result};
use kueuer_core::SourceError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Default API endpoint (`kubectl proxy`)
pub const DEFAULT_PROXY_URL: &str = "http://127.0.0.1:8001";

/// Service account token mounted into every pod
const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Timeout for non-streaming requests
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// API server connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// API server base URL
    pub server: String,

    /// Bearer token (None when going through `kubectl proxy`)
    #[serde(skip_serializing)]
    pub token: Option<String>,

    /// Skip TLS certificate verification
    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Timeout for list/create/delete requests (watches are not bounded by it)
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PROXY_URL)
    }
}

impl ClusterConfig {
    /// Config for `server` with no token and default timeouts
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            token: None,
            accept_invalid_certs: false,
            request_timeout: default_request_timeout(),
        }
    }

    /// Resolve the API server from the environment
    pub fn from_env() -> Result<Self> {
        if let Ok(server) = std::env::var("KUEUER_API_SERVER") {
            let mut config = Self::new(server);
            config.token = std::env::var("KUEUER_TOKEN").ok();
            return Ok(config);
        }

        if let (Ok(host), Ok(port)) = (
            std::env::var("KUBERNETES_SERVICE_HOST"),
            std::env::var("KUBERNETES_SERVICE_PORT"),
        ) {
            let token = read_token(Path::new(SERVICE_ACCOUNT_TOKEN))?;
            debug!(host = %host, port = %port, "Using in-cluster service account");
            return Ok(Self::new(format!("https://{}:{}", host, port)).with_token(token));
        }

        Ok(Self::default())
    }

    /// Authenticate with a bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Skip TLS certificate verification
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.accept_invalid_certs = insecure;
        self
    }

    /// Timeout for non-streaming requests
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

fn read_token(path: &Path) -> Result<String> {
    let token = std::fs::read_to_string(path)
        .map_err(|e| KueuerError::config(format!("cannot read {}: {}", path.display(), e)))?;
    let token = token.trim();
    if token.is_empty() {
        return Err(KueuerError::config(format!("{} is empty", path.display())));
    }
    Ok(token.to_string())
}

/// `metav1.Status` body returned on API errors
#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: String,
}

/// Kubernetes API client
#[derive(Debug, Clone)]
pub struct KubeClient {
    config: ClusterConfig,
    client: reqwest::Client,
}

impl KubeClient {
    /// Create a new API client
    pub fn new(config: ClusterConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;
        Ok(Self { config, client })
    }

    /// Connection settings in use
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.server.trim_end_matches('/'), path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match self.config.token {
            Some(ref token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// GET a JSON document
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        debug!(path, "GET");
        let response = self
            .request(reqwest::Method::GET, path)
            .query(query)
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    /// POST a JSON document, returning the created object
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<serde_json::Value> {
        debug!(path, "POST");
        let response = self
            .request(reqwest::Method::POST, path)
            .json(body)
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    /// DELETE an object with the given delete options
    pub async fn delete<B: Serialize + ?Sized>(&self, path: &str, options: &B) -> Result<()> {
        debug!(path, "DELETE");
        let response = self
            .request(reqwest::Method::DELETE, path)
            .json(options)
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// GET without a request timeout, for long-lived watch responses
    pub async fn get_stream(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response> {
        debug!(path, "GET (stream)");
        let response = self
            .request(reqwest::Method::GET, path)
            .query(query)
            .send()
            .await?;
        Self::check(response).await
    }

    /// Map non-success statuses to `SourceError::Api`
    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiStatus>(&body)
            .map(|s| s.message)
            .unwrap_or(body);

        Err(SourceError::Api {
            status: status.as_u16(),
            message,
        }
        .into())
    }
}
