//! Typed access to the daemon's admin configuration tree
//!
//! The endpoint (address and origin) is an explicit value owned by each
//! client; nothing about the daemon location is global.

use crate::error::AdminError;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Where the daemon's admin API lives and which Origin to present
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminEndpoint {
    pub address: String,
    pub origin: String,
}

impl AdminEndpoint {
    /// Build an endpoint; the origin defaults to `http://<address>`
    pub fn new(address: impl Into<String>, origin: Option<String>) -> Self {
        let address = address.into();
        let address = address
            .strip_prefix("http://")
            .unwrap_or(&address)
            .trim_end_matches('/')
            .to_string();
        let origin = origin.unwrap_or_else(|| format!("http://{}", address));
        Self { address, origin }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.address, path)
    }
}

/// HTTP client for the admin API
#[derive(Clone)]
pub struct AdminClient {
    endpoint: AdminEndpoint,
    http_client: reqwest::Client,
}

impl AdminClient {
    pub fn new(endpoint: AdminEndpoint, timeout: Duration) -> Result<Self, AdminError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdminError::Connectivity {
                address: endpoint.address.clone(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            endpoint,
            http_client,
        })
    }

    pub fn endpoint(&self) -> &AdminEndpoint {
        &self.endpoint
    }

    /// Read a subtree; `None` when the path holds nothing
    pub async fn get(&self, path: &str) -> Result<Option<Value>, AdminError> {
        match self.request(Method::GET, path, None).await {
            Ok(value) => Ok(value.filter(|v| !v.is_null())),
            Err(e) if e.status() == Some(404) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Replace or create the value at `path`
    pub async fn put<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<(), AdminError> {
        let body = encode(path, body)?;
        self.request(Method::PUT, path, Some(body)).await.map(|_| ())
    }

    /// Append to the collection at `path`
    pub async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<(), AdminError> {
        let body = encode(path, body)?;
        self.request(Method::POST, path, Some(body)).await.map(|_| ())
    }

    /// Replace the complete running configuration
    pub async fn load<T: Serialize + ?Sized>(&self, config: &T) -> Result<(), AdminError> {
        self.post("/load", config).await
    }

    /// Delete the object tagged with `@id`; `Ok(false)` if there was none
    pub async fn delete_id(&self, id: &str) -> Result<bool, AdminError> {
        let path = format!("/id/{}", id);
        match self.request(Method::DELETE, &path, None).await {
            Ok(_) => Ok(true),
            Err(e) if is_unknown_id(&e) => {
                debug!(id, "Nothing to delete");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Cheap read used to tell whether the daemon is up
    pub async fn probe(&self) -> Result<(), AdminError> {
        self.request(Method::GET, "/config/", None).await.map(|_| ())
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Option<Value>, AdminError> {
        debug!(%method, path, "Admin API request");

        let mut request = self
            .http_client
            .request(method.clone(), self.endpoint.url(path))
            .header("Origin", &self.endpoint.origin);

        if let Some(body) = body {
            request = request
                .header("Content-Type", "application/json")
                .body(body);
        }

        let response = request.send().await.map_err(|e| self.send_error(e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| AdminError::Connectivity {
            address: self.endpoint.address.clone(),
            reason: format!("failed to read response: {}", e),
        })?;

        if status == StatusCode::FORBIDDEN {
            return Err(AdminError::OriginRejected {
                origin: self.endpoint.origin.clone(),
                body: text.trim().to_string(),
            });
        }

        if !status.is_success() {
            return Err(AdminError::Api {
                method: method.to_string(),
                path: path.to_string(),
                status: status.as_u16(),
                body: text.trim().to_string(),
            });
        }

        if text.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| AdminError::Encode {
                path: path.to_string(),
                reason: e.to_string(),
            })
    }
}

impl AdminClient {
    /// Only transport failures mean the daemon may simply not be running
    fn send_error(&self, e: reqwest::Error) -> AdminError {
        let address = self.endpoint.address.clone();
        if e.is_connect() || e.is_timeout() || e.is_request() {
            AdminError::Connectivity {
                address,
                reason: e.to_string(),
            }
        } else {
            AdminError::Request {
                address,
                reason: e.to_string(),
            }
        }
    }
}

fn encode<T: Serialize + ?Sized>(path: &str, body: &T) -> Result<Vec<u8>, AdminError> {
    serde_json::to_vec(body).map_err(|e| AdminError::Encode {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

fn is_unknown_id(err: &AdminError) -> bool {
    match err.status() {
        Some(404) => true,
        Some(_) => err.body().to_ascii_lowercase().contains("unknown object id"),
        None => false,
    }
}
