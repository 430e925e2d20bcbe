//! Backend REST API Client
//!
//! HTTP client for the tag and macro endpoints. Pre-authenticated: the
//! Bearer token from configuration is attached to every request.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ApiConfig;

/// REST API client
pub struct RestClient {
    client: Client,
    config: ApiConfig,
}

/// A server-side query macro
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Macro {
    /// Backend-assigned identifier
    pub id: u64,
    /// Macro name as referenced in queries (`$NAME`)
    pub name: String,
    /// Text the macro expands to
    pub expansion: String,
}

impl RestClient {
    /// Create a new client with the given configuration
    pub fn new(config: ApiConfig) -> Result<Self, RestError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(RestError::Request)?;

        Ok(Self { client, config })
    }

    /// The current configuration
    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// List all tags with ingested entries
    pub async fn get_all_tags(&self) -> Result<Vec<String>, RestError> {
        let url = self.endpoint("/api/tags");

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(map_request_error)?;

        if response.status().is_success() {
            response.json().await.map_err(RestError::Request)
        } else {
            Err(api_error(response).await)
        }
    }

    /// Create a macro; queries reference it as `$NAME`
    pub async fn create_macro(
        &self,
        name: impl Into<String>,
        expansion: impl Into<String>,
    ) -> Result<Macro, RestError> {
        let url = self.endpoint("/api/macros");
        let body = CreateMacroRequest {
            name: name.into(),
            expansion: expansion.into(),
        };

        let response = self
            .authorize(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(map_request_error)?;

        if response.status().is_success() {
            response.json().await.map_err(RestError::Request)
        } else {
            Err(api_error(response).await)
        }
    }

    /// Delete a macro by ID
    pub async fn delete_macro(&self, id: u64) -> Result<(), RestError> {
        let url = self.endpoint(&format!("/api/macros/{}", id));

        let response = self
            .authorize(self.client.delete(&url))
            .send()
            .await
            .map_err(map_request_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(api_error(response).await)
        }
    }
}

fn map_request_error(e: reqwest::Error) -> RestError {
    if e.is_timeout() {
        RestError::Timeout
    } else if e.is_connect() {
        RestError::Unavailable
    } else {
        RestError::Request(e)
    }
}

async fn api_error(response: reqwest::Response) -> RestError {
    let status = response.status();
    let message = response.text().await.unwrap_or_default();
    RestError::Api {
        status: status.as_u16(),
        message,
    }
}

// ============================================
// Request DTOs
// ============================================

#[derive(Debug, Serialize)]
struct CreateMacroRequest {
    name: String,
    expansion: String,
}

// ============================================
// Errors
// ============================================

/// Errors from REST collaborator calls
#[derive(Error, Debug)]
pub enum RestError {
    #[error("Backend unavailable")]
    Unavailable,

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Request timeout")]
    Timeout,
}
