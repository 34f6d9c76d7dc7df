// ECS management API client
//
// Implements `MetricSource` over HTTP:
// - login:    GET /login with basic auth, token in the X-SDS-AUTH-TOKEN header
// - requests: X-SDS-AUTH-TOKEN header, JSON accepted
// - status 497 signals an expired token

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use tracing::{debug, error, info};

use super::{FetchOutcome, MetricSource, SourceRequest};
use crate::config::ConnectionSettings;

/// Header carrying the ECS session token
pub const AUTH_TOKEN_HEADER: &str = "X-SDS-AUTH-TOKEN";

/// Status the ECS management API returns when a token has expired
pub const AUTH_EXPIRED_STATUS: u16 = 497;

/// HTTP client bound to one ECS endpoint
pub struct EcsClient {
    client: Client,
    base_url: String,
    host: String,
    user: String,
    password: String,
}

impl EcsClient {
    /// Creates a client for the endpoint described by `settings`.
    ///
    /// Connect and read timeouts come from the connection settings. Certificate
    /// verification is skipped unless `verify_tls` is set, since management
    /// endpoints are usually deployed with self-signed certificates.
    pub fn new(settings: &ConnectionSettings) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout))
            .timeout(Duration::from_secs(settings.read_timeout))
            .danger_accept_invalid_certs(!settings.verify_tls)
            .build()?;

        Ok(EcsClient {
            client,
            base_url: settings.base_url(),
            host: settings.host.clone(),
            user: settings.user.clone(),
            password: settings.password.clone(),
        })
    }
}

#[async_trait]
impl MetricSource for EcsClient {
    async fn authenticate(&self) -> Option<String> {
        let url = format!("{}/login", self.base_url);
        info!("Authenticating against {}", url);

        let response = match self
            .client
            .get(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!("Login request to {} failed: {}", self.host, e);
                return None;
            }
        };

        let status = response.status();
        if status != StatusCode::OK {
            error!("Login to {} failed with status {}", self.host, status);
            return None;
        }

        match response
            .headers()
            .get(AUTH_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            Some(token) if !token.is_empty() => {
                info!("Login to {} succeeded", self.host);
                Some(token.to_string())
            }
            _ => {
                error!("Login to {} returned no {} header", self.host, AUTH_TOKEN_HEADER);
                None
            }
        }
    }

    async fn fetch(&self, request: &SourceRequest, token: &str) -> FetchOutcome {
        let url = format!("{}{}", self.base_url, request.path);

        let response = match self
            .client
            .get(&url)
            .query(&request.query)
            .header(AUTH_TOKEN_HEADER, token)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return FetchOutcome::Failed(format!("request failed: {}", e)),
        };

        let status = response.status();
        if status.as_u16() == AUTH_EXPIRED_STATUS {
            return FetchOutcome::AuthExpired;
        }
        if !status.is_success() {
            return FetchOutcome::Failed(format!("status {}", status));
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return FetchOutcome::Failed(format!("reading body failed: {}", e)),
        };
        debug!("{} returned {} bytes", request.path, body.len());

        match serde_json::from_str(&body) {
            Ok(value) => FetchOutcome::Data(value),
            Err(e) => FetchOutcome::Malformed(format!("invalid JSON: {}", e)),
        }
    }
}
