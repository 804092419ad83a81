use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::models::errors::AuthError;

/// A single-use sign-in nonce.
#[derive(Debug, Clone, PartialEq)]
pub struct Nonce {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait NonceProvider: Send + Sync {
    async fn issue(&self) -> Result<Nonce, AuthError>;
}

/// Locally generated nonces from the OS CSPRNG (UUID v4, 122 random bits).
pub struct RandomNonceProvider {
    ttl: Duration,
}

impl RandomNonceProvider {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::minutes(5)),
        }
    }
}

#[async_trait]
impl NonceProvider for RandomNonceProvider {
    async fn issue(&self) -> Result<Nonce, AuthError> {
        Ok(Nonce {
            value: Uuid::new_v4().simple().to_string(),
            expires_at: Utc::now() + self.ttl,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NonceResponse {
    nonce: String,
    expires_at: Option<DateTime<Utc>>,
}

/// Server-issued nonces fetched from the reporting backend.
pub struct RemoteNonceProvider {
    client: reqwest::Client,
    url: Url,
    ttl: Duration,
}

impl RemoteNonceProvider {
    pub fn new(client: reqwest::Client, url: Url, ttl: std::time::Duration) -> Self {
        Self {
            client,
            url,
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::minutes(5)),
        }
    }
}

#[async_trait]
impl NonceProvider for RemoteNonceProvider {
    async fn issue(&self) -> Result<Nonce, AuthError> {
        let unavailable = |e: reqwest::Error| AuthError::NonceUnavailable {
            reason: e.to_string(),
        };

        let response: NonceResponse = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(unavailable)?
            .json()
            .await
            .map_err(unavailable)?;

        debug!("Received server nonce from {}", self.url);

        // The server's expiry wins; otherwise assume the local TTL
        let expires_at = response
            .expires_at
            .unwrap_or_else(|| Utc::now() + self.ttl);

        Ok(Nonce {
            value: response.nonce,
            expires_at,
        })
    }
}
