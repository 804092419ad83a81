use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::auth::AuthProof;
use crate::models::event::EventRecord;
use crate::utils::retry::{retry, RetryConfig};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReportBody<'a> {
    domain: &'a str,
    siwe_message: String,
    siwe_signature: &'a str,
    event: &'a EventRecord,
}

/// Posts published events to the optional reporting endpoint.
#[derive(Clone)]
pub struct ReportClient {
    client: reqwest::Client,
    url: Url,
    retry: RetryConfig,
}

impl ReportClient {
    pub fn new(client: reqwest::Client, url: Url) -> Self {
        Self {
            client,
            url,
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 250,
                max_delay_ms: 2_000,
                exponential: 2.0,
            },
        }
    }

    pub async fn send(&self, domain: &str, record: &EventRecord, proof: &AuthProof) -> Result<()> {
        let body = ReportBody {
            domain,
            siwe_message: proof.rendered(),
            siwe_signature: &proof.signature,
            event: record,
        };

        retry(
            || async {
                self.client
                    .post(self.url.clone())
                    .json(&body)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .with_context(|| format!("report to {} failed", self.url))?;
                Ok(())
            },
            &self.retry,
            "report_event",
        )
        .await?;

        debug!("Reported {} to {}", record.key(), self.url);
        Ok(())
    }
}
