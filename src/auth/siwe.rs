//! EIP-4361 sign-in message rendering.
//!
//! The signature covers the rendered text, so this template must stay
//! byte-for-byte stable.

use serde::{Deserialize, Serialize};

use crate::models::errors::AuthError;

pub const SIWE_VERSION: &str = "1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiweMessage {
    pub domain: String,
    /// EIP-55 checksummed address.
    pub address: String,
    pub statement: String,
    pub uri: String,
    pub version: String,
    pub chain_id: u64,
    pub nonce: String,
    /// RFC 3339 timestamp.
    pub issued_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
}

impl SiweMessage {
    pub fn validate(&self) -> Result<(), AuthError> {
        let invalid = |reason: &str| AuthError::InvalidProof {
            reason: reason.to_string(),
        };

        if self.statement.contains('\n') {
            return Err(invalid("statement must be a single line"));
        }
        if self.nonce.len() < 8 || !self.nonce.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid("nonce must be at least 8 alphanumeric characters"));
        }
        if self.resources.iter().any(|r| r.contains('\n')) {
            return Err(invalid("resources must be single line"));
        }
        Ok(())
    }

    pub fn render(&self) -> String {
        let mut message = format!(
            "{} wants you to sign in with your Ethereum account:\n{}\n\n{}\n\n\
             URI: {}\nVersion: {}\nChain ID: {}\nNonce: {}\nIssued At: {}",
            self.domain,
            self.address,
            self.statement,
            self.uri,
            self.version,
            self.chain_id,
            self.nonce,
            self.issued_at,
        );

        if let Some(expiration_time) = &self.expiration_time {
            message.push_str("\nExpiration Time: ");
            message.push_str(expiration_time);
        }

        if !self.resources.is_empty() {
            message.push_str("\nResources:");
            for resource in &self.resources {
                message.push_str("\n- ");
                message.push_str(resource);
            }
        }

        message
    }
}
