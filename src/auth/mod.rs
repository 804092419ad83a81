//! Wallet authentication: signed sign-in proofs for reporting events.

pub mod nonce;
pub mod siwe;

use alloy_primitives::{hex, Address, Signature};
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::models::common::SiweConfig;
use crate::models::errors::AuthError;
use crate::models::event::EventRecord;

pub use nonce::{Nonce, NonceProvider, RandomNonceProvider, RemoteNonceProvider};
pub use siwe::{SiweMessage, SIWE_VERSION};

/// Anything able to produce EIP-191 personal signatures.
#[async_trait]
pub trait Wallet: Send + Sync {
    fn address(&self) -> Address;

    /// May suspend indefinitely for wallets that need user confirmation.
    async fn sign_message(&self, message: &[u8]) -> Result<Signature, AuthError>;
}

#[async_trait]
impl Wallet for PrivateKeySigner {
    fn address(&self) -> Address {
        alloy_signer::Signer::address(self)
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Signature, AuthError> {
        alloy_signer::Signer::sign_message(self, message)
            .await
            .map_err(|e| AuthError::AuthenticationFailed {
                reason: e.to_string(),
            })
    }
}

/// A signed sign-in statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthProof {
    #[serde(flatten)]
    pub message: SiweMessage,
    /// 0x-prefixed 65-byte signature over the rendered message.
    pub signature: String,
}

impl AuthProof {
    pub fn rendered(&self) -> String {
        self.message.render()
    }

    /// Recover the signer from the rendered text and check it matches the
    /// claimed address.
    pub fn verify(&self) -> Result<Address, AuthError> {
        let invalid = |reason: String| AuthError::InvalidProof { reason };

        let bytes = hex::decode(&self.signature).map_err(|e| invalid(e.to_string()))?;
        let signature = Signature::from_raw(&bytes).map_err(|e| invalid(e.to_string()))?;
        let recovered = signature
            .recover_address_from_msg(self.rendered().as_bytes())
            .map_err(|e| invalid(e.to_string()))?;

        let claimed: Address = self
            .message
            .address
            .parse()
            .map_err(|_| invalid(format!("bad address {}", self.message.address)))?;

        if recovered != claimed {
            return Err(invalid(format!(
                "signer mismatch (recovered={}, claimed={})",
                recovered, claimed
            )));
        }
        Ok(recovered)
    }
}

const CONSUMED_NONCE_CAPACITY: usize = 1 << 16;

/// Nonce values already signed. Entries leave only when the ledger is full,
/// oldest first, never because their reported expiry has passed.
#[derive(Debug, Default)]
struct NonceLedger {
    values: HashSet<String>,
    order: VecDeque<String>,
}

impl NonceLedger {
    fn consume(&mut self, value: &str) -> bool {
        if !self.values.insert(value.to_string()) {
            return false;
        }
        self.order.push_back(value.to_string());
        if self.order.len() > CONSUMED_NONCE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.values.remove(&oldest);
            }
        }
        true
    }
}

/// Builds freshly signed proofs. Every proof consumes one nonce; a nonce
/// seen before is refused even if the provider hands it out again.
pub struct WalletAuthenticator {
    wallet: Arc<dyn Wallet>,
    nonces: Arc<dyn NonceProvider>,
    siwe: SiweConfig,
    chain_id: u64,
    consumed: Mutex<NonceLedger>,
}

impl WalletAuthenticator {
    pub fn new(
        wallet: Arc<dyn Wallet>,
        nonces: Arc<dyn NonceProvider>,
        siwe: SiweConfig,
        chain_id: u64,
    ) -> Self {
        Self {
            wallet,
            nonces,
            siwe,
            chain_id,
            consumed: Mutex::new(NonceLedger::default()),
        }
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub async fn build_proof(
        &self,
        statement: &str,
        resources: Option<Vec<String>>,
    ) -> Result<AuthProof, AuthError> {
        let nonce = self.nonces.issue().await?;
        let issued_at = Utc::now();
        self.consume(&nonce, issued_at)?;

        let message = SiweMessage {
            domain: self.siwe.domain.clone(),
            address: self.wallet.address().to_checksum(None),
            statement: statement.to_string(),
            uri: self.siwe.uri.clone(),
            version: SIWE_VERSION.to_string(),
            chain_id: self.chain_id,
            nonce: nonce.value,
            issued_at: issued_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            expiration_time: Some(nonce.expires_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            resources: resources.unwrap_or_default(),
        };
        message.validate()?;

        let rendered = message.render();
        let signature = self.wallet.sign_message(rendered.as_bytes()).await.map_err(|e| {
            warn!("Wallet refused to sign: {}", e);
            match e {
                AuthError::AuthenticationFailed { .. } => e,
                other => AuthError::AuthenticationFailed {
                    reason: other.to_string(),
                },
            }
        })?;

        debug!("Signed proof with nonce {}", message.nonce);

        Ok(AuthProof {
            message,
            signature: hex::encode_prefixed(signature.as_bytes()),
        })
    }

    /// Proof scoped to a single event report.
    pub async fn build_event_proof(
        &self,
        domain: &str,
        record: &EventRecord,
    ) -> Result<AuthProof, AuthError> {
        let statement = format!(
            "Report {} event {}:{} for domain {}",
            record.event_name, record.transaction_hash, record.log_index, domain
        );
        self.build_proof(&statement, Some(vec![record.resource()])).await
    }

    fn consume(&self, nonce: &Nonce, now: DateTime<Utc>) -> Result<(), AuthError> {
        if nonce.expires_at <= now {
            return Err(AuthError::NonceExpired {
                nonce: nonce.value.clone(),
            });
        }

        let mut consumed = self.consumed.lock().map_err(|_| AuthError::NonceUnavailable {
            reason: "nonce ledger poisoned".to_string(),
        })?;

        if !consumed.consume(&nonce.value) {
            return Err(AuthError::NonceReused {
                nonce: nonce.value.clone(),
            });
        }
        Ok(())
    }
}
