//! Identity provider boundary
//!
//! The authority never authenticates users itself. A join carries a
//! `Credential` issued elsewhere; an `IdentityProvider` decides whether it is
//! still valid and yields the verified participant identity.
//!
//! `SignedTokenProvider` is the bundled provider: tokens are
//! `<expires_unix>.<hex hmac-sha256>` over participant id, display name and
//! expiry, signed with a shared secret. Each signed field is length-prefixed
//! so no two distinct credentials share a signing input.

use crate::errors::{Result, SyncError};
use crate::model::ParticipantId;
use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub token: String,
}

/// A participant identity that passed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub expires_at: DateTime<Utc>,
}

pub trait IdentityProvider: Send + Sync {
    fn verify(&self, credential: &Credential) -> Result<Identity>;
}

pub struct SignedTokenProvider {
    secret: Vec<u8>,
    ttl: Duration,
}

impl SignedTokenProvider {
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            ttl,
        }
    }

    /// Mint a credential valid for the provider's TTL from now.
    pub fn issue(&self, participant_id: impl Into<ParticipantId>, display_name: impl Into<String>) -> Credential {
        self.issue_at(participant_id, display_name, Utc::now() + self.ttl)
    }

    pub fn issue_at(
        &self,
        participant_id: impl Into<ParticipantId>,
        display_name: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Credential {
        let participant_id = participant_id.into();
        let display_name = display_name.into();
        let expires = expires_at.timestamp();
        let signature = hex::encode(self.sign(&participant_id, &display_name, expires));
        Credential {
            participant_id,
            display_name,
            token: format!("{}.{}", expires, signature),
        }
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts keys of any length")
    }

    fn sign(&self, participant_id: &ParticipantId, display_name: &str, expires: i64) -> Vec<u8> {
        let mut mac = self.mac();
        mac.update(&signing_input(participant_id, display_name, expires));
        mac.finalize().into_bytes().to_vec()
    }

    fn verify_at(&self, credential: &Credential, now: DateTime<Utc>) -> Result<Identity> {
        if credential.participant_id.as_str().is_empty() {
            return Err(SyncError::Unauthorized("missing participant id".into()));
        }

        let (expires, signature) = credential
            .token
            .split_once('.')
            .ok_or_else(|| SyncError::Unauthorized("malformed token".into()))?;
        let expires: i64 = expires
            .parse()
            .map_err(|_| SyncError::Unauthorized("malformed token expiry".into()))?;
        let signature =
            hex::decode(signature).map_err(|_| SyncError::Unauthorized("malformed token signature".into()))?;

        let mut mac = self.mac();
        mac.update(&signing_input(&credential.participant_id, &credential.display_name, expires));
        mac.verify_slice(&signature)
            .map_err(|_| SyncError::Unauthorized("invalid token signature".into()))?;

        let expires_at = Utc
            .timestamp_opt(expires, 0)
            .single()
            .ok_or_else(|| SyncError::Unauthorized("malformed token expiry".into()))?;
        if expires_at <= now {
            return Err(SyncError::Unauthorized("token expired".into()));
        }

        Ok(Identity {
            participant_id: credential.participant_id.clone(),
            display_name: credential.display_name.clone(),
            expires_at,
        })
    }
}

impl IdentityProvider for SignedTokenProvider {
    fn verify(&self, credential: &Credential) -> Result<Identity> {
        self.verify_at(credential, Utc::now())
    }
}

fn signing_input(participant_id: &ParticipantId, display_name: &str, expires: i64) -> Vec<u8> {
    let mut input = Vec::with_capacity(participant_id.as_str().len() + display_name.len() + 24);
    for field in [participant_id.as_str().as_bytes(), display_name.as_bytes()] {
        input.extend_from_slice(&(field.len() as u64).to_be_bytes());
        input.extend_from_slice(field);
    }
    input.extend_from_slice(&expires.to_be_bytes());
    input
}
