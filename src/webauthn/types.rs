//! `WebAuthn` core types
//!
//! Data model shared by the ceremony engine, the verifiers and the credential
//! store. All byte fields hold decoded bytes; text encodings for transport
//! live in the HTTP layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::encoding::base64url;

/// Opaque user-facing key: a kiosk PIN, a username or a generated id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Single-use random challenge bound to one ceremony
#[derive(Clone, PartialEq, Eq)]
pub struct Challenge {
    bytes: Vec<u8>,
    expires_at: DateTime<Utc>,
}

impl Challenge {
    #[must_use]
    pub fn new(bytes: Vec<u8>, expires_at: DateTime<Utc>) -> Self {
        Self { bytes, expires_at }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

// Challenge bytes stay out of logs.
impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Challenge")
            .field("len", &self.bytes.len())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Which ceremony a challenge was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CeremonyKind {
    Registration,
    Authentication,
}

impl CeremonyKind {
    /// Value the client must put in `clientDataJSON.type`
    #[must_use]
    pub fn client_data_type(self) -> &'static str {
        match self {
            Self::Registration => "webauthn.create",
            Self::Authentication => "webauthn.get",
        }
    }
}

impl fmt::Display for CeremonyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registration => f.write_str("registration"),
            Self::Authentication => f.write_str("authentication"),
        }
    }
}

/// One registration or authentication attempt
#[derive(Debug, Clone)]
pub struct Ceremony {
    pub id: String,
    pub kind: CeremonyKind,
    pub challenge: Challenge,
    /// Always set for registration; optional for authentication by any credential
    pub identity: Option<Identity>,
    /// `user.id` handed to the authenticator at registration
    pub user_handle: Option<Vec<u8>>,
    /// Credentials the client may answer with; empty means any
    pub allowed_credentials: Vec<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub consumed: bool,
}

/// Registered public key credential
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    #[serde(with = "base64url")]
    pub credential_id: Vec<u8>,
    pub owner: Identity,
    #[serde(with = "base64url")]
    pub user_handle: Vec<u8>,
    /// COSE-encoded public key
    #[serde(with = "base64url")]
    pub public_key: Vec<u8>,
    /// COSE algorithm identifier of `public_key`
    pub algorithm: i64,
    pub signature_counter: u32,
    pub attestation_format: String,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

/// Decoded registration response from the client
#[derive(Debug, Clone)]
pub struct AttestationResponse {
    pub credential_id: Vec<u8>,
    pub client_data_json: Vec<u8>,
    pub attestation_object: Vec<u8>,
}

/// Decoded authentication response from the client
#[derive(Debug, Clone)]
pub struct AssertionResponse {
    pub credential_id: Vec<u8>,
    pub client_data_json: Vec<u8>,
    pub authenticator_data: Vec<u8>,
    pub signature: Vec<u8>,
    pub user_handle: Option<Vec<u8>>,
}

/// Relying party information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelyingParty {
    pub id: String,
    pub name: String,
}

/// User entity presented to the authenticator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEntity {
    pub id: Vec<u8>,
    pub name: String,
    pub display_name: String,
}

/// Options returned by `begin_registration`
#[derive(Debug, Clone)]
pub struct RegistrationOptions {
    pub ceremony_id: String,
    pub challenge: Vec<u8>,
    pub rp: RelyingParty,
    pub user: UserEntity,
    /// Accepted COSE algorithms in preference order
    pub algorithms: Vec<i64>,
    pub timeout_ms: u64,
    /// Attestation conveyance preference ("none" or "direct")
    pub attestation: &'static str,
    pub user_verification: String,
    pub authenticator_attachment: Option<String>,
    pub exclude_credentials: Vec<Vec<u8>>,
}

/// Options returned by `begin_authentication`
#[derive(Debug, Clone)]
pub struct AuthenticationOptions {
    pub ceremony_id: String,
    pub challenge: Vec<u8>,
    pub rp_id: String,
    pub timeout_ms: u64,
    pub user_verification: String,
    pub allow_credentials: Vec<Vec<u8>>,
}

/// Successful registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationOutcome {
    pub identity: Identity,
    pub credential_id: Vec<u8>,
    pub signature_counter: u32,
}

/// Successful authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationOutcome {
    pub identity: Identity,
    pub credential_id: Vec<u8>,
    /// Counter value committed to the credential store
    pub signature_counter: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_client_data_types() {
        assert_eq!(
            CeremonyKind::Registration.client_data_type(),
            "webauthn.create"
        );
        assert_eq!(
            CeremonyKind::Authentication.client_data_type(),
            "webauthn.get"
        );
    }

    #[test]
    fn test_challenge_expiry_is_exclusive() {
        let now = Utc::now();
        let challenge = Challenge::new(vec![1; 32], now);
        assert!(!challenge.is_expired_at(now));
        assert!(challenge.is_expired_at(now + Duration::milliseconds(1)));
    }

    #[test]
    fn test_challenge_debug_hides_bytes() {
        let challenge = Challenge::new(vec![0xAB; 32], Utc::now());
        let rendered = format!("{challenge:?}");
        assert!(rendered.contains("len: 32"));
        assert!(!rendered.contains("171"));
    }

    #[test]
    fn test_credential_json_uses_base64url() {
        let credential = Credential {
            credential_id: vec![0xFB, 0xFF],
            owner: Identity::new("1234"),
            user_handle: vec![1, 2, 3],
            public_key: vec![0xA5],
            algorithm: -7,
            signature_counter: 3,
            attestation_format: "none".to_string(),
            created_at: Utc::now(),
            last_used: None,
        };
        let json = serde_json::to_value(&credential).unwrap();
        assert_eq!(json["credential_id"], "-_8");
        assert_eq!(json["owner"], "1234");

        let back: Credential = serde_json::from_value(json).unwrap();
        assert_eq!(back, credential);
    }
}
