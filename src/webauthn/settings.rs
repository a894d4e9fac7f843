//! `WebAuthn` settings implementation
//!
//! Relying party identity and verification policy for the ceremony engine,
//! independent of the HTTP application settings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How much attestation evidence a new credential must carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttestationPolicy {
    /// Accept any registration whose statement (if any) verifies
    None,
    /// Require a verified self or certificate attestation signature
    #[serde(rename = "self")]
    SelfAttested,
    /// Require an `x5c` chain ending at a configured trust anchor
    FullChain,
}

impl FromStr for AttestationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "self" => Ok(Self::SelfAttested),
            "full-chain" | "full_chain" => Ok(Self::FullChain),
            other => Err(format!("unknown attestation policy: {other}")),
        }
    }
}

impl fmt::Display for AttestationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::SelfAttested => f.write_str("self"),
            Self::FullChain => f.write_str("full-chain"),
        }
    }
}

/// What to do with a signature counter that did not increase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CounterPolicy {
    /// New counter must always be greater than the stored one
    Strict,
    /// Also accept authenticators that always report zero
    AllowZeroReuse,
}

impl CounterPolicy {
    /// Whether `presented` may replace `stored`
    #[must_use]
    pub fn accepts(self, stored: u32, presented: u32) -> bool {
        match self {
            Self::Strict => presented > stored,
            Self::AllowZeroReuse => presented > stored || (presented == 0 && stored == 0),
        }
    }
}

impl FromStr for CounterPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "allow-zero-reuse" | "allow_zero_reuse" => Ok(Self::AllowZeroReuse),
            other => Err(format!("unknown counter policy: {other}")),
        }
    }
}

impl fmt::Display for CounterPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => f.write_str("strict"),
            Self::AllowZeroReuse => f.write_str("allow-zero-reuse"),
        }
    }
}

/// `WebAuthn` settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebAuthnSettings {
    /// Relying Party ID (usually the domain)
    pub rp_id: String,
    /// Relying Party name (displayed to user)
    pub rp_name: String,
    /// Origins accepted in client data (e.g., <https://kiosk.example>)
    pub allowed_origins: Vec<String>,
    /// Lifetime of a pending ceremony
    pub ceremony_timeout_seconds: u64,
    pub attestation_policy: AttestationPolicy,
    pub counter_policy: CounterPolicy,
    /// Reject responses without the user verified flag
    pub require_user_verification: bool,
    /// Optional authenticator attachment ("platform", "cross-platform")
    pub authenticator_attachment: Option<String>,
    /// PEM files with attestation root certificates
    pub trust_anchors: Vec<String>,
    /// Upper bound for a single finish call at the HTTP layer
    pub verification_timeout_ms: u64,
}

impl WebAuthnSettings {
    /// User verification preference sent to the client
    #[must_use]
    pub fn user_verification(&self) -> &'static str {
        if self.require_user_verification {
            "required"
        } else {
            "preferred"
        }
    }

    /// Attestation conveyance preference sent to the client
    #[must_use]
    pub fn attestation_conveyance(&self) -> &'static str {
        match self.attestation_policy {
            AttestationPolicy::None => "none",
            AttestationPolicy::SelfAttested | AttestationPolicy::FullChain => "direct",
        }
    }

    #[must_use]
    pub fn ceremony_timeout_ms(&self) -> u64 {
        self.ceremony_timeout_seconds.saturating_mul(1000)
    }
}

impl Default for WebAuthnSettings {
    fn default() -> Self {
        Self {
            rp_id: "localhost".to_string(),
            rp_name: "Kioskpass".to_string(),
            allowed_origins: vec!["http://localhost:8080".to_string()],
            ceremony_timeout_seconds: 60,
            attestation_policy: AttestationPolicy::None,
            counter_policy: CounterPolicy::Strict,
            require_user_verification: false,
            authenticator_attachment: None,
            trust_anchors: Vec::new(),
            verification_timeout_ms: 5000,
        }
    }
}
