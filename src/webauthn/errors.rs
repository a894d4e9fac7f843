//! `WebAuthn` error types for kioskpass
//!
//! Every failure is scoped to a single ceremony. Nothing in here is fatal to
//! the process.

use thiserror::Error;

/// Errors raised by the ceremony engine and its verifiers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WebAuthnError {
    /// Challenge in the client data differs from the ceremony's challenge
    #[error("challenge in client data does not match the ceremony challenge")]
    ChallengeMismatch,

    /// Origin in the client data is not one of the allowed origins
    #[error("origin {0:?} is not allowed")]
    OriginMismatch(String),

    /// Authenticator data was produced for a different relying party
    #[error("relying party id hash does not match")]
    RpIdMismatch,

    /// Client data `type` does not match the ceremony kind
    #[error("client data type {0:?} does not match the ceremony")]
    CeremonyTypeMismatch(String),

    #[error("ceremony not found")]
    CeremonyNotFound,

    #[error("ceremony expired")]
    CeremonyExpired,

    #[error("ceremony already consumed")]
    CeremonyAlreadyConsumed,

    /// A registration ceremony was finished as an authentication or vice versa
    #[error("ceremony kind does not match the finish operation")]
    CeremonyKindMismatch,

    #[error("unknown credential")]
    UnknownCredential,

    #[error("assertion signature is invalid")]
    SignatureInvalid,

    /// Signature counter did not advance; possible cloned authenticator
    #[error("signature counter regression (stored {stored}, presented {presented})")]
    CounterRegression { stored: u32, presented: u32 },

    #[error("credential id is already registered")]
    DuplicateCredentialId,

    #[error("secure random source is unavailable")]
    EntropyUnavailable,

    /// Response could not be decoded (bad CBOR, JSON, lengths, ...)
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("unsupported COSE algorithm {0}")]
    UnsupportedAlgorithm(i64),

    /// Attestation statement failed verification or did not meet the policy
    #[error("attestation rejected: {0}")]
    AttestationRejected(String),

    #[error("user presence flag not set")]
    UserPresenceMissing,

    #[error("user verification required but not performed")]
    UserVerificationMissing,

    #[error("user handle does not match the credential owner")]
    UserHandleMismatch,

    /// Caller-supplied deadline passed before verification finished
    #[error("verification deadline exceeded")]
    DeadlineExceeded,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl WebAuthnError {
    /// Failures that point at a forged or cloned authenticator rather than
    /// an ordinary user mistake
    #[must_use]
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            Self::SignatureInvalid | Self::CounterRegression { .. }
        )
    }

    /// Errors that belong to the ceremony lifecycle rather than to the
    /// content of the client response
    #[must_use]
    pub fn is_ceremony_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::CeremonyNotFound
                | Self::CeremonyExpired
                | Self::CeremonyAlreadyConsumed
                | Self::CeremonyKindMismatch
        )
    }

    /// Errors caused by the server side rather than the client
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::EntropyUnavailable | Self::Storage(_) | Self::Configuration(_)
        )
    }

    /// Stable machine-readable code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ChallengeMismatch => "challenge_mismatch",
            Self::OriginMismatch(_) => "origin_mismatch",
            Self::RpIdMismatch => "rp_id_mismatch",
            Self::CeremonyTypeMismatch(_) => "ceremony_type_mismatch",
            Self::CeremonyNotFound => "ceremony_not_found",
            Self::CeremonyExpired => "ceremony_expired",
            Self::CeremonyAlreadyConsumed => "ceremony_already_consumed",
            Self::CeremonyKindMismatch => "ceremony_kind_mismatch",
            Self::UnknownCredential => "unknown_credential",
            Self::SignatureInvalid => "signature_invalid",
            Self::CounterRegression { .. } => "counter_regression",
            Self::DuplicateCredentialId => "duplicate_credential_id",
            Self::EntropyUnavailable => "entropy_unavailable",
            Self::MalformedResponse(_) => "malformed_response",
            Self::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            Self::AttestationRejected(_) => "attestation_rejected",
            Self::UserPresenceMissing => "user_presence_missing",
            Self::UserVerificationMissing => "user_verification_missing",
            Self::UserHandleMismatch => "user_handle_mismatch",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Storage(_) => "storage_error",
            Self::Configuration(_) => "configuration_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_events_are_flagged() {
        assert!(WebAuthnError::SignatureInvalid.is_security_event());
        assert!(WebAuthnError::CounterRegression {
            stored: 4,
            presented: 4
        }
        .is_security_event());
        assert!(!WebAuthnError::ChallengeMismatch.is_security_event());
        assert!(!WebAuthnError::CeremonyExpired.is_security_event());
    }

    #[test]
    fn test_lifecycle_and_internal_classification() {
        assert!(WebAuthnError::CeremonyAlreadyConsumed.is_ceremony_lifecycle());
        assert!(!WebAuthnError::UnknownCredential.is_ceremony_lifecycle());
        assert!(WebAuthnError::EntropyUnavailable.is_internal());
        assert!(!WebAuthnError::RpIdMismatch.is_internal());
    }

    #[test]
    fn test_display_includes_counter_values() {
        let message = WebAuthnError::CounterRegression {
            stored: 7,
            presented: 5,
        }
        .to_string();
        assert!(message.contains("stored 7"));
        assert!(message.contains("presented 5"));
    }
}
