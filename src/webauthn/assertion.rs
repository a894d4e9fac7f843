//! Assertion verification for authentication ceremonies
//!
//! Checks a signed assertion against the ceremony that issued the challenge
//! and the stored credential. The counter is only checked here; committing
//! the new value is the credential store's job.

use sha2::{Digest, Sha256};

use super::authenticator_data::AuthenticatorData;
use super::client_data::verify_client_data;
use super::cose::CosePublicKey;
use super::errors::WebAuthnError;
use super::settings::{CounterPolicy, WebAuthnSettings};
use super::types::{AssertionResponse, AuthenticationOutcome, Ceremony, CeremonyKind, Credential};

/// Verifies authentication responses
#[derive(Debug, Clone)]
pub struct AssertionVerifier {
    rp_id: String,
    allowed_origins: Vec<String>,
    require_user_verification: bool,
    counter_policy: CounterPolicy,
}

impl AssertionVerifier {
    #[must_use]
    pub fn new(settings: &WebAuthnSettings) -> Self {
        Self {
            rp_id: settings.rp_id.clone(),
            allowed_origins: settings.allowed_origins.clone(),
            require_user_verification: settings.require_user_verification,
            counter_policy: settings.counter_policy,
        }
    }

    /// Verify `response` for a consumed authentication ceremony
    ///
    /// The returned outcome carries the presented counter, which the caller
    /// must commit with a compare-and-set.
    ///
    /// # Errors
    ///
    /// Client data errors, `RpIdMismatch`, user flag errors,
    /// `SignatureInvalid`, `CounterRegression` or `UserHandleMismatch`,
    /// in that order
    pub fn verify(
        &self,
        ceremony: &Ceremony,
        response: &AssertionResponse,
        credential: &Credential,
    ) -> Result<AuthenticationOutcome, WebAuthnError> {
        if ceremony.kind != CeremonyKind::Authentication {
            return Err(WebAuthnError::CeremonyKindMismatch);
        }
        if response.credential_id != credential.credential_id {
            return Err(WebAuthnError::UnknownCredential);
        }

        verify_client_data(
            &response.client_data_json,
            CeremonyKind::Authentication,
            ceremony.challenge.as_bytes(),
            &self.allowed_origins,
        )?;

        let auth_data = AuthenticatorData::parse(&response.authenticator_data)?;
        auth_data.verify_rp_id(&self.rp_id)?;
        auth_data.verify_user_flags(self.require_user_verification)?;

        let key = CosePublicKey::from_cbor(&credential.public_key)?;
        let mut signed = response.authenticator_data.clone();
        signed.extend_from_slice(&Sha256::digest(&response.client_data_json));
        key.verify(&signed, &response.signature)?;

        check_counter(
            self.counter_policy,
            credential.signature_counter,
            auth_data.sign_count,
        )?;

        if let Some(handle) = response.user_handle.as_deref() {
            if !handle.is_empty() && handle != credential.user_handle.as_slice() {
                return Err(WebAuthnError::UserHandleMismatch);
            }
        }

        Ok(AuthenticationOutcome {
            identity: credential.owner.clone(),
            credential_id: credential.credential_id.clone(),
            signature_counter: auth_data.sign_count,
        })
    }
}

/// Apply the counter policy to a presented counter
///
/// # Errors
///
/// Returns `CounterRegression` if the policy rejects `presented`
pub fn check_counter(
    policy: CounterPolicy,
    stored: u32,
    presented: u32,
) -> Result<(), WebAuthnError> {
    if policy.accepts(stored, presented) {
        Ok(())
    } else {
        Err(WebAuthnError::CounterRegression { stored, presented })
    }
}
