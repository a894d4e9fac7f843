//! Collected client data checks
//!
//! Shared by registration and authentication: the challenge, origin and
//! ceremony type embedded by the browser must match what the server issued.

use serde::Deserialize;

use super::errors::WebAuthnError;
use super::types::CeremonyKind;
use crate::utils::encoding;

/// The subset of `CollectedClientData` the server checks
#[derive(Debug, Deserialize)]
pub struct CollectedClientData {
    #[serde(rename = "type")]
    pub ceremony_type: String,
    pub challenge: String,
    pub origin: String,
    #[serde(rename = "crossOrigin", default)]
    pub cross_origin: bool,
}

impl CollectedClientData {
    /// Parse raw `clientDataJSON` bytes
    ///
    /// # Errors
    ///
    /// Returns `MalformedResponse` if the bytes are not the expected JSON
    pub fn parse(raw: &[u8]) -> Result<Self, WebAuthnError> {
        serde_json::from_slice(raw)
            .map_err(|e| WebAuthnError::MalformedResponse(format!("invalid client data JSON: {e}")))
    }
}

/// Verify challenge, origin and type, in that order
///
/// # Errors
///
/// Returns `ChallengeMismatch`, `OriginMismatch` or `CeremonyTypeMismatch`
/// for the first check that fails, or `MalformedResponse` if the JSON cannot
/// be parsed.
pub fn verify_client_data(
    raw: &[u8],
    kind: CeremonyKind,
    expected_challenge: &[u8],
    allowed_origins: &[String],
) -> Result<CollectedClientData, WebAuthnError> {
    let client_data = CollectedClientData::parse(raw)?;

    let embedded = encoding::decode(&client_data.challenge)
        .map_err(|_| WebAuthnError::ChallengeMismatch)?;
    if embedded != expected_challenge {
        return Err(WebAuthnError::ChallengeMismatch);
    }

    if !origin_allowed(&client_data.origin, allowed_origins) {
        return Err(WebAuthnError::OriginMismatch(client_data.origin));
    }

    if client_data.ceremony_type != kind.client_data_type() {
        return Err(WebAuthnError::CeremonyTypeMismatch(client_data.ceremony_type));
    }

    if client_data.cross_origin {
        log::debug!("Client data marked crossOrigin for {}", client_data.origin);
    }

    Ok(client_data)
}

fn origin_allowed(origin: &str, allowed_origins: &[String]) -> bool {
    let origin = origin.trim_end_matches('/');
    allowed_origins
        .iter()
        .any(|allowed| allowed.trim_end_matches('/') == origin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ORIGIN: &str = "https://kiosk.example";

    fn client_data(kind: &str, challenge: &[u8], origin: &str) -> Vec<u8> {
        json!({
            "type": kind,
            "challenge": encoding::encode(challenge),
            "origin": origin,
            "crossOrigin": false
        })
        .to_string()
        .into_bytes()
    }

    fn origins() -> Vec<String> {
        vec![ORIGIN.to_string()]
    }

    #[test]
    fn test_valid_client_data_passes() {
        let raw = client_data("webauthn.get", &[7; 32], ORIGIN);
        let parsed =
            verify_client_data(&raw, CeremonyKind::Authentication, &[7; 32], &origins()).unwrap();
        assert_eq!(parsed.origin, ORIGIN);
    }

    #[test]
    fn test_challenge_is_checked_first() {
        // Wrong challenge, origin and type: the challenge error wins
        let raw = client_data("webauthn.get", &[1; 32], "https://evil.example");
        let err = verify_client_data(&raw, CeremonyKind::Registration, &[2; 32], &origins())
            .unwrap_err();
        assert_eq!(err, WebAuthnError::ChallengeMismatch);
    }

    #[test]
    fn test_origin_mismatch() {
        let raw = client_data("webauthn.create", &[3; 32], "https://evil.example");
        let err = verify_client_data(&raw, CeremonyKind::Registration, &[3; 32], &origins())
            .unwrap_err();
        assert_eq!(
            err,
            WebAuthnError::OriginMismatch("https://evil.example".to_string())
        );
    }

    #[test]
    fn test_type_mismatch() {
        let raw = client_data("webauthn.get", &[3; 32], ORIGIN);
        let err = verify_client_data(&raw, CeremonyKind::Registration, &[3; 32], &origins())
            .unwrap_err();
        assert_eq!(
            err,
            WebAuthnError::CeremonyTypeMismatch("webauthn.get".to_string())
        );
    }

    #[test]
    fn test_trailing_slash_on_origin_is_ignored() {
        let raw = client_data("webauthn.get", &[9; 32], "https://kiosk.example/");
        assert!(
            verify_client_data(&raw, CeremonyKind::Authentication, &[9; 32], &origins()).is_ok()
        );
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let err = verify_client_data(b"{not json", CeremonyKind::Authentication, &[0; 32], &origins())
            .unwrap_err();
        assert!(matches!(err, WebAuthnError::MalformedResponse(_)));
    }
}
