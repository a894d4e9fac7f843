//! Wire types for the HTTP endpoints
//!
//! Options follow the browser `PublicKeyCredential*Options` JSON shape and
//! credentials follow `PublicKeyCredential.toJSON()`. All binary members are
//! base64url; this is the only place they are encoded or decoded.

use serde::{Deserialize, Serialize};

use crate::utils::encoding;
use crate::webauthn::{
    AssertionResponse, AttestationResponse, AuthenticationOptions, RegistrationOptions,
    WebAuthnError,
};

const PUBLIC_KEY_TYPE: &str = "public-key";

#[derive(Debug, Deserialize)]
pub struct RegisterOptionsRequest {
    pub identity: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuthOptionsRequest {
    #[serde(default)]
    pub identity: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterFinishRequest {
    pub ceremony_id: String,
    pub credential: RegistrationCredentialJson,
}

#[derive(Debug, Deserialize)]
pub struct AuthFinishRequest {
    /// Optional; resolved from the signed challenge when absent
    #[serde(default)]
    pub ceremony_id: Option<String>,
    pub assertion: AuthenticationCredentialJson,
}

/// Kiosk enrolment: an identity (PIN) and its image
#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub identity: String,
    /// Data URL (`data:image/png;base64,...`) or bare base64
    pub image: String,
}

/// Options envelope returned by both options endpoints
#[derive(Debug, Serialize)]
pub struct OptionsResponse<T> {
    pub ceremony_id: String,
    #[serde(rename = "publicKey")]
    pub public_key: T,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreationOptionsJson {
    pub challenge: String,
    pub rp: RpJson,
    pub user: UserJson,
    pub pub_key_cred_params: Vec<CredentialParameterJson>,
    pub timeout: u64,
    pub attestation: &'static str,
    pub authenticator_selection: AuthenticatorSelectionJson,
    pub exclude_credentials: Vec<CredentialDescriptorJson>,
}

#[derive(Debug, Serialize)]
pub struct RpJson {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJson {
    pub id: String,
    pub name: String,
    pub display_name: String,
}

#[derive(Debug, Serialize)]
pub struct CredentialParameterJson {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub alg: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorSelectionJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticator_attachment: Option<String>,
    pub resident_key: &'static str,
    pub user_verification: String,
}

#[derive(Debug, Serialize)]
pub struct CredentialDescriptorJson {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: String,
}

impl CredentialDescriptorJson {
    fn new(id: &[u8]) -> Self {
        Self {
            kind: PUBLIC_KEY_TYPE,
            id: encoding::encode(id),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptionsJson {
    pub challenge: String,
    pub rp_id: String,
    pub timeout: u64,
    pub user_verification: String,
    pub allow_credentials: Vec<CredentialDescriptorJson>,
}

impl From<RegistrationOptions> for OptionsResponse<CreationOptionsJson> {
    fn from(options: RegistrationOptions) -> Self {
        Self {
            ceremony_id: options.ceremony_id,
            public_key: CreationOptionsJson {
                challenge: encoding::encode(&options.challenge),
                rp: RpJson {
                    id: options.rp.id,
                    name: options.rp.name,
                },
                user: UserJson {
                    id: encoding::encode(&options.user.id),
                    name: options.user.name,
                    display_name: options.user.display_name,
                },
                pub_key_cred_params: options
                    .algorithms
                    .into_iter()
                    .map(|alg| CredentialParameterJson {
                        kind: PUBLIC_KEY_TYPE,
                        alg,
                    })
                    .collect(),
                timeout: options.timeout_ms,
                attestation: options.attestation,
                authenticator_selection: AuthenticatorSelectionJson {
                    authenticator_attachment: options.authenticator_attachment,
                    resident_key: "preferred",
                    user_verification: options.user_verification,
                },
                exclude_credentials: options
                    .exclude_credentials
                    .iter()
                    .map(|id| CredentialDescriptorJson::new(id))
                    .collect(),
            },
        }
    }
}

impl From<AuthenticationOptions> for OptionsResponse<RequestOptionsJson> {
    fn from(options: AuthenticationOptions) -> Self {
        Self {
            ceremony_id: options.ceremony_id,
            public_key: RequestOptionsJson {
                challenge: encoding::encode(&options.challenge),
                rp_id: options.rp_id,
                timeout: options.timeout_ms,
                user_verification: options.user_verification,
                allow_credentials: options
                    .allow_credentials
                    .iter()
                    .map(|id| CredentialDescriptorJson::new(id))
                    .collect(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegistrationCredentialJson {
    pub id: String,
    #[serde(rename = "rawId", default)]
    pub raw_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub response: AttestationResponseJson,
}

#[derive(Debug, Deserialize)]
pub struct AttestationResponseJson {
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: String,
    #[serde(rename = "attestationObject")]
    pub attestation_object: String,
}

#[derive(Debug, Deserialize)]
pub struct AuthenticationCredentialJson {
    pub id: String,
    #[serde(rename = "rawId", default)]
    pub raw_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub response: AssertionResponseJson,
}

#[derive(Debug, Deserialize)]
pub struct AssertionResponseJson {
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: String,
    #[serde(rename = "authenticatorData")]
    pub authenticator_data: String,
    pub signature: String,
    #[serde(rename = "userHandle", default)]
    pub user_handle: Option<String>,
}

impl RegistrationCredentialJson {
    /// Decode into the engine's byte-level response
    ///
    /// # Errors
    ///
    /// Returns `MalformedResponse` on bad base64url or a wrong credential type
    pub fn into_response(self) -> Result<AttestationResponse, WebAuthnError> {
        Ok(AttestationResponse {
            credential_id: credential_id(&self.id, self.raw_id.as_deref(), &self.kind)?,
            client_data_json: decode_field(&self.response.client_data_json, "clientDataJSON")?,
            attestation_object: decode_field(
                &self.response.attestation_object,
                "attestationObject",
            )?,
        })
    }
}

impl AuthenticationCredentialJson {
    /// Decode into the engine's byte-level response
    ///
    /// # Errors
    ///
    /// Returns `MalformedResponse` on bad base64url or a wrong credential type
    pub fn into_response(self) -> Result<AssertionResponse, WebAuthnError> {
        let user_handle = match self.response.user_handle.as_deref() {
            Some(handle) if !handle.is_empty() => Some(decode_field(handle, "userHandle")?),
            _ => None,
        };
        Ok(AssertionResponse {
            credential_id: credential_id(&self.id, self.raw_id.as_deref(), &self.kind)?,
            client_data_json: decode_field(&self.response.client_data_json, "clientDataJSON")?,
            authenticator_data: decode_field(
                &self.response.authenticator_data,
                "authenticatorData",
            )?,
            signature: decode_field(&self.response.signature, "signature")?,
            user_handle,
        })
    }
}

fn credential_id(id: &str, raw_id: Option<&str>, kind: &str) -> Result<Vec<u8>, WebAuthnError> {
    if kind != PUBLIC_KEY_TYPE {
        return Err(WebAuthnError::MalformedResponse(format!(
            "unexpected credential type {kind:?}"
        )));
    }
    let decoded = decode_field(id, "id")?;
    if let Some(raw_id) = raw_id {
        if decode_field(raw_id, "rawId")? != decoded {
            return Err(WebAuthnError::MalformedResponse(
                "id and rawId differ".to_string(),
            ));
        }
    }
    Ok(decoded)
}

fn decode_field(value: &str, name: &str) -> Result<Vec<u8>, WebAuthnError> {
    encoding::decode(value)
        .map_err(|_| WebAuthnError::MalformedResponse(format!("{name} is not valid base64url")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webauthn::{RelyingParty, UserEntity};
    use serde_json::json;

    #[test]
    fn test_creation_options_shape() {
        let options = RegistrationOptions {
            ceremony_id: "abc".to_string(),
            challenge: vec![0xFF; 4],
            rp: RelyingParty {
                id: "kiosk.example".to_string(),
                name: "Kiosk".to_string(),
            },
            user: UserEntity {
                id: vec![1, 2],
                name: "Kiosk user AQI".to_string(),
                display_name: "Kiosk user AQI".to_string(),
            },
            algorithms: vec![-7, -8],
            timeout_ms: 60_000,
            attestation: "none",
            user_verification: "preferred".to_string(),
            authenticator_attachment: None,
            exclude_credentials: vec![vec![9]],
        };
        let json = serde_json::to_value(OptionsResponse::from(options)).unwrap();

        assert_eq!(json["ceremony_id"], "abc");
        let public_key = &json["publicKey"];
        assert_eq!(public_key["challenge"], "_____w");
        assert_eq!(public_key["user"]["displayName"], "Kiosk user AQI");
        assert_eq!(public_key["pubKeyCredParams"][1]["alg"], -8);
        assert_eq!(public_key["pubKeyCredParams"][0]["type"], "public-key");
        assert_eq!(public_key["excludeCredentials"][0]["id"], "CQ");
        assert!(public_key["authenticatorSelection"]
            .get("authenticatorAttachment")
            .is_none());
    }

    #[test]
    fn test_assertion_json_decodes_padded_and_unpadded() {
        let credential: AuthenticationCredentialJson = serde_json::from_value(json!({
            "id": "AQI",
            "rawId": "AQI=",
            "type": "public-key",
            "response": {
                "clientDataJSON": "e30",
                "authenticatorData": "AA==",
                "signature": "AQ",
                "userHandle": ""
            }
        }))
        .unwrap();
        let response = credential.into_response().unwrap();
        assert_eq!(response.credential_id, vec![1, 2]);
        assert_eq!(response.client_data_json, b"{}".to_vec());
        assert_eq!(response.authenticator_data, vec![0]);
        assert!(response.user_handle.is_none());
    }

    #[test]
    fn test_wrong_type_and_mismatched_raw_id_are_rejected() {
        let make = |kind: &str, raw_id: &str| -> RegistrationCredentialJson {
            serde_json::from_value(json!({
                "id": "AQI",
                "rawId": raw_id,
                "type": kind,
                "response": {"clientDataJSON": "e30", "attestationObject": "oA"}
            }))
            .unwrap()
        };
        assert!(make("password", "AQI").into_response().is_err());
        assert!(make("public-key", "AQM").into_response().is_err());
        assert!(make("public-key", "AQI").into_response().is_ok());
    }
}
