//! `WebAuthn` attestation processing
//!
//! Verifies a registration response against its ceremony and produces the
//! credential to store. Supported statement formats:
//! - `none`: empty statement, no attestation evidence
//! - `packed` without `x5c`: self attestation by the credential key
//! - `packed` with `x5c`: signature by an attestation certificate, optionally
//!   chained to a configured trust anchor
//!
//! Whatever statement is present is verified; the attestation policy only
//! decides how much evidence is required.

use chrono::{DateTime, Utc};
use ciborium::value::Value;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkey::{Id, PKey, Public};
use openssl::sign::Verifier;
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509StoreContext, X509};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

use super::authenticator_data::AuthenticatorData;
use super::cbor::{as_i64, AttestationObject};
use super::client_data::verify_client_data;
use super::cose::{CosePublicKey, ALG_EDDSA, ALG_ES256, ALG_RS256};
use super::errors::WebAuthnError;
use super::settings::{AttestationPolicy, WebAuthnSettings};
use super::types::{AttestationResponse, Ceremony, CeremonyKind, Credential};

const AAGUID_LEN: usize = 16;

const DER_BOOLEAN: u8 = 0x01;
const DER_OCTET_STRING: u8 = 0x04;
// [3] EXPLICIT Extensions in TBSCertificate
const DER_EXTENSIONS: u8 = 0xA3;
// 2.5.29.19
const OID_BASIC_CONSTRAINTS: &[u8] = &[0x55, 0x1D, 0x13];
// 1.3.6.1.4.1.45724.1.1.4 (id-fido-gen-ce-aaguid)
const OID_FIDO_AAGUID: &[u8] = &[
    0x2B, 0x06, 0x01, 0x04, 0x01, 0x82, 0xE5, 0x1C, 0x01, 0x01, 0x04,
];

/// Attestation evidence achieved by a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrustLevel {
    None,
    SelfAttested,
    Chain,
}

impl TrustLevel {
    fn required_by(policy: AttestationPolicy) -> Self {
        match policy {
            AttestationPolicy::None => Self::None,
            AttestationPolicy::SelfAttested => Self::SelfAttested,
            AttestationPolicy::FullChain => Self::Chain,
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::SelfAttested => f.write_str("self"),
            Self::Chain => f.write_str("chain"),
        }
    }
}

/// Verifies registration responses
pub struct AttestationVerifier {
    rp_id: String,
    allowed_origins: Vec<String>,
    policy: AttestationPolicy,
    require_user_verification: bool,
    trust_anchors: Vec<X509>,
}

impl AttestationVerifier {
    /// Build a verifier, loading trust anchors from the configured PEM files
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if a trust anchor file cannot be read or parsed
    pub fn new(settings: &WebAuthnSettings) -> Result<Self, WebAuthnError> {
        let mut anchors = Vec::new();
        for path in &settings.trust_anchors {
            anchors.extend(load_pem_certificates(Path::new(path))?);
        }
        if !anchors.is_empty() {
            log::info!("Loaded {} attestation trust anchor(s)", anchors.len());
        }
        Ok(Self::with_trust_anchors(settings, anchors))
    }

    #[must_use]
    pub fn with_trust_anchors(settings: &WebAuthnSettings, trust_anchors: Vec<X509>) -> Self {
        Self {
            rp_id: settings.rp_id.clone(),
            allowed_origins: settings.allowed_origins.clone(),
            policy: settings.attestation_policy,
            require_user_verification: settings.require_user_verification,
            trust_anchors,
        }
    }

    /// Verify a registration response for a consumed registration ceremony
    ///
    /// # Errors
    ///
    /// Returns the first failing check: client data errors, `RpIdMismatch`,
    /// user flag errors, `MalformedResponse`, `UnsupportedAlgorithm` or
    /// `AttestationRejected`
    pub fn verify(
        &self,
        ceremony: &Ceremony,
        response: &AttestationResponse,
        now: DateTime<Utc>,
    ) -> Result<Credential, WebAuthnError> {
        if ceremony.kind != CeremonyKind::Registration {
            return Err(WebAuthnError::CeremonyKindMismatch);
        }
        let owner = ceremony
            .identity
            .clone()
            .ok_or(WebAuthnError::CeremonyKindMismatch)?;

        verify_client_data(
            &response.client_data_json,
            CeremonyKind::Registration,
            ceremony.challenge.as_bytes(),
            &self.allowed_origins,
        )?;

        let object = AttestationObject::decode(&response.attestation_object)?;
        let auth_data = AuthenticatorData::parse(&object.auth_data)?;
        auth_data.verify_rp_id(&self.rp_id)?;
        auth_data.verify_user_flags(self.require_user_verification)?;

        let attested = auth_data.attested_credential.as_ref().ok_or_else(|| {
            WebAuthnError::MalformedResponse("missing attested credential data".to_string())
        })?;
        if attested.credential_id != response.credential_id {
            return Err(WebAuthnError::MalformedResponse(
                "credential id does not match attested credential data".to_string(),
            ));
        }
        let key = CosePublicKey::from_cbor(&attested.public_key)?;

        let mut signed = object.auth_data.clone();
        signed.extend_from_slice(&Sha256::digest(&response.client_data_json));

        let level = self.verify_statement(&object, &key, &attested.aaguid, &signed)?;
        let required = TrustLevel::required_by(self.policy);
        if level < required {
            return Err(WebAuthnError::AttestationRejected(format!(
                "attestation level {level} does not meet policy {}",
                self.policy
            )));
        }
        log::debug!("Attestation format {} verified at level {level}", object.fmt);

        Ok(Credential {
            credential_id: attested.credential_id.clone(),
            owner,
            user_handle: ceremony.user_handle.clone().unwrap_or_default(),
            public_key: attested.public_key.clone(),
            algorithm: key.algorithm(),
            signature_counter: auth_data.sign_count,
            attestation_format: object.fmt,
            created_at: now,
            last_used: None,
        })
    }

    fn verify_statement(
        &self,
        object: &AttestationObject,
        key: &CosePublicKey,
        aaguid: &[u8; AAGUID_LEN],
        signed: &[u8],
    ) -> Result<TrustLevel, WebAuthnError> {
        match object.fmt.as_str() {
            "none" => {
                if object.att_stmt.is_empty() {
                    Ok(TrustLevel::None)
                } else {
                    Err(rejected("none attestation carries a statement"))
                }
            }
            "packed" => self.verify_packed(object, key, aaguid, signed),
            other if self.policy == AttestationPolicy::None => {
                log::info!("Accepting unverified attestation format {other}");
                Ok(TrustLevel::None)
            }
            other => Err(rejected(&format!("unsupported attestation format {other}"))),
        }
    }

    fn verify_packed(
        &self,
        object: &AttestationObject,
        key: &CosePublicKey,
        aaguid: &[u8; AAGUID_LEN],
        signed: &[u8],
    ) -> Result<TrustLevel, WebAuthnError> {
        let alg = object
            .statement("alg")
            .and_then(as_i64)
            .ok_or_else(|| rejected("packed statement missing alg"))?;
        let sig = object
            .statement("sig")
            .and_then(Value::as_bytes)
            .ok_or_else(|| rejected("packed statement missing sig"))?;

        let Some(x5c) = object.statement("x5c") else {
            if alg != key.algorithm() {
                return Err(rejected("self attestation alg differs from credential key"));
            }
            key.verify(signed, sig)
                .map_err(|_| rejected("self attestation signature invalid"))?;
            return Ok(TrustLevel::SelfAttested);
        };

        let certificates = x5c
            .as_array()
            .ok_or_else(|| rejected("x5c is not an array"))?
            .iter()
            .map(|cert| {
                cert.as_bytes()
                    .ok_or_else(|| rejected("x5c entry is not a byte string"))
                    .and_then(|der| {
                        X509::from_der(der).map_err(|_| rejected("x5c entry is not a certificate"))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let Some((leaf, intermediates)) = certificates.split_first() else {
            return Err(rejected("x5c is empty"));
        };

        let leaf_key = leaf
            .public_key()
            .map_err(|_| rejected("attestation certificate has no usable key"))?;
        if !verify_with_certificate_key(&leaf_key, alg, signed, sig)? {
            return Err(rejected("attestation certificate signature invalid"));
        }
        verify_leaf_extensions(leaf, aaguid)?;

        if self.chain_verifies(leaf, intermediates) {
            Ok(TrustLevel::Chain)
        } else {
            log::debug!("Attestation chain does not reach a trust anchor");
            Ok(TrustLevel::SelfAttested)
        }
    }

    fn chain_verifies(&self, leaf: &X509, intermediates: &[X509]) -> bool {
        if self.trust_anchors.is_empty() {
            return false;
        }
        match build_and_verify_chain(&self.trust_anchors, leaf, intermediates) {
            Ok(verified) => verified,
            Err(e) => {
                log::warn!("Attestation chain verification error: {e}");
                false
            }
        }
    }
}

fn build_and_verify_chain(
    anchors: &[X509],
    leaf: &X509,
    intermediates: &[X509],
) -> Result<bool, ErrorStack> {
    let mut builder = X509StoreBuilder::new()?;
    for anchor in anchors {
        builder.add_cert(anchor.clone())?;
    }
    let store = builder.build();

    let mut chain = Stack::new()?;
    for cert in intermediates {
        chain.push(cert.clone())?;
    }

    let mut context = X509StoreContext::new()?;
    context.init(&store, leaf, &chain, |ctx| ctx.verify_cert())
}

fn verify_with_certificate_key(
    key: &PKey<Public>,
    alg: i64,
    message: &[u8],
    signature: &[u8],
) -> Result<bool, WebAuthnError> {
    let result = match (alg, key.id()) {
        (ALG_ES256, Id::EC) | (ALG_RS256, Id::RSA) => {
            Verifier::new(MessageDigest::sha256(), key).and_then(|mut verifier| {
                verifier.update(message)?;
                verifier.verify(signature)
            })
        }
        (ALG_EDDSA, Id::ED25519) => Verifier::new_without_digest(key)
            .and_then(|mut verifier| verifier.verify_oneshot(signature, message)),
        (ALG_ES256 | ALG_RS256 | ALG_EDDSA, _) => {
            return Err(rejected("attestation alg does not match certificate key"))
        }
        (other, _) => return Err(WebAuthnError::UnsupportedAlgorithm(other)),
    };
    // A malformed signature surfaces as an OpenSSL error rather than `false`
    Ok(result.unwrap_or(false))
}

/// Packed leaf requirements: not a CA, and a certified AAGUID, when present,
/// equal to the one in the authenticator data
fn verify_leaf_extensions(leaf: &X509, aaguid: &[u8; AAGUID_LEN]) -> Result<(), WebAuthnError> {
    let der = leaf
        .to_der()
        .map_err(|_| rejected("attestation certificate cannot be encoded"))?;
    let extensions = certificate_extensions(&der)
        .ok_or_else(|| rejected("attestation certificate extensions are malformed"))?;

    for (oid, value) in extensions {
        if oid == OID_BASIC_CONSTRAINTS {
            // BasicConstraints ::= SEQUENCE { cA BOOLEAN DEFAULT FALSE, ... }
            let (_, constraints, _) = der_element(value)
                .ok_or_else(|| rejected("attestation certificate constraints are malformed"))?;
            if let Some((DER_BOOLEAN, ca, _)) = der_element(constraints) {
                if ca.iter().any(|b| *b != 0) {
                    return Err(rejected("attestation certificate is a CA"));
                }
            }
        } else if oid == OID_FIDO_AAGUID {
            match der_element(value) {
                Some((DER_OCTET_STRING, certified, _)) if certified == aaguid.as_slice() => {}
                _ => {
                    return Err(rejected(
                        "attestation certificate AAGUID differs from authenticator data",
                    ))
                }
            }
        }
    }
    Ok(())
}

/// `(oid, value)` of every extension in a DER certificate
fn certificate_extensions(der: &[u8]) -> Option<Vec<(&[u8], &[u8])>> {
    let (_, certificate, _) = der_element(der)?;
    let (_, mut tbs, _) = der_element(certificate)?;
    while !tbs.is_empty() {
        let (tag, contents, rest) = der_element(tbs)?;
        tbs = rest;
        if tag != DER_EXTENSIONS {
            continue;
        }

        let (_, mut list, _) = der_element(contents)?;
        let mut extensions = Vec::new();
        while !list.is_empty() {
            let (_, extension, rest) = der_element(list)?;
            list = rest;
            let (_, oid, fields) = der_element(extension)?;
            let (mut tag, mut value, rest) = der_element(fields)?;
            if tag == DER_BOOLEAN {
                (tag, value, _) = der_element(rest)?;
            }
            if tag != DER_OCTET_STRING {
                return None;
            }
            extensions.push((oid, value));
        }
        return Some(extensions);
    }
    Some(Vec::new())
}

/// Split one DER element into `(tag, contents, rest)`
fn der_element(input: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, rest) = input.split_first()?;
    let (&first, rest) = rest.split_first()?;
    let (len, rest) = if first & 0x80 == 0 {
        (usize::from(first), rest)
    } else {
        let count = usize::from(first & 0x7F);
        if count == 0 || count > 4 || rest.len() < count {
            return None;
        }
        let (bytes, rest) = rest.split_at(count);
        let len = bytes
            .iter()
            .fold(0usize, |len, byte| (len << 8) | usize::from(*byte));
        (len, rest)
    };
    if rest.len() < len {
        return None;
    }
    let (contents, rest) = rest.split_at(len);
    Some((tag, contents, rest))
}

fn load_pem_certificates(path: &Path) -> Result<Vec<X509>, WebAuthnError> {
    let pem = std::fs::read(path).map_err(|e| {
        WebAuthnError::Configuration(format!(
            "cannot read trust anchor {}: {e}",
            path.display()
        ))
    })?;
    X509::stack_from_pem(&pem).map_err(|e| {
        WebAuthnError::Configuration(format!(
            "invalid trust anchor {}: {e}",
            path.display()
        ))
    })
}

fn rejected(message: &str) -> WebAuthnError {
    WebAuthnError::AttestationRejected(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        fixtures::{registration_ceremony, test_webauthn_settings, RP_ID},
        AttestationMode, LeafOptions, SoftAuthenticator, TestCa, AAGUID,
    };

    fn verifier(policy: AttestationPolicy, anchors: Vec<X509>) -> AttestationVerifier {
        let mut settings = test_webauthn_settings();
        settings.attestation_policy = policy;
        AttestationVerifier::with_trust_anchors(&settings, anchors)
    }

    #[test]
    fn test_none_attestation_produces_credential() {
        let ceremony = registration_ceremony("4321");
        let mut authenticator = SoftAuthenticator::es256();
        let response = authenticator
            .make_credential(ceremony.challenge.as_bytes(), &[1; 16])
            .unwrap();

        let credential = verifier(AttestationPolicy::None, vec![])
            .verify(&ceremony, &response, Utc::now())
            .unwrap();
        assert_eq!(credential.credential_id, authenticator.credential_id());
        assert_eq!(credential.owner.as_str(), "4321");
        assert_eq!(credential.algorithm, ALG_ES256);
        assert_eq!(credential.attestation_format, "none");
    }

    #[test]
    fn test_none_attestation_fails_self_policy() {
        let ceremony = registration_ceremony("4321");
        let mut authenticator = SoftAuthenticator::es256();
        let response = authenticator
            .make_credential(ceremony.challenge.as_bytes(), &[1; 16])
            .unwrap();

        let err = verifier(AttestationPolicy::SelfAttested, vec![])
            .verify(&ceremony, &response, Utc::now())
            .unwrap_err();
        assert!(matches!(err, WebAuthnError::AttestationRejected(_)));
    }

    #[test]
    fn test_packed_self_attestation_meets_self_policy() {
        let ceremony = registration_ceremony("4321");
        let mut authenticator =
            SoftAuthenticator::ed25519().with_attestation(AttestationMode::PackedSelf);
        let response = authenticator
            .make_credential(ceremony.challenge.as_bytes(), &[1; 16])
            .unwrap();

        let credential = verifier(AttestationPolicy::SelfAttested, vec![])
            .verify(&ceremony, &response, Utc::now())
            .unwrap();
        assert_eq!(credential.algorithm, ALG_EDDSA);
        assert_eq!(credential.attestation_format, "packed");
    }

    #[test]
    fn test_tampered_self_attestation_is_rejected_under_none_policy() {
        let ceremony = registration_ceremony("4321");
        let mut authenticator = SoftAuthenticator::es256()
            .with_attestation(AttestationMode::PackedSelf)
            .with_corrupt_attestation_signature();
        let response = authenticator
            .make_credential(ceremony.challenge.as_bytes(), &[1; 16])
            .unwrap();

        let err = verifier(AttestationPolicy::None, vec![])
            .verify(&ceremony, &response, Utc::now())
            .unwrap_err();
        assert!(matches!(err, WebAuthnError::AttestationRejected(_)));
    }

    #[test]
    fn test_x5c_chain_to_trust_anchor_meets_full_chain_policy() {
        let ca = TestCa::generate().unwrap();
        let ceremony = registration_ceremony("4321");
        let mut authenticator = SoftAuthenticator::es256()
            .with_attestation(AttestationMode::PackedX5c(ca.issue_attestation_leaf().unwrap()));
        let response = authenticator
            .make_credential(ceremony.challenge.as_bytes(), &[1; 16])
            .unwrap();

        let result = verifier(AttestationPolicy::FullChain, vec![ca.root.clone()])
            .verify(&ceremony, &response, Utc::now());
        assert!(result.is_ok(), "{result:?}");
    }

    #[test]
    fn test_x5c_without_matching_anchor_fails_full_chain_policy() {
        let ca = TestCa::generate().unwrap();
        let other = TestCa::generate().unwrap();
        let ceremony = registration_ceremony("4321");
        let mut authenticator = SoftAuthenticator::es256()
            .with_attestation(AttestationMode::PackedX5c(ca.issue_attestation_leaf().unwrap()));
        let response = authenticator
            .make_credential(ceremony.challenge.as_bytes(), &[1; 16])
            .unwrap();

        let err = verifier(AttestationPolicy::FullChain, vec![other.root.clone()])
            .verify(&ceremony, &response, Utc::now())
            .unwrap_err();
        assert!(matches!(err, WebAuthnError::AttestationRejected(_)));

        // The same statement still counts as signed evidence
        assert!(verifier(AttestationPolicy::SelfAttested, vec![other.root])
            .verify(&ceremony, &response, Utc::now())
            .is_ok());
    }

    fn register_with_leaf(ca: &TestCa, options: LeafOptions) -> Result<Credential, WebAuthnError> {
        let ceremony = registration_ceremony("4321");
        let mut authenticator = SoftAuthenticator::es256()
            .with_attestation(AttestationMode::PackedX5c(ca.issue_leaf(options).unwrap()));
        let response = authenticator
            .make_credential(ceremony.challenge.as_bytes(), &[1; 16])
            .unwrap();
        verifier(AttestationPolicy::FullChain, vec![ca.root.clone()]).verify(
            &ceremony,
            &response,
            Utc::now(),
        )
    }

    #[test]
    fn test_x5c_leaf_with_matching_aaguid_is_accepted() {
        let ca = TestCa::generate().unwrap();
        let options = LeafOptions {
            aaguid: Some(AAGUID),
            ..LeafOptions::default()
        };
        let result = register_with_leaf(&ca, options);
        assert!(result.is_ok(), "{result:?}");
    }

    #[test]
    fn test_x5c_leaf_with_other_aaguid_is_rejected() {
        let ca = TestCa::generate().unwrap();
        let options = LeafOptions {
            aaguid: Some([0x42; 16]),
            ..LeafOptions::default()
        };
        assert!(matches!(
            register_with_leaf(&ca, options),
            Err(WebAuthnError::AttestationRejected(_))
        ));
    }

    #[test]
    fn test_x5c_leaf_marked_as_ca_is_rejected() {
        let ca = TestCa::generate().unwrap();
        let options = LeafOptions {
            ca: true,
            ..LeafOptions::default()
        };
        assert!(matches!(
            register_with_leaf(&ca, options),
            Err(WebAuthnError::AttestationRejected(_))
        ));
    }

    #[test]
    fn test_statement_alg_must_match_certificate_key_type() {
        let ca = TestCa::generate().unwrap();
        let ec_key = ca.issue_attestation_leaf().unwrap().certificate.public_key().unwrap();

        for alg in [ALG_RS256, ALG_EDDSA] {
            assert!(matches!(
                verify_with_certificate_key(&ec_key, alg, b"message", &[0; 64]),
                Err(WebAuthnError::AttestationRejected(_))
            ));
        }
        assert!(!verify_with_certificate_key(&ec_key, ALG_ES256, b"message", &[0; 64]).unwrap());
    }

    #[test]
    fn test_wrong_challenge_is_rejected() {
        let ceremony = registration_ceremony("4321");
        let mut authenticator = SoftAuthenticator::es256();
        let response = authenticator.make_credential(&[0xEE; 32], &[1; 16]).unwrap();

        let err = verifier(AttestationPolicy::None, vec![])
            .verify(&ceremony, &response, Utc::now())
            .unwrap_err();
        assert_eq!(err, WebAuthnError::ChallengeMismatch);
    }

    #[test]
    fn test_wrong_rp_id_is_rejected() {
        let ceremony = registration_ceremony("4321");
        let mut authenticator = SoftAuthenticator::es256();
        authenticator.rp_id = "evil.example".to_string();
        let response = authenticator
            .make_credential(ceremony.challenge.as_bytes(), &[1; 16])
            .unwrap();

        let err = verifier(AttestationPolicy::None, vec![])
            .verify(&ceremony, &response, Utc::now())
            .unwrap_err();
        assert_eq!(err, WebAuthnError::RpIdMismatch);
        assert_ne!(RP_ID, "evil.example");
    }

    #[test]
    fn test_reported_credential_id_must_match_attested_id() {
        let ceremony = registration_ceremony("4321");
        let mut authenticator = SoftAuthenticator::es256();
        let mut response = authenticator
            .make_credential(ceremony.challenge.as_bytes(), &[1; 16])
            .unwrap();
        response.credential_id = vec![0; 16];

        let err = verifier(AttestationPolicy::None, vec![])
            .verify(&ceremony, &response, Utc::now())
            .unwrap_err();
        assert!(matches!(err, WebAuthnError::MalformedResponse(_)));
    }

    #[test]
    fn test_trust_anchors_load_from_pem_files() {
        let ca = TestCa::generate().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("root.pem");
        std::fs::write(&path, ca.root_pem().unwrap()).unwrap();

        let mut settings = test_webauthn_settings();
        settings.attestation_policy = AttestationPolicy::FullChain;
        settings.trust_anchors = vec![path.display().to_string()];
        let verifier = AttestationVerifier::new(&settings).unwrap();
        assert_eq!(verifier.trust_anchors.len(), 1);

        let ceremony = registration_ceremony("4321");
        let mut authenticator = SoftAuthenticator::es256()
            .with_attestation(AttestationMode::PackedX5c(ca.issue_attestation_leaf().unwrap()));
        let response = authenticator
            .make_credential(ceremony.challenge.as_bytes(), &[1; 16])
            .unwrap();
        assert!(verifier.verify(&ceremony, &response, Utc::now()).is_ok());

        settings.trust_anchors = vec![dir.path().join("missing.pem").display().to_string()];
        assert!(matches!(
            AttestationVerifier::new(&settings),
            Err(WebAuthnError::Configuration(_))
        ));
    }
}
