//! Software authenticator
//!
//! Produces real attestation objects and assertions with `ring` keys so the
//! verifiers can be exercised end to end without a browser.

use anyhow::{anyhow, Result};
use ciborium::value::Value;
use openssl::hash::MessageDigest;
use openssl::sign::Signer;
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{
    EcdsaKeyPair, Ed25519KeyPair, KeyPair, ECDSA_P256_SHA256_ASN1_SIGNING,
};
use serde_json::json;
use sha2::{Digest, Sha256};

use super::ca::AttestationCert;
use super::constants::{ORIGIN, RP_ID};
use crate::utils::encoding;
use crate::webauthn::authenticator_data::{
    rp_id_hash, FLAG_ATTESTED_CREDENTIAL_DATA, FLAG_USER_PRESENT, FLAG_USER_VERIFIED,
};
use crate::webauthn::cose::{ALG_EDDSA, ALG_ES256};
use crate::webauthn::{AssertionResponse, AttestationResponse};

/// AAGUID the software authenticator reports
pub const AAGUID: [u8; 16] = *b"kioskpass-testAA";

/// Attestation statement the authenticator emits at registration
pub enum AttestationMode {
    None,
    /// `packed` signed by the credential key itself
    PackedSelf,
    /// `packed` signed by an attestation certificate
    PackedX5c(AttestationCert),
}

enum SigningKey {
    Es256(EcdsaKeyPair),
    Ed25519(Ed25519KeyPair),
}

pub struct SoftAuthenticator {
    pub rp_id: String,
    pub origin: String,
    /// Replaces the `type` member of client data when set
    pub client_data_type: Option<String>,
    pub user_present: bool,
    pub user_verified: bool,
    /// Last counter value reported
    pub counter: u32,
    counter_step: u32,
    key: SigningKey,
    credential_id: Vec<u8>,
    user_handle: Vec<u8>,
    attestation: AttestationMode,
    corrupt_attestation_signature: bool,
    rng: SystemRandom,
}

impl SoftAuthenticator {
    /// ECDSA P-256 authenticator
    #[must_use]
    pub fn es256() -> Self {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
            .expect("generate P-256 key");
        let pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8.as_ref(), &rng)
            .expect("load P-256 key");
        Self::with_key(SigningKey::Es256(pair), rng)
    }

    /// Ed25519 authenticator
    #[must_use]
    pub fn ed25519() -> Self {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).expect("generate Ed25519 key");
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).expect("load Ed25519 key");
        Self::with_key(SigningKey::Ed25519(pair), rng)
    }

    fn with_key(key: SigningKey, rng: SystemRandom) -> Self {
        let mut credential_id = vec![0u8; 16];
        rng.fill(&mut credential_id).expect("random credential id");
        Self {
            rp_id: RP_ID.to_string(),
            origin: ORIGIN.to_string(),
            client_data_type: None,
            user_present: true,
            user_verified: true,
            counter: 0,
            counter_step: 1,
            key,
            credential_id,
            user_handle: Vec::new(),
            attestation: AttestationMode::None,
            corrupt_attestation_signature: false,
            rng,
        }
    }

    #[must_use]
    pub fn with_attestation(mut self, mode: AttestationMode) -> Self {
        self.attestation = mode;
        self
    }

    /// Amount the counter grows per operation; 0 models a non-counting device
    #[must_use]
    pub fn with_counter_step(mut self, step: u32) -> Self {
        self.counter_step = step;
        self
    }

    #[must_use]
    pub fn with_corrupt_attestation_signature(mut self) -> Self {
        self.corrupt_attestation_signature = true;
        self
    }

    #[must_use]
    pub fn credential_id(&self) -> &[u8] {
        &self.credential_id
    }

    #[must_use]
    pub fn algorithm(&self) -> i64 {
        match self.key {
            SigningKey::Es256(_) => ALG_ES256,
            SigningKey::Ed25519(_) => ALG_EDDSA,
        }
    }

    /// Answer registration options
    ///
    /// # Errors
    ///
    /// Returns an error if signing or encoding fails
    pub fn make_credential(
        &mut self,
        challenge: &[u8],
        user_handle: &[u8],
    ) -> Result<AttestationResponse> {
        self.user_handle = user_handle.to_vec();
        self.counter += self.counter_step;

        let client_data_json = self.client_data("webauthn.create", challenge);
        let mut auth_data = self.header(FLAG_ATTESTED_CREDENTIAL_DATA);
        auth_data.extend_from_slice(&AAGUID);
        let id_len = u16::try_from(self.credential_id.len())?;
        auth_data.extend_from_slice(&id_len.to_be_bytes());
        auth_data.extend_from_slice(&self.credential_id);
        auth_data.extend_from_slice(&self.cose_key()?);

        let signed = signed_data(&auth_data, &client_data_json);
        let (fmt, mut statement) = match &self.attestation {
            AttestationMode::None => ("none", Vec::new()),
            AttestationMode::PackedSelf => {
                let sig = self.sign(&signed)?;
                ("packed", vec![
                    (text("alg"), int(self.algorithm())),
                    (text("sig"), Value::Bytes(sig)),
                ])
            }
            AttestationMode::PackedX5c(cert) => {
                let mut signer = Signer::new(MessageDigest::sha256(), &cert.key)?;
                signer.update(&signed)?;
                let sig = signer.sign_to_vec()?;
                ("packed", vec![
                    (text("alg"), int(ALG_ES256)),
                    (text("sig"), Value::Bytes(sig)),
                    (
                        text("x5c"),
                        Value::Array(vec![Value::Bytes(cert.certificate.to_der()?)]),
                    ),
                ])
            }
        };
        if self.corrupt_attestation_signature {
            for (key, value) in &mut statement {
                if key.as_text() == Some("sig") {
                    if let Value::Bytes(sig) = value {
                        if let Some(last) = sig.last_mut() {
                            *last ^= 0xFF;
                        }
                    }
                }
            }
        }

        let object = Value::Map(vec![
            (text("fmt"), text(fmt)),
            (text("attStmt"), Value::Map(statement)),
            (text("authData"), Value::Bytes(auth_data)),
        ]);
        let mut attestation_object = Vec::new();
        ciborium::into_writer(&object, &mut attestation_object)?;

        Ok(AttestationResponse {
            credential_id: self.credential_id.clone(),
            client_data_json,
            attestation_object,
        })
    }

    /// Answer authentication options, advancing the counter
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails
    pub fn get_assertion(&mut self, challenge: &[u8]) -> Result<AssertionResponse> {
        self.counter += self.counter_step;
        let client_data_json = self.client_data("webauthn.get", challenge);
        let authenticator_data = self.header(0);
        let signature = self.sign(&signed_data(&authenticator_data, &client_data_json))?;

        Ok(AssertionResponse {
            credential_id: self.credential_id.clone(),
            client_data_json,
            authenticator_data,
            signature,
            user_handle: Some(self.user_handle.clone()),
        })
    }

    fn client_data(&self, default_type: &str, challenge: &[u8]) -> Vec<u8> {
        json!({
            "type": self.client_data_type.as_deref().unwrap_or(default_type),
            "challenge": encoding::encode(challenge),
            "origin": self.origin,
            "crossOrigin": false
        })
        .to_string()
        .into_bytes()
    }

    fn header(&self, extra_flags: u8) -> Vec<u8> {
        let mut flags = extra_flags;
        if self.user_present {
            flags |= FLAG_USER_PRESENT;
        }
        if self.user_verified {
            flags |= FLAG_USER_VERIFIED;
        }
        let mut data = rp_id_hash(&self.rp_id).to_vec();
        data.push(flags);
        data.extend_from_slice(&self.counter.to_be_bytes());
        data
    }

    fn cose_key(&self) -> Result<Vec<u8>> {
        let map = match &self.key {
            SigningKey::Es256(pair) => {
                let point = pair.public_key().as_ref();
                vec![
                    (int(1), int(2)),
                    (int(3), int(ALG_ES256)),
                    (int(-1), int(1)),
                    (int(-2), Value::Bytes(point[1..33].to_vec())),
                    (int(-3), Value::Bytes(point[33..65].to_vec())),
                ]
            }
            SigningKey::Ed25519(pair) => vec![
                (int(1), int(1)),
                (int(3), int(ALG_EDDSA)),
                (int(-1), int(6)),
                (int(-2), Value::Bytes(pair.public_key().as_ref().to_vec())),
            ],
        };
        let mut out = Vec::new();
        ciborium::into_writer(&Value::Map(map), &mut out)?;
        Ok(out)
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        match &self.key {
            SigningKey::Es256(pair) => pair
                .sign(&self.rng, message)
                .map(|sig| sig.as_ref().to_vec())
                .map_err(|_| anyhow!("ECDSA signing failed")),
            SigningKey::Ed25519(pair) => Ok(pair.sign(message).as_ref().to_vec()),
        }
    }
}

fn signed_data(auth_data: &[u8], client_data_json: &[u8]) -> Vec<u8> {
    let mut signed = auth_data.to_vec();
    signed.extend_from_slice(&Sha256::digest(client_data_json));
    signed
}

fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

fn int(value: i64) -> Value {
    Value::Integer(value.into())
}
