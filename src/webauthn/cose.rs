//! COSE public keys and signature verification
//!
//! Supports the algorithms the kiosk offers at registration: ES256
//! (ECDSA P-256 with SHA-256), `EdDSA` (Ed25519) and RS256 (RSASSA-PKCS1-v1_5
//! with SHA-256). Verification goes through `ring`.

use ciborium::value::Value;
use ring::signature::{self, RsaPublicKeyComponents, UnparsedPublicKey};

use super::cbor::{as_i64, int_entry};
use super::errors::WebAuthnError;

pub const ALG_ES256: i64 = -7;
pub const ALG_EDDSA: i64 = -8;
pub const ALG_RS256: i64 = -257;

/// Algorithms offered to authenticators, in preference order
pub const SUPPORTED_ALGORITHMS: [i64; 3] = [ALG_ES256, ALG_EDDSA, ALG_RS256];

const KTY_OKP: i64 = 1;
const KTY_EC2: i64 = 2;
const KTY_RSA: i64 = 3;
const CRV_P256: i64 = 1;
const CRV_ED25519: i64 = 6;

const LABEL_KTY: i64 = 1;
const LABEL_ALG: i64 = 3;
const LABEL_CRV_OR_N: i64 = -1;
const LABEL_X_OR_E: i64 = -2;
const LABEL_Y: i64 = -3;

/// Decoded credential public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CosePublicKey {
    /// Uncompressed SEC1 point (`0x04 || x || y`)
    Es256 { point: Vec<u8> },
    Ed25519 { key: Vec<u8> },
    Rs256 { n: Vec<u8>, e: Vec<u8> },
}

impl CosePublicKey {
    /// Decode a COSE_Key CBOR map
    ///
    /// # Errors
    ///
    /// Returns `MalformedResponse` for invalid keys and
    /// `UnsupportedAlgorithm` for algorithms outside the supported set
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, WebAuthnError> {
        let value: Value = ciborium::de::from_reader(bytes)
            .map_err(|_| malformed("invalid COSE key CBOR"))?;
        let Some(map) = value.as_map() else {
            return Err(malformed("COSE key is not a map"));
        };

        let kty = int_entry(map, LABEL_KTY)
            .and_then(as_i64)
            .ok_or_else(|| malformed("COSE key missing kty"))?;
        let alg = int_entry(map, LABEL_ALG)
            .and_then(as_i64)
            .ok_or_else(|| malformed("COSE key missing alg"))?;

        match (kty, alg) {
            (KTY_EC2, ALG_ES256) => {
                expect_curve(map, CRV_P256)?;
                let x = fixed_bytes(map, LABEL_X_OR_E, 32, "x")?;
                let y = fixed_bytes(map, LABEL_Y, 32, "y")?;
                let mut point = Vec::with_capacity(65);
                point.push(0x04);
                point.extend_from_slice(x);
                point.extend_from_slice(y);
                Ok(Self::Es256 { point })
            }
            (KTY_OKP, ALG_EDDSA) => {
                expect_curve(map, CRV_ED25519)?;
                let key = fixed_bytes(map, LABEL_X_OR_E, 32, "x")?;
                Ok(Self::Ed25519 { key: key.to_vec() })
            }
            (KTY_RSA, ALG_RS256) => {
                let n = byte_entry(map, LABEL_CRV_OR_N, "n")?;
                let e = byte_entry(map, LABEL_X_OR_E, "e")?;
                Ok(Self::Rs256 {
                    n: n.to_vec(),
                    e: e.to_vec(),
                })
            }
            (KTY_EC2 | KTY_OKP | KTY_RSA, other) => Err(WebAuthnError::UnsupportedAlgorithm(other)),
            (other, _) => Err(malformed(&format!("unsupported COSE key type {other}"))),
        }
    }

    /// COSE algorithm identifier of this key
    #[must_use]
    pub fn algorithm(&self) -> i64 {
        match self {
            Self::Es256 { .. } => ALG_ES256,
            Self::Ed25519 { .. } => ALG_EDDSA,
            Self::Rs256 { .. } => ALG_RS256,
        }
    }

    /// Verify `signature` over `message`
    ///
    /// # Errors
    ///
    /// Returns `SignatureInvalid` if verification fails
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), WebAuthnError> {
        let result = match self {
            Self::Es256 { point } => {
                UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_ASN1, point)
                    .verify(message, signature)
            }
            Self::Ed25519 { key } => {
                UnparsedPublicKey::new(&signature::ED25519, key).verify(message, signature)
            }
            Self::Rs256 { n, e } => RsaPublicKeyComponents { n, e }.verify(
                &signature::RSA_PKCS1_2048_8192_SHA256,
                message,
                signature,
            ),
        };
        result.map_err(|_| WebAuthnError::SignatureInvalid)
    }
}

fn expect_curve(map: &[(Value, Value)], expected: i64) -> Result<(), WebAuthnError> {
    match int_entry(map, LABEL_CRV_OR_N).and_then(as_i64) {
        Some(crv) if crv == expected => Ok(()),
        Some(crv) => Err(malformed(&format!("unsupported COSE curve {crv}"))),
        None => Err(malformed("COSE key missing crv")),
    }
}

fn byte_entry<'a>(
    map: &'a [(Value, Value)],
    label: i64,
    name: &str,
) -> Result<&'a [u8], WebAuthnError> {
    int_entry(map, label)
        .and_then(Value::as_bytes)
        .map(Vec::as_slice)
        .ok_or_else(|| malformed(&format!("COSE key missing {name}")))
}

fn fixed_bytes<'a>(
    map: &'a [(Value, Value)],
    label: i64,
    len: usize,
    name: &str,
) -> Result<&'a [u8], WebAuthnError> {
    let bytes = byte_entry(map, label, name)?;
    if bytes.len() == len {
        Ok(bytes)
    } else {
        Err(malformed(&format!("COSE key {name} has length {}", bytes.len())))
    }
}

fn malformed(message: &str) -> WebAuthnError {
    WebAuthnError::MalformedResponse(message.to_string())
}
