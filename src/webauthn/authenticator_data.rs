//! Authenticator data parsing
//!
//! Layout:
//! - 32 bytes: RP ID hash
//! - 1 byte: flags
//! - 4 bytes: signature counter (big endian)
//! - attested credential data, if the AT flag is set:
//!   - 16 bytes: AAGUID
//!   - 2 bytes: credential ID length (L)
//!   - L bytes: credential ID
//!   - variable: COSE public key
//! - extensions (CBOR), if the ED flag is set

use ciborium::value::Value;
use sha2::{Digest, Sha256};
use std::io::Cursor;

use super::errors::WebAuthnError;

pub const FLAG_USER_PRESENT: u8 = 0x01;
pub const FLAG_USER_VERIFIED: u8 = 0x04;
pub const FLAG_ATTESTED_CREDENTIAL_DATA: u8 = 0x40;
pub const FLAG_EXTENSION_DATA: u8 = 0x80;

const RP_ID_HASH_LEN: usize = 32;
const HEADER_LEN: usize = 37;
const AAGUID_LEN: usize = 16;

/// Parsed authenticator data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatorData {
    pub rp_id_hash: [u8; RP_ID_HASH_LEN],
    pub flags: u8,
    pub sign_count: u32,
    pub attested_credential: Option<AttestedCredentialData>,
}

/// Credential material present only in registration authenticator data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestedCredentialData {
    pub aaguid: [u8; AAGUID_LEN],
    pub credential_id: Vec<u8>,
    /// Raw COSE key bytes as they appear in the authenticator data
    pub public_key: Vec<u8>,
}

impl AuthenticatorData {
    /// Parse authenticator data bytes
    ///
    /// # Errors
    ///
    /// Returns `MalformedResponse` on truncated or inconsistent data
    pub fn parse(bytes: &[u8]) -> Result<Self, WebAuthnError> {
        if bytes.len() < HEADER_LEN {
            return Err(malformed("authenticator data too short"));
        }

        let mut rp_id_hash = [0u8; RP_ID_HASH_LEN];
        rp_id_hash.copy_from_slice(&bytes[..RP_ID_HASH_LEN]);
        let flags = bytes[32];
        let sign_count = u32::from_be_bytes([bytes[33], bytes[34], bytes[35], bytes[36]]);

        let mut pos = HEADER_LEN;
        let attested_credential = if flags & FLAG_ATTESTED_CREDENTIAL_DATA == 0 {
            None
        } else {
            let (data, consumed) = parse_attested_credential(&bytes[pos..])?;
            pos += consumed;
            Some(data)
        };

        if flags & FLAG_EXTENSION_DATA == 0 {
            if pos != bytes.len() {
                return Err(malformed("trailing bytes after authenticator data"));
            }
        } else {
            let remaining = &bytes[pos..];
            let mut cursor = Cursor::new(remaining);
            let _extensions: Value = ciborium::de::from_reader(&mut cursor)
                .map_err(|_| malformed("invalid extension data"))?;
            if usize::try_from(cursor.position()).ok() != Some(remaining.len()) {
                return Err(malformed("trailing bytes after extension data"));
            }
        }

        Ok(Self {
            rp_id_hash,
            flags,
            sign_count,
            attested_credential,
        })
    }

    #[must_use]
    pub fn user_present(&self) -> bool {
        self.flags & FLAG_USER_PRESENT != 0
    }

    #[must_use]
    pub fn user_verified(&self) -> bool {
        self.flags & FLAG_USER_VERIFIED != 0
    }

    /// Check that the data was produced for `rp_id`
    ///
    /// # Errors
    ///
    /// Returns `RpIdMismatch` if the hash differs
    pub fn verify_rp_id(&self, rp_id: &str) -> Result<(), WebAuthnError> {
        if self.rp_id_hash == rp_id_hash(rp_id) {
            Ok(())
        } else {
            Err(WebAuthnError::RpIdMismatch)
        }
    }

    /// Check the user presence flag and, if required, user verification
    ///
    /// # Errors
    ///
    /// Returns `UserPresenceMissing` or `UserVerificationMissing`
    pub fn verify_user_flags(&self, require_user_verification: bool) -> Result<(), WebAuthnError> {
        if !self.user_present() {
            return Err(WebAuthnError::UserPresenceMissing);
        }
        if require_user_verification && !self.user_verified() {
            return Err(WebAuthnError::UserVerificationMissing);
        }
        Ok(())
    }
}

/// SHA-256 of the relying party id
#[must_use]
pub fn rp_id_hash(rp_id: &str) -> [u8; RP_ID_HASH_LEN] {
    Sha256::digest(rp_id.as_bytes()).into()
}

fn parse_attested_credential(
    bytes: &[u8],
) -> Result<(AttestedCredentialData, usize), WebAuthnError> {
    if bytes.len() < AAGUID_LEN + 2 {
        return Err(malformed("authenticator data too short for credential ID length"));
    }

    let mut aaguid = [0u8; AAGUID_LEN];
    aaguid.copy_from_slice(&bytes[..AAGUID_LEN]);
    let mut pos = AAGUID_LEN;

    let id_len = usize::from(u16::from_be_bytes([bytes[pos], bytes[pos + 1]]));
    pos += 2;

    if bytes.len() < pos + id_len {
        return Err(malformed("authenticator data too short for credential ID"));
    }
    let credential_id = bytes[pos..pos + id_len].to_vec();
    pos += id_len;

    if bytes.len() <= pos {
        return Err(malformed("authenticator data too short for public key"));
    }

    // The COSE key has no length prefix; decode one CBOR item to find its end.
    let mut cursor = Cursor::new(&bytes[pos..]);
    let _key: Value = ciborium::de::from_reader(&mut cursor)
        .map_err(|_| malformed("invalid COSE public key"))?;
    let key_len = usize::try_from(cursor.position())
        .map_err(|_| malformed("COSE public key too large"))?;
    let public_key = bytes[pos..pos + key_len].to_vec();
    pos += key_len;

    Ok((
        AttestedCredentialData {
            aaguid,
            credential_id,
            public_key,
        },
        pos,
    ))
}

fn malformed(message: &str) -> WebAuthnError {
    WebAuthnError::MalformedResponse(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cose_key() -> Vec<u8> {
        let map = Value::Map(vec![
            (Value::Integer(1.into()), Value::Integer(2.into())),
            (Value::Integer(3.into()), Value::Integer((-7).into())),
            (Value::Integer((-1).into()), Value::Integer(1.into())),
            (Value::Integer((-2).into()), Value::Bytes(vec![1; 32])),
            (Value::Integer((-3).into()), Value::Bytes(vec![2; 32])),
        ]);
        let mut buf = Vec::new();
        ciborium::into_writer(&map, &mut buf).unwrap();
        buf
    }

    fn header(rp_id: &str, flags: u8, counter: u32) -> Vec<u8> {
        let mut data = rp_id_hash(rp_id).to_vec();
        data.push(flags);
        data.extend_from_slice(&counter.to_be_bytes());
        data
    }

    #[test]
    fn test_parse_assertion_data() {
        let bytes = header("kiosk.example", FLAG_USER_PRESENT, 42);
        let parsed = AuthenticatorData::parse(&bytes).unwrap();
        assert_eq!(parsed.sign_count, 42);
        assert!(parsed.user_present());
        assert!(!parsed.user_verified());
        assert!(parsed.attested_credential.is_none());
        assert!(parsed.verify_rp_id("kiosk.example").is_ok());
        assert_eq!(
            parsed.verify_rp_id("other.example").unwrap_err(),
            WebAuthnError::RpIdMismatch
        );
    }

    #[test]
    fn test_parse_attested_credential_data() {
        let key = cose_key();
        let mut bytes = header(
            "kiosk.example",
            FLAG_USER_PRESENT | FLAG_ATTESTED_CREDENTIAL_DATA,
            0,
        );
        bytes.extend_from_slice(&[9; 16]);
        bytes.extend_from_slice(&4u16.to_be_bytes());
        bytes.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
        bytes.extend_from_slice(&key);

        let parsed = AuthenticatorData::parse(&bytes).unwrap();
        let attested = parsed.attested_credential.unwrap();
        assert_eq!(attested.aaguid, [9; 16]);
        assert_eq!(attested.credential_id, vec![0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(attested.public_key, key);
    }

    #[test]
    fn test_truncated_credential_id_is_rejected() {
        let mut bytes = header(
            "kiosk.example",
            FLAG_USER_PRESENT | FLAG_ATTESTED_CREDENTIAL_DATA,
            0,
        );
        bytes.extend_from_slice(&[0; 16]);
        bytes.extend_from_slice(&64u16.to_be_bytes());
        bytes.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(
            AuthenticatorData::parse(&bytes).unwrap_err(),
            WebAuthnError::MalformedResponse(_)
        ));
    }

    #[test]
    fn test_short_data_is_rejected() {
        assert!(AuthenticatorData::parse(&[0; 36]).is_err());
    }

    #[test]
    fn test_trailing_bytes_without_extension_flag_are_rejected() {
        let mut bytes = header("kiosk.example", FLAG_USER_PRESENT, 1);
        bytes.push(0);
        assert!(AuthenticatorData::parse(&bytes).is_err());
    }

    #[test]
    fn test_trailing_bytes_after_extensions_are_rejected() {
        let mut extensions = Vec::new();
        let map = Value::Map(vec![(Value::Text("credProtect".into()), Value::Integer(1.into()))]);
        ciborium::into_writer(&map, &mut extensions).unwrap();

        let mut bytes = header("kiosk.example", FLAG_USER_PRESENT | FLAG_EXTENSION_DATA, 1);
        bytes.extend_from_slice(&extensions);
        assert!(AuthenticatorData::parse(&bytes).is_ok());

        bytes.push(0);
        assert!(matches!(
            AuthenticatorData::parse(&bytes).unwrap_err(),
            WebAuthnError::MalformedResponse(_)
        ));
    }

    #[test]
    fn test_user_flag_checks() {
        let present = AuthenticatorData::parse(&header("a", FLAG_USER_PRESENT, 0)).unwrap();
        assert!(present.verify_user_flags(false).is_ok());
        assert_eq!(
            present.verify_user_flags(true).unwrap_err(),
            WebAuthnError::UserVerificationMissing
        );

        let absent = AuthenticatorData::parse(&header("a", 0, 0)).unwrap();
        assert_eq!(
            absent.verify_user_flags(false).unwrap_err(),
            WebAuthnError::UserPresenceMissing
        );
    }
}
