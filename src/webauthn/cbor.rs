//! CBOR processing for `WebAuthn`
//!
//! Decodes the attestation object and provides lookup helpers for the CBOR
//! maps used by attestation statements and COSE keys.

use ciborium::de::from_reader;
use ciborium::value::Value;

use super::errors::WebAuthnError;

/// Decoded attestation object (`fmt`, `attStmt`, `authData`)
#[derive(Debug, Clone)]
pub struct AttestationObject {
    pub fmt: String,
    pub att_stmt: Vec<(Value, Value)>,
    pub auth_data: Vec<u8>,
}

impl AttestationObject {
    /// Decode the CBOR attestation object produced by the authenticator
    ///
    /// # Errors
    ///
    /// Returns `MalformedResponse` if the CBOR is invalid or a member is
    /// missing or has the wrong type
    pub fn decode(bytes: &[u8]) -> Result<Self, WebAuthnError> {
        let value: Value = from_reader(bytes)
            .map_err(|_| malformed("invalid CBOR attestation object"))?;

        let Some(map) = value.as_map() else {
            return Err(malformed("attestation object is not a map"));
        };

        let fmt = text_entry(map, "fmt")
            .and_then(Value::as_text)
            .ok_or_else(|| malformed("missing fmt in attestation object"))?
            .to_string();

        let att_stmt = text_entry(map, "attStmt")
            .and_then(Value::as_map)
            .cloned()
            .ok_or_else(|| malformed("missing attStmt in attestation object"))?;

        let auth_data = text_entry(map, "authData")
            .and_then(Value::as_bytes)
            .cloned()
            .ok_or_else(|| malformed("missing authData in attestation object"))?;

        Ok(Self {
            fmt,
            att_stmt,
            auth_data,
        })
    }

    /// Look up a member of the attestation statement
    #[must_use]
    pub fn statement(&self, key: &str) -> Option<&Value> {
        text_entry(&self.att_stmt, key)
    }
}

/// Find a value by text key
#[must_use]
pub fn text_entry<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .map(|(_, v)| v)
}

/// Find a value by integer label (COSE style)
#[must_use]
pub fn int_entry(map: &[(Value, Value)], label: i64) -> Option<&Value> {
    map.iter()
        .find(|(k, _)| k.as_integer().map(i128::from) == Some(i128::from(label)))
        .map(|(_, v)| v)
}

/// Read an integer value as `i64`
#[must_use]
pub fn as_i64(value: &Value) -> Option<i64> {
    value
        .as_integer()
        .and_then(|int| i64::try_from(i128::from(int)).ok())
}

fn malformed(message: &str) -> WebAuthnError {
    WebAuthnError::MalformedResponse(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &Value) -> Vec<u8> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_decode_none_attestation_object() {
        let object = Value::Map(vec![
            (Value::Text("fmt".into()), Value::Text("none".into())),
            (Value::Text("attStmt".into()), Value::Map(vec![])),
            (Value::Text("authData".into()), Value::Bytes(vec![1, 2, 3])),
        ]);
        let decoded = AttestationObject::decode(&encode(&object)).unwrap();
        assert_eq!(decoded.fmt, "none");
        assert!(decoded.att_stmt.is_empty());
        assert_eq!(decoded.auth_data, vec![1, 2, 3]);
    }

    #[test]
    fn test_decode_rejects_missing_auth_data() {
        let object = Value::Map(vec![
            (Value::Text("fmt".into()), Value::Text("none".into())),
            (Value::Text("attStmt".into()), Value::Map(vec![])),
        ]);
        let err = AttestationObject::decode(&encode(&object)).unwrap_err();
        assert!(matches!(err, WebAuthnError::MalformedResponse(_)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(AttestationObject::decode(&[0xFF, 0x00, 0x13]).is_err());
    }

    #[test]
    fn test_int_entry_matches_negative_labels() {
        let map = vec![
            (Value::Integer(1.into()), Value::Integer(2.into())),
            (Value::Integer((-1).into()), Value::Integer(1.into())),
        ];
        assert_eq!(int_entry(&map, -1).and_then(as_i64), Some(1));
        assert_eq!(int_entry(&map, 1).and_then(as_i64), Some(2));
        assert!(int_entry(&map, 3).is_none());
    }
}
