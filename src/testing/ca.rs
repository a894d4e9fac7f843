//! Throwaway attestation certificate authority
//!
//! Mints a self-signed root and P-256 attestation leaves for exercising the
//! `x5c` path of packed attestation.

use openssl::asn1::{Asn1Object, Asn1OctetString, Asn1Time};
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Builder, X509Extension, X509Name, X509NameBuilder, X509};

const OID_FIDO_AAGUID: &str = "1.3.6.1.4.1.45724.1.1.4";

/// Attestation certificate and its signing key
pub struct AttestationCert {
    pub certificate: X509,
    pub key: PKey<Private>,
}

/// Variations on the default attestation leaf
#[derive(Debug, Default, Clone, Copy)]
pub struct LeafOptions {
    /// Mark the leaf as a CA, which packed attestation forbids
    pub ca: bool,
    /// Certify this AAGUID in the FIDO extension
    pub aaguid: Option<[u8; 16]>,
}

pub struct TestCa {
    pub root: X509,
    key: PKey<Private>,
    next_serial: std::cell::Cell<u32>,
}

impl TestCa {
    /// # Errors
    ///
    /// Returns an error if OpenSSL fails to build the certificate
    pub fn generate() -> Result<Self, ErrorStack> {
        let key = p256_key()?;
        let name = common_name("Kioskpass Test Attestation Root")?;

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        builder.set_serial_number(&*BigNum::from_u32(1)?.to_asn1_integer()?)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&key)?;
        builder.set_not_before(&*Asn1Time::days_from_now(0)?)?;
        builder.set_not_after(&*Asn1Time::days_from_now(365)?)?;
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build()?)?;
        builder.sign(&key, MessageDigest::sha256())?;

        Ok(Self {
            root: builder.build(),
            key,
            next_serial: std::cell::Cell::new(2),
        })
    }

    /// Root certificate in PEM form, as a trust anchor file would hold it
    ///
    /// # Errors
    ///
    /// Returns an error if PEM encoding fails
    pub fn root_pem(&self) -> Result<Vec<u8>, ErrorStack> {
        self.root.to_pem()
    }

    /// Issue a leaf certificate for an authenticator model
    ///
    /// # Errors
    ///
    /// Returns an error if OpenSSL fails to build the certificate
    pub fn issue_attestation_leaf(&self) -> Result<AttestationCert, ErrorStack> {
        self.issue_leaf(LeafOptions::default())
    }

    /// Issue a leaf certificate with non-default extensions
    ///
    /// # Errors
    ///
    /// Returns an error if OpenSSL fails to build the certificate
    pub fn issue_leaf(&self, options: LeafOptions) -> Result<AttestationCert, ErrorStack> {
        let key = p256_key()?;
        let serial = self.next_serial.get();
        self.next_serial.set(serial + 1);

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        builder.set_serial_number(&*BigNum::from_u32(serial)?.to_asn1_integer()?)?;
        builder.set_subject_name(&*common_name("Kioskpass Test Authenticator")?)?;
        builder.set_issuer_name(self.root.subject_name())?;
        builder.set_pubkey(&key)?;
        builder.set_not_before(&*Asn1Time::days_from_now(0)?)?;
        builder.set_not_after(&*Asn1Time::days_from_now(30)?)?;
        let mut constraints = BasicConstraints::new();
        constraints.critical();
        if options.ca {
            constraints.ca();
        }
        builder.append_extension(constraints.build()?)?;
        builder.append_extension(KeyUsage::new().critical().digital_signature().build()?)?;
        if let Some(aaguid) = options.aaguid {
            // extnValue wraps an OCTET STRING holding the 16 bytes
            let mut value = vec![0x04, 0x10];
            value.extend_from_slice(&aaguid);
            builder.append_extension(X509Extension::new_from_der(
                &*Asn1Object::from_str(OID_FIDO_AAGUID)?,
                false,
                &*Asn1OctetString::new_from_bytes(&value)?,
            )?)?;
        }
        builder.sign(&self.key, MessageDigest::sha256())?;

        Ok(AttestationCert {
            certificate: builder.build(),
            key,
        })
    }
}

fn p256_key() -> Result<PKey<Private>, ErrorStack> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    PKey::from_ec_key(EcKey::generate(&group)?)
}

fn common_name(cn: &str) -> Result<X509Name, ErrorStack> {
    let mut builder = X509NameBuilder::new()?;
    builder.append_entry_by_nid(Nid::COMMONNAME, cn)?;
    Ok(builder.build())
}
