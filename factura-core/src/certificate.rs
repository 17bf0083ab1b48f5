//! PKCS#12 certificate loading for document signing.
//!
//! [`CertificateStore::load`] rebuilds [`CertificateMaterial`] from the stored
//! container on every call. The material owns the private key and is meant to
//! be dropped as soon as the signature is produced.
use std::fmt;

use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use openssl::{
    pkcs12::Pkcs12,
    pkey::{PKey, PKeyRef, Private},
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_cert::{Certificate, der::Decode, name::Name};
use zeroize::Zeroizing;

use crate::tenant::StoredCertificate;

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("invalid certificate credential: {0}")]
    InvalidCredential(String),
    #[error("malformed certificate: {0}")]
    MalformedCertificate(String),
}

/// Key, certificate and the metadata XAdES needs about it.
pub struct CertificateMaterial {
    private_key: PKey<Private>,
    certificate_der: Vec<u8>,
    digest: [u8; 32],
    issuer: String,
    subject: String,
    serial_number: String,
    valid_from: DateTime<Utc>,
    valid_to: DateTime<Utc>,
}

impl CertificateMaterial {
    pub(crate) fn private_key(&self) -> &PKeyRef<Private> {
        &self.private_key
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    pub fn certificate_base64(&self) -> String {
        Base64::encode_string(&self.certificate_der)
    }

    /// SHA-256 of the certificate DER.
    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    pub fn digest_base64(&self) -> String {
        Base64::encode_string(&self.digest)
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Serial number in decimal.
    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub fn valid_from(&self) -> DateTime<Utc> {
        self.valid_from
    }

    pub fn valid_to(&self) -> DateTime<Utc> {
        self.valid_to
    }
}

impl fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("private_key", &"**redacted**")
            .field("subject", &self.subject)
            .field("issuer", &self.issuer)
            .field("serial_number", &self.serial_number)
            .field("valid_from", &self.valid_from)
            .field("valid_to", &self.valid_to)
            .finish()
    }
}

/// Result of [`CertificateStore::validate`], shaped for configuration screens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateReport {
    pub is_valid: bool,
    pub subject: Option<String>,
    pub issuer: Option<String>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
}

/// Loader for PKCS#12 signing containers.
///
/// # Examples
/// ```rust,no_run
/// use factura_core::certificate::CertificateStore;
///
/// let container = std::fs::read("signer.p12")?;
/// let material = CertificateStore::load(&container, "secret")?;
/// println!("{} (serial {})", material.subject(), material.serial_number());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct CertificateStore;

impl CertificateStore {
    /// Parse a PKCS#12 container into signing material.
    ///
    /// # Errors
    /// Returns [`CertificateError::InvalidCredential`] for a wrong password or an
    /// unreadable container, and [`CertificateError::MalformedCertificate`] when the
    /// key or certificate is missing or they do not belong together.
    pub fn load(container: &[u8], password: &str) -> Result<CertificateMaterial, CertificateError> {
        let pkcs12 = Pkcs12::from_der(container).map_err(|e| {
            CertificateError::InvalidCredential(format!("unreadable PKCS#12 container: {e}"))
        })?;
        let parsed = pkcs12.parse2(password).map_err(|e| {
            CertificateError::InvalidCredential(format!(
                "wrong password or corrupt container: {e}"
            ))
        })?;
        let private_key = parsed.pkey.ok_or_else(|| {
            CertificateError::MalformedCertificate("container holds no private key".into())
        })?;
        let certificate = parsed.cert.ok_or_else(|| {
            CertificateError::MalformedCertificate("container holds no certificate".into())
        })?;

        let public_key = certificate.public_key().map_err(|e| {
            CertificateError::MalformedCertificate(format!("unreadable public key: {e}"))
        })?;
        if !public_key.public_eq(&private_key) {
            return Err(CertificateError::MalformedCertificate(
                "private key does not match certificate".into(),
            ));
        }

        let certificate_der = certificate.to_der().map_err(|e| {
            CertificateError::MalformedCertificate(format!("certificate DER encoding error: {e}"))
        })?;
        let metadata = CertificateMetadata::from_der(&certificate_der)?;
        let digest: [u8; 32] = Sha256::digest(&certificate_der).into();

        Ok(CertificateMaterial {
            private_key,
            certificate_der,
            digest,
            issuer: metadata.issuer,
            subject: metadata.subject,
            serial_number: metadata.serial_number,
            valid_from: metadata.valid_from,
            valid_to: metadata.valid_to,
        })
    }

    /// Load the container a tenant has on file.
    ///
    /// # Errors
    /// Same as [`CertificateStore::load`]; an undecodable stored blob is reported as
    /// [`CertificateError::InvalidCredential`].
    pub fn load_stored(stored: &StoredCertificate) -> Result<CertificateMaterial, CertificateError> {
        let container = Zeroizing::new(Base64::decode_vec(stored.container.trim()).map_err(
            |e| CertificateError::InvalidCredential(format!("stored container is not base64: {e}")),
        )?);
        Self::load(&container, stored.password.expose())
    }

    /// Check a container without failing, collecting readable problems.
    pub fn validate(container: &[u8], password: &str) -> CertificateReport {
        Self::validate_at(container, password, Utc::now())
    }

    pub fn validate_at(container: &[u8], password: &str, now: DateTime<Utc>) -> CertificateReport {
        let material = match Self::load(container, password) {
            Ok(material) => material,
            Err(err) => {
                return CertificateReport {
                    is_valid: false,
                    subject: None,
                    issuer: None,
                    valid_from: None,
                    valid_to: None,
                    errors: vec![err.to_string()],
                };
            }
        };

        let mut errors = Vec::new();
        if now < material.valid_from {
            errors.push(format!(
                "certificate is not valid before {}",
                material.valid_from.to_rfc3339()
            ));
        }
        if now > material.valid_to {
            errors.push(format!(
                "certificate expired on {}",
                material.valid_to.to_rfc3339()
            ));
        }

        CertificateReport {
            is_valid: errors.is_empty(),
            subject: Some(material.subject.clone()),
            issuer: Some(material.issuer.clone()),
            valid_from: Some(material.valid_from),
            valid_to: Some(material.valid_to),
            errors,
        }
    }
}

struct CertificateMetadata {
    issuer: String,
    subject: String,
    serial_number: String,
    valid_from: DateTime<Utc>,
    valid_to: DateTime<Utc>,
}

impl CertificateMetadata {
    fn from_der(der: &[u8]) -> Result<Self, CertificateError> {
        let cert = Certificate::from_der(der).map_err(|e| {
            CertificateError::MalformedCertificate(format!("certificate parse error: {e:?}"))
        })?;
        let tbs = &cert.tbs_certificate;
        Ok(Self {
            issuer: distinguished_name(&tbs.issuer),
            subject: distinguished_name(&tbs.subject),
            serial_number: serial_bytes_to_decimal_string(tbs.serial_number.as_bytes()),
            valid_from: unix_time(tbs.validity.not_before.to_unix_duration())?,
            valid_to: unix_time(tbs.validity.not_after.to_unix_duration())?,
        })
    }
}

fn unix_time(since_epoch: std::time::Duration) -> Result<DateTime<Utc>, CertificateError> {
    i64::try_from(since_epoch.as_secs())
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| CertificateError::MalformedCertificate("validity out of range".into()))
}

// DIAN reads names in encoding order: country first, common name last.
fn distinguished_name(name: &Name) -> String {
    name.0
        .iter()
        .map(|rdn| rdn.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn serial_bytes_to_decimal_string(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "0".to_string();
    }

    let mut digits: Vec<u8> = vec![0];
    for &byte in bytes {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            let value = (*digit as u32) * 256 + carry;
            *digit = (value % 10) as u8;
            carry = value / 10;
        }
        while carry > 0 {
            digits.push((carry % 10) as u8);
            carry /= 10;
        }
    }

    while digits.len() > 1 && matches!(digits.last(), Some(0)) {
        digits.pop();
    }

    digits.iter().rev().map(|d| (b'0' + *d) as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::{
        asn1::Asn1Time,
        bn::BigNum,
        hash::MessageDigest,
        rsa::Rsa,
        x509::{X509, X509NameBuilder},
    };

    fn build_container(not_before: &Asn1Time, not_after: &Asn1Time, with_key: bool) -> Vec<u8> {
        let pkey = PKey::from_rsa(Rsa::generate(2048).expect("rsa")).expect("pkey");
        let mut name = X509NameBuilder::new().expect("name");
        name.append_entry_by_text("C", "CO").expect("C");
        name.append_entry_by_text("O", "Acme SAS").expect("O");
        name.append_entry_by_text("CN", "Acme Signer").expect("CN");
        let name = name.build();

        let mut builder = X509::builder().expect("builder");
        builder.set_version(2).expect("version");
        let serial = BigNum::from_hex_str("0102").expect("serial");
        builder
            .set_serial_number(&serial.to_asn1_integer().expect("asn1"))
            .expect("serial");
        builder.set_subject_name(&name).expect("subject");
        builder.set_issuer_name(&name).expect("issuer");
        builder.set_pubkey(&pkey).expect("pubkey");
        builder.set_not_before(not_before).expect("not before");
        builder.set_not_after(not_after).expect("not after");
        builder.sign(&pkey, MessageDigest::sha256()).expect("sign");
        let cert = builder.build();

        let mut p12 = Pkcs12::builder();
        p12.name("signer").cert(&cert);
        if with_key {
            p12.pkey(&pkey);
        }
        p12.build2("secret").expect("p12").to_der().expect("der")
    }

    fn current_container() -> Vec<u8> {
        build_container(
            &Asn1Time::days_from_now(0).expect("now"),
            &Asn1Time::days_from_now(365).expect("later"),
            true,
        )
    }

    #[test]
    fn serial_bytes_to_decimal_handles_large_values() {
        assert_eq!(serial_bytes_to_decimal_string(&[0x01]), "1");
        assert_eq!(serial_bytes_to_decimal_string(&[0x01, 0x00]), "256");
        assert_eq!(serial_bytes_to_decimal_string(&[0x00, 0x01]), "1");
        assert_eq!(serial_bytes_to_decimal_string(&[0xFF, 0xFF]), "65535");
    }

    #[test]
    fn load_extracts_metadata() {
        let container = current_container();
        let material = CertificateStore::load(&container, "secret").expect("load");

        assert_eq!(material.issuer(), "C=CO, O=Acme SAS, CN=Acme Signer");
        assert_eq!(material.subject(), material.issuer());
        assert_eq!(material.serial_number(), "258");
        assert!(material.valid_from() < material.valid_to());

        let expected: [u8; 32] = Sha256::digest(material.certificate_der()).into();
        assert_eq!(material.digest(), &expected);
        assert_eq!(material.digest_base64(), Base64::encode_string(&expected));
        assert!(!format!("{material:?}").contains("BEGIN"));
    }

    #[test]
    fn wrong_password_is_an_invalid_credential() {
        let container = current_container();
        let err = CertificateStore::load(&container, "nope").expect_err("must fail");
        assert!(matches!(err, CertificateError::InvalidCredential(_)));

        let err = CertificateStore::load(b"not a container", "secret").expect_err("must fail");
        assert!(matches!(err, CertificateError::InvalidCredential(_)));
    }

    #[test]
    fn container_without_key_is_malformed() {
        let container = build_container(
            &Asn1Time::days_from_now(0).expect("now"),
            &Asn1Time::days_from_now(30).expect("later"),
            false,
        );
        let err = CertificateStore::load(&container, "secret").expect_err("must fail");
        assert!(matches!(err, CertificateError::MalformedCertificate(_)));
    }

    #[test]
    fn validate_reports_expired_certificates() {
        let container = build_container(
            &Asn1Time::from_unix(1_500_000_000).expect("past"),
            &Asn1Time::from_unix(1_600_000_000).expect("past"),
            true,
        );
        let report = CertificateStore::validate(&container, "secret");
        assert!(!report.is_valid);
        assert_eq!(report.subject.as_deref(), Some("C=CO, O=Acme SAS, CN=Acme Signer"));
        assert!(report.errors.iter().any(|e| e.contains("expired")));

        let report = CertificateStore::validate(&current_container(), "secret");
        assert!(report.is_valid, "{:?}", report.errors);
    }

    #[test]
    fn validate_never_fails_on_bad_input() {
        let report = CertificateStore::validate(&current_container(), "wrong");
        assert!(!report.is_valid);
        assert!(report.subject.is_none());
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn load_stored_decodes_base64() {
        let stored = StoredCertificate {
            container: Base64::encode_string(&current_container()),
            password: "secret".into(),
        };
        assert!(CertificateStore::load_stored(&stored).is_ok());

        let stored = StoredCertificate {
            container: "***".into(),
            password: "secret".into(),
        };
        assert!(matches!(
            CertificateStore::load_stored(&stored),
            Err(CertificateError::InvalidCredential(_))
        ));
    }
}
