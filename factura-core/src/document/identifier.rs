//! CUFE / CUDE generation.
//!
//! Both identifiers are SHA-384 over a delimiter-free concatenation of document
//! fields. They differ only in the trailing secret: the technical key for
//! invoices (CUFE) and the software PIN for notes (CUDE).
use std::{fmt, fmt::Write, str::FromStr};

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha384};
use thiserror::Error;

use super::amounts::{DocumentTotals, TaxKind, format_amount};
use crate::config::EnvironmentType;
use crate::tenant::SecretString;

/// Seconds west of UTC for Colombian local time.
const COLOMBIA_UTC_OFFSET_SECS: i32 = 5 * 3600;

/// Identifier length in hex characters.
pub const IDENTIFIER_LEN: usize = 96;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("identifier must be {IDENTIFIER_LEN} hex characters, got {input:?}")]
    InvalidFormat { input: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierScheme {
    Cufe,
    Cude,
}

impl IdentifierScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierScheme::Cufe => "CUFE",
            IdentifierScheme::Cude => "CUDE",
        }
    }

    /// Value of the `schemeName` attribute on `cbc:UUID`.
    pub fn scheme_name(&self) -> &'static str {
        match self {
            IdentifierScheme::Cufe => "CUFE-SHA384",
            IdentifierScheme::Cude => "CUDE-SHA384",
        }
    }
}

/// A validated 96-character hex identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentIdentifier(String);

impl DocumentIdentifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DocumentIdentifier {
    type Err = IdentifierError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if !validate_format(value) {
            return Err(IdentifierError::InvalidFormat {
                input: value.to_string(),
            });
        }
        Ok(Self(value.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for DocumentIdentifier {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DocumentIdentifier> for String {
    fn from(value: DocumentIdentifier) -> Self {
        value.0
    }
}

/// Fields hashed into a CUFE or CUDE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifierInput {
    pub scheme: IdentifierScheme,
    pub number: String,
    pub issued_at: DateTime<Utc>,
    pub totals: DocumentTotals,
    pub issuer_nit: String,
    pub counterpart_id: String,
    /// Technical key for CUFE, software PIN for CUDE.
    pub secret: SecretString,
    pub environment: EnvironmentType,
}

impl IdentifierInput {
    /// Issue date in Colombian local time, `YYYY-MM-DD`.
    pub fn issue_date(&self) -> String {
        self.issued_at
            .with_timezone(&colombia_offset())
            .format("%Y-%m-%d")
            .to_string()
    }

    /// Issue time in Colombian local time with explicit offset, `HH:MM:SS-05:00`.
    pub fn issue_time(&self) -> String {
        self.issued_at
            .with_timezone(&colombia_offset())
            .format("%H:%M:%S%:z")
            .to_string()
    }

    fn hashed_fields(&self) -> String {
        let mut fields = String::with_capacity(256);
        fields.push_str(&self.number);
        fields.push_str(&self.issue_date());
        fields.push_str(&self.issue_time());
        fields.push_str(&format_amount(self.totals.subtotal));
        for kind in [TaxKind::Iva, TaxKind::Inc, TaxKind::Ica] {
            fields.push_str(kind.code());
            fields.push_str(&format_amount(self.totals.tax(kind)));
        }
        fields.push_str(&format_amount(self.totals.total));
        fields.push_str(&self.issuer_nit);
        fields.push_str(&self.counterpart_id);
        fields.push_str(self.secret.expose());
        fields.push_str(self.environment.identifier_code());
        fields
    }
}

/// Compute the CUFE or CUDE for `input`.
///
/// # Examples
/// ```rust
/// use chrono::{TimeZone, Utc};
/// use rust_decimal::Decimal;
/// use factura_core::config::EnvironmentType;
/// use factura_core::document::amounts::DocumentTotals;
/// use factura_core::document::identifier::{IdentifierInput, IdentifierScheme, generate, validate_format};
///
/// let input = IdentifierInput {
///     scheme: IdentifierScheme::Cufe,
///     number: "SETP990000001".into(),
///     issued_at: Utc.with_ymd_and_hms(2024, 1, 15, 15, 30, 0).unwrap(),
///     totals: DocumentTotals {
///         subtotal: Decimal::from(100000),
///         iva: Decimal::from(19000),
///         total: Decimal::from(119000),
///         ..Default::default()
///     },
///     issuer_nit: "900123456".into(),
///     counterpart_id: "123456789".into(),
///     secret: "tech-key-123".into(),
///     environment: EnvironmentType::Test,
/// };
/// let cufe = generate(&input);
/// assert!(validate_format(cufe.as_str()));
/// ```
pub fn generate(input: &IdentifierInput) -> DocumentIdentifier {
    DocumentIdentifier(sha384_hex(input.hashed_fields().as_bytes()))
}

/// True for exactly 96 hex characters, in either case.
pub fn validate_format(value: &str) -> bool {
    value.len() == IDENTIFIER_LEN && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// `SoftwareSecurityCode` of the DIAN extension: SHA-384 of software ID, PIN and number.
pub fn software_security_code(software_id: &str, pin: &str, number: &str) -> String {
    sha384_hex(format!("{software_id}{pin}{number}").as_bytes())
}

pub fn colombia_offset() -> FixedOffset {
    FixedOffset::west_opt(COLOMBIA_UTC_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

fn sha384_hex(bytes: &[u8]) -> String {
    let hash = Sha384::digest(bytes);
    let mut hex = String::with_capacity(hash.len() * 2);
    for byte in hash {
        let _ = write!(&mut hex, "{:02x}", byte);
    }
    hex
}
