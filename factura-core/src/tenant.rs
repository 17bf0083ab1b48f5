//! Per-tenant fiscal configuration and document numbering.
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

use crate::config::EnvironmentType;
use crate::document::{DocumentNumber, DocumentType};

/// Opaque tenant key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// String that is wiped on drop and never printed.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(**redacted**)")
    }
}

impl Drop for SecretString {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// ID/PIN/technical-key triple issued by DIAN when the billing software is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftwareCredentials {
    pub software_id: String,
    pub pin: SecretString,
    pub technical_key: SecretString,
}

/// Numbering authorization granted by DIAN for invoices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub number: String,
    pub date: NaiveDate,
    pub valid_until: NaiveDate,
    pub prefix: String,
    pub from: u64,
    pub to: u64,
}

/// Prefix and next sequence for credit or debit notes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteSeries {
    pub prefix: String,
    pub counter: u64,
}

impl NoteSeries {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub line: String,
    pub city: String,
    pub department: String,
    #[serde(default = "default_country")]
    pub country_code: String,
}

fn default_country() -> String {
    "CO".to_string()
}

/// PKCS#12 container as stored for the tenant, protected by its password.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCertificate {
    /// Base64 of the `.p12` bytes.
    pub container: String,
    pub password: SecretString,
}

/// Fiscal configuration of a tenant.
///
/// Counters hold the next sequence to issue. For invoices the counter stays in
/// `resolution.from..=resolution.to + 1`; reaching `to + 1` exhausts the range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantFiscalConfig {
    pub tenant_id: TenantId,
    pub nit: String,
    pub check_digit: String,
    pub legal_name: String,
    #[serde(default)]
    pub trade_name: Option<String>,
    #[serde(default)]
    pub address: Option<Address>,
    #[serde(default)]
    pub software: Option<SoftwareCredentials>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    pub invoice_counter: u64,
    pub credit_notes: NoteSeries,
    pub debit_notes: NoteSeries,
    #[serde(default)]
    pub certificate: Option<StoredCertificate>,
    #[serde(default)]
    pub environment: EnvironmentType,
}

/// Numbering failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NumberingError {
    #[error("no numbering resolution configured")]
    MissingResolution,
    #[error("resolution range exhausted (last authorized number {to})")]
    Exhausted { to: u64 },
    #[error("counter {counter} is below the authorized range starting at {from}")]
    BelowRange { counter: u64, from: u64 },
}

impl TenantFiscalConfig {
    pub fn counter(&self, kind: DocumentType) -> u64 {
        match kind {
            DocumentType::Invoice => self.invoice_counter,
            DocumentType::CreditNote => self.credit_notes.counter,
            DocumentType::DebitNote => self.debit_notes.counter,
        }
    }

    /// Sequence the next document of `kind` would receive.
    ///
    /// # Errors
    /// Returns [`NumberingError`] when the invoice resolution is missing or out of range.
    pub fn next_sequence(&self, kind: DocumentType) -> Result<u64, NumberingError> {
        let counter = self.counter(kind);
        if kind == DocumentType::Invoice {
            let resolution = self
                .resolution
                .as_ref()
                .ok_or(NumberingError::MissingResolution)?;
            if counter < resolution.from {
                return Err(NumberingError::BelowRange {
                    counter,
                    from: resolution.from,
                });
            }
            if counter > resolution.to {
                return Err(NumberingError::Exhausted { to: resolution.to });
            }
        }
        Ok(counter)
    }

    pub fn prefix(&self, kind: DocumentType) -> &str {
        match kind {
            DocumentType::Invoice => self
                .resolution
                .as_ref()
                .map(|r| r.prefix.as_str())
                .unwrap_or_default(),
            DocumentType::CreditNote => &self.credit_notes.prefix,
            DocumentType::DebitNote => &self.debit_notes.prefix,
        }
    }

    pub fn document_number(&self, kind: DocumentType, sequence: u64) -> DocumentNumber {
        DocumentNumber::new(self.prefix(kind), sequence)
    }

    /// Moves the counter of `kind` forward by one.
    pub fn advance(&mut self, kind: DocumentType) {
        match kind {
            DocumentType::Invoice => self.invoice_counter += 1,
            DocumentType::CreditNote => self.credit_notes.counter += 1,
            DocumentType::DebitNote => self.debit_notes.counter += 1,
        }
    }
}
