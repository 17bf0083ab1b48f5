//! Fiscal documents, their numbering and their lifecycle states.
pub mod amounts;
pub mod identifier;
pub mod qr;
pub mod sign;
pub mod xml;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::api::Verdict;
use crate::tenant::TenantId;
use amounts::DocumentTotals;
use identifier::IdentifierScheme;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Invoice,
    CreditNote,
    DebitNote,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Invoice => "invoice",
            DocumentType::CreditNote => "credit_note",
            DocumentType::DebitNote => "debit_note",
        }
    }

    pub fn identifier_scheme(&self) -> IdentifierScheme {
        match self {
            DocumentType::Invoice => IdentifierScheme::Cufe,
            DocumentType::CreditNote | DocumentType::DebitNote => IdentifierScheme::Cude,
        }
    }

    pub fn is_note(&self) -> bool {
        !matches!(self, DocumentType::Invoice)
    }

    /// Prefix DIAN expects in submitted file names.
    pub fn file_prefix(&self) -> &'static str {
        match self {
            DocumentType::Invoice => "fv",
            DocumentType::CreditNote => "nc",
            DocumentType::DebitNote => "nd",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prefix plus zero-padded sequence, e.g. `SETP00000042`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentNumber {
    prefix: String,
    sequence: u64,
}

impl DocumentNumber {
    pub fn new(prefix: impl Into<String>, sequence: u64) -> Self {
        Self {
            prefix: prefix.into(),
            sequence,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for DocumentNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:08}", self.prefix, self.sequence)
    }
}

/// Lifecycle states.
///
/// `Generated -> Signed -> {Accepted | Rejected | Sent}`, and `Sent` may later
/// move to any of the three through a status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Generated,
    Signed,
    Sent,
    Accepted,
    Rejected,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Generated => "GENERATED",
            DocumentStatus::Signed => "SIGNED",
            DocumentStatus::Sent => "SENT",
            DocumentStatus::Accepted => "ACCEPTED",
            DocumentStatus::Rejected => "REJECTED",
        }
    }

    /// Status an authority verdict leads to.
    pub fn from_verdict(verdict: &Verdict) -> DocumentStatus {
        if verdict.success {
            DocumentStatus::Accepted
        } else if verdict.is_valid == Some(false) {
            DocumentStatus::Rejected
        } else {
            DocumentStatus::Sent
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Accepted | DocumentStatus::Rejected)
    }

    /// Still waiting on the authority (or on submission).
    pub fn is_pending(&self) -> bool {
        matches!(self, DocumentStatus::Signed | DocumentStatus::Sent)
    }

    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Generated, Signed)
                | (Signed, Accepted | Rejected | Sent)
                | (Sent, Accepted | Rejected | Sent)
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot move document from {from} to {to}")]
pub struct TransitionError {
    pub from: DocumentStatus,
    pub to: DocumentStatus,
}

/// One submission attempt of an invoice or note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiscalDocument {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub document_type: DocumentType,
    /// Invoice or note record this attempt was produced from.
    pub source_id: String,
    /// For notes, the accepted invoice document being offset.
    pub original_document_id: Option<Uuid>,
    pub number: DocumentNumber,
    pub identifier: String,
    pub qr_payload: String,
    pub status: DocumentStatus,
    pub totals: DocumentTotals,
    pub issued_at: DateTime<Utc>,
    pub unsigned_xml: String,
    pub signed_xml: Option<String>,
    pub track_id: Option<String>,
    pub authority_response: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
}

/// Fields known once the identifier and unsigned XML exist.
#[derive(Debug, Clone)]
pub struct GeneratedParts {
    pub tenant_id: TenantId,
    pub document_type: DocumentType,
    pub source_id: String,
    pub original_document_id: Option<Uuid>,
    pub number: DocumentNumber,
    pub identifier: String,
    pub qr_payload: String,
    pub totals: DocumentTotals,
    pub issued_at: DateTime<Utc>,
    pub unsigned_xml: String,
}

impl FiscalDocument {
    pub fn generated(parts: GeneratedParts, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: parts.tenant_id,
            document_type: parts.document_type,
            source_id: parts.source_id,
            original_document_id: parts.original_document_id,
            number: parts.number,
            identifier: parts.identifier,
            qr_payload: parts.qr_payload,
            status: DocumentStatus::Generated,
            totals: parts.totals,
            issued_at: parts.issued_at,
            unsigned_xml: parts.unsigned_xml,
            signed_xml: None,
            track_id: None,
            authority_response: None,
            error_message: None,
            created_at: now,
            sent_at: None,
            accepted_at: None,
        }
    }

    fn transition(&mut self, next: DocumentStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// # Errors
    /// Returns [`TransitionError`] unless the document is `Generated`.
    pub fn mark_signed(&mut self, signed_xml: String) -> Result<(), TransitionError> {
        self.transition(DocumentStatus::Signed)?;
        self.signed_xml = Some(signed_xml);
        Ok(())
    }

    /// Record an authority verdict and move to the status it implies.
    ///
    /// # Errors
    /// Returns [`TransitionError`] when the document is not awaiting a verdict.
    pub fn apply_verdict(
        &mut self,
        verdict: &Verdict,
        now: DateTime<Utc>,
    ) -> Result<DocumentStatus, TransitionError> {
        let next = DocumentStatus::from_verdict(verdict);
        self.transition(next)?;

        if let Some(track_id) = &verdict.track_id {
            self.track_id = Some(track_id.clone());
        }
        if verdict.raw_response.is_some() {
            self.authority_response = verdict.raw_response.clone();
        }
        self.sent_at.get_or_insert(now);

        self.error_message = match next {
            DocumentStatus::Accepted => {
                self.accepted_at = Some(now);
                None
            }
            DocumentStatus::Rejected if verdict.errors.is_empty() => {
                Some(verdict.description.clone())
            }
            DocumentStatus::Rejected => Some(verdict.joined_errors()),
            _ if !verdict.errors.is_empty() => Some(verdict.joined_errors()),
            _ if verdict.transport_failure => Some(verdict.description.clone()),
            _ => None,
        };
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn document() -> FiscalDocument {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 15, 30, 0).unwrap();
        let mut doc = FiscalDocument::generated(
            GeneratedParts {
                tenant_id: TenantId::new("acme"),
                document_type: DocumentType::Invoice,
                source_id: "inv-1".into(),
                original_document_id: None,
                number: DocumentNumber::new("SETP", 990000001),
                identifier: "a".repeat(96),
                qr_payload: String::new(),
                totals: DocumentTotals::default(),
                issued_at: now,
                unsigned_xml: "<Invoice/>".into(),
            },
            now,
        );
        doc.mark_signed("<Invoice/>".into()).expect("sign");
        doc
    }

    fn verdict(success: bool, is_valid: Option<bool>, errors: &[&str]) -> Verdict {
        Verdict {
            success,
            is_valid,
            status_code: "00".into(),
            description: "desc".into(),
            track_id: Some("track-1".into()),
            errors: errors.iter().map(|e| e.to_string()).collect(),
            warnings: Vec::new(),
            transport_failure: false,
            raw_response: Some("<raw/>".into()),
        }
    }

    #[test]
    fn document_number_pads_sequence() {
        assert_eq!(DocumentNumber::new("NC", 7).to_string(), "NC00000007");
        assert_eq!(DocumentNumber::new("SETP", 990000001).to_string(), "SETP990000001");
    }

    #[test]
    fn verdict_mapping_follows_success_and_validity() {
        assert_eq!(
            DocumentStatus::from_verdict(&verdict(true, Some(true), &[])),
            DocumentStatus::Accepted
        );
        assert_eq!(
            DocumentStatus::from_verdict(&verdict(false, Some(false), &[])),
            DocumentStatus::Rejected
        );
        assert_eq!(
            DocumentStatus::from_verdict(&verdict(false, None, &[])),
            DocumentStatus::Sent
        );
    }

    #[test]
    fn rejected_verdict_joins_errors() {
        let mut doc = document();
        let now = Utc::now();
        let status = doc
            .apply_verdict(&verdict(false, Some(false), &["FAD06", "FAJ43b"]), now)
            .expect("apply");
        assert_eq!(status, DocumentStatus::Rejected);
        assert_eq!(doc.error_message.as_deref(), Some("FAD06; FAJ43b"));
        assert_eq!(doc.track_id.as_deref(), Some("track-1"));
        assert_eq!(doc.sent_at, Some(now));
        assert!(doc.accepted_at.is_none());
    }

    #[test]
    fn sent_documents_can_be_resolved_later() {
        let mut doc = document();
        doc.apply_verdict(&verdict(false, None, &[]), Utc::now())
            .expect("pending");
        assert_eq!(doc.status, DocumentStatus::Sent);
        doc.apply_verdict(&verdict(true, Some(true), &[]), Utc::now())
            .expect("accepted");
        assert_eq!(doc.status, DocumentStatus::Accepted);
        assert!(doc.accepted_at.is_some());
        assert!(doc.error_message.is_none());
    }

    #[test]
    fn terminal_documents_refuse_new_verdicts() {
        let mut doc = document();
        doc.apply_verdict(&verdict(true, Some(true), &[]), Utc::now())
            .expect("accepted");
        let err = doc
            .apply_verdict(&verdict(false, Some(false), &["late"]), Utc::now())
            .expect_err("terminal");
        assert_eq!(err.from, DocumentStatus::Accepted);
        assert_eq!(doc.status, DocumentStatus::Accepted);
    }
}
