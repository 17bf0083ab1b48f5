//! Issuing and tracking fiscal documents.
//!
//! A submission runs identifier generation, templating and signing locally,
//! then allocates the sequence number together with the document row, and
//! only then talks to the authority. Anything that fails before allocation
//! leaves no trace in the store.
pub mod events;
pub(crate) mod notes;
pub mod store;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::api::{StatusQuery, SubmissionGateway, Verdict, document_file_name};
use crate::certificate::{CertificateError, CertificateStore};
use crate::document::amounts::{DocumentTotals, LineItem, PricedLine};
use crate::document::identifier::{self, IdentifierInput, IdentifierScheme, colombia_offset};
use crate::document::qr;
use crate::document::sign::{SignatureEngine, SigningError};
use crate::document::xml::template::{
    BillingReference, Discrepancy, DocumentTemplater, TemplateError, TemplateRequest, UblTemplater,
};
use crate::document::{
    DocumentStatus, DocumentType, FiscalDocument, GeneratedParts, TransitionError,
};
use crate::source::{Counterparty, InvoiceSource, SourceError};
use crate::tenant::{NumberingError, TenantFiscalConfig, TenantId};
use events::{AcceptedDocument, DomainEvent, EventPublisher, RestockLine};
use store::{DocumentStore, StoreError};

const DEFAULT_ALLOCATION_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("missing configuration: {0}")]
    ConfigurationMissing(String),
    #[error("certificate password rejected: {0}")]
    InvalidCredential(String),
    #[error("malformed certificate: {0}")]
    MalformedCertificate(String),
    #[error("document has {found} extension slot(s), the signature needs a second one")]
    MissingExtensionSlot { found: usize },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("line {line_id}: credited quantity {requested} exceeds invoiced quantity {available}")]
    QuantityExceeded {
        line_id: String,
        requested: Decimal,
        available: Decimal,
    },
    #[error("invalid note: {0}")]
    InvalidNote(String),
    #[error("invoice {invoice_id} is not accepted by the authority (latest attempt: {status})")]
    PriorDocumentNotAccepted { invoice_id: String, status: String },
    #[error("authority unavailable: {0}")]
    RemoteUnavailable(String),
    #[error("document {number} rejected by the authority: {reason}")]
    Rejected { number: String, reason: String },
    #[error("document {number} is already accepted; resubmit with force to reissue")]
    AlreadyAccepted { number: String },
    #[error("document {number} is still {status}; check its status or resubmit with force")]
    SubmissionPending {
        number: String,
        status: DocumentStatus,
    },
    #[error("numbering resolution exhausted (last authorized number {to})")]
    ResolutionExhausted { to: u64 },
    #[error("no free sequence number after {attempts} allocation attempts")]
    AllocationContention { attempts: u32 },
    #[error("signing failed: {0}")]
    Signing(SigningError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl LifecycleError {
    /// Safe to try again later without changing any input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LifecycleError::RemoteUnavailable(_)
                | LifecycleError::AllocationContention { .. }
                | LifecycleError::Store(StoreError::SequenceConflict { .. })
        )
    }

    /// Caused by configuration or input the user can fix.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            LifecycleError::ConfigurationMissing(_)
                | LifecycleError::InvalidCredential(_)
                | LifecycleError::NotFound { .. }
                | LifecycleError::QuantityExceeded { .. }
                | LifecycleError::InvalidNote(_)
                | LifecycleError::PriorDocumentNotAccepted { .. }
                | LifecycleError::Rejected { .. }
                | LifecycleError::AlreadyAccepted { .. }
                | LifecycleError::SubmissionPending { .. }
                | LifecycleError::ResolutionExhausted { .. }
        )
    }
}

impl From<CertificateError> for LifecycleError {
    fn from(err: CertificateError) -> Self {
        match err {
            CertificateError::InvalidCredential(msg) => LifecycleError::InvalidCredential(msg),
            CertificateError::MalformedCertificate(msg) => {
                LifecycleError::MalformedCertificate(msg)
            }
        }
    }
}

impl From<SigningError> for LifecycleError {
    fn from(err: SigningError) -> Self {
        match err {
            SigningError::MissingExtensionSlot { found } => {
                LifecycleError::MissingExtensionSlot { found }
            }
            other => LifecycleError::Signing(other),
        }
    }
}

impl From<NumberingError> for LifecycleError {
    fn from(err: NumberingError) -> Self {
        match err {
            NumberingError::MissingResolution => {
                LifecycleError::ConfigurationMissing("numbering resolution".into())
            }
            NumberingError::Exhausted { to } => LifecycleError::ResolutionExhausted { to },
            below @ NumberingError::BelowRange { .. } => {
                LifecycleError::ConfigurationMissing(below.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Issue a new document even when the latest attempt is accepted, rejected or pending.
    pub force: bool,
}

impl SubmitOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

/// Stored row after a lifecycle call, plus the verdict that produced it.
///
/// `verdict` is `None` when no round trip happened.
#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    pub document: FiscalDocument,
    pub verdict: Option<Verdict>,
}

impl SubmissionOutcome {
    pub fn status(&self) -> DocumentStatus {
        self.document.status
    }

    /// Treat a rejection as an error; accepted and pending documents are `Ok`.
    pub fn into_result(self) -> Result<FiscalDocument, LifecycleError> {
        if self.document.status == DocumentStatus::Rejected {
            return Err(LifecycleError::Rejected {
                number: self.document.number.to_string(),
                reason: self.document.error_message.unwrap_or_default(),
            });
        }
        Ok(self.document)
    }
}

/// What to issue, before numbering.
#[derive(Debug, Clone)]
struct Draft {
    kind: DocumentType,
    source_id: String,
    original_document_id: Option<Uuid>,
    issued_at: DateTime<Utc>,
    customer: Counterparty,
    lines: Vec<PricedLine>,
    billing_reference: Option<BillingReference>,
    discrepancy: Option<Discrepancy>,
    restock: Vec<RestockLine>,
    options: SubmitOptions,
    /// Latest attempt for `source_id` when the guard ran.
    observed_latest: Option<Uuid>,
}

/// Orchestrates invoices and notes from source record to authority verdict.
pub struct DocumentLifecycle {
    store: Arc<dyn DocumentStore>,
    source: Arc<dyn InvoiceSource>,
    gateway: Arc<dyn SubmissionGateway>,
    templater: Arc<dyn DocumentTemplater>,
    events: EventPublisher,
    allocation_attempts: u32,
}

impl DocumentLifecycle {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        source: Arc<dyn InvoiceSource>,
        gateway: Arc<dyn SubmissionGateway>,
    ) -> Self {
        Self {
            store,
            source,
            gateway,
            templater: Arc::new(UblTemplater),
            events: EventPublisher::disabled(),
            allocation_attempts: DEFAULT_ALLOCATION_ATTEMPTS,
        }
    }

    pub fn with_templater(mut self, templater: Arc<dyn DocumentTemplater>) -> Self {
        self.templater = templater;
        self
    }

    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = events;
        self
    }

    pub fn with_allocation_attempts(mut self, attempts: u32) -> Self {
        self.allocation_attempts = attempts.max(1);
        self
    }

    /// Issue and submit the invoice `invoice_id`.
    ///
    /// # Errors
    /// Configuration, source, signing and idempotency failures are returned
    /// before anything is stored. Authority outcomes, including rejection and
    /// transport failure, come back as an `Ok` outcome with the stored row.
    #[tracing::instrument(
        name = "lifecycle.submit_invoice",
        skip(self, tenant, options),
        fields(tenant = %tenant, force = options.force),
        err
    )]
    pub async fn submit_invoice(
        &self,
        tenant: &TenantId,
        invoice_id: &str,
        options: SubmitOptions,
    ) -> Result<SubmissionOutcome, LifecycleError> {
        let config = self.config(tenant).await?;
        let observed_latest = self
            .guard_resubmission(tenant, DocumentType::Invoice, invoice_id, options)
            .await?;

        let record = self
            .source
            .invoice(tenant, invoice_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound {
                entity: "invoice",
                id: invoice_id.to_string(),
            })?;

        let draft = Draft {
            kind: DocumentType::Invoice,
            source_id: record.id.clone(),
            original_document_id: None,
            issued_at: record.issued_at,
            lines: record.lines.iter().map(LineItem::priced).collect(),
            customer: record.customer,
            billing_reference: None,
            discrepancy: None,
            restock: Vec::new(),
            options,
            observed_latest,
        };
        self.issue(config, draft).await
    }

    /// Issue and submit the credit or debit note `note_id`.
    ///
    /// # Errors
    /// As [`DocumentLifecycle::submit_invoice`], plus
    /// [`LifecycleError::PriorDocumentNotAccepted`] when the invoice was never
    /// accepted and [`LifecycleError::QuantityExceeded`] for over-credited lines.
    #[tracing::instrument(
        name = "lifecycle.submit_note",
        skip(self, tenant, options),
        fields(tenant = %tenant, force = options.force),
        err
    )]
    pub async fn submit_note(
        &self,
        tenant: &TenantId,
        note_id: &str,
        options: SubmitOptions,
    ) -> Result<SubmissionOutcome, LifecycleError> {
        let config = self.config(tenant).await?;
        let note = self
            .source
            .note(tenant, note_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound {
                entity: "note",
                id: note_id.to_string(),
            })?;
        let kind = note.kind.document_type();
        let observed_latest = self
            .guard_resubmission(tenant, kind, &note.id, options)
            .await?;

        let original = match self
            .store
            .latest_document(tenant, DocumentType::Invoice, &note.invoice_id)
            .await?
        {
            Some(doc) if doc.status == DocumentStatus::Accepted => doc,
            Some(doc) => {
                return Err(LifecycleError::PriorDocumentNotAccepted {
                    invoice_id: note.invoice_id.clone(),
                    status: doc.status.to_string(),
                });
            }
            None => {
                return Err(LifecycleError::PriorDocumentNotAccepted {
                    invoice_id: note.invoice_id.clone(),
                    status: "never submitted".into(),
                });
            }
        };
        let invoice = self
            .source
            .invoice(tenant, &note.invoice_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound {
                entity: "invoice",
                id: note.invoice_id.clone(),
            })?;

        let lines = notes::note_lines(&invoice.lines, &note.lines)?;
        let restock = notes::restock_lines(&note, &invoice.lines);
        let draft = Draft {
            kind,
            source_id: note.id.clone(),
            original_document_id: Some(original.id),
            issued_at: note.issued_at,
            customer: invoice.customer,
            lines,
            billing_reference: Some(BillingReference {
                number: original.number.to_string(),
                identifier: original.identifier.clone(),
                issue_date: original
                    .issued_at
                    .with_timezone(&colombia_offset())
                    .date_naive(),
            }),
            discrepancy: Some(Discrepancy {
                concept: note.concept,
                description: note.reason,
            }),
            restock,
            options,
            observed_latest,
        };
        self.issue(config, draft).await
    }

    /// Ask the authority about a document still awaiting a verdict.
    ///
    /// Accepted and rejected documents are returned as stored, without a
    /// round trip.
    ///
    /// # Errors
    /// Returns [`LifecycleError::RemoteUnavailable`] when the authority cannot
    /// be reached; the stored row is left untouched.
    #[tracing::instrument(
        name = "lifecycle.check_status",
        skip(self, tenant),
        fields(tenant = %tenant),
        err
    )]
    pub async fn check_status(
        &self,
        tenant: &TenantId,
        document_id: Uuid,
    ) -> Result<SubmissionOutcome, LifecycleError> {
        let document = self
            .store
            .get_document(tenant, document_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound {
                entity: "document",
                id: document_id.to_string(),
            })?;
        if document.status.is_terminal() {
            return Ok(SubmissionOutcome {
                document,
                verdict: None,
            });
        }

        let config = self.config(tenant).await?;
        let query = match document.track_id.as_deref() {
            Some(track_id) if track_id != document.identifier => StatusQuery::TrackId(track_id),
            _ => StatusQuery::Identifier(&document.identifier),
        };
        let verdict = self.gateway.check_status(&config, query).await;
        if verdict.transport_failure {
            tracing::warn!(
                number = %document.number,
                code = %verdict.status_code,
                "status check could not reach the authority"
            );
            return Err(LifecycleError::RemoteUnavailable(verdict.description));
        }

        let restock = if document.document_type == DocumentType::CreditNote
            && DocumentStatus::from_verdict(&verdict) == DocumentStatus::Accepted
        {
            self.restock_for(tenant, &document).await
        } else {
            Vec::new()
        };
        self.record_verdict(document, verdict, restock).await
    }
}

// Private API
impl DocumentLifecycle {
    async fn config(&self, tenant: &TenantId) -> Result<TenantFiscalConfig, LifecycleError> {
        self.store.load_config(tenant).await?.ok_or_else(|| {
            LifecycleError::ConfigurationMissing(format!(
                "no fiscal configuration for tenant {tenant}"
            ))
        })
    }

    /// Refuse a second attempt for `source_id` unless forced; returns the
    /// latest attempt the decision was based on.
    async fn guard_resubmission(
        &self,
        tenant: &TenantId,
        kind: DocumentType,
        source_id: &str,
        options: SubmitOptions,
    ) -> Result<Option<Uuid>, LifecycleError> {
        let Some(latest) = self.store.latest_document(tenant, kind, source_id).await? else {
            return Ok(None);
        };
        if options.force {
            if latest.status != DocumentStatus::Generated {
                tracing::info!(
                    previous = %latest.number,
                    status = %latest.status,
                    "forced reissue"
                );
            }
            return Ok(Some(latest.id));
        }
        match latest.status {
            DocumentStatus::Accepted => Err(LifecycleError::AlreadyAccepted {
                number: latest.number.to_string(),
            }),
            DocumentStatus::Rejected => Err(LifecycleError::Rejected {
                number: latest.number.to_string(),
                reason: latest.error_message.unwrap_or_default(),
            }),
            status if status.is_pending() => Err(LifecycleError::SubmissionPending {
                number: latest.number.to_string(),
                status,
            }),
            _ => Ok(Some(latest.id)),
        }
    }

    async fn issue(
        &self,
        mut config: TenantFiscalConfig,
        draft: Draft,
    ) -> Result<SubmissionOutcome, LifecycleError> {
        let tenant = config.tenant_id.clone();
        let mut observed_latest = draft.observed_latest;
        let mut attempt = 1;
        let document = loop {
            let (sequence, document) =
                prepare(&config, &draft, self.templater.as_ref(), Utc::now())?;
            let conflict = match self
                .store
                .insert_numbered(
                    &tenant,
                    draft.kind,
                    sequence,
                    observed_latest,
                    document.clone(),
                )
                .await
            {
                Ok(()) => break document,
                Err(err @ StoreError::SequenceConflict { .. }) => err,
                Err(err @ StoreError::AttemptSuperseded { .. }) => {
                    // Another call issued this source meanwhile.
                    observed_latest = self
                        .guard_resubmission(&tenant, draft.kind, &draft.source_id, draft.options)
                        .await?;
                    err
                }
                Err(err) => return Err(err.into()),
            };
            if attempt >= self.allocation_attempts {
                return Err(LifecycleError::AllocationContention { attempts: attempt });
            }
            tracing::debug!(attempt, sequence, error = %conflict, "allocation lost, renumbering");
            attempt += 1;
            config = self.config(&tenant).await?;
        };
        tracing::info!(
            number = %document.number,
            document_id = %document.id,
            kind = %draft.kind,
            "document signed and numbered"
        );

        let file_name = document_file_name(
            &config.nit,
            draft.kind,
            document.number.sequence(),
            draft.issued_at,
        );
        let verdict = self
            .gateway
            .submit(
                &config,
                document.signed_xml.as_deref().unwrap_or_default(),
                &file_name,
            )
            .await;
        self.record_verdict(document, verdict, draft.restock).await
    }

    async fn record_verdict(
        &self,
        mut document: FiscalDocument,
        verdict: Verdict,
        restock: Vec<RestockLine>,
    ) -> Result<SubmissionOutcome, LifecycleError> {
        let status = document.apply_verdict(&verdict, Utc::now())?;
        self.store.update_document(&document).await?;

        match status {
            DocumentStatus::Accepted => {
                tracing::info!(number = %document.number, "document accepted");
                self.events.publish(DomainEvent::DocumentAccepted {
                    document: AcceptedDocument::from_document(&document),
                    restock,
                });
            }
            DocumentStatus::Rejected => {
                tracing::warn!(
                    number = %document.number,
                    code = %verdict.status_code,
                    errors = document.error_message.as_deref().unwrap_or_default(),
                    "document rejected"
                );
            }
            _ if verdict.transport_failure => {
                tracing::warn!(
                    number = %document.number,
                    code = %verdict.status_code,
                    "authority unreachable, document left pending"
                );
            }
            _ => tracing::info!(number = %document.number, status = %status, "document pending"),
        }
        Ok(SubmissionOutcome {
            document,
            verdict: Some(verdict),
        })
    }

    async fn restock_for(&self, tenant: &TenantId, document: &FiscalDocument) -> Vec<RestockLine> {
        let lookup = async {
            let Some(note) = self.source.note(tenant, &document.source_id).await? else {
                return Ok(Vec::new());
            };
            let invoice = self.source.invoice(tenant, &note.invoice_id).await?;
            Ok::<_, SourceError>(
                invoice
                    .map(|invoice| notes::restock_lines(&note, &invoice.lines))
                    .unwrap_or_default(),
            )
        };
        match lookup.await {
            Ok(lines) => lines,
            Err(err) => {
                tracing::warn!(number = %document.number, error = %err, "could not rebuild restock lines");
                Vec::new()
            }
        }
    }
}

/// Number, identify, render and sign `draft` against the current counter.
///
/// Certificate material lives only for the duration of this call.
fn prepare(
    config: &TenantFiscalConfig,
    draft: &Draft,
    templater: &dyn DocumentTemplater,
    now: DateTime<Utc>,
) -> Result<(u64, FiscalDocument), LifecycleError> {
    let software = config
        .software
        .as_ref()
        .ok_or_else(|| LifecycleError::ConfigurationMissing("software credentials".into()))?;
    let certificate = config
        .certificate
        .as_ref()
        .ok_or_else(|| LifecycleError::ConfigurationMissing("signing certificate".into()))?;

    let sequence = config.next_sequence(draft.kind)?;
    let number = config.document_number(draft.kind, sequence);
    let totals = DocumentTotals::from_lines(&draft.lines);
    let scheme = draft.kind.identifier_scheme();
    let secret = match scheme {
        IdentifierScheme::Cufe => software.technical_key.clone(),
        IdentifierScheme::Cude => software.pin.clone(),
    };
    let input = IdentifierInput {
        scheme,
        number: number.to_string(),
        issued_at: draft.issued_at,
        totals,
        issuer_nit: config.nit.clone(),
        counterpart_id: draft.customer.tax_id().to_string(),
        secret,
        environment: config.environment,
    };
    let identifier = identifier::generate(&input);
    let qr_payload = qr::verification_payload(&input, &identifier);
    let issue_date = input.issue_date();
    let issue_time = input.issue_time();

    let unsigned_xml = templater.render(&TemplateRequest {
        config,
        document_type: draft.kind,
        number: &input.number,
        identifier: &identifier,
        issue_date: &issue_date,
        issue_time: &issue_time,
        qr_payload: &qr_payload,
        customer: &draft.customer,
        lines: &draft.lines,
        totals: &totals,
        billing_reference: draft.billing_reference.as_ref(),
        discrepancy: draft.discrepancy.as_ref(),
    })?;

    let signed_xml = {
        let material = CertificateStore::load_stored(certificate)?;
        SignatureEngine::new(&material).sign(&unsigned_xml)?
    };

    let mut document = FiscalDocument::generated(
        GeneratedParts {
            tenant_id: config.tenant_id.clone(),
            document_type: draft.kind,
            source_id: draft.source_id.clone(),
            original_document_id: draft.original_document_id,
            number,
            identifier: identifier.into(),
            qr_payload,
            totals,
            issued_at: draft.issued_at,
            unsigned_xml,
        },
        now,
    );
    document.mark_signed(signed_xml)?;
    Ok((sequence, document))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentNumber;

    fn rejected_document() -> FiscalDocument {
        let mut document = FiscalDocument::generated(
            GeneratedParts {
                tenant_id: TenantId::new("acme"),
                document_type: DocumentType::Invoice,
                source_id: "inv-1".into(),
                original_document_id: None,
                number: DocumentNumber::new("SETP", 990000001),
                identifier: "0".repeat(96),
                qr_payload: String::new(),
                totals: DocumentTotals::default(),
                issued_at: Utc::now(),
                unsigned_xml: "<Invoice/>".into(),
            },
            Utc::now(),
        );
        document.status = DocumentStatus::Rejected;
        document.error_message = Some("Regla: FAD06; Regla: FAB05b".into());
        document
    }

    #[test]
    fn rejected_outcome_becomes_an_error() {
        let outcome = SubmissionOutcome {
            document: rejected_document(),
            verdict: None,
        };
        match outcome.into_result() {
            Err(LifecycleError::Rejected { number, reason }) => {
                assert_eq!(number, "SETP990000001");
                assert_eq!(reason, "Regla: FAD06; Regla: FAB05b");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn pending_outcome_is_ok() {
        let mut document = rejected_document();
        document.status = DocumentStatus::Sent;
        let outcome = SubmissionOutcome {
            document,
            verdict: None,
        };
        assert!(outcome.into_result().is_ok());
    }

    #[test]
    fn error_classification() {
        assert!(LifecycleError::RemoteUnavailable("timeout".into()).is_retryable());
        assert!(!LifecycleError::RemoteUnavailable("timeout".into()).is_user_facing());
        assert!(LifecycleError::AllocationContention { attempts: 3 }.is_retryable());

        let exceeded = LifecycleError::QuantityExceeded {
            line_id: "L1".into(),
            requested: Decimal::from(5),
            available: Decimal::from(4),
        };
        assert!(exceeded.is_user_facing());
        assert!(!exceeded.is_retryable());

        let slot: LifecycleError = SigningError::MissingExtensionSlot { found: 1 }.into();
        assert!(matches!(slot, LifecycleError::MissingExtensionSlot { found: 1 }));
        assert!(!slot.is_user_facing());

        let password: LifecycleError =
            CertificateError::InvalidCredential("mac verify failure".into()).into();
        assert!(matches!(password, LifecycleError::InvalidCredential(_)));
        assert!(password.is_user_facing());
    }

    #[test]
    fn numbering_errors_map_to_configuration_or_exhaustion() {
        let missing: LifecycleError = NumberingError::MissingResolution.into();
        assert!(matches!(missing, LifecycleError::ConfigurationMissing(_)));
        let exhausted: LifecycleError = NumberingError::Exhausted { to: 10 }.into();
        assert!(matches!(exhausted, LifecycleError::ResolutionExhausted { to: 10 }));
    }
}
