//! Invoice and note records supplied by the host application.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::DocumentType;
use crate::document::amounts::LineItem;
use crate::document::xml::constants::FINAL_CONSUMER_ID;
use crate::tenant::TenantId;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("data source unavailable: {0}")]
    Unavailable(String),
}

/// Buyer of an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counterparty {
    #[serde(default)]
    pub tax_id: Option<String>,
    /// DIAN identification type, `13` for citizenship ID, `31` for NIT.
    #[serde(default = "default_id_scheme")]
    pub id_scheme: String,
    pub name: String,
}

fn default_id_scheme() -> String {
    "13".to_string()
}

impl Counterparty {
    /// Tax ID, or the generic end-consumer ID when none was captured.
    pub fn tax_id(&self) -> &str {
        self.tax_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(FINAL_CONSUMER_ID)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub id: String,
    pub issued_at: DateTime<Utc>,
    pub customer: Counterparty,
    pub lines: Vec<LineItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    Credit,
    Debit,
}

impl NoteKind {
    pub fn document_type(&self) -> DocumentType {
        match self {
            NoteKind::Credit => DocumentType::CreditNote,
            NoteKind::Debit => DocumentType::DebitNote,
        }
    }
}

/// Quantity credited from one line of the original invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditedLine {
    pub line_id: String,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "lines")]
pub enum NoteLines {
    /// Every line of the original invoice, in full.
    Full,
    /// Selected original lines, prorated by quantity.
    Partial(Vec<CreditedLine>),
    /// Free-form adjustment lines unrelated to the original lines.
    Custom(Vec<LineItem>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRecord {
    pub id: String,
    pub kind: NoteKind,
    pub invoice_id: String,
    pub issued_at: DateTime<Utc>,
    /// DIAN discrepancy concept code, e.g. `1` for a partial return.
    pub concept: String,
    pub reason: String,
    pub lines: NoteLines,
    /// Goods come back to stock once the note is accepted.
    #[serde(default)]
    pub restock: bool,
}

/// Read access to the host application's invoices and notes.
#[async_trait]
pub trait InvoiceSource: Send + Sync {
    async fn invoice(
        &self,
        tenant: &TenantId,
        invoice_id: &str,
    ) -> Result<Option<InvoiceRecord>, SourceError>;

    async fn note(&self, tenant: &TenantId, note_id: &str)
    -> Result<Option<NoteRecord>, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_counterparty_id_falls_back_to_final_consumer() {
        let mut buyer = Counterparty {
            tax_id: None,
            id_scheme: "13".into(),
            name: "Walk-in".into(),
        };
        assert_eq!(buyer.tax_id(), "222222222222");
        buyer.tax_id = Some("  ".into());
        assert_eq!(buyer.tax_id(), "222222222222");
        buyer.tax_id = Some("123456789".into());
        assert_eq!(buyer.tax_id(), "123456789");
    }

    #[test]
    fn note_lines_deserialize_by_scope() {
        let partial: NoteLines = serde_json::from_str(
            r#"{"scope":"partial","lines":[{"line_id":"L1","quantity":"2"}]}"#,
        )
        .expect("partial");
        assert_eq!(
            partial,
            NoteLines::Partial(vec![CreditedLine {
                line_id: "L1".into(),
                quantity: Decimal::from(2),
            }])
        );
        let full: NoteLines = serde_json::from_str(r#"{"scope":"full"}"#).expect("full");
        assert_eq!(full, NoteLines::Full);
    }
}
