//! Persistence contract for fiscal configuration and document rows.
use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::document::{DocumentType, FiscalDocument};
use crate::tenant::{TenantFiscalConfig, TenantId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} sequence {expected} for tenant {tenant} was taken by another allocation")]
    SequenceConflict {
        tenant: TenantId,
        kind: DocumentType,
        expected: u64,
    },
    #[error("{kind} {source_id} for tenant {tenant} has a newer attempt than the one observed")]
    AttemptSuperseded {
        tenant: TenantId,
        kind: DocumentType,
        source_id: String,
    },
    #[error("tenant {0} has no fiscal configuration")]
    UnknownTenant(TenantId),
    #[error("document {0} does not exist")]
    UnknownDocument(Uuid),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Storage the lifecycle reads and writes.
///
/// `insert_numbered` is the only allocation primitive: it advances the
/// tenant's counter for `kind` and inserts the row in one atomic step. It
/// refuses with `AttemptSuperseded` when the latest attempt for the row's
/// source is no longer `observed_latest`, and with `SequenceConflict` when
/// the counter no longer equals `expected_sequence`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load_config(&self, tenant: &TenantId)
    -> Result<Option<TenantFiscalConfig>, StoreError>;

    async fn put_config(&self, config: TenantFiscalConfig) -> Result<(), StoreError>;

    /// Most recent attempt produced from `source_id`.
    async fn latest_document(
        &self,
        tenant: &TenantId,
        kind: DocumentType,
        source_id: &str,
    ) -> Result<Option<FiscalDocument>, StoreError>;

    async fn get_document(
        &self,
        tenant: &TenantId,
        id: Uuid,
    ) -> Result<Option<FiscalDocument>, StoreError>;

    async fn insert_numbered(
        &self,
        tenant: &TenantId,
        kind: DocumentType,
        expected_sequence: u64,
        observed_latest: Option<Uuid>,
        document: FiscalDocument,
    ) -> Result<(), StoreError>;

    async fn update_document(&self, document: &FiscalDocument) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct StoreState {
    configs: HashMap<TenantId, TenantFiscalConfig>,
    documents: Vec<FiscalDocument>,
}

/// Process-local store; rows are kept in insertion order.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    state: Mutex<StoreState>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_config(config: TenantFiscalConfig) -> Self {
        let store = Self::new();
        store
            .state
            .lock()
            .await
            .configs
            .insert(config.tenant_id.clone(), config);
        store
    }

    /// Every row of `tenant`, oldest first.
    pub async fn documents(&self, tenant: &TenantId) -> Vec<FiscalDocument> {
        self.state
            .lock()
            .await
            .documents
            .iter()
            .filter(|doc| &doc.tenant_id == tenant)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn load_config(
        &self,
        tenant: &TenantId,
    ) -> Result<Option<TenantFiscalConfig>, StoreError> {
        Ok(self.state.lock().await.configs.get(tenant).cloned())
    }

    async fn put_config(&self, config: TenantFiscalConfig) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .configs
            .insert(config.tenant_id.clone(), config);
        Ok(())
    }

    async fn latest_document(
        &self,
        tenant: &TenantId,
        kind: DocumentType,
        source_id: &str,
    ) -> Result<Option<FiscalDocument>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .documents
            .iter()
            .rev()
            .find(|doc| {
                &doc.tenant_id == tenant && doc.document_type == kind && doc.source_id == source_id
            })
            .cloned())
    }

    async fn get_document(
        &self,
        tenant: &TenantId,
        id: Uuid,
    ) -> Result<Option<FiscalDocument>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .documents
            .iter()
            .find(|doc| doc.id == id && &doc.tenant_id == tenant)
            .cloned())
    }

    async fn insert_numbered(
        &self,
        tenant: &TenantId,
        kind: DocumentType,
        expected_sequence: u64,
        observed_latest: Option<Uuid>,
        document: FiscalDocument,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let latest = state
            .documents
            .iter()
            .rev()
            .find(|doc| {
                &doc.tenant_id == tenant
                    && doc.document_type == kind
                    && doc.source_id == document.source_id
            })
            .map(|doc| doc.id);
        if latest != observed_latest {
            return Err(StoreError::AttemptSuperseded {
                tenant: tenant.clone(),
                kind,
                source_id: document.source_id.clone(),
            });
        }
        let config = state
            .configs
            .get_mut(tenant)
            .ok_or_else(|| StoreError::UnknownTenant(tenant.clone()))?;
        if config.counter(kind) != expected_sequence {
            return Err(StoreError::SequenceConflict {
                tenant: tenant.clone(),
                kind,
                expected: expected_sequence,
            });
        }
        config.advance(kind);
        state.documents.push(document);
        Ok(())
    }

    async fn update_document(&self, document: &FiscalDocument) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let row = state
            .documents
            .iter_mut()
            .find(|doc| doc.id == document.id)
            .ok_or(StoreError::UnknownDocument(document.id))?;
        *row = document.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvironmentType;
    use crate::document::amounts::DocumentTotals;
    use crate::document::{DocumentNumber, GeneratedParts};
    use crate::tenant::NoteSeries;
    use chrono::Utc;

    fn config() -> TenantFiscalConfig {
        TenantFiscalConfig {
            tenant_id: TenantId::new("acme"),
            nit: "900123456".into(),
            check_digit: "7".into(),
            legal_name: "Acme SAS".into(),
            trade_name: None,
            address: None,
            software: None,
            resolution: None,
            invoice_counter: 1,
            credit_notes: NoteSeries::new("NC"),
            debit_notes: NoteSeries::new("ND"),
            certificate: None,
            environment: EnvironmentType::Test,
        }
    }

    fn document(sequence: u64, source_id: &str) -> FiscalDocument {
        FiscalDocument::generated(
            GeneratedParts {
                tenant_id: TenantId::new("acme"),
                document_type: DocumentType::CreditNote,
                source_id: source_id.into(),
                original_document_id: None,
                number: DocumentNumber::new("NC", sequence),
                identifier: "0".repeat(96),
                qr_payload: String::new(),
                totals: DocumentTotals::default(),
                issued_at: Utc::now(),
                unsigned_xml: "<CreditNote/>".into(),
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn insert_advances_counter_once() {
        let store = InMemoryDocumentStore::with_config(config()).await;
        let tenant = TenantId::new("acme");
        store
            .insert_numbered(&tenant, DocumentType::CreditNote, 1, None, document(1, "n-1"))
            .await
            .expect("first insert");

        let stale = store
            .insert_numbered(&tenant, DocumentType::CreditNote, 1, None, document(1, "n-2"))
            .await;
        assert!(matches!(
            stale,
            Err(StoreError::SequenceConflict { expected: 1, .. })
        ));

        let cfg = store.load_config(&tenant).await.expect("load").expect("config");
        assert_eq!(cfg.counter(DocumentType::CreditNote), 2);
        assert_eq!(cfg.counter(DocumentType::Invoice), 1);
        assert_eq!(store.documents(&tenant).await.len(), 1);
    }

    #[tokio::test]
    async fn latest_document_is_the_newest_attempt() {
        let store = InMemoryDocumentStore::with_config(config()).await;
        let tenant = TenantId::new("acme");
        let first = document(1, "n-1");
        let second = document(2, "n-1");
        let (first_id, second_id) = (first.id, second.id);
        store
            .insert_numbered(&tenant, DocumentType::CreditNote, 1, None, first)
            .await
            .expect("first");
        store
            .insert_numbered(&tenant, DocumentType::CreditNote, 2, Some(first_id), second)
            .await
            .expect("second");

        let latest = store
            .latest_document(&tenant, DocumentType::CreditNote, "n-1")
            .await
            .expect("query")
            .expect("row");
        assert_eq!(latest.id, second_id);
        assert!(
            store
                .latest_document(&tenant, DocumentType::Invoice, "n-1")
                .await
                .expect("query")
                .is_none()
        );
    }

    #[tokio::test]
    async fn insert_refuses_a_stale_view_of_the_source() {
        let store = InMemoryDocumentStore::with_config(config()).await;
        let tenant = TenantId::new("acme");
        let first = document(1, "n-1");
        let first_id = first.id;
        store
            .insert_numbered(&tenant, DocumentType::CreditNote, 1, None, first)
            .await
            .expect("first");

        let stale = store
            .insert_numbered(&tenant, DocumentType::CreditNote, 2, None, document(2, "n-1"))
            .await;
        match stale {
            Err(StoreError::AttemptSuperseded { source_id, .. }) => assert_eq!(source_id, "n-1"),
            other => panic!("unexpected result: {other:?}"),
        }
        let cfg = store.load_config(&tenant).await.expect("load").expect("config");
        assert_eq!(cfg.counter(DocumentType::CreditNote), 2);
        assert_eq!(store.documents(&tenant).await.len(), 1);

        store
            .insert_numbered(&tenant, DocumentType::CreditNote, 2, Some(first_id), document(2, "n-1"))
            .await
            .expect("reissue");
        store
            .insert_numbered(&tenant, DocumentType::CreditNote, 3, None, document(3, "n-2"))
            .await
            .expect("other source");
        assert_eq!(store.documents(&tenant).await.len(), 3);
    }

    #[tokio::test]
    async fn unknown_rows_and_tenants_are_errors() {
        let store = InMemoryDocumentStore::new();
        let tenant = TenantId::new("ghost");
        let doc = document(1, "n-1");
        assert!(matches!(
            store.update_document(&doc).await,
            Err(StoreError::UnknownDocument(_))
        ));
        assert!(matches!(
            store
                .insert_numbered(&tenant, DocumentType::CreditNote, 1, None, doc)
                .await,
            Err(StoreError::UnknownTenant(_))
        ));
    }
}
