//! Domain events raised after acceptance, and the consumer that forwards
//! them to the accounting side.
use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use uuid::Uuid;

use crate::document::amounts::DocumentTotals;
use crate::document::{DocumentType, FiscalDocument};
use crate::tenant::TenantId;

/// Summary of an accepted document handed to the accounting bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedDocument {
    pub document_id: Uuid,
    pub tenant_id: TenantId,
    pub document_type: DocumentType,
    pub source_id: String,
    pub number: String,
    pub identifier: String,
    pub totals: DocumentTotals,
    pub accepted_at: DateTime<Utc>,
}

impl AcceptedDocument {
    pub fn from_document(document: &FiscalDocument) -> Self {
        Self {
            document_id: document.id,
            tenant_id: document.tenant_id.clone(),
            document_type: document.document_type,
            source_id: document.source_id.clone(),
            number: document.number.to_string(),
            identifier: document.identifier.clone(),
            totals: document.totals,
            accepted_at: document.accepted_at.unwrap_or(document.created_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestockLine {
    pub line_id: String,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    DocumentAccepted {
        document: AcceptedDocument,
        /// Empty unless the document is a return-type credit note.
        restock: Vec<RestockLine>,
    },
}

#[derive(Debug, Error)]
#[error("accounting bridge failure: {0}")]
pub struct BridgeError(pub String);

/// Accounting and inventory side effects of an accepted document.
#[async_trait]
pub trait AccountingBridge: Send + Sync {
    async fn on_document_accepted(&self, document: &AcceptedDocument) -> Result<(), BridgeError>;

    async fn restore_stock(
        &self,
        document: &AcceptedDocument,
        lines: &[RestockLine],
    ) -> Result<(), BridgeError>;
}

/// Sending half handed to the lifecycle. Publishing never blocks or fails the caller.
#[derive(Debug, Clone, Default)]
pub struct EventPublisher {
    sender: Option<mpsc::UnboundedSender<DomainEvent>>,
}

impl EventPublisher {
    pub fn channel() -> (EventPublisher, mpsc::UnboundedReceiver<DomainEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            EventPublisher {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// Publisher that drops every event.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: DomainEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        if sender.send(event).is_err() {
            tracing::warn!("event consumer is gone, dropping domain event");
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

/// Apply events to `bridge` until every publisher is dropped.
///
/// Each bridge call is retried with exponential backoff; a call that still
/// fails is logged and the consumer moves on.
pub fn spawn_event_consumer(
    mut receiver: mpsc::UnboundedReceiver<DomainEvent>,
    bridge: Arc<dyn AccountingBridge>,
    policy: RetryPolicy,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            match event {
                DomainEvent::DocumentAccepted { document, restock } => {
                    let bridge = bridge.as_ref();
                    let summary = &document;
                    with_retry(policy, "on_document_accepted", summary, move || {
                        bridge.on_document_accepted(summary)
                    })
                    .await;
                    if !restock.is_empty() {
                        let lines = restock.as_slice();
                        with_retry(policy, "restore_stock", summary, move || {
                            bridge.restore_stock(summary, lines)
                        })
                        .await;
                    }
                }
            }
        }
        tracing::debug!("event consumer stopped");
    })
}

async fn with_retry<F, Fut>(
    policy: RetryPolicy,
    operation: &'static str,
    document: &AcceptedDocument,
    mut call: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), BridgeError>>,
{
    let attempts = policy.attempts.max(1);
    let mut backoff = policy.initial_backoff;
    for attempt in 1..=attempts {
        match call().await {
            Ok(()) => return,
            Err(err) if attempt < attempts => {
                tracing::debug!(operation, attempt, error = %err, "bridge call failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(err) => {
                tracing::warn!(
                    operation,
                    attempts,
                    tenant = %document.tenant_id,
                    number = %document.number,
                    error = %err,
                    "giving up on accounting side effect"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FlakyBridge {
        failures_left: AtomicU32,
        accepted: Mutex<Vec<String>>,
        restocked: Mutex<Vec<RestockLine>>,
    }

    #[async_trait]
    impl AccountingBridge for FlakyBridge {
        async fn on_document_accepted(&self, document: &AcceptedDocument) -> Result<(), BridgeError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(BridgeError("ledger offline".into()));
            }
            self.accepted.lock().await.push(document.number.clone());
            Ok(())
        }

        async fn restore_stock(
            &self,
            _document: &AcceptedDocument,
            lines: &[RestockLine],
        ) -> Result<(), BridgeError> {
            self.restocked.lock().await.extend_from_slice(lines);
            Ok(())
        }
    }

    fn summary(number: &str) -> AcceptedDocument {
        AcceptedDocument {
            document_id: Uuid::new_v4(),
            tenant_id: TenantId::new("acme"),
            document_type: DocumentType::CreditNote,
            source_id: "n-1".into(),
            number: number.into(),
            identifier: "0".repeat(96),
            totals: DocumentTotals::default(),
            accepted_at: Utc::now(),
        }
    }

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            initial_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn transient_bridge_failures_are_retried() {
        let bridge = Arc::new(FlakyBridge {
            failures_left: AtomicU32::new(2),
            ..Default::default()
        });
        let (publisher, receiver) = EventPublisher::channel();
        let handle = spawn_event_consumer(receiver, bridge.clone(), fast_policy(3));

        publisher.publish(DomainEvent::DocumentAccepted {
            document: summary("NC00000001"),
            restock: vec![RestockLine {
                line_id: "L1".into(),
                quantity: Decimal::from(2),
            }],
        });
        drop(publisher);
        handle.await.expect("consumer");

        assert_eq!(*bridge.accepted.lock().await, vec!["NC00000001".to_string()]);
        assert_eq!(bridge.restocked.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_do_not_stop_the_consumer() {
        let bridge = Arc::new(FlakyBridge {
            failures_left: AtomicU32::new(2),
            ..Default::default()
        });
        let (publisher, receiver) = EventPublisher::channel();
        let handle = spawn_event_consumer(receiver, bridge.clone(), fast_policy(2));

        publisher.publish(DomainEvent::DocumentAccepted {
            document: summary("NC00000001"),
            restock: Vec::new(),
        });
        publisher.publish(DomainEvent::DocumentAccepted {
            document: summary("NC00000002"),
            restock: Vec::new(),
        });
        drop(publisher);
        handle.await.expect("consumer");

        assert_eq!(*bridge.accepted.lock().await, vec!["NC00000002".to_string()]);
    }

    #[test]
    fn disabled_publisher_swallows_events() {
        EventPublisher::disabled().publish(DomainEvent::DocumentAccepted {
            document: summary("NC00000001"),
            restock: Vec::new(),
        });
    }
}
