//! Idempotency Ledger
//!
//! Durable record of which provider event ids have already been applied.
//! `mark_applied` is a single atomic insert that fails (never overwrites)
//! when the id already exists, so two concurrent deliveries of the same
//! event race safely: exactly one wins, the other exits as a no-op success.
//! Entries are never deleted; they double as an audit trail.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of attempting to claim an event id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// This caller owns the first application of the event
    Recorded,
    /// Another delivery already recorded the event
    AlreadyApplied,
}

/// A recorded application, immutable once written
#[derive(Debug, Clone)]
pub struct AppliedEventRecord {
    pub event_id: String,
    pub account_id: Uuid,
    pub event_type: String,
    pub applied_at: OffsetDateTime,
}

#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// Lookup before any mutating work
    async fn has_been_applied(&self, event_id: &str) -> BillingResult<bool>;

    /// Atomic insert-if-absent; the last step of successful processing
    async fn mark_applied(
        &self,
        event_id: &str,
        account_id: Uuid,
        event_type: &str,
    ) -> BillingResult<MarkOutcome>;
}

/// Postgres-backed ledger
#[derive(Clone)]
pub struct PgEventLedger {
    pool: PgPool,
}

impl PgEventLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyLedger for PgEventLedger {
    async fn has_been_applied(&self, event_id: &str) -> BillingResult<bool> {
        let exists: Option<(String,)> =
            sqlx::query_as("SELECT event_id FROM billing_applied_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(exists.is_some())
    }

    async fn mark_applied(
        &self,
        event_id: &str,
        account_id: Uuid,
        event_type: &str,
    ) -> BillingResult<MarkOutcome> {
        // ON CONFLICT DO NOTHING makes the insert the synchronization
        // point: zero rows affected means another delivery won the race.
        let result = sqlx::query(
            r#"
            INSERT INTO billing_applied_events (event_id, account_id, event_type, applied_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(account_id)
        .bind(event_type)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(MarkOutcome::AlreadyApplied)
        } else {
            Ok(MarkOutcome::Recorded)
        }
    }
}

/// In-memory ledger for tests and single-instance deployments
#[derive(Clone, Default)]
pub struct InMemoryEventLedger {
    entries: Arc<Mutex<HashMap<String, AppliedEventRecord>>>,
}

impl InMemoryEventLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, event_id: &str) -> Option<AppliedEventRecord> {
        self.entries.lock().await.get(event_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryEventLedger {
    async fn has_been_applied(&self, event_id: &str) -> BillingResult<bool> {
        Ok(self.entries.lock().await.contains_key(event_id))
    }

    async fn mark_applied(
        &self,
        event_id: &str,
        account_id: Uuid,
        event_type: &str,
    ) -> BillingResult<MarkOutcome> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(event_id) {
            return Ok(MarkOutcome::AlreadyApplied);
        }
        entries.insert(
            event_id.to_string(),
            AppliedEventRecord {
                event_id: event_id.to_string(),
                account_id,
                event_type: event_type.to_string(),
                applied_at: OffsetDateTime::now_utc(),
            },
        );
        Ok(MarkOutcome::Recorded)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mark_applied_is_first_writer_wins() {
        let ledger = InMemoryEventLedger::new();
        let account = Uuid::new_v4();

        let first = ledger
            .mark_applied("evt_1", account, "customer.subscription.updated")
            .await
            .unwrap();
        assert_eq!(first, MarkOutcome::Recorded);

        let second = ledger
            .mark_applied("evt_1", account, "customer.subscription.updated")
            .await
            .unwrap();
        assert_eq!(second, MarkOutcome::AlreadyApplied);
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_marks_record_exactly_one() {
        use tokio::sync::Barrier;

        let ledger = Arc::new(InMemoryEventLedger::new());
        let account = Uuid::new_v4();
        let barrier = Arc::new(Barrier::new(8));
        let mut handles = vec![];

        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                ledger
                    .mark_applied("evt_race", account, "invoice.payment_failed")
                    .await
                    .unwrap()
            }));
        }

        let mut recorded = 0;
        for handle in handles {
            if handle.await.unwrap() == MarkOutcome::Recorded {
                recorded += 1;
            }
        }
        assert_eq!(recorded, 1, "Exactly one concurrent delivery must win");
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn lookup_reflects_marks() {
        let ledger = InMemoryEventLedger::new();
        assert!(!ledger.has_been_applied("evt_x").await.unwrap());
        ledger
            .mark_applied("evt_x", Uuid::new_v4(), "checkout.session.completed")
            .await
            .unwrap();
        assert!(ledger.has_been_applied("evt_x").await.unwrap());
    }
}
