//! Account Subscription Store
//!
//! Persistence for the per-account subscription record. Writes go through
//! an optimistic compare-and-swap on the record version so a losing
//! concurrent writer retries against fresh state instead of overwriting a
//! newer one. Records for different accounts never contend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::plan::PlanTier;
use crate::state_machine::{AccountSubscription, BillingDisplay, SubscriptionStatus};

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Fetch the record, creating it implicitly as free/inactive when the
    /// account has never been seen
    async fn get(&self, account_id: Uuid) -> BillingResult<AccountSubscription>;

    /// Compare-and-swap write: persists `record` only if the stored version
    /// still equals `expected_version`, and bumps the version. Returns
    /// [`BillingError::WriteConflict`] when a concurrent writer won.
    async fn put(
        &self,
        record: &AccountSubscription,
        expected_version: i64,
    ) -> BillingResult<AccountSubscription>;

    /// Reverse lookup from a provider subscription id, used to attribute
    /// invoice events that only reference the subscription
    async fn find_by_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<AccountSubscription>>;

    /// Accounts with a scheduled cancellation whose period end has lapsed
    async fn list_expired(&self, now: OffsetDateTime) -> BillingResult<Vec<Uuid>>;
}

/// Row mapping for `account_subscriptions`
#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    account_id: Uuid,
    plan: String,
    status: String,
    cancel_at_period_end: bool,
    current_period_end: Option<OffsetDateTime>,
    period_end_estimated: bool,
    provider_subscription_id: Option<String>,
    provider_customer_id: Option<String>,
    retired_subscription_id: Option<String>,
    trial_end: Option<OffsetDateTime>,
    billing_amount_cents: Option<i64>,
    billing_currency: Option<String>,
    billing_interval: Option<String>,
    last_applied_event_id: Option<String>,
    last_event_at: Option<OffsetDateTime>,
    version: i64,
}

impl SubscriptionRow {
    fn into_record(self) -> BillingResult<AccountSubscription> {
        Ok(AccountSubscription {
            account_id: self.account_id,
            plan: PlanTier::parse(&self.plan)
                .ok_or_else(|| BillingError::Database(format!("unknown plan '{}'", self.plan)))?,
            status: SubscriptionStatus::parse(&self.status).ok_or_else(|| {
                BillingError::Database(format!("unknown status '{}'", self.status))
            })?,
            cancel_at_period_end: self.cancel_at_period_end,
            current_period_end: self.current_period_end,
            period_end_estimated: self.period_end_estimated,
            provider_subscription_id: self.provider_subscription_id,
            provider_customer_id: self.provider_customer_id,
            retired_subscription_id: self.retired_subscription_id,
            trial_end: self.trial_end,
            billing: BillingDisplay {
                amount_cents: self.billing_amount_cents,
                currency: self.billing_currency,
                interval: self.billing_interval,
            },
            last_applied_event_id: self.last_applied_event_id,
            last_event_at: self.last_event_at,
            version: self.version,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    account_id, plan, status, cancel_at_period_end, current_period_end,
    period_end_estimated, provider_subscription_id, provider_customer_id,
    retired_subscription_id, trial_end, billing_amount_cents,
    billing_currency, billing_interval, last_applied_event_id,
    last_event_at, version
"#;

/// Postgres-backed store
#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn get(&self, account_id: Uuid) -> BillingResult<AccountSubscription> {
        let query = format!(
            "SELECT {} FROM account_subscriptions WHERE account_id = $1",
            SELECT_COLUMNS
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&query)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row.into_record(),
            None => {
                // Implicit provisioning: the record exists from the moment
                // the account is first asked about. Insert-if-absent keeps
                // concurrent first reads safe.
                sqlx::query(
                    r#"
                    INSERT INTO account_subscriptions (account_id)
                    VALUES ($1)
                    ON CONFLICT (account_id) DO NOTHING
                    "#,
                )
                .bind(account_id)
                .execute(&self.pool)
                .await?;
                Ok(AccountSubscription::new_free(account_id))
            }
        }
    }

    async fn put(
        &self,
        record: &AccountSubscription,
        expected_version: i64,
    ) -> BillingResult<AccountSubscription> {
        let result = sqlx::query(
            r#"
            UPDATE account_subscriptions SET
                plan = $2,
                status = $3,
                cancel_at_period_end = $4,
                current_period_end = $5,
                period_end_estimated = $6,
                provider_subscription_id = $7,
                provider_customer_id = $8,
                retired_subscription_id = $9,
                trial_end = $10,
                billing_amount_cents = $11,
                billing_currency = $12,
                billing_interval = $13,
                last_applied_event_id = $14,
                last_event_at = $15,
                version = version + 1,
                updated_at = NOW()
            WHERE account_id = $1 AND version = $16
            "#,
        )
        .bind(record.account_id)
        .bind(record.plan.as_str())
        .bind(record.status.as_str())
        .bind(record.cancel_at_period_end)
        .bind(record.current_period_end)
        .bind(record.period_end_estimated)
        .bind(&record.provider_subscription_id)
        .bind(&record.provider_customer_id)
        .bind(&record.retired_subscription_id)
        .bind(record.trial_end)
        .bind(record.billing.amount_cents)
        .bind(&record.billing.currency)
        .bind(&record.billing.interval)
        .bind(&record.last_applied_event_id)
        .bind(record.last_event_at)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::WriteConflict(record.account_id));
        }

        let mut stored = record.clone();
        stored.version = expected_version + 1;
        Ok(stored)
    }

    async fn find_by_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<AccountSubscription>> {
        let query = format!(
            "SELECT {} FROM account_subscriptions WHERE provider_subscription_id = $1",
            SELECT_COLUMNS
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&query)
            .bind(provider_subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SubscriptionRow::into_record).transpose()
    }

    async fn list_expired(&self, now: OffsetDateTime) -> BillingResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT account_id FROM account_subscriptions
            WHERE cancel_at_period_end = TRUE
              AND current_period_end IS NOT NULL
              AND current_period_end < $1
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

/// In-memory store for tests and single-instance development
#[derive(Clone, Default)]
pub struct InMemorySubscriptionStore {
    records: Arc<Mutex<HashMap<Uuid, AccountSubscription>>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing CAS (test setup only)
    pub async fn seed(&self, record: AccountSubscription) {
        self.records.lock().await.insert(record.account_id, record);
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn get(&self, account_id: Uuid) -> BillingResult<AccountSubscription> {
        let mut records = self.records.lock().await;
        Ok(records
            .entry(account_id)
            .or_insert_with(|| AccountSubscription::new_free(account_id))
            .clone())
    }

    async fn put(
        &self,
        record: &AccountSubscription,
        expected_version: i64,
    ) -> BillingResult<AccountSubscription> {
        let mut records = self.records.lock().await;
        let current_version = records
            .get(&record.account_id)
            .map(|r| r.version)
            .unwrap_or(0);
        if current_version != expected_version {
            return Err(BillingError::WriteConflict(record.account_id));
        }
        let mut stored = record.clone();
        stored.version = expected_version + 1;
        records.insert(record.account_id, stored.clone());
        Ok(stored)
    }

    async fn find_by_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<AccountSubscription>> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .find(|r| {
                r.provider_subscription_id.as_deref() == Some(provider_subscription_id)
            })
            .cloned())
    }

    async fn list_expired(&self, now: OffsetDateTime) -> BillingResult<Vec<Uuid>> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .filter(|r| {
                r.cancel_at_period_end
                    && r.current_period_end.map(|end| end < now).unwrap_or(false)
            })
            .map(|r| r.account_id)
            .collect())
    }
}
