//! Postgres ledger store
//!
//! Raw SQL over sqlx. Idempotency-bearing inserts use
//! `INSERT...ON CONFLICT...DO NOTHING RETURNING` so a duplicate delivery
//! resolves inside a single statement, never a SELECT-then-INSERT that
//! two redeliveries could race through.

use std::collections::HashMap;

use async_trait::async_trait;
use ledgerly_shared::PaymentProvider;
use sqlx::{PgExecutor, PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::credits::{CreditTransaction, CreditsType, NewCreditTransaction};
use crate::error::{BillingError, BillingResult};
use crate::orders::{NewOrder, Order, OrderStatus, OrderType};
use crate::payments::{NewPayment, Payment, PaymentRefund, PaymentStatus, PaymentType};
use crate::store::{InsertOutcome, LedgerStore, LedgerTx};
use crate::subscriptions::{NewSubscription, Subscription, SubscriptionPatch};

/// Production store backed by Postgres.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the crate's embedded migrations.
    pub async fn migrate(&self) -> BillingResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))
    }
}

struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self) -> BillingResult<Box<dyn LedgerTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerTx { tx }))
    }

    async fn find_order(&self, order_id: Uuid) -> BillingResult<Option<Order>> {
        find_order_query(&self.pool, order_id).await
    }

    async fn find_payment_by_provider_id(
        &self,
        provider_payment_id: &str,
    ) -> BillingResult<Option<Payment>> {
        find_payment_query(&self.pool, provider_payment_id).await
    }

    async fn find_subscription_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        find_subscription_query(&self.pool, provider_subscription_id).await
    }

    async fn find_active_subscription_by_user_id(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT * FROM subscriptions
            WHERE user_id = $1
              AND status IN ('active', 'trialing', 'past_due')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn user_credit_balance(
        &self,
        user_id: Uuid,
        as_of: OffsetDateTime,
    ) -> BillingResult<i64> {
        credit_balance_query(&self.pool, user_id, as_of).await
    }

    async fn credit_history_page(
        &self,
        user_id: Uuid,
        offset: u64,
        limit: u64,
        since: Option<OffsetDateTime>,
    ) -> BillingResult<(Vec<CreditTransaction>, i64)> {
        let rows: Vec<CreditTransactionRow> = sqlx::query_as(
            r#"
            SELECT * FROM credit_transactions
            WHERE user_id = $1
              AND ($2::timestamptz IS NULL OR created_at >= $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(user_id)
        .bind(since)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM credit_transactions
            WHERE user_id = $1
              AND ($2::timestamptz IS NULL OR created_at >= $2)
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let items = rows
            .into_iter()
            .map(CreditTransaction::try_from)
            .collect::<BillingResult<Vec<_>>>()?;
        Ok((items, total))
    }
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn insert_order(&mut self, new_order: NewOrder) -> BillingResult<Order> {
        let row: OrderRow = sqlx::query_as(
            r#"
            INSERT INTO orders
                (id, user_id, order_type, product_id, product_name,
                 amount_cents, currency, status, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new_order.user_id)
        .bind(new_order.order_type.as_str())
        .bind(&new_order.product_id)
        .bind(&new_order.product_name)
        .bind(new_order.amount_cents)
        .bind(&new_order.currency)
        .bind(metadata_to_json(&new_order.metadata))
        .fetch_one(&mut *self.tx)
        .await?;

        Order::try_from(row)
    }

    async fn find_order(&mut self, order_id: Uuid) -> BillingResult<Option<Order>> {
        find_order_query(&mut *self.tx, order_id).await
    }

    async fn update_order_status(
        &mut self,
        order_id: Uuid,
        expected: OrderStatus,
        to: OrderStatus,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(order_id)
        .bind(expected.as_str())
        .bind(to.as_str())
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn upsert_provider_customer(
        &mut self,
        user_id: Uuid,
        provider: PaymentProvider,
        provider_customer_id: &str,
    ) -> BillingResult<bool> {
        let current: Option<Option<String>> = sqlx::query_scalar(
            "SELECT provider_customers ->> $2 FROM users WHERE id = $1",
        )
        .bind(user_id)
        .bind(provider.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        let current = match current {
            Some(current) => current,
            None => return Ok(false),
        };

        if current.as_deref() == Some(provider_customer_id) {
            return Ok(true);
        }

        sqlx::query(
            r#"
            UPDATE users
            SET provider_customers =
                COALESCE(provider_customers, '{}'::jsonb)
                    || jsonb_build_object($2::text, $3::text),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(provider.as_str())
        .bind(provider_customer_id)
        .execute(&mut *self.tx)
        .await?;

        Ok(true)
    }

    async fn find_payment_by_provider_id(
        &mut self,
        provider_payment_id: &str,
    ) -> BillingResult<Option<Payment>> {
        find_payment_query(&mut *self.tx, provider_payment_id).await
    }

    async fn insert_payment(
        &mut self,
        new_payment: NewPayment,
    ) -> BillingResult<InsertOutcome<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(
            r#"
            INSERT INTO payments
                (id, provider, provider_payment_id, provider_invoice_id,
                 user_id, order_id, subscription_id, payment_type,
                 amount_cents, currency, status, plan_id, price_id, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (provider_payment_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new_payment.provider.as_str())
        .bind(&new_payment.provider_payment_id)
        .bind(&new_payment.provider_invoice_id)
        .bind(new_payment.user_id)
        .bind(new_payment.order_id)
        .bind(new_payment.subscription_id)
        .bind(new_payment.payment_type.as_str())
        .bind(new_payment.amount_cents)
        .bind(&new_payment.currency)
        .bind(new_payment.status.as_str())
        .bind(&new_payment.plan_id)
        .bind(&new_payment.price_id)
        .bind(metadata_to_json(&new_payment.metadata))
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => Ok(InsertOutcome::Inserted(Payment::try_from(row)?)),
            None => Ok(InsertOutcome::DuplicateKey),
        }
    }

    async fn apply_payment_refund(
        &mut self,
        provider_payment_id: &str,
        refund: PaymentRefund,
    ) -> BillingResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(
            r#"
            UPDATE payments
            SET status = $2, refunded_at = $3, refund_amount_cents = $4
            WHERE provider_payment_id = $1
            RETURNING *
            "#,
        )
        .bind(provider_payment_id)
        .bind(refund.status.as_str())
        .bind(refund.refunded_at)
        .bind(refund.refund_amount_cents)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(Payment::try_from).transpose()
    }

    async fn find_subscription_by_provider_id(
        &mut self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        find_subscription_query(&mut *self.tx, provider_subscription_id).await
    }

    async fn insert_subscription(
        &mut self,
        new_subscription: NewSubscription,
    ) -> BillingResult<InsertOutcome<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (id, provider, provider_subscription_id, provider_customer_id,
                 user_id, plan_id, price_id, status, interval, amount_cents,
                 currency, current_period_start, current_period_end,
                 cancel_at_period_end, trial_start, trial_end)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16)
            ON CONFLICT (provider_subscription_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new_subscription.provider.as_str())
        .bind(&new_subscription.provider_subscription_id)
        .bind(&new_subscription.provider_customer_id)
        .bind(new_subscription.user_id)
        .bind(&new_subscription.plan_id)
        .bind(&new_subscription.price_id)
        .bind(&new_subscription.status)
        .bind(&new_subscription.interval)
        .bind(new_subscription.amount_cents)
        .bind(&new_subscription.currency)
        .bind(new_subscription.current_period_start)
        .bind(new_subscription.current_period_end)
        .bind(new_subscription.cancel_at_period_end)
        .bind(new_subscription.trial_start)
        .bind(new_subscription.trial_end)
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => Ok(InsertOutcome::Inserted(Subscription::try_from(row)?)),
            None => Ok(InsertOutcome::DuplicateKey),
        }
    }

    async fn update_subscription_by_provider_id(
        &mut self,
        provider_subscription_id: &str,
        patch: SubscriptionPatch,
    ) -> BillingResult<Option<Subscription>> {
        update_subscription_patch(
            &mut self.tx,
            SubscriptionKey::ProviderId(provider_subscription_id),
            patch,
        )
        .await
    }

    async fn update_subscription_by_id(
        &mut self,
        subscription_id: Uuid,
        patch: SubscriptionPatch,
    ) -> BillingResult<Option<Subscription>> {
        update_subscription_patch(&mut self.tx, SubscriptionKey::Id(subscription_id), patch).await
    }

    async fn insert_credit_transaction(
        &mut self,
        entry: NewCreditTransaction,
    ) -> BillingResult<CreditTransaction> {
        let row: CreditTransactionRow = sqlx::query_as(
            r#"
            INSERT INTO credit_transactions
                (id, user_id, credits, credits_type, payment_id, expires_at, description)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.user_id)
        .bind(entry.credits)
        .bind(entry.credits_type.as_str())
        .bind(entry.payment_id)
        .bind(entry.expires_at)
        .bind(&entry.description)
        .fetch_one(&mut *self.tx)
        .await?;

        CreditTransaction::try_from(row)
    }

    async fn user_credit_balance(
        &mut self,
        user_id: Uuid,
        as_of: OffsetDateTime,
    ) -> BillingResult<i64> {
        credit_balance_query(&mut *self.tx, user_id, as_of).await
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> BillingResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// =========================================================================
// Shared queries (pool- and transaction-scoped)
// =========================================================================

async fn find_order_query<'e, E>(executor: E, order_id: Uuid) -> BillingResult<Option<Order>>
where
    E: PgExecutor<'e>,
{
    let row: Option<OrderRow> = sqlx::query_as("SELECT * FROM orders WHERE id = $1")
        .bind(order_id)
        .fetch_optional(executor)
        .await?;

    row.map(Order::try_from).transpose()
}

async fn find_payment_query<'e, E>(
    executor: E,
    provider_payment_id: &str,
) -> BillingResult<Option<Payment>>
where
    E: PgExecutor<'e>,
{
    let row: Option<PaymentRow> =
        sqlx::query_as("SELECT * FROM payments WHERE provider_payment_id = $1")
            .bind(provider_payment_id)
            .fetch_optional(executor)
            .await?;

    row.map(Payment::try_from).transpose()
}

async fn find_subscription_query<'e, E>(
    executor: E,
    provider_subscription_id: &str,
) -> BillingResult<Option<Subscription>>
where
    E: PgExecutor<'e>,
{
    let row: Option<SubscriptionRow> =
        sqlx::query_as("SELECT * FROM subscriptions WHERE provider_subscription_id = $1")
            .bind(provider_subscription_id)
            .fetch_optional(executor)
            .await?;

    row.map(Subscription::try_from).transpose()
}

async fn credit_balance_query<'e, E>(
    executor: E,
    user_id: Uuid,
    as_of: OffsetDateTime,
) -> BillingResult<i64>
where
    E: PgExecutor<'e>,
{
    // Deductions (credits < 0) always count; grants count until expiry.
    let balance: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(credits), 0)::BIGINT
        FROM credit_transactions
        WHERE user_id = $1
          AND (credits < 0 OR expires_at IS NULL OR expires_at > $2)
        "#,
    )
    .bind(user_id)
    .bind(as_of)
    .fetch_one(executor)
    .await?;

    Ok(balance)
}

enum SubscriptionKey<'a> {
    Id(Uuid),
    ProviderId(&'a str),
}

async fn update_subscription_patch(
    tx: &mut Transaction<'static, Postgres>,
    key: SubscriptionKey<'_>,
    patch: SubscriptionPatch,
) -> BillingResult<Option<Subscription>> {
    let key_column = match key {
        SubscriptionKey::Id(_) => "id",
        SubscriptionKey::ProviderId(_) => "provider_subscription_id",
    };
    let sql = format!(
        r#"
        UPDATE subscriptions SET
            status = COALESCE($1, status),
            plan_id = COALESCE($2, plan_id),
            price_id = COALESCE($3, price_id),
            interval = COALESCE($4, interval),
            amount_cents = COALESCE($5, amount_cents),
            currency = COALESCE($6, currency),
            current_period_start = COALESCE($7, current_period_start),
            current_period_end = COALESCE($8, current_period_end),
            cancel_at_period_end = COALESCE($9, cancel_at_period_end),
            canceled_at = COALESCE($10, canceled_at),
            cancel_reason = COALESCE($11, cancel_reason),
            trial_start = COALESCE($12, trial_start),
            trial_end = COALESCE($13, trial_end),
            updated_at = NOW()
        WHERE {key_column} = $14
        RETURNING *
        "#
    );

    let query = sqlx::query_as::<_, SubscriptionRow>(&sql)
        .bind(patch.status)
        .bind(patch.plan_id)
        .bind(patch.price_id)
        .bind(patch.interval)
        .bind(patch.amount_cents)
        .bind(patch.currency)
        .bind(patch.current_period_start)
        .bind(patch.current_period_end)
        .bind(patch.cancel_at_period_end)
        .bind(patch.canceled_at)
        .bind(patch.cancel_reason)
        .bind(patch.trial_start)
        .bind(patch.trial_end);

    let row: Option<SubscriptionRow> = match key {
        SubscriptionKey::Id(id) => query.bind(id),
        SubscriptionKey::ProviderId(provider_id) => query.bind(provider_id.to_string()),
    }
    .fetch_optional(&mut **tx)
    .await?;

    row.map(Subscription::try_from).transpose()
}

// =========================================================================
// Row mapping
// =========================================================================

fn metadata_to_json(metadata: &HashMap<String, String>) -> serde_json::Value {
    serde_json::Value::Object(
        metadata
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect(),
    )
}

fn json_to_metadata(value: serde_json::Value) -> HashMap<String, String> {
    match value {
        serde_json::Value::Object(map) => map
            .into_iter()
            .filter_map(|(k, v)| match v {
                serde_json::Value::String(s) => Some((k, s)),
                other => Some((k, other.to_string())),
            })
            .collect(),
        _ => HashMap::new(),
    }
}

fn decode_error(table: &str, column: &str, value: &str) -> BillingError {
    BillingError::Database(format!(
        "unexpected value in {table}.{column}: {value}"
    ))
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    user_id: Uuid,
    order_type: String,
    product_id: String,
    product_name: Option<String>,
    amount_cents: i64,
    currency: String,
    status: String,
    metadata: serde_json::Value,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<OrderRow> for Order {
    type Error = BillingError;

    fn try_from(row: OrderRow) -> BillingResult<Self> {
        Ok(Order {
            id: row.id,
            user_id: row.user_id,
            order_type: OrderType::parse(&row.order_type)
                .ok_or_else(|| decode_error("orders", "order_type", &row.order_type))?,
            product_id: row.product_id,
            product_name: row.product_name,
            amount_cents: row.amount_cents,
            currency: row.currency,
            status: OrderStatus::parse(&row.status)
                .ok_or_else(|| decode_error("orders", "status", &row.status))?,
            metadata: json_to_metadata(row.metadata),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    provider: String,
    provider_payment_id: String,
    provider_invoice_id: Option<String>,
    user_id: Uuid,
    order_id: Option<Uuid>,
    subscription_id: Option<Uuid>,
    payment_type: String,
    amount_cents: i64,
    currency: String,
    status: String,
    plan_id: Option<String>,
    price_id: Option<String>,
    refunded_at: Option<OffsetDateTime>,
    refund_amount_cents: Option<i64>,
    metadata: serde_json::Value,
    created_at: OffsetDateTime,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = BillingError;

    fn try_from(row: PaymentRow) -> BillingResult<Self> {
        Ok(Payment {
            id: row.id,
            provider: PaymentProvider::parse(&row.provider)
                .ok_or_else(|| decode_error("payments", "provider", &row.provider))?,
            provider_payment_id: row.provider_payment_id,
            provider_invoice_id: row.provider_invoice_id,
            user_id: row.user_id,
            order_id: row.order_id,
            subscription_id: row.subscription_id,
            payment_type: PaymentType::parse(&row.payment_type)
                .ok_or_else(|| decode_error("payments", "payment_type", &row.payment_type))?,
            amount_cents: row.amount_cents,
            currency: row.currency,
            status: PaymentStatus::parse(&row.status)
                .ok_or_else(|| decode_error("payments", "status", &row.status))?,
            plan_id: row.plan_id,
            price_id: row.price_id,
            refunded_at: row.refunded_at,
            refund_amount_cents: row.refund_amount_cents,
            metadata: json_to_metadata(row.metadata),
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    provider: String,
    provider_subscription_id: String,
    provider_customer_id: Option<String>,
    user_id: Uuid,
    plan_id: String,
    price_id: String,
    status: String,
    interval: Option<String>,
    amount_cents: Option<i64>,
    currency: Option<String>,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    canceled_at: Option<OffsetDateTime>,
    cancel_reason: Option<String>,
    trial_start: Option<OffsetDateTime>,
    trial_end: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        Ok(Subscription {
            id: row.id,
            provider: PaymentProvider::parse(&row.provider)
                .ok_or_else(|| decode_error("subscriptions", "provider", &row.provider))?,
            provider_subscription_id: row.provider_subscription_id,
            provider_customer_id: row.provider_customer_id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            price_id: row.price_id,
            status: row.status,
            interval: row.interval,
            amount_cents: row.amount_cents,
            currency: row.currency,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            canceled_at: row.canceled_at,
            cancel_reason: row.cancel_reason,
            trial_start: row.trial_start,
            trial_end: row.trial_end,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CreditTransactionRow {
    id: Uuid,
    user_id: Uuid,
    credits: i64,
    credits_type: String,
    payment_id: Option<Uuid>,
    expires_at: Option<OffsetDateTime>,
    description: String,
    created_at: OffsetDateTime,
}

impl TryFrom<CreditTransactionRow> for CreditTransaction {
    type Error = BillingError;

    fn try_from(row: CreditTransactionRow) -> BillingResult<Self> {
        Ok(CreditTransaction {
            id: row.id,
            user_id: row.user_id,
            credits: row.credits,
            credits_type: CreditsType::parse(&row.credits_type).ok_or_else(|| {
                decode_error("credit_transactions", "credits_type", &row.credits_type)
            })?,
            payment_id: row.payment_id,
            expires_at: row.expires_at,
            description: row.description,
            created_at: row.created_at,
        })
    }
}
