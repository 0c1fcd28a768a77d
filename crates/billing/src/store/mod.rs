//! Ledger store port
//!
//! Every durable effect of webhook processing flows through these two
//! traits. [`LedgerStore`] hands out transactions and serves auto-commit
//! reads; [`LedgerTx`] is the explicit transaction-scoped handle passed
//! into every state-machine and credit-accounting call, so the core never
//! opens ambient connections and commits each event's mutations as one
//! atomic unit.
//!
//! Two adapters ship with the crate: [`PgLedgerStore`] for production and
//! [`InMemoryLedgerStore`] for tests and embedded fixtures. Both enforce
//! the same uniqueness semantics on
//! `provider_payment_id` and `provider_subscription_id`, the constraints
//! that make duplicated, concurrent webhook delivery safe.

mod memory;
mod postgres;

pub use memory::InMemoryLedgerStore;
pub use postgres::PgLedgerStore;

use async_trait::async_trait;
use ledgerly_shared::PaymentProvider;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::credits::{CreditTransaction, NewCreditTransaction};
use crate::error::BillingResult;
use crate::orders::{NewOrder, Order, OrderStatus};
use crate::payments::{NewPayment, Payment, PaymentRefund};
use crate::subscriptions::{NewSubscription, Subscription, SubscriptionPatch};

/// Result of an insert guarded by a uniqueness constraint.
///
/// `DuplicateKey` is not an error: at-least-once delivery makes duplicate
/// inserts an expected outcome that callers log and skip.
#[derive(Debug)]
pub enum InsertOutcome<T> {
    Inserted(T),
    DuplicateKey,
}

impl<T> InsertOutcome<T> {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, InsertOutcome::DuplicateKey)
    }

    pub fn inserted(self) -> Option<T> {
        match self {
            InsertOutcome::Inserted(row) => Some(row),
            InsertOutcome::DuplicateKey => None,
        }
    }
}

/// Durable storage for orders, payments, subscriptions and the credit
/// ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a transaction. All mutations for one webhook event go through
    /// exactly one transaction; dropping it without [`LedgerTx::commit`]
    /// rolls every mutation back.
    async fn begin(&self) -> BillingResult<Box<dyn LedgerTx>>;

    async fn find_order(&self, order_id: Uuid) -> BillingResult<Option<Order>>;

    async fn find_payment_by_provider_id(
        &self,
        provider_payment_id: &str,
    ) -> BillingResult<Option<Payment>>;

    async fn find_subscription_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>>;

    async fn find_active_subscription_by_user_id(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<Subscription>>;

    /// Derived spendable balance at `as_of`: the sum of every deduction
    /// plus every grant that has not expired by that instant.
    async fn user_credit_balance(
        &self,
        user_id: Uuid,
        as_of: OffsetDateTime,
    ) -> BillingResult<i64>;

    /// One page of ledger entries, newest first, plus the total count for
    /// the same filter.
    async fn credit_history_page(
        &self,
        user_id: Uuid,
        offset: u64,
        limit: u64,
        since: Option<OffsetDateTime>,
    ) -> BillingResult<(Vec<CreditTransaction>, i64)>;
}

/// Transaction-scoped row operations.
#[async_trait]
pub trait LedgerTx: Send {
    // Orders
    async fn insert_order(&mut self, new_order: NewOrder) -> BillingResult<Order>;
    async fn find_order(&mut self, order_id: Uuid) -> BillingResult<Option<Order>>;
    /// Guarded compare-and-set; returns whether a row moved from
    /// `expected` to `to`.
    async fn update_order_status(
        &mut self,
        order_id: Uuid,
        expected: OrderStatus,
        to: OrderStatus,
    ) -> BillingResult<bool>;

    // Users
    /// Record the provider's customer id on the user. Returns `false`
    /// (without failing) when the user row does not exist.
    async fn upsert_provider_customer(
        &mut self,
        user_id: Uuid,
        provider: PaymentProvider,
        provider_customer_id: &str,
    ) -> BillingResult<bool>;

    // Payments
    async fn find_payment_by_provider_id(
        &mut self,
        provider_payment_id: &str,
    ) -> BillingResult<Option<Payment>>;
    /// Atomic unique-constraint-guarded insert; two racing deliveries of
    /// the same provider payment id yield exactly one `Inserted`.
    async fn insert_payment(
        &mut self,
        new_payment: NewPayment,
    ) -> BillingResult<InsertOutcome<Payment>>;
    /// Set refund fields on the payment with this provider id. Returns the
    /// updated row, or `None` when no such payment exists.
    async fn apply_payment_refund(
        &mut self,
        provider_payment_id: &str,
        refund: PaymentRefund,
    ) -> BillingResult<Option<Payment>>;

    // Subscriptions
    async fn find_subscription_by_provider_id(
        &mut self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>>;
    async fn insert_subscription(
        &mut self,
        new_subscription: NewSubscription,
    ) -> BillingResult<InsertOutcome<Subscription>>;
    async fn update_subscription_by_provider_id(
        &mut self,
        provider_subscription_id: &str,
        patch: SubscriptionPatch,
    ) -> BillingResult<Option<Subscription>>;
    async fn update_subscription_by_id(
        &mut self,
        subscription_id: Uuid,
        patch: SubscriptionPatch,
    ) -> BillingResult<Option<Subscription>>;

    // Credit ledger
    async fn insert_credit_transaction(
        &mut self,
        entry: NewCreditTransaction,
    ) -> BillingResult<CreditTransaction>;
    async fn user_credit_balance(
        &mut self,
        user_id: Uuid,
        as_of: OffsetDateTime,
    ) -> BillingResult<i64>;

    /// Commit every mutation made through this handle.
    async fn commit(self: Box<Self>) -> BillingResult<()>;

    /// Discard every mutation. Dropping the handle has the same effect;
    /// this exists for call sites that want the rollback visible.
    async fn rollback(self: Box<Self>) -> BillingResult<()>;
}
