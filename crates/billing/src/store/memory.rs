//! In-memory ledger store
//!
//! Backs tests and embedded fixtures with the same observable semantics as
//! the Postgres adapter: serialized transactions (an owned mutex guard held
//! for the transaction's lifetime), working-copy isolation (commit swaps
//! the copy in, drop discards it), and uniqueness enforcement on
//! `provider_payment_id` / `provider_subscription_id`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ledgerly_shared::PaymentProvider;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::credits::{CreditTransaction, NewCreditTransaction};
use crate::error::BillingResult;
use crate::orders::{NewOrder, Order, OrderStatus};
use crate::payments::{NewPayment, Payment, PaymentRefund};
use crate::store::{InsertOutcome, LedgerStore, LedgerTx};
use crate::subscriptions::{
    NewSubscription, Subscription, SubscriptionPatch, ACTIVE_STATUSES,
};

#[derive(Default, Clone)]
struct UserRecord {
    provider_customers: HashMap<String, String>,
}

#[derive(Default, Clone)]
struct MemState {
    users: HashMap<Uuid, UserRecord>,
    orders: HashMap<Uuid, Order>,
    /// Keyed by provider_payment_id, the uniqueness constraint.
    payments: HashMap<String, Payment>,
    /// Keyed by provider_subscription_id, the uniqueness constraint.
    subscriptions: HashMap<String, Subscription>,
    credit_transactions: Vec<CreditTransaction>,
}

/// Ledger store held entirely in process memory.
#[derive(Clone, Default)]
pub struct InMemoryLedgerStore {
    state: Arc<Mutex<MemState>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user row. Users are owned by the auth system in production;
    /// fixtures create them directly.
    pub async fn add_user(&self, user_id: Uuid) {
        let mut state = self.state.lock().await;
        state.users.entry(user_id).or_default();
    }

    /// The provider customer id recorded for a user, if any.
    pub async fn provider_customer(
        &self,
        user_id: Uuid,
        provider: PaymentProvider,
    ) -> Option<String> {
        let state = self.state.lock().await;
        state
            .users
            .get(&user_id)?
            .provider_customers
            .get(provider.as_str())
            .cloned()
    }

    /// Every ledger entry for a user, oldest first.
    pub async fn credit_entries(&self, user_id: Uuid) -> Vec<CreditTransaction> {
        let state = self.state.lock().await;
        state
            .credit_transactions
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Number of payment rows in the store.
    pub async fn payment_count(&self) -> usize {
        self.state.lock().await.payments.len()
    }

    /// Number of subscription rows in the store.
    pub async fn subscription_count(&self) -> usize {
        self.state.lock().await.subscriptions.len()
    }
}

struct MemLedgerTx {
    guard: OwnedMutexGuard<MemState>,
    work: MemState,
}

fn balance(state: &MemState, user_id: Uuid, as_of: OffsetDateTime) -> i64 {
    state
        .credit_transactions
        .iter()
        .filter(|entry| entry.user_id == user_id)
        .filter(|entry| {
            entry.credits < 0 || entry.expires_at.map_or(true, |expires| expires > as_of)
        })
        .map(|entry| entry.credits)
        .sum()
}

fn apply_patch(subscription: &mut Subscription, patch: SubscriptionPatch) {
    if let Some(status) = patch.status {
        subscription.status = status;
    }
    if let Some(plan_id) = patch.plan_id {
        subscription.plan_id = plan_id;
    }
    if let Some(price_id) = patch.price_id {
        subscription.price_id = price_id;
    }
    if let Some(interval) = patch.interval {
        subscription.interval = Some(interval);
    }
    if let Some(amount_cents) = patch.amount_cents {
        subscription.amount_cents = Some(amount_cents);
    }
    if let Some(currency) = patch.currency {
        subscription.currency = Some(currency);
    }
    if let Some(start) = patch.current_period_start {
        subscription.current_period_start = Some(start);
    }
    if let Some(end) = patch.current_period_end {
        subscription.current_period_end = Some(end);
    }
    if let Some(cancel_at_period_end) = patch.cancel_at_period_end {
        subscription.cancel_at_period_end = cancel_at_period_end;
    }
    if let Some(canceled_at) = patch.canceled_at {
        subscription.canceled_at = Some(canceled_at);
    }
    if let Some(cancel_reason) = patch.cancel_reason {
        subscription.cancel_reason = Some(cancel_reason);
    }
    if let Some(trial_start) = patch.trial_start {
        subscription.trial_start = Some(trial_start);
    }
    if let Some(trial_end) = patch.trial_end {
        subscription.trial_end = Some(trial_end);
    }
    subscription.updated_at = OffsetDateTime::now_utc();
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn begin(&self) -> BillingResult<Box<dyn LedgerTx>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemLedgerTx { guard, work }))
    }

    async fn find_order(&self, order_id: Uuid) -> BillingResult<Option<Order>> {
        let state = self.state.lock().await;
        Ok(state.orders.get(&order_id).cloned())
    }

    async fn find_payment_by_provider_id(
        &self,
        provider_payment_id: &str,
    ) -> BillingResult<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state.payments.get(provider_payment_id).cloned())
    }

    async fn find_subscription_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let state = self.state.lock().await;
        Ok(state.subscriptions.get(provider_subscription_id).cloned())
    }

    async fn find_active_subscription_by_user_id(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|sub| sub.user_id == user_id)
            .filter(|sub| ACTIVE_STATUSES.contains(&sub.status.as_str()))
            .max_by_key(|sub| sub.created_at)
            .cloned())
    }

    async fn user_credit_balance(
        &self,
        user_id: Uuid,
        as_of: OffsetDateTime,
    ) -> BillingResult<i64> {
        let state = self.state.lock().await;
        Ok(balance(&state, user_id, as_of))
    }

    async fn credit_history_page(
        &self,
        user_id: Uuid,
        offset: u64,
        limit: u64,
        since: Option<OffsetDateTime>,
    ) -> BillingResult<(Vec<CreditTransaction>, i64)> {
        let state = self.state.lock().await;
        // Entries append chronologically; newest first is the reverse.
        let filtered: Vec<CreditTransaction> = state
            .credit_transactions
            .iter()
            .rev()
            .filter(|entry| entry.user_id == user_id)
            .filter(|entry| since.map_or(true, |since| entry.created_at >= since))
            .cloned()
            .collect();

        let total = filtered.len() as i64;
        let items = filtered
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok((items, total))
    }
}

#[async_trait]
impl LedgerTx for MemLedgerTx {
    async fn insert_order(&mut self, new_order: NewOrder) -> BillingResult<Order> {
        let now = OffsetDateTime::now_utc();
        let order = Order {
            id: Uuid::new_v4(),
            user_id: new_order.user_id,
            order_type: new_order.order_type,
            product_id: new_order.product_id,
            product_name: new_order.product_name,
            amount_cents: new_order.amount_cents,
            currency: new_order.currency,
            status: OrderStatus::Pending,
            metadata: new_order.metadata,
            created_at: now,
            updated_at: now,
        };
        self.work.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn find_order(&mut self, order_id: Uuid) -> BillingResult<Option<Order>> {
        Ok(self.work.orders.get(&order_id).cloned())
    }

    async fn update_order_status(
        &mut self,
        order_id: Uuid,
        expected: OrderStatus,
        to: OrderStatus,
    ) -> BillingResult<bool> {
        match self.work.orders.get_mut(&order_id) {
            Some(order) if order.status == expected => {
                order.status = to;
                order.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn upsert_provider_customer(
        &mut self,
        user_id: Uuid,
        provider: PaymentProvider,
        provider_customer_id: &str,
    ) -> BillingResult<bool> {
        match self.work.users.get_mut(&user_id) {
            Some(user) => {
                user.provider_customers
                    .insert(provider.as_str().to_string(), provider_customer_id.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_payment_by_provider_id(
        &mut self,
        provider_payment_id: &str,
    ) -> BillingResult<Option<Payment>> {
        Ok(self.work.payments.get(provider_payment_id).cloned())
    }

    async fn insert_payment(
        &mut self,
        new_payment: NewPayment,
    ) -> BillingResult<InsertOutcome<Payment>> {
        if self
            .work
            .payments
            .contains_key(&new_payment.provider_payment_id)
        {
            return Ok(InsertOutcome::DuplicateKey);
        }

        let payment = Payment {
            id: Uuid::new_v4(),
            provider: new_payment.provider,
            provider_payment_id: new_payment.provider_payment_id.clone(),
            provider_invoice_id: new_payment.provider_invoice_id,
            user_id: new_payment.user_id,
            order_id: new_payment.order_id,
            subscription_id: new_payment.subscription_id,
            payment_type: new_payment.payment_type,
            amount_cents: new_payment.amount_cents,
            currency: new_payment.currency,
            status: new_payment.status,
            plan_id: new_payment.plan_id,
            price_id: new_payment.price_id,
            refunded_at: None,
            refund_amount_cents: None,
            metadata: new_payment.metadata,
            created_at: OffsetDateTime::now_utc(),
        };
        self.work
            .payments
            .insert(payment.provider_payment_id.clone(), payment.clone());
        Ok(InsertOutcome::Inserted(payment))
    }

    async fn apply_payment_refund(
        &mut self,
        provider_payment_id: &str,
        refund: PaymentRefund,
    ) -> BillingResult<Option<Payment>> {
        match self.work.payments.get_mut(provider_payment_id) {
            Some(payment) => {
                payment.status = refund.status;
                payment.refunded_at = Some(refund.refunded_at);
                payment.refund_amount_cents = refund.refund_amount_cents;
                Ok(Some(payment.clone()))
            }
            None => Ok(None),
        }
    }

    async fn find_subscription_by_provider_id(
        &mut self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .work
            .subscriptions
            .get(provider_subscription_id)
            .cloned())
    }

    async fn insert_subscription(
        &mut self,
        new_subscription: NewSubscription,
    ) -> BillingResult<InsertOutcome<Subscription>> {
        if self
            .work
            .subscriptions
            .contains_key(&new_subscription.provider_subscription_id)
        {
            return Ok(InsertOutcome::DuplicateKey);
        }

        let now = OffsetDateTime::now_utc();
        let subscription = Subscription {
            id: Uuid::new_v4(),
            provider: new_subscription.provider,
            provider_subscription_id: new_subscription.provider_subscription_id.clone(),
            provider_customer_id: new_subscription.provider_customer_id,
            user_id: new_subscription.user_id,
            plan_id: new_subscription.plan_id,
            price_id: new_subscription.price_id,
            status: new_subscription.status,
            interval: new_subscription.interval,
            amount_cents: new_subscription.amount_cents,
            currency: new_subscription.currency,
            current_period_start: new_subscription.current_period_start,
            current_period_end: new_subscription.current_period_end,
            cancel_at_period_end: new_subscription.cancel_at_period_end,
            canceled_at: None,
            cancel_reason: None,
            trial_start: new_subscription.trial_start,
            trial_end: new_subscription.trial_end,
            created_at: now,
            updated_at: now,
        };
        self.work.subscriptions.insert(
            subscription.provider_subscription_id.clone(),
            subscription.clone(),
        );
        Ok(InsertOutcome::Inserted(subscription))
    }

    async fn update_subscription_by_provider_id(
        &mut self,
        provider_subscription_id: &str,
        patch: SubscriptionPatch,
    ) -> BillingResult<Option<Subscription>> {
        match self.work.subscriptions.get_mut(provider_subscription_id) {
            Some(subscription) => {
                apply_patch(subscription, patch);
                Ok(Some(subscription.clone()))
            }
            None => Ok(None),
        }
    }

    async fn update_subscription_by_id(
        &mut self,
        subscription_id: Uuid,
        patch: SubscriptionPatch,
    ) -> BillingResult<Option<Subscription>> {
        match self
            .work
            .subscriptions
            .values_mut()
            .find(|sub| sub.id == subscription_id)
        {
            Some(subscription) => {
                apply_patch(subscription, patch);
                Ok(Some(subscription.clone()))
            }
            None => Ok(None),
        }
    }

    async fn insert_credit_transaction(
        &mut self,
        entry: NewCreditTransaction,
    ) -> BillingResult<CreditTransaction> {
        let row = CreditTransaction {
            id: Uuid::new_v4(),
            user_id: entry.user_id,
            credits: entry.credits,
            credits_type: entry.credits_type,
            payment_id: entry.payment_id,
            expires_at: entry.expires_at,
            description: entry.description,
            created_at: OffsetDateTime::now_utc(),
        };
        self.work.credit_transactions.push(row.clone());
        Ok(row)
    }

    async fn user_credit_balance(
        &mut self,
        user_id: Uuid,
        as_of: OffsetDateTime,
    ) -> BillingResult<i64> {
        Ok(balance(&self.work, user_id, as_of))
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        let MemLedgerTx { mut guard, work } = *self;
        *guard = work;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> BillingResult<()> {
        // Dropping the guard discards the working copy.
        Ok(())
    }
}
