// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Ledgerly Billing Core
//!
//! Payment-webhook ingestion and credit-ledger reconciliation. Provider
//! adapters verify signatures and normalize payloads into [`WebhookEvent`];
//! this crate turns those events into idempotent, atomic state transitions
//! across orders, payments, subscriptions and the append-only credit
//! ledger.
//!
//! ## Guarantees
//!
//! - **Exactly-once economic effect** from at-least-once delivery, via
//!   uniqueness constraints on provider payment/subscription ids
//! - **Atomicity**: each event's full set of mutations commits in one
//!   transaction or not at all
//! - **Derived balances**: a user's spendable balance is always computed
//!   from the ledger, never stored as a mutable counter

pub mod credits;
pub mod error;
pub mod events;
pub mod invariants;
pub mod orders;
pub mod payments;
pub mod plans;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Credits
pub use credits::{
    CreditHistoryPage, CreditService, CreditTransaction, CreditsType, NewCreditTransaction,
};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{CycleType, PaymentInfo, RefundInfo, SubscriptionInfo, WebhookEvent};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Orders
pub use orders::{NewOrder, Order, OrderService, OrderStatus, OrderType, Transition};

// Payments
pub use payments::{
    NewPayment, Payment, PaymentRefund, PaymentService, PaymentStatus, PaymentType,
};

// Plans
pub use plans::{NoPlanCredits, PlanCreditGrant, PlanCredits};

// Store
pub use store::{InMemoryLedgerStore, InsertOutcome, LedgerStore, LedgerTx, PgLedgerStore};

// Subscriptions
pub use subscriptions::{
    NewSubscription, Subscription, SubscriptionPatch, SubscriptionService, ACTIVE_STATUSES,
    STATUS_CANCELED,
};

// Webhooks
pub use webhooks::WebhookDispatcher;

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality.
pub struct BillingService {
    pub credits: Arc<CreditService>,
    pub orders: Arc<OrderService>,
    pub payments: PaymentService,
    pub subscriptions: Arc<SubscriptionService>,
    pub webhooks: WebhookDispatcher,
}

impl BillingService {
    /// Create a billing service over any ledger store.
    pub fn new(store: Arc<dyn LedgerStore>, plans: Arc<dyn PlanCredits>) -> Self {
        let credits = Arc::new(CreditService::new(store.clone()));
        let orders = Arc::new(OrderService::new(store.clone()));
        let subscriptions = Arc::new(SubscriptionService::new(store.clone()));
        let webhooks = WebhookDispatcher::new(
            store.clone(),
            credits.clone(),
            orders.clone(),
            subscriptions.clone(),
            plans,
        );

        Self {
            credits,
            orders,
            payments: PaymentService::new(store),
            subscriptions,
            webhooks,
        }
    }

    /// Create a billing service over Postgres.
    pub fn postgres(pool: PgPool, plans: Arc<dyn PlanCredits>) -> Self {
        Self::new(Arc::new(PgLedgerStore::new(pool)), plans)
    }
}
