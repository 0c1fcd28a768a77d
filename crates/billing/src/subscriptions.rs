//! Subscription lifecycle
//!
//! Provider-reported statuses are stored opaquely; the core only assigns
//! meaning to `canceled`, the local terminal marker it writes itself.
//! `provider_subscription_id` is unique at the storage layer, which is
//! what makes concurrent redelivery of `subscription.created` safe.

use std::sync::Arc;

use ledgerly_shared::PaymentProvider;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::{InsertOutcome, LedgerStore, LedgerTx};

/// Terminal status written by this core regardless of provider vocabulary.
pub const STATUS_CANCELED: &str = "canceled";

/// Provider statuses under which a subscription still grants access.
pub const ACTIVE_STATUSES: &[&str] = &["active", "trialing", "past_due"];

/// A recurring billing relationship.
#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub provider: PaymentProvider,
    pub provider_subscription_id: String,
    pub provider_customer_id: Option<String>,
    pub user_id: Uuid,
    pub plan_id: String,
    pub price_id: String,
    pub status: String,
    pub interval: Option<String>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub cancel_reason: Option<String>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Insert payload for `subscription.created`.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub provider: PaymentProvider,
    pub provider_subscription_id: String,
    pub provider_customer_id: Option<String>,
    pub user_id: Uuid,
    pub plan_id: String,
    pub price_id: String,
    pub status: String,
    pub interval: Option<String>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
}

/// Field-level update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPatch {
    pub status: Option<String>,
    pub plan_id: Option<String>,
    pub price_id: Option<String>,
    pub interval: Option<String>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: Option<bool>,
    pub canceled_at: Option<OffsetDateTime>,
    pub cancel_reason: Option<String>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
}

/// Subscription state machine and lookups.
pub struct SubscriptionService {
    store: Arc<dyn LedgerStore>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn find_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        self.store
            .find_subscription_by_provider_id(provider_subscription_id)
            .await
    }

    /// The user's current non-terminal subscription, if any.
    pub async fn find_active_by_user_id(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        self.store.find_active_subscription_by_user_id(user_id).await
    }

    /// Insert inside the caller's transaction. Duplicate provider ids
    /// resolve through the uniqueness constraint, not a pre-read.
    pub async fn insert_in(
        &self,
        tx: &mut dyn LedgerTx,
        new_subscription: NewSubscription,
    ) -> BillingResult<InsertOutcome<Subscription>> {
        tx.insert_subscription(new_subscription).await
    }

    /// Apply a field-level update located by provider id, inside the
    /// caller's transaction. Returns `None` when no such subscription
    /// exists; the caller decides whether that is a warning.
    pub async fn update_by_provider_id_in(
        &self,
        tx: &mut dyn LedgerTx,
        provider_subscription_id: &str,
        patch: SubscriptionPatch,
    ) -> BillingResult<Option<Subscription>> {
        if let Some(new_end) = patch.current_period_end {
            self.warn_if_period_rewinds(tx, provider_subscription_id, new_end)
                .await?;
        }
        tx.update_subscription_by_provider_id(provider_subscription_id, patch)
            .await
    }

    /// Advance period fields and status on a renewal payment.
    pub async fn advance_period_in(
        &self,
        tx: &mut dyn LedgerTx,
        subscription_id: Uuid,
        period_start: Option<OffsetDateTime>,
        period_end: Option<OffsetDateTime>,
        status: String,
    ) -> BillingResult<()> {
        let patch = SubscriptionPatch {
            status: Some(status),
            current_period_start: period_start,
            current_period_end: period_end,
            ..SubscriptionPatch::default()
        };
        tx.update_subscription_by_id(subscription_id, patch).await?;
        tracing::info!(
            subscription_id = %subscription_id,
            period_end = ?period_end,
            "Subscription period advanced for renewal"
        );
        Ok(())
    }

    /// Force-cancel located by provider id, inside the caller's
    /// transaction. Sets the local terminal marker whatever the provider
    /// reported.
    pub async fn cancel_by_provider_id_in(
        &self,
        tx: &mut dyn LedgerTx,
        provider_subscription_id: &str,
        canceled_at: Option<OffsetDateTime>,
        cancel_reason: Option<String>,
    ) -> BillingResult<Option<Subscription>> {
        let patch = SubscriptionPatch {
            status: Some(STATUS_CANCELED.to_string()),
            cancel_at_period_end: Some(true),
            canceled_at: Some(canceled_at.unwrap_or_else(OffsetDateTime::now_utc)),
            cancel_reason,
            ..SubscriptionPatch::default()
        };
        tx.update_subscription_by_provider_id(provider_subscription_id, patch)
            .await
    }

    /// Providers are authoritative for period fields, but a period end
    /// moving backwards is worth surfacing in the logs.
    async fn warn_if_period_rewinds(
        &self,
        tx: &mut dyn LedgerTx,
        provider_subscription_id: &str,
        new_end: OffsetDateTime,
    ) -> BillingResult<()> {
        if let Some(existing) = tx
            .find_subscription_by_provider_id(provider_subscription_id)
            .await?
        {
            if let Some(current_end) = existing.current_period_end {
                if new_end < current_end {
                    tracing::warn!(
                        provider_subscription_id = %provider_subscription_id,
                        current_period_end = %current_end,
                        reported_period_end = %new_end,
                        "Provider reported a period end earlier than the stored one"
                    );
                }
            }
        }
        Ok(())
    }
}
