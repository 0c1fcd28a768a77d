//! Normalized webhook event model
//!
//! Provider adapters verify transport signatures and translate their raw
//! payloads into [`WebhookEvent`] before handing them to the dispatcher.
//! The event is a closed union: one variant per event kind, each carrying
//! only the payload that kind can act on, so the dispatcher routes with an
//! exhaustive match instead of probing optional fields.

use std::collections::HashMap;

use ledgerly_shared::PaymentProvider;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::payments::{PaymentStatus, PaymentType};

/// Metadata key carrying a flat credit-package amount on one-time orders.
pub const META_CREDIT_AMOUNT: &str = "creditAmount";
/// Metadata key carrying the package grant's lifetime in days.
pub const META_EXPIRE_DAYS: &str = "expireDays";
pub const META_PLAN_ID: &str = "planId";
pub const META_PRICE_ID: &str = "priceId";

/// Whether a charge is the first charge of a subscription, a recurring
/// charge, or unrelated to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleType {
    Create,
    Renewal,
    None,
}

impl CycleType {
    /// The payment type recorded for a charge of this cycle.
    pub fn payment_type(&self) -> PaymentType {
        match self {
            CycleType::Create => PaymentType::SubscriptionCreate,
            CycleType::Renewal => PaymentType::SubscriptionRenewal,
            CycleType::None => PaymentType::OneTime,
        }
    }
}

/// Provider-agnostic payment payload.
#[derive(Debug, Clone)]
pub struct PaymentInfo {
    pub provider_payment_id: String,
    pub provider_invoice_id: Option<String>,
    pub provider_customer_id: Option<String>,
    pub user_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub amount_cents: i64,
    pub currency: String,
    pub plan_id: Option<String>,
    pub price_id: Option<String>,
    pub cycle_type: CycleType,
    pub metadata: HashMap<String, String>,
}

impl PaymentInfo {
    /// Flat credit-package amount from checkout metadata, if present.
    pub fn credit_amount(&self) -> Option<i64> {
        parse_meta_int(self.metadata.get(META_CREDIT_AMOUNT))
    }

    /// Package grant lifetime in days from checkout metadata, if present.
    ///
    /// The checkout layer serializes an absent value as the string "null".
    pub fn expire_days(&self) -> Option<i64> {
        parse_meta_int(self.metadata.get(META_EXPIRE_DAYS))
    }
}

fn parse_meta_int(raw: Option<&String>) -> Option<i64> {
    let raw = raw?;
    if raw.is_empty() || raw == "null" {
        return None;
    }
    raw.parse().ok()
}

/// Provider-agnostic subscription payload.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub provider_subscription_id: String,
    pub provider_customer_id: Option<String>,
    pub user_id: Option<Uuid>,
    pub plan_id: Option<String>,
    pub price_id: Option<String>,
    /// Provider-reported status, treated opaquely by the core.
    pub status: String,
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

/// Refund payload. Only what the refund branch acts on.
#[derive(Debug, Clone)]
pub struct RefundInfo {
    pub provider_payment_id: String,
    /// Payment status reported alongside the refund (usually `Refunded`,
    /// `Failed` for disputed reversals).
    pub status: PaymentStatus,
    pub amount_cents: Option<i64>,
}

/// A signature-verified, normalized payment-provider notification.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    /// Event kinds with no economic effect; acknowledged and dropped.
    Ignored,
    CheckoutCompleted {
        provider: PaymentProvider,
        payment: PaymentInfo,
    },
    PaymentSucceeded {
        provider: PaymentProvider,
        payment: PaymentInfo,
        subscription: Option<SubscriptionInfo>,
    },
    PaymentFailed {
        provider: PaymentProvider,
        payment: PaymentInfo,
    },
    SubscriptionCreated {
        provider: PaymentProvider,
        subscription: SubscriptionInfo,
    },
    SubscriptionUpdated {
        provider: PaymentProvider,
        subscription: SubscriptionInfo,
    },
    SubscriptionCanceled {
        provider: PaymentProvider,
        subscription: SubscriptionInfo,
    },
    RefundCreated {
        provider: PaymentProvider,
        refund: RefundInfo,
    },
}

impl WebhookEvent {
    /// Stable event-kind label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WebhookEvent::Ignored => "ignored",
            WebhookEvent::CheckoutCompleted { .. } => "checkout.completed",
            WebhookEvent::PaymentSucceeded { .. } => "payment.succeeded",
            WebhookEvent::PaymentFailed { .. } => "payment.failed",
            WebhookEvent::SubscriptionCreated { .. } => "subscription.created",
            WebhookEvent::SubscriptionUpdated { .. } => "subscription.updated",
            WebhookEvent::SubscriptionCanceled { .. } => "subscription.canceled",
            WebhookEvent::RefundCreated { .. } => "refund.created",
        }
    }

    pub fn provider(&self) -> Option<PaymentProvider> {
        match self {
            WebhookEvent::Ignored => None,
            WebhookEvent::CheckoutCompleted { provider, .. }
            | WebhookEvent::PaymentSucceeded { provider, .. }
            | WebhookEvent::PaymentFailed { provider, .. }
            | WebhookEvent::SubscriptionCreated { provider, .. }
            | WebhookEvent::SubscriptionUpdated { provider, .. }
            | WebhookEvent::SubscriptionCanceled { provider, .. }
            | WebhookEvent::RefundCreated { provider, .. } => Some(*provider),
        }
    }
}
