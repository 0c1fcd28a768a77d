//! Payment records
//!
//! A payment is written once per provider charge and mutated only to add
//! refund fields. `provider_payment_id` carries a storage-level uniqueness
//! constraint; it is the idempotency key that makes at-least-once webhook
//! delivery safe.

use std::collections::HashMap;
use std::sync::Arc;

use ledgerly_shared::PaymentProvider;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::LedgerStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Succeeded,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "succeeded" => Some(PaymentStatus::Succeeded),
            "failed" => Some(PaymentStatus::Failed),
            "refunded" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    OneTime,
    SubscriptionCreate,
    SubscriptionRenewal,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::OneTime => "one_time",
            PaymentType::SubscriptionCreate => "subscription_create",
            PaymentType::SubscriptionRenewal => "subscription_renewal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "one_time" => Some(PaymentType::OneTime),
            "subscription_create" => Some(PaymentType::SubscriptionCreate),
            "subscription_renewal" => Some(PaymentType::SubscriptionRenewal),
            _ => None,
        }
    }
}

/// A recorded charge.
#[derive(Debug, Clone, Serialize)]
pub struct Payment {
    pub id: Uuid,
    pub provider: PaymentProvider,
    pub provider_payment_id: String,
    pub provider_invoice_id: Option<String>,
    pub user_id: Uuid,
    pub order_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub payment_type: PaymentType,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub plan_id: Option<String>,
    pub price_id: Option<String>,
    pub refunded_at: Option<OffsetDateTime>,
    pub refund_amount_cents: Option<i64>,
    pub metadata: HashMap<String, String>,
    pub created_at: OffsetDateTime,
}

/// Insert payload for a new payment row.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub provider: PaymentProvider,
    pub provider_payment_id: String,
    pub provider_invoice_id: Option<String>,
    pub user_id: Uuid,
    pub order_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub payment_type: PaymentType,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub plan_id: Option<String>,
    pub price_id: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Refund fields applied to an existing payment.
#[derive(Debug, Clone)]
pub struct PaymentRefund {
    pub status: PaymentStatus,
    pub refunded_at: OffsetDateTime,
    pub refund_amount_cents: Option<i64>,
}

/// Read-side payment lookups for collaborators outside the webhook path.
pub struct PaymentService {
    store: Arc<dyn LedgerStore>,
}

impl PaymentService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Look up a payment by its provider-side id.
    pub async fn find_by_provider_id(
        &self,
        provider_payment_id: &str,
    ) -> BillingResult<Option<Payment>> {
        self.store
            .find_payment_by_provider_id(provider_payment_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_status_round_trips() {
        for status in [
            PaymentStatus::Succeeded,
            PaymentStatus::Failed,
            PaymentStatus::Refunded,
        ] {
            assert_eq!(PaymentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PaymentStatus::parse("pending"), None);
    }

    #[test]
    fn payment_type_round_trips() {
        for ty in [
            PaymentType::OneTime,
            PaymentType::SubscriptionCreate,
            PaymentType::SubscriptionRenewal,
        ] {
            assert_eq!(PaymentType::parse(ty.as_str()), Some(ty));
        }
    }
}
