//! Order state machine
//!
//! Orders are created by the checkout flow and only ever move
//! pending → paid → refunded. Webhook delivery order across providers is
//! not guaranteed, so invalid transitions are warnings that skip the
//! write, never fatal errors. Transitions are guarded compare-and-set
//! updates so concurrent deliveries cannot double-apply one.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::{LedgerStore, LedgerTx};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Paid,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "paid" => Some(OrderStatus::Paid),
            "refunded" => Some(OrderStatus::Refunded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Subscription,
    CreditPackage,
    Other,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Subscription => "subscription",
            OrderType::CreditPackage => "credit_package",
            OrderType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "subscription" => Some(OrderType::Subscription),
            "credit_package" => Some(OrderType::CreditPackage),
            "other" => Some(OrderType::Other),
            _ => None,
        }
    }
}

/// An intent to pay.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub order_type: OrderType,
    pub product_id: String,
    pub product_name: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: OrderStatus,
    pub metadata: HashMap<String, String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Insert payload for the checkout collaborator (and test fixtures).
/// Orders always start out pending.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: Uuid,
    pub order_type: OrderType,
    pub product_id: String,
    pub product_name: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub metadata: HashMap<String, String>,
}

/// Outcome of a state-machine transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The order was already at (or past) the target state; nothing written.
    Skipped,
}

/// Order lifecycle operations, usable from webhook handling and from
/// non-webhook flows such as admin tooling.
pub struct OrderService {
    store: Arc<dyn LedgerStore>,
}

impl OrderService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn find_order(&self, order_id: Uuid) -> BillingResult<Option<Order>> {
        self.store.find_order(order_id).await
    }

    /// Create a pending order on behalf of the checkout collaborator.
    pub async fn create_order(&self, new_order: NewOrder) -> BillingResult<Order> {
        let mut tx = self.store.begin().await?;
        let order = tx.insert_order(new_order).await?;
        tx.commit().await?;

        tracing::info!(
            order_id = %order.id,
            user_id = %order.user_id,
            order_type = order.order_type.as_str(),
            amount_cents = order.amount_cents,
            "Order created"
        );
        Ok(order)
    }

    /// Mark an order paid, standalone (opens its own transaction scope).
    pub async fn mark_order_paid(&self, order_id: Uuid) -> BillingResult<Transition> {
        let mut tx = self.store.begin().await?;
        let transition = self.mark_order_paid_in(tx.as_mut(), order_id).await?;
        tx.commit().await?;
        Ok(transition)
    }

    /// Mark an order refunded, standalone.
    pub async fn mark_order_refunded(&self, order_id: Uuid) -> BillingResult<Transition> {
        let mut tx = self.store.begin().await?;
        let transition = self.mark_order_refunded_in(tx.as_mut(), order_id).await?;
        tx.commit().await?;
        Ok(transition)
    }

    /// Mark an order paid inside the caller's transaction.
    ///
    /// No-op when the order is already paid; refunded orders are terminal
    /// and only logged.
    pub async fn mark_order_paid_in(
        &self,
        tx: &mut dyn LedgerTx,
        order_id: Uuid,
    ) -> BillingResult<Transition> {
        let applied = tx
            .update_order_status(order_id, OrderStatus::Pending, OrderStatus::Paid)
            .await?;
        if applied {
            tracing::info!(order_id = %order_id, "Order marked as paid");
            return Ok(Transition::Applied);
        }

        match tx.find_order(order_id).await? {
            Some(order) if order.status == OrderStatus::Paid => {
                tracing::info!(order_id = %order_id, "Order already paid");
                Ok(Transition::Skipped)
            }
            Some(order) => {
                tracing::warn!(
                    order_id = %order_id,
                    status = order.status.as_str(),
                    "Cannot mark order paid from its current status"
                );
                Ok(Transition::Skipped)
            }
            None => Err(BillingError::NotFound(format!("order {}", order_id))),
        }
    }

    /// Mark an order refunded inside the caller's transaction.
    ///
    /// Refunding an order that never reached paid is a warning and a skip:
    /// the refund event may have raced ahead of the payment event.
    pub async fn mark_order_refunded_in(
        &self,
        tx: &mut dyn LedgerTx,
        order_id: Uuid,
    ) -> BillingResult<Transition> {
        let applied = tx
            .update_order_status(order_id, OrderStatus::Paid, OrderStatus::Refunded)
            .await?;
        if applied {
            tracing::info!(order_id = %order_id, "Order marked as refunded");
            return Ok(Transition::Applied);
        }

        match tx.find_order(order_id).await? {
            Some(order) if order.status == OrderStatus::Refunded => {
                tracing::info!(order_id = %order_id, "Order already refunded");
                Ok(Transition::Skipped)
            }
            Some(order) => {
                tracing::warn!(
                    order_id = %order_id,
                    status = order.status.as_str(),
                    "Cannot refund order from its current status"
                );
                Ok(Transition::Skipped)
            }
            None => Err(BillingError::NotFound(format!("order {}", order_id))),
        }
    }
}
