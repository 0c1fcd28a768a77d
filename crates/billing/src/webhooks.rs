//! Webhook event dispatching
//!
//! The dispatcher turns normalized provider events into durable state
//! transitions across orders, payments, subscriptions and the credit
//! ledger. Every mutating branch runs inside one store transaction:
//! a failure after partial writes rolls the whole event back, and the
//! delivery mechanism owns any retry.
//!
//! Duplicate deliveries are expected, not exceptional. Each economic
//! effect is keyed on a provider-side id with a storage uniqueness
//! constraint, so a redelivered or concurrently-delivered event collapses
//! into a logged skip.

use std::sync::Arc;

use ledgerly_shared::PaymentProvider;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::credits::{CreditService, CreditsType, NewCreditTransaction};
use crate::error::{BillingError, BillingResult};
use crate::events::{CycleType, PaymentInfo, RefundInfo, SubscriptionInfo, WebhookEvent};
use crate::orders::{Order, OrderService, OrderStatus};
use crate::payments::{NewPayment, PaymentRefund, PaymentStatus, PaymentType};
use crate::plans::{PlanCreditGrant, PlanCredits};
use crate::store::{InsertOutcome, LedgerStore, LedgerTx};
use crate::subscriptions::{NewSubscription, SubscriptionPatch, SubscriptionService};

/// Policy for an event referencing an order that cannot be found.
///
/// Webhook branches differ: a payment can be recorded without its order
/// (weak reference), while flows that exist only to mutate the order have
/// nothing left to do. The policy is explicit at each call site.
#[derive(Debug, Clone, Copy)]
enum MissingRef {
    /// Log a warning and continue without the reference.
    WarnContinue,
    /// Fail the event with a handled (non-transient) error.
    Abort,
}

/// Routes normalized webhook events to state transitions.
pub struct WebhookDispatcher {
    store: Arc<dyn LedgerStore>,
    credits: Arc<CreditService>,
    orders: Arc<OrderService>,
    subscriptions: Arc<SubscriptionService>,
    plans: Arc<dyn PlanCredits>,
}

impl WebhookDispatcher {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        credits: Arc<CreditService>,
        orders: Arc<OrderService>,
        subscriptions: Arc<SubscriptionService>,
        plans: Arc<dyn PlanCredits>,
    ) -> Self {
        Self {
            store,
            credits,
            orders,
            subscriptions,
            plans,
        }
    }

    /// Process one signature-verified event.
    ///
    /// `Ok(())` means the event is settled: applied, duplicate-skipped, or
    /// acknowledged as irrelevant. `Err` means nothing was committed;
    /// [`BillingError::is_transient`] tells the delivery mechanism whether
    /// redelivery can help.
    pub async fn process(&self, event: WebhookEvent) -> BillingResult<()> {
        if let Some(provider) = event.provider() {
            tracing::info!(
                provider = %provider,
                event_type = event.kind(),
                "Processing webhook event"
            );
        }

        match event {
            WebhookEvent::Ignored => Ok(()),
            WebhookEvent::CheckoutCompleted { provider, payment } => {
                self.handle_checkout_completed(provider, payment).await
            }
            WebhookEvent::PaymentSucceeded {
                provider,
                payment,
                subscription,
            } => {
                self.handle_payment_succeeded(provider, payment, subscription)
                    .await
            }
            WebhookEvent::PaymentFailed { provider, payment } => {
                self.handle_payment_failed(provider, payment).await
            }
            WebhookEvent::SubscriptionCreated {
                provider,
                subscription,
            } => self.handle_subscription_created(provider, subscription).await,
            WebhookEvent::SubscriptionUpdated { subscription, .. } => {
                self.handle_subscription_updated(subscription).await
            }
            WebhookEvent::SubscriptionCanceled { subscription, .. } => {
                self.handle_subscription_canceled(subscription).await
            }
            WebhookEvent::RefundCreated { refund, .. } => {
                self.handle_refund_created(refund).await
            }
        }
    }

    /// One-time checkout completion is a payment success; subscription
    /// checkouts defer to the forthcoming `payment.succeeded` event.
    async fn handle_checkout_completed(
        &self,
        provider: PaymentProvider,
        payment: PaymentInfo,
    ) -> BillingResult<()> {
        if payment.cycle_type == CycleType::Create {
            tracing::info!(
                provider_payment_id = %payment.provider_payment_id,
                "Subscription checkout; waiting for payment.succeeded"
            );
            return Ok(());
        }

        let user_id = payment
            .user_id
            .ok_or(BillingError::MissingField("user_id"))?;
        let order_id = payment.order_id;

        let mut tx = self.store.begin().await?;

        if let Some(existing) = tx
            .find_payment_by_provider_id(&payment.provider_payment_id)
            .await?
        {
            tracing::info!(
                provider_payment_id = %payment.provider_payment_id,
                payment_id = %existing.id,
                "Payment already recorded; skipping duplicate delivery"
            );
            return tx.rollback().await;
        }

        if let Some(order_id) = order_id {
            if let Some(order) = self
                .resolve_order(tx.as_mut(), order_id, MissingRef::WarnContinue)
                .await?
            {
                if order.status == OrderStatus::Pending {
                    self.orders.mark_order_paid_in(tx.as_mut(), order_id).await?;
                }
            }
        }

        if let Some(customer_id) = payment.provider_customer_id.as_deref() {
            self.update_user_provider_customer(tx.as_mut(), user_id, provider, customer_id)
                .await?;
        }

        let inserted = tx
            .insert_payment(NewPayment {
                provider,
                provider_payment_id: payment.provider_payment_id.clone(),
                provider_invoice_id: payment.provider_invoice_id.clone(),
                user_id,
                order_id,
                subscription_id: None,
                payment_type: PaymentType::OneTime,
                amount_cents: payment.amount_cents,
                currency: payment.currency.clone(),
                status: PaymentStatus::Succeeded,
                plan_id: payment.plan_id.clone(),
                price_id: payment.price_id.clone(),
                metadata: payment.metadata.clone(),
            })
            .await?;

        let new_payment = match inserted {
            InsertOutcome::Inserted(row) => row,
            InsertOutcome::DuplicateKey => {
                tracing::info!(
                    provider_payment_id = %payment.provider_payment_id,
                    "Lost idempotency race to a concurrent delivery; skipping"
                );
                return tx.rollback().await;
            }
        };

        if let Some(credit_amount) = payment.credit_amount() {
            let expires_at = payment
                .expire_days()
                .map(|days| OffsetDateTime::now_utc() + Duration::days(days));

            self.credits
                .increase_credits(
                    tx.as_mut(),
                    NewCreditTransaction {
                        user_id,
                        credits: credit_amount,
                        credits_type: CreditsType::AddOneTimePayment,
                        payment_id: Some(new_payment.id),
                        expires_at,
                        description: "Credit package purchase".to_string(),
                    },
                )
                .await?;
        } else if let Some(plan_id) = payment.plan_id.clone() {
            self.plans
                .process_credits(
                    PlanCreditGrant {
                        user_id,
                        plan_id,
                        payment_id: new_payment.id,
                        payment_type: PaymentType::OneTime,
                        period_end: None,
                    },
                    tx.as_mut(),
                )
                .await?;
        }

        tx.commit().await?;

        tracing::info!(
            payment_id = %new_payment.id,
            order_id = ?order_id,
            "Payment created from checkout"
        );
        Ok(())
    }

    async fn handle_payment_succeeded(
        &self,
        provider: PaymentProvider,
        payment: PaymentInfo,
        subscription: Option<SubscriptionInfo>,
    ) -> BillingResult<()> {
        let mut tx = self.store.begin().await?;

        if let Some(existing) = tx
            .find_payment_by_provider_id(&payment.provider_payment_id)
            .await?
        {
            tracing::info!(
                provider_payment_id = %payment.provider_payment_id,
                payment_id = %existing.id,
                "Payment already recorded; skipping duplicate delivery"
            );
            return tx.rollback().await;
        }

        let payment_type = payment.cycle_type.payment_type();
        let mut order_id = payment.order_id;
        let mut user_id = payment.user_id;

        if let Some(resolved_order_id) = order_id {
            match self
                .resolve_order(tx.as_mut(), resolved_order_id, MissingRef::WarnContinue)
                .await?
            {
                Some(order) => {
                    if user_id.is_none() {
                        tracing::info!(
                            order_id = %resolved_order_id,
                            user_id = %order.user_id,
                            "Recovered user id from linked order"
                        );
                        user_id = Some(order.user_id);
                    }
                    if order.status == OrderStatus::Pending {
                        self.orders
                            .mark_order_paid_in(tx.as_mut(), resolved_order_id)
                            .await?;
                    } else {
                        tracing::info!(
                            order_id = %resolved_order_id,
                            status = order.status.as_str(),
                            "Order already settled"
                        );
                    }
                }
                None => {
                    // Weak reference: record the payment without it.
                    order_id = None;
                }
            }
        }

        // A one-time charge carrying neither user nor order was already
        // fully handled by checkout.completed.
        if user_id.is_none() && payment_type == PaymentType::OneTime {
            tracing::info!(
                provider_payment_id = %payment.provider_payment_id,
                "One-time payment without user id; handled by checkout.completed"
            );
            return tx.rollback().await;
        }

        let user_id = user_id.ok_or(BillingError::MissingField("user_id"))?;

        if let Some(customer_id) = payment.provider_customer_id.as_deref() {
            self.update_user_provider_customer(tx.as_mut(), user_id, provider, customer_id)
                .await?;
        }

        let mut subscription_id = None;
        if let Some(sub_info) = subscription.as_ref() {
            match tx
                .find_subscription_by_provider_id(&sub_info.provider_subscription_id)
                .await?
            {
                Some(existing_sub) => {
                    subscription_id = Some(existing_sub.id);
                    if payment_type == PaymentType::SubscriptionRenewal {
                        self.subscriptions
                            .advance_period_in(
                                tx.as_mut(),
                                existing_sub.id,
                                sub_info.current_period_start,
                                sub_info.current_period_end,
                                sub_info.status.clone(),
                            )
                            .await?;
                    }
                }
                None => {
                    tracing::warn!(
                        provider_subscription_id = %sub_info.provider_subscription_id,
                        "Payment references an unknown subscription"
                    );
                }
            }
        }

        let inserted = tx
            .insert_payment(NewPayment {
                provider,
                provider_payment_id: payment.provider_payment_id.clone(),
                provider_invoice_id: payment.provider_invoice_id.clone(),
                user_id,
                order_id,
                subscription_id,
                payment_type,
                amount_cents: payment.amount_cents,
                currency: payment.currency.clone(),
                status: PaymentStatus::Succeeded,
                plan_id: payment.plan_id.clone(),
                price_id: payment.price_id.clone(),
                metadata: payment.metadata.clone(),
            })
            .await?;

        let new_payment = match inserted {
            InsertOutcome::Inserted(row) => row,
            InsertOutcome::DuplicateKey => {
                tracing::info!(
                    provider_payment_id = %payment.provider_payment_id,
                    "Lost idempotency race to a concurrent delivery; skipping"
                );
                return tx.rollback().await;
            }
        };

        if let Some(plan_id) = payment.plan_id.clone() {
            self.plans
                .process_credits(
                    PlanCreditGrant {
                        user_id,
                        plan_id,
                        payment_id: new_payment.id,
                        payment_type,
                        period_end: subscription.as_ref().and_then(|s| s.current_period_end),
                    },
                    tx.as_mut(),
                )
                .await?;
        }

        tx.commit().await?;

        tracing::info!(
            payment_id = %new_payment.id,
            payment_type = payment_type.as_str(),
            order_id = ?order_id,
            "Payment created"
        );
        Ok(())
    }

    /// Failed charges mutate nothing; the provider retries on its own
    /// schedule. Extension point for user notification.
    async fn handle_payment_failed(
        &self,
        provider: PaymentProvider,
        payment: PaymentInfo,
    ) -> BillingResult<()> {
        tracing::warn!(
            provider = %provider,
            provider_payment_id = %payment.provider_payment_id,
            amount_cents = payment.amount_cents,
            "Payment failed"
        );
        Ok(())
    }

    async fn handle_subscription_created(
        &self,
        provider: PaymentProvider,
        subscription: SubscriptionInfo,
    ) -> BillingResult<()> {
        let user_id = subscription
            .user_id
            .ok_or(BillingError::MissingField("user_id"))?;

        let mut tx = self.store.begin().await?;

        if let Some(customer_id) = subscription.provider_customer_id.as_deref() {
            self.update_user_provider_customer(tx.as_mut(), user_id, provider, customer_id)
                .await?;
        }

        let inserted = self
            .subscriptions
            .insert_in(
                tx.as_mut(),
                NewSubscription {
                    provider,
                    provider_subscription_id: subscription.provider_subscription_id.clone(),
                    provider_customer_id: subscription.provider_customer_id.clone(),
                    user_id,
                    plan_id: subscription.plan_id.clone().unwrap_or_default(),
                    price_id: subscription.price_id.clone().unwrap_or_default(),
                    status: subscription.status.clone(),
                    interval: subscription.interval.clone(),
                    amount_cents: subscription.amount_cents,
                    currency: subscription.currency.clone(),
                    current_period_start: subscription.current_period_start,
                    current_period_end: subscription.current_period_end,
                    cancel_at_period_end: subscription.cancel_at_period_end.unwrap_or(false),
                    trial_start: subscription.trial_start,
                    trial_end: subscription.trial_end,
                },
            )
            .await?;

        match inserted {
            InsertOutcome::Inserted(new_subscription) => {
                tx.commit().await?;
                tracing::info!(
                    subscription_id = %new_subscription.id,
                    provider_subscription_id = %new_subscription.provider_subscription_id,
                    "Subscription created"
                );
            }
            InsertOutcome::DuplicateKey => {
                tracing::info!(
                    provider_subscription_id = %subscription.provider_subscription_id,
                    "Subscription already exists; skipping duplicate delivery"
                );
                return tx.rollback().await;
            }
        }
        Ok(())
    }

    async fn handle_subscription_updated(
        &self,
        subscription: SubscriptionInfo,
    ) -> BillingResult<()> {
        let mut tx = self.store.begin().await?;

        let patch = SubscriptionPatch {
            status: Some(subscription.status.clone()),
            plan_id: subscription.plan_id.clone(),
            price_id: subscription.price_id.clone(),
            interval: subscription.interval.clone(),
            amount_cents: subscription.amount_cents,
            currency: subscription.currency.clone(),
            current_period_start: subscription.current_period_start,
            current_period_end: subscription.current_period_end,
            cancel_at_period_end: subscription.cancel_at_period_end,
            canceled_at: subscription.canceled_at,
            cancel_reason: subscription.cancel_reason.clone(),
            trial_start: subscription.trial_start,
            trial_end: subscription.trial_end,
        };

        match self
            .subscriptions
            .update_by_provider_id_in(tx.as_mut(), &subscription.provider_subscription_id, patch)
            .await?
        {
            Some(updated) => {
                tx.commit().await?;
                tracing::info!(
                    subscription_id = %updated.id,
                    status = %updated.status,
                    "Subscription updated"
                );
            }
            None => {
                // Missing reference, not an error: the event may belong to
                // a subscription created before this system existed.
                tracing::warn!(
                    provider_subscription_id = %subscription.provider_subscription_id,
                    "Subscription not found for update"
                );
                return tx.rollback().await;
            }
        }
        Ok(())
    }

    async fn handle_subscription_canceled(
        &self,
        subscription: SubscriptionInfo,
    ) -> BillingResult<()> {
        let mut tx = self.store.begin().await?;

        match self
            .subscriptions
            .cancel_by_provider_id_in(
                tx.as_mut(),
                &subscription.provider_subscription_id,
                subscription.canceled_at,
                subscription.cancel_reason.clone(),
            )
            .await?
        {
            Some(canceled) => {
                tx.commit().await?;
                tracing::info!(
                    subscription_id = %canceled.id,
                    canceled_at = ?canceled.canceled_at,
                    "Subscription canceled"
                );
            }
            None => {
                tracing::warn!(
                    provider_subscription_id = %subscription.provider_subscription_id,
                    "Subscription not found for cancellation"
                );
                return tx.rollback().await;
            }
        }
        Ok(())
    }

    async fn handle_refund_created(&self, refund: RefundInfo) -> BillingResult<()> {
        let mut tx = self.store.begin().await?;

        let updated = tx
            .apply_payment_refund(
                &refund.provider_payment_id,
                PaymentRefund {
                    status: refund.status,
                    refunded_at: OffsetDateTime::now_utc(),
                    refund_amount_cents: refund.amount_cents,
                },
            )
            .await?;

        match updated {
            Some(payment) => {
                if let Some(order_id) = payment.order_id {
                    self.orders
                        .mark_order_refunded_in(tx.as_mut(), order_id)
                        .await?;
                }
                tx.commit().await?;
                tracing::info!(
                    payment_id = %payment.id,
                    order_id = ?payment.order_id,
                    refund_amount_cents = ?refund.amount_cents,
                    "Payment refunded"
                );
            }
            None => {
                tracing::warn!(
                    provider_payment_id = %refund.provider_payment_id,
                    "Payment not found for refund"
                );
                return tx.rollback().await;
            }
        }
        Ok(())
    }

    /// Resolve an order reference under the branch's missing-reference
    /// policy.
    async fn resolve_order(
        &self,
        tx: &mut dyn LedgerTx,
        order_id: Uuid,
        policy: MissingRef,
    ) -> BillingResult<Option<Order>> {
        match tx.find_order(order_id).await? {
            Some(order) => Ok(Some(order)),
            None => match policy {
                MissingRef::WarnContinue => {
                    tracing::warn!(order_id = %order_id, "Order not found");
                    Ok(None)
                }
                MissingRef::Abort => {
                    Err(BillingError::NotFound(format!("order {}", order_id)))
                }
            },
        }
    }

    /// Record the provider's customer id on the user. A missing user row
    /// is a warning: the auth system owns user lifecycle and may lag.
    async fn update_user_provider_customer(
        &self,
        tx: &mut dyn LedgerTx,
        user_id: Uuid,
        provider: PaymentProvider,
        provider_customer_id: &str,
    ) -> BillingResult<()> {
        let updated = tx
            .upsert_provider_customer(user_id, provider, provider_customer_id)
            .await?;
        if updated {
            tracing::info!(
                user_id = %user_id,
                provider = %provider,
                provider_customer_id = %provider_customer_id,
                "Provider customer recorded for user"
            );
        } else {
            tracing::warn!(
                user_id = %user_id,
                "User not found for provider customer update"
            );
        }
        Ok(())
    }
}
