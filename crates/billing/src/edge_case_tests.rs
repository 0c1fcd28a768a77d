// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Webhook Processing and Credit Accounting
//!
//! Exercises the dispatcher and ledger over the in-memory store:
//! - Idempotent delivery (duplicates, concurrent races)
//! - Credit balance derivation (expiry, deductions, caching)
//! - Order state monotonicity
//! - Refund propagation payment -> order
//! - Lenient handling of missing references

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ledgerly_shared::PaymentProvider;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::credits::{CreditsType, NewCreditTransaction};
use crate::error::{BillingError, BillingResult};
use crate::events::{CycleType, PaymentInfo, RefundInfo, SubscriptionInfo, WebhookEvent};
use crate::orders::{NewOrder, OrderStatus, OrderType, Transition};
use crate::payments::{PaymentStatus, PaymentType};
use crate::plans::{PlanCreditGrant, PlanCredits};
use crate::store::{InMemoryLedgerStore, LedgerStore, LedgerTx};
use crate::BillingService;

// =========================================================================
// Test infrastructure
// =========================================================================

/// Grants a fixed number of credits for any plan, the way a real adapter
/// resolves the plan's credit configuration.
struct FixedPlanCredits {
    credits: i64,
}

#[async_trait]
impl PlanCredits for FixedPlanCredits {
    async fn process_credits(
        &self,
        grant: PlanCreditGrant,
        tx: &mut dyn LedgerTx,
    ) -> BillingResult<()> {
        let credits_type = match grant.payment_type {
            PaymentType::OneTime => CreditsType::AddOneTimePayment,
            _ => CreditsType::AddSubscriptionPayment,
        };
        tx.insert_credit_transaction(NewCreditTransaction {
            user_id: grant.user_id,
            credits: self.credits,
            credits_type,
            payment_id: Some(grant.payment_id),
            expires_at: grant.period_end,
            description: format!("Plan {} credits", grant.plan_id),
        })
        .await?;
        Ok(())
    }
}

/// Always fails, to prove nothing commits when a late step fails.
struct FailingPlanCredits;

#[async_trait]
impl PlanCredits for FailingPlanCredits {
    async fn process_credits(
        &self,
        _grant: PlanCreditGrant,
        _tx: &mut dyn LedgerTx,
    ) -> BillingResult<()> {
        Err(BillingError::Database("simulated storage failure".into()))
    }
}

const PLAN_CREDITS: i64 = 500;

fn service(store: &Arc<InMemoryLedgerStore>) -> BillingService {
    BillingService::new(
        store.clone(),
        Arc::new(FixedPlanCredits {
            credits: PLAN_CREDITS,
        }),
    )
}

fn metadata(entries: &[(&str, &str)]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn payment_info(provider_payment_id: &str) -> PaymentInfo {
    PaymentInfo {
        provider_payment_id: provider_payment_id.to_string(),
        provider_invoice_id: None,
        provider_customer_id: None,
        user_id: None,
        order_id: None,
        amount_cents: 999,
        currency: "USD".to_string(),
        plan_id: None,
        price_id: None,
        cycle_type: CycleType::None,
        metadata: HashMap::new(),
    }
}

fn subscription_info(provider_subscription_id: &str, user_id: Uuid) -> SubscriptionInfo {
    SubscriptionInfo {
        provider_subscription_id: provider_subscription_id.to_string(),
        provider_customer_id: Some("cus_123".to_string()),
        user_id: Some(user_id),
        plan_id: Some("pro".to_string()),
        price_id: Some("pro-monthly".to_string()),
        status: "active".to_string(),
        interval: Some("month".to_string()),
        amount_cents: Some(1900),
        currency: Some("USD".to_string()),
        current_period_start: Some(OffsetDateTime::now_utc()),
        current_period_end: Some(OffsetDateTime::now_utc() + Duration::days(30)),
        cancel_at_period_end: Some(false),
        canceled_at: None,
        cancel_reason: None,
        trial_start: None,
        trial_end: None,
    }
}

async fn seed_order(
    svc: &BillingService,
    store: &Arc<InMemoryLedgerStore>,
    user_id: Uuid,
    amount_cents: i64,
) -> Uuid {
    store.add_user(user_id).await;
    let order = svc
        .orders
        .create_order(NewOrder {
            user_id,
            order_type: OrderType::CreditPackage,
            product_id: "price_credits_100".to_string(),
            product_name: Some("100 credits".to_string()),
            amount_cents,
            currency: "USD".to_string(),
            metadata: HashMap::new(),
        })
        .await
        .unwrap();
    order.id
}

// =========================================================================
// Idempotent delivery
// =========================================================================

mod idempotency {
    use super::*;

    #[tokio::test]
    async fn duplicate_payment_succeeded_has_one_economic_effect() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);
        let user_id = Uuid::new_v4();
        store.add_user(user_id).await;

        let mut payment = payment_info("pay_dup");
        payment.user_id = Some(user_id);
        payment.plan_id = Some("pro".to_string());

        let event = WebhookEvent::PaymentSucceeded {
            provider: PaymentProvider::Stripe,
            payment,
            subscription: None,
        };

        svc.webhooks.process(event.clone()).await.unwrap();
        svc.webhooks.process(event).await.unwrap();

        assert_eq!(store.payment_count().await, 1, "exactly one payment row");
        assert_eq!(
            store.credit_entries(user_id).await.len(),
            1,
            "exactly one credit grant"
        );
        assert_eq!(
            svc.credits.get_user_credit_balance(user_id).await.unwrap(),
            PLAN_CREDITS
        );
    }

    #[tokio::test]
    async fn duplicate_checkout_completed_records_one_payment() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);
        let user_id = Uuid::new_v4();
        store.add_user(user_id).await;

        let mut payment = payment_info("pay_checkout_dup");
        payment.user_id = Some(user_id);
        payment.metadata = metadata(&[("creditAmount", "100")]);

        let event = WebhookEvent::CheckoutCompleted {
            provider: PaymentProvider::Creem,
            payment,
        };

        svc.webhooks.process(event.clone()).await.unwrap();
        svc.webhooks.process(event).await.unwrap();

        assert_eq!(store.payment_count().await, 1);
        assert_eq!(
            svc.credits.get_user_credit_balance(user_id).await.unwrap(),
            100
        );
    }

    #[tokio::test]
    async fn concurrent_subscription_created_yields_one_row() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = Arc::new(service(&store));
        let user_id = Uuid::new_v4();
        store.add_user(user_id).await;

        let event = WebhookEvent::SubscriptionCreated {
            provider: PaymentProvider::Stripe,
            subscription: subscription_info("sub_race", user_id),
        };

        let left = {
            let svc = svc.clone();
            let event = event.clone();
            tokio::spawn(async move { svc.webhooks.process(event).await })
        };
        let right = {
            let svc = svc.clone();
            let event = event.clone();
            tokio::spawn(async move { svc.webhooks.process(event).await })
        };

        left.await.unwrap().unwrap();
        right.await.unwrap().unwrap();

        assert_eq!(store.subscription_count().await, 1, "race-safe uniqueness");
    }
}

// =========================================================================
// Checkout completion
// =========================================================================

mod checkout {
    use super::*;

    #[tokio::test]
    async fn subscription_checkout_defers_to_payment_succeeded() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);

        let mut payment = payment_info("pay_sub_checkout");
        payment.user_id = Some(Uuid::new_v4());
        payment.cycle_type = CycleType::Create;

        svc.webhooks
            .process(WebhookEvent::CheckoutCompleted {
                provider: PaymentProvider::Stripe,
                payment,
            })
            .await
            .unwrap();

        assert_eq!(store.payment_count().await, 0, "no payment row yet");
    }

    #[tokio::test]
    async fn credit_package_grant_expires() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);
        let user_id = Uuid::new_v4();
        let order_id = seed_order(&svc, &store, user_id, 999).await;

        let mut payment = payment_info("pay_package");
        payment.user_id = Some(user_id);
        payment.order_id = Some(order_id);
        payment.metadata = metadata(&[("creditAmount", "100"), ("expireDays", "30")]);

        svc.webhooks
            .process(WebhookEvent::CheckoutCompleted {
                provider: PaymentProvider::Creem,
                payment,
            })
            .await
            .unwrap();

        let balance = svc.credits.get_user_credit_balance(user_id).await.unwrap();
        assert_eq!(balance, 100, "package credits granted");

        let after_expiry = OffsetDateTime::now_utc() + Duration::days(31);
        let expired_balance = svc
            .credits
            .balance_as_of(user_id, after_expiry)
            .await
            .unwrap();
        assert_eq!(expired_balance, 0, "grant no longer counts after 31 days");

        let order = svc.orders.find_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
    }

    #[tokio::test]
    async fn missing_user_id_is_a_handled_failure() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);

        let payment = payment_info("pay_no_user");
        let result = svc
            .webhooks
            .process(WebhookEvent::CheckoutCompleted {
                provider: PaymentProvider::Stripe,
                payment,
            })
            .await;

        match result {
            Err(err @ BillingError::MissingField("user_id")) => {
                assert!(!err.is_transient(), "redelivery cannot help");
            }
            other => panic!("expected MissingField error, got {:?}", other.err()),
        }
        assert_eq!(store.payment_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_user_row_still_records_payment() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);
        // User id present on the event, but no user row seeded.
        let user_id = Uuid::new_v4();

        let mut payment = payment_info("pay_no_user_row");
        payment.user_id = Some(user_id);
        payment.provider_customer_id = Some("cus_orphan".to_string());

        svc.webhooks
            .process(WebhookEvent::CheckoutCompleted {
                provider: PaymentProvider::Stripe,
                payment,
            })
            .await
            .unwrap();

        assert_eq!(store.payment_count().await, 1);
        assert_eq!(
            store
                .provider_customer(user_id, PaymentProvider::Stripe)
                .await,
            None
        );
    }

    #[tokio::test]
    async fn provider_customer_id_is_recorded_on_user() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);
        let user_id = Uuid::new_v4();
        store.add_user(user_id).await;

        let mut payment = payment_info("pay_customer");
        payment.user_id = Some(user_id);
        payment.provider_customer_id = Some("cus_recorded".to_string());

        svc.webhooks
            .process(WebhookEvent::CheckoutCompleted {
                provider: PaymentProvider::Creem,
                payment,
            })
            .await
            .unwrap();

        assert_eq!(
            store
                .provider_customer(user_id, PaymentProvider::Creem)
                .await
                .as_deref(),
            Some("cus_recorded")
        );
    }
}

// =========================================================================
// Payment succeeded
// =========================================================================

mod payment_succeeded {
    use super::*;

    #[tokio::test]
    async fn user_id_recovered_from_linked_order() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);
        let user_id = Uuid::new_v4();
        let order_id = seed_order(&svc, &store, user_id, 999).await;

        let mut payment = payment_info("pay_order_user");
        payment.order_id = Some(order_id);

        svc.webhooks
            .process(WebhookEvent::PaymentSucceeded {
                provider: PaymentProvider::Stripe,
                payment,
                subscription: None,
            })
            .await
            .unwrap();

        let recorded = svc
            .payments
            .find_by_provider_id("pay_order_user")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recorded.user_id, user_id);
        assert_eq!(recorded.payment_type, PaymentType::OneTime);

        let order = svc.orders.find_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
    }

    #[tokio::test]
    async fn one_time_without_user_or_order_is_skipped() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);

        // Already handled by checkout.completed on the other path.
        svc.webhooks
            .process(WebhookEvent::PaymentSucceeded {
                provider: PaymentProvider::Creem,
                payment: payment_info("pay_orphan_one_time"),
                subscription: None,
            })
            .await
            .unwrap();

        assert_eq!(store.payment_count().await, 0);
    }

    #[tokio::test]
    async fn subscription_charge_without_user_fails() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);

        let mut payment = payment_info("pay_sub_no_user");
        payment.cycle_type = CycleType::Create;

        let result = svc
            .webhooks
            .process(WebhookEvent::PaymentSucceeded {
                provider: PaymentProvider::Stripe,
                payment,
                subscription: None,
            })
            .await;

        assert!(matches!(result, Err(BillingError::MissingField("user_id"))));
    }

    #[tokio::test]
    async fn renewal_advances_subscription_period() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);
        let user_id = Uuid::new_v4();
        store.add_user(user_id).await;

        svc.webhooks
            .process(WebhookEvent::SubscriptionCreated {
                provider: PaymentProvider::Stripe,
                subscription: subscription_info("sub_renew", user_id),
            })
            .await
            .unwrap();

        let next_start = OffsetDateTime::now_utc() + Duration::days(30);
        let next_end = OffsetDateTime::now_utc() + Duration::days(60);
        let mut renewal_sub = subscription_info("sub_renew", user_id);
        renewal_sub.current_period_start = Some(next_start);
        renewal_sub.current_period_end = Some(next_end);

        let mut payment = payment_info("pay_renewal");
        payment.user_id = Some(user_id);
        payment.plan_id = Some("pro".to_string());
        payment.cycle_type = CycleType::Renewal;

        svc.webhooks
            .process(WebhookEvent::PaymentSucceeded {
                provider: PaymentProvider::Stripe,
                payment,
                subscription: Some(renewal_sub),
            })
            .await
            .unwrap();

        let subscription = svc
            .subscriptions
            .find_by_provider_id("sub_renew")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(subscription.current_period_end, Some(next_end));

        let recorded = svc
            .payments
            .find_by_provider_id("pay_renewal")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recorded.payment_type, PaymentType::SubscriptionRenewal);
        assert_eq!(recorded.subscription_id, Some(subscription.id));

        // Renewal plan credits granted, expiring at period end.
        let entries = store.credit_entries(user_id).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].credits_type, CreditsType::AddSubscriptionPayment);
        assert_eq!(entries[0].expires_at, Some(next_end));
    }

    #[tokio::test]
    async fn failure_after_partial_writes_rolls_back_everything() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = BillingService::new(store.clone(), Arc::new(FailingPlanCredits));
        let user_id = Uuid::new_v4();
        let order_id = seed_order(&svc, &store, user_id, 1900).await;

        let mut payment = payment_info("pay_rollback");
        payment.user_id = Some(user_id);
        payment.order_id = Some(order_id);
        payment.plan_id = Some("pro".to_string());

        let result = svc
            .webhooks
            .process(WebhookEvent::PaymentSucceeded {
                provider: PaymentProvider::Stripe,
                payment,
                subscription: None,
            })
            .await;

        assert!(matches!(result, Err(BillingError::Database(_))));
        assert_eq!(store.payment_count().await, 0, "payment insert rolled back");
        assert_eq!(store.credit_entries(user_id).await.len(), 0);
        let order = svc.orders.find_order(order_id).await.unwrap().unwrap();
        assert_eq!(
            order.status,
            OrderStatus::Pending,
            "order transition rolled back"
        );
    }
}

// =========================================================================
// Subscription lifecycle
// =========================================================================

mod subscription_lifecycle {
    use super::*;

    #[tokio::test]
    async fn update_for_unknown_subscription_warns_without_error() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);

        let result = svc
            .webhooks
            .process(WebhookEvent::SubscriptionUpdated {
                provider: PaymentProvider::Stripe,
                subscription: subscription_info("sub_ghost", Uuid::new_v4()),
            })
            .await;

        assert!(result.is_ok(), "missing subscription is non-fatal");
        assert_eq!(store.subscription_count().await, 0, "no row created");
    }

    #[tokio::test]
    async fn update_applies_only_supplied_fields() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);
        let user_id = Uuid::new_v4();
        store.add_user(user_id).await;

        svc.webhooks
            .process(WebhookEvent::SubscriptionCreated {
                provider: PaymentProvider::Stripe,
                subscription: subscription_info("sub_patch", user_id),
            })
            .await
            .unwrap();

        let mut update = subscription_info("sub_patch", user_id);
        update.status = "past_due".to_string();
        update.plan_id = None;
        update.price_id = None;

        svc.webhooks
            .process(WebhookEvent::SubscriptionUpdated {
                provider: PaymentProvider::Stripe,
                subscription: update,
            })
            .await
            .unwrap();

        let subscription = svc
            .subscriptions
            .find_by_provider_id("sub_patch")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(subscription.status, "past_due");
        assert_eq!(subscription.plan_id, "pro", "absent fields untouched");
    }

    #[tokio::test]
    async fn cancellation_is_terminal_and_timestamped() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);
        let user_id = Uuid::new_v4();
        store.add_user(user_id).await;

        svc.webhooks
            .process(WebhookEvent::SubscriptionCreated {
                provider: PaymentProvider::Creem,
                subscription: subscription_info("sub_cancel", user_id),
            })
            .await
            .unwrap();

        let mut cancel = subscription_info("sub_cancel", user_id);
        cancel.canceled_at = None; // Provider omitted it; default to now.
        cancel.cancel_reason = Some("user requested".to_string());

        svc.webhooks
            .process(WebhookEvent::SubscriptionCanceled {
                provider: PaymentProvider::Creem,
                subscription: cancel,
            })
            .await
            .unwrap();

        let subscription = svc
            .subscriptions
            .find_by_provider_id("sub_cancel")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(subscription.status, crate::subscriptions::STATUS_CANCELED);
        assert!(subscription.cancel_at_period_end);
        assert!(subscription.canceled_at.is_some(), "defaulted to now");
        assert_eq!(subscription.cancel_reason.as_deref(), Some("user requested"));

        let active = svc
            .subscriptions
            .find_active_by_user_id(user_id)
            .await
            .unwrap();
        assert!(active.is_none(), "canceled subscription is not active");
    }
}

// =========================================================================
// Refunds
// =========================================================================

mod refunds {
    use super::*;

    #[tokio::test]
    async fn refund_propagates_to_payment_and_linked_order() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);
        let user_id = Uuid::new_v4();
        let order_id = seed_order(&svc, &store, user_id, 999).await;

        let mut payment = payment_info("pay_refund");
        payment.user_id = Some(user_id);
        payment.order_id = Some(order_id);

        svc.webhooks
            .process(WebhookEvent::CheckoutCompleted {
                provider: PaymentProvider::Stripe,
                payment,
            })
            .await
            .unwrap();

        svc.webhooks
            .process(WebhookEvent::RefundCreated {
                provider: PaymentProvider::Stripe,
                refund: RefundInfo {
                    provider_payment_id: "pay_refund".to_string(),
                    status: PaymentStatus::Refunded,
                    amount_cents: Some(999),
                },
            })
            .await
            .unwrap();

        let recorded = svc
            .payments
            .find_by_provider_id("pay_refund")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recorded.status, PaymentStatus::Refunded);
        assert!(recorded.refunded_at.is_some());
        assert_eq!(recorded.refund_amount_cents, Some(999));

        let order = svc.orders.find_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Refunded);
    }

    #[tokio::test]
    async fn refund_for_unknown_payment_warns_without_error() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);

        let result = svc
            .webhooks
            .process(WebhookEvent::RefundCreated {
                provider: PaymentProvider::Creem,
                refund: RefundInfo {
                    provider_payment_id: "pay_ghost".to_string(),
                    status: PaymentStatus::Refunded,
                    amount_cents: None,
                },
            })
            .await;

        assert!(result.is_ok());
    }
}

// =========================================================================
// Order state machine
// =========================================================================

mod order_monotonicity {
    use super::*;

    #[tokio::test]
    async fn refunded_order_cannot_be_repaid() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);
        let user_id = Uuid::new_v4();
        let order_id = seed_order(&svc, &store, user_id, 999).await;

        assert_eq!(
            svc.orders.mark_order_paid(order_id).await.unwrap(),
            Transition::Applied
        );
        assert_eq!(
            svc.orders.mark_order_refunded(order_id).await.unwrap(),
            Transition::Applied
        );

        // Late or duplicated payment events must not resurrect the order.
        assert_eq!(
            svc.orders.mark_order_paid(order_id).await.unwrap(),
            Transition::Skipped
        );
        let order = svc.orders.find_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Refunded);
    }

    #[tokio::test]
    async fn refunding_a_pending_order_is_skipped_not_fatal() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);
        let user_id = Uuid::new_v4();
        let order_id = seed_order(&svc, &store, user_id, 999).await;

        assert_eq!(
            svc.orders.mark_order_refunded(order_id).await.unwrap(),
            Transition::Skipped
        );
        let order = svc.orders.find_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn marking_an_already_paid_order_is_a_noop() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);
        let user_id = Uuid::new_v4();
        let order_id = seed_order(&svc, &store, user_id, 999).await;

        assert_eq!(
            svc.orders.mark_order_paid(order_id).await.unwrap(),
            Transition::Applied
        );
        assert_eq!(
            svc.orders.mark_order_paid(order_id).await.unwrap(),
            Transition::Skipped
        );
    }
}

// =========================================================================
// Credit accounting
// =========================================================================

mod credit_accounting {
    use super::*;

    #[tokio::test]
    async fn balance_is_grants_minus_deductions_excluding_expired() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);
        let user_id = Uuid::new_v4();
        store.add_user(user_id).await;
        let now = OffsetDateTime::now_utc();

        let mut tx = store.begin().await.unwrap();
        // Unexpired grant.
        svc.credits
            .increase_credits(
                tx.as_mut(),
                NewCreditTransaction {
                    user_id,
                    credits: 100,
                    credits_type: CreditsType::AddOneTimePayment,
                    payment_id: None,
                    expires_at: Some(now + Duration::days(30)),
                    description: "package".to_string(),
                },
            )
            .await
            .unwrap();
        // Already-expired grant: contributes zero.
        svc.credits
            .increase_credits(
                tx.as_mut(),
                NewCreditTransaction {
                    user_id,
                    credits: 40,
                    credits_type: CreditsType::AddSubscriptionPayment,
                    payment_id: None,
                    expires_at: Some(now - Duration::days(1)),
                    description: "stale period".to_string(),
                },
            )
            .await
            .unwrap();
        // Non-expiring grant.
        svc.credits
            .increase_credits(
                tx.as_mut(),
                NewCreditTransaction {
                    user_id,
                    credits: 25,
                    credits_type: CreditsType::AddAdmin,
                    payment_id: None,
                    expires_at: None,
                    description: "goodwill".to_string(),
                },
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        svc.credits
            .deduct_credits(user_id, 30, CreditsType::DeductAiUse, "generation")
            .await
            .unwrap();

        // 100 + 25 - 30; the expired 40 never counts.
        assert_eq!(
            svc.credits.get_user_credit_balance(user_id).await.unwrap(),
            95
        );
    }

    #[tokio::test]
    async fn deduction_beyond_balance_is_rejected() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);
        let user_id = Uuid::new_v4();
        store.add_user(user_id).await;

        let mut tx = store.begin().await.unwrap();
        svc.credits
            .increase_credits(
                tx.as_mut(),
                NewCreditTransaction {
                    user_id,
                    credits: 10,
                    credits_type: CreditsType::AddOneTimePayment,
                    payment_id: None,
                    expires_at: None,
                    description: "small package".to_string(),
                },
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let result = svc
            .credits
            .deduct_credits(user_id, 11, CreditsType::DeductAiUse, "generation")
            .await;

        match result {
            Err(BillingError::InsufficientCredits {
                requested,
                available,
            }) => {
                assert_eq!(requested, 11);
                assert_eq!(available, 10);
            }
            other => panic!("expected InsufficientCredits, got {:?}", other.err()),
        }
        assert_eq!(
            store.credit_entries(user_id).await.len(),
            1,
            "no deduction entry written"
        );
    }

    #[tokio::test]
    async fn sign_and_type_mismatches_are_rejected() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);
        let user_id = Uuid::new_v4();

        let mut tx = store.begin().await.unwrap();
        let zero_grant = svc
            .credits
            .increase_credits(
                tx.as_mut(),
                NewCreditTransaction {
                    user_id,
                    credits: 0,
                    credits_type: CreditsType::AddAdmin,
                    payment_id: None,
                    expires_at: None,
                    description: String::new(),
                },
            )
            .await;
        assert!(matches!(zero_grant, Err(BillingError::Validation(_))));

        let deduction_as_grant = svc
            .credits
            .increase_credits(
                tx.as_mut(),
                NewCreditTransaction {
                    user_id,
                    credits: 10,
                    credits_type: CreditsType::DeductAiUse,
                    payment_id: None,
                    expires_at: None,
                    description: String::new(),
                },
            )
            .await;
        assert!(matches!(deduction_as_grant, Err(BillingError::Validation(_))));
        tx.rollback().await.unwrap();

        let negative_deduction = svc
            .credits
            .deduct_credits(user_id, -5, CreditsType::DeductAiUse, "bad")
            .await;
        assert!(matches!(negative_deduction, Err(BillingError::Validation(_))));
    }

    #[tokio::test]
    async fn balance_cache_is_invalidated_by_mutations() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);
        let user_id = Uuid::new_v4();
        store.add_user(user_id).await;

        // Prime the cache with an empty balance.
        assert_eq!(
            svc.credits.get_user_credit_balance(user_id).await.unwrap(),
            0
        );

        let mut tx = store.begin().await.unwrap();
        svc.credits
            .increase_credits(
                tx.as_mut(),
                NewCreditTransaction {
                    user_id,
                    credits: 50,
                    credits_type: CreditsType::AddAdmin,
                    payment_id: None,
                    expires_at: None,
                    description: "grant".to_string(),
                },
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(
            svc.credits.get_user_credit_balance(user_id).await.unwrap(),
            50,
            "stale cached zero must not be served"
        );

        svc.credits
            .deduct_credits(user_id, 20, CreditsType::DeductAiUse, "usage")
            .await
            .unwrap();
        assert_eq!(
            svc.credits.get_user_credit_balance(user_id).await.unwrap(),
            30
        );
    }

    #[tokio::test]
    async fn history_pages_newest_first_with_clamped_limit() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let svc = service(&store);
        let user_id = Uuid::new_v4();
        store.add_user(user_id).await;

        let mut tx = store.begin().await.unwrap();
        for (index, credits) in [10i64, 20, 30].iter().enumerate() {
            svc.credits
                .increase_credits(
                    tx.as_mut(),
                    NewCreditTransaction {
                        user_id,
                        credits: *credits,
                        credits_type: CreditsType::AddAdmin,
                        payment_id: None,
                        expires_at: None,
                        description: format!("grant {}", index),
                    },
                )
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();

        let first_page = svc
            .credits
            .get_user_credits_history(user_id, 1, 2, None)
            .await
            .unwrap();
        assert_eq!(first_page.total, 3);
        assert_eq!(first_page.items.len(), 2);
        assert_eq!(first_page.items[0].credits, 30, "newest first");

        let second_page = svc
            .credits
            .get_user_credits_history(user_id, 2, 2, None)
            .await
            .unwrap();
        assert_eq!(second_page.items.len(), 1);
        assert_eq!(second_page.items[0].credits, 10);

        let clamped = svc
            .credits
            .get_user_credits_history(user_id, 0, 1_000, None)
            .await
            .unwrap();
        assert_eq!(clamped.page, 1, "page zero clamps to one");
        assert_eq!(clamped.limit, 100, "limit clamps to one hundred");
    }
}
