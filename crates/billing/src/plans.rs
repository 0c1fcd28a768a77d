//! Plan-derived credit grants
//!
//! Plan and price configuration lives with the provider adapters, next to
//! the checkout flow that sells them. The dispatcher only needs one
//! capability from that layer: "this payment entitles the user to this
//! plan's credits: append them inside my transaction". The capability is
//! injected so the core stays free of plan tables and independently
//! testable.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::payments::PaymentType;
use crate::store::LedgerTx;

/// One plan-credit grant request.
#[derive(Debug, Clone)]
pub struct PlanCreditGrant {
    pub user_id: Uuid,
    pub plan_id: String,
    /// The payment that triggered the grant; recorded as the ledger
    /// entry's back-reference.
    pub payment_id: Uuid,
    pub payment_type: PaymentType,
    /// For subscription charges: the period the grant covers, used by
    /// implementations that expire subscription credits at period end.
    pub period_end: Option<OffsetDateTime>,
}

/// Opaque capability resolving a plan id to its configured credit grant
/// and appending it inside the caller's transaction.
///
/// Implementations must not open their own transaction and must be safe to
/// skip granting (e.g. a plan with no credit configuration) by returning
/// `Ok(())` without writing.
#[async_trait]
pub trait PlanCredits: Send + Sync {
    async fn process_credits(
        &self,
        grant: PlanCreditGrant,
        tx: &mut dyn LedgerTx,
    ) -> BillingResult<()>;
}

/// No-op implementation for deployments without plan-derived credits.
pub struct NoPlanCredits;

#[async_trait]
impl PlanCredits for NoPlanCredits {
    async fn process_credits(
        &self,
        grant: PlanCreditGrant,
        _tx: &mut dyn LedgerTx,
    ) -> BillingResult<()> {
        tracing::debug!(
            user_id = %grant.user_id,
            plan_id = %grant.plan_id,
            "No plan credit configuration; skipping grant"
        );
        Ok(())
    }
}
