//! Ledger Invariants Module
//!
//! Runnable consistency checks for the payment and credit tables. These
//! can be run after any webhook replay or backfill to verify the system
//! is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - balances may be wrong
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for credit sign mismatch violation
#[derive(Debug, sqlx::FromRow)]
struct CreditSignRow {
    id: Uuid,
    user_id: Uuid,
    credits: i64,
    credits_type: String,
}

/// Row type for refunded payment violation
#[derive(Debug, sqlx::FromRow)]
struct RefundFieldsRow {
    id: Uuid,
    user_id: Uuid,
    provider_payment_id: String,
}

/// Row type for canceled subscription violation
#[derive(Debug, sqlx::FromRow)]
struct CanceledNoTimestampRow {
    id: Uuid,
    user_id: Uuid,
    provider_subscription_id: String,
}

/// Row type for refunded order violation
#[derive(Debug, sqlx::FromRow)]
struct RefundedOrderRow {
    id: Uuid,
    user_id: Uuid,
}

/// Service for running ledger invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_credit_sign_matches_type().await?);
        violations.extend(self.check_refunded_payment_has_refund_fields().await?);
        violations.extend(self.check_canceled_has_canceled_at().await?);
        violations.extend(self.check_refunded_order_has_refunded_payment().await?);

        let checks_run = 4;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: Ledger entry sign matches its type
    ///
    /// A negative grant or a positive deduction silently corrupts every
    /// balance derivation for that user.
    async fn check_credit_sign_matches_type(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CreditSignRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, credits, credits_type
            FROM credit_transactions
            WHERE (credits_type LIKE 'add_%' AND credits <= 0)
               OR (credits_type LIKE 'deduct_%' AND credits >= 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "credit_sign_matches_type".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Ledger entry {} has type '{}' but credits {}",
                    row.id, row.credits_type, row.credits
                ),
                context: serde_json::json!({
                    "entry_id": row.id,
                    "credits": row.credits,
                    "credits_type": row.credits_type,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Refunded payments carry refund fields
    ///
    /// A payment in `refunded` status without `refunded_at` means the
    /// refund branch half-applied.
    async fn check_refunded_payment_has_refund_fields(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RefundFieldsRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, provider_payment_id
            FROM payments
            WHERE status = 'refunded' AND refunded_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "refunded_payment_has_refund_fields".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Payment {} ({}) is refunded but has no refunded_at",
                    row.id, row.provider_payment_id
                ),
                context: serde_json::json!({
                    "payment_id": row.id,
                    "provider_payment_id": row.provider_payment_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: Canceled subscriptions have a cancellation timestamp
    async fn check_canceled_has_canceled_at(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledNoTimestampRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, provider_subscription_id
            FROM subscriptions
            WHERE status = 'canceled' AND canceled_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_has_canceled_at".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Subscription {} ({}) is canceled without canceled_at",
                    row.id, row.provider_subscription_id
                ),
                context: serde_json::json!({
                    "subscription_id": row.id,
                    "provider_subscription_id": row.provider_subscription_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: Refunded orders are backed by a refunded payment
    ///
    /// An order can only reach `refunded` through a refund event on its
    /// payment; a refunded order with no refunded payment suggests a
    /// manual mutation outside the dispatcher.
    async fn check_refunded_order_has_refunded_payment(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RefundedOrderRow> = sqlx::query_as(
            r#"
            SELECT o.id, o.user_id
            FROM orders o
            WHERE o.status = 'refunded'
              AND NOT EXISTS (
                  SELECT 1 FROM payments p
                  WHERE p.order_id = o.id AND p.status = 'refunded'
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "refunded_order_has_refunded_payment".to_string(),
                user_ids: vec![row.user_id],
                description: format!("Order {} is refunded with no refunded payment", row.id),
                context: serde_json::json!({
                    "order_id": row.id,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "credit_sign_matches_type" => self.check_credit_sign_matches_type().await,
            "refunded_payment_has_refund_fields" => {
                self.check_refunded_payment_has_refund_fields().await
            }
            "canceled_has_canceled_at" => self.check_canceled_has_canceled_at().await,
            "refunded_order_has_refunded_payment" => {
                self.check_refunded_order_has_refunded_payment().await
            }
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "credit_sign_matches_type",
            "refunded_payment_has_refund_fields",
            "canceled_has_canceled_at",
            "refunded_order_has_refunded_payment",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 4);
        assert!(checks.contains(&"credit_sign_matches_type"));
        assert!(checks.contains(&"refunded_order_has_refunded_payment"));
    }
}
