//! Billing error types
//!
//! One error enum for the whole crate. The variants follow the processing
//! taxonomy: infrastructure failures (`Database`) are transient and worth
//! redelivering, everything else is a handled failure the delivery
//! mechanism should not retry. Duplicate deliveries and missing weak
//! references are not errors at all; those are logged and skipped at the
//! call site.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Storage or transaction failure. Always propagated; the event should
    /// be redelivered.
    #[error("database error: {0}")]
    Database(String),

    /// A field the event cannot be processed without (e.g. no resolvable
    /// user id for a payment). Handled failure; redelivery will not help.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Caller-supplied value out of range (non-positive credit amount,
    /// zero page size, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A usage deduction larger than the user's spendable balance.
    #[error("insufficient credits: requested {requested}, available {available}")]
    InsufficientCredits { requested: i64, available: i64 },

    /// Lookup by primary id failed where the caller required a row
    /// (admin/state-machine entry points, not webhook weak references).
    #[error("{0} not found")]
    NotFound(String),
}

impl BillingError {
    /// Whether redelivering the triggering event could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BillingError::Database(_))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_database_errors_are_transient() {
        assert!(BillingError::Database("timeout".into()).is_transient());
        assert!(!BillingError::MissingField("user_id").is_transient());
        assert!(!BillingError::Validation("credits must be positive".into()).is_transient());
        assert!(!BillingError::InsufficientCredits {
            requested: 10,
            available: 3
        }
        .is_transient());
    }
}
