//! Ledgerly Shared
//!
//! Types and helpers used by more than one crate in the workspace:
//! database pool construction and the payment-provider identifier shared
//! between the billing core and the provider adapters.

pub mod db;
pub mod types;

pub use db::{create_migration_pool, create_pool};
pub use types::PaymentProvider;
