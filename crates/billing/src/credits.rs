//! Credit accounting
//!
//! The credit ledger is append-only: grants are positive entries,
//! deductions negative, and a user's spendable balance is always derived
//! from the history; there is no mutable counter to drift. Expired grants
//! contribute zero; deductions always count.
//!
//! Balance reads go through a short-lived TTL cache that exists purely for
//! request latency. Every credit mutation invalidates the cache entry, so
//! the cache can serve stale data for at most the TTL and never feeds back
//! into the ledger.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::{LedgerStore, LedgerTx};

/// How long a computed balance may be served without recomputation.
const BALANCE_CACHE_TTL: Duration = Duration::from_secs(30);

/// Enumerated reason for a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditsType {
    AddSubscriptionPayment,
    AddOneTimePayment,
    AddAdmin,
    DeductAiUse,
    /// Written by the expiry maintenance job, outside this core. Kept here
    /// so history rendering and adapters share one vocabulary.
    DeductExpired,
}

impl CreditsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditsType::AddSubscriptionPayment => "add_subscription_payment",
            CreditsType::AddOneTimePayment => "add_one_time_payment",
            CreditsType::AddAdmin => "add_admin",
            CreditsType::DeductAiUse => "deduct_ai_use",
            CreditsType::DeductExpired => "deduct_expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "add_subscription_payment" => Some(CreditsType::AddSubscriptionPayment),
            "add_one_time_payment" => Some(CreditsType::AddOneTimePayment),
            "add_admin" => Some(CreditsType::AddAdmin),
            "deduct_ai_use" => Some(CreditsType::DeductAiUse),
            "deduct_expired" => Some(CreditsType::DeductExpired),
            _ => None,
        }
    }

    pub fn is_grant(&self) -> bool {
        matches!(
            self,
            CreditsType::AddSubscriptionPayment
                | CreditsType::AddOneTimePayment
                | CreditsType::AddAdmin
        )
    }

    pub fn is_deduction(&self) -> bool {
        !self.is_grant()
    }
}

/// An immutable ledger entry.
#[derive(Debug, Clone, Serialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Signed: positive for grants, negative for deductions.
    pub credits: i64,
    pub credits_type: CreditsType,
    /// Weak back-reference to the payment that triggered a grant.
    pub payment_id: Option<Uuid>,
    pub expires_at: Option<OffsetDateTime>,
    pub description: String,
    pub created_at: OffsetDateTime,
}

/// Insert payload for a ledger entry. `credits` carries the final signed
/// value; the service constructors enforce the sign convention.
#[derive(Debug, Clone)]
pub struct NewCreditTransaction {
    pub user_id: Uuid,
    pub credits: i64,
    pub credits_type: CreditsType,
    pub payment_id: Option<Uuid>,
    pub expires_at: Option<OffsetDateTime>,
    pub description: String,
}

/// One page of a user's credit history, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct CreditHistoryPage {
    pub items: Vec<CreditTransaction>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

#[derive(Clone, Copy)]
struct CachedBalance {
    balance: i64,
    computed_at: OffsetDateTime,
}

/// TTL-bounded read-through cache for derived balances.
struct BalanceCache {
    entries: RwLock<HashMap<Uuid, CachedBalance>>,
    ttl: Duration,
}

impl BalanceCache {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    async fn get(&self, user_id: Uuid) -> Option<i64> {
        let entries = self.entries.read().await;
        let cached = entries.get(&user_id)?;
        let age = OffsetDateTime::now_utc() - cached.computed_at;
        if age < self.ttl {
            Some(cached.balance)
        } else {
            None
        }
    }

    async fn put(&self, user_id: Uuid, balance: i64) {
        let mut entries = self.entries.write().await;
        entries.insert(
            user_id,
            CachedBalance {
                balance,
                computed_at: OffsetDateTime::now_utc(),
            },
        );
    }

    async fn invalidate(&self, user_id: Uuid) {
        let mut entries = self.entries.write().await;
        entries.remove(&user_id);
    }
}

/// Credit accounting over the ledger store.
///
/// Mutations never open their own transaction when a caller already holds
/// one: "payment recorded" and "credits granted" must commit together or
/// not at all.
pub struct CreditService {
    store: Arc<dyn LedgerStore>,
    cache: BalanceCache,
}

impl CreditService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self::with_cache_ttl(store, BALANCE_CACHE_TTL)
    }

    pub fn with_cache_ttl(store: Arc<dyn LedgerStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: BalanceCache::new(ttl),
        }
    }

    /// Append a grant inside the caller's transaction.
    ///
    /// This has no idempotency key of its own: the caller's payment
    /// idempotency check is what guarantees at most one invocation per
    /// triggering payment.
    pub async fn increase_credits(
        &self,
        tx: &mut dyn LedgerTx,
        grant: NewCreditTransaction,
    ) -> BillingResult<CreditTransaction> {
        if grant.credits <= 0 {
            return Err(BillingError::Validation(format!(
                "credit grant must be positive, got {}",
                grant.credits
            )));
        }
        if !grant.credits_type.is_grant() {
            return Err(BillingError::Validation(format!(
                "{} is not a grant type",
                grant.credits_type.as_str()
            )));
        }

        let user_id = grant.user_id;
        let row = tx.insert_credit_transaction(grant).await?;
        self.cache.invalidate(user_id).await;

        tracing::info!(
            user_id = %row.user_id,
            credits = row.credits,
            credits_type = row.credits_type.as_str(),
            payment_id = ?row.payment_id,
            expires_at = ?row.expires_at,
            "Credits granted"
        );
        Ok(row)
    }

    /// Record a usage deduction. `amount` is the positive number of
    /// credits to spend; the ledger entry is stored negated.
    pub async fn deduct_credits(
        &self,
        user_id: Uuid,
        amount: i64,
        credits_type: CreditsType,
        description: &str,
    ) -> BillingResult<CreditTransaction> {
        if amount <= 0 {
            return Err(BillingError::Validation(format!(
                "credit deduction must be positive, got {}",
                amount
            )));
        }
        if !credits_type.is_deduction() {
            return Err(BillingError::Validation(format!(
                "{} is not a deduction type",
                credits_type.as_str()
            )));
        }

        let mut tx = self.store.begin().await?;
        let available = tx
            .user_credit_balance(user_id, OffsetDateTime::now_utc())
            .await?;
        if available < amount {
            return Err(BillingError::InsufficientCredits {
                requested: amount,
                available,
            });
        }

        let row = tx
            .insert_credit_transaction(NewCreditTransaction {
                user_id,
                credits: -amount,
                credits_type,
                payment_id: None,
                expires_at: None,
                description: description.to_string(),
            })
            .await?;
        tx.commit().await?;
        self.cache.invalidate(user_id).await;

        tracing::info!(
            user_id = %user_id,
            credits = -amount,
            credits_type = credits_type.as_str(),
            "Credits deducted"
        );
        Ok(row)
    }

    /// The user's spendable balance, recomputed from the ledger (through
    /// the TTL cache).
    pub async fn get_user_credit_balance(&self, user_id: Uuid) -> BillingResult<i64> {
        if let Some(balance) = self.cache.get(user_id).await {
            return Ok(balance);
        }

        let balance = self.balance_as_of(user_id, OffsetDateTime::now_utc()).await?;
        self.cache.put(user_id, balance).await;
        Ok(balance)
    }

    /// Balance derivation at an explicit instant, bypassing the cache:
    /// non-expired grants plus all deductions.
    pub async fn balance_as_of(
        &self,
        user_id: Uuid,
        as_of: OffsetDateTime,
    ) -> BillingResult<i64> {
        self.store.user_credit_balance(user_id, as_of).await
    }

    /// One page of the user's credit history, newest first, optionally
    /// restricted to the trailing `days`.
    pub async fn get_user_credits_history(
        &self,
        user_id: Uuid,
        page: u32,
        limit: u32,
        days: Option<u32>,
    ) -> BillingResult<CreditHistoryPage> {
        let page = page.max(1);
        let limit = limit.clamp(1, 100);
        let since = days.map(|d| OffsetDateTime::now_utc() - Duration::from_secs(u64::from(d) * 86_400));

        let offset = u64::from(page - 1) * u64::from(limit);
        let (items, total) = self
            .store
            .credit_history_page(user_id, offset, u64::from(limit), since)
            .await?;

        Ok(CreditHistoryPage {
            items,
            total,
            page,
            limit,
        })
    }
}
