//! Storage abstraction for the ledger tables.
//!
//! Every method is one atomic unit against the backing store: a call either
//! applies completely or leaves no trace. Read-modify-write is exposed per key
//! (`update_account`, `update_authorization`) so the domain rules stay in the
//! engine while the store only guarantees isolation.
//!
//! - `memory`: single-process store behind one async mutex
//! - `postgres`: sqlx-backed store, one database transaction per call

use chrono::{DateTime, Utc};
use std::future::Future;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    Account, Address, Authorization, Balance, Movement, RelayOutcome, RequestClaim, RequestKey,
    TipRecord, TokenId,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub trait Store: Send + Sync + 'static {
    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    fn account(&self, owner: &Address) -> impl Future<Output = Result<Option<Account>>> + Send;

    /// Lookup by lowercase handle key
    fn account_by_handle(
        &self,
        handle_key: &str,
    ) -> impl Future<Output = Result<Option<Account>>> + Send;

    /// Insert a new account. Fails `AlreadyRegistered` if the owner exists and
    /// `HandleTaken` if the handle key is bound to another account.
    fn insert_account(&self, account: &Account) -> impl Future<Output = Result<()>> + Send;

    /// Atomically load, mutate and write back one account.
    /// Fails `NotRegistered` when the owner has no account.
    fn update_account<F>(
        &self,
        owner: &Address,
        f: F,
    ) -> impl Future<Output = Result<Account>> + Send
    where
        F: FnOnce(&mut Account) -> Result<()> + Send;

    // ------------------------------------------------------------------
    // Supported tokens
    // ------------------------------------------------------------------

    fn is_supported_token(&self, token: &TokenId) -> impl Future<Output = Result<bool>> + Send;

    /// Returns true when the token was newly added
    fn add_supported_token(&self, token: &TokenId) -> impl Future<Output = Result<bool>> + Send;

    fn supported_tokens(&self) -> impl Future<Output = Result<Vec<TokenId>>> + Send;

    // ------------------------------------------------------------------
    // Balances
    // ------------------------------------------------------------------

    /// Zero balance when no row exists
    fn balance(
        &self,
        owner: &Address,
        token: &TokenId,
    ) -> impl Future<Output = Result<Balance>> + Send;

    fn balances(&self, owner: &Address) -> impl Future<Output = Result<Vec<Balance>>> + Send;

    /// Sum of every balance held in `token`
    fn token_supply(&self, token: &TokenId) -> impl Future<Output = Result<u128>> + Send;

    /// Apply all movements in order as one unit. A debit larger than the
    /// balance at that point fails `InsufficientBalance` and nothing is applied.
    fn apply_movements(&self, movements: &[Movement]) -> impl Future<Output = Result<()>> + Send;

    /// Apply the tip's movements, bump sender and recipient counters, and
    /// append the record, all as one unit.
    fn commit_tip(
        &self,
        movements: &[Movement],
        record: &TipRecord,
    ) -> impl Future<Output = Result<()>> + Send;

    // ------------------------------------------------------------------
    // Tip log
    // ------------------------------------------------------------------

    fn tip(&self, id: &Uuid) -> impl Future<Output = Result<Option<TipRecord>>> + Send;

    /// Newest tip executed for a relay request at or after `since`
    fn tip_for_request(
        &self,
        key: &RequestKey,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<TipRecord>>> + Send;

    /// Tips sent or received by `owner`, newest first
    fn tips_for(
        &self,
        owner: &Address,
        limit: usize,
        offset: usize,
    ) -> impl Future<Output = Result<Vec<TipRecord>>> + Send;

    // ------------------------------------------------------------------
    // Authorizations
    // ------------------------------------------------------------------

    fn authorization(
        &self,
        owner: &Address,
        operator: &Address,
    ) -> impl Future<Output = Result<Option<Authorization>>> + Send;

    /// Atomically load (possibly absent), compute and write back one
    /// authorization. Nothing is written when `f` fails.
    fn update_authorization<F, T>(
        &self,
        owner: &Address,
        operator: &Address,
        f: F,
    ) -> impl Future<Output = Result<T>> + Send
    where
        F: FnOnce(Option<Authorization>) -> Result<(Authorization, T)> + Send,
        T: Send;

    // ------------------------------------------------------------------
    // Relay request dedup
    // ------------------------------------------------------------------

    /// Claim a request identifier. Identifiers claimed before
    /// `expire_before` are forgotten first. An unfinished claim taken before
    /// `lease_before` is handed over as `Abandoned` and restamped with `now`.
    fn claim_request(
        &self,
        key: &RequestKey,
        now: DateTime<Utc>,
        expire_before: DateTime<Utc>,
        lease_before: DateTime<Utc>,
    ) -> impl Future<Output = Result<RequestClaim>> + Send;

    fn complete_request(
        &self,
        key: &RequestKey,
        outcome: &RelayOutcome,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Drop a claim so the identifier can be executed again
    fn release_request(&self, key: &RequestKey) -> impl Future<Output = Result<()>> + Send;
}
