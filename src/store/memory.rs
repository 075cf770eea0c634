// In-memory store: every call runs under one lock, so all operations are
// linearizable. Used by tests and by the server when no DATABASE_URL is set.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::Store;
use crate::error::{LedgerError, Result};
use crate::models::{
    handle_key, Account, Address, Authorization, Balance, Movement, RelayOutcome, RequestClaim,
    RequestKey, TipRecord, TokenId,
};

type BalanceKey = (Address, TokenId);

struct RequestEntry {
    claimed_at: DateTime<Utc>,
    outcome: Option<RelayOutcome>,
}

#[derive(Default)]
struct Tables {
    accounts: HashMap<Address, Account>,
    handles: HashMap<String, Address>,
    tokens: BTreeSet<TokenId>,
    balances: HashMap<BalanceKey, Balance>,
    authorizations: HashMap<(Address, Address), Authorization>,
    tips: Vec<TipRecord>,
    tip_index: HashMap<Uuid, usize>,
    requests: HashMap<RequestKey, RequestEntry>,
}

impl Tables {
    /// Compute the post-batch value of every touched balance without writing
    fn stage(&self, movements: &[Movement]) -> Result<HashMap<BalanceKey, Balance>> {
        let mut staged: HashMap<BalanceKey, Balance> = HashMap::new();

        for movement in movements {
            let key = (movement.owner().clone(), movement.token().clone());
            let entry = staged.entry(key.clone()).or_insert_with(|| {
                self.balances
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| Balance::zero(key.0.clone(), key.1.clone()))
            });

            match movement {
                Movement::Credit { amount, .. } => {
                    entry.amount = entry
                        .amount
                        .checked_add(*amount)
                        .ok_or(LedgerError::Overflow)?;
                }
                Movement::Debit { amount, .. } => {
                    entry.amount = entry
                        .amount
                        .checked_sub(*amount)
                        .ok_or(LedgerError::InsufficientBalance)?;
                }
            }
        }

        Ok(staged)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    async fn account(&self, owner: &Address) -> Result<Option<Account>> {
        let tables = self.tables.lock().await;
        Ok(tables.accounts.get(owner).cloned())
    }

    async fn account_by_handle(&self, handle_key: &str) -> Result<Option<Account>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .handles
            .get(handle_key)
            .and_then(|owner| tables.accounts.get(owner))
            .cloned())
    }

    async fn insert_account(&self, account: &Account) -> Result<()> {
        let mut tables = self.tables.lock().await;

        if tables.accounts.contains_key(&account.owner) {
            return Err(LedgerError::AlreadyRegistered);
        }
        let key = handle_key(&account.handle);
        if tables.handles.contains_key(&key) {
            return Err(LedgerError::HandleTaken);
        }

        tables.handles.insert(key, account.owner.clone());
        tables.accounts.insert(account.owner.clone(), account.clone());
        Ok(())
    }

    async fn update_account<F>(&self, owner: &Address, f: F) -> Result<Account>
    where
        F: FnOnce(&mut Account) -> Result<()> + Send,
    {
        let mut tables = self.tables.lock().await;
        let current = tables.accounts.get(owner).ok_or(LedgerError::NotRegistered)?;

        let mut updated = current.clone();
        f(&mut updated)?;
        tables.accounts.insert(owner.clone(), updated.clone());
        Ok(updated)
    }

    async fn is_supported_token(&self, token: &TokenId) -> Result<bool> {
        let tables = self.tables.lock().await;
        Ok(tables.tokens.contains(token))
    }

    async fn add_supported_token(&self, token: &TokenId) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        Ok(tables.tokens.insert(token.clone()))
    }

    async fn supported_tokens(&self) -> Result<Vec<TokenId>> {
        let tables = self.tables.lock().await;
        Ok(tables.tokens.iter().cloned().collect())
    }

    async fn balance(&self, owner: &Address, token: &TokenId) -> Result<Balance> {
        let tables = self.tables.lock().await;
        Ok(tables
            .balances
            .get(&(owner.clone(), token.clone()))
            .cloned()
            .unwrap_or_else(|| Balance::zero(owner.clone(), token.clone())))
    }

    async fn balances(&self, owner: &Address) -> Result<Vec<Balance>> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<Balance> = tables
            .balances
            .values()
            .filter(|b| &b.owner == owner)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.token.cmp(&b.token));
        Ok(rows)
    }

    async fn token_supply(&self, token: &TokenId) -> Result<u128> {
        let tables = self.tables.lock().await;
        Ok(tables
            .balances
            .values()
            .filter(|b| &b.token == token)
            .map(|b| b.amount as u128)
            .sum())
    }

    async fn apply_movements(&self, movements: &[Movement]) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let staged = tables.stage(movements)?;
        tables.balances.extend(staged);
        Ok(())
    }

    async fn commit_tip(&self, movements: &[Movement], record: &TipRecord) -> Result<()> {
        let mut tables = self.tables.lock().await;

        if !tables.accounts.contains_key(&record.sender) {
            return Err(LedgerError::NotRegistered);
        }
        if !tables.accounts.contains_key(&record.recipient) {
            return Err(LedgerError::RecipientNotFound);
        }

        let mut staged = tables.stage(movements)?;

        let sender_key = (record.sender.clone(), record.token.clone());
        if let Some(row) = staged.get_mut(&sender_key) {
            row.total_sent = row.total_sent.saturating_add(record.gross_amount);
        }
        let recipient_key = (record.recipient.clone(), record.token.clone());
        if let Some(row) = staged.get_mut(&recipient_key) {
            row.total_received = row.total_received.saturating_add(record.net_amount);
        }

        tables.balances.extend(staged);

        if let Some(sender) = tables.accounts.get_mut(&record.sender) {
            sender.tips_sent += 1;
        }
        if let Some(recipient) = tables.accounts.get_mut(&record.recipient) {
            recipient.tips_received += 1;
        }

        let position = tables.tips.len();
        tables.tips.push(record.clone());
        tables.tip_index.insert(record.id, position);
        Ok(())
    }

    async fn tip(&self, id: &Uuid) -> Result<Option<TipRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .tip_index
            .get(id)
            .and_then(|i| tables.tips.get(*i))
            .cloned())
    }

    async fn tip_for_request(
        &self,
        key: &RequestKey,
        since: DateTime<Utc>,
    ) -> Result<Option<TipRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .tips
            .iter()
            .rev()
            .find(|t| {
                t.created_at >= since
                    && t.operator.as_ref() == Some(&key.operator)
                    && t.request_id.as_deref() == Some(key.request_id.as_str())
            })
            .cloned())
    }

    async fn tips_for(&self, owner: &Address, limit: usize, offset: usize) -> Result<Vec<TipRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .tips
            .iter()
            .rev()
            .filter(|t| &t.sender == owner || &t.recipient == owner)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn authorization(
        &self,
        owner: &Address,
        operator: &Address,
    ) -> Result<Option<Authorization>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .authorizations
            .get(&(owner.clone(), operator.clone()))
            .cloned())
    }

    async fn update_authorization<F, T>(
        &self,
        owner: &Address,
        operator: &Address,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(Option<Authorization>) -> Result<(Authorization, T)> + Send,
        T: Send,
    {
        let mut tables = self.tables.lock().await;
        let key = (owner.clone(), operator.clone());
        let current = tables.authorizations.get(&key).cloned();

        let (updated, output) = f(current)?;
        tables.authorizations.insert(key, updated);
        Ok(output)
    }

    async fn claim_request(
        &self,
        key: &RequestKey,
        now: DateTime<Utc>,
        expire_before: DateTime<Utc>,
        lease_before: DateTime<Utc>,
    ) -> Result<RequestClaim> {
        let mut tables = self.tables.lock().await;
        tables
            .requests
            .retain(|_, entry| entry.claimed_at >= expire_before);

        match tables.requests.get_mut(key) {
            Some(RequestEntry {
                outcome: Some(outcome),
                ..
            }) => Ok(RequestClaim::Done(outcome.clone())),
            Some(entry) if entry.claimed_at < lease_before => {
                entry.claimed_at = now;
                Ok(RequestClaim::Abandoned)
            }
            Some(_) => Ok(RequestClaim::Pending),
            None => {
                tables.requests.insert(
                    key.clone(),
                    RequestEntry {
                        claimed_at: now,
                        outcome: None,
                    },
                );
                Ok(RequestClaim::Fresh)
            }
        }
    }

    async fn complete_request(&self, key: &RequestKey, outcome: &RelayOutcome) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(entry) = tables.requests.get_mut(key) {
            entry.outcome = Some(outcome.clone());
        }
        Ok(())
    }

    async fn release_request(&self, key: &RequestKey) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.requests.remove(key);
        Ok(())
    }
}
