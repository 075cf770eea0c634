//! Tip execution.
//!
//! A tip is validated in full by [`TipEngine::prepare`] without touching any
//! state, then settled by [`TipEngine::execute`] as a single ledger commit.
//! A failure at any step leaves balances, counters and the log untouched.

use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::custody::Custody;
use crate::error::{LedgerError, Result};
use crate::fees::FeeSchedule;
use crate::ledger::BalanceLedger;
use crate::models::{Account, Address, Amount, TipRecord, TokenId, MAX_MESSAGE_LEN};
use crate::registry::AccountRegistry;
use crate::store::Store;

/// Who asked for the tip when it arrived through the relay
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub operator: Address,
    pub request_id: String,
}

/// A tip that passed every read-only check
#[derive(Debug, Clone)]
pub struct PreparedTip {
    pub sender: Account,
    pub recipient: Account,
    pub token: TokenId,
    pub amount: Amount,
    pub message: String,
}

pub struct TipEngine<S, K> {
    store: Arc<S>,
    registry: AccountRegistry<S>,
    ledger: BalanceLedger<S, K>,
    fees: FeeSchedule,
    clock: Arc<dyn Clock>,
    fee_account: Address,
}

impl<S, K> Clone for TipEngine<S, K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            ledger: self.ledger.clone(),
            fees: self.fees.clone(),
            clock: self.clock.clone(),
            fee_account: self.fee_account.clone(),
        }
    }
}

impl<S: Store, K: Custody> TipEngine<S, K> {
    pub fn new(
        store: Arc<S>,
        registry: AccountRegistry<S>,
        ledger: BalanceLedger<S, K>,
        fees: FeeSchedule,
        clock: Arc<dyn Clock>,
        fee_account: Address,
    ) -> Self {
        Self {
            store,
            registry,
            ledger,
            fees,
            clock,
            fee_account,
        }
    }

    pub fn fees(&self) -> &FeeSchedule {
        &self.fees
    }

    pub fn fee_account(&self) -> &Address {
        &self.fee_account
    }

    /// Run every check that does not need to mutate state
    pub async fn prepare(
        &self,
        sender: &Address,
        recipient_handle: &str,
        token: &TokenId,
        amount: Amount,
        message: &str,
    ) -> Result<PreparedTip> {
        let recipient = self
            .registry
            .resolve(recipient_handle)
            .await?
            .ok_or(LedgerError::RecipientNotFound)?;

        if !recipient.is_creator {
            return Err(LedgerError::RecipientNotCreator);
        }

        if !self.store.is_supported_token(token).await? {
            return Err(LedgerError::UnsupportedToken);
        }

        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        if message.chars().count() > MAX_MESSAGE_LEN {
            return Err(LedgerError::MessageTooLong {
                max: MAX_MESSAGE_LEN,
            });
        }

        let sender = self
            .registry
            .account(sender)
            .await?
            .filter(|account| account.active)
            .ok_or(LedgerError::NotRegistered)?;

        if !sender.is_tipper {
            return Err(LedgerError::SenderNotTipper);
        }
        if sender.owner == recipient.owner {
            return Err(LedgerError::SelfTip);
        }

        Ok(PreparedTip {
            sender,
            recipient,
            token: token.clone(),
            amount,
            message: message.to_string(),
        })
    }

    /// Compute the fee and settle the tip in one ledger commit
    pub async fn execute(&self, tip: PreparedTip, relay: Option<RelayContext>) -> Result<TipRecord> {
        let fee = self.fees.compute_fee(tip.amount, &tip.sender);
        let net = tip.amount - fee;

        let (operator, request_id) = match relay {
            Some(ctx) => (Some(ctx.operator), Some(ctx.request_id)),
            None => (None, None),
        };

        let record = TipRecord {
            id: Uuid::new_v4(),
            sender: tip.sender.owner.clone(),
            sender_handle: tip.sender.handle.clone(),
            recipient: tip.recipient.owner.clone(),
            recipient_handle: tip.recipient.handle.clone(),
            token: tip.token,
            gross_amount: tip.amount,
            fee_amount: fee,
            net_amount: net,
            message: tip.message,
            operator,
            request_id,
            created_at: self.clock.now(),
        };

        self.ledger.settle_tip(&record, &self.fee_account).await?;

        info!(
            "Tip {}: @{} -> @{} {} {} (fee {}, net {})",
            record.id,
            record.sender_handle,
            record.recipient_handle,
            record.gross_amount,
            record.token,
            record.fee_amount,
            record.net_amount
        );
        Ok(record)
    }

    /// Direct tip: the sender executes it themselves
    pub async fn tip(
        &self,
        sender: &Address,
        recipient_handle: &str,
        token: &TokenId,
        amount: Amount,
        message: &str,
    ) -> Result<TipRecord> {
        let prepared = self
            .prepare(sender, recipient_handle, token, amount, message)
            .await?;
        self.execute(prepared, None).await
    }

    pub async fn tip_record(&self, id: &Uuid) -> Result<TipRecord> {
        self.store.tip(id).await?.ok_or(LedgerError::TipNotFound)
    }

    pub async fn tips_for(&self, owner: &Address, limit: usize, offset: usize) -> Result<Vec<TipRecord>> {
        self.store.tips_for(owner, limit, offset).await
    }
}
