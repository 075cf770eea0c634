//! Custodial balances: deposit, withdraw and internal transfers.
//!
//! Ledger balances for a token never exceed what custody holds: deposits
//! credit only after custody has received the funds, and withdrawals debit
//! before custody releases them.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::custody::Custody;
use crate::error::{LedgerError, Result};
use crate::models::{Address, Amount, Balance, Movement, TipRecord, TokenId};
use crate::store::Store;

pub struct BalanceLedger<S, K> {
    store: Arc<S>,
    custody: Arc<K>,
}

impl<S, K> Clone for BalanceLedger<S, K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            custody: self.custody.clone(),
        }
    }
}

impl<S: Store, K: Custody> BalanceLedger<S, K> {
    pub fn new(store: Arc<S>, custody: Arc<K>) -> Self {
        Self { store, custody }
    }

    async fn ensure_supported(&self, token: &TokenId) -> Result<()> {
        if self.store.is_supported_token(token).await? {
            Ok(())
        } else {
            Err(LedgerError::UnsupportedToken)
        }
    }

    pub async fn deposit(&self, account: &Address, token: &TokenId, amount: Amount) -> Result<Balance> {
        self.ensure_supported(token).await?;
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }

        self.custody.receive(account, token, amount).await?;

        let credit = [Movement::Credit {
            owner: account.clone(),
            token: token.clone(),
            amount,
        }];
        if let Err(e) = self.store.apply_movements(&credit).await {
            // Hand the funds back; the ledger never saw them
            warn!("Deposit credit for {} failed ({}), refunding custody", account, e);
            if let Err(refund) = self.custody.release(account, token, amount).await {
                error!(
                    "Refund of {} {} to {} failed after credit error: {}",
                    amount, token, account, refund
                );
            }
            return Err(e);
        }

        let balance = self.store.balance(account, token).await?;
        info!(
            "Deposit: {} +{} {} (balance {})",
            account, amount, token, balance.amount
        );
        Ok(balance)
    }

    pub async fn withdraw(&self, account: &Address, token: &TokenId, amount: Amount) -> Result<Balance> {
        self.ensure_supported(token).await?;
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }

        let debit = [Movement::Debit {
            owner: account.clone(),
            token: token.clone(),
            amount,
        }];
        self.store.apply_movements(&debit).await?;

        if let Err(e) = self.custody.release(account, token, amount).await {
            warn!("Withdraw release for {} failed ({}), rolling back debit", account, e);
            let restore = [Movement::Credit {
                owner: account.clone(),
                token: token.clone(),
                amount,
            }];
            if let Err(rollback) = self.store.apply_movements(&restore).await {
                error!(
                    "Rollback of {} {} for {} failed: {}",
                    amount, token, account, rollback
                );
            }
            return Err(e);
        }

        let balance = self.store.balance(account, token).await?;
        info!(
            "Withdraw: {} -{} {} (balance {})",
            account, amount, token, balance.amount
        );
        Ok(balance)
    }

    /// Move funds between two ledger accounts in one atomic step
    pub async fn internal_transfer(
        &self,
        from: &Address,
        to: &Address,
        token: &TokenId,
        amount: Amount,
    ) -> Result<()> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }

        self.store
            .apply_movements(&[
                Movement::Debit {
                    owner: from.clone(),
                    token: token.clone(),
                    amount,
                },
                Movement::Credit {
                    owner: to.clone(),
                    token: token.clone(),
                    amount,
                },
            ])
            .await
    }

    /// Settle a tip as one unit: the sender's gross debit, the recipient's
    /// net credit, the fee account's credit, counters and the log entry.
    pub(crate) async fn settle_tip(&self, record: &TipRecord, fee_account: &Address) -> Result<()> {
        let mut movements = vec![Movement::Debit {
            owner: record.sender.clone(),
            token: record.token.clone(),
            amount: record.gross_amount,
        }];
        if record.net_amount > 0 {
            movements.push(Movement::Credit {
                owner: record.recipient.clone(),
                token: record.token.clone(),
                amount: record.net_amount,
            });
        }
        if record.fee_amount > 0 {
            movements.push(Movement::Credit {
                owner: fee_account.clone(),
                token: record.token.clone(),
                amount: record.fee_amount,
            });
        }

        self.store.commit_tip(&movements, record).await
    }

    pub async fn balance_of(&self, account: &Address, token: &TokenId) -> Result<Amount> {
        Ok(self.store.balance(account, token).await?.amount)
    }

    pub async fn balances(&self, account: &Address) -> Result<Vec<Balance>> {
        self.store.balances(account).await
    }

    pub async fn token_supply(&self, token: &TokenId) -> Result<u128> {
        self.store.token_supply(token).await
    }
}
