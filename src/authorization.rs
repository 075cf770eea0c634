//! Operator authorizations and daily spending limits.
//!
//! The spent counter rolls over lazily: a record whose `spent_day` is not
//! today counts as zero spent and is reset on its next write.

use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{LedgerError, Result};
use crate::models::{Address, AllowanceView, Amount, Authorization, DayIndex};
use crate::store::Store;

pub struct AuthorizationStore<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for AuthorizationStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
        }
    }
}

fn roll_over(auth: &mut Authorization, today: DayIndex) {
    if auth.spent_day != today {
        auth.daily_spent = 0;
        auth.spent_day = today;
    }
}

impl<S: Store> AuthorizationStore<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Authorize `operator` to spend up to `daily_limit` per UTC day.
    ///
    /// A changed limit applies from the moment of the call, to the rest of
    /// today as well as later days; it is not deferred to the next UTC day.
    /// Today's spent amount survives re-authorization. A new limit below it
    /// clamps spent to the limit, leaving no headroom for the rest of the day.
    pub async fn authorize(
        &self,
        account: &Address,
        operator: &Address,
        daily_limit: Amount,
    ) -> Result<Authorization> {
        if daily_limit == 0 {
            return Err(LedgerError::InvalidLimit);
        }
        let today = self.clock.today();

        let auth = self
            .store
            .update_authorization(account, operator, |current| {
                let mut auth = current.unwrap_or_else(|| Authorization {
                    owner: account.clone(),
                    operator: operator.clone(),
                    authorized: false,
                    daily_limit,
                    daily_spent: 0,
                    spent_day: today,
                });
                roll_over(&mut auth, today);
                auth.authorized = true;
                auth.daily_limit = daily_limit;
                auth.daily_spent = auth.daily_spent.min(daily_limit);
                Ok((auth.clone(), auth))
            })
            .await?;

        info!(
            "Authorized operator {} for {} (limit {}/day, spent today {})",
            operator, account, auth.daily_limit, auth.daily_spent
        );
        Ok(auth)
    }

    /// Limit and spent fields are kept for a later re-authorization
    pub async fn revoke(&self, account: &Address, operator: &Address) -> Result<Authorization> {
        let auth = self
            .store
            .update_authorization(account, operator, |current| {
                let mut auth = current.ok_or(LedgerError::AuthorizationNotFound)?;
                auth.authorized = false;
                Ok((auth.clone(), auth))
            })
            .await?;

        info!("Revoked operator {} for {}", operator, account);
        Ok(auth)
    }

    pub async fn is_authorized(&self, account: &Address, operator: &Address) -> Result<bool> {
        Ok(self
            .store
            .authorization(account, operator)
            .await?
            .map(|auth| auth.authorized)
            .unwrap_or(false))
    }

    /// Atomically check the quota and consume `amount` of it.
    pub async fn reserve(
        &self,
        account: &Address,
        operator: &Address,
        amount: Amount,
    ) -> Result<Authorization> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let today = self.clock.today();

        let auth = self
            .store
            .update_authorization(account, operator, |current| {
                let mut auth = match current {
                    Some(auth) if auth.authorized => auth,
                    _ => return Err(LedgerError::NotAuthorized),
                };
                roll_over(&mut auth, today);

                let spent = auth
                    .daily_spent
                    .checked_add(amount)
                    .ok_or(LedgerError::DailyLimitExceeded)?;
                if spent > auth.daily_limit {
                    return Err(LedgerError::DailyLimitExceeded);
                }
                auth.daily_spent = spent;
                Ok((auth.clone(), auth))
            })
            .await?;

        debug!(
            "Reserved {} for operator {} on {} ({}/{})",
            amount, operator, account, auth.daily_spent, auth.daily_limit
        );
        Ok(auth)
    }

    /// Quota as of today, with a stale day reported as zero spent
    pub async fn allowance(
        &self,
        account: &Address,
        operator: &Address,
    ) -> Result<Option<AllowanceView>> {
        let today = self.clock.today();
        let auth = self.store.authorization(account, operator).await?;

        Ok(auth.map(|auth| AllowanceView {
            daily_spent: auth.effective_spent(today),
            remaining: if auth.authorized {
                auth.remaining(today)
            } else {
                0
            },
            owner: auth.owner,
            operator: auth.operator,
            authorized: auth.authorized,
            daily_limit: auth.daily_limit,
            day: today,
        }))
    }
}
