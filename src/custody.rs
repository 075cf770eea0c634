// External custody of deposited funds
//
// The ledger only records who owns what; the funds themselves sit with a
// custody collaborator. Deposits pull funds in before crediting, withdrawals
// debit before releasing funds out.

use reqwest::Client as HttpClient;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::error::{LedgerError, Result};
use crate::models::{Address, Amount, TokenId};

pub trait Custody: Send + Sync + 'static {
    /// Take `amount` of `token` from `owner` into custody
    fn receive(
        &self,
        owner: &Address,
        token: &TokenId,
        amount: Amount,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Pay `amount` of `token` out of custody to `owner`
    fn release(
        &self,
        owner: &Address,
        token: &TokenId,
        amount: Amount,
    ) -> impl Future<Output = Result<()>> + Send;
}

// ============================================================================
// TRACKING CUSTODY
// ============================================================================

/// In-process custody that only tracks totals held per token
#[derive(Debug, Default)]
pub struct TrackingCustody {
    held: Mutex<HashMap<TokenId, u128>>,
    fail_releases: AtomicBool,
}

impl TrackingCustody {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total held in custody for `token`
    pub fn held(&self, token: &TokenId) -> u128 {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.get(token).copied().unwrap_or(0)
    }

    /// Make every subsequent release fail (simulates a settlement outage)
    pub fn set_fail_releases(&self, fail: bool) {
        self.fail_releases.store(fail, Ordering::SeqCst);
    }
}

impl Custody for TrackingCustody {
    async fn receive(&self, owner: &Address, token: &TokenId, amount: Amount) -> Result<()> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        let total = held.entry(token.clone()).or_insert(0);
        *total += amount as u128;
        info!("Custody received {} of {} from {}", amount, token, owner);
        Ok(())
    }

    async fn release(&self, owner: &Address, token: &TokenId, amount: Amount) -> Result<()> {
        if self.fail_releases.load(Ordering::SeqCst) {
            warn!("Custody release to {} failed (outage)", owner);
            return Err(LedgerError::CustodyFailure("release unavailable".to_string()));
        }

        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        let total = held.entry(token.clone()).or_insert(0);
        *total = total
            .checked_sub(amount as u128)
            .ok_or_else(|| LedgerError::CustodyFailure("custody underfunded".to_string()))?;
        info!("Custody released {} of {} to {}", amount, token, owner);
        Ok(())
    }
}

// ============================================================================
// HTTP CUSTODY
// ============================================================================

#[derive(Debug, Serialize)]
struct CustodyRequest<'a> {
    owner: &'a str,
    token: &'a str,
    amount: Amount,
}

/// Custody backed by an external settlement service.
///
/// `POST {base_url}/receive` and `POST {base_url}/release` with
/// `{"owner", "token", "amount"}`; any non-2xx status is a failure.
#[derive(Clone)]
pub struct HttpCustody {
    http_client: HttpClient,
    base_url: String,
}

impl HttpCustody {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http_client: HttpClient::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn call(&self, action: &str, owner: &Address, token: &TokenId, amount: Amount) -> Result<()> {
        let url = format!("{}/{}", self.base_url, action);
        let body = CustodyRequest {
            owner: owner.as_str(),
            token: token.as_str(),
            amount,
        };

        let resp = self.http_client.post(&url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            warn!("Custody {} rejected with {}: {}", action, status, detail);
            return Err(LedgerError::CustodyFailure(format!(
                "{} returned {}",
                action, status
            )));
        }

        info!("Custody {} ok: {} of {} for {}", action, amount, token, owner);
        Ok(())
    }
}

impl Custody for HttpCustody {
    async fn receive(&self, owner: &Address, token: &TokenId, amount: Amount) -> Result<()> {
        self.call("receive", owner, token, amount).await
    }

    async fn release(&self, owner: &Address, token: &TokenId, amount: Amount) -> Result<()> {
        self.call("release", owner, token, amount).await
    }
}
