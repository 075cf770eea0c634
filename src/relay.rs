//! Delegated tipping on a user's behalf (`tipFor`).
//!
//! Deliveries arrive at least once, so each request carries a client
//! identifier scoped to the operator. The first delivery executes and its
//! outcome is stored; later deliveries within the retention window replay it.
//!
//! Quota is reserved before any balance moves and is not refunded when the
//! tip then fails. A rejection before the reservation releases the
//! identifier so an immediate retry executes again.
//!
//! Execution runs on its own task, so a caller that disconnects does not
//! cut a delivery short. A claim left unfinished by a crashed process is
//! handed over once its lease runs out; the tip log decides whether the
//! earlier delivery already committed.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::authorization::AuthorizationStore;
use crate::clock::Clock;
use crate::custody::Custody;
use crate::error::LedgerError;
use crate::models::{Address, Amount, RelayOutcome, RequestClaim, RequestKey, TipRecord, TokenId};
use crate::store::Store;
use crate::tips::{RelayContext, TipEngine};

const MAX_REQUEST_ID_LEN: usize = 128;

/// How long an unfinished claim blocks other deliveries of the same id
const PENDING_LEASE_SECS: i64 = 120;

const OUTCOME_SAVE_ATTEMPTS: u32 = 3;

/// Default rolling window for remembered request identifiers
pub const DEFAULT_DEDUP_RETENTION_HOURS: i64 = 24;

/// Upper bound on the retention window (one year)
pub const MAX_DEDUP_RETENTION_HOURS: i64 = 24 * 365;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequest {
    pub operator: Address,
    pub tipper: Address,
    pub recipient_handle: String,
    pub token: TokenId,
    pub amount: Amount,
    pub message: String,
    pub request_id: String,
}

/// Successful relay result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "tip", rename_all = "snake_case")]
pub enum RelayReceipt {
    Executed(TipRecord),
    /// Duplicate delivery; carries the original record
    Replayed(TipRecord),
}

impl RelayReceipt {
    pub fn record(&self) -> &TipRecord {
        match self {
            RelayReceipt::Executed(record) | RelayReceipt::Replayed(record) => record,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, RelayReceipt::Replayed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayStage {
    /// Nothing was consumed; safe to retry right away
    BeforeReservation,
    /// Daily quota was consumed; a retry with the same id replays this error
    AfterReservation,
    /// Another delivery of this id is unfinished and may already have
    /// executed; retry later with the same id
    InFlight,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{error}")]
pub struct RelayRejection {
    pub stage: RelayStage,
    pub error: LedgerError,
}

impl RelayRejection {
    pub(crate) fn before(error: LedgerError) -> Self {
        Self {
            stage: RelayStage::BeforeReservation,
            error,
        }
    }

    pub(crate) fn after(error: LedgerError) -> Self {
        Self {
            stage: RelayStage::AfterReservation,
            error,
        }
    }

    pub(crate) fn in_flight(error: LedgerError) -> Self {
        Self {
            stage: RelayStage::InFlight,
            error,
        }
    }

    pub fn quota_consumed(&self) -> bool {
        self.stage == RelayStage::AfterReservation
    }
}

type InFlight = Arc<Mutex<HashMap<RequestKey, Arc<Mutex<()>>>>>;

pub struct RelayGateway<S, K> {
    store: Arc<S>,
    authorizations: AuthorizationStore<S>,
    engine: TipEngine<S, K>,
    clock: Arc<dyn Clock>,
    retention: Duration,
    in_flight: InFlight,
}

impl<S, K> Clone for RelayGateway<S, K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            authorizations: self.authorizations.clone(),
            engine: self.engine.clone(),
            clock: self.clock.clone(),
            retention: self.retention,
            in_flight: self.in_flight.clone(),
        }
    }
}

fn validate_request_id(request_id: &str) -> Result<(), LedgerError> {
    let valid = !request_id.is_empty()
        && request_id.len() <= MAX_REQUEST_ID_LEN
        && request_id.chars().all(|c| c.is_ascii_graphic());
    if valid {
        Ok(())
    } else {
        Err(LedgerError::InvalidRequestId)
    }
}

impl<S: Store, K: Custody> RelayGateway<S, K> {
    pub fn new(
        store: Arc<S>,
        authorizations: AuthorizationStore<S>,
        engine: TipEngine<S, K>,
        clock: Arc<dyn Clock>,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            authorizations,
            engine,
            clock,
            retention,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn tip_for(&self, request: RelayRequest) -> Result<RelayReceipt, RelayRejection> {
        validate_request_id(&request.request_id).map_err(RelayRejection::before)?;

        let gateway = self.clone();
        let request_id = request.request_id.clone();
        tokio::spawn(async move { gateway.run(request).await })
            .await
            .unwrap_or_else(|e| {
                error!("Relay task for {} did not finish: {}", request_id, e);
                Err(RelayRejection::in_flight(LedgerError::Storage(
                    "relay task did not finish".to_string(),
                )))
            })
    }

    async fn run(&self, request: RelayRequest) -> Result<RelayReceipt, RelayRejection> {
        let key = RequestKey {
            operator: request.operator.clone(),
            request_id: request.request_id.clone(),
        };

        // Serialize deliveries of the same key inside this process
        let slot = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = slot.clone().lock_owned().await;

        let result = self.deliver(&key, request).await;

        drop(guard);
        let mut in_flight = self.in_flight.lock().await;
        // Only the map and this call hold the slot: nobody else is waiting
        if Arc::strong_count(&slot) <= 2 {
            in_flight.remove(&key);
        }

        result
    }

    async fn deliver(
        &self,
        key: &RequestKey,
        request: RelayRequest,
    ) -> Result<RelayReceipt, RelayRejection> {
        let now = self.clock.now();
        let expire_before = now
            .checked_sub_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let lease_before = now - Duration::seconds(PENDING_LEASE_SECS);
        let claim = self
            .store
            .claim_request(key, now, expire_before, lease_before)
            .await
            .map_err(RelayRejection::before)?;

        match claim {
            RequestClaim::Done(RelayOutcome::Completed(record)) => {
                info!(
                    "Relay replay {} from {}: tip {}",
                    key.request_id, key.operator, record.id
                );
                return Ok(RelayReceipt::Replayed(record));
            }
            RequestClaim::Done(RelayOutcome::Failed(error)) => {
                info!(
                    "Relay replay {} from {}: {}",
                    key.request_id, key.operator, error
                );
                return Err(RelayRejection::after(error));
            }
            RequestClaim::Pending => {
                return match self.committed_tip(key, expire_before).await? {
                    Some(record) => Ok(RelayReceipt::Replayed(record)),
                    None => Err(RelayRejection::in_flight(LedgerError::RequestInFlight)),
                };
            }
            RequestClaim::Abandoned => {
                if let Some(record) = self.committed_tip(key, expire_before).await? {
                    return Ok(RelayReceipt::Replayed(record));
                }
                warn!(
                    "Relay {} from {} took over an expired lease",
                    key.request_id, key.operator
                );
            }
            RequestClaim::Fresh => {}
        }

        let prepared = match self.check_and_reserve(&request).await {
            Ok(prepared) => prepared,
            Err(error) => {
                if let Err(e) = self.store.release_request(key).await {
                    warn!("Failed to release relay request {}: {}", key.request_id, e);
                }
                info!(
                    "Relay {} from {} rejected before reservation: {}",
                    key.request_id, key.operator, error
                );
                return Err(RelayRejection::before(error));
            }
        };

        let context = RelayContext {
            operator: request.operator.clone(),
            request_id: request.request_id.clone(),
        };
        let outcome = match self.engine.execute(prepared, Some(context)).await {
            Ok(record) => RelayOutcome::Completed(record),
            Err(error) => {
                warn!(
                    "Relay {} from {} failed after reservation (quota kept): {}",
                    key.request_id, key.operator, error
                );
                RelayOutcome::Failed(error)
            }
        };

        self.save_outcome(key, &outcome).await;

        match outcome {
            RelayOutcome::Completed(record) => Ok(RelayReceipt::Executed(record)),
            RelayOutcome::Failed(error) => Err(RelayRejection::after(error)),
        }
    }

    /// Look up a tip an unfinished claim already committed and finish the
    /// claim with it
    async fn committed_tip(
        &self,
        key: &RequestKey,
        since: DateTime<Utc>,
    ) -> Result<Option<TipRecord>, RelayRejection> {
        let record = self
            .store
            .tip_for_request(key, since)
            .await
            .map_err(RelayRejection::in_flight)?;

        if let Some(record) = &record {
            info!(
                "Relay replay {} from {}: tip {} found in the log",
                key.request_id, key.operator, record.id
            );
            self.save_outcome(key, &RelayOutcome::Completed(record.clone()))
                .await;
        }
        Ok(record)
    }

    /// A completed tip stays replayable through the tip log when every
    /// attempt fails; a failed outcome is re-executed once the lease expires
    async fn save_outcome(&self, key: &RequestKey, outcome: &RelayOutcome) {
        for attempt in 1..=OUTCOME_SAVE_ATTEMPTS {
            match self.store.complete_request(key, outcome).await {
                Ok(()) => return,
                Err(e) if attempt < OUTCOME_SAVE_ATTEMPTS => {
                    warn!(
                        "Failed to record relay outcome {} (attempt {}): {}",
                        key.request_id, attempt, e
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(50 * attempt as u64))
                        .await;
                }
                Err(e) => {
                    error!(
                        "Giving up on relay outcome {} after {} attempts: {}",
                        key.request_id, attempt, e
                    );
                }
            }
        }
    }

    /// Everything up to and including the quota reservation
    async fn check_and_reserve(
        &self,
        request: &RelayRequest,
    ) -> Result<crate::tips::PreparedTip, LedgerError> {
        if !self
            .authorizations
            .is_authorized(&request.tipper, &request.operator)
            .await?
        {
            return Err(LedgerError::NotAuthorized);
        }

        let prepared = self
            .engine
            .prepare(
                &request.tipper,
                &request.recipient_handle,
                &request.token,
                request.amount,
                &request.message,
            )
            .await?;

        self.authorizations
            .reserve(&request.tipper, &request.operator, request.amount)
            .await?;

        Ok(prepared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_request_id() {
        assert!(validate_request_id("1789012345678901234").is_ok());
        assert!(validate_request_id("tweet:abc-123").is_ok());
        assert!(validate_request_id("").is_err());
        assert!(validate_request_id("has space").is_err());
        assert!(validate_request_id(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_rejection_stage() {
        let early = RelayRejection::before(LedgerError::DailyLimitExceeded);
        let late = RelayRejection::after(LedgerError::InsufficientBalance);
        let pending = RelayRejection::in_flight(LedgerError::RequestInFlight);
        assert!(!early.quota_consumed());
        assert!(late.quota_consumed());
        assert!(!pending.quota_consumed());
        assert_eq!(pending.stage, RelayStage::InFlight);
        assert_eq!(late.to_string(), "insufficient balance");
    }
}
