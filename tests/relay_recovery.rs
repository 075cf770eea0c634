// Relay deliveries that are cut short or lose their outcome

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tip_ledger::clock::{Clock, ManualClock};
use tip_ledger::command::{CommandParser, TokenSpec};
use tip_ledger::custody::TrackingCustody;
use tip_ledger::fees::FeeSchedule;
use tip_ledger::models::{
    Account, Address, Amount, Authorization, Balance, Movement, RelayOutcome, RequestClaim,
    RequestKey, TipRecord, TokenId,
};
use tip_ledger::store::{MemoryStore, Store};
use tip_ledger::{
    LedgerError, RelayReceipt, RelayRequest, RelayStage, Result, ServiceSettings, TipService,
};
use uuid::Uuid;

const USDT: Amount = 1_000_000;

/// Memory store that can stall after a tip commits or refuse to save outcomes
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    commit_delay_ms: AtomicU64,
    fail_outcomes: AtomicBool,
}

impl Store for FlakyStore {
    async fn account(&self, owner: &Address) -> Result<Option<Account>> {
        self.inner.account(owner).await
    }

    async fn account_by_handle(&self, handle_key: &str) -> Result<Option<Account>> {
        self.inner.account_by_handle(handle_key).await
    }

    async fn insert_account(&self, account: &Account) -> Result<()> {
        self.inner.insert_account(account).await
    }

    async fn update_account<F>(&self, owner: &Address, f: F) -> Result<Account>
    where
        F: FnOnce(&mut Account) -> Result<()> + Send,
    {
        self.inner.update_account(owner, f).await
    }

    async fn is_supported_token(&self, token: &TokenId) -> Result<bool> {
        self.inner.is_supported_token(token).await
    }

    async fn add_supported_token(&self, token: &TokenId) -> Result<bool> {
        self.inner.add_supported_token(token).await
    }

    async fn supported_tokens(&self) -> Result<Vec<TokenId>> {
        self.inner.supported_tokens().await
    }

    async fn balance(&self, owner: &Address, token: &TokenId) -> Result<Balance> {
        self.inner.balance(owner, token).await
    }

    async fn balances(&self, owner: &Address) -> Result<Vec<Balance>> {
        self.inner.balances(owner).await
    }

    async fn token_supply(&self, token: &TokenId) -> Result<u128> {
        self.inner.token_supply(token).await
    }

    async fn apply_movements(&self, movements: &[Movement]) -> Result<()> {
        self.inner.apply_movements(movements).await
    }

    async fn commit_tip(&self, movements: &[Movement], record: &TipRecord) -> Result<()> {
        self.inner.commit_tip(movements, record).await?;
        let delay = self.commit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        Ok(())
    }

    async fn tip(&self, id: &Uuid) -> Result<Option<TipRecord>> {
        self.inner.tip(id).await
    }

    async fn tip_for_request(
        &self,
        key: &RequestKey,
        since: DateTime<Utc>,
    ) -> Result<Option<TipRecord>> {
        self.inner.tip_for_request(key, since).await
    }

    async fn tips_for(&self, owner: &Address, limit: usize, offset: usize) -> Result<Vec<TipRecord>> {
        self.inner.tips_for(owner, limit, offset).await
    }

    async fn authorization(
        &self,
        owner: &Address,
        operator: &Address,
    ) -> Result<Option<Authorization>> {
        self.inner.authorization(owner, operator).await
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
        self.inner.update_authorization(owner, operator, f).await
    }

    async fn claim_request(
        &self,
        key: &RequestKey,
        now: DateTime<Utc>,
        expire_before: DateTime<Utc>,
        lease_before: DateTime<Utc>,
    ) -> Result<RequestClaim> {
        self.inner
            .claim_request(key, now, expire_before, lease_before)
            .await
    }

    async fn complete_request(&self, key: &RequestKey, outcome: &RelayOutcome) -> Result<()> {
        if self.fail_outcomes.load(Ordering::SeqCst) {
            return Err(LedgerError::Storage("connection reset".into()));
        }
        self.inner.complete_request(key, outcome).await
    }

    async fn release_request(&self, key: &RequestKey) -> Result<()> {
        self.inner.release_request(key).await
    }
}

struct Harness {
    service: TipService<FlakyStore, TrackingCustody>,
    store: Arc<FlakyStore>,
    clock: Arc<ManualClock>,
    token: TokenId,
    alice: Address,
    operator: Address,
}

fn addr(s: &str) -> Address {
    Address::parse(s).unwrap()
}

async fn harness() -> Harness {
    let token = TokenId::parse("0xdac17f958d2ee523a2206206994597c13d831ec7").unwrap();
    let store = Arc::new(FlakyStore::default());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap(),
    ));
    let parser = CommandParser::new(
        vec![TokenSpec {
            symbol: "USDT".into(),
            token: token.clone(),
            decimals: 6,
        }],
        Some("tipbot"),
    );

    let service = TipService::new(
        store.clone(),
        Arc::new(TrackingCustody::new()),
        clock.clone(),
        ServiceSettings {
            admin: addr("admin"),
            fee_account: addr("platform"),
            fees: FeeSchedule::default(),
            dedup_retention: Duration::hours(24),
            parser,
        },
    );
    service
        .add_supported_token(&addr("admin"), &token)
        .await
        .unwrap();

    let alice = addr("alice");
    let operator = addr("tipbot");
    service.register(&alice, "Alice", true, true).await.unwrap();
    service
        .register(&addr("carol"), "Carol", true, false)
        .await
        .unwrap();
    service.deposit(&alice, &token, 10 * USDT).await.unwrap();
    service
        .authorize_operator(&alice, &operator, 10 * USDT)
        .await
        .unwrap();

    Harness {
        service,
        store,
        clock,
        token,
        alice,
        operator,
    }
}

impl Harness {
    fn relay(&self, request_id: &str) -> RelayRequest {
        RelayRequest {
            operator: self.operator.clone(),
            tipper: self.alice.clone(),
            recipient_handle: "carol".into(),
            token: self.token.clone(),
            amount: USDT,
            message: "gm".into(),
            request_id: request_id.into(),
        }
    }

    fn key(&self, request_id: &str) -> RequestKey {
        RequestKey {
            operator: self.operator.clone(),
            request_id: request_id.into(),
        }
    }

    async fn balance(&self) -> Amount {
        self.service.balance_of(&self.alice, &self.token).await.unwrap()
    }
}

#[tokio::test]
async fn test_dropped_caller_does_not_strand_the_request() {
    let h = harness().await;
    h.store.commit_delay_ms.store(300, Ordering::SeqCst);

    let service = h.service.clone();
    let request = h.relay("tweet-1");
    let caller = tokio::spawn(async move { service.tip_for(request).await });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());

    h.store.commit_delay_ms.store(0, Ordering::SeqCst);
    let retry = h.service.tip_for(h.relay("tweet-1")).await.unwrap();

    assert!(retry.is_replay());
    assert_eq!(h.balance().await, 9 * USDT);
    assert_eq!(h.service.tips_for(&h.alice, 10, 0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unsaved_outcome_replays_from_tip_log() {
    let h = harness().await;
    h.store.fail_outcomes.store(true, Ordering::SeqCst);

    let first = h.service.tip_for(h.relay("tweet-2")).await.unwrap();
    assert!(matches!(first, RelayReceipt::Executed(_)));

    let retry = h.service.tip_for(h.relay("tweet-2")).await.unwrap();
    assert!(retry.is_replay());
    assert_eq!(retry.record(), first.record());
    assert_eq!(h.balance().await, 9 * USDT);

    // Once saving works again the replay no longer needs the tip log
    h.store.fail_outcomes.store(false, Ordering::SeqCst);
    let again = h.service.tip_for(h.relay("tweet-2")).await.unwrap();
    assert_eq!(again.record(), first.record());
    let now = h.clock.now();
    assert_eq!(
        h.store
            .inner
            .claim_request(&h.key("tweet-2"), now, now - Duration::hours(24), now)
            .await
            .unwrap(),
        RequestClaim::Done(RelayOutcome::Completed(first.record().clone()))
    );
}

#[tokio::test]
async fn test_unfinished_claim_blocks_until_lease_expires() {
    let h = harness().await;
    let now = h.clock.now();

    // A delivery from another process claimed the id and never finished
    assert_eq!(
        h.store
            .claim_request(&h.key("tweet-3"), now, now - Duration::hours(24), now)
            .await
            .unwrap(),
        RequestClaim::Fresh
    );

    let rejection = h.service.tip_for(h.relay("tweet-3")).await.unwrap_err();
    assert_eq!(rejection.error, LedgerError::RequestInFlight);
    assert_eq!(rejection.stage, RelayStage::InFlight);
    assert_eq!(h.balance().await, 10 * USDT);

    h.clock.advance(Duration::minutes(3));
    let receipt = h.service.tip_for(h.relay("tweet-3")).await.unwrap();
    assert!(!receipt.is_replay());
    assert_eq!(h.balance().await, 9 * USDT);

    let replay = h.service.tip_for(h.relay("tweet-3")).await.unwrap();
    assert!(replay.is_replay());
    assert_eq!(replay.record(), receipt.record());
}
