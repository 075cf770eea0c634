// Postgres store against a scratch database.
// Run with: DATABASE_URL=postgres://... cargo test --features postgres-tests
#![cfg(feature = "postgres-tests")]

use chrono::{Duration, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use tip_ledger::models::{
    Account, Address, Amount, Movement, RelayOutcome, RequestClaim, RequestKey, TipRecord, TokenId,
};
use tip_ledger::store::{PgStore, Store};
use tip_ledger::LedgerError;
use uuid::Uuid;

fn addr(s: &str) -> Address {
    Address::parse(s).unwrap()
}

fn token(hex: &str) -> TokenId {
    TokenId::parse(hex).unwrap()
}

fn usdt() -> TokenId {
    token("0xdac17f958d2ee523a2206206994597c13d831ec7")
}

fn usdc() -> TokenId {
    token("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48")
}

fn credit(owner: &Address, token: &TokenId, amount: Amount) -> Movement {
    Movement::Credit {
        owner: owner.clone(),
        token: token.clone(),
        amount,
    }
}

fn debit(owner: &Address, token: &TokenId, amount: Amount) -> Movement {
    Movement::Debit {
        owner: owner.clone(),
        token: token.clone(),
        amount,
    }
}

async fn register(store: &PgStore, owner: &str, handle: &str) -> Address {
    let owner = addr(owner);
    store
        .insert_account(&Account::new(owner.clone(), handle.into(), true, true, Utc::now()))
        .await
        .unwrap();
    owner
}

fn tip_record(
    sender: &Address,
    recipient: &Address,
    token: &TokenId,
    amount: Amount,
    relay: Option<&RequestKey>,
) -> TipRecord {
    TipRecord {
        id: Uuid::new_v4(),
        sender: sender.clone(),
        sender_handle: sender.to_string(),
        recipient: recipient.clone(),
        recipient_handle: recipient.to_string(),
        token: token.clone(),
        gross_amount: amount,
        fee_amount: 0,
        net_amount: amount,
        message: String::new(),
        operator: relay.map(|key| key.operator.clone()),
        request_id: relay.map(|key| key.request_id.clone()),
        created_at: Utc::now(),
    }
}

async fn send_tip(
    store: &PgStore,
    sender: &Address,
    recipient: &Address,
    token: &TokenId,
    amount: Amount,
    relay: Option<&RequestKey>,
) -> tip_ledger::Result<TipRecord> {
    let record = tip_record(sender, recipient, token, amount, relay);
    store
        .commit_tip(
            &[debit(sender, token, amount), credit(recipient, token, amount)],
            &record,
        )
        .await?;
    Ok(record)
}

#[sqlx::test(migrations = "./migrations")]
async fn test_debit_is_conditional_and_batch_atomic(pool: PgPool) {
    let store = PgStore::from_pool(pool);
    let alice = addr("alice");
    let bob = addr("bob");

    store.apply_movements(&[credit(&alice, &usdt(), 10)]).await.unwrap();

    let err = store
        .apply_movements(&[credit(&bob, &usdt(), 50), debit(&alice, &usdt(), 50)])
        .await
        .unwrap_err();

    assert_eq!(err, LedgerError::InsufficientBalance);
    assert_eq!(store.balance(&alice, &usdt()).await.unwrap().amount, 10);
    assert_eq!(store.balance(&bob, &usdt()).await.unwrap().amount, 0);
    assert_eq!(store.token_supply(&usdt()).await.unwrap(), 10);

    // A debit on a row that was never created also fails cleanly
    assert_eq!(
        store
            .apply_movements(&[debit(&bob, &usdc(), 1)])
            .await
            .unwrap_err(),
        LedgerError::InsufficientBalance
    );
}

#[sqlx::test(migrations = "./migrations")]
async fn test_account_constraints_map_to_domain_errors(pool: PgPool) {
    let store = PgStore::from_pool(pool);
    register(&store, "alice", "Alice").await;

    let again = Account::new(addr("alice"), "other".into(), true, false, Utc::now());
    assert_eq!(
        store.insert_account(&again).await.unwrap_err(),
        LedgerError::AlreadyRegistered
    );

    let squatter = Account::new(addr("mallory"), "ALICE".into(), true, false, Utc::now());
    assert_eq!(
        store.insert_account(&squatter).await.unwrap_err(),
        LedgerError::HandleTaken
    );

    let found = store.account_by_handle("alice").await.unwrap().unwrap();
    assert_eq!(found.owner, addr("alice"));
    assert_eq!(found.handle, "Alice");
}

#[sqlx::test(migrations = "./migrations")]
async fn test_commit_tip_updates_counters_and_log(pool: PgPool) {
    let store = PgStore::from_pool(pool);
    let alice = register(&store, "alice", "Alice").await;
    let carol = register(&store, "carol", "Carol").await;
    store.apply_movements(&[credit(&alice, &usdt(), 100)]).await.unwrap();

    let key = RequestKey {
        operator: addr("tipbot"),
        request_id: "tweet-1".into(),
    };
    let record = send_tip(&store, &alice, &carol, &usdt(), 40, Some(&key))
        .await
        .unwrap();

    let sender = store.balance(&alice, &usdt()).await.unwrap();
    assert_eq!(sender.amount, 60);
    assert_eq!(sender.total_sent, 40);
    let recipient = store.balance(&carol, &usdt()).await.unwrap();
    assert_eq!(recipient.total_received, 40);

    assert_eq!(store.account(&alice).await.unwrap().unwrap().tips_sent, 1);
    assert_eq!(store.account(&carol).await.unwrap().unwrap().tips_received, 1);

    assert_eq!(store.tip(&record.id).await.unwrap().unwrap().id, record.id);
    assert_eq!(store.tips_for(&carol, 10, 0).await.unwrap().len(), 1);

    let since = Utc::now() - Duration::hours(1);
    let found = store.tip_for_request(&key, since).await.unwrap().unwrap();
    assert_eq!(found.id, record.id);
    assert!(store
        .tip_for_request(&key, Utc::now() + Duration::hours(1))
        .await
        .unwrap()
        .is_none());

    // Unknown recipient rolls back the balance movements
    let err = send_tip(&store, &alice, &addr("ghost"), &usdt(), 10, None)
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::RecipientNotFound);
    assert_eq!(store.balance(&alice, &usdt()).await.unwrap().amount, 60);
}

#[sqlx::test(migrations = "./migrations")]
async fn test_request_claim_lifecycle(pool: PgPool) {
    let store = PgStore::from_pool(pool);
    let key = RequestKey {
        operator: addr("tipbot"),
        request_id: "tweet-7".into(),
    };
    let t0 = Utc::now();
    let retention = t0 - Duration::hours(24);

    assert_eq!(
        store.claim_request(&key, t0, retention, t0).await.unwrap(),
        RequestClaim::Fresh
    );
    assert_eq!(
        store.claim_request(&key, t0, retention, t0).await.unwrap(),
        RequestClaim::Pending
    );

    let late = t0 + Duration::minutes(5);
    let lease = late - Duration::minutes(2);
    assert_eq!(
        store.claim_request(&key, late, retention, lease).await.unwrap(),
        RequestClaim::Abandoned
    );
    assert_eq!(
        store.claim_request(&key, late, retention, lease).await.unwrap(),
        RequestClaim::Pending
    );

    let outcome = RelayOutcome::Failed(LedgerError::InsufficientBalance);
    store.complete_request(&key, &outcome).await.unwrap();
    assert_eq!(
        store.claim_request(&key, late, retention, late).await.unwrap(),
        RequestClaim::Done(outcome)
    );

    store.release_request(&key).await.unwrap();
    assert_eq!(
        store.claim_request(&key, late, retention, late).await.unwrap(),
        RequestClaim::Fresh
    );

    let expired = late + Duration::hours(25);
    assert_eq!(
        store
            .claim_request(&key, expired, expired - Duration::hours(24), expired)
            .await
            .unwrap(),
        RequestClaim::Fresh
    );
}

#[sqlx::test(migrations = "./migrations")]
async fn test_crossing_tips_do_not_deadlock(pool: PgPool) {
    let store = Arc::new(PgStore::from_pool(pool));
    let alice = register(&store, "alice", "Alice").await;
    let bob = register(&store, "bob", "Bob").await;
    store
        .apply_movements(&[credit(&alice, &usdt(), 1_000), credit(&bob, &usdc(), 1_000)])
        .await
        .unwrap();

    // Opposite directions in different tokens share no balance rows
    let mut handles = Vec::new();
    for _ in 0..20 {
        let s = store.clone();
        let (a, b) = (alice.clone(), bob.clone());
        handles.push(tokio::spawn(async move {
            send_tip(&s, &a, &b, &usdt(), 1, None).await
        }));
        let s = store.clone();
        let (a, b) = (alice.clone(), bob.clone());
        handles.push(tokio::spawn(async move {
            send_tip(&s, &b, &a, &usdc(), 1, None).await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(store.account(&alice).await.unwrap().unwrap().tips_sent, 20);
    assert_eq!(store.account(&alice).await.unwrap().unwrap().tips_received, 20);
    assert_eq!(store.balance(&alice, &usdt()).await.unwrap().amount, 980);
    assert_eq!(store.balance(&bob, &usdc()).await.unwrap().amount, 980);
}
