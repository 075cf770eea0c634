// Public operations of the tip ledger, one method per external call.
//
// `caller` is always the authenticated identity making the call; how it was
// authenticated (wallet signature, session) is decided by the transport.

use chrono::Duration;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::authorization::AuthorizationStore;
use crate::clock::Clock;
use crate::command::{CommandParser, Mention};
use crate::custody::Custody;
use crate::error::{LedgerError, Result};
use crate::fees::FeeSchedule;
use crate::ledger::BalanceLedger;
use crate::models::{
    Account, Address, AllowanceView, Amount, Authorization, Balance, CreatorView, TipRecord,
    TokenId, UserProfile,
};
use crate::registry::AccountRegistry;
use crate::relay::{RelayGateway, RelayReceipt, RelayRejection, RelayRequest};
use crate::store::Store;
use crate::tips::TipEngine;

/// Largest page returned by `tips_for`
pub const MAX_PAGE_SIZE: usize = 100;

pub struct ServiceSettings {
    /// Only this identity may add supported tokens
    pub admin: Address,
    /// Credited with every platform fee
    pub fee_account: Address,
    pub fees: FeeSchedule,
    pub dedup_retention: Duration,
    pub parser: CommandParser,
}

pub struct TipService<S, K> {
    store: Arc<S>,
    registry: AccountRegistry<S>,
    ledger: BalanceLedger<S, K>,
    authorizations: AuthorizationStore<S>,
    engine: TipEngine<S, K>,
    relay: RelayGateway<S, K>,
    parser: Arc<CommandParser>,
    admin: Address,
}

impl<S, K> Clone for TipService<S, K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            ledger: self.ledger.clone(),
            authorizations: self.authorizations.clone(),
            engine: self.engine.clone(),
            relay: self.relay.clone(),
            parser: self.parser.clone(),
            admin: self.admin.clone(),
        }
    }
}

impl<S: Store, K: Custody> TipService<S, K> {
    pub fn new(
        store: Arc<S>,
        custody: Arc<K>,
        clock: Arc<dyn Clock>,
        settings: ServiceSettings,
    ) -> Self {
        let registry = AccountRegistry::new(store.clone(), clock.clone());
        let ledger = BalanceLedger::new(store.clone(), custody);
        let authorizations = AuthorizationStore::new(store.clone(), clock.clone());
        let engine = TipEngine::new(
            store.clone(),
            registry.clone(),
            ledger.clone(),
            settings.fees,
            clock.clone(),
            settings.fee_account,
        );
        let relay = RelayGateway::new(
            store.clone(),
            authorizations.clone(),
            engine.clone(),
            clock,
            settings.dedup_retention,
        );

        Self {
            store,
            registry,
            ledger,
            authorizations,
            engine,
            relay,
            parser: Arc::new(settings.parser),
            admin: settings.admin,
        }
    }

    pub fn fee_account(&self) -> &Address {
        self.engine.fee_account()
    }

    pub fn fees(&self) -> &FeeSchedule {
        self.engine.fees()
    }

    pub fn parser(&self) -> &CommandParser {
        &self.parser
    }

    async fn require_registered(&self, caller: &Address) -> Result<()> {
        if self.registry.is_registered(caller).await? {
            Ok(())
        } else {
            Err(LedgerError::NotRegistered)
        }
    }

    // ========================================================================
    // ACCOUNTS
    // ========================================================================

    pub async fn register(
        &self,
        caller: &Address,
        handle: &str,
        as_creator: bool,
        as_tipper: bool,
    ) -> Result<Account> {
        self.registry
            .register(caller, handle, as_creator, as_tipper)
            .await
    }

    pub async fn promote_to_creator(&self, caller: &Address) -> Result<Account> {
        self.registry.promote_to_creator(caller).await
    }

    pub async fn promote_to_tipper(&self, caller: &Address) -> Result<Account> {
        self.registry.promote_to_tipper(caller).await
    }

    pub async fn get_user_profile(&self, account: &Address) -> Result<UserProfile> {
        let account = self
            .registry
            .account(account)
            .await?
            .ok_or(LedgerError::NotRegistered)?;
        let balances = self.ledger.balances(&account.owner).await?;
        Ok(UserProfile { account, balances })
    }

    pub async fn get_creator_by_handle(&self, handle: &str) -> Result<CreatorView> {
        let account = self
            .registry
            .resolve(handle)
            .await?
            .ok_or(LedgerError::RecipientNotFound)?;
        if !account.is_creator {
            return Err(LedgerError::RecipientNotCreator);
        }
        Ok(CreatorView {
            owner: account.owner,
            handle: account.handle,
            tips_received: account.tips_received,
            registered_at: account.registered_at,
        })
    }

    // ========================================================================
    // BALANCES
    // ========================================================================

    pub async fn deposit(&self, caller: &Address, token: &TokenId, amount: Amount) -> Result<Balance> {
        self.require_registered(caller).await?;
        self.ledger.deposit(caller, token, amount).await
    }

    /// No registration check, so the fee account can withdraw collected fees
    pub async fn withdraw(&self, caller: &Address, token: &TokenId, amount: Amount) -> Result<Balance> {
        self.ledger.withdraw(caller, token, amount).await
    }

    pub async fn balance_of(&self, account: &Address, token: &TokenId) -> Result<Amount> {
        self.ledger.balance_of(account, token).await
    }

    // ========================================================================
    // OPERATORS
    // ========================================================================

    pub async fn authorize_operator(
        &self,
        caller: &Address,
        operator: &Address,
        daily_limit: Amount,
    ) -> Result<Authorization> {
        self.require_registered(caller).await?;
        self.authorizations
            .authorize(caller, operator, daily_limit)
            .await
    }

    pub async fn revoke_operator(&self, caller: &Address, operator: &Address) -> Result<Authorization> {
        self.authorizations.revoke(caller, operator).await
    }

    pub async fn is_authorized(&self, account: &Address, operator: &Address) -> Result<bool> {
        self.authorizations.is_authorized(account, operator).await
    }

    pub async fn allowance(&self, account: &Address, operator: &Address) -> Result<AllowanceView> {
        self.authorizations
            .allowance(account, operator)
            .await?
            .ok_or(LedgerError::AuthorizationNotFound)
    }

    // ========================================================================
    // TIPS
    // ========================================================================

    pub async fn tip(
        &self,
        caller: &Address,
        recipient_handle: &str,
        token: &TokenId,
        amount: Amount,
        message: &str,
    ) -> Result<TipRecord> {
        self.engine
            .tip(caller, recipient_handle, token, amount, message)
            .await
    }

    pub async fn tip_for(&self, request: RelayRequest) -> Result<RelayReceipt, RelayRejection> {
        self.relay.tip_for(request).await
    }

    /// Parse a bot mention and relay it for its author
    pub async fn relay_mention(
        &self,
        operator: &Address,
        mention: &Mention,
    ) -> Result<RelayReceipt, RelayRejection> {
        let command = self
            .parser
            .parse(&mention.text)
            .map_err(RelayRejection::before)?;

        let author = self
            .registry
            .resolve(&mention.author_handle)
            .await
            .map_err(RelayRejection::before)?
            .ok_or_else(|| RelayRejection::before(LedgerError::NotRegistered))?;

        info!(
            "Mention {} from @{}: tip @{} {} {}",
            mention.id, author.handle, command.recipient_handle, command.amount, command.symbol
        );

        let request = command.into_relay_request(operator.clone(), author.owner, mention.id.clone());
        self.relay.tip_for(request).await
    }

    pub async fn tip_record(&self, id: &Uuid) -> Result<TipRecord> {
        self.engine.tip_record(id).await
    }

    /// Newest first; `limit` is capped at [`MAX_PAGE_SIZE`]
    pub async fn tips_for(&self, account: &Address, limit: usize, offset: usize) -> Result<Vec<TipRecord>> {
        self.engine
            .tips_for(account, limit.min(MAX_PAGE_SIZE), offset)
            .await
    }

    // ========================================================================
    // SUPPORTED TOKENS
    // ========================================================================

    /// Admin only. Returns true when the token was newly added.
    pub async fn add_supported_token(&self, caller: &Address, token: &TokenId) -> Result<bool> {
        if *caller != self.admin {
            return Err(LedgerError::NotAdmin);
        }
        let added = self.store.add_supported_token(token).await?;
        if added {
            info!("Supported token added: {}", token);
        }
        Ok(added)
    }

    pub async fn supported_tokens(&self) -> Result<Vec<TokenId>> {
        self.store.supported_tokens().await
    }

    /// Sum of all ledger balances in `token`, for reconciliation against custody
    pub async fn token_supply(&self, token: &TokenId) -> Result<u128> {
        self.ledger.token_supply(token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::command::TokenSpec;
    use crate::custody::TrackingCustody;
    use crate::store::MemoryStore;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn usdt() -> TokenId {
        TokenId::parse("0xdac17f958d2ee523a2206206994597c13d831ec7").unwrap()
    }

    async fn service() -> TipService<MemoryStore, TrackingCustody> {
        let parser = CommandParser::new(
            vec![TokenSpec {
                symbol: "USDT".into(),
                token: usdt(),
                decimals: 6,
            }],
            Some("tipbot"),
        );
        let service = TipService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(TrackingCustody::new()),
            Arc::new(SystemClock),
            ServiceSettings {
                admin: addr("admin"),
                fee_account: addr("platform"),
                fees: FeeSchedule::default(),
                dedup_retention: Duration::hours(24),
                parser,
            },
        );
        service
            .add_supported_token(&addr("admin"), &usdt())
            .await
            .unwrap();
        service
    }

    #[tokio::test]
    async fn test_add_supported_token_admin_only() {
        let service = service().await;
        let other = TokenId::parse("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48").unwrap();

        assert_eq!(
            service
                .add_supported_token(&addr("alice"), &other)
                .await
                .unwrap_err(),
            LedgerError::NotAdmin
        );
        assert!(service.add_supported_token(&addr("admin"), &other).await.unwrap());
        assert!(!service.add_supported_token(&addr("admin"), &other).await.unwrap());
        assert_eq!(service.supported_tokens().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_deposit_and_authorize_require_registration() {
        let service = service().await;
        assert_eq!(
            service.deposit(&addr("bob"), &usdt(), 10).await.unwrap_err(),
            LedgerError::NotRegistered
        );
        assert_eq!(
            service
                .authorize_operator(&addr("bob"), &addr("bot"), 10)
                .await
                .unwrap_err(),
            LedgerError::NotRegistered
        );
    }

    #[tokio::test]
    async fn test_profile_and_creator_views() {
        let service = service().await;
        service.register(&addr("alice"), "Alice", true, true).await.unwrap();
        service.register(&addr("dave"), "dave", false, true).await.unwrap();
        service.deposit(&addr("alice"), &usdt(), 500).await.unwrap();

        let profile = service.get_user_profile(&addr("alice")).await.unwrap();
        assert_eq!(profile.account.handle, "Alice");
        assert_eq!(profile.balances.len(), 1);
        assert_eq!(profile.balances[0].amount, 500);

        let creator = service.get_creator_by_handle("@alice").await.unwrap();
        assert_eq!(creator.owner, addr("alice"));
        assert_eq!(
            service.get_creator_by_handle("dave").await.unwrap_err(),
            LedgerError::RecipientNotCreator
        );
        assert_eq!(
            service.get_creator_by_handle("nobody").await.unwrap_err(),
            LedgerError::RecipientNotFound
        );
    }

    #[tokio::test]
    async fn test_relay_mention() {
        let service = service().await;
        service.register(&addr("alice"), "alice", false, true).await.unwrap();
        service.register(&addr("carol"), "carol", true, false).await.unwrap();
        service.deposit(&addr("alice"), &usdt(), 20_000_000).await.unwrap();
        service
            .authorize_operator(&addr("alice"), &addr("bot"), 50_000_000)
            .await
            .unwrap();

        let mention = Mention {
            id: "1790000000000000001".into(),
            author_handle: "Alice".into(),
            text: "@tipbot tip @carol 10 USDT nice".into(),
        };
        let receipt = service.relay_mention(&addr("bot"), &mention).await.unwrap();
        assert!(!receipt.is_replay());
        assert_eq!(receipt.record().gross_amount, 10_000_000);
        assert_eq!(receipt.record().request_id.as_deref(), Some("1790000000000000001"));

        let again = service.relay_mention(&addr("bot"), &mention).await.unwrap();
        assert!(again.is_replay());
        assert_eq!(again.record(), receipt.record());
        assert_eq!(
            service.balance_of(&addr("alice"), &usdt()).await.unwrap(),
            10_000_000
        );

        let stranger = Mention {
            id: "1790000000000000002".into(),
            author_handle: "mallory".into(),
            text: "@tipbot tip @carol 1 USDT".into(),
        };
        let rejection = service.relay_mention(&addr("bot"), &stranger).await.unwrap_err();
        assert_eq!(rejection.error, LedgerError::NotRegistered);
        assert!(!rejection.quota_consumed());
    }
}
