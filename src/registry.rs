//! Account registry: handle <-> account bijection and role flags.

use std::sync::Arc;
use tracing::info;

use crate::clock::Clock;
use crate::error::{LedgerError, Result};
use crate::models::{handle_key, validate_handle, Account, Address};
use crate::store::Store;

pub struct AccountRegistry<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for AccountRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<S: Store> AccountRegistry<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create an account for `caller` bound to `handle`.
    pub async fn register(
        &self,
        caller: &Address,
        handle: &str,
        as_creator: bool,
        as_tipper: bool,
    ) -> Result<Account> {
        let handle = validate_handle(handle)?;
        if !as_creator && !as_tipper {
            return Err(LedgerError::InvalidRole);
        }

        let account = Account::new(
            caller.clone(),
            handle,
            as_creator,
            as_tipper,
            self.clock.now(),
        );
        self.store.insert_account(&account).await?;

        info!(
            "Registered @{} for {} (creator={}, tipper={})",
            account.handle, caller, as_creator, as_tipper
        );
        Ok(account)
    }

    /// Idempotent
    pub async fn promote_to_creator(&self, caller: &Address) -> Result<Account> {
        let account = self
            .store
            .update_account(caller, |account| {
                account.is_creator = true;
                Ok(())
            })
            .await?;
        info!("@{} is a creator", account.handle);
        Ok(account)
    }

    /// Idempotent
    pub async fn promote_to_tipper(&self, caller: &Address) -> Result<Account> {
        let account = self
            .store
            .update_account(caller, |account| {
                account.is_tipper = true;
                Ok(())
            })
            .await?;
        info!("@{} is a tipper", account.handle);
        Ok(account)
    }

    /// Case-insensitive lookup of an active account
    pub async fn resolve(&self, handle: &str) -> Result<Option<Account>> {
        let found = self.store.account_by_handle(&handle_key(handle)).await?;
        Ok(found.filter(|account| account.active))
    }

    pub async fn account(&self, owner: &Address) -> Result<Option<Account>> {
        self.store.account(owner).await
    }

    pub async fn is_registered(&self, owner: &Address) -> Result<bool> {
        Ok(self
            .store
            .account(owner)
            .await?
            .map(|account| account.active)
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::MemoryStore;

    fn registry() -> AccountRegistry<MemoryStore> {
        AccountRegistry::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock))
    }

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let registry = registry();
        let account = registry
            .register(&addr("alice"), "Alice", true, true)
            .await
            .unwrap();

        assert!(account.active);
        assert_eq!(account.handle, "Alice");

        let found = registry.resolve("ALICE").await.unwrap().unwrap();
        assert_eq!(found.owner, addr("alice"));
        assert!(registry.resolve("@alice").await.unwrap().is_some());
        assert!(registry.resolve("bob").await.unwrap().is_none());
        assert!(registry.is_registered(&addr("alice")).await.unwrap());
        assert!(!registry.is_registered(&addr("bob")).await.unwrap());
    }

    #[tokio::test]
    async fn test_register_rejections() {
        let registry = registry();

        assert_eq!(
            registry
                .register(&addr("alice"), "alice", false, false)
                .await
                .unwrap_err(),
            LedgerError::InvalidRole
        );
        assert!(matches!(
            registry.register(&addr("alice"), "1234", true, false).await,
            Err(LedgerError::InvalidHandle(_))
        ));

        registry
            .register(&addr("alice"), "alice", true, false)
            .await
            .unwrap();

        assert_eq!(
            registry
                .register(&addr("alice"), "alice2", true, false)
                .await
                .unwrap_err(),
            LedgerError::AlreadyRegistered
        );
        assert_eq!(
            registry
                .register(&addr("bob"), "Alice", true, false)
                .await
                .unwrap_err(),
            LedgerError::HandleTaken
        );
    }

    #[tokio::test]
    async fn test_promote_is_idempotent() {
        let registry = registry();
        registry
            .register(&addr("carol"), "carol", true, false)
            .await
            .unwrap();

        let first = registry.promote_to_tipper(&addr("carol")).await.unwrap();
        let second = registry.promote_to_tipper(&addr("carol")).await.unwrap();
        assert!(first.is_tipper && second.is_tipper);
        assert_eq!(first, second);

        let creator = registry.promote_to_creator(&addr("carol")).await.unwrap();
        assert!(creator.is_creator);

        assert_eq!(
            registry.promote_to_creator(&addr("dave")).await.unwrap_err(),
            LedgerError::NotRegistered
        );
    }
}
