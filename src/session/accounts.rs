//! Account store: active identity, account→token map and snapshots,
//! mirrored to the database.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::api::AuthorizeInfo;
use crate::db::{Database, ACTIVE_LOGINID_KEY, ACTIVE_TOKEN_KEY};
use crate::models::{mask_token, AccountSnapshot};

#[derive(Debug, Clone)]
pub struct KnownAccount {
    pub token: String,
    pub snapshot: AccountSnapshot,
    /// Pinned credentials are never cleared automatically
    pub pinned: bool,
}

#[derive(Debug, Default)]
struct StoreState {
    active_token: Option<String>,
    active_loginid: Option<String>,
    accounts: BTreeMap<String, KnownAccount>,
}

pub struct AccountStore {
    db: Arc<Database>,
    state: Mutex<StoreState>,
}

impl AccountStore {
    /// Load the persisted identity and accounts.
    pub async fn load(db: Arc<Database>) -> Result<Self> {
        let mut state = StoreState {
            active_token: db.get_state(ACTIVE_TOKEN_KEY).await?,
            active_loginid: db.get_state(ACTIVE_LOGINID_KEY).await?,
            accounts: BTreeMap::new(),
        };
        for stored in db.get_accounts().await? {
            let balance = stored.balance();
            state.accounts.insert(
                stored.loginid.clone(),
                KnownAccount {
                    token: stored.token,
                    snapshot: AccountSnapshot {
                        loginid: stored.loginid,
                        currency: stored.currency,
                        balance,
                        is_virtual: stored.is_virtual,
                    },
                    pinned: stored.pinned,
                },
            );
        }

        Ok(Self {
            db,
            state: Mutex::new(state),
        })
    }

    pub fn active_token(&self) -> Option<String> {
        self.state.lock().active_token.clone()
    }

    pub fn active_loginid(&self) -> Option<String> {
        self.state.lock().active_loginid.clone()
    }

    pub fn active_account(&self) -> Option<KnownAccount> {
        let state = self.state.lock();
        let loginid = state.active_loginid.as_ref()?;
        state.accounts.get(loginid).cloned()
    }

    pub fn account(&self, loginid: &str) -> Option<KnownAccount> {
        self.state.lock().accounts.get(loginid).cloned()
    }

    pub fn accounts(&self) -> Vec<KnownAccount> {
        self.state.lock().accounts.values().cloned().collect()
    }

    pub fn is_pinned(&self, token: &str) -> bool {
        self.state
            .lock()
            .accounts
            .values()
            .any(|a| a.token == token && a.pinned)
    }

    /// Remember an account the venue just authorized.
    pub async fn record_login(&self, token: &str, info: &AuthorizeInfo, pinned: bool) -> Result<()> {
        self.db
            .save_account(
                &info.loginid,
                token,
                &info.currency,
                info.balance,
                info.is_virtual,
                pinned,
            )
            .await?;

        let mut state = self.state.lock();
        let was_pinned = state
            .accounts
            .get(&info.loginid)
            .map(|a| a.pinned)
            .unwrap_or(false);
        state.accounts.insert(
            info.loginid.clone(),
            KnownAccount {
                token: token.to_string(),
                snapshot: AccountSnapshot {
                    loginid: info.loginid.clone(),
                    currency: info.currency.clone(),
                    balance: info.balance,
                    is_virtual: info.is_virtual,
                },
                pinned: pinned || was_pinned,
            },
        );
        Ok(())
    }

    /// Make `loginid` the active account. Trades placed afterwards are
    /// attributed to it.
    pub async fn set_active(&self, loginid: &str) -> Result<()> {
        let token = self
            .account(loginid)
            .map(|a| a.token)
            .ok_or_else(|| anyhow::anyhow!("Unknown account {loginid}"))?;

        self.db.set_state(ACTIVE_TOKEN_KEY, &token).await?;
        self.db.set_state(ACTIVE_LOGINID_KEY, loginid).await?;

        let mut state = self.state.lock();
        state.active_token = Some(token);
        state.active_loginid = Some(loginid.to_string());
        Ok(())
    }

    pub async fn update_balance(&self, loginid: &str, balance: Decimal) -> Result<()> {
        {
            let mut state = self.state.lock();
            match state.accounts.get_mut(loginid) {
                Some(account) => account.snapshot.balance = balance,
                None => return Ok(()),
            }
        }
        self.db.update_account_balance(loginid, balance).await
    }

    /// Logout: forget the active identity and every stored account.
    pub async fn clear_session(&self) -> Result<()> {
        self.db.delete_state(ACTIVE_TOKEN_KEY).await?;
        self.db.delete_state(ACTIVE_LOGINID_KEY).await?;
        self.db.clear_accounts().await?;

        *self.state.lock() = StoreState::default();
        info!("Session data cleared");
        Ok(())
    }

    /// React to a rejected credential. Session data is cleared unless the
    /// token is pinned. Returns whether anything was cleared.
    pub async fn handle_invalid_credential(&self, token: &str) -> Result<bool> {
        if self.is_pinned(token) {
            warn!(token = %mask_token(token), "Pinned credential rejected, keeping session data");
            return Ok(false);
        }
        if self.active_token().as_deref() != Some(token) {
            // Not the active credential; nothing to log out of.
            return Ok(false);
        }
        self.clear_session().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn info(loginid: &str, is_virtual: bool) -> AuthorizeInfo {
        AuthorizeInfo {
            loginid: loginid.to_string(),
            currency: "USD".to_string(),
            balance: dec!(100),
            is_virtual,
            account_list: Vec::new(),
        }
    }

    async fn store() -> AccountStore {
        let db = Arc::new(Database::in_memory().await.unwrap());
        AccountStore::load(db).await.unwrap()
    }

    #[tokio::test]
    async fn test_set_active_persists() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let store = AccountStore::load(Arc::clone(&db)).await.unwrap();
        store.record_login("tok-virtual-1", &info("VRTC1", true), false).await.unwrap();
        store.record_login("tok-real-0001", &info("CR1", false), false).await.unwrap();

        store.set_active("CR1").await.unwrap();
        assert_eq!(store.active_token().as_deref(), Some("tok-real-0001"));

        let reloaded = AccountStore::load(db).await.unwrap();
        assert_eq!(reloaded.active_loginid().as_deref(), Some("CR1"));
        assert_eq!(reloaded.accounts().len(), 2);
        assert!(reloaded.set_active("MISSING").await.is_err());
    }

    #[tokio::test]
    async fn test_pinned_credential_is_not_cleared() {
        let store = store().await;
        store.record_login("tok-pinned-01", &info("CR1", false), true).await.unwrap();
        store.set_active("CR1").await.unwrap();

        assert!(!store.handle_invalid_credential("tok-pinned-01").await.unwrap());
        assert_eq!(store.active_loginid().as_deref(), Some("CR1"));
        assert_eq!(store.accounts().len(), 1);
    }

    #[tokio::test]
    async fn test_unpinned_active_credential_is_cleared() {
        let store = store().await;
        store.record_login("tok-plain-001", &info("CR1", false), false).await.unwrap();
        store.set_active("CR1").await.unwrap();

        assert!(store.handle_invalid_credential("tok-plain-001").await.unwrap());
        assert!(store.active_token().is_none());
        assert!(store.accounts().is_empty());
    }
}
