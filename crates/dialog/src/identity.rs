//! Best-effort participant identity resolution with a lock-free cache.
//!
//! Profiles are cosmetic. A lookup failure caches the placeholder so the
//! dialog renders "N/A" instead of retrying on every paint.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parley_store::{AccountId, IdentityBackend, Profile};

pub struct IdentityDirectory {
    backend: Arc<dyn IdentityBackend>,
    cache: ArcSwap<HashMap<AccountId, Arc<Profile>>>,
}

impl IdentityDirectory {
    pub fn new(backend: Arc<dyn IdentityBackend>) -> Self {
        Self {
            backend,
            cache: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Cached profile, or the placeholder if the account has never been
    /// fetched. Never blocks.
    pub fn resolve(&self, account_id: AccountId) -> Arc<Profile> {
        self.cache
            .load()
            .get(&account_id)
            .cloned()
            .unwrap_or_else(|| Arc::new(Profile::placeholder()))
    }

    pub fn is_cached(&self, account_id: AccountId) -> bool {
        self.cache.load().contains_key(&account_id)
    }

    /// Fetches any uncached accounts and swaps in a new cache generation.
    /// Lookup failures are logged and cached as placeholders.
    pub async fn prefetch(&self, accounts: impl IntoIterator<Item = AccountId>) {
        let missing: Vec<AccountId> = {
            let current = self.cache.load();
            accounts
                .into_iter()
                .filter(|account| !current.contains_key(account))
                .collect()
        };
        if missing.is_empty() {
            return;
        }

        let mut fetched = Vec::with_capacity(missing.len());
        for account in missing {
            let profile = match self.backend.lookup_profile(account).await {
                Ok(profile) => Arc::new(profile),
                Err(error) => {
                    tracing::warn!(%account, %error, "profile lookup failed, using placeholder");
                    Arc::new(Profile::placeholder())
                }
            };
            fetched.push((account, profile));
        }

        // Merge into whatever generation is current by the time the lookups
        // finish; a plain store would drop entries written by a concurrent
        // prefetch.
        self.cache.rcu(|current| {
            let mut next = HashMap::clone(current);
            for (account, profile) in &fetched {
                next.insert(*account, Arc::clone(profile));
            }
            next
        });
    }
}
