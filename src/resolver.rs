//! Phone → user resolution with a process-local read-through cache.
//!
//! Cross-process consistency is TTL-based only; mapping mutations in this
//! process call [`PhoneResolver::invalidate`] directly.

use crate::config::ResolverConfig;
use crate::phone::PhoneNumber;
use crate::store::StoreError;
use crate::store::identity::{IdentityStore, ResolvedUser};
use dashmap::DashMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    /// `None` is a cached negative: the phone resolved to nobody.
    value: Option<ResolvedUser>,
    expires_at: Instant,
}

/// Fast phone → `{user, verified}` lookup over the identity store.
///
/// Callers pass already-normalized numbers; the resolver never normalizes.
#[derive(Debug)]
pub struct PhoneResolver {
    store: IdentityStore,
    config: ResolverConfig,
    cache: DashMap<String, CacheEntry>,
}

impl PhoneResolver {
    pub fn new(store: IdentityStore, config: ResolverConfig) -> Self {
        Self {
            store,
            config,
            cache: DashMap::new(),
        }
    }

    /// Resolve a phone to its verified owner, if any.
    ///
    /// Hits are served from cache within the TTL (positive) or the shorter
    /// negative TTL (unknown numbers); misses read through to the store.
    pub async fn resolve(
        &self,
        phone: &PhoneNumber,
    ) -> Result<Option<ResolvedUser>, StoreError> {
        if let Some(entry) = self.cache.get(phone.as_str()) {
            if entry.expires_at > Instant::now() {
                return Ok(entry.value);
            }
        }

        let value = self.store.find_user_by_phone(phone).await?;
        let ttl = if value.is_some() {
            self.config.ttl
        } else {
            self.config.negative_ttl
        };
        self.cache.insert(
            phone.as_str().to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(value)
    }

    /// Drop the cached entry for a phone after a mapping mutation.
    pub fn invalidate(&self, phone: &PhoneNumber) {
        self.cache.remove(phone.as_str());
    }
}
