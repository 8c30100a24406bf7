// Copyright 2024 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{LockError, Result};
use crate::expiry::check_not_expired;
use crate::key::Key;
use crate::store::LockStore;

/// Result of a conditional insert into a cache backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// The entry was created and the lock is ours.
    Inserted,
    /// An entry already exists, held by `token`.
    Exists { token: String },
}

/// Key/value backend with atomic compare-and-set primitives and native
/// entry expiry, as offered by Redis or Memcached.
///
/// Every operation must be atomic on the backend side; the store layers no
/// locking of its own on top.
#[async_trait]
pub trait CacheBackend: Send + Sync + std::fmt::Debug {
    /// Backend identifier used in store names and error messages.
    fn name(&self) -> &str;

    /// Create `resource -> token` with `ttl` only if the entry is absent.
    async fn put_if_absent(&self, resource: &str, token: &str, ttl: Duration) -> Result<PutOutcome>;

    /// Reset the entry's ttl, only if it still holds `token`. Returns
    /// whether the entry was updated.
    async fn update_if_matches(&self, resource: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Remove the entry, only if it still holds `token`. Returns whether
    /// the entry was removed.
    async fn delete_if_matches(&self, resource: &str, token: &str) -> Result<bool>;

    /// The token currently stored for `resource`, if any.
    async fn current_token(&self, resource: &str) -> Result<Option<String>>;
}

/// Self-expiring lock store on top of a [`CacheBackend`].
///
/// The lock entry is the resource name mapped to the key's random token;
/// the backend's native ttl provides the lease, so a crashed holder is
/// evicted without any reaper.
#[derive(Debug)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    initial_ttl: Duration,
    scope: String,
}

impl CacheStore {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self::with_ttl(backend, Self::DEFAULT_TTL)
    }

    /// `initial_ttl` is the lease granted on acquisition; it must not be
    /// zero.
    pub fn with_ttl(backend: Arc<dyn CacheBackend>, initial_ttl: Duration) -> Self {
        let scope = format!("cache:{}", backend.name());
        Self { backend, initial_ttl, scope }
    }
}

#[async_trait]
impl LockStore for CacheStore {
    fn name(&self) -> &str {
        self.backend.name()
    }

    async fn save(&self, key: &mut Key) -> Result<()> {
        if self.initial_ttl.is_zero() {
            return Err(LockError::invalid_ttl(self.initial_ttl));
        }

        key.reduce_lifetime(self.initial_ttl);
        let token = key.unique_token(&self.scope);
        match self.backend.put_if_absent(key.resource(), &token, self.initial_ttl).await? {
            PutOutcome::Inserted => check_not_expired(self, key).await,
            PutOutcome::Exists { token: holder } if holder == token => {
                // The entry is already ours: refresh the lease instead.
                self.put_off_expiration(key, self.initial_ttl).await
            }
            PutOutcome::Exists { .. } => Err(LockError::conflict(key.resource())),
        }
    }

    async fn put_off_expiration(&self, key: &mut Key, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Err(LockError::invalid_ttl(ttl));
        }

        key.reduce_lifetime(ttl);
        let token = key.unique_token(&self.scope);
        if !self.backend.update_if_matches(key.resource(), &token, ttl).await? {
            return Err(LockError::conflict(key.resource()));
        }
        check_not_expired(self, key).await
    }

    async fn delete(&self, key: &mut Key) -> Result<()> {
        let token = key.unique_token(&self.scope);
        self.backend.delete_if_matches(key.resource(), &token).await?;
        Ok(())
    }

    async fn exists(&self, key: &Key) -> Result<bool> {
        let Some(token) = key.token(&self.scope) else {
            return Ok(false);
        };
        Ok(self.backend.current_token(key.resource()).await?.as_deref() == Some(token))
    }
}

/// In-process [`CacheBackend`] with a manually advanceable clock, usable as
/// a stand-in where no cache server is available.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    skew: Mutex<Duration>,
}

#[derive(Debug)]
struct CacheEntry {
    token: String,
    expires_at: Instant,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shift the cache's notion of "now" forward, expiring entries whose
    /// ttl has elapsed.
    pub fn advance(&self, by: Duration) {
        *self.skew.lock().expect("cache clock poisoned") += by;
    }

    fn now(&self) -> Instant {
        Instant::now() + *self.skew.lock().expect("cache clock poisoned")
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    fn name(&self) -> &str {
        "memory-cache"
    }

    async fn put_if_absent(&self, resource: &str, token: &str, ttl: Duration) -> Result<PutOutcome> {
        let now = self.now();
        let mut entries = self.entries.lock().expect("cache poisoned");
        match entries.get(resource) {
            Some(entry) if entry.expires_at > now => Ok(PutOutcome::Exists { token: entry.token.clone() }),
            _ => {
                entries.insert(
                    resource.to_string(),
                    CacheEntry { token: token.to_string(), expires_at: now + ttl },
                );
                Ok(PutOutcome::Inserted)
            }
        }
    }

    async fn update_if_matches(&self, resource: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = self.now();
        let mut entries = self.entries.lock().expect("cache poisoned");
        match entries.get_mut(resource) {
            Some(entry) if entry.expires_at > now && entry.token == token => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_matches(&self, resource: &str, token: &str) -> Result<bool> {
        let mut entries = self.entries.lock().expect("cache poisoned");
        match entries.get(resource) {
            Some(entry) if entry.token == token => {
                entries.remove(resource);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current_token(&self, resource: &str) -> Result<Option<String>> {
        let now = self.now();
        let entries = self.entries.lock().expect("cache poisoned");
        Ok(entries
            .get(resource)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.token.clone()))
    }
}
