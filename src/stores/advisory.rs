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
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{LockError, Result};
use crate::key::Key;
use crate::store::{LockMode, LockStore};
use crate::stores::memory::InMemoryStore;

const STORE_NAME: &str = "advisory";

/// One backend session holding advisory locks, in the manner of a
/// PostgreSQL connection with `pg_advisory_lock`.
///
/// Locks are owned by the session, stack when re-taken, and never conflict
/// within the session; they vanish when the session ends. Keys are 64-bit
/// integers chosen by the caller.
#[async_trait]
pub trait AdvisorySession: Send + Sync + std::fmt::Debug {
    /// Stable identifier for this session, used to share per-session
    /// bookkeeping between stores on the same session.
    fn session_id(&self) -> &str;

    async fn try_lock_exclusive(&self, key: i64) -> Result<bool>;
    async fn try_lock_shared(&self, key: i64) -> Result<bool>;

    /// Block until the exclusive lock is granted.
    async fn lock_exclusive(&self, key: i64) -> Result<()>;

    /// Block until the shared lock is granted.
    async fn lock_shared(&self, key: i64) -> Result<()>;

    /// Release one stacked exclusive hold. Returns whether one was held.
    async fn unlock_exclusive(&self, key: i64) -> Result<bool>;

    /// Release one stacked shared hold. Returns whether one was held.
    async fn unlock_shared(&self, key: i64) -> Result<bool>;
}

/// Per-session shadow state shared by every [`AdvisoryStore`] on the same
/// session.
///
/// The backend only knows which *session* holds a lock; two keys going
/// through the same session would otherwise both stack a hold and both
/// believe they own the resource. The shadow store arbitrates between them.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    shadows: Mutex<HashMap<String, Arc<InMemoryStore>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn shadow(&self, session_id: &str) -> Arc<InMemoryStore> {
        let mut shadows = self.shadows.lock().expect("session registry poisoned");
        Arc::clone(
            shadows
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(InMemoryStore::new())),
        )
    }
}

/// Lock store on top of session-scoped advisory locks.
///
/// Supports shared locks, blocking waits, promotion and demotion. Locks
/// live as long as the session, so there is no lease to renew.
#[derive(Debug)]
pub struct AdvisoryStore {
    session: Arc<dyn AdvisorySession>,
    shadow: Arc<InMemoryStore>,
}

impl AdvisoryStore {
    pub fn new(session: Arc<dyn AdvisorySession>, registry: &SessionRegistry) -> Self {
        let shadow = registry.shadow(session.session_id());
        Self { session, shadow }
    }

    /// Advisory keys are 64-bit; fold the resource name down through its
    /// digest so any name fits.
    fn advisory_key(resource: &str) -> i64 {
        let digest = Sha256::digest(resource.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(bytes)
    }

    async fn release_backend(&self, key: &Key, mode: LockMode) -> Result<()> {
        let id = Self::advisory_key(key.resource());
        let released = match mode {
            LockMode::Exclusive => self.session.unlock_exclusive(id).await?,
            LockMode::Shared => self.session.unlock_shared(id).await?,
        };
        if !released {
            debug!(resource = %key.resource(), session = %self.session.session_id(),
                "advisory unlock found no stacked hold");
        }
        Ok(())
    }
}

#[async_trait]
impl LockStore for AdvisoryStore {
    fn name(&self) -> &str {
        STORE_NAME
    }

    async fn save(&self, key: &mut Key) -> Result<()> {
        let previous = self.shadow.lock_mode(key).await;
        self.shadow.save(key).await?;
        if previous == Some(LockMode::Exclusive) {
            return Ok(());
        }

        let id = Self::advisory_key(key.resource());
        if self.session.try_lock_exclusive(id).await? {
            if previous == Some(LockMode::Shared) {
                // Promotion: the stacked shared hold is no longer needed.
                self.session.unlock_shared(id).await?;
            }
            Ok(())
        } else {
            self.shadow.delete(key).await?;
            Err(LockError::conflict(key.resource()))
        }
    }

    async fn save_read(&self, key: &mut Key) -> Result<()> {
        let previous = self.shadow.lock_mode(key).await;
        self.shadow.save_read(key).await?;
        if previous == Some(LockMode::Shared) {
            return Ok(());
        }

        let id = Self::advisory_key(key.resource());
        if self.session.try_lock_shared(id).await? {
            if previous == Some(LockMode::Exclusive) {
                // Demotion: drop the stacked exclusive hold.
                self.session.unlock_exclusive(id).await?;
            }
            Ok(())
        } else {
            self.shadow.delete(key).await?;
            Err(LockError::conflict(key.resource()))
        }
    }

    async fn wait_and_save(&self, key: &mut Key) -> Result<()> {
        let previous = self.shadow.lock_mode(key).await;
        if previous == Some(LockMode::Exclusive) {
            return Ok(());
        }

        let id = Self::advisory_key(key.resource());
        self.session.lock_exclusive(id).await?;
        if let Err(e) = self.shadow.save(key).await {
            // Another key on this session won the shadow race.
            self.session.unlock_exclusive(id).await?;
            return Err(e);
        }
        if previous == Some(LockMode::Shared) {
            self.session.unlock_shared(id).await?;
        }
        Ok(())
    }

    async fn wait_and_save_read(&self, key: &mut Key) -> Result<()> {
        let previous = self.shadow.lock_mode(key).await;
        if previous == Some(LockMode::Shared) {
            return Ok(());
        }

        let id = Self::advisory_key(key.resource());
        self.session.lock_shared(id).await?;
        if let Err(e) = self.shadow.save_read(key).await {
            self.session.unlock_shared(id).await?;
            return Err(e);
        }
        if previous == Some(LockMode::Exclusive) {
            self.session.unlock_exclusive(id).await?;
        }
        Ok(())
    }

    async fn put_off_expiration(&self, _key: &mut Key, _ttl: Duration) -> Result<()> {
        // Session locks live until released; nothing to renew.
        Ok(())
    }

    async fn delete(&self, key: &mut Key) -> Result<()> {
        let Some(mode) = self.shadow.lock_mode(key).await else {
            return Ok(());
        };
        self.release_backend(key, mode).await?;
        self.shadow.delete(key).await
    }

    async fn exists(&self, key: &Key) -> Result<bool> {
        self.shadow.exists(key).await
    }
}

/// In-process advisory lock server, one instance per session.
///
/// [`MemoryAdvisory::sibling`] opens another session against the same
/// server, for exercising cross-session contention.
#[derive(Debug, Clone)]
pub struct MemoryAdvisory {
    session_id: String,
    server: Arc<AdvisoryState>,
}

#[derive(Debug, Default)]
struct AdvisoryState {
    entries: Mutex<HashMap<i64, AdvisoryEntry>>,
    released: Notify,
}

#[derive(Debug, Default)]
struct AdvisoryEntry {
    // session id -> stacked hold count
    exclusive: HashMap<String, u32>,
    shared: HashMap<String, u32>,
}

impl AdvisoryEntry {
    fn is_free(&self) -> bool {
        self.exclusive.is_empty() && self.shared.is_empty()
    }

    fn held_by_others(holds: &HashMap<String, u32>, session: &str) -> bool {
        holds.keys().any(|s| s != session)
    }
}

impl MemoryAdvisory {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self { session_id: session_id.into(), server: Arc::new(AdvisoryState::default()) }
    }

    /// Open a new session against the same server.
    pub fn sibling(&self, session_id: impl Into<String>) -> Self {
        Self { session_id: session_id.into(), server: Arc::clone(&self.server) }
    }

    fn try_lock(&self, key: i64, exclusive: bool) -> bool {
        let mut entries = self.server.entries.lock().expect("advisory server poisoned");
        let entry = entries.entry(key).or_default();

        // Locks never conflict within a session.
        let blocked = AdvisoryEntry::held_by_others(&entry.exclusive, &self.session_id)
            || (exclusive && AdvisoryEntry::held_by_others(&entry.shared, &self.session_id));
        if blocked {
            if entry.is_free() {
                entries.remove(&key);
            }
            return false;
        }

        let holds = if exclusive { &mut entry.exclusive } else { &mut entry.shared };
        *holds.entry(self.session_id.clone()).or_insert(0) += 1;
        true
    }

    fn unlock(&self, key: i64, exclusive: bool) -> bool {
        let mut entries = self.server.entries.lock().expect("advisory server poisoned");
        let Some(entry) = entries.get_mut(&key) else {
            return false;
        };
        let holds = if exclusive { &mut entry.exclusive } else { &mut entry.shared };
        let Some(count) = holds.get_mut(&self.session_id) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            holds.remove(&self.session_id);
        }
        if entry.is_free() {
            entries.remove(&key);
        }
        drop(entries);
        self.server.released.notify_waiters();
        true
    }
}

#[async_trait]
impl AdvisorySession for MemoryAdvisory {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn try_lock_exclusive(&self, key: i64) -> Result<bool> {
        Ok(self.try_lock(key, true))
    }

    async fn try_lock_shared(&self, key: i64) -> Result<bool> {
        Ok(self.try_lock(key, false))
    }

    async fn lock_exclusive(&self, key: i64) -> Result<()> {
        loop {
            let waiter = self.server.released.notified();
            if self.try_lock(key, true) {
                return Ok(());
            }
            waiter.await;
        }
    }

    async fn lock_shared(&self, key: i64) -> Result<()> {
        loop {
            let waiter = self.server.released.notified();
            if self.try_lock(key, false) {
                return Ok(());
            }
            waiter.await;
        }
    }

    async fn unlock_exclusive(&self, key: i64) -> Result<bool> {
        Ok(self.unlock(key, true))
    }

    async fn unlock_shared(&self, key: i64) -> Result<bool> {
        Ok(self.unlock(key, false))
    }
}
