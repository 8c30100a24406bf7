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
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::{LockError, Result};
use crate::key::Key;
use crate::store::{LockMode, LockStore};

/// State scope shared by all in-memory stores; the maps themselves are
/// per-instance, so one token per key is enough.
const SCOPE: &str = "memory";

/// One lock entry: current exclusive holder and current shared holders,
/// identified by token rather than by process/owner identity.
#[derive(Debug, Default)]
struct Entry {
    writer: Option<String>,
    readers: HashSet<String>,
}

impl Entry {
    fn is_free(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }
}

/// Process-local lock store.
///
/// Locks have no lease: they are held until released or until the process
/// exits, so [`LockStore::put_off_expiration`] is a no-op. Supports shared
/// locks, promotion (sole shared holder to exclusive) and demotion.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The mode in which `key` currently holds its resource, if any.
    pub async fn lock_mode(&self, key: &Key) -> Option<LockMode> {
        let token = key.token(SCOPE)?;
        let entries = self.entries.read().await;
        let entry = entries.get(key.resource())?;
        if entry.writer.as_deref() == Some(token) {
            Some(LockMode::Exclusive)
        } else if entry.readers.contains(token) {
            Some(LockMode::Shared)
        } else {
            None
        }
    }
}

#[async_trait]
impl LockStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn save(&self, key: &mut Key) -> Result<()> {
        let token = key.unique_token(SCOPE);
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.resource().to_string()).or_default();

        if entry.writer.as_deref() == Some(token.as_str()) {
            return Ok(());
        }

        let sole_shared_holder = entry.readers.len() == 1 && entry.readers.contains(&token);
        if entry.writer.is_none() && (entry.readers.is_empty() || sole_shared_holder) {
            // Promotion drops the shared slot in the same critical section,
            // so no other key can observe an unlocked intermediate state.
            entry.readers.remove(&token);
            entry.writer = Some(token);
            return Ok(());
        }

        Err(LockError::conflict(key.resource()))
    }

    async fn save_read(&self, key: &mut Key) -> Result<()> {
        let token = key.unique_token(SCOPE);
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.resource().to_string()).or_default();

        match entry.writer.as_deref() {
            Some(writer) if writer == token => {
                // Demotion: the sole exclusive holder steps down to shared.
                entry.writer = None;
                entry.readers.insert(token);
                Ok(())
            }
            Some(_) => Err(LockError::conflict(key.resource())),
            None => {
                entry.readers.insert(token);
                Ok(())
            }
        }
    }

    async fn put_off_expiration(&self, _key: &mut Key, _ttl: Duration) -> Result<()> {
        // Process-local locks carry no lease.
        Ok(())
    }

    async fn delete(&self, key: &mut Key) -> Result<()> {
        let Some(token) = key.token(SCOPE).map(str::to_string) else {
            return Ok(());
        };

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key.resource()) {
            if entry.writer.as_deref() == Some(token.as_str()) {
                entry.writer = None;
            }
            entry.readers.remove(&token);
            if entry.is_free() {
                entries.remove(key.resource());
            }
        }
        Ok(())
    }

    async fn exists(&self, key: &Key) -> Result<bool> {
        let Some(token) = key.token(SCOPE) else {
            return Ok(false);
        };
        let entries = self.entries.read().await;
        Ok(entries
            .get(key.resource())
            .map(|entry| entry.writer.as_deref() == Some(token) || entry.readers.contains(token))
            .unwrap_or(false))
    }
}
