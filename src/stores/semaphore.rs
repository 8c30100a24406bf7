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
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::error::{LockError, Result};
use crate::key::{Key, OwnershipProof};
use crate::store::LockStore;

const STORE_NAME: &str = "semaphore";

static REGISTRY_IDS: AtomicU64 = AtomicU64::new(0);

/// Shared map of single-permit semaphores, one per resource name.
///
/// Pass the same registry to every [`SemaphoreStore`] that should contend
/// for the same locks. Each registry gets a process-unique id so that keys
/// track their permits per registry rather than per store kind; a key held
/// through one registry is a stranger to every other.
#[derive(Debug)]
pub struct SemaphoreRegistry {
    id: u64,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Default for SemaphoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SemaphoreRegistry {
    pub fn new() -> Self {
        Self {
            id: REGISTRY_IDS.fetch_add(1, Ordering::Relaxed),
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    fn semaphore(&self, resource: &str) -> Arc<Semaphore> {
        let mut semaphores = self.semaphores.lock().expect("semaphore registry poisoned");
        Arc::clone(
            semaphores
                .entry(resource.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1))),
        )
    }
}

/// Lock store backed by single-permit semaphores.
///
/// The held permit is the proof of ownership; releasing the key drops the
/// permit and wakes the next waiter. Exclusive-only, no lease.
#[derive(Debug)]
pub struct SemaphoreStore {
    registry: Arc<SemaphoreRegistry>,
    scope: String,
}

impl SemaphoreStore {
    pub fn new(registry: Arc<SemaphoreRegistry>) -> Self {
        let scope = format!("semaphore:{}", registry.id);
        Self { registry, scope }
    }
}

#[async_trait]
impl LockStore for SemaphoreStore {
    fn name(&self) -> &str {
        STORE_NAME
    }

    async fn save(&self, key: &mut Key) -> Result<()> {
        if key.has_state(&self.scope) {
            return Ok(());
        }
        let semaphore = self.registry.semaphore(key.resource());
        match semaphore.try_acquire_owned() {
            Ok(permit) => {
                key.set_state(&self.scope, OwnershipProof::Permit(permit));
                Ok(())
            }
            Err(_) => Err(LockError::conflict(key.resource())),
        }
    }

    async fn wait_and_save(&self, key: &mut Key) -> Result<()> {
        if key.has_state(&self.scope) {
            return Ok(());
        }
        let semaphore = self.registry.semaphore(key.resource());
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|e| LockError::backend_with(STORE_NAME, "semaphore closed", e))?;
        key.set_state(&self.scope, OwnershipProof::Permit(permit));
        Ok(())
    }

    async fn put_off_expiration(&self, _key: &mut Key, _ttl: Duration) -> Result<()> {
        // Permits do not expire.
        Ok(())
    }

    async fn delete(&self, key: &mut Key) -> Result<()> {
        key.remove_state(&self.scope);
        Ok(())
    }

    async fn exists(&self, key: &Key) -> Result<bool> {
        Ok(key.has_state(&self.scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_permit_per_resource() {
        let registry = Arc::new(SemaphoreRegistry::new());
        let store = SemaphoreStore::new(Arc::clone(&registry));
        let mut holder = Key::new("res");
        let mut contender = Key::new("res");

        store.save(&mut holder).await.unwrap();
        assert!(matches!(
            store.save(&mut contender).await,
            Err(LockError::Conflict { .. })
        ));

        store.delete(&mut holder).await.unwrap();
        store.save(&mut contender).await.unwrap();
    }

    #[tokio::test]
    async fn test_save_is_reentrant() {
        let registry = Arc::new(SemaphoreRegistry::new());
        let store = SemaphoreStore::new(registry);
        let mut key = Key::new("res");
        store.save(&mut key).await.unwrap();
        store.save(&mut key).await.unwrap();
        assert!(store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_stores_share_registry() {
        let registry = Arc::new(SemaphoreRegistry::new());
        let first = SemaphoreStore::new(Arc::clone(&registry));
        let second = SemaphoreStore::new(registry);
        let mut holder = Key::new("res");
        let mut contender = Key::new("res");

        first.save(&mut holder).await.unwrap();
        assert!(matches!(
            second.save(&mut contender).await,
            Err(LockError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_registries_do_not_share_key_state() {
        let store_a = SemaphoreStore::new(Arc::new(SemaphoreRegistry::new()));
        let store_b = SemaphoreStore::new(Arc::new(SemaphoreRegistry::new()));
        let mut key = Key::new("res");

        // Holding through one registry must not short-circuit the other:
        // save on store_b takes store_b's permit for real.
        store_a.save(&mut key).await.unwrap();
        store_b.save(&mut key).await.unwrap();
        assert!(store_a.exists(&key).await.unwrap());
        assert!(store_b.exists(&key).await.unwrap());

        let mut contender = Key::new("res");
        assert!(matches!(
            store_b.save(&mut contender).await,
            Err(LockError::Conflict { .. })
        ));

        // Releasing on one registry leaves the other held
        store_b.delete(&mut key).await.unwrap();
        assert!(!store_b.exists(&key).await.unwrap());
        assert!(store_a.exists(&key).await.unwrap());
        store_b.save(&mut contender).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_and_save_blocks_until_release() {
        let registry = Arc::new(SemaphoreRegistry::new());
        let store = Arc::new(SemaphoreStore::new(registry));
        let mut holder = Key::new("res");
        store.save(&mut holder).await.unwrap();

        let waiter = Arc::clone(&store);
        let handle = tokio::spawn(async move {
            let mut key = Key::new("res");
            waiter.wait_and_save(&mut key).await.unwrap();
            waiter.exists(&key).await.unwrap()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        store.delete(&mut holder).await.unwrap();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_shared_locks_not_supported() {
        let registry = Arc::new(SemaphoreRegistry::new());
        let store = SemaphoreStore::new(registry);
        let mut key = Key::new("res");
        assert!(matches!(
            store.save_read(&mut key).await,
            Err(LockError::NotSupported { .. })
        ));
    }
}
