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
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{LockError, Result};
use crate::key::{Key, OwnershipProof};
use crate::store::LockStore;

const STORE_NAME: &str = "flock";

/// Advisory file locks, one lock file per resource.
///
/// Ownership is the open file handle itself: dropping the handle releases
/// the lock, so locks never outlive the process. The lock files are left on
/// disk after release; unlinking them would race with concurrent openers.
#[derive(Debug)]
pub struct FlockStore {
    dir: PathBuf,
    scope: String,
}

impl FlockStore {
    /// Create a store placing its lock files under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let scope = format!("flock:{}", dir.display());
        Self { dir, scope }
    }

    fn lock_path(&self, resource: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(resource.as_bytes()));
        let mut readable: String = resource
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '-' })
            .collect();
        readable.truncate(50);
        self.dir.join(format!("{readable}-{digest}.lock"))
    }

    fn open(&self, resource: &str) -> Result<File> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| LockError::backend_with(STORE_NAME, "failed to create lock directory", e))?;
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.lock_path(resource))
            .map_err(|e| LockError::backend_with(STORE_NAME, "failed to open lock file", e))
    }

    /// Reuse the handle already held by `key`, or open a fresh one. Reusing
    /// the handle is what turns a second acquisition into a lock conversion.
    /// The fresh handle is not recorded yet; key state only changes once the
    /// lock call succeeds, so a failed conversion leaves the held mode intact.
    fn handle_for(&self, key: &Key) -> Result<(Arc<File>, bool)> {
        if let Some(OwnershipProof::File(file)) = key.state(&self.scope) {
            return Ok((Arc::clone(file), false));
        }
        Ok((Arc::new(self.open(key.resource())?), true))
    }

    fn try_lock(&self, key: &mut Key, exclusive: bool) -> Result<()> {
        let (file, fresh) = self.handle_for(key)?;
        // Called through the trait: std's own `File::try_lock_shared` has a
        // different return type and would shadow these.
        let attempt = if exclusive {
            FileExt::try_lock_exclusive(&*file)
        } else {
            FileExt::try_lock_shared(&*file)
        };
        match attempt {
            Ok(()) => {
                if fresh {
                    key.set_state(&self.scope, OwnershipProof::File(file));
                }
                Ok(())
            }
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(LockError::conflict(key.resource()))
            }
            Err(e) => Err(LockError::backend_with(STORE_NAME, "flock failed", e)),
        }
    }

    async fn blocking_lock(&self, key: &mut Key, exclusive: bool) -> Result<()> {
        let (file, fresh) = self.handle_for(key)?;
        let worker = Arc::clone(&file);
        let outcome = tokio::task::spawn_blocking(move || {
            if exclusive {
                FileExt::lock_exclusive(&*worker)
            } else {
                FileExt::lock_shared(&*worker)
            }
        })
        .await
        .map_err(|e| LockError::backend_with(STORE_NAME, "blocking lock task failed", e))?;

        outcome.map_err(|e| LockError::backend_with(STORE_NAME, "flock failed", e))?;
        if fresh {
            key.set_state(&self.scope, OwnershipProof::File(file));
        }
        Ok(())
    }
}

#[async_trait]
impl LockStore for FlockStore {
    fn name(&self) -> &str {
        STORE_NAME
    }

    async fn save(&self, key: &mut Key) -> Result<()> {
        self.try_lock(key, true)
    }

    async fn save_read(&self, key: &mut Key) -> Result<()> {
        self.try_lock(key, false)
    }

    async fn wait_and_save(&self, key: &mut Key) -> Result<()> {
        self.blocking_lock(key, true).await
    }

    async fn wait_and_save_read(&self, key: &mut Key) -> Result<()> {
        self.blocking_lock(key, false).await
    }

    async fn put_off_expiration(&self, _key: &mut Key, _ttl: Duration) -> Result<()> {
        // File locks do not expire while the handle is open.
        Ok(())
    }

    async fn delete(&self, key: &mut Key) -> Result<()> {
        if key.remove_state(&self.scope).is_some() {
            debug!(resource = %key.resource(), "released file lock");
        }
        Ok(())
    }

    async fn exists(&self, key: &Key) -> Result<bool> {
        Ok(matches!(key.state(&self.scope), Some(OwnershipProof::File(_))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_excludes_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlockStore::new(dir.path());
        let mut holder = Key::new("res");
        let mut contender = Key::new("res");

        store.save(&mut holder).await.unwrap();
        assert!(store.exists(&holder).await.unwrap());
        assert!(matches!(
            store.save(&mut contender).await,
            Err(LockError::Conflict { .. })
        ));

        store.delete(&mut holder).await.unwrap();
        assert!(!store.exists(&holder).await.unwrap());
        store.save(&mut contender).await.unwrap();
    }

    #[tokio::test]
    async fn test_shared_holders_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlockStore::new(dir.path());
        let mut a = Key::new("res");
        let mut b = Key::new("res");

        store.save_read(&mut a).await.unwrap();
        store.save_read(&mut b).await.unwrap();

        let mut writer = Key::new("res");
        assert!(matches!(
            store.save(&mut writer).await,
            Err(LockError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_conversion_on_same_handle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlockStore::new(dir.path());
        let mut key = Key::new("res");

        store.save(&mut key).await.unwrap();
        store.save_read(&mut key).await.unwrap();

        // Demoted to shared: another shared holder may join
        let mut reader = Key::new("res");
        store.save_read(&mut reader).await.unwrap();
        store.delete(&mut reader).await.unwrap();

        store.save(&mut key).await.unwrap();
        let mut contender = Key::new("res");
        assert!(matches!(
            store.save_read(&mut contender).await,
            Err(LockError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_promotion_keeps_shared_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlockStore::new(dir.path());
        let mut a = Key::new("res");
        let mut b = Key::new("res");

        store.save_read(&mut a).await.unwrap();
        store.save_read(&mut b).await.unwrap();

        // Promotion fails while b also reads, but a keeps its shared hold
        assert!(matches!(
            store.save(&mut a).await,
            Err(LockError::Conflict { .. })
        ));
        assert!(store.exists(&a).await.unwrap());

        // With a still reading, no writer may enter even after b leaves
        store.delete(&mut b).await.unwrap();
        let mut writer = Key::new("res");
        assert!(matches!(
            store.save(&mut writer).await,
            Err(LockError::Conflict { .. })
        ));

        store.delete(&mut a).await.unwrap();
        store.save(&mut writer).await.unwrap();
    }

    #[tokio::test]
    async fn test_resources_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlockStore::new(dir.path());
        let mut a = Key::new("alpha");
        let mut b = Key::new("beta");

        store.save(&mut a).await.unwrap();
        store.save(&mut b).await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_file_name_is_stable_and_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlockStore::new(dir.path());
        let path = store.lock_path("orders/42: update");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("orders-42--update-"));
        assert!(name.ends_with(".lock"));
        assert_eq!(path, store.lock_path("orders/42: update"));
    }

    #[tokio::test]
    async fn test_delete_without_acquisition_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlockStore::new(dir.path());
        let mut key = Key::new("res");
        store.delete(&mut key).await.unwrap();
        assert!(!store.exists(&key).await.unwrap());
    }
}
