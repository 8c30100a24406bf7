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

use once_cell::sync::Lazy;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{LockError, Result};
use crate::key::Key;
use crate::store::LockStore;

/// Pause between polls when a blocking acquisition falls back to
/// non-blocking saves.
const POLL_SLEEP: Duration = Duration::from_millis(100);

struct ReleaseJob {
    store: Arc<dyn LockStore>,
    key: Key,
}

/// Queue draining lock releases from `Drop` impls, which cannot await.
///
/// A dedicated thread with its own single-threaded runtime owns the
/// receiving end, so releases go through even when the dropping thread has
/// no runtime at all.
static RELEASE_QUEUE: Lazy<mpsc::Sender<ReleaseJob>> = Lazy::new(|| {
    let (tx, mut rx) = mpsc::channel::<ReleaseJob>(1024);
    std::thread::Builder::new()
        .name("lockstore-release".to_string())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .expect("failed to build release runtime");
            rt.block_on(async move {
                while let Some(ReleaseJob { store, mut key }) = rx.recv().await {
                    if let Err(e) = store.delete(&mut key).await {
                        warn!(resource = %key.resource(), store = %store.name(), error = %e,
                            "auto-release failed");
                    } else {
                        debug!(resource = %key.resource(), "auto-released lock");
                    }
                }
            });
        })
        .expect("failed to spawn release thread");
    tx
});

fn release_in_background(store: Arc<dyn LockStore>, key: Key) {
    if let Err(e) = RELEASE_QUEUE.try_send(ReleaseJob { store, key }) {
        // Queue full or torn down; release on a throwaway thread instead
        // of silently leaking the lock.
        let ReleaseJob { store, mut key } = match e {
            mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => job,
        };
        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread().enable_time().build();
            match rt {
                Ok(rt) => rt.block_on(async move {
                    if let Err(e) = store.delete(&mut key).await {
                        warn!(resource = %key.resource(), error = %e, "auto-release failed");
                    }
                }),
                Err(e) => warn!(error = %e, "auto-release runtime unavailable"),
            }
        });
    }
}

/// A lock over one resource, bound to one store.
///
/// The lock remembers whether it ever took its resource (`dirty`) and, when
/// `auto_release` is on, releases it when dropped. Acquisition with a ttl
/// immediately refreshes, so the caller gets the full lease from the moment
/// `acquire` returns rather than from when the first store answered.
#[derive(Debug)]
pub struct Lock {
    key: Key,
    store: Arc<dyn LockStore>,
    ttl: Option<Duration>,
    auto_release: bool,
    dirty: bool,
}

impl Lock {
    pub fn new(key: Key, store: Arc<dyn LockStore>, ttl: Option<Duration>, auto_release: bool) -> Self {
        Self { key, store, ttl, auto_release, dirty: false }
    }

    pub fn resource(&self) -> &str {
        self.key.resource()
    }

    /// Try to take the lock exclusively. Non-blocking mode reports a held
    /// lock as `Ok(false)`; blocking mode waits for it.
    ///
    /// Stores without native waiting are polled with non-blocking saves.
    pub async fn acquire(&mut self, blocking: bool) -> Result<bool> {
        let acquired = if blocking {
            match self.store.wait_and_save(&mut self.key).await {
                Err(LockError::NotSupported { .. }) => {
                    self.poll_save(false).await?;
                    Ok(())
                }
                outcome => outcome,
            }
        } else {
            self.store.save(&mut self.key).await
        };

        match acquired {
            Ok(()) => {}
            Err(LockError::Conflict { .. }) if !blocking => {
                self.dirty = false;
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
        self.dirty = true;
        self.after_acquire().await?;
        Ok(true)
    }

    /// Take the lock in shared mode. Stores without shared locks degrade
    /// to an exclusive acquisition, which is correct (it still excludes
    /// writers) just stricter than asked.
    pub async fn acquire_read(&mut self, blocking: bool) -> Result<bool> {
        let acquired = if blocking {
            match self.store.wait_and_save_read(&mut self.key).await {
                Err(LockError::NotSupported { .. }) => {
                    match self.store.wait_and_save(&mut self.key).await {
                        Err(LockError::NotSupported { .. }) => {
                            self.poll_save(true).await?;
                            Ok(())
                        }
                        outcome => outcome,
                    }
                }
                outcome => outcome,
            }
        } else {
            match self.store.save_read(&mut self.key).await {
                Err(LockError::NotSupported { .. }) => self.store.save(&mut self.key).await,
                outcome => outcome,
            }
        };

        match acquired {
            Ok(()) => {}
            Err(LockError::Conflict { .. }) if !blocking => {
                self.dirty = false;
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
        self.dirty = true;
        self.after_acquire().await?;
        Ok(true)
    }

    async fn poll_save(&mut self, shared: bool) -> Result<()> {
        loop {
            let attempt = if shared {
                match self.store.save_read(&mut self.key).await {
                    Err(LockError::NotSupported { .. }) => self.store.save(&mut self.key).await,
                    outcome => outcome,
                }
            } else {
                self.store.save(&mut self.key).await
            };
            match attempt {
                Ok(()) => return Ok(()),
                Err(LockError::Conflict { .. }) => {
                    let jitter = rand::thread_rng().gen_range(0.9..=1.1);
                    tokio::time::sleep(POLL_SLEEP.mul_f64(jitter)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn after_acquire(&mut self) -> Result<()> {
        if self.ttl.is_some() {
            self.refresh(None).await?;
        }
        if self.key.is_expired() {
            if let Err(e) = self.release().await {
                debug!(resource = %self.key.resource(), error = %e,
                    "releasing an already expired lock failed");
            }
            return Err(LockError::expired(self.key.resource()));
        }
        Ok(())
    }

    /// Push the lease `ttl` (or the lock's configured ttl) ahead of now.
    pub async fn refresh(&mut self, ttl: Option<Duration>) -> Result<()> {
        let Some(ttl) = ttl.or(self.ttl) else {
            return Err(LockError::configuration(format!(
                "lock on {:?} has no ttl to refresh with",
                self.key.resource()
            )));
        };

        self.key.reset_lifetime();
        match self.store.put_off_expiration(&mut self.key, ttl).await {
            Ok(()) => {
                self.dirty = true;
            }
            Err(e) => {
                if matches!(e, LockError::Conflict { .. } | LockError::Expired { .. }) {
                    self.dirty = false;
                }
                return Err(e);
            }
        }
        if self.key.is_expired() {
            self.dirty = false;
            return Err(LockError::expired(self.key.resource()));
        }
        debug!(resource = %self.key.resource(), ttl = ?ttl, "lock refreshed");
        Ok(())
    }

    /// Whether this lock still holds its resource, verified against the
    /// store.
    pub async fn is_acquired(&mut self) -> Result<bool> {
        self.dirty = self.store.exists(&self.key).await?;
        Ok(self.dirty)
    }

    /// Whether the lease has run out locally. A `false` here is not proof
    /// of ownership; use [`Lock::is_acquired`] for that.
    pub fn is_expired(&self) -> bool {
        self.key.is_expired()
    }

    /// Time left on the lease, `None` when the lock has no expiry.
    pub fn remaining_lifetime(&self) -> Option<Duration> {
        self.key.remaining_lifetime()
    }

    /// Release the lock and verify the store let go of it.
    pub async fn release(&mut self) -> Result<()> {
        self.dirty = false;
        self.store.delete(&mut self.key).await?;
        if self.store.exists(&self.key).await? {
            return Err(LockError::releasing(self.key.resource()));
        }
        debug!(resource = %self.key.resource(), "lock released");
        Ok(())
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if !self.auto_release || !self.dirty {
            return;
        }
        let key = std::mem::replace(&mut self.key, Key::new(""));
        release_in_background(Arc::clone(&self.store), key);
    }
}

/// Creates locks bound to one store.
#[derive(Debug, Clone)]
pub struct LockFactory {
    store: Arc<dyn LockStore>,
}

impl LockFactory {
    /// Default lease granted by [`LockFactory::create_lock`].
    pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    /// An auto-releasing lock with the default lease.
    pub fn create_lock(&self, resource: impl Into<String>) -> Lock {
        self.create_lock_with(resource, Some(Self::DEFAULT_TTL), true)
    }

    pub fn create_lock_with(
        &self,
        resource: impl Into<String>,
        ttl: Option<Duration>,
        auto_release: bool,
    ) -> Lock {
        Lock::new(Key::new(resource), Arc::clone(&self.store), ttl, auto_release)
    }

    /// Bind an existing key, for flows that re-attach to a lock they
    /// serialized the resource name of.
    pub fn create_lock_from_key(&self, key: Key, ttl: Option<Duration>, auto_release: bool) -> Lock {
        Lock::new(key, Arc::clone(&self.store), ttl, auto_release)
    }
}
