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
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::{LockError, Result};
use crate::expiry::check_not_expired;
use crate::key::Key;
use crate::store::LockStore;
use crate::strategy::QuorumStrategy;

/// Replicates a lock across several stores and grants it when a quorum of
/// them took it.
///
/// Stores are driven in order: the key carries one ownership proof per
/// store, so each backend sees the same contender. When the quorum cannot
/// be reached the acquired replicas are rolled back before the conflict is
/// reported, so a failed attempt leaves nothing behind.
#[derive(Debug)]
pub struct CombinedStore {
    stores: Vec<Arc<dyn LockStore>>,
    strategy: Box<dyn QuorumStrategy>,
}

impl CombinedStore {
    /// A strategy that cannot be met even with every store succeeding
    /// would deadlock every acquisition, so it is rejected up front.
    pub fn new(stores: Vec<Arc<dyn LockStore>>, strategy: Box<dyn QuorumStrategy>) -> Result<Self> {
        if stores.is_empty() {
            return Err(LockError::configuration("combined store needs at least one store"));
        }
        if !strategy.is_met(stores.len(), stores.len()) {
            return Err(LockError::configuration(
                "quorum strategy cannot be met even when every store succeeds",
            ));
        }
        Ok(Self { stores, strategy })
    }

    /// Quorum verdict after an acquisition loop: report success, or roll
    /// back the replicas we did take so a failed attempt does not linger
    /// and starve other contenders.
    async fn settle(&self, key: &mut Key, success: usize, operation: &str) -> Result<()> {
        check_not_expired(self, key).await?;
        if self.strategy.is_met(success, self.stores.len()) {
            return Ok(());
        }
        if let Err(e) = self.delete(key).await {
            warn!(resource = %key.resource(), error = %e, operation, "rollback failed");
        }
        Err(LockError::conflict(key.resource()))
    }
}

#[async_trait]
impl LockStore for CombinedStore {
    fn name(&self) -> &str {
        "combined"
    }

    async fn save(&self, key: &mut Key) -> Result<()> {
        let total = self.stores.len();
        let mut success = 0;
        let mut failure = 0;

        for store in &self.stores {
            match store.save(key).await {
                Ok(()) => success += 1,
                Err(e) => {
                    warn!(store = %store.name(), resource = %key.resource(), error = %e,
                        "store failed during save");
                    failure += 1;
                }
            }
            if !self.strategy.can_be_met(failure, total) {
                break;
            }
        }

        self.settle(key, success, "save").await
    }

    async fn save_read(&self, key: &mut Key) -> Result<()> {
        let total = self.stores.len();
        let mut success = 0;
        let mut failure = 0;

        for store in &self.stores {
            match store.save_read(key).await {
                Ok(()) => success += 1,
                Err(e) => {
                    warn!(store = %store.name(), resource = %key.resource(), error = %e,
                        "store failed during save_read");
                    failure += 1;
                }
            }
            if !self.strategy.can_be_met(failure, total) {
                break;
            }
        }

        self.settle(key, success, "save_read").await
    }

    async fn put_off_expiration(&self, key: &mut Key, ttl: Duration) -> Result<()> {
        let total = self.stores.len();
        let mut success = 0;
        let mut failure = 0;
        let started = Instant::now();

        for store in &self.stores {
            // Time spent on earlier stores eats into the lease the later
            // ones may still grant.
            let remaining = ttl.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                key.reduce_lifetime(Duration::ZERO);
                break;
            }
            match store.put_off_expiration(key, remaining).await {
                Ok(()) => success += 1,
                Err(e) => {
                    warn!(store = %store.name(), resource = %key.resource(), error = %e,
                        "store failed during renewal");
                    failure += 1;
                }
            }
            if !self.strategy.can_be_met(failure, total) {
                break;
            }
        }

        self.settle(key, success, "put_off_expiration").await
    }

    async fn delete(&self, key: &mut Key) -> Result<()> {
        for store in &self.stores {
            if let Err(e) = store.delete(key).await {
                warn!(store = %store.name(), resource = %key.resource(), error = %e,
                    "store failed during delete");
            }
        }
        Ok(())
    }

    async fn exists(&self, key: &Key) -> Result<bool> {
        let total = self.stores.len();
        let mut success = 0;
        let mut failure = 0;

        for store in &self.stores {
            match store.exists(key).await {
                Ok(true) => success += 1,
                Ok(false) => failure += 1,
                Err(e) => {
                    warn!(store = %store.name(), resource = %key.resource(), error = %e,
                        "store failed during exists");
                    failure += 1;
                }
            }
            if self.strategy.is_met(success, total) {
                return Ok(true);
            }
            if !self.strategy.can_be_met(failure, total) {
                return Ok(false);
            }
        }
        Ok(false)
    }
}
