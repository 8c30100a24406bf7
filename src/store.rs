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
use std::time::Duration;

use crate::error::{LockError, Result};
use crate::key::Key;

/// Lock acquisition mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Exclusive lock (write lock)
    Exclusive,
    /// Shared lock (read lock)
    Shared,
}

/// Persisting store contract implemented by every backend adapter.
///
/// The required methods form the minimal exclusive-lock contract. Shared
/// locks and native blocking waits are capabilities: backends that support
/// them override the corresponding default methods, everything else answers
/// [`LockError::NotSupported`].
#[async_trait]
pub trait LockStore: Send + Sync + std::fmt::Debug {
    /// Store name used in structured log events.
    fn name(&self) -> &str;

    /// Attempt to acquire an exclusive lock for `key.resource()`.
    ///
    /// Atomic with respect to other concurrent callers against the same
    /// backend. Fails with [`LockError::Conflict`] when another valid token
    /// holds the resource, and with [`LockError::Expired`] when the key's
    /// lifetime budget ran out while the write was in flight.
    async fn save(&self, key: &mut Key) -> Result<()>;

    /// Attempt to acquire a shared (read) lock for `key.resource()`.
    ///
    /// Compatible with other shared holders, incompatible with an exclusive
    /// holder. Stores supporting it also honor promotion (shared to
    /// exclusive via [`LockStore::save`] while sole holder) and demotion.
    async fn save_read(&self, key: &mut Key) -> Result<()> {
        let _ = key;
        Err(LockError::not_supported(self.name(), "shared locks"))
    }

    /// Extend the lease, only if the caller's token still owns the record
    /// (or the record already expired and is free).
    ///
    /// A no-op for backends whose locks live until explicit release.
    async fn put_off_expiration(&self, key: &mut Key, ttl: Duration) -> Result<()>;

    /// Release the lock. Never removes another holder's record; idempotent.
    async fn delete(&self, key: &mut Key) -> Result<()>;

    /// Whether the caller's token currently owns a non-expired record.
    async fn exists(&self, key: &Key) -> Result<bool>;

    /// Block until an exclusive lock is acquired, using a backend-native
    /// blocking primitive.
    async fn wait_and_save(&self, key: &mut Key) -> Result<()> {
        let _ = key;
        Err(LockError::not_supported(self.name(), "blocking waits"))
    }

    /// Block until a shared lock is acquired.
    async fn wait_and_save_read(&self, key: &mut Key) -> Result<()> {
        let _ = key;
        Err(LockError::not_supported(self.name(), "blocking shared waits"))
    }
}
