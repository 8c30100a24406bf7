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

use crate::error::{LockError, Result};
use crate::key::Key;
use crate::store::LockStore;

/// Fail with [`LockError::Expired`] when `key`'s lifetime budget ran out.
///
/// Must run *after* the backend write: a write that took longer than the
/// lease it was buying leaves the caller without any exclusivity guarantee
/// even though the write itself succeeded. The just-written record is
/// removed best-effort before failing; a secondary delete failure is logged
/// and swallowed, the expiry error wins.
pub(crate) async fn check_not_expired<S: LockStore + ?Sized>(store: &S, key: &mut Key) -> Result<()> {
    if !key.is_expired() {
        return Ok(());
    }

    if let Err(err) = store.delete(key).await {
        tracing::debug!(
            resource = %key.resource(),
            store = store.name(),
            error = %err,
            "cleanup of expired lock failed"
        );
    }

    Err(LockError::expired(key.resource()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::memory::InMemoryStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fresh_key_passes() {
        let store = InMemoryStore::new();
        let mut key = Key::new("res");
        key.reduce_lifetime(Duration::from_secs(300));
        assert!(check_not_expired(&store, &mut key).await.is_ok());
    }

    #[tokio::test]
    async fn test_exhausted_key_fails_and_releases() {
        let store = InMemoryStore::new();
        let mut key = Key::new("res");
        store.save(&mut key).await.unwrap();
        assert!(store.exists(&key).await.unwrap());

        key.reduce_lifetime(Duration::ZERO);
        let err = check_not_expired(&store, &mut key).await.unwrap_err();
        assert!(matches!(err, LockError::Expired { .. }));
        assert!(!store.exists(&key).await.unwrap());
    }
}
