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
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::{LockError, Result};
use crate::key::Key;
use crate::store::{LockMode, LockStore};

/// Decorator that turns any store's non-blocking `save` into a blocking
/// `wait_and_save` by polling.
///
/// Only [`LockError::Conflict`] is retried; every other error is a real
/// failure and propagates immediately. Sleeps are jittered by ±10% so
/// contenders knocked back at the same moment do not retry in lockstep.
#[derive(Debug)]
pub struct RetryTillSaveStore {
    inner: Arc<dyn LockStore>,
    retry_sleep: Duration,
    retry_count: usize,
    name: String,
}

impl RetryTillSaveStore {
    pub const DEFAULT_RETRY_SLEEP: Duration = Duration::from_millis(100);

    pub fn new(inner: Arc<dyn LockStore>) -> Self {
        Self::with_retry(inner, Self::DEFAULT_RETRY_SLEEP, usize::MAX)
    }

    pub fn with_retry(inner: Arc<dyn LockStore>, retry_sleep: Duration, retry_count: usize) -> Self {
        let name = format!("retry({})", inner.name());
        Self { inner, retry_sleep, retry_count, name }
    }

    fn jittered_sleep(&self) -> Duration {
        self.retry_sleep.mul_f64(rand::thread_rng().gen_range(0.9..=1.1))
    }

    async fn poll(&self, key: &mut Key, mode: LockMode) -> Result<()> {
        let mut retries = 0;
        loop {
            let attempt = match mode {
                LockMode::Exclusive => self.inner.save(key).await,
                LockMode::Shared => self.inner.save_read(key).await,
            };
            match attempt {
                Err(LockError::Conflict { .. }) => {}
                outcome => return outcome,
            }
            retries += 1;
            if retries >= self.retry_count {
                break;
            }
            tokio::time::sleep(self.jittered_sleep()).await;
        }
        warn!(resource = %key.resource(), retries, "giving up acquiring lock");
        Err(LockError::conflict(key.resource()))
    }
}

#[async_trait]
impl LockStore for RetryTillSaveStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save(&self, key: &mut Key) -> Result<()> {
        self.inner.save(key).await
    }

    async fn save_read(&self, key: &mut Key) -> Result<()> {
        self.inner.save_read(key).await
    }

    async fn wait_and_save(&self, key: &mut Key) -> Result<()> {
        self.poll(key, LockMode::Exclusive).await
    }

    async fn wait_and_save_read(&self, key: &mut Key) -> Result<()> {
        self.poll(key, LockMode::Shared).await
    }

    async fn put_off_expiration(&self, key: &mut Key, ttl: Duration) -> Result<()> {
        self.inner.put_off_expiration(key, ttl).await
    }

    async fn delete(&self, key: &mut Key) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &Key) -> Result<bool> {
        self.inner.exists(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::memory::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct CountingStore {
        inner: InMemoryStore,
        saves: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            Self { inner: InMemoryStore::new(), saves: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl LockStore for CountingStore {
        fn name(&self) -> &str {
            "counting"
        }

        async fn save(&self, key: &mut Key) -> Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save(key).await
        }

        async fn put_off_expiration(&self, key: &mut Key, ttl: Duration) -> Result<()> {
            self.inner.put_off_expiration(key, ttl).await
        }

        async fn delete(&self, key: &mut Key) -> Result<()> {
            self.inner.delete(key).await
        }

        async fn exists(&self, key: &Key) -> Result<bool> {
            self.inner.exists(key).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_and_save_retries_until_free() {
        let backend = Arc::new(InMemoryStore::new());
        let store = Arc::new(RetryTillSaveStore::new(
            Arc::clone(&backend) as Arc<dyn LockStore>
        ));

        let mut holder = Key::new("res");
        backend.save(&mut holder).await.unwrap();

        let waiter = Arc::clone(&store);
        let handle = tokio::spawn(async move {
            let mut key = Key::new("res");
            waiter.wait_and_save(&mut key).await.unwrap();
            waiter.exists(&key).await.unwrap()
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!handle.is_finished());

        backend.delete(&mut holder).await.unwrap();
        assert!(handle.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_retry_count() {
        let backend = Arc::new(CountingStore::new());
        let store = RetryTillSaveStore::with_retry(
            Arc::clone(&backend) as Arc<dyn LockStore>,
            Duration::from_millis(10),
            3,
        );

        let mut holder = Key::new("res");
        backend.save(&mut holder).await.unwrap();
        backend.saves.store(0, Ordering::SeqCst);

        let mut key = Key::new("res");
        assert!(matches!(
            store.wait_and_save(&mut key).await,
            Err(LockError::Conflict { .. })
        ));
        assert_eq!(backend.saves.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt() {
        /// Conflicts a fixed number of times, then grants the lock.
        #[derive(Debug)]
        struct Flaky {
            conflicts_left: AtomicUsize,
            attempts: AtomicUsize,
        }

        #[async_trait]
        impl LockStore for Flaky {
            fn name(&self) -> &str {
                "flaky"
            }
            async fn save(&self, key: &mut Key) -> Result<()> {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                if self
                    .conflicts_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(LockError::conflict(key.resource()));
                }
                Ok(())
            }
            async fn put_off_expiration(&self, _key: &mut Key, _ttl: Duration) -> Result<()> {
                Ok(())
            }
            async fn delete(&self, _key: &mut Key) -> Result<()> {
                Ok(())
            }
            async fn exists(&self, _key: &Key) -> Result<bool> {
                Ok(true)
            }
        }

        let flaky = Arc::new(Flaky { conflicts_left: AtomicUsize::new(2), attempts: AtomicUsize::new(0) });
        let store = RetryTillSaveStore::new(Arc::clone(&flaky) as Arc<dyn LockStore>);

        let mut key = Key::new("res");
        let started = tokio::time::Instant::now();
        store.wait_and_save(&mut key).await.unwrap();
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);

        // Exactly two sleeps between the three attempts, each jittered +-10%
        let elapsed = started.elapsed();
        assert!(elapsed >= RetryTillSaveStore::DEFAULT_RETRY_SLEEP.mul_f64(1.8));
        assert!(elapsed <= RetryTillSaveStore::DEFAULT_RETRY_SLEEP.mul_f64(2.2));
    }

    #[tokio::test]
    async fn test_non_conflict_errors_propagate_immediately() {
        #[derive(Debug)]
        struct Broken;

        #[async_trait]
        impl LockStore for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            async fn save(&self, _key: &mut Key) -> Result<()> {
                Err(LockError::backend("broken", "io error"))
            }
            async fn put_off_expiration(&self, _key: &mut Key, _ttl: Duration) -> Result<()> {
                Ok(())
            }
            async fn delete(&self, _key: &mut Key) -> Result<()> {
                Ok(())
            }
            async fn exists(&self, _key: &Key) -> Result<bool> {
                Ok(false)
            }
        }

        let store = RetryTillSaveStore::new(Arc::new(Broken));
        let mut key = Key::new("res");
        assert!(matches!(
            store.wait_and_save(&mut key).await,
            Err(LockError::Backend { .. })
        ));
    }

    #[tokio::test]
    async fn test_immediate_success_does_not_sleep() {
        let store = RetryTillSaveStore::new(Arc::new(InMemoryStore::new()));
        let mut key = Key::new("res");
        store.wait_and_save(&mut key).await.unwrap();
        assert!(store.exists(&key).await.unwrap());
        assert_eq!(store.name(), "retry(memory)");
    }
}
