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
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{LockError, Result};
use crate::expiry::check_not_expired;
use crate::key::Key;
use crate::store::LockStore;

/// Result of a conditional row insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The row was created (or an expired row was replaced).
    Inserted,
    /// A live row for this id already exists.
    AlreadyExists,
}

/// Relational backend holding one row per lock.
///
/// Implementations map these calls onto single SQL statements so that each
/// one is atomic under the database's default isolation. `insert` must fail
/// with [`LockError::MissingTable`] when the lock table does not exist, so
/// the store can create it on first use.
#[async_trait]
pub trait LockDatabase: Send + Sync + std::fmt::Debug {
    /// Backend identifier used in store names and error messages.
    fn name(&self) -> &str;

    /// Whether a transaction is open on this connection. Schema changes are
    /// skipped while one is, since they would implicitly commit it on most
    /// engines.
    fn in_transaction(&self) -> bool {
        false
    }

    /// Insert `id -> token` expiring after `ttl`. An expired row counts as
    /// absent and is replaced.
    async fn insert(&self, id: &str, token: &str, ttl: Duration) -> Result<InsertOutcome>;

    /// Push the row's expiration `ttl` ahead of now, only where the row
    /// holds `token` or has expired. Returns whether a row was updated.
    async fn update_expiration(&self, id: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Whether a live row for `id` holds `token`.
    async fn is_owned(&self, id: &str, token: &str) -> Result<bool>;

    /// Delete the row for `id`, only where it holds `token`.
    async fn delete_row(&self, id: &str, token: &str) -> Result<()>;

    /// Delete every expired row.
    async fn prune(&self) -> Result<()>;

    /// Create the lock table.
    async fn create_table(&self) -> Result<()>;
}

/// Expiring lock store on top of a [`LockDatabase`].
///
/// Rows are keyed by the sha256 of the resource name, so resource names of
/// any length and charset fit a fixed-width indexed column. Expired rows
/// are reclaimed opportunistically: each `save` prunes with probability
/// `gc_probability`.
#[derive(Debug)]
pub struct DatabaseStore {
    db: Arc<dyn LockDatabase>,
    initial_ttl: Duration,
    gc_probability: f64,
    scope: String,
}

impl DatabaseStore {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
    pub const DEFAULT_GC_PROBABILITY: f64 = 0.01;

    pub fn new(db: Arc<dyn LockDatabase>) -> Self {
        let scope = format!("database:{}", db.name());
        Self {
            db,
            initial_ttl: Self::DEFAULT_TTL,
            gc_probability: Self::DEFAULT_GC_PROBABILITY,
            scope,
        }
    }

    /// `initial_ttl` must be at least one second: the expiration column has
    /// second precision. `gc_probability` must lie in `0.0..=1.0`.
    pub fn with_options(
        db: Arc<dyn LockDatabase>,
        initial_ttl: Duration,
        gc_probability: f64,
    ) -> Result<Self> {
        if initial_ttl < Duration::from_secs(1) {
            return Err(LockError::invalid_ttl(initial_ttl));
        }
        if !(0.0..=1.0).contains(&gc_probability) {
            return Err(LockError::configuration(format!(
                "gc_probability must be between 0 and 1, got {gc_probability}"
            )));
        }
        let mut store = Self::new(db);
        store.initial_ttl = initial_ttl;
        store.gc_probability = gc_probability;
        Ok(store)
    }

    fn id(&self, resource: &str) -> String {
        hex::encode(Sha256::digest(resource.as_bytes()))
    }

    async fn insert_creating_table(
        &self,
        id: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<InsertOutcome> {
        match self.db.insert(id, token, ttl).await {
            Err(LockError::MissingTable { table }) if !self.db.in_transaction() => {
                debug!(table = %table, store = %self.db.name(), "lock table missing, creating it");
                self.db.create_table().await?;
                self.db.insert(id, token, ttl).await
            }
            outcome => outcome,
        }
    }

    async fn maybe_prune(&self) {
        if rand::thread_rng().gen::<f64>() >= self.gc_probability {
            return;
        }
        if let Err(e) = self.db.prune().await {
            warn!(store = %self.db.name(), error = %e, "pruning expired locks failed");
        }
    }
}

#[async_trait]
impl LockStore for DatabaseStore {
    fn name(&self) -> &str {
        self.db.name()
    }

    async fn save(&self, key: &mut Key) -> Result<()> {
        key.reduce_lifetime(self.initial_ttl);
        let id = self.id(key.resource());
        let token = key.unique_token(&self.scope);

        match self.insert_creating_table(&id, &token, self.initial_ttl).await? {
            InsertOutcome::Inserted => {}
            InsertOutcome::AlreadyExists => {
                // Either we already hold the row or someone else does; the
                // conditional update settles which.
                self.put_off_expiration(key, self.initial_ttl).await?;
            }
        }

        self.maybe_prune().await;
        check_not_expired(self, key).await
    }

    async fn put_off_expiration(&self, key: &mut Key, ttl: Duration) -> Result<()> {
        if ttl < Duration::from_secs(1) {
            return Err(LockError::invalid_ttl(ttl));
        }

        key.reduce_lifetime(ttl);
        let id = self.id(key.resource());
        let token = key.unique_token(&self.scope);

        if !self.db.update_expiration(&id, &token, ttl).await?
            && !self.db.is_owned(&id, &token).await?
        {
            return Err(LockError::conflict(key.resource()));
        }
        check_not_expired(self, key).await
    }

    async fn delete(&self, key: &mut Key) -> Result<()> {
        let id = self.id(key.resource());
        let token = key.unique_token(&self.scope);
        self.db.delete_row(&id, &token).await
    }

    async fn exists(&self, key: &Key) -> Result<bool> {
        let Some(token) = key.token(&self.scope) else {
            return Ok(false);
        };
        self.db.is_owned(&self.id(key.resource()), token).await
    }
}

/// In-process [`LockDatabase`] with a manually advanceable clock.
///
/// Starts without its table, exercising the create-on-first-use path.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    rows: Mutex<Option<HashMap<String, Row>>>,
    skew: Mutex<Duration>,
    in_transaction: bool,
}

#[derive(Debug)]
struct Row {
    token: String,
    expires_at: Instant,
}

impl MemoryDatabase {
    const TABLE: &'static str = "lock_keys";

    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a connection with an open transaction.
    pub fn in_transaction() -> Self {
        Self { in_transaction: true, ..Self::default() }
    }

    /// Shift the database's notion of "now" forward.
    pub fn advance(&self, by: Duration) {
        *self.skew.lock().expect("db clock poisoned") += by;
    }

    fn now(&self) -> Instant {
        Instant::now() + *self.skew.lock().expect("db clock poisoned")
    }
}

#[async_trait]
impl LockDatabase for MemoryDatabase {
    fn name(&self) -> &str {
        "memory-db"
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn insert(&self, id: &str, token: &str, ttl: Duration) -> Result<InsertOutcome> {
        let now = self.now();
        let mut rows = self.rows.lock().expect("db poisoned");
        let Some(table) = rows.as_mut() else {
            return Err(LockError::missing_table(Self::TABLE));
        };
        match table.get(id) {
            Some(row) if row.expires_at > now => Ok(InsertOutcome::AlreadyExists),
            _ => {
                table.insert(id.to_string(), Row { token: token.to_string(), expires_at: now + ttl });
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn update_expiration(&self, id: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = self.now();
        let mut rows = self.rows.lock().expect("db poisoned");
        let Some(table) = rows.as_mut() else {
            return Err(LockError::missing_table(Self::TABLE));
        };
        match table.get_mut(id) {
            Some(row) if row.token == token || row.expires_at <= now => {
                row.token = token.to_string();
                row.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_owned(&self, id: &str, token: &str) -> Result<bool> {
        let now = self.now();
        let rows = self.rows.lock().expect("db poisoned");
        Ok(rows
            .as_ref()
            .and_then(|table| table.get(id))
            .map(|row| row.token == token && row.expires_at > now)
            .unwrap_or(false))
    }

    async fn delete_row(&self, id: &str, token: &str) -> Result<()> {
        let mut rows = self.rows.lock().expect("db poisoned");
        if let Some(table) = rows.as_mut() {
            if table.get(id).is_some_and(|row| row.token == token) {
                table.remove(id);
            }
        }
        Ok(())
    }

    async fn prune(&self) -> Result<()> {
        let now = self.now();
        let mut rows = self.rows.lock().expect("db poisoned");
        if let Some(table) = rows.as_mut() {
            table.retain(|_, row| row.expires_at > now);
        }
        Ok(())
    }

    async fn create_table(&self) -> Result<()> {
        let mut rows = self.rows.lock().expect("db poisoned");
        rows.get_or_insert_with(HashMap::new);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (Arc<MemoryDatabase>, DatabaseStore) {
        let db = Arc::new(MemoryDatabase::new());
        let store = DatabaseStore::new(Arc::clone(&db) as Arc<dyn LockDatabase>);
        (db, store)
    }

    #[tokio::test]
    async fn test_table_created_on_first_save() {
        let (_db, store) = store();
        let mut key = Key::new("res");
        store.save(&mut key).await.unwrap();
        assert!(store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_table_surfaces_inside_transaction() {
        let store = DatabaseStore::new(Arc::new(MemoryDatabase::in_transaction()));
        let mut key = Key::new("res");
        assert!(matches!(
            store.save(&mut key).await,
            Err(LockError::MissingTable { .. })
        ));
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let (_db, store) = store();
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
        let (_db, store) = store();
        let mut key = Key::new("res");
        store.save(&mut key).await.unwrap();
        key.reset_lifetime();
        store.save(&mut key).await.unwrap();
        assert!(store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_row_is_replaced() {
        let (db, store) = store();
        let mut old = Key::new("res");
        store.save(&mut old).await.unwrap();

        db.advance(Duration::from_secs(301));
        assert!(!store.exists(&old).await.unwrap());

        let mut new = Key::new("res");
        store.save(&mut new).await.unwrap();

        old.reset_lifetime();
        assert!(matches!(
            store.put_off_expiration(&mut old, Duration::from_secs(60)).await,
            Err(LockError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_renewal_extends_expiration() {
        let (db, store) = store();
        let mut key = Key::new("res");
        store.save(&mut key).await.unwrap();

        db.advance(Duration::from_secs(200));
        key.reset_lifetime();
        store.put_off_expiration(&mut key, Duration::from_secs(300)).await.unwrap();

        db.advance(Duration::from_secs(200));
        assert!(store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_subsecond_ttl_rejected() {
        let (_db, store) = store();
        let mut key = Key::new("res");
        store.save(&mut key).await.unwrap();
        assert!(matches!(
            store.put_off_expiration(&mut key, Duration::from_millis(500)).await,
            Err(LockError::InvalidTtl { .. })
        ));
        assert!(DatabaseStore::with_options(
            Arc::new(MemoryDatabase::new()),
            Duration::from_millis(100),
            0.01
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_gc_probability_validated() {
        assert!(matches!(
            DatabaseStore::with_options(Arc::new(MemoryDatabase::new()), Duration::from_secs(60), 1.5),
            Err(LockError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_always_prune_reclaims_expired_rows() {
        let db = Arc::new(MemoryDatabase::new());
        let store = DatabaseStore::with_options(
            Arc::clone(&db) as Arc<dyn LockDatabase>,
            Duration::from_secs(60),
            1.0,
        )
        .unwrap();
        let mut old = Key::new("stale");
        store.save(&mut old).await.unwrap();

        db.advance(Duration::from_secs(61));
        let mut fresh = Key::new("other");
        store.save(&mut fresh).await.unwrap();

        let rows = db.rows.lock().unwrap();
        assert_eq!(rows.as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_ignores_foreign_token() {
        let (_db, store) = store();
        let mut holder = Key::new("res");
        let mut other = Key::new("res");

        store.save(&mut holder).await.unwrap();
        store.delete(&mut other).await.unwrap();
        assert!(store.exists(&holder).await.unwrap());
    }
}
