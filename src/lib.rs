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

//! Pluggable distributed lock stores.
//!
//! A [`Key`] identifies one contender for one resource; a [`LockStore`]
//! persists who holds it. Stores exist for process-local maps, file locks,
//! semaphores, caches, relational databases, advisory sessions and
//! coordination services, and compose through [`CombinedStore`] (quorum
//! replication over several stores) and [`RetryTillSaveStore`] (polling
//! decorator adding blocking waits). [`Lock`] is the high-level handle with
//! lease refresh and release-on-drop; [`StoreFactory`] builds stores from
//! DSN strings like `redis://cache.example.com?ttl=30`.

mod combined;
mod error;
mod expiry;
mod factory;
mod key;
mod lock;
mod retry;
mod store;
pub mod stores;
mod strategy;

pub use combined::CombinedStore;
pub use error::{LockError, Result};
pub use factory::{ParsedDsn, StoreFactory};
pub use key::{Key, OwnershipProof};
pub use lock::{Lock, LockFactory};
pub use retry::RetryTillSaveStore;
pub use store::{LockMode, LockStore};
pub use strategy::{Majority, QuorumStrategy, Unanimous};

/// Version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
