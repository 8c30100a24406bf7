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

//! Backend adapters implementing [`crate::store::LockStore`].

pub mod advisory;
pub mod cache;
pub mod coordination;
pub mod database;
pub mod flock;
pub mod memory;
pub mod semaphore;

pub use advisory::{AdvisorySession, AdvisoryStore, MemoryAdvisory, SessionRegistry};
pub use cache::{CacheBackend, CacheStore, MemoryCache, PutOutcome};
pub use coordination::{CoordinationClient, CoordinationStore};
pub use database::{DatabaseStore, InsertOutcome, LockDatabase, MemoryDatabase};
pub use flock::FlockStore;
pub use memory::InMemoryStore;
pub use semaphore::{SemaphoreRegistry, SemaphoreStore};
