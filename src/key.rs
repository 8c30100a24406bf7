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

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use tokio::sync::OwnedSemaphorePermit;

/// Number of random bytes in a lock token before encoding.
const TOKEN_BYTES: usize = 32;

/// Backend-specific proof that this key currently owns a lock.
///
/// One variant per kind of backend: lease-based backends prove ownership
/// with an opaque token persisted next to the record, while "forever lock"
/// backends prove it by holding a live native handle. Each store reads and
/// writes only its own variant, under its own scope.
#[derive(Debug)]
pub enum OwnershipProof {
    /// Opaque random token persisted in the backend record
    Token(String),
    /// Live file handle holding an OS-level flock
    File(Arc<std::fs::File>),
    /// Live single-slot semaphore permit
    Permit(OwnedSemaphorePermit),
}

impl OwnershipProof {
    /// The token value, when this proof is token-based
    pub fn as_token(&self) -> Option<&str> {
        match self {
            Self::Token(token) => Some(token),
            _ => None,
        }
    }
}

/// A lease handle identifying one lock resource.
///
/// A `Key` is owned by exactly one acquisition flow at a time: stores mutate
/// it (lifetime budget, ownership proofs) through `&mut` during save, renew
/// and release. It is not `Clone` — two keys for the same resource string
/// are two distinct contenders with distinct tokens.
#[derive(Debug)]
pub struct Key {
    resource: String,
    deadline: Option<Instant>,
    created_at: Instant,
    state: HashMap<String, OwnershipProof>,
}

impl Key {
    /// Create a new key for a resource, with an unbounded lifetime budget.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            deadline: None,
            created_at: Instant::now(),
            state: HashMap::new(),
        }
    }

    /// The resource identifier this key locks.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// When this key was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Shrink the remaining lifetime budget to at most `ttl` from now.
    ///
    /// Lease-based stores call this before every write so that a write which
    /// outlives its own lease is detected afterwards by [`Key::is_expired`].
    pub fn reduce_lifetime(&mut self, ttl: Duration) {
        let candidate = Instant::now() + ttl;
        self.deadline = Some(match self.deadline {
            Some(current) if current < candidate => current,
            _ => candidate,
        });
    }

    /// Reset the lifetime budget to unbounded.
    pub fn reset_lifetime(&mut self) {
        self.deadline = None;
    }

    /// Whether the lifetime budget has been exhausted.
    pub fn is_expired(&self) -> bool {
        match self.deadline {
            Some(deadline) => deadline <= Instant::now(),
            None => false,
        }
    }

    /// Remaining lifetime budget; `None` when unbounded.
    pub fn remaining_lifetime(&self) -> Option<Duration> {
        self.deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether a proof is recorded under `scope`.
    pub fn has_state(&self, scope: &str) -> bool {
        self.state.contains_key(scope)
    }

    /// The proof recorded under `scope`, if any.
    pub fn state(&self, scope: &str) -> Option<&OwnershipProof> {
        self.state.get(scope)
    }

    /// Record a proof under `scope`, replacing any previous one.
    pub fn set_state(&mut self, scope: &str, proof: OwnershipProof) {
        self.state.insert(scope.to_string(), proof);
    }

    /// Remove and return the proof recorded under `scope`.
    pub fn remove_state(&mut self, scope: &str) -> Option<OwnershipProof> {
        self.state.remove(scope)
    }

    /// The token recorded under `scope`, if a token-based proof is present.
    pub fn token(&self, scope: &str) -> Option<&str> {
        self.state.get(scope).and_then(OwnershipProof::as_token)
    }

    /// The token for `scope`, generating and caching a fresh one on first use.
    ///
    /// Tokens are 32 random bytes, base64-encoded; they prove which
    /// acquisition attempt owns a record independent of process identity.
    pub fn unique_token(&mut self, scope: &str) -> String {
        if let Some(token) = self.token(scope) {
            return token.to_string();
        }
        let token = generate_token();
        self.set_state(scope, OwnershipProof::Token(token.clone()));
        token
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.resource)
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}
