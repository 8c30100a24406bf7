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
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::{LockError, Result};
use crate::key::Key;
use crate::store::LockStore;

const STORE_NAME: &str = "coordination";

/// Client of a coordination service with ephemeral nodes, in the manner of
/// a ZooKeeper session.
///
/// Ephemeral nodes disappear when the creating session ends; the service
/// itself fences a crashed holder, so locks carry no lease of their own.
#[async_trait]
pub trait CoordinationClient: Send + Sync + std::fmt::Debug {
    /// Create an ephemeral node holding `data`. Returns `false` when the
    /// node already exists.
    async fn create_ephemeral(&self, node: &str, data: &str) -> Result<bool>;

    /// Delete the node. Returns `false` when it does not exist.
    async fn delete_node(&self, node: &str) -> Result<bool>;

    /// The data stored at the node, or `None` when it does not exist.
    async fn node_data(&self, node: &str) -> Result<Option<String>>;
}

/// Lock store on top of ephemeral coordination nodes.
///
/// The node path is derived from the resource name; the node's data is the
/// key's token. Renewal is meaningless here and reports as unsupported:
/// the node lives exactly as long as the session does.
#[derive(Debug)]
pub struct CoordinationStore {
    client: Arc<dyn CoordinationClient>,
}

impl CoordinationStore {
    const SCOPE: &'static str = "coordination";

    pub fn new(client: Arc<dyn CoordinationClient>) -> Self {
        Self { client }
    }

    /// Resource names may contain path separators which would create
    /// nested nodes; those are folded down to their digest.
    fn node_path(resource: &str) -> String {
        if !resource.is_empty() && !resource.contains('/') {
            format!("/{resource}")
        } else {
            format!("/{}", hex::encode(Sha256::digest(resource.as_bytes())))
        }
    }
}

#[async_trait]
impl LockStore for CoordinationStore {
    fn name(&self) -> &str {
        STORE_NAME
    }

    async fn save(&self, key: &mut Key) -> Result<()> {
        if self.exists(key).await? {
            return Ok(());
        }
        let node = Self::node_path(key.resource());
        let token = key.unique_token(Self::SCOPE);
        if self.client.create_ephemeral(&node, &token).await? {
            Ok(())
        } else {
            Err(LockError::conflict(key.resource()))
        }
    }

    async fn put_off_expiration(&self, _key: &mut Key, _ttl: Duration) -> Result<()> {
        Err(LockError::not_supported(STORE_NAME, "lease renewal"))
    }

    async fn delete(&self, key: &mut Key) -> Result<()> {
        if !self.exists(key).await? {
            return Ok(());
        }
        let node = Self::node_path(key.resource());
        if !self.client.delete_node(&node).await? {
            warn!(resource = %key.resource(), node = %node, "lock node vanished before deletion");
        }
        Ok(())
    }

    async fn exists(&self, key: &Key) -> Result<bool> {
        let Some(token) = key.token(Self::SCOPE) else {
            return Ok(false);
        };
        let node = Self::node_path(key.resource());
        Ok(self.client.node_data(&node).await?.as_deref() == Some(token))
    }
}
