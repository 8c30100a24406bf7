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

use std::time::Duration;
use thiserror::Error;

/// Lock operation related error types
#[derive(Error, Debug)]
pub enum LockError {
    /// Another valid, non-expired holder already owns the resource
    #[error("Lock conflict: resource '{resource}' is held by another key")]
    Conflict { resource: String },

    /// The key's own lifetime budget was exhausted during or after an operation
    #[error("Lock expired: resource '{resource}' exceeded its lifetime budget")]
    Expired { resource: String },

    /// A backend was invoked for a capability it structurally cannot provide
    #[error("Store '{store}' does not support {operation}")]
    NotSupported { store: String, operation: String },

    /// Invalid TTL passed to a lease-based store
    #[error("Invalid TTL: expected a strictly positive duration, got {ttl:?}")]
    InvalidTtl { ttl: Duration },

    /// Invalid DSN, invalid options, or missing collaborator
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The lock table does not exist yet
    #[error("Lock table '{table}' does not exist")]
    MissingTable { table: String },

    /// The backend itself failed (driver error, I/O error, closed session)
    #[error("Backend error in store '{store}': {message}")]
    Backend {
        store: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The lock could not be verifiably released
    #[error("Failed to release the '{resource}' lock")]
    Releasing { resource: String },
}

impl LockError {
    /// Create a conflict error
    pub fn conflict(resource: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
        }
    }

    /// Create an expired error
    pub fn expired(resource: impl Into<String>) -> Self {
        Self::Expired {
            resource: resource.into(),
        }
    }

    /// Create a not supported error
    pub fn not_supported(store: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::NotSupported {
            store: store.into(),
            operation: operation.into(),
        }
    }

    /// Create an invalid TTL error
    pub fn invalid_ttl(ttl: Duration) -> Self {
        Self::InvalidTtl { ttl }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a missing table error
    pub fn missing_table(table: impl Into<String>) -> Self {
        Self::MissingTable { table: table.into() }
    }

    /// Create a backend error
    pub fn backend(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            store: store.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a backend error wrapping a driver-level source
    pub fn backend_with(
        store: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            store: store.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a releasing error
    pub fn releasing(resource: impl Into<String>) -> Self {
        Self::Releasing {
            resource: resource.into(),
        }
    }

    /// Check if it is a retryable error.
    ///
    /// Conflict is the canonical "lock not acquired, try later" signal; every
    /// other variant is either fatal or must surface to the caller unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Check if it is a fatal (non-retryable, caller/config mistake) error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NotSupported { .. } | Self::Configuration { .. } | Self::InvalidTtl { .. }
        )
    }
}

/// Lock operation Result type
pub type Result<T> = std::result::Result<T, LockError>;
