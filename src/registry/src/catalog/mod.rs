//! The service catalog collaborator: registration, health queries and
//! long-poll watches.
//!
//! [`consul`] talks to a Consul agent over HTTP; [`memory`] keeps the catalog
//! in process for tests and single-process setups.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::service_id::ServiceId;

pub mod consul;
pub mod memory;

pub use consul::ConsulCatalog;
pub use memory::InMemoryCatalog;

/// Error types that can occur while talking to the catalog
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to create catalog client: {0}")]
    Connect(String),

    #[error("Catalog request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Catalog responded with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Failed to decode catalog response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Catalog response carried no usable index")]
    MissingIndex,

    #[error("Invalid catalog query: {0}")]
    InvalidQuery(String),

    #[error("Unknown service ID: {0}")]
    UnknownService(String),

    #[error("Catalog is unavailable")]
    Unavailable,
}

/// Result type for catalog operations
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Health of an instance as aggregated from all of its checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Passing,
    Warning,
    Critical,
    Maintenance,
}

impl HealthStatus {
    /// The worst of the given statuses; an instance without checks is passing.
    pub fn aggregate(statuses: impl IntoIterator<Item = HealthStatus>) -> Self {
        statuses.into_iter().max().unwrap_or_default()
    }
}

/// One instance to be advertised in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    pub id: ServiceId,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterOptions {
    /// Drop health checks left over from a previous registration of the same id
    pub replace_existing_checks: bool,
}

/// One instance as returned by a health query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub id: String,
    pub service: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub status: HealthStatus,
}

/// Result of a health query at one catalog index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceSnapshot {
    pub index: u64,
    pub entries: Vec<ServiceEntry>,
}

/// Which instances a health query or watch selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceQuery {
    service: String,
    tag: Option<String>,
    passing_only: bool,
}

impl ServiceQuery {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            tag: None,
            passing_only: false,
        }
    }

    /// Only select instances carrying exactly this tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Only select instances whose checks are all passing
    pub fn passing_only(mut self) -> Self {
        self.passing_only = true;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn is_passing_only(&self) -> bool {
        self.passing_only
    }

    pub fn validate(&self) -> CatalogResult<()> {
        if self.service.trim().is_empty() {
            return Err(CatalogError::InvalidQuery(
                "service name cannot be empty".to_string(),
            ));
        }
        if let Some(tag) = &self.tag {
            if tag.trim().is_empty() {
                return Err(CatalogError::InvalidQuery("tag cannot be empty".to_string()));
            }
        }
        Ok(())
    }

    pub fn matches(&self, entry: &ServiceEntry) -> bool {
        if entry.service != self.service {
            return false;
        }
        if let Some(tag) = &self.tag {
            if !entry.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        !self.passing_only || entry.status == HealthStatus::Passing
    }
}

/// Callback invoked by a watch with the catalog index and the matching entries.
pub type WatchHandler = Box<dyn FnMut(u64, Vec<ServiceEntry>) + Send>;

/// Remembers the last result a watch reported. The catalog index moves with
/// any change to the service, so a watch sees many results whose entries are
/// identical to the previous ones; only the first result and actual changes
/// are reported.
#[derive(Debug, Default)]
pub struct ResultTracker {
    last: Option<Vec<ServiceEntry>>,
}

impl ResultTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true and records `entries` if they differ from the last
    /// recorded result, or if nothing was recorded yet.
    pub fn changed(&mut self, entries: &[ServiceEntry]) -> bool {
        if self.last.as_deref() == Some(entries) {
            return false;
        }
        self.last = Some(entries.to_vec());
        true
    }
}

/// A connection to the service catalog.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Add or update an instance registration
    async fn register(
        &self,
        registration: ServiceRegistration,
        options: RegisterOptions,
    ) -> CatalogResult<()>;

    /// Remove an instance registration
    async fn deregister(&self, service_id: &ServiceId) -> CatalogResult<()>;

    /// Read the current result of a query without blocking
    async fn health_service(&self, query: &ServiceQuery) -> CatalogResult<ServiceSnapshot>;

    /// Call `handler` each time the catalog reports a result for `query`, until
    /// `stop` is cancelled or the catalog fails. Returns `Ok(())` when stopped.
    async fn watch(
        &self,
        query: ServiceQuery,
        handler: WatchHandler,
        stop: CancellationToken,
    ) -> CatalogResult<()>;
}

/// Builds catalog clients. Construction may fail, e.g. on a malformed address.
#[cfg_attr(test, mockall::automock)]
pub trait CatalogConnector: Send + Sync {
    fn connect(&self) -> CatalogResult<Arc<dyn CatalogClient>>;
}
