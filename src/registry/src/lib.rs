//! Publisher discovery for a typed event bus.
//!
//! Publishers advertise `host:port` for an event name and version through
//! [`Registry::register`]. Subscribers receive the current set of passing
//! publishers through [`Registry::watch`]. Both go through a service catalog
//! (see [`catalog`]); health checking is left to the catalog.

use std::sync::Arc;

pub mod catalog;
pub mod error;
pub mod event;
pub mod registrar;
pub mod service_id;
pub mod watcher;

pub use catalog::{CatalogClient, CatalogConnector, ConsulCatalog, InMemoryCatalog};
pub use error::{ErrorSink, LogErrorSink, RegistryError, RegistryResult};
pub use event::{EventKey, EventName, EventVersion, PublisherEndpoint};
pub use registrar::{Deregistration, Registrar};
pub use service_id::ServiceId;
pub use watcher::{WatchHandle, Watcher};

use catalog::ServiceQuery;

/// Catalog service name every publisher is registered under
pub const SERVICE_NAME: &str = "bus";

/// Entry point combining registration and discovery over one catalog.
#[derive(Clone)]
pub struct Registry {
    connector: Arc<dyn CatalogConnector>,
    registrar: Registrar,
    watcher: Watcher,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("connector", &"Arc<dyn CatalogConnector>")
            .field("registrar", &self.registrar)
            .field("watcher", &self.watcher)
            .finish()
    }
}

impl Registry {
    /// `error_sink` receives failures of running watches.
    pub fn new(
        connector: impl CatalogConnector + 'static,
        error_sink: impl ErrorSink + 'static,
    ) -> Self {
        Self::from_parts(Arc::new(connector), Arc::new(error_sink))
    }

    pub fn from_parts(connector: Arc<dyn CatalogConnector>, error_sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            registrar: Registrar::new(connector.clone()),
            watcher: Watcher::new(connector.clone(), error_sink),
            connector,
        }
    }

    /// See [`Registrar::register`].
    pub async fn register(
        &self,
        name: &EventName,
        version: EventVersion,
        host: &str,
        port: u16,
    ) -> RegistryResult<Deregistration> {
        self.registrar.register(name, version, host, port).await
    }

    /// See [`Watcher::watch`].
    pub fn watch<F>(
        &self,
        name: &EventName,
        version: EventVersion,
        handler: F,
    ) -> RegistryResult<WatchHandle>
    where
        F: FnMut(Vec<PublisherEndpoint>) + Send + 'static,
    {
        self.watcher.watch(name, version, handler)
    }

    /// Current passing publishers of `name`/`version`, read once.
    pub async fn lookup(
        &self,
        name: &EventName,
        version: EventVersion,
    ) -> RegistryResult<Vec<PublisherEndpoint>> {
        let key = EventKey::new(name, version)?;
        let query = ServiceQuery::new(SERVICE_NAME)
            .with_tag(key.tag())
            .passing_only();
        let client = self.connector.connect()?;
        let snapshot = client.health_service(&query).await?;
        Ok(watcher::endpoints_from_entries(&snapshot.entries))
    }
}
