use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;

use super::{
    CatalogClient, CatalogConnector, CatalogError, CatalogResult, HealthStatus, RegisterOptions,
    ResultTracker, ServiceEntry, ServiceQuery, ServiceRegistration, ServiceSnapshot, WatchHandler,
};
use crate::service_id::ServiceId;

const DEFAULT_CHANNEL_SIZE: usize = 64;

#[derive(Debug, Clone)]
struct Instance {
    registration: ServiceRegistration,
    status: HealthStatus,
}

impl Instance {
    fn entry(&self) -> ServiceEntry {
        ServiceEntry {
            id: self.registration.id.to_string(),
            service: self.registration.name.clone(),
            address: self.registration.address.clone(),
            port: self.registration.port,
            tags: self.registration.tags.clone(),
            status: self.status,
        }
    }
}

#[derive(Debug)]
struct State {
    index: u64,
    instances: BTreeMap<String, Instance>,
}

impl State {
    fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            index: self.index,
            entries: self.instances.values().map(Instance::entry).collect(),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    /// Every committed change, as a full unfiltered snapshot
    changes: broadcast::Sender<Arc<ServiceSnapshot>>,
    closed: CancellationToken,
}

/// Service catalog kept in process memory.
///
/// Clones share the same catalog. The index starts at 1 and increases by one
/// with every mutation. Running watches are told about each mutation that
/// changes the instances they select.
#[derive(Debug, Clone)]
pub struct InMemoryCatalog {
    inner: Arc<Inner>,
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(DEFAULT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    index: 1,
                    instances: BTreeMap::new(),
                }),
                changes,
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Current catalog index
    pub async fn index(&self) -> u64 {
        self.inner.state.lock().await.index
    }

    pub async fn registration(&self, service_id: &ServiceId) -> Option<ServiceRegistration> {
        let state = self.inner.state.lock().await;
        state
            .instances
            .get(service_id.as_str())
            .map(|instance| instance.registration.clone())
    }

    pub async fn health(&self, service_id: &ServiceId) -> Option<HealthStatus> {
        let state = self.inner.state.lock().await;
        state
            .instances
            .get(service_id.as_str())
            .map(|instance| instance.status)
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.instances.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Change the aggregated health of a registered instance
    pub async fn set_health(&self, service_id: &ServiceId, status: HealthStatus) -> CatalogResult<()> {
        self.mutate(|state| {
            let instance = state
                .instances
                .get_mut(service_id.as_str())
                .ok_or_else(|| CatalogError::UnknownService(service_id.to_string()))?;
            instance.status = status;
            Ok(())
        })
        .await
    }

    /// Simulate losing the catalog: later calls fail and running watches end
    /// with [`CatalogError::Unavailable`].
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    fn ensure_open(&self) -> CatalogResult<()> {
        if self.is_closed() {
            return Err(CatalogError::Unavailable);
        }
        Ok(())
    }

    async fn mutate<R>(&self, apply: impl FnOnce(&mut State) -> CatalogResult<R>) -> CatalogResult<R> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock().await;
        let result = apply(&mut state)?;
        state.index += 1;
        // No receivers just means nobody is watching
        let _ = self.inner.changes.send(Arc::new(state.snapshot()));
        Ok(result)
    }

    async fn current(&self, query: &ServiceQuery) -> CatalogResult<ServiceSnapshot> {
        self.ensure_open()?;
        let state = self.inner.state.lock().await;
        Ok(filter(query, &state.snapshot()))
    }
}

fn filter(query: &ServiceQuery, snapshot: &ServiceSnapshot) -> ServiceSnapshot {
    ServiceSnapshot {
        index: snapshot.index,
        entries: snapshot
            .entries
            .iter()
            .filter(|entry| query.matches(entry))
            .cloned()
            .collect(),
    }
}

#[async_trait]
impl CatalogClient for InMemoryCatalog {
    async fn register(
        &self,
        registration: ServiceRegistration,
        options: RegisterOptions,
    ) -> CatalogResult<()> {
        self.mutate(|state| {
            let status = match state.instances.get(registration.id.as_str()) {
                Some(existing) if !options.replace_existing_checks => existing.status,
                _ => HealthStatus::Passing,
            };
            state.instances.insert(
                registration.id.to_string(),
                Instance {
                    registration,
                    status,
                },
            );
            Ok(())
        })
        .await
    }

    async fn deregister(&self, service_id: &ServiceId) -> CatalogResult<()> {
        self.mutate(|state| {
            state
                .instances
                .remove(service_id.as_str())
                .map(|_| ())
                .ok_or_else(|| CatalogError::UnknownService(service_id.to_string()))
        })
        .await
    }

    async fn health_service(&self, query: &ServiceQuery) -> CatalogResult<ServiceSnapshot> {
        query.validate()?;
        self.current(query).await
    }

    async fn watch(
        &self,
        query: ServiceQuery,
        mut handler: WatchHandler,
        stop: CancellationToken,
    ) -> CatalogResult<()> {
        query.validate()?;
        // Subscribe first so no change between the initial read and the loop is lost
        let mut changes = self.inner.changes.subscribe();

        let mut results = ResultTracker::new();
        let initial = self.current(&query).await?;
        results.changed(&initial.entries);
        handler(initial.index, initial.entries);

        loop {
            tokio::select! {
                biased;

                _ = stop.cancelled() => return Ok(()),
                _ = self.inner.closed.cancelled() => return Err(CatalogError::Unavailable),
                change = changes.recv() => match change {
                    Ok(snapshot) => {
                        let matching = filter(&query, &snapshot);
                        if results.changed(&matching.entries) {
                            handler(matching.index, matching.entries);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("In-memory catalog watch lagged by {skipped} changes, re-reading");
                        let current = self.current(&query).await?;
                        if results.changed(&current.entries) {
                            handler(current.index, current.entries);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(CatalogError::Unavailable),
                },
            }
        }
    }
}

impl CatalogConnector for InMemoryCatalog {
    fn connect(&self) -> CatalogResult<Arc<dyn CatalogClient>> {
        Ok(Arc::new(self.clone()))
    }
}
