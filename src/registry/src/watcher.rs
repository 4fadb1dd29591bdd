use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::SERVICE_NAME;
use crate::catalog::{CatalogConnector, ServiceEntry, ServiceQuery, WatchHandler};
use crate::error::{ErrorSink, RegistryError, RegistryResult};
use crate::event::{EventKey, EventName, EventVersion, PublisherEndpoint};

/// Accepts a catalog notification only when its index is strictly greater
/// than the last accepted one. Repeated, retried and out-of-order
/// notifications from the long-poll are dropped.
///
/// An index that goes backwards is never accepted again until it passes the
/// last accepted value, even if the catalog legitimately reset its counter.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexFilter {
    last_index: u64,
}

impl IndexFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    /// Returns true and records `index` if it advances past the last accepted index
    pub fn advance(&mut self, index: u64) -> bool {
        if index <= self.last_index {
            return false;
        }
        self.last_index = index;
        true
    }
}

/// Publisher endpoints for the given entries, in catalog order.
pub fn endpoints_from_entries(entries: &[ServiceEntry]) -> Vec<PublisherEndpoint> {
    entries
        .iter()
        .map(|entry| PublisherEndpoint::tcp(&entry.address, entry.port))
        .collect()
}

/// Stops a running watch. Dropping the handle stops the watch as well.
#[must_use = "dropping a WatchHandle stops the watch"]
#[derive(Debug)]
pub struct WatchHandle {
    key: EventKey,
    cancel: CancellationToken,
    /// Long-poll loop on the runtime
    task: Option<JoinHandle<()>>,
    /// Blocking worker that owns and calls the handler
    delivery: Option<JoinHandle<()>>,
}

impl WatchHandle {
    pub fn key(&self) -> &EventKey {
        &self.key
    }

    /// Request the watch to stop. Once this returns the handler is not called
    /// again, except for a call that is already in progress or that passed
    /// its stop check while this ran; such a call runs to completion.
    /// Calling it again has no effect.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            log::debug!("Stopping watch for {}", self.key);
        }
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the watch and wait for its workers to finish, including a
    /// handler call in progress.
    pub async fn join(mut self) {
        self.stop();
        for worker in [self.task.take(), self.delivery.take()].into_iter().flatten() {
            if let Err(e) = worker.await {
                log::error!("Watch worker for {} did not finish cleanly: {e}", self.key);
            }
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Keeps subscribers informed of the passing publishers of an event key.
#[derive(Clone)]
pub struct Watcher {
    connector: Arc<dyn CatalogConnector>,
    error_sink: Arc<dyn ErrorSink>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("connector", &"Arc<dyn CatalogConnector>")
            .field("error_sink", &"Arc<dyn ErrorSink>")
            .finish()
    }
}

impl Watcher {
    pub fn new(connector: Arc<dyn CatalogConnector>, error_sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            connector,
            error_sink,
        }
    }

    /// Start watching the passing publishers of `name`/`version`.
    ///
    /// Returns as soon as the watch workers are spawned. `handler` runs on a
    /// blocking worker owned by this watch, once per accepted notification
    /// (also when no publisher is passing) and never concurrently with
    /// itself. A slow handler delays later snapshots of this watch only, which
    /// queue up in order meanwhile. Failures of the running watch go to the
    /// error sink and end the watch, including a failure the catalog raises
    /// while stopping.
    pub fn watch<F>(
        &self,
        name: &EventName,
        version: EventVersion,
        mut handler: F,
    ) -> RegistryResult<WatchHandle>
    where
        F: FnMut(Vec<PublisherEndpoint>) + Send + 'static,
    {
        let key = EventKey::new(name, version)?;
        let query = ServiceQuery::new(SERVICE_NAME)
            .with_tag(key.tag())
            .passing_only();
        query.validate()?;

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| RegistryError::NoRuntime(e.to_string()))?;
        let client = self.connector.connect()?;

        let cancel = CancellationToken::new();
        let (snapshots, mut pending) = mpsc::unbounded_channel::<Vec<PublisherEndpoint>>();

        let delivery = {
            let cancel = cancel.clone();
            runtime.spawn_blocking(move || {
                while let Some(endpoints) = pending.blocking_recv() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    handler(endpoints);
                }
            })
        };

        let mut filter = IndexFilter::new();
        let on_notification: WatchHandler = {
            let cancel = cancel.clone();
            let key = key.clone();
            Box::new(move |index, entries| {
                if cancel.is_cancelled() {
                    return;
                }
                if !filter.advance(index) {
                    log::debug!(
                        "Skipping notification for {key} at index {index}, already at {}",
                        filter.last_index()
                    );
                    return;
                }
                let endpoints = endpoints_from_entries(&entries);
                log::debug!(
                    "Delivering {} publisher(s) for {key} at index {index}",
                    endpoints.len()
                );
                // Fails only once the delivery worker has stopped
                let _ = snapshots.send(endpoints);
            })
        };

        let task = {
            let cancel = cancel.clone();
            let key = key.clone();
            let error_sink = self.error_sink.clone();
            runtime.spawn(async move {
                log::info!("Watching publishers for {key}");
                match client.watch(query, on_notification, cancel).await {
                    Ok(()) => log::info!("Watch for {key} stopped"),
                    Err(e) => {
                        log::warn!("Watch for {key} terminated: {e}");
                        error_sink.report(e.into());
                    }
                }
            })
        };

        Ok(WatchHandle {
            key,
            cancel,
            task: Some(task),
            delivery: Some(delivery),
        })
    }
}
