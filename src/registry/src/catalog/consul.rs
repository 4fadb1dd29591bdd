use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::config::CatalogConfig;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    CatalogClient, CatalogConnector, CatalogError, CatalogResult, HealthStatus, RegisterOptions,
    ResultTracker, ServiceEntry, ServiceQuery, ServiceRegistration, ServiceSnapshot, WatchHandler,
};
use crate::service_id::ServiceId;

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Extra time granted on top of the wait time before a blocking query is
/// abandoned. Consul may add up to `wait / 16` of jitter to the wait itself.
const BLOCKING_QUERY_MARGIN: Duration = Duration::from_secs(5);

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    address: &'a str,
    port: u16,
    tags: &'a [String],
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthServiceEntry {
    service: AgentService,
    #[serde(default)]
    checks: Vec<HealthCheck>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    address: String,
    port: u16,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthCheck {
    status: HealthStatus,
}

impl From<HealthServiceEntry> for ServiceEntry {
    fn from(entry: HealthServiceEntry) -> Self {
        let status = HealthStatus::aggregate(entry.checks.iter().map(|check| check.status));
        ServiceEntry {
            id: entry.service.id,
            service: entry.service.service,
            address: entry.service.address,
            port: entry.service.port,
            tags: entry.service.tags.unwrap_or_default(),
            status,
        }
    }
}

/// Catalog client for a Consul agent's HTTP API.
#[derive(Debug, Clone)]
pub struct ConsulCatalog {
    client: Client,
    base: Url,
    token: Option<String>,
    datacenter: Option<String>,
    wait_time: Duration,
}

impl ConsulCatalog {
    /// Build a client. No request is made until the first operation.
    pub fn new(config: &CatalogConfig) -> CatalogResult<Self> {
        let base = parse_address(&config.address)?;
        let client = Client::builder()
            .build()
            .map_err(|e| CatalogError::Connect(e.to_string()))?;

        Ok(Self {
            client,
            base,
            token: config.token.clone().filter(|token| !token.is_empty()),
            datacenter: config.datacenter.clone().filter(|dc| !dc.is_empty()),
            wait_time: config.wait_time,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> CatalogResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| CatalogError::Connect(format!("{} cannot be used as a base URL", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.client.request(method, url);
        match &self.token {
            Some(token) => request.header(TOKEN_HEADER, token),
            None => request,
        }
    }

    /// Run a health query. With `index` set this is a blocking query that the
    /// agent holds open until the result moves past that index or the wait
    /// time elapses.
    async fn query(&self, query: &ServiceQuery, index: Option<u64>) -> CatalogResult<ServiceSnapshot> {
        let mut url = self.endpoint(&["v1", "health", "service", query.service()])?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(tag) = query.tag() {
                pairs.append_pair("tag", tag);
            }
            if query.is_passing_only() {
                pairs.append_pair("passing", "true");
            }
            if let Some(dc) = &self.datacenter {
                pairs.append_pair("dc", dc);
            }
            if let Some(index) = index {
                pairs.append_pair("index", &index.to_string());
                pairs.append_pair("wait", &format_wait(self.wait_time));
            }
        }

        let mut request = self.request(Method::GET, url);
        if index.is_some() {
            request = request.timeout(blocking_timeout(self.wait_time));
        }

        let response = check_status(request.send().await?).await?;
        let index = parse_index(&response)?;
        let body = response.bytes().await?;
        let entries: Vec<HealthServiceEntry> = serde_json::from_slice(&body)?;

        Ok(ServiceSnapshot {
            index,
            entries: entries.into_iter().map(ServiceEntry::from).collect(),
        })
    }
}

fn parse_address(address: &str) -> CatalogResult<Url> {
    let address = address.trim();
    if address.is_empty() {
        return Err(CatalogError::Connect("catalog address cannot be empty".to_string()));
    }

    let with_scheme = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    };
    let url = Url::parse(&with_scheme)
        .map_err(|e| CatalogError::Connect(format!("invalid catalog address '{address}': {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(CatalogError::Connect(format!(
                "unsupported catalog address scheme '{other}'"
            )));
        }
    }
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(CatalogError::Connect(format!(
            "catalog address '{address}' has no host"
        )));
    }
    Ok(url)
}

/// Client-side deadline for a blocking query that the agent may hold for `wait`
fn blocking_timeout(wait: Duration) -> Duration {
    wait.saturating_add(wait / 16)
        .saturating_add(BLOCKING_QUERY_MARGIN)
}

fn format_wait(wait: Duration) -> String {
    format!("{}ms", wait.as_millis())
}

fn parse_index(response: &Response) -> CatalogResult<u64> {
    response
        .headers()
        .get(INDEX_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .ok_or(CatalogError::MissingIndex)
}

async fn check_status(response: Response) -> CatalogResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(CatalogError::Status {
        status: status.as_u16(),
        message: message.trim().to_string(),
    })
}

/// Index to send with the next blocking query. An index that went backwards
/// means the catalog's state was reset, so start over from a non-blocking
/// read. Zero is never sent after the first response.
fn next_query_index(previous: u64, returned: u64) -> u64 {
    if returned < previous { 0 } else { returned.max(1) }
}

#[async_trait]
impl CatalogClient for ConsulCatalog {
    async fn register(
        &self,
        registration: ServiceRegistration,
        options: RegisterOptions,
    ) -> CatalogResult<()> {
        let mut url = self.endpoint(&["v1", "agent", "service", "register"])?;
        if options.replace_existing_checks {
            url.query_pairs_mut().append_pair("replace-existing-checks", "true");
        }

        let body = AgentServiceRegistration {
            id: registration.id.as_str(),
            name: &registration.name,
            address: &registration.address,
            port: registration.port,
            tags: &registration.tags,
        };

        let response = self.request(Method::PUT, url).json(&body).send().await?;
        check_status(response).await?;
        log::debug!("Registered {} with Consul at {}", registration.id, self.base);
        Ok(())
    }

    async fn deregister(&self, service_id: &ServiceId) -> CatalogResult<()> {
        let url = self.endpoint(&["v1", "agent", "service", "deregister", service_id.as_str()])?;
        let response = self.request(Method::PUT, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(CatalogError::UnknownService(service_id.to_string()));
        }
        check_status(response).await?;
        log::debug!("Deregistered {service_id} from Consul at {}", self.base);
        Ok(())
    }

    async fn health_service(&self, query: &ServiceQuery) -> CatalogResult<ServiceSnapshot> {
        query.validate()?;
        self.query(query, None).await
    }

    async fn watch(
        &self,
        query: ServiceQuery,
        mut handler: WatchHandler,
        stop: CancellationToken,
    ) -> CatalogResult<()> {
        query.validate()?;
        let mut index = 0;
        let mut results = ResultTracker::new();
        loop {
            let snapshot = tokio::select! {
                biased;

                _ = stop.cancelled() => return Ok(()),
                result = self.query(&query, Some(index)) => result?,
            };
            index = next_query_index(index, snapshot.index);
            if !results.changed(&snapshot.entries) {
                log::trace!("Result for {} unchanged at index {}", query.service(), snapshot.index);
                continue;
            }
            handler(snapshot.index, snapshot.entries);
        }
    }
}

impl CatalogConnector for CatalogConfig {
    fn connect(&self) -> CatalogResult<Arc<dyn CatalogClient>> {
        Ok(Arc::new(ConsulCatalog::new(self)?))
    }
}
