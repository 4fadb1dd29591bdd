use std::sync::Arc;

use crate::SERVICE_NAME;
use crate::catalog::{CatalogClient, CatalogConnector, RegisterOptions, ServiceRegistration};
use crate::error::RegistryResult;
use crate::event::{EventKey, EventName, EventVersion};
use crate::service_id::ServiceId;

/// Withdraws one registration from the catalog.
///
/// `deregister` consumes the handle. Dropping it without calling
/// `deregister` leaves the registration in place.
#[must_use = "the registration stays in the catalog until deregister is called"]
pub struct Deregistration {
    client: Arc<dyn CatalogClient>,
    service_id: ServiceId,
}

impl std::fmt::Debug for Deregistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deregistration")
            .field("service_id", &self.service_id)
            .finish()
    }
}

impl Deregistration {
    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    /// Remove the registration. Fails with the catalog's error if it cannot be
    /// reached any more.
    pub async fn deregister(self) -> RegistryResult<()> {
        self.client.deregister(&self.service_id).await?;
        log::info!("Deregistered {}", self.service_id);
        Ok(())
    }
}

/// Advertises publishers of an event key in the catalog.
#[derive(Clone)]
pub struct Registrar {
    connector: Arc<dyn CatalogConnector>,
}

impl std::fmt::Debug for Registrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registrar")
            .field("connector", &"Arc<dyn CatalogConnector>")
            .finish()
    }
}

impl Registrar {
    pub fn new(connector: Arc<dyn CatalogConnector>) -> Self {
        Self { connector }
    }

    /// Register `host:port` as a publisher of `name`/`version`.
    ///
    /// Health checks left by an earlier registration of the same address are
    /// replaced. Nothing is written to the catalog when this fails.
    pub async fn register(
        &self,
        name: &EventName,
        version: EventVersion,
        host: &str,
        port: u16,
    ) -> RegistryResult<Deregistration> {
        let key = EventKey::new(name, version)?;
        let client = self.connector.connect()?;

        let service_id = ServiceId::generate(host, port);
        let registration = ServiceRegistration {
            id: service_id.clone(),
            name: SERVICE_NAME.to_string(),
            address: host.to_string(),
            port,
            tags: vec![key.tag()],
        };
        let options = RegisterOptions {
            replace_existing_checks: true,
        };

        client.register(registration, options).await?;
        log::info!("Registered {service_id} at {host}:{port} for {key}");

        Ok(Deregistration { client, service_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogError, MockCatalogClient, MockCatalogConnector};
    use crate::error::RegistryError;
    use mockall::predicate::eq;

    fn connector_for(client: MockCatalogClient) -> Arc<dyn CatalogConnector> {
        let client: Arc<dyn CatalogClient> = Arc::new(client);
        let mut connector = MockCatalogConnector::new();
        connector
            .expect_connect()
            .returning(move || Ok(client.clone()));
        Arc::new(connector)
    }

    #[tokio::test]
    async fn test_register_submits_tagged_registration() {
        let mut client = MockCatalogClient::new();
        client
            .expect_register()
            .withf(|registration, options| {
                registration.id.as_str() == "bus-10-0-0-1-7000"
                    && registration.name == "bus"
                    && registration.address == "10.0.0.1"
                    && registration.port == 7000
                    && registration.tags == vec!["orders.created:v2".to_string()]
                    && options.replace_existing_checks
            })
            .times(1)
            .returning(|_, _| Ok(()));
        client
            .expect_deregister()
            .with(eq(ServiceId::generate("10.0.0.1", 7000)))
            .times(1)
            .returning(|_| Ok(()));

        let registrar = Registrar::new(connector_for(client));
        let deregistration = registrar
            .register(&EventName::from("orders.created"), EventVersion(2), "10.0.0.1", 7000)
            .await
            .unwrap();
        assert_eq!(deregistration.service_id().as_str(), "bus-10-0-0-1-7000");

        deregistration.deregister().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_registers_nothing() {
        let mut connector = MockCatalogConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|| Err(CatalogError::Connect("invalid address".into())));

        let registrar = Registrar::new(Arc::new(connector));
        let result = registrar
            .register(&EventName::from("orders.created"), EventVersion(1), "10.0.0.1", 7000)
            .await;

        assert!(matches!(
            result,
            Err(RegistryError::Catalog(CatalogError::Connect(_)))
        ));
    }

    #[tokio::test]
    async fn test_rejected_registration_is_returned() {
        let mut client = MockCatalogClient::new();
        client.expect_register().times(1).returning(|_, _| {
            Err(CatalogError::Status {
                status: 403,
                message: "Permission denied".into(),
            })
        });
        client.expect_deregister().never();

        let registrar = Registrar::new(connector_for(client));
        let err = registrar
            .register(&EventName::from("orders.created"), EventVersion(1), "10.0.0.1", 7000)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("403"));
    }

    #[tokio::test]
    async fn test_empty_event_name_fails_before_connecting() {
        let mut connector = MockCatalogConnector::new();
        connector.expect_connect().never();

        let registrar = Registrar::new(Arc::new(connector));
        let result = registrar
            .register(&EventName::from(""), EventVersion(1), "10.0.0.1", 7000)
            .await;

        assert!(matches!(result, Err(RegistryError::InvalidEventKey(_))));
    }

    #[tokio::test]
    async fn test_deregister_error_is_returned() {
        let mut client = MockCatalogClient::new();
        client.expect_register().returning(|_, _| Ok(()));
        client
            .expect_deregister()
            .times(1)
            .returning(|_| Err(CatalogError::Unavailable));

        let registrar = Registrar::new(connector_for(client));
        let deregistration = registrar
            .register(&EventName::from("orders.created"), EventVersion(1), "host", 1)
            .await
            .unwrap();

        let result = deregistration.deregister().await;
        assert!(matches!(
            result,
            Err(RegistryError::Catalog(CatalogError::Unavailable))
        ));
    }
}
