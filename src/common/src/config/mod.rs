use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Default configuration file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "bus-registry.toml";

/// Connection settings for the service catalog (a Consul agent)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CatalogConfig {
    /// HTTP address of the agent; `http://` is assumed when no scheme is given
    pub address: String,
    /// ACL token sent as `X-Consul-Token`
    pub token: Option<String>,
    /// Datacenter to query instead of the agent's own
    pub datacenter: Option<String>,
    /// Maximum time a blocking watch query is held open by the catalog
    #[serde(with = "humantime_serde")]
    pub wait_time: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            address: String::from("http://127.0.0.1:8500"),
            token: None,
            datacenter: None,
            wait_time: Duration::from_secs(300),
        }
    }
}

/// An event type this process publishes and advertises in the catalog
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PublicationConfig {
    pub event: String,
    pub version: u32,
    /// Host advertised to subscribers
    pub host: String,
    pub port: u16,
}

/// An event type this process wants publisher endpoints for
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionConfig {
    pub event: String,
    pub version: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct Configuration {
    /// Service catalog connection
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// Registrations made on start and withdrawn on shutdown
    #[serde(default)]
    pub publish: Vec<PublicationConfig>,
    /// Watches kept open while running
    #[serde(default)]
    pub subscribe: Vec<SubscriptionConfig>,
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::load_from_path(DEFAULT_CONFIG_FILE)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        let config = Self::figment(path.as_ref())
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("BUS__").split("__"))
            .merge(Self::consul_env())
    }

    /// The variables the Consul tooling itself honours
    fn consul_env() -> Env {
        Env::raw()
            .only(&["CONSUL_HTTP_ADDR", "CONSUL_HTTP_TOKEN"])
            .map(|key| {
                if key.as_str().eq_ignore_ascii_case("CONSUL_HTTP_ADDR") {
                    "catalog.address".into()
                } else {
                    "catalog.token".into()
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_configless_operation() {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .extract::<Configuration>()
            .unwrap();

        assert_eq!(config.catalog.address, "http://127.0.0.1:8500");
        assert_eq!(config.catalog.wait_time, Duration::from_secs(300));
        assert!(config.catalog.token.is_none());
        assert!(config.publish.is_empty());
        assert!(config.subscribe.is_empty());
    }

    #[test]
    fn test_toml_file() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r#"
                [catalog]
                address = "consul.internal:8500"
                wait_time = "30s"

                [[publish]]
                event = "orders.created"
                version = 2
                host = "10.0.0.7"
                port = 7100

                [[subscribe]]
                event = "orders.created"
                version = 2
                "#,
            )?;

            let config = Configuration::load().map_err(|e| *e)?;
            assert_eq!(config.catalog.address, "consul.internal:8500");
            assert_eq!(config.catalog.wait_time, Duration::from_secs(30));
            assert_eq!(
                config.publish,
                vec![PublicationConfig {
                    event: "orders.created".into(),
                    version: 2,
                    host: "10.0.0.7".into(),
                    port: 7100,
                }]
            );
            assert_eq!(config.subscribe.len(), 1);
            Ok(())
        });
    }

    #[test]
    fn test_env_var_override() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(DEFAULT_CONFIG_FILE, "[catalog]\naddress = \"file:8500\"")?;
            jail.set_env("BUS__CATALOG__ADDRESS", "http://env:8500");
            jail.set_env("BUS__CATALOG__DATACENTER", "dc2");

            let config = Configuration::load().map_err(|e| *e)?;
            assert_eq!(config.catalog.address, "http://env:8500");
            assert_eq!(config.catalog.datacenter.as_deref(), Some("dc2"));
            Ok(())
        });
    }

    #[test]
    fn test_consul_env_vars() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("BUS__CATALOG__ADDRESS", "http://bus-prefixed:8500");
            jail.set_env("CONSUL_HTTP_ADDR", "127.0.0.2:8500");
            jail.set_env("CONSUL_HTTP_TOKEN", "secret");

            let config = Configuration::load().map_err(|e| *e)?;
            assert_eq!(config.catalog.address, "127.0.0.2:8500");
            assert_eq!(config.catalog.token.as_deref(), Some("secret"));
            Ok(())
        });
    }

    #[test]
    fn test_defaults_when_environment_is_empty() {
        Jail::expect_with(|jail| {
            jail.clear_env();

            let config = Configuration::load().map_err(|e| *e)?;
            assert_eq!(config, Configuration::default());
            Ok(())
        });
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[[subscribe]]\nevent = \"payments.settled\"\nversion = 1\n").unwrap();

        let config = Configuration::load_from_path(&path).unwrap();
        assert_eq!(
            config.subscribe,
            vec![SubscriptionConfig {
                event: "payments.settled".into(),
                version: 1,
            }]
        );
    }
}
