//! Event identity and publisher addresses as seen by the event bus.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Name of a logical event type, e.g. `orders.created`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventName(String);

impl EventName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for EventName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Schema version of an event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventVersion(pub u32);

impl fmt::Display for EventVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for EventVersion {
    fn from(version: u32) -> Self {
        Self(version)
    }
}

/// The discovery key: an event name together with its version.
///
/// Publishers and subscribers find each other through the catalog tag derived
/// from this key, which is compared as an exact string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    name: EventName,
    version: EventVersion,
}

impl EventKey {
    /// Rejects names that are empty or only whitespace.
    pub fn new(name: &EventName, version: EventVersion) -> Result<Self, RegistryError> {
        if name.as_str().trim().is_empty() {
            return Err(RegistryError::InvalidEventKey(
                "event name cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            name: name.clone(),
            version,
        })
    }

    pub fn name(&self) -> &EventName {
        &self.name
    }

    pub fn version(&self) -> EventVersion {
        self.version
    }

    /// Catalog tag in the form `<name>:v<version>`.
    pub fn tag(&self) -> String {
        format!("{}:v{}", self.name, self.version)
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// Network address of one reachable publisher, `tcp://<host>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublisherEndpoint(String);

impl PublisherEndpoint {
    pub fn tcp(host: &str, port: u16) -> Self {
        Self(format!("tcp://{host}:{port}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublisherEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PublisherEndpoint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_format() {
        let key = EventKey::new(&EventName::from("orders.created"), EventVersion(3)).unwrap();
        assert_eq!(key.tag(), "orders.created:v3");
        assert_eq!(key.to_string(), "orders.created:v3");
    }

    #[test]
    fn test_empty_event_name_rejected() {
        for name in ["", "   "] {
            let result = EventKey::new(&EventName::from(name), EventVersion(1));
            assert!(matches!(result, Err(RegistryError::InvalidEventKey(_))));
        }
    }

    #[test]
    fn test_endpoint_format() {
        assert_eq!(
            PublisherEndpoint::tcp("10.0.0.1", 7000).as_str(),
            "tcp://10.0.0.1:7000"
        );
        assert_eq!(
            PublisherEndpoint::tcp("publisher.local", 80).to_string(),
            "tcp://publisher.local:80"
        );
    }
}
