use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix shared by every instance registered under the bus service.
const SERVICE_ID_PREFIX: &str = "bus";

/// Catalog instance identifier derived from the advertised host and port.
///
/// The id is `bus-<host>-<port>` with every run of characters outside
/// `[0-9A-Za-z-]` collapsed to a single `-`. The same address always maps to
/// the same id, so a restarted process re-registers over its previous entry.
/// Distinct hosts can collide when they only differ in replaced characters
/// (`10.0.0.1` and `10-0-0-1`); this is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn generate(host: &str, port: u16) -> Self {
        let raw = format!("{SERVICE_ID_PREFIX}-{host}-{port}");
        Self(normalize(&raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-'
}

fn normalize(raw: &str) -> String {
    let mut normalized = String::with_capacity(raw.len());
    let mut in_forbidden_run = false;
    for c in raw.chars() {
        if is_allowed(c) {
            normalized.push(c);
            in_forbidden_run = false;
        } else if !in_forbidden_run {
            normalized.push('-');
            in_forbidden_run = true;
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_host() {
        assert_eq!(ServiceId::generate("10.0.0.1", 7000).as_str(), "bus-10-0-0-1-7000");
    }

    #[test]
    fn test_hostname_is_kept() {
        assert_eq!(
            ServiceId::generate("publisher-a", 80).as_str(),
            "bus-publisher-a-80"
        );
    }

    #[test]
    fn test_forbidden_runs_collapse() {
        assert_eq!(ServiceId::generate("fe80::1", 8080).as_str(), "bus-fe80-1-8080");
        assert_eq!(ServiceId::generate("[::1]", 9000).as_str(), "bus--1--9000");
        assert_eq!(ServiceId::generate("höst_näme", 1).as_str(), "bus-h-st-n-me-1");
    }

    #[test]
    fn test_deterministic_and_restricted_alphabet() {
        let hosts = ["10.0.0.1", "example.org", "fe80::1%eth0", "host name", "", "ünï/cødé"];
        for host in hosts {
            for port in [0, 1, 8080, u16::MAX] {
                let first = ServiceId::generate(host, port);
                let second = ServiceId::generate(host, port);
                assert_eq!(first, second);
                assert!(first.as_str().chars().all(is_allowed), "{first}");
            }
        }
    }

    #[test]
    fn test_distinct_ports_do_not_collide() {
        assert_ne!(
            ServiceId::generate("10.0.0.1", 7000),
            ServiceId::generate("10.0.0.1", 7001)
        );
    }

    #[test]
    fn test_known_collision_between_normalized_hosts() {
        // Both hosts normalize to the same id; registering both would overwrite.
        let dotted = ServiceId::generate("10.0.0.1", 7000);
        let dashed = ServiceId::generate("10-0-0-1", 7000);
        assert_eq!(dotted, dashed);
    }
}
