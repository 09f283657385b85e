//! Peer record advertised by a server during LAN discovery.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A discovered server's advertised address and metadata.
///
/// This is the JSON payload a discovery responder sends back to a probe:
///
/// ```text
/// {"Name":"study-pc","Ip":"192.168.1.42","Port":5000,"Version":"0.1.0","Timestamp":"..."}
/// ```
///
/// `Name`, `Version`, and `Timestamp` are optional on the wire so that a
/// minimal `{"Ip":...,"Port":...}` reply still parses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Human-readable server name.
    #[serde(rename = "Name", default = "default_name")]
    pub name: String,
    /// IPv4 (or IPv6) address the server is reachable on.
    #[serde(rename = "Ip")]
    pub ip: IpAddr,
    /// TCP port the server listens on.
    #[serde(rename = "Port")]
    pub port: u16,
    /// Server software version, when advertised.
    #[serde(rename = "Version", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// When the record was produced (responder side) or received (prober side).
    #[serde(rename = "Timestamp", default = "Utc::now")]
    pub discovered_at: DateTime<Utc>,
}

fn default_name() -> String {
    "Unknown Server".to_string()
}

impl PeerRecord {
    /// The TCP address to dial for this peer.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}:{}", self.name, self.ip, self.port)?;
        if let Some(version) = &self.version {
            write!(f, " (v{version})")?;
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_record_parses_from_wire_json() {
        let json = r#"{"Name":"study-pc","Ip":"192.168.1.42","Port":5000,"Version":"0.1.0","Timestamp":"2026-08-26T09:00:00Z"}"#;

        let record: PeerRecord = serde_json::from_str(json).unwrap();

        assert_eq!(record.name, "study-pc");
        assert_eq!(record.addr(), "192.168.1.42:5000".parse().unwrap());
        assert_eq!(record.version.as_deref(), Some("0.1.0"));
    }

    #[test]
    fn test_minimal_record_gets_defaults() {
        let record: PeerRecord =
            serde_json::from_str(r#"{"Ip":"10.0.0.7","Port":4242}"#).unwrap();

        assert_eq!(record.name, "Unknown Server");
        assert_eq!(record.version, None);
    }

    #[test]
    fn test_serialized_record_uses_wire_field_names() {
        let record = PeerRecord {
            name: "s".to_string(),
            ip: "127.0.0.1".parse().unwrap(),
            port: 1,
            version: None,
            discovered_at: Utc::now(),
        };

        let json = serde_json::to_string(&record).unwrap();

        assert!(json.contains("\"Name\""));
        assert!(json.contains("\"Ip\":\"127.0.0.1\""));
        assert!(json.contains("\"Port\":1"));
        assert!(!json.contains("\"Version\""));
    }

    #[test]
    fn test_display_includes_version_when_present() {
        let record = PeerRecord {
            name: "study-pc".to_string(),
            ip: "192.168.1.42".parse().unwrap(),
            port: 5000,
            version: Some("0.1.0".to_string()),
            discovered_at: Utc::now(),
        };

        assert_eq!(record.to_string(), "study-pc @ 192.168.1.42:5000 (v0.1.0)");
    }
}
