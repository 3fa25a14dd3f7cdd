//! Device identity: MAC address and the device id derived from it.

use crate::config::AgentConfig;
use sysinfo::Networks;
use tracing::{info, warn};

/// How this device presents itself to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// `AA:BB:CC:DD:EE:FF`
    pub mac: String,
    /// `device-xxyyzz`, from the last three MAC octets
    pub device_id: String,
}

impl Identity {
    pub fn from_mac(mac: [u8; 6]) -> Self {
        Self {
            mac: format_mac(&mac),
            device_id: format!("device-{:02x}{:02x}{:02x}", mac[3], mac[4], mac[5]),
        }
    }

    /// Build the identity from configuration, discovering the MAC if needed.
    ///
    /// Configuration is assumed validated.
    pub fn resolve(config: &AgentConfig) -> Self {
        let mac = match config.mac.as_deref().and_then(parse_mac) {
            Some(mac) => mac,
            None => discover_mac().unwrap_or_else(|| {
                warn!("No hardware address found, announcing 00:00:00:00:00:00");
                [0; 6]
            }),
        };
        let mut identity = Self::from_mac(mac);
        if let Some(id) = &config.device_id {
            identity.device_id = id.clone();
        }
        info!("Device {} ({})", identity.device_id, identity.mac);
        identity
    }

    /// Server URL with the device id as the final path segment.
    pub fn endpoint(&self, server_url: &str) -> String {
        format!("{}/{}", server_url.trim_end_matches('/'), self.device_id)
    }
}

/// Parse `aa:bb:cc:dd:ee:ff` (or `-` separated), any case.
pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split([':', '-']);
    for octet in mac.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *octet = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// First non-loopback interface with a real hardware address, by name.
pub fn discover_mac() -> Option<[u8; 6]> {
    let networks = Networks::new_with_refreshed_list();
    let mut interfaces: Vec<_> = networks.list().iter().collect();
    interfaces.sort_by(|a, b| a.0.cmp(b.0));
    interfaces
        .into_iter()
        .filter(|(name, _)| !name.starts_with("lo"))
        .map(|(_, data)| data.mac_address().0)
        .find(|mac| *mac != [0; 6])
}
