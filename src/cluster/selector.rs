//! Address Selection
//!
//! Picks which of a master's addresses a proxied request goes to. No
//! health probing: a dead first address fails the request.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::AddressSelection;

/// Strategy for choosing one address out of a node's list
pub trait AddressSelector: Send + Sync {
    fn select(&self, addresses: &[String]) -> Option<String>;
}

/// Always the first address
#[derive(Debug, Default)]
pub struct FirstAddress;

impl AddressSelector for FirstAddress {
    fn select(&self, addresses: &[String]) -> Option<String> {
        addresses.first().cloned()
    }
}

/// Rotate through the addresses on every call
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl AddressSelector for RoundRobin {
    fn select(&self, addresses: &[String]) -> Option<String> {
        if addresses.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % addresses.len();
        addresses.get(idx).cloned()
    }
}

/// Build the selector named in configuration
pub fn from_config(selection: AddressSelection) -> Box<dyn AddressSelector> {
    match selection {
        AddressSelection::First => Box::new(FirstAddress),
        AddressSelection::RoundRobin => Box::new(RoundRobin::default()),
    }
}

/// Base URL for a peer address, adding `port` when the address has none
pub fn peer_url(address: &str, port: u16) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        return address.trim_end_matches('/').to_string();
    }
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return format!("http://{}", addr);
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return format!("http://{}", SocketAddr::new(ip, port));
    }
    match address.rsplit_once(':') {
        Some((_, p)) if p.parse::<u16>().is_ok() => format!("http://{}", address),
        _ => format!("http://{}:{}", address, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> Vec<String> {
        vec!["10.0.0.1".into(), "10.0.0.2".into(), "10.0.0.3".into()]
    }

    #[test]
    fn test_first_address() {
        assert_eq!(FirstAddress.select(&addrs()).as_deref(), Some("10.0.0.1"));
        assert_eq!(FirstAddress.select(&addrs()).as_deref(), Some("10.0.0.1"));
        assert_eq!(FirstAddress.select(&[]), None);
    }

    #[test]
    fn test_round_robin_rotates() {
        let rr = RoundRobin::default();
        let picked: Vec<String> = (0..4).filter_map(|_| rr.select(&addrs())).collect();
        assert_eq!(picked, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.1"]);
        assert_eq!(rr.select(&[]), None);
    }

    #[test]
    fn test_peer_url() {
        assert_eq!(peer_url("10.0.0.1", 32607), "http://10.0.0.1:32607");
        assert_eq!(peer_url("10.0.0.1:9000", 32607), "http://10.0.0.1:9000");
        assert_eq!(peer_url("fd00::2", 32607), "http://[fd00::2]:32607");
        assert_eq!(peer_url("node-2.local", 32607), "http://node-2.local:32607");
        assert_eq!(peer_url("node-2.local:80", 32607), "http://node-2.local:80");
        assert_eq!(peer_url("http://127.0.0.1:4000/", 32607), "http://127.0.0.1:4000");
    }
}
