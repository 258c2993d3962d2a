use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

/// Port the unit serves its pull channel on when none is configured.
pub const DEFAULT_UNIT_PORT: u16 = 80;

#[derive(Error, Debug)]
pub enum AddressError {
    #[error("A hostname or IP address is required")]
    MissingHost,
}

#[derive(Error, Debug)]
pub enum LocatorError {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("Lookup failed: {0}")]
    Lookup(String),
}

/// Network location of the station unit. Built either from fixed
/// configuration or from a discovered service record; the resolver is
/// the only writer once the engine is running.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitAddress {
    pub host_name: String,
    pub port: u16,
    pub addr_v4: Vec<Ipv4Addr>,
    pub addr_v6: Vec<Ipv6Addr>,
}

impl UnitAddress {
    /// Builds an address from fixed configuration. An empty hostname is
    /// rejected; port 0 falls back to [`DEFAULT_UNIT_PORT`]. IP literals
    /// are sorted into the matching address list.
    pub fn fixed(host: &str, port: u16) -> Result<Self, AddressError> {
        if host.is_empty() {
            return Err(AddressError::MissingHost);
        }
        let port = if port == 0 { DEFAULT_UNIT_PORT } else { port };
        let mut unit = UnitAddress {
            host_name: host.to_string(),
            port,
            ..Default::default()
        };
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => unit.addr_v4.push(v4),
            Ok(IpAddr::V6(v6)) => unit.addr_v6.push(v6),
            Err(_) => {}
        }
        Ok(unit)
    }

    /// HTTP base URL for the unit, preferring an IPv6 literal
    /// (bracketed), then IPv4, then the bare hostname.
    pub fn base_url(&self) -> String {
        if let Some(v6) = self.addr_v6.first() {
            return format!("http://[{v6}]:{}", self.port);
        }
        if let Some(v4) = self.addr_v4.first() {
            return format!("http://{v4}:{}", self.port);
        }
        format!("http://{}:{}", self.host_name, self.port)
    }
}

/// A single service instance found on the local network.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub instance: String,
    pub host_name: String,
    pub port: u16,
    pub addr_v4: Vec<Ipv4Addr>,
    pub addr_v6: Vec<Ipv6Addr>,
    /// Advertised record lifetime in seconds.
    pub ttl: u32,
}

impl From<&ServiceRecord> for UnitAddress {
    fn from(record: &ServiceRecord) -> Self {
        UnitAddress {
            host_name: record.host_name.clone(),
            port: record.port,
            addr_v4: record.addr_v4.clone(),
            addr_v6: record.addr_v6.clone(),
        }
    }
}

/// Service lookup parameters handed to the [`Locator`].
#[derive(Debug, Clone)]
pub struct LookupQuery {
    pub instance: String,
    pub service: String,
    pub domain: String,
}

impl Default for LookupQuery {
    fn default() -> Self {
        Self {
            instance: "_weatherlinklive".to_string(),
            service: "_tcp.".to_string(),
            domain: "local.".to_string(),
        }
    }
}

/// Local-network service discovery collaborator. Implementations browse
/// for instances matching the query and stream every record found into
/// `results` until their own deadline elapses or the receiver is
/// dropped; the resolver applies the instance-match rule and its own
/// discovery deadline on top.
#[async_trait]
pub trait Locator: Send + Sync {
    async fn lookup(
        &self,
        query: &LookupQuery,
        results: UnboundedSender<ServiceRecord>,
    ) -> Result<(), LocatorError>;
}
