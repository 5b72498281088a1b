//! Host name resolution and locality checks.
//!
//! The orchestrator never talks to the OS resolver directly; it goes through
//! an [`AddressResolver`] so hosts can supply their own lookup rules.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

use socket2::{Domain, Protocol, Socket, Type};

/// Resolves host names to IPv4 addresses and decides which addresses belong
/// to this host.
pub trait AddressResolver: Send + Sync {
    /// Returns the first IPv4 address `host` resolves to.
    fn resolve_ipv4(&self, host: &str) -> Option<Ipv4Addr>;

    /// Returns true if `addr` is assigned to this host.
    fn is_local(&self, addr: Ipv4Addr) -> bool;
}

/// Resolver backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl SystemResolver {
    /// Creates a new system resolver.
    pub fn new() -> Self {
        Self
    }
}

impl AddressResolver for SystemResolver {
    fn resolve_ipv4(&self, host: &str) -> Option<Ipv4Addr> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Some(ip);
        }

        match (host, 0).to_socket_addrs() {
            Ok(addrs) => addrs.into_iter().find_map(|addr| match addr.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            }),
            Err(e) => {
                tracing::debug!("Failed to resolve {}: {}", host, e);
                None
            }
        }
    }

    /// An address is local when an ephemeral socket can bind to it.
    fn is_local(&self, addr: Ipv4Addr) -> bool {
        if addr.is_loopback() || addr.is_unspecified() {
            return true;
        }

        let socket = match Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)) {
            Ok(socket) => socket,
            Err(e) => {
                tracing::warn!("Failed to create locality check socket: {}", e);
                return false;
            }
        };

        let target = SocketAddr::V4(SocketAddrV4::new(addr, 0));
        socket.bind(&target.into()).is_ok()
    }
}

/// Resolver with a fixed host table, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Ipv4Addr>,
    local: HashSet<Ipv4Addr>,
}

impl StaticResolver {
    /// Creates an empty resolver. Loopback is always local.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a host name to an address.
    pub fn with_host(mut self, host: impl Into<String>, addr: Ipv4Addr) -> Self {
        self.hosts.insert(host.into(), addr);
        self
    }

    /// Declares an address as belonging to this host.
    pub fn with_local(mut self, addr: Ipv4Addr) -> Self {
        self.local.insert(addr);
        self
    }
}

impl AddressResolver for StaticResolver {
    fn resolve_ipv4(&self, host: &str) -> Option<Ipv4Addr> {
        self.hosts
            .get(host)
            .copied()
            .or_else(|| host.parse::<Ipv4Addr>().ok())
    }

    fn is_local(&self, addr: Ipv4Addr) -> bool {
        addr.is_loopback() || self.local.contains(&addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_resolver_parses_literals() {
        let resolver = SystemResolver::new();
        assert_eq!(
            resolver.resolve_ipv4("10.1.2.3"),
            Some(Ipv4Addr::new(10, 1, 2, 3))
        );
    }

    #[test]
    fn system_resolver_resolves_localhost_to_ipv4() {
        let resolver = SystemResolver::new();
        let ip = resolver.resolve_ipv4("localhost").unwrap();
        assert!(ip.is_loopback());
    }

    #[test]
    fn system_resolver_rejects_garbage() {
        let resolver = SystemResolver::new();
        assert!(resolver.resolve_ipv4("no such host.invalid").is_none());
    }

    #[test]
    fn loopback_is_local() {
        let resolver = SystemResolver::new();
        assert!(resolver.is_local(Ipv4Addr::LOCALHOST));
        assert!(resolver.is_local(Ipv4Addr::new(127, 0, 0, 2)));
    }

    #[test]
    fn public_address_is_not_local() {
        let resolver = SystemResolver::new();
        assert!(!resolver.is_local(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn static_resolver_table() {
        let resolver = StaticResolver::new()
            .with_host("sim", Ipv4Addr::new(192, 168, 1, 20))
            .with_local(Ipv4Addr::new(192, 168, 1, 5));

        assert_eq!(
            resolver.resolve_ipv4("sim"),
            Some(Ipv4Addr::new(192, 168, 1, 20))
        );
        assert!(resolver.resolve_ipv4("unknown").is_none());
        assert!(resolver.is_local(Ipv4Addr::new(192, 168, 1, 5)));
        assert!(resolver.is_local(Ipv4Addr::LOCALHOST));
        assert!(!resolver.is_local(Ipv4Addr::new(192, 168, 1, 20)));
    }
}
