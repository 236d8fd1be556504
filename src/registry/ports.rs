//! Dynamic port allocation by trial bind

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Mutex;

use rand::Rng;

use crate::{Error, Result};

/// Lowest port handed out by default
pub const DEFAULT_PORT_START: u16 = 5000;

/// Highest port handed out by default
pub const DEFAULT_PORT_END: u16 = 65535;

/// Finds unused local ports
///
/// Allocation is advisory: the port is free at the moment of the trial bind
/// and is released immediately. Ports already handed out by this allocator
/// are never returned again.
#[derive(Debug, Default)]
pub struct PortAllocator {
    issued: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a port in the default range
    ///
    /// Trial binds block the calling thread; async callers run this on the
    /// blocking pool.
    ///
    /// # Errors
    ///
    /// Returns `PortExhaustion` if no port can be bound
    pub fn allocate(&self, host: &str) -> Result<u16> {
        self.allocate_in(host, DEFAULT_PORT_START, DEFAULT_PORT_END)
    }

    /// Allocate a port in `[start, end]`
    ///
    /// Starts at a random port and probes upward, wrapping to `start` once
    /// the end of the range is reached.
    ///
    /// # Errors
    ///
    /// Returns `PortExhaustion` if no port in the range can be bound, and a
    /// validation error for an empty range
    pub fn allocate_in(&self, host: &str, start: u16, end: u16) -> Result<u16> {
        if start > end {
            return Err(Error::Validation(format!("invalid port range {start}-{end}")));
        }

        let span = u32::from(end) - u32::from(start) + 1;
        let offset = rand::thread_rng().gen_range(0..span);

        let mut issued = self
            .issued
            .lock()
            .map_err(|_| Error::Config("port allocator lock poisoned".to_string()))?;

        for step in 0..span {
            let candidate = u32::from(start) + (offset + step) % span;
            let Ok(port) = u16::try_from(candidate) else {
                continue;
            };
            if issued.contains(&port) {
                continue;
            }
            if TcpListener::bind((host, port)).is_ok() {
                issued.insert(port);
                tracing::debug!(host, port, "allocated port");
                return Ok(port);
            }
        }

        Err(Error::PortExhaustion { start, end })
    }
}

/// Host part of a server URL, defaulting to loopback
#[must_use]
pub fn host_from_url(server_url: &str) -> String {
    url::Url::parse(server_url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_matches(['[', ']']).to_string()))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_ports_are_unique_and_free() {
        let allocator = PortAllocator::new();
        let mut seen = HashSet::new();
        for _ in 0..5 {
            let port = allocator.allocate_in("127.0.0.1", 40000, 40100).unwrap();
            assert!((40000..=40100).contains(&port));
            assert!(seen.insert(port), "port {port} handed out twice");
            assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
        }
    }

    #[test]
    fn occupied_single_port_range_exhausts() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let err = PortAllocator::new()
            .allocate_in("127.0.0.1", port, port)
            .unwrap_err();
        assert!(matches!(err, Error::PortExhaustion { .. }));
    }

    #[test]
    fn issued_port_is_not_repeated() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let allocator = PortAllocator::new();
        assert_eq!(allocator.allocate_in("127.0.0.1", port, port).unwrap(), port);
        assert!(allocator.allocate_in("127.0.0.1", port, port).is_err());
    }

    #[test]
    fn concurrent_allocations_are_distinct() {
        let allocator = PortAllocator::new();
        let ports: Vec<u16> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| allocator.allocate_in("127.0.0.1", 41000, 41015)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap().unwrap())
                .collect()
        });

        let unique: HashSet<u16> = ports.iter().copied().collect();
        assert_eq!(unique.len(), ports.len(), "duplicate ports in {ports:?}");
        assert!(ports.iter().all(|p| (41000..=41015).contains(p)));
    }

    #[test]
    fn host_is_extracted_from_url() {
        assert_eq!(host_from_url("http://10.1.2.3"), "10.1.2.3");
        assert_eq!(host_from_url("http://[::1]:80"), "::1");
        assert_eq!(host_from_url("not a url"), "127.0.0.1");
    }
}
