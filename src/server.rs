//! Backend server registry.
//!
//! The server list is read-mostly: it is built from configuration at
//! startup and only its status bits change afterwards, always from the
//! main worker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::config::ServerConfig;

/// Server status bits.
pub mod status {
    /// The server refuses work until an operator intervenes.
    pub const MAINTENANCE: u32 = 0x01;
}

/// Persistent-pool settings for one server.
#[derive(Debug, Clone)]
pub struct PersistentPool {
    pub enabled: bool,
    pub size: usize,
    pub max_age: Duration,
}

/// One backend server.
#[derive(Debug)]
pub struct Server {
    pub name: String,
    /// Host name, IP address, or a Unix socket path starting with '/'.
    pub address: String,
    pub port: u16,
    pub proxy_protocol: bool,
    pub persistent_pool: PersistentPool,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    status: AtomicU32,
}

impl Server {
    pub fn from_config(cfg: &ServerConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            address: cfg.address.clone(),
            port: cfg.port,
            proxy_protocol: cfg.proxy_protocol,
            persistent_pool: PersistentPool {
                enabled: cfg.persistent_pool.enabled,
                size: cfg.persistent_pool.size,
                max_age: Duration::from_secs(cfg.persistent_pool.max_age_secs),
            },
            connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
            read_timeout: Duration::from_millis(cfg.read_timeout_ms),
            write_timeout: Duration::from_millis(cfg.write_timeout_ms),
            status: AtomicU32::new(0),
        }
    }

    pub fn is_unix_socket(&self) -> bool {
        self.address.starts_with('/')
    }

    /// Printable endpoint for logs.
    pub fn endpoint(&self) -> String {
        if self.is_unix_socket() {
            self.address.clone()
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    pub fn persistent_conns_enabled(&self) -> bool {
        self.persistent_pool.enabled && self.persistent_pool.size > 0
    }

    pub fn is_in_maintenance(&self) -> bool {
        self.status.load(Ordering::Acquire) & status::MAINTENANCE != 0
    }

    /// Set the maintenance bit. Returns true when this call set it, which
    /// makes the marking a one-shot for the caller.
    pub fn set_maintenance(&self) -> bool {
        let prev = self.status.fetch_or(status::MAINTENANCE, Ordering::AcqRel);
        prev & status::MAINTENANCE == 0
    }

    pub fn clear_maintenance(&self) {
        self.status
            .fetch_and(!status::MAINTENANCE, Ordering::AcqRel);
    }

    pub fn status_bits(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }
}

/// Read-mostly set of configured servers.
pub struct ServerRegistry {
    ordered: Vec<Arc<Server>>,
    by_name: DashMap<String, Arc<Server>>,
}

impl ServerRegistry {
    pub fn new(servers: Vec<Arc<Server>>) -> Self {
        let by_name = DashMap::new();
        for server in &servers {
            by_name.insert(server.name.clone(), server.clone());
        }
        Self {
            ordered: servers,
            by_name,
        }
    }

    pub fn from_configs(configs: &[ServerConfig]) -> Self {
        Self::new(
            configs
                .iter()
                .map(|c| Arc::new(Server::from_config(c)))
                .collect(),
        )
    }

    pub fn all(&self) -> &[Arc<Server>] {
        &self.ordered
    }

    pub fn get(&self, name: &str) -> Option<Arc<Server>> {
        self.by_name.get(name).map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn server(name: &str) -> Server {
        Server::from_config(&ServerConfig {
            name: name.to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_maintenance_marking_is_one_shot() {
        let s = server("db1");
        assert!(!s.is_in_maintenance());
        assert!(s.set_maintenance());
        assert!(!s.set_maintenance());
        assert!(s.is_in_maintenance());
        s.clear_maintenance();
        assert!(!s.is_in_maintenance());
    }

    #[test]
    fn test_unix_socket_detection() {
        let cfg = ServerConfig {
            address: "/run/mysqld/mysqld.sock".to_string(),
            ..Default::default()
        };
        let s = Server::from_config(&cfg);
        assert!(s.is_unix_socket());
        assert_eq!(s.endpoint(), "/run/mysqld/mysqld.sock");
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ServerRegistry::new(vec![Arc::new(server("a")), Arc::new(server("b"))]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("b").unwrap().name, "b");
        assert!(registry.get("c").is_none());
    }
}
