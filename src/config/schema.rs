use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    pub service: ServiceConfig,
    #[serde(default, rename = "server")]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Process-wide settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    /// Number of I/O workers.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Record statements per session for diagnostics.
    #[serde(default)]
    pub session_trace: bool,
    /// How many of the latest statements to retain per session.
    #[serde(default = "default_retain_last_statements")]
    pub retain_last_statements: usize,
    /// When to dump the retained statements to the log.
    #[serde(default)]
    pub dump_last_statements: DumpPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpPolicy {
    #[default]
    Never,
    OnClose,
    OnError,
}

fn default_threads() -> usize {
    4
}

fn default_retain_last_statements() -> usize {
    10
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            session_trace: false,
            retain_last_statements: default_retain_last_statements(),
            dump_last_statements: DumpPolicy::Never,
        }
    }
}

/// The listening service and the account it authenticates.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub enable_root: bool,
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    4006
}

/// One backend server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    /// Host name, IP address, or a Unix socket path starting with '/'.
    pub address: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default)]
    pub proxy_protocol: bool,
    #[serde(default)]
    pub persistent_pool: PersistentPoolConfig,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub write_timeout_ms: u64,
}

fn default_server_port() -> u16 {
    3306
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_io_timeout_ms() -> u64 {
    10_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "server1".to_string(),
            address: "127.0.0.1".to_string(),
            port: default_server_port(),
            proxy_protocol: false,
            persistent_pool: PersistentPoolConfig::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_io_timeout_ms(),
            write_timeout_ms: default_io_timeout_ms(),
        }
    }
}

/// Pooling of authenticated backend connections across sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistentPoolConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_pool_size")]
    pub size: usize,
    #[serde(default = "default_pool_max_age_secs")]
    pub max_age_secs: u64,
}

fn default_pool_size() -> usize {
    10
}

fn default_pool_max_age_secs() -> u64 {
    300
}

impl Default for PersistentPoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            size: default_pool_size(),
            max_age_secs: default_pool_max_age_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: String,
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9090".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_metrics_addr(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [service]
            user = "app"
            password = "secret"

            [[server]]
            name = "db1"
            address = "10.0.0.1"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.global.threads, 4);
        assert_eq!(cfg.service.listen_port, 4006);
        assert_eq!(cfg.servers.len(), 1);
        assert_eq!(cfg.servers[0].port, 3306);
        assert!(!cfg.servers[0].persistent_pool.enabled);
        assert_eq!(cfg.global.dump_last_statements, DumpPolicy::Never);
    }

    #[test]
    fn test_full_config_parses() {
        let cfg: Config = toml::from_str(
            r#"
            [global]
            threads = 8
            session_trace = true
            retain_last_statements = 32
            dump_last_statements = "on_error"

            [service]
            listen_addr = "0.0.0.0"
            listen_port = 3307
            user = "app"
            password = "secret"
            enable_root = true

            [[server]]
            name = "db1"
            address = "10.0.0.1"
            port = 3307
            proxy_protocol = true
            connect_timeout_ms = 500
            persistent_pool = { enabled = true, size = 4, max_age_secs = 60 }

            [[server]]
            name = "db2"
            address = "/run/mysqld/mysqld.sock"

            [metrics]
            enabled = true
            listen_addr = "127.0.0.1:9100"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.global.dump_last_statements, DumpPolicy::OnError);
        assert!(cfg.servers[0].proxy_protocol);
        assert!(cfg.servers[0].persistent_pool.enabled);
        assert_eq!(cfg.servers[0].persistent_pool.size, 4);
        assert!(cfg.servers[1].address.starts_with('/'));
        assert!(cfg.metrics.enabled);
    }
}
