use crate::middleware::MiddlewareSpec;
use crate::pool::PoolConfig;
use anyhow::Context;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file used when neither an argument nor `CONFIG_PATH` is given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/svcgate/svcgate.toml";

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub logger: LoggerConfig,

    #[serde(default)]
    pub listener: ListenerConfig,

    /// Routed services, each serving one or more hostnames
    #[serde(default)]
    pub services: Vec<ServiceEntry>,

    #[serde(default)]
    pub autocert: AutocertConfig,
}

/// Log output format
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Minimum level of emitted log records
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggerConfig {
    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// Plaintext listener, also answers ACME HTTP-01 challenges
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    #[serde(default = "default_https_addr")]
    pub https_addr: String,

    /// Metrics and health listener; empty disables it
    #[serde(default = "default_debug_addr")]
    pub debug_addr: String,

    /// Middleware wrapped around the router, first entry outermost
    #[serde(default)]
    pub middlewares: Vec<MiddlewareSpec>,

    #[serde(default)]
    pub backend: BackendPoolConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            https_addr: default_https_addr(),
            debug_addr: default_debug_addr(),
            middlewares: Vec::new(),
            backend: BackendPoolConfig::default(),
        }
    }
}

impl ListenerConfig {
    pub fn http_socket(&self) -> anyhow::Result<SocketAddr> {
        parse_listen_addr(&self.http_addr).context("invalid listener.http_addr")
    }

    pub fn https_socket(&self) -> anyhow::Result<SocketAddr> {
        parse_listen_addr(&self.https_addr).context("invalid listener.https_addr")
    }

    pub fn debug_socket(&self) -> anyhow::Result<Option<SocketAddr>> {
        if self.debug_addr.is_empty() {
            return Ok(None);
        }
        parse_listen_addr(&self.debug_addr)
            .map(Some)
            .context("invalid listener.debug_addr")
    }
}

/// Transport settings for connections to backends
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct BackendPoolConfig {
    /// Max time to wait for a backend response head
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for BackendPoolConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl BackendPoolConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

/// One `[[services]]` table as read from the file.
///
/// A service that does not parse is kept as [`ServiceEntry::Invalid`] so the
/// rest of the file still loads; the router skips it with a warning.
#[derive(Debug, Clone)]
pub enum ServiceEntry {
    Valid(ServiceConfig),
    Invalid { fqdn: Vec<String>, reason: String },
}

impl ServiceEntry {
    pub fn config(&self) -> Option<&ServiceConfig> {
        match self {
            ServiceEntry::Valid(service) => Some(service),
            ServiceEntry::Invalid { .. } => None,
        }
    }
}

impl<'de> Deserialize<'de> for ServiceEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = toml::Value::deserialize(deserializer)?;
        match value.clone().try_into::<ServiceConfig>() {
            Ok(service) => Ok(ServiceEntry::Valid(service)),
            Err(e) => Ok(ServiceEntry::Invalid {
                fqdn: declared_fqdn(&value),
                reason: e.message().to_string(),
            }),
        }
    }
}

/// Hostnames of a service table that failed to parse, as far as they can be read
fn declared_fqdn(value: &toml::Value) -> Vec<String> {
    value
        .get("frontend")
        .and_then(|frontend| frontend.get("fqdn"))
        .and_then(toml::Value::as_array)
        .map(|hosts| hosts.iter().filter_map(|h| h.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

/// A parsed `[[services]]` entry
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub frontend: FrontendConfig,
    pub backend: ServiceBackendConfig,
    #[serde(default)]
    pub authentication: AuthenticationConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct FrontendConfig {
    /// Hostnames served by this service
    pub fqdn: Vec<String>,

    /// Plaintext policy: `proxy`, `redirect` or `reject`
    #[serde(default)]
    pub http_handler: String,

    /// Headers set on every response of this service
    #[serde(default)]
    pub response_headers: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ServiceBackendConfig {
    pub url: String,

    /// Headers set on every request forwarded to the backend
    #[serde(default)]
    pub request_headers: HashMap<String, String>,

    /// Send the backend's own authority as Host
    #[serde(default)]
    pub rewrite_host: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct AuthenticationConfig {
    /// Empty or `NoAuth` disables authentication
    #[serde(default)]
    pub method: String,

    #[serde(default)]
    pub options: HashMap<String, String>,
}

/// ACME certificate settings
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct AutocertConfig {
    /// Contact email for the ACME account
    pub email: Option<String>,

    #[serde(default = "default_directory_url")]
    pub directory_url: String,

    /// Renew when the certificate expires within this many days
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u64,

    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for AutocertConfig {
    fn default() -> Self {
        Self {
            email: None,
            directory_url: default_directory_url(),
            renew_before_days: default_renew_before_days(),
            cache: CacheConfig::default(),
        }
    }
}

/// `[autocert.cache]`: backend tag plus its options
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    pub backend: String,

    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: "dir".to_string(),
            options: HashMap::from([("path".to_string(), "./autocert_cache".to_string())]),
        }
    }
}

fn default_http_addr() -> String {
    "0.0.0.0:80".to_string()
}

fn default_https_addr() -> String {
    "0.0.0.0:443".to_string()
}

fn default_debug_addr() -> String {
    "127.0.0.1:8081".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_pool_max_idle_per_host() -> usize {
    100
}

fn default_pool_idle_timeout() -> u64 {
    10
}

fn default_directory_url() -> String {
    LETS_ENCRYPT_DIRECTORY.to_string()
}

fn default_renew_before_days() -> u64 {
    30
}

/// Parse a listen address; a bare `:port` binds every IPv4 interface
pub fn parse_listen_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    full.parse()
        .with_context(|| format!("{:?} is not a socket address", addr))
}

/// Config path from the first CLI argument, then `CONFIG_PATH`, then the default
pub fn resolve_config_path(arg: Option<String>, env: Option<String>) -> PathBuf {
    arg.or(env)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("cannot parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the global shape. Per-service problems are reported while building routes.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for (name, addr) in [
            ("http_addr", &self.listener.http_addr),
            ("https_addr", &self.listener.https_addr),
        ] {
            if let Err(e) = parse_listen_addr(addr) {
                errors.push(format!("listener.{}: {:#}", name, e));
            }
        }
        if let Err(e) = self.listener.debug_socket() {
            errors.push(format!("{:#}", e));
        }
        if self.listener.backend.request_timeout_secs == 0 {
            errors.push("listener.backend.request_timeout_secs must be greater than 0".to_string());
        }
        if self.autocert.cache.backend.is_empty() {
            errors.push("autocert.cache.backend is required".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
