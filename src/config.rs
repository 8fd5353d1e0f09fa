//! Configuration loading and types for stackgate.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct. Every section is optional; a missing section takes
//! its defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP listener and URL layout.
    #[serde(default)]
    pub server: ServerConfig,

    /// CloudStack management server.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Server-side secrets.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Basic-auth session cache.
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// OAuth bearer tokens.
    #[serde(default)]
    pub tokens: TokensConfig,

    /// Async job polling.
    #[serde(default)]
    pub jobs: JobsConfig,

    /// CA certificate distribution.
    #[serde(default)]
    pub pki: PkiConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Prefix of the façade REST API.
    #[serde(default = "default_api_path")]
    pub api_path: String,

    /// Prefix of the SSO (OAuth) endpoints.
    #[serde(default = "default_sso_path")]
    pub sso_path: String,

    /// Prefix of unauthenticated services such as PKI distribution.
    #[serde(default = "default_services_path")]
    pub services_path: String,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_path: default_api_path(),
            sso_path: default_sso_path(),
            services_path: default_services_path(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn logout_path(&self) -> String {
        format!("{}/logout", self.api_path.trim_end_matches('/'))
    }

    pub fn oauth_token_path(&self) -> String {
        format!("{}/oauth/token", self.sso_path.trim_end_matches('/'))
    }

    pub fn oauth_revoke_path(&self) -> String {
        format!("{}/oauth/revoke", self.sso_path.trim_end_matches('/'))
    }

    pub fn pki_resource_path(&self) -> String {
        format!("{}/pki-resource", self.services_path.trim_end_matches('/'))
    }
}

/// CloudStack API endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Full URL of the CloudStack API, e.g. `https://cs.example.com/client/api`.
    #[serde(default = "default_backend_endpoint")]
    pub endpoint: String,

    /// Verify the backend's TLS certificate. Off by default.
    #[serde(default)]
    pub verify_tls: bool,

    /// Per-request timeout in seconds.
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: default_backend_endpoint(),
            verify_tls: false,
            timeout_secs: default_backend_timeout(),
        }
    }
}

/// Security settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    /// Key for credential fingerprints. Empty means generate one at startup.
    #[serde(default)]
    pub hmac_secret: String,
}

/// Session cache settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    /// Lifetime of a cached session in seconds (0 = until logout).
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,

    /// Interval of the expiry sweep in seconds (0 = disabled).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl SessionsConfig {
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

/// Bearer token settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TokensConfig {
    /// Token lifetime in seconds.
    #[serde(default = "default_token_expiry")]
    pub expiry_secs: u64,

    /// Scope reported when the client requests none.
    #[serde(default = "default_scope")]
    pub default_scope: String,
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            expiry_secs: default_token_expiry(),
            default_scope: default_scope(),
        }
    }
}

/// Async job polling settings.
#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    /// Delay between `queryAsyncJobResult` polls in milliseconds. `0` is
    /// treated as 1.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Total wait budget in seconds.
    #[serde(default = "default_job_timeout")]
    pub timeout_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            timeout_secs: default_job_timeout(),
        }
    }
}

/// PKI resource settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PkiConfig {
    /// PEM file served as the engine CA certificate.
    #[serde(default)]
    pub ca_cert_file: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8443
}

fn default_api_path() -> String {
    "/ovirt-engine/api".to_string()
}

fn default_sso_path() -> String {
    "/ovirt-engine/sso".to_string()
}

fn default_services_path() -> String {
    "/ovirt-engine/services".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_backend_endpoint() -> String {
    "http://localhost:8080/client/api".to_string()
}

fn default_backend_timeout() -> u64 {
    60
}

fn default_session_ttl() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_token_expiry() -> u64 {
    86_400
}

fn default_scope() -> String {
    "ovirt-engine-api".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_job_timeout() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}
