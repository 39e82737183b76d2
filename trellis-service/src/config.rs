//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Environment variables (prefix: TRELLIS_)
//! 2. Current working directory: ./trellis.toml
//! 3. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,

    /// Reverse proxy configuration
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Channel layer configuration
    #[serde(default)]
    pub channels: ChannelSettings,

    /// Task worker configuration
    #[serde(default)]
    pub worker: WorkerSettings,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthSettings,

    /// Database configuration (optional)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,

    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Graceful shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Environment (dev, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Reverse proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Total request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Idle timeout between response chunks in milliseconds
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Forward the incoming Host header instead of the upstream authority
    #[serde(default = "default_false")]
    pub preserve_host_header: bool,

    /// Add X-Forwarded-For / X-Forwarded-Proto / X-Forwarded-Host
    #[serde(default = "default_true")]
    pub add_forwarded_headers: bool,

    /// Request headers stripped before forwarding (besides hop-by-hop)
    #[serde(default)]
    pub remove_request_headers: Vec<String>,

    /// Response headers stripped before returning (besides hop-by-hop)
    #[serde(default)]
    pub remove_response_headers: Vec<String>,

    /// Headers appended to every proxied response
    #[serde(default)]
    pub additional_response_headers: Vec<(String, String)>,

    /// Reject request bodies larger than this many bytes
    #[serde(default)]
    pub max_body_bytes: Option<u64>,

    /// Circuit breaker settings, applied per upstream host
    #[serde(default)]
    pub breaker: BreakerSettings,
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Failures inside the window that trip the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,

    /// Milliseconds an open breaker waits before probing
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Successes in half-open state that close the breaker
    #[serde(default = "default_success_threshold")]
    pub success_threshold: usize,

    /// Maximum outcomes retained per sliding-window deque
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Sliding window duration in milliseconds
    #[serde(default = "default_window_duration_ms")]
    pub window_duration_ms: u64,
}

/// Channel layer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Per-session outbound queue capacity
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
}

/// Task worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Queues this worker polls
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,

    /// Maximum in-flight task handlers
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Idle sleep between empty polls in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Interval between scheduled-task promotion sweeps in milliseconds
    #[serde(default = "default_schedule_check_interval_ms")]
    pub schedule_check_interval_ms: u64,

    /// Interval between stale-task recovery sweeps in milliseconds
    #[serde(default = "default_stale_check_interval_ms")]
    pub stale_check_interval_ms: u64,

    /// Age after which a PROCESSING task is considered abandoned, in seconds
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,

    /// Base retry delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Exponential backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Retry delay ceiling in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Randomize retry delays by uniform [0.5, 1.0]
    #[serde(default = "default_true")]
    pub use_jitter: bool,

    /// Default retry budget for tasks enqueued without one
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Default per-task execution timeout in milliseconds
    #[serde(default = "default_task_timeout_ms")]
    pub default_timeout_ms: u64,
}

/// Authentication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    /// HMAC secret for HS256 tokens
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,

    /// Issuer claim stamped on generated tokens and required on verification
    #[serde(default)]
    pub jwt_issuer: Option<String>,

    /// Access token lifetime in seconds
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    /// Argon2 memory cost in KiB
    #[serde(default = "default_memory_cost")]
    pub password_memory_cost_kib: u32,

    /// Argon2 iteration count
    #[serde(default = "default_time_cost")]
    pub password_time_cost: u32,

    /// Argon2 lane count
    #[serde(default = "default_parallelism")]
    pub password_parallelism: u32,

    /// Minimum accepted password length
    #[serde(default = "default_min_password_length")]
    pub min_password_length: usize,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum idle connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
}

impl Config {
    /// Load configuration from all sources
    ///
    /// Environment variables (TRELLIS_ prefix, `__` nesting separator)
    /// override the `./trellis.toml` file, which overrides defaults.
    pub fn load() -> Result<Self> {
        Self::load_from("trellis.toml")
    }

    /// Load configuration from a specific file
    ///
    /// Useful for testing or non-standard deployments.
    pub fn load_from(path: &str) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("TRELLIS_").split("__"))
            .extract()?;

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "trellis-service".to_string(),
                host: default_host(),
                port: default_port(),
                log_level: default_log_level(),
                shutdown_timeout_secs: default_shutdown_timeout(),
                environment: default_environment(),
            },
            proxy: ProxySettings::default(),
            channels: ChannelSettings::default(),
            worker: WorkerSettings::default(),
            auth: AuthSettings::default(),
            database: None,
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            preserve_host_header: false,
            add_forwarded_headers: true,
            remove_request_headers: Vec::new(),
            remove_response_headers: Vec::new(),
            additional_response_headers: Vec::new(),
            max_body_bytes: None,
            breaker: BreakerSettings::default(),
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            success_threshold: default_success_threshold(),
            window_size: default_window_size(),
            window_duration_ms: default_window_duration_ms(),
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            send_queue_capacity: default_send_queue_capacity(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queues: default_queues(),
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            schedule_check_interval_ms: default_schedule_check_interval_ms(),
            stale_check_interval_ms: default_stale_check_interval_ms(),
            stale_timeout_secs: default_stale_timeout_secs(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            use_jitter: true,
            default_max_retries: default_max_retries(),
            default_timeout_ms: default_task_timeout_ms(),
        }
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            jwt_issuer: None,
            token_ttl_secs: default_token_ttl(),
            password_memory_cost_kib: default_memory_cost(),
            password_time_cost: default_time_cost(),
            password_parallelism: default_parallelism(),
            min_password_length: default_min_password_length(),
        }
    }
}

impl ServiceConfig {
    /// Graceful shutdown budget as a `Duration`
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl ProxySettings {
    /// Connect timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Total request timeout as a `Duration`
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Idle-between-chunks timeout as a `Duration`
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl BreakerSettings {
    /// Reset timeout as a `Duration`
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// Window duration as a `Duration`
    pub fn window_duration(&self) -> Duration {
        Duration::from_millis(self.window_duration_ms)
    }
}

impl WorkerSettings {
    /// Idle poll sleep as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Promotion sweep interval as a `Duration`
    pub fn schedule_check_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_check_interval_ms)
    }

    /// Stale sweep interval as a `Duration`
    pub fn stale_check_interval(&self) -> Duration {
        Duration::from_millis(self.stale_check_interval_ms)
    }

    /// Stale threshold as a `Duration`
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_failure_threshold() -> usize {
    5
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

fn default_success_threshold() -> usize {
    3
}

fn default_window_size() -> usize {
    100
}

fn default_window_duration_ms() -> u64 {
    60_000
}

fn default_send_queue_capacity() -> usize {
    64
}

fn default_queues() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_schedule_check_interval_ms() -> u64 {
    1_000
}

fn default_stale_check_interval_ms() -> u64 {
    30_000
}

fn default_stale_timeout_secs() -> u64 {
    300
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_task_timeout_ms() -> u64 {
    60_000
}

fn default_jwt_secret() -> String {
    "change-me".to_string()
}

fn default_token_ttl() -> u64 {
    3_600
}

fn default_memory_cost() -> u32 {
    19_456
}

fn default_time_cost() -> u32 {
    2
}

fn default_parallelism() -> u32 {
    1
}

fn default_min_password_length() -> usize {
    8
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service.port, 8080);
        assert_eq!(config.service.log_level, "info");
        assert_eq!(config.proxy.breaker.failure_threshold, 5);
        assert_eq!(config.worker.queues, vec!["default".to_string()]);
        assert!(config.database.is_none());
    }

    #[test]
    fn test_duration_helpers() {
        let config = Config::default();
        assert_eq!(config.proxy.connect_timeout(), Duration::from_secs(5));
        assert_eq!(
            config.proxy.breaker.window_duration(),
            Duration::from_secs(60)
        );
        assert_eq!(config.worker.stale_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load_from("does-not-exist.toml").expect("defaults should load");
        assert_eq!(config.service.name, "trellis-service");
    }
}
