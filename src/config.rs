use crate::daemon::ReadinessConfig;
use crate::identity::{HostnameSource, Upstream};
use crate::lifecycle::{InstanceSettings, RetryPolicy, TlsSettings};
use crate::lock::{default_lock_dir, LockTiming};
use crate::route::{HeaderRules, IssuerMode};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding extra hostnames (comma separated)
pub const HOSTNAME_ENV: &str = "DEVROUTE_HOSTNAME";

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "DEVROUTE_CONFIG";

/// Top-level configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Admin API location
    #[serde(default)]
    pub admin: AdminConfig,

    /// Daemon bootstrap settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// The route this instance registers
    #[serde(default)]
    pub route: RouteConfig,

    /// Cleanup retry settings
    #[serde(default)]
    pub teardown: TeardownConfig,

    /// Optional dev server to supervise
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdminConfig {
    /// Admin API address (default: 127.0.0.1:2019)
    #[serde(default = "default_admin_address")]
    pub address: String,

    /// Origin header to send (default: http://<address>)
    pub origin: Option<String>,

    /// Per-request timeout in milliseconds (default: 5000)
    #[serde(default = "default_admin_timeout")]
    pub timeout_ms: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            address: default_admin_address(),
            origin: None,
            timeout_ms: default_admin_timeout(),
        }
    }
}

impl AdminConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    /// Command that starts the daemon in the background (default: "caddy start")
    #[serde(default = "default_launch_command")]
    pub launch_command: String,

    /// Name of the daemon's logical server holding our routes
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Port the scaffold server listens on (default: 443)
    #[serde(default = "default_tls_port")]
    pub tls_port: u16,

    /// Probes after launching before giving up (default: 10)
    #[serde(default = "default_start_attempts")]
    pub start_attempts: u32,

    /// Delay between those probes in milliseconds (default: 500)
    #[serde(default = "default_start_delay")]
    pub start_delay_ms: u64,

    /// Maximum wait for the bootstrap lock in milliseconds (default: 5000)
    #[serde(default = "default_lock_wait")]
    pub lock_wait_ms: u64,

    /// Lock poll interval in milliseconds (default: 100)
    #[serde(default = "default_lock_poll")]
    pub lock_poll_ms: u64,

    /// Age after which a lock marker is considered abandoned (default: 30)
    #[serde(default = "default_lock_stale")]
    pub lock_stale_secs: u64,

    /// Directory for lock markers (default: runtime dir, else temp dir)
    pub lock_dir: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            launch_command: default_launch_command(),
            server_name: default_server_name(),
            tls_port: default_tls_port(),
            start_attempts: default_start_attempts(),
            start_delay_ms: default_start_delay(),
            lock_wait_ms: default_lock_wait(),
            lock_poll_ms: default_lock_poll(),
            lock_stale_secs: default_lock_stale(),
            lock_dir: None,
        }
    }
}

impl DaemonConfig {
    pub fn lock_timing(&self) -> LockTiming {
        LockTiming {
            wait: Duration::from_millis(self.lock_wait_ms),
            poll: Duration::from_millis(self.lock_poll_ms),
            stale_after: Duration::from_secs(self.lock_stale_secs),
        }
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(default_lock_dir)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouteConfig {
    /// Hostnames to route to the dev server
    #[serde(default)]
    pub hostnames: Vec<String>,

    /// Host the dev server binds (wildcards are dialed via loopback)
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,

    /// Port the dev server listens on
    #[serde(default)]
    pub upstream_port: u16,

    /// Project root used in the route identity (default: current directory)
    pub project_root: Option<String>,

    /// Add permissive CORS response headers
    #[serde(default)]
    pub cors: bool,

    /// Rewrite the Host header sent to the dev server
    pub host_override: Option<String>,

    /// Register a TLS policy (default: true)
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Issuer selection: "auto" (default), "internal" or "acme"
    #[serde(default)]
    pub issuer: IssuerMode,

    /// Contact email for the ACME issuer
    pub acme_email: Option<String>,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            hostnames: Vec::new(),
            upstream_host: default_upstream_host(),
            upstream_port: 0,
            project_root: None,
            cors: false,
            host_override: None,
            tls: true,
            issuer: IssuerMode::default(),
            acme_email: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TeardownConfig {
    /// Attempts per entry (default: 3)
    #[serde(default = "default_teardown_attempts")]
    pub attempts: u32,

    /// Initial backoff in milliseconds, doubled per retry (default: 100)
    #[serde(default = "default_teardown_backoff")]
    pub backoff_ms: u64,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            attempts: default_teardown_attempts(),
            backoff_ms: default_teardown_backoff(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServerConfig {
    /// Dev server command line; its exit triggers teardown
    pub command: Option<String>,
}

fn default_admin_address() -> String {
    "127.0.0.1:2019".to_string()
}

fn default_admin_timeout() -> u64 {
    5000
}

fn default_launch_command() -> String {
    "caddy start".to_string()
}

fn default_server_name() -> String {
    "devroute".to_string()
}

fn default_tls_port() -> u16 {
    443
}

fn default_start_attempts() -> u32 {
    10
}

fn default_start_delay() -> u64 {
    500
}

fn default_lock_wait() -> u64 {
    5000
}

fn default_lock_poll() -> u64 {
    100
}

fn default_lock_stale() -> u64 {
    30
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_teardown_attempts() -> u32 {
    3
}

fn default_teardown_backoff() -> u64 {
    100
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.admin.address.trim().is_empty() {
            errors.push("'admin.address' must not be empty".to_string());
        }
        if self.route.upstream_port == 0 {
            errors.push("'route.upstream_port' must be greater than 0".to_string());
        }
        if self.daemon.server_name.trim().is_empty() || self.daemon.server_name.contains('/') {
            errors.push("'daemon.server_name' must be a non-empty name without '/'".to_string());
        }
        if shell_words::split(&self.daemon.launch_command).map_or(true, |w| w.is_empty()) {
            errors.push("'daemon.launch_command' must be a valid command line".to_string());
        }
        if self.teardown.attempts == 0 {
            errors.push("'teardown.attempts' must be at least 1".to_string());
        }
        if let Some(command) = &self.server.command {
            if shell_words::split(command).map_or(true, |w| w.is_empty()) {
                errors.push("'server.command' must be a valid command line".to_string());
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Hostname sources in priority order: config, then environment
    pub fn hostname_sources(&self, env_value: Option<String>) -> Vec<HostnameSource> {
        let env_hosts: Vec<String> = env_value
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect();
        let env_reason = if env_value.is_some() {
            "set but contains no hostname"
        } else {
            "not set"
        };

        vec![
            HostnameSource::new(
                "route.hostnames",
                self.route.hostnames.clone(),
                "no explicit hostname given in config",
            ),
            HostnameSource::new(HOSTNAME_ENV, env_hosts, env_reason),
        ]
    }

    pub fn instance_settings(&self, cwd: &Path) -> InstanceSettings {
        let project_root = self
            .route
            .project_root
            .as_ref()
            .map(|p| cwd.join(p))
            .unwrap_or_else(|| cwd.to_path_buf());

        InstanceSettings {
            readiness: ReadinessConfig {
                server_name: self.daemon.server_name.clone(),
                tls_port: self.daemon.tls_port,
                start_attempts: self.daemon.start_attempts,
                start_delay: Duration::from_millis(self.daemon.start_delay_ms),
                lock_dir: self.daemon.lock_dir(),
                lock: self.daemon.lock_timing(),
            },
            upstream: Upstream::new(&self.route.upstream_host, self.route.upstream_port),
            headers: HeaderRules {
                cors: self.route.cors,
                upstream_host: self.route.host_override.clone(),
            },
            tls: self.route.tls.then(|| TlsSettings {
                mode: self.route.issuer,
                acme_email: self.route.acme_email.clone(),
            }),
            cwd: cwd.to_path_buf(),
            project_root,
            teardown: RetryPolicy {
                attempts: self.teardown.attempts,
                base_delay: Duration::from_millis(self.teardown.backoff_ms),
            },
        }
    }
}
