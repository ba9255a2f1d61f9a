//! Daemon readiness: make sure the daemon is running and scaffolded
//!
//! The whole sequence runs under the [`BootstrapLock`] so that concurrent
//! instances do not all decide to launch the daemon at once.

use crate::admin::AdminClient;
use crate::error::{AdminError, RouteError};
use crate::lock::{BootstrapLock, LockTiming};
use crate::route::{nest, Scaffold};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Starts the daemon out-of-process
pub trait DaemonLauncher: Send + Sync {
    /// Kick off the daemon; readiness is detected by probing afterwards
    fn launch(&self) -> Result<(), RouteError>;

    fn describe(&self) -> String;
}

/// Runs a configured command such as `caddy start`
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a shell-style command line
    pub fn parse(command: &str) -> Result<Self, RouteError> {
        let invalid = |reason: String| RouteError::Launch {
            command: command.to_string(),
            reason,
        };
        let mut words = shell_words::split(command).map_err(|e| invalid(e.to_string()))?;
        if words.is_empty() {
            return Err(invalid("empty command".to_string()));
        }
        let program = words.remove(0);
        Ok(Self::new(program, words))
    }
}

impl DaemonLauncher for CommandLauncher {
    fn launch(&self) -> Result<(), RouteError> {
        info!(command = %self.describe(), "Launching daemon");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| RouteError::Launch {
                command: self.describe(),
                reason: e.to_string(),
            })?;

        let command = self.describe();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => debug!(command = %command, "Daemon launch command finished"),
                Ok(status) => warn!(command = %command, ?status, "Daemon launch command exited with failure"),
                Err(e) => warn!(command = %command, error = %e, "Failed to wait for daemon launch command"),
            }
        });

        Ok(())
    }

    fn describe(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Settings for [`Readiness::ensure_ready`]
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    pub server_name: String,
    pub tls_port: u16,
    /// Probes after a launch before giving up
    pub start_attempts: u32,
    pub start_delay: Duration,
    pub lock_dir: PathBuf,
    pub lock: LockTiming,
}

/// Ensures the daemon is reachable and its base scaffold exists
pub struct Readiness {
    client: AdminClient,
    launcher: Arc<dyn DaemonLauncher>,
    config: ReadinessConfig,
}

impl Readiness {
    pub fn new(client: AdminClient, launcher: Arc<dyn DaemonLauncher>, config: ReadinessConfig) -> Self {
        Self {
            client,
            launcher,
            config,
        }
    }

    /// Probe, launch if needed, then scaffold; all under the bootstrap lock
    pub async fn ensure_ready(&self) -> Result<(), RouteError> {
        let address = self.client.endpoint().address.clone();
        let lock = BootstrapLock::acquire(&self.config.lock_dir, &address, self.config.lock).await?;
        debug!(address = %address, held = lock.held(), "Running daemon bootstrap");

        let result = self.bootstrap().await;
        drop(lock);
        result
    }

    async fn bootstrap(&self) -> Result<(), RouteError> {
        match self.client.probe().await {
            Ok(()) => debug!("Daemon reachable"),
            Err(e) if e.is_connectivity() => {
                info!(error = %e, "Daemon not reachable, starting it");
                self.launch_and_wait().await?;
            }
            Err(e) => {
                error!(error = %e, kind = %e.kind(), "Daemon rejected readiness probe");
                return Err(RouteError::Readiness(e));
            }
        }

        self.ensure_scaffold().await.map_err(RouteError::Readiness)
    }

    async fn launch_and_wait(&self) -> Result<(), RouteError> {
        self.launcher.launch()?;

        let attempts = self.config.start_attempts.max(1);
        for attempt in 1..=attempts {
            tokio::time::sleep(self.config.start_delay).await;
            match self.client.probe().await {
                Ok(()) => {
                    info!(attempt, "Daemon is up");
                    return Ok(());
                }
                Err(e) if e.is_connectivity() => {
                    debug!(attempt, error = %e, "Daemon not up yet");
                }
                Err(e) => return Err(RouteError::Readiness(e)),
            }
        }

        let address = self.client.endpoint().address.clone();
        error!(address = %address, attempts, launcher = %self.launcher.describe(), "Daemon did not come up");
        Err(RouteError::DaemonUnreachable { address, attempts })
    }

    /// Create missing scaffold pieces without touching existing ones
    async fn ensure_scaffold(&self) -> Result<(), AdminError> {
        let scaffold = Scaffold {
            server_name: &self.config.server_name,
            tls_port: self.config.tls_port,
        };

        if self.client.get("/config/").await?.is_none() {
            info!(server = %self.config.server_name, "Daemon has no configuration, loading scaffold");
            match self.client.load(&scaffold.full_config()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e),
            }
        }

        for (segments, leaf) in scaffold.required_paths() {
            self.ensure_path(&segments, leaf).await?;
        }
        Ok(())
    }

    /// PUT `leaf` (wrapped as needed) at the first missing segment of `segments`
    async fn ensure_path(&self, segments: &[String], leaf: Value) -> Result<(), AdminError> {
        for depth in 1..=segments.len() {
            let path = format!("/config/{}", segments[..depth].join("/"));
            if self.client.get(&path).await?.is_some() {
                continue;
            }

            let value = nest(&segments[depth..], leaf);
            debug!(path = %path, "Creating scaffold path");
            return match self.client.put(&path, &value).await {
                Ok(()) => {
                    info!(path = %path, "Scaffold created");
                    Ok(())
                }
                Err(e) if e.is_already_exists() => {
                    debug!(path = %path, "Scaffold already created by a sibling");
                    Ok(())
                }
                Err(e) => Err(e),
            };
        }
        Ok(())
    }
}
