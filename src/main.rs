use devroute::admin::{AdminClient, AdminEndpoint, PKG_NAME, VERSION};
use devroute::config::{Config, CONFIG_ENV, HOSTNAME_ENV};
use devroute::daemon::CommandLauncher;
use devroute::identity::HostnameSet;
use devroute::lifecycle::{termination_signal, Instance, Registered, TeardownReport, TeardownTrigger};
use devroute::report::{ready_lines, resolution_hints};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

/// Grace period for the dev server after we ask it to stop
const SERVER_STOP_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devroute=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("devroute.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let cwd = std::env::current_dir()?;
    let endpoint = AdminEndpoint::new(config.admin.address.clone(), config.admin.origin.clone());
    let client = AdminClient::new(endpoint, config.admin.timeout())?;
    let launcher = Arc::new(CommandLauncher::parse(&config.daemon.launch_command)?);
    let settings = config.instance_settings(&cwd);
    let upstream = settings.upstream.clone();
    let tls = settings.tls.is_some();
    let sources = config.hostname_sources(std::env::var(HOSTNAME_ENV).ok());

    let instance = Instance::new(client, launcher, settings, sources.clone());

    let mut server = match &config.server.command {
        Some(command) => Some(spawn_server(command, upstream.port)?),
        None => None,
    };

    // Installed before registering so an early Ctrl+C still tears down
    let stop = termination_signal()?;
    tokio::pin!(stop);

    let registration = match instance.register_until(stop.as_mut()).await {
        Ok(Registered::Active(registration)) => registration,
        Ok(Registered::Stopped(trigger, report)) => {
            warn_if_unclean(&report);
            if let Some(child) = server.as_mut() {
                stop_server(child).await;
            }
            info!("Shutdown complete");
            trigger.reraise();
            return Ok(());
        }
        Err(e) => {
            if let Some(child) = server.as_mut() {
                stop_server(child).await;
            }
            return Err(e.into());
        }
    };

    // Registration succeeded, so the sources resolved
    let hosts = HostnameSet::resolve(&sources)?;
    for line in ready_lines(&hosts, &upstream, &registration, tls) {
        info!("{}", line);
    }
    for hint in resolution_hints(&hosts) {
        info!("{}", hint);
    }

    let (trigger, report) = match server.as_mut() {
        Some(child) => {
            instance
                .run_until_stopped(
                    async {
                        match child.wait().await {
                            Ok(status) => info!(?status, "Dev server exited"),
                            Err(e) => warn!(error = %e, "Failed to wait for dev server"),
                        }
                    },
                    stop.as_mut(),
                )
                .await
        }
        None => instance.run_until_stopped(std::future::pending::<()>(), stop.as_mut()).await,
    };

    warn_if_unclean(&report);

    if let (TeardownTrigger::Signal(_), Some(child)) = (trigger, server.as_mut()) {
        stop_server(child).await;
    }

    info!("Shutdown complete");
    trigger.reraise();
    Ok(())
}

fn warn_if_unclean(report: &TeardownReport) {
    if !report.is_clean() {
        warn!(route_id = ?report.route_id, "Some entries could not be removed from the daemon");
    }
}

fn spawn_server(command: &str, port: u16) -> anyhow::Result<Child> {
    let words = shell_words::split(command)?;
    let (program, args) = words
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("'server.command' is empty"))?;

    info!(command = %command, "Starting dev server");

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.stdin(Stdio::inherit());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());
    cmd.env("PORT", port.to_string());

    let child = cmd
        .spawn()
        .map_err(|e| anyhow::anyhow!("Failed to start dev server `{}`: {}", command, e))?;
    info!(pid = child.id().unwrap_or(0), "Dev server spawned");
    Ok(child)
}

async fn stop_server(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    if let Some(pid) = child.id() {
        info!(pid, "Sending SIGTERM to dev server");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(SERVER_STOP_GRACE, child.wait()).await {
        Ok(Ok(status)) => info!(?status, "Dev server exited"),
        Ok(Err(e)) => warn!(error = %e, "Error waiting for dev server to exit"),
        Err(_) => {
            warn!("Dev server did not exit in time, killing it");
            let _ = child.kill().await;
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting route manager");
    info!(
        admin = %config.admin.address,
        origin = ?config.admin.origin,
        server = %config.daemon.server_name,
        tls_port = config.daemon.tls_port,
        "Daemon settings"
    );
    info!(
        hostnames = ?config.route.hostnames,
        upstream_host = %config.route.upstream_host,
        upstream_port = config.route.upstream_port,
        tls = config.route.tls,
        cors = config.route.cors,
        "Route settings"
    );
}
