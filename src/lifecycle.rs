//! Per-instance lifecycle: register on start, tear down once on stop
//!
//! ```text
//! Idle -> Registering -> Active -> TearingDown -> Done
//!              \___________________________________/ (registration failed)
//! ```
//!
//! Teardown is single-shot: concurrent triggers await the same execution.

use crate::admin::AdminClient;
use crate::daemon::{DaemonLauncher, Readiness, ReadinessConfig};
use crate::error::RouteError;
use crate::identity::{HostnameSet, HostnameSource, RouteId, Upstream};
use crate::reconcile::{Reconciler, Registration};
use crate::route::{HeaderRules, Issuer, IssuerMode, RouteSpec};
use parking_lot::Mutex;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Registering,
    Active,
    TearingDown,
    Done,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Registering => "registering",
            LifecycleState::Active => "active",
            LifecycleState::TearingDown => "tearing-down",
            LifecycleState::Done => "done",
        }
    }
}

/// What ended the instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownTrigger {
    /// The supervised dev server closed
    ServerClosed,
    /// OS termination signal (raw signal number)
    Signal(i32),
}

impl TeardownTrigger {
    /// Re-deliver a signal trigger to this process with default disposition.
    /// Returns for `ServerClosed`.
    pub fn reraise(self) {
        if let TeardownTrigger::Signal(signal) = self {
            info!(signal, "Re-raising termination signal");
            reraise_signal(signal);
        }
    }
}

#[cfg(unix)]
fn reraise_signal(signal: i32) {
    unsafe {
        libc::signal(signal, libc::SIG_DFL);
        libc::raise(signal);
    }
}

#[cfg(not(unix))]
fn reraise_signal(signal: i32) {
    std::process::exit(128 + signal);
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Delay after the first failure; doubles after each subsequent one
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }
}

/// Result of [`retry_with_backoff`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOutcome {
    pub succeeded: bool,
    pub attempts: u32,
}

/// Run `op` until it reports success or the attempts run out
pub async fn retry_with_backoff<F, Fut>(what: &str, policy: RetryPolicy, mut op: F) -> RetryOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let attempts = policy.attempts.max(1);
    for attempt in 1..=attempts {
        if op().await {
            return RetryOutcome {
                succeeded: true,
                attempts: attempt,
            };
        }
        if attempt < attempts {
            let delay = policy.delay_after(attempt);
            debug!(entry = what, attempt, delay_ms = delay.as_millis() as u64, "Retrying");
            tokio::time::sleep(delay).await;
        }
    }

    error!(entry = what, attempts, "Giving up removing entry");
    RetryOutcome {
        succeeded: false,
        attempts,
    }
}

/// TLS options for an instance
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub mode: IssuerMode,
    pub acme_email: Option<String>,
}

/// Everything an instance needs besides the admin client and launcher
#[derive(Debug, Clone)]
pub struct InstanceSettings {
    pub readiness: ReadinessConfig,
    pub upstream: Upstream,
    pub headers: HeaderRules,
    /// `None` registers the route without a TLS policy
    pub tls: Option<TlsSettings>,
    pub cwd: PathBuf,
    pub project_root: PathBuf,
    pub teardown: RetryPolicy,
}

/// What teardown did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub route_id: Option<String>,
    pub route_removed: bool,
    /// `None` when no policy was expected
    pub policy_removed: Option<bool>,
    pub attempts: u32,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.route_id.is_none() || (self.route_removed && self.policy_removed != Some(false))
    }
}

#[derive(Debug, Clone)]
struct Owned {
    route_id: RouteId,
    tls_policy: bool,
}

/// How [`Instance::register_until`] ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registered {
    Active(Registration),
    /// A stop arrived first; teardown already ran
    Stopped(TeardownTrigger, TeardownReport),
}

/// One dev server's route/policy pair
pub struct Instance {
    client: AdminClient,
    readiness: Readiness,
    reconciler: Reconciler,
    settings: InstanceSettings,
    sources: Vec<HostnameSource>,
    state: Mutex<LifecycleState>,
    owned: Mutex<Option<Owned>>,
    registration: Mutex<Option<Registration>>,
    teardown: OnceCell<TeardownReport>,
}

impl Instance {
    pub fn new(
        client: AdminClient,
        launcher: Arc<dyn DaemonLauncher>,
        settings: InstanceSettings,
        sources: Vec<HostnameSource>,
    ) -> Self {
        let readiness = Readiness::new(client.clone(), launcher, settings.readiness.clone());
        let reconciler = Reconciler::new(
            client.clone(),
            settings.readiness.server_name.clone(),
            settings.cwd.clone(),
            settings.project_root.clone(),
        );
        Self {
            client,
            readiness,
            reconciler,
            settings,
            sources,
            state: Mutex::new(LifecycleState::Idle),
            owned: Mutex::new(None),
            registration: Mutex::new(None),
            teardown: OnceCell::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn registration(&self) -> Option<Registration> {
        self.registration.lock().clone()
    }

    fn transition(&self, from: &[LifecycleState], to: LifecycleState) -> bool {
        let mut state = self.state.lock();
        if from.contains(&*state) {
            debug!(from = state.as_str(), to = to.as_str(), "Lifecycle transition");
            *state = to;
            true
        } else {
            false
        }
    }

    /// Resolve hostnames, make the daemon ready and reconcile the route.
    /// Failures move the instance straight to `Done`; nothing is retried.
    pub async fn register(&self) -> Result<Registration, RouteError> {
        if !self.transition(&[LifecycleState::Idle], LifecycleState::Registering) {
            let state = self.state();
            warn!(state = state.as_str(), "Instance cannot register in its current state");
            return Err(RouteError::InvalidState(state.as_str()));
        }

        match self.try_register().await {
            Ok(registration) => {
                *self.registration.lock() = Some(registration.clone());
                if self.transition(&[LifecycleState::Registering], LifecycleState::Active) {
                    info!(route_id = %registration.route_id, "Instance active");
                } else {
                    // Teardown raced registration and may have missed the new route
                    warn!(route_id = %registration.route_id, "Stopped while registering, removing route");
                    self.remove_owned().await;
                }
                Ok(registration)
            }
            Err(RouteError::Stopped) => {
                info!("Registration abandoned, instance is stopping");
                self.transition(&[LifecycleState::Registering], LifecycleState::Done);
                Err(RouteError::Stopped)
            }
            Err(e) => {
                error!(error = %e, "Registration failed");
                self.transition(&[LifecycleState::Registering], LifecycleState::Done);
                Err(e)
            }
        }
    }

    async fn try_register(&self) -> Result<Registration, RouteError> {
        let hosts = HostnameSet::resolve(&self.sources)?;
        let issuer = self
            .settings
            .tls
            .as_ref()
            .map(|tls| Issuer::select(tls.mode, &hosts, tls.acme_email.as_deref()));

        *self.owned.lock() = Some(Owned {
            route_id: self.reconciler.route_id(&hosts),
            tls_policy: issuer.is_some(),
        });

        self.readiness.ensure_ready().await?;
        if self.state() != LifecycleState::Registering {
            return Err(RouteError::Stopped);
        }

        let spec = RouteSpec {
            hosts,
            upstream: self.settings.upstream.clone(),
            headers: self.settings.headers.clone(),
            issuer,
        };
        let registration = self.reconciler.reconcile(&spec).await?;

        if let Some(owned) = self.owned.lock().as_mut() {
            owned.tls_policy = registration.tls_policy;
        }
        Ok(registration)
    }

    /// Register, unless `stop` resolves first. A stop tears down at once while
    /// the in-flight registration finishes and removes whatever it created.
    pub async fn register_until<S>(&self, stop: S) -> Result<Registered, RouteError>
    where
        S: Future<Output = i32>,
    {
        let register = self.register();
        tokio::pin!(register);

        let signal = tokio::select! {
            result = &mut register => return result.map(Registered::Active),
            sig = stop => sig,
        };

        info!(signal, "Received termination signal while registering");
        let (result, report) = tokio::join!(register, self.teardown());
        if let Err(e) = result {
            debug!(error = %e, "Interrupted registration ended");
        }
        Ok(Registered::Stopped(TeardownTrigger::Signal(signal), report))
    }

    /// Remove this instance's entries; runs at most once
    pub async fn teardown(&self) -> TeardownReport {
        self.teardown
            .get_or_init(|| async {
                let previous = self.state();
                *self.state.lock() = LifecycleState::TearingDown;
                debug!(from = previous.as_str(), "Tearing down instance");

                let report = self.remove_owned().await;

                *self.state.lock() = LifecycleState::Done;
                if report.is_clean() {
                    info!(route_id = ?report.route_id, attempts = report.attempts, "Teardown complete");
                }
                report
            })
            .await
            .clone()
    }

    async fn remove_owned(&self) -> TeardownReport {
        let Some(owned) = self.owned.lock().clone() else {
            debug!("Nothing registered, teardown is a no-op");
            return TeardownReport::default();
        };

        let policy = self.settings.teardown;
        let mut report = TeardownReport {
            route_id: Some(owned.route_id.to_string()),
            ..TeardownReport::default()
        };

        if owned.tls_policy {
            let policy_id = owned.route_id.tls_policy_id();
            let outcome = retry_with_backoff(&policy_id, policy, || self.delete_entry(&policy_id)).await;
            report.policy_removed = Some(outcome.succeeded);
            report.attempts += outcome.attempts;
        }

        let route_id = owned.route_id.to_string();
        let outcome = retry_with_backoff(&route_id, policy, || self.delete_entry(&route_id)).await;
        report.route_removed = outcome.succeeded;
        report.attempts += outcome.attempts;

        report
    }

    async fn delete_entry(&self, id: &str) -> bool {
        match self.client.delete_id(id).await {
            Ok(removed) => {
                debug!(id, removed, "Entry deleted");
                true
            }
            Err(e) => {
                warn!(id, error = %e, "Failed to delete entry");
                false
            }
        }
    }

    /// Wait for the dev server to close or `stop` (usually
    /// [`termination_signal`]), then tear down. The caller re-raises a signal
    /// trigger via [`TeardownTrigger::reraise`].
    pub async fn run_until_stopped<F, S>(&self, server_closed: F, stop: S) -> (TeardownTrigger, TeardownReport)
    where
        F: Future<Output = ()>,
        S: Future<Output = i32>,
    {
        let trigger = tokio::select! {
            _ = server_closed => {
                info!("Dev server closed");
                TeardownTrigger::ServerClosed
            }
            sig = stop => {
                info!(signal = sig, "Received termination signal");
                TeardownTrigger::Signal(sig)
            }
        };

        let report = self.teardown().await;
        (trigger, report)
    }
}

/// Future resolving to the first termination signal received. Listeners are
/// installed when this is called, not when the future is first polled.
#[cfg(unix)]
pub fn termination_signal() -> std::io::Result<impl Future<Output = i32>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => libc::SIGINT,
            _ = sigterm.recv() => libc::SIGTERM,
            _ = sighup.recv() => libc::SIGHUP,
        }
    })
}

#[cfg(not(unix))]
pub fn termination_signal() -> std::io::Result<impl Future<Output = i32>> {
    Ok(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => 2,
            Err(e) => {
                error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<i32>().await
            }
        }
    })
}
