//! Replace-not-append registration of one instance's route and TLS policy
//!
//! Mutation is keyed purely on [`RouteId`]: delete whatever is there under
//! our identity, then create. Nothing is read-modify-written.

use crate::admin::AdminClient;
use crate::error::{AdminError, RouteError};
use crate::identity::{HostnameSet, RouteId, TLS_SUFFIX};
use crate::route::{routes_path, RouteEntry, RouteSpec, TlsPolicy, POLICIES_PATH};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Outcome of a successful reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub route_id: RouteId,
    /// Whether a TLS policy under our identity is now present
    pub tls_policy: bool,
    /// Stale entries removed by the sweep
    pub swept: Vec<String>,
}

/// Registers routes for one project
pub struct Reconciler {
    client: AdminClient,
    server_name: String,
    cwd: PathBuf,
    project_root: PathBuf,
}

impl Reconciler {
    pub fn new(
        client: AdminClient,
        server_name: impl Into<String>,
        cwd: impl Into<PathBuf>,
        project_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            server_name: server_name.into(),
            cwd: cwd.into(),
            project_root: project_root.into(),
        }
    }

    pub fn route_id(&self, hosts: &HostnameSet) -> RouteId {
        RouteId::derive(hosts, &self.cwd, &self.project_root)
    }

    /// Sweep, replace the TLS policy, then replace the route
    pub async fn reconcile(&self, spec: &RouteSpec) -> Result<Registration, RouteError> {
        let route_id = self.route_id(&spec.hosts);
        let fail = |source: AdminError| RouteError::Reconcile {
            route_id: route_id.to_string(),
            source,
        };

        info!(route_id = %route_id, hosts = ?spec.hosts.to_vec(), upstream = %spec.upstream.normalized(), "Reconciling route");

        let swept = self.sweep_stale(&route_id, &spec.hosts).await.map_err(fail)?;

        self.client.delete_id(route_id.as_str()).await.map_err(fail)?;

        let tls_policy = match &spec.issuer {
            Some(issuer) => {
                let policy = TlsPolicy::build(&route_id, &spec.hosts, issuer);
                self.replace_policy(&route_id, &policy).await.map_err(fail)?
            }
            None => {
                self.client.delete_id(&route_id.tls_policy_id()).await.map_err(fail)?;
                false
            }
        };

        let entry = RouteEntry::build(&route_id, spec);
        if let Err(e) = self.client.post(&routes_path(&self.server_name), &entry).await {
            if tls_policy {
                self.rollback_policy(&route_id).await;
            }
            return Err(fail(e));
        }

        info!(route_id = %route_id, tls = tls_policy, swept = swept.len(), "Route registered");
        Ok(Registration {
            route_id,
            tls_policy,
            swept,
        })
    }

    /// Delete managed entries that claim one of our hosts under another identity
    async fn sweep_stale(&self, route_id: &RouteId, hosts: &HostnameSet) -> Result<Vec<String>, AdminError> {
        let mut swept = Vec::new();
        let own_policy = route_id.tls_policy_id();

        let routes: Vec<RouteEntry> = self.read_list(&routes_path(&self.server_name)).await?;
        for route in routes {
            let Some(id) = route.id.as_deref() else {
                continue;
            };
            if id == route_id.as_str() || !RouteId::is_managed(id) || !hosts.intersects(route.hosts()) {
                continue;
            }
            info!(stale = id, route_id = %route_id, "Removing stale route left by another instance");
            if self.client.delete_id(id).await? {
                swept.push(id.to_string());
            }
            let policy_id = format!("{}{}", id, TLS_SUFFIX);
            if self.client.delete_id(&policy_id).await? {
                swept.push(policy_id);
            }
        }

        let policies: Vec<TlsPolicy> = self.read_list(POLICIES_PATH).await?;
        for policy in policies {
            let Some(id) = policy.id.as_deref() else {
                continue;
            };
            if id == own_policy || swept.iter().any(|s| s == id) || !RouteId::is_managed(id) {
                continue;
            }
            if !hosts.intersects(policy.subjects.iter().map(String::as_str)) {
                continue;
            }
            info!(stale = id, route_id = %route_id, "Removing stale TLS policy left by another instance");
            if self.client.delete_id(id).await? {
                swept.push(id.to_string());
            }
        }

        Ok(swept)
    }

    async fn read_list<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, AdminError> {
        match self.client.get(path).await? {
            None => Ok(Vec::new()),
            Some(value) => serde_json::from_value(value).map_err(|e| AdminError::Encode {
                path: path.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Returns whether our policy is in effect; an overlap rejection counts as success
    async fn replace_policy(&self, route_id: &RouteId, policy: &TlsPolicy) -> Result<bool, AdminError> {
        self.client.delete_id(&route_id.tls_policy_id()).await?;

        match self.client.post(POLICIES_PATH, policy).await {
            Ok(()) => {
                debug!(policy_id = %route_id.tls_policy_id(), "TLS policy created");
                Ok(true)
            }
            Err(e) if e.is_policy_overlap() => {
                debug!(policy_id = %route_id.tls_policy_id(), "Hosts already covered by an existing TLS policy");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn rollback_policy(&self, route_id: &RouteId) {
        let policy_id = route_id.tls_policy_id();
        match self.client.delete_id(&policy_id).await {
            Ok(_) => debug!(policy_id = %policy_id, "Rolled back TLS policy"),
            Err(e) => warn!(policy_id = %policy_id, error = %e, "Failed to roll back TLS policy"),
        }
    }
}
