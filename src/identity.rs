//! Deterministic route identity, hostname sets and upstream targets

use crate::error::{MissingInput, RouteError};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;

/// Prefix marking every `@id` this crate creates in the daemon
pub const ID_PREFIX: &str = "devroute-";

/// Suffix appended to a route id for its paired TLS policy
pub const TLS_SUFFIX: &str = "-tls";

const ID_HEX_LEN: usize = 12;

/// One place a hostname may come from, with what it produced
#[derive(Debug, Clone)]
pub struct HostnameSource {
    pub name: String,
    pub values: Vec<String>,
    /// Why this source produced nothing, shown when no source did
    pub missing_reason: String,
}

impl HostnameSource {
    pub fn new(name: impl Into<String>, values: Vec<String>, missing_reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values,
            missing_reason: missing_reason.into(),
        }
    }
}

/// Non-empty, lower-case, deduplicated, sorted set of hostnames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostnameSet(BTreeSet<String>);

impl HostnameSet {
    /// Merge all sources; fails with an itemized error if none yields a hostname
    pub fn resolve(sources: &[HostnameSource]) -> Result<Self, RouteError> {
        let hosts: BTreeSet<String> = sources
            .iter()
            .flat_map(|s| s.values.iter())
            .map(|h| h.trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();

        if hosts.is_empty() {
            let missing = sources
                .iter()
                .map(|s| MissingInput::new(&s.name, &s.missing_reason))
                .collect();
            return Err(RouteError::NoHostnames { missing });
        }

        Ok(Self(hosts))
    }

    pub fn from_hosts<I, S>(hosts: I) -> Result<Self, RouteError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values = hosts.into_iter().map(Into::into).collect();
        Self::resolve(&[HostnameSource::new("hostnames", values, "no hostname given")])
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn contains(&self, host: &str) -> bool {
        self.0.contains(&host.to_ascii_lowercase())
    }

    /// True if any of `hosts` is in this set
    pub fn intersects<'a, I>(&self, hosts: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        hosts.into_iter().any(|h| self.contains(h))
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

/// Identity token scoping one route and its TLS policy
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteId(String);

impl RouteId {
    /// Pure function of the hostnames, working directory and project root
    pub fn derive(hosts: &HostnameSet, cwd: &Path, project_root: &Path) -> Self {
        let mut hasher = Sha256::new();
        for host in hosts.iter() {
            hasher.update(host.as_bytes());
            hasher.update([b'\n']);
        }
        hasher.update([0]);
        hasher.update(cwd.to_string_lossy().as_bytes());
        hasher.update([0]);
        hasher.update(project_root.to_string_lossy().as_bytes());

        let digest = hex::encode(hasher.finalize());
        Self(format!("{}{}", ID_PREFIX, &digest[..ID_HEX_LEN]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn tls_policy_id(&self) -> String {
        format!("{}{}", self.0, TLS_SUFFIX)
    }

    /// Whether an `@id` found in the daemon was created by this crate
    pub fn is_managed(id: &str) -> bool {
        id.starts_with(ID_PREFIX)
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the daemon should dial the dev server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

impl Upstream {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Wildcard bind addresses become loopback
    pub fn normalized(&self) -> Self {
        let host = match self.host.as_str() {
            "" | "0.0.0.0" | "*" => "127.0.0.1".to_string(),
            "::" | "[::]" => "::1".to_string(),
            other => other.to_string(),
        };
        Self::new(host, self.port)
    }

    /// `host:port` with IPv6 literals bracketed
    pub fn dial(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dial())
    }
}
