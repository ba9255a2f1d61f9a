//! JSON shapes of the entries this crate writes into the daemon
//!
//! Only the fields we read back are deserialized; everything else in the
//! daemon's tree is preserved as opaque JSON.

use crate::identity::{HostnameSet, RouteId, Upstream};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// How to choose a certificate issuer
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IssuerMode {
    /// Internal issuer unless a host is publicly routable
    #[default]
    Auto,
    Internal,
    Acme,
}

/// Certificate issuer for a TLS policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issuer {
    /// Daemon's locally-trusted self-signing CA
    Internal,
    /// Public ACME issuer
    Acme { email: Option<String> },
}

impl Issuer {
    pub fn select(mode: IssuerMode, hosts: &HostnameSet, email: Option<&str>) -> Self {
        let acme = || Issuer::Acme {
            email: email.map(str::to_string),
        };
        match mode {
            IssuerMode::Internal => Issuer::Internal,
            IssuerMode::Acme => acme(),
            IssuerMode::Auto => {
                if hosts.iter().any(is_public_host) {
                    acme()
                } else {
                    Issuer::Internal
                }
            }
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Issuer::Internal => json!({ "module": "internal" }),
            Issuer::Acme { email: Some(email) } => json!({ "module": "acme", "email": email }),
            Issuer::Acme { email: None } => json!({ "module": "acme" }),
        }
    }
}

const LOCAL_SUFFIXES: &[&str] = &[
    ".localhost",
    ".local",
    ".test",
    ".internal",
    ".lan",
    ".home.arpa",
    ".invalid",
    ".example",
];

/// Whether a public CA could validate this hostname
pub fn is_public_host(host: &str) -> bool {
    let host = host.trim_end_matches('.');
    if host == "localhost" || host.parse::<IpAddr>().is_ok() || !host.contains('.') {
        return false;
    }
    !LOCAL_SUFFIXES.iter().any(|suffix| host.ends_with(suffix))
}

/// Request/response header rewriting for a route
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderRules {
    /// Add permissive CORS response headers
    pub cors: bool,
    /// Override the Host header sent upstream
    pub upstream_host: Option<String>,
}

/// Everything needed to register one instance
#[derive(Debug, Clone)]
pub struct RouteSpec {
    pub hosts: HostnameSet,
    pub upstream: Upstream,
    pub headers: HeaderRules,
    /// `None` disables the TLS policy
    pub issuer: Option<Issuer>,
}

/// Route list entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    #[serde(rename = "@id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "match", default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<HostMatcher>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handle: Vec<Value>,
    #[serde(default)]
    pub terminal: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostMatcher {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host: Vec<String>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl RouteEntry {
    pub fn build(id: &RouteId, spec: &RouteSpec) -> Self {
        let mut handle = Vec::new();

        if spec.headers.cors {
            handle.push(json!({
                "handler": "headers",
                "response": {
                    "set": {
                        "Access-Control-Allow-Origin": ["*"],
                        "Access-Control-Allow-Methods": ["GET, POST, PUT, PATCH, DELETE, OPTIONS"],
                        "Access-Control-Allow-Headers": ["*"],
                    }
                }
            }));
        }

        let mut proxy = json!({
            "handler": "reverse_proxy",
            "upstreams": [{ "dial": spec.upstream.normalized().dial() }],
        });
        if let Some(host) = &spec.headers.upstream_host {
            proxy["headers"] = json!({ "request": { "set": { "Host": [host] } } });
        }
        handle.push(proxy);

        Self {
            id: Some(id.to_string()),
            matchers: vec![HostMatcher {
                host: spec.hosts.to_vec(),
                other: Map::new(),
            }],
            handle,
            terminal: true,
        }
    }

    /// Every hostname any matcher of this route claims
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.matchers
            .iter()
            .flat_map(|m| m.host.iter().map(String::as_str))
    }
}

/// TLS automation policy entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsPolicy {
    #[serde(rename = "@id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issuers: Vec<Value>,
}

impl TlsPolicy {
    pub fn build(id: &RouteId, hosts: &HostnameSet, issuer: &Issuer) -> Self {
        Self {
            id: Some(id.tls_policy_id()),
            subjects: hosts.to_vec(),
            issuers: vec![issuer.to_json()],
        }
    }
}

/// The daemon's minimal serving configuration
pub struct Scaffold<'a> {
    pub server_name: &'a str,
    pub tls_port: u16,
}

impl Scaffold<'_> {
    /// Path segments under `/config/` paired with the value to create there
    pub fn required_paths(&self) -> Vec<(Vec<String>, Value)> {
        vec![
            (
                vec![
                    "apps".to_string(),
                    "http".to_string(),
                    "servers".to_string(),
                    self.server_name.to_string(),
                ],
                json!({ "listen": [format!(":{}", self.tls_port)], "routes": [] }),
            ),
            (
                vec![
                    "apps".to_string(),
                    "tls".to_string(),
                    "automation".to_string(),
                    "policies".to_string(),
                ],
                json!([]),
            ),
        ]
    }

    /// Complete configuration for an empty daemon
    pub fn full_config(&self) -> Value {
        let mut root = Value::Object(Map::new());
        for (segments, leaf) in self.required_paths() {
            insert_nested(&mut root, &segments, leaf);
        }
        root
    }
}

/// TLS automation policy list
pub const POLICIES_PATH: &str = "/config/apps/tls/automation/policies";

/// Route list of the named server
pub fn routes_path(server_name: &str) -> String {
    format!("/config/apps/http/servers/{}/routes", server_name)
}

/// Wrap `leaf` in objects keyed by `segments`
pub fn nest(segments: &[String], leaf: Value) -> Value {
    segments.iter().rev().fold(leaf, |acc, key| {
        let mut map = BTreeMap::new();
        map.insert(key.clone(), acc);
        json!(map)
    })
}

fn insert_nested(root: &mut Value, segments: &[String], leaf: Value) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    let Value::Object(map) = root else {
        return;
    };
    if rest.is_empty() {
        map.entry(first.clone()).or_insert(leaf);
    } else {
        let child = map
            .entry(first.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        insert_nested(child, rest, leaf);
    }
}
