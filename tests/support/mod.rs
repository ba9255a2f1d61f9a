//! In-process mock of the daemon's admin API
//!
//! Implements enough of the configuration tree semantics for the route
//! manager: GET/PUT/POST/DELETE under `/config/`, `DELETE /id/<id>`,
//! `POST /load`, Origin enforcement, duplicate `@id` rejection and
//! one-policy-per-host enforcement for TLS automation policies.

#![allow(dead_code)]

use devroute::admin::{AdminClient, AdminEndpoint};
use devroute::daemon::{DaemonLauncher, ReadinessConfig};
use devroute::error::RouteError;
use devroute::identity::{HostnameSource, Upstream};
use devroute::lifecycle::{Instance, InstanceSettings, RetryPolicy, TlsSettings};
use devroute::lock::LockTiming;
use devroute::route::{HeaderRules, IssuerMode};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Default)]
struct MockState {
    config: Value,
    requests: Vec<String>,
    required_origin: Option<String>,
    failing_deletes: u32,
    fail_route_posts: bool,
    config_read_status: Option<u16>,
    route_post_delay: Option<Duration>,
}

/// Mock daemon bound to a fixed loopback port
pub struct MockDaemon {
    pub addr: SocketAddr,
    state: Arc<Mutex<MockState>>,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl MockDaemon {
    /// Start listening immediately
    pub async fn start() -> Arc<Self> {
        let daemon = Self::offline();
        daemon.go_online();
        daemon
    }

    /// Reserve a port but do not listen yet; connections are refused
    pub fn offline() -> Arc<Self> {
        let reserve = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
        let addr = reserve.local_addr().expect("local addr");
        drop(reserve);

        Arc::new(Self {
            addr,
            state: Arc::new(Mutex::new(MockState::default())),
            server: Mutex::new(None),
        })
    }

    /// Begin accepting connections; must run inside a tokio runtime
    pub fn go_online(&self) {
        let std_listener = std::net::TcpListener::bind(self.addr).expect("bind reserved port");
        std_listener.set_nonblocking(true).expect("nonblocking");
        let listener = TcpListener::from_std(std_listener).expect("tokio listener");
        let state = Arc::clone(&self.state);

        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(req, state).await }
                    });
                    let _ = AutoBuilder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await;
                });
            }
        });
        *self.server.lock() = Some(handle);
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn config(&self) -> Value {
        self.state.lock().config.clone()
    }

    pub fn set_config(&self, config: Value) {
        self.state.lock().config = config;
    }

    pub fn require_origin(&self, origin: &str) {
        self.state.lock().required_origin = Some(origin.to_string());
    }

    /// Make the next `n` DELETE requests fail with HTTP 500
    pub fn fail_next_deletes(&self, n: u32) {
        self.state.lock().failing_deletes = n;
    }

    pub fn fail_route_posts(&self, fail: bool) {
        self.state.lock().fail_route_posts = fail;
    }

    /// Answer every GET under `/config/` with `status`
    pub fn fail_config_reads(&self, status: u16) {
        self.state.lock().config_read_status = Some(status);
    }

    /// Hold route POSTs for `delay` before applying them
    pub fn delay_route_posts(&self, delay: Duration) {
        self.state.lock().route_post_delay = Some(delay);
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }

    /// Requests whose "METHOD path" starts with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.starts_with(prefix))
            .count()
    }

    pub fn routes(&self, server: &str) -> Vec<Value> {
        self.config()["apps"]["http"]["servers"][server]["routes"]
            .as_array()
            .cloned()
            .unwrap_or_default()
    }

    pub fn policies(&self) -> Vec<Value> {
        self.config()["apps"]["tls"]["automation"]["policies"]
            .as_array()
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_id(&self, id: &str) -> bool {
        find_id(&self.config(), id, &mut Vec::new()).is_some()
    }
}

impl Drop for MockDaemon {
    fn drop(&mut self) {
        if let Some(handle) = self.server.lock().take() {
            handle.abort();
        }
    }
}

fn reply(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response")
}

fn error_reply(status: StatusCode, message: String) -> Response<Full<Bytes>> {
    reply(status, json!({ "error": message }).to_string())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<Mutex<MockState>>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let origin = req
        .headers()
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = req.into_body().collect().await?.to_bytes();

    if method == Method::POST && path.ends_with("/routes") {
        let delay = state.lock().route_post_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    let mut state = state.lock();
    state.requests.push(format!("{} {}", method, path));

    if let Some(required) = &state.required_origin {
        if origin.as_deref() != Some(required.as_str()) {
            return Ok(error_reply(
                StatusCode::FORBIDDEN,
                format!("client is not allowed to access from origin '{}'", origin.unwrap_or_default()),
            ));
        }
    }

    let body: Option<Value> = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice(&body) {
            Ok(v) => Some(v),
            Err(e) => return Ok(error_reply(StatusCode::BAD_REQUEST, format!("decoding request: {}", e))),
        }
    };

    Ok(apply(&mut state, &method, &path, body))
}

fn apply(state: &mut MockState, method: &Method, path: &str, body: Option<Value>) -> Response<Full<Bytes>> {
    if method == Method::POST && path == "/load" {
        let Some(config) = body else {
            return error_reply(StatusCode::BAD_REQUEST, "empty config".to_string());
        };
        state.config = config;
        return reply(StatusCode::OK, "");
    }

    if let Some(id) = path.strip_prefix("/id/") {
        if method != Method::DELETE {
            return error_reply(StatusCode::METHOD_NOT_ALLOWED, "only DELETE supported".to_string());
        }
        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            return error_reply(StatusCode::INTERNAL_SERVER_ERROR, "injected failure".to_string());
        }
        let Some(target) = find_id(&state.config, id, &mut Vec::new()) else {
            return error_reply(StatusCode::NOT_FOUND, format!("unknown object ID '{}'", id));
        };
        remove_at(&mut state.config, &target);
        return reply(StatusCode::OK, "");
    }

    let Some(rest) = path.strip_prefix("/config") else {
        return error_reply(StatusCode::NOT_FOUND, "not found".to_string());
    };
    if method == Method::GET {
        if let Some(status) = state.config_read_status {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return error_reply(status, "injected read failure".to_string());
        }
    }
    let segments: Vec<String> = rest
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    match *method {
        Method::GET => match lookup(&state.config, &segments) {
            Lookup::Found(v) => reply(StatusCode::OK, v.to_string()),
            Lookup::MissingLeaf => reply(StatusCode::OK, "null"),
            Lookup::MissingParent => error_reply(StatusCode::NOT_FOUND, format!("invalid traversal path: {}", path)),
        },
        Method::PUT => {
            let Some(value) = body else {
                return error_reply(StatusCode::BAD_REQUEST, "empty body".to_string());
            };
            if segments.is_empty() {
                if !state.config.is_null() {
                    return error_reply(StatusCode::CONFLICT, "key already exists: config".to_string());
                }
                state.config = value;
                return reply(StatusCode::OK, "");
            }
            if let Err(e) = check_ids(&state.config, &value) {
                return error_reply(StatusCode::BAD_REQUEST, e);
            }
            match slot(&state.config, &segments) {
                Slot::Array | Slot::Value => error_reply(StatusCode::CONFLICT, format!("key already exists: {}", segments.join("/"))),
                Slot::MissingParent => error_reply(StatusCode::BAD_REQUEST, format!("invalid traversal path: {}", path)),
                Slot::MissingLeaf => {
                    set_at(&mut state.config, &segments, value);
                    reply(StatusCode::OK, "")
                }
            }
        }
        Method::POST => {
            let Some(value) = body else {
                return error_reply(StatusCode::BAD_REQUEST, "empty body".to_string());
            };
            if let Err(e) = check_ids(&state.config, &value) {
                return error_reply(StatusCode::BAD_REQUEST, e);
            }
            if state.fail_route_posts && path.ends_with("/routes") {
                return error_reply(StatusCode::INTERNAL_SERVER_ERROR, "injected route failure".to_string());
            }
            if path.ends_with("/automation/policies") {
                if let Some(host) = overlapping_subject(&state.config, &value) {
                    return error_reply(
                        StatusCode::BAD_REQUEST,
                        format!("loading new config: cannot apply more than one automation policy to host: {}", host),
                    );
                }
            }
            match slot(&state.config, &segments) {
                Slot::Array => {
                    if let Some(Value::Array(items)) = get_mut(&mut state.config, &segments) {
                        items.push(value);
                    }
                    reply(StatusCode::OK, "")
                }
                Slot::Value | Slot::MissingLeaf => {
                    set_at(&mut state.config, &segments, value);
                    reply(StatusCode::OK, "")
                }
                Slot::MissingParent => error_reply(StatusCode::BAD_REQUEST, format!("invalid traversal path: {}", path)),
            }
        }
        Method::DELETE => match slot(&state.config, &segments) {
            Slot::Array | Slot::Value => {
                remove_at(&mut state.config, &segments);
                reply(StatusCode::OK, "")
            }
            _ => error_reply(StatusCode::NOT_FOUND, format!("key does not exist: {}", segments.join("/"))),
        },
        _ => error_reply(StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string()),
    }
}

/// Owned summary of a lookup, so the tree can be mutated afterwards
enum Slot {
    Array,
    Value,
    MissingLeaf,
    MissingParent,
}

fn slot(root: &Value, segments: &[String]) -> Slot {
    match lookup(root, segments) {
        Lookup::Found(Value::Array(_)) => Slot::Array,
        Lookup::Found(_) => Slot::Value,
        Lookup::MissingLeaf => Slot::MissingLeaf,
        Lookup::MissingParent => Slot::MissingParent,
    }
}

enum Lookup<'a> {
    Found(&'a Value),
    MissingLeaf,
    MissingParent,
}

fn child<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

fn lookup<'a>(root: &'a Value, segments: &[String]) -> Lookup<'a> {
    let mut current = root;
    for (i, key) in segments.iter().enumerate() {
        match child(current, key) {
            Some(next) if !next.is_null() => current = next,
            _ if i + 1 == segments.len() && current.is_object() => return Lookup::MissingLeaf,
            _ => return Lookup::MissingParent,
        }
    }
    if current.is_null() {
        Lookup::MissingLeaf
    } else {
        Lookup::Found(current)
    }
}

fn get_mut<'a>(root: &'a mut Value, segments: &[String]) -> Option<&'a mut Value> {
    let mut current = root;
    for key in segments {
        current = match current {
            Value::Object(map) => map.get_mut(key)?,
            Value::Array(items) => items.get_mut(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn set_at(root: &mut Value, segments: &[String], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return;
    };
    match get_mut(root, parents) {
        Some(Value::Object(map)) => {
            map.insert(last.clone(), value);
        }
        Some(Value::Array(items)) => {
            if let Ok(i) = last.parse::<usize>() {
                if i < items.len() {
                    items[i] = value;
                }
            }
        }
        _ => {}
    }
}

fn remove_at(root: &mut Value, segments: &[String]) {
    let Some((last, parents)) = segments.split_last() else {
        *root = Value::Null;
        return;
    };
    match get_mut(root, parents) {
        Some(Value::Object(map)) => {
            map.remove(last);
        }
        Some(Value::Array(items)) => {
            if let Ok(i) = last.parse::<usize>() {
                if i < items.len() {
                    items.remove(i);
                }
            }
        }
        _ => {}
    }
}

fn find_id(value: &Value, id: &str, path: &mut Vec<String>) -> Option<Vec<String>> {
    match value {
        Value::Object(map) => {
            if map.get("@id").and_then(Value::as_str) == Some(id) {
                return Some(path.clone());
            }
            for (key, child) in map {
                path.push(key.clone());
                if let Some(found) = find_id(child, id, path) {
                    return Some(found);
                }
                path.pop();
            }
            None
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                path.push(i.to_string());
                if let Some(found) = find_id(child, id, path) {
                    return Some(found);
                }
                path.pop();
            }
            None
        }
        _ => None,
    }
}

fn collect_ids(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if let Some(id) = map.get("@id").and_then(Value::as_str) {
                out.push(id.to_string());
            }
            map.values().for_each(|v| collect_ids(v, out));
        }
        Value::Array(items) => items.iter().for_each(|v| collect_ids(v, out)),
        _ => {}
    }
}

fn check_ids(config: &Value, incoming: &Value) -> Result<(), String> {
    let mut new_ids = Vec::new();
    collect_ids(incoming, &mut new_ids);
    for id in new_ids {
        if find_id(config, &id, &mut Vec::new()).is_some() {
            return Err(format!("duplicate ID '{}' found", id));
        }
    }
    Ok(())
}

fn overlapping_subject(config: &Value, policy: &Value) -> Option<String> {
    let existing = config["apps"]["tls"]["automation"]["policies"].as_array()?;
    let subjects = policy["subjects"].as_array()?;
    subjects.iter().filter_map(Value::as_str).find_map(|subject| {
        existing
            .iter()
            .filter_map(|p| p["subjects"].as_array())
            .flatten()
            .any(|s| s.as_str() == Some(subject))
            .then(|| subject.to_string())
    })
}

/// Launcher that brings the mock daemon online and counts launches
pub struct MockLauncher {
    daemon: Option<Arc<MockDaemon>>,
    pub launches: AtomicU32,
}

impl MockLauncher {
    pub fn starting(daemon: Arc<MockDaemon>) -> Arc<Self> {
        Arc::new(Self {
            daemon: Some(daemon),
            launches: AtomicU32::new(0),
        })
    }

    /// Launch succeeds but nothing ever starts listening
    pub fn inert() -> Arc<Self> {
        Arc::new(Self {
            daemon: None,
            launches: AtomicU32::new(0),
        })
    }

    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }
}

impl DaemonLauncher for MockLauncher {
    fn launch(&self) -> Result<(), RouteError> {
        if self.launches.fetch_add(1, Ordering::SeqCst) == 0 {
            if let Some(daemon) = &self.daemon {
                daemon.go_online();
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "mock launcher".to_string()
    }
}

pub const SERVER: &str = "devroute";

pub fn client_for(daemon: &MockDaemon) -> AdminClient {
    AdminClient::new(AdminEndpoint::new(daemon.address(), None), Duration::from_secs(2)).unwrap()
}

pub fn readiness_config(lock_dir: &Path) -> ReadinessConfig {
    ReadinessConfig {
        server_name: SERVER.to_string(),
        tls_port: 8443,
        start_attempts: 5,
        start_delay: Duration::from_millis(20),
        lock_dir: lock_dir.to_path_buf(),
        lock: LockTiming {
            wait: Duration::from_millis(500),
            poll: Duration::from_millis(10),
            stale_after: Duration::from_secs(60),
        },
    }
}

pub fn settings(lock_dir: &Path, project_root: &Path, tls: bool) -> InstanceSettings {
    InstanceSettings {
        readiness: readiness_config(lock_dir),
        upstream: Upstream::new("0.0.0.0", 5173),
        headers: HeaderRules::default(),
        tls: tls.then(|| TlsSettings {
            mode: IssuerMode::Auto,
            acme_email: None,
        }),
        cwd: project_root.to_path_buf(),
        project_root: project_root.to_path_buf(),
        teardown: RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(10),
        },
    }
}

pub fn hosts(list: &[&str]) -> Vec<HostnameSource> {
    vec![HostnameSource::new(
        "route.hostnames",
        list.iter().map(|h| h.to_string()).collect(),
        "no explicit hostname given in config",
    )]
}

pub fn instance(
    daemon: &MockDaemon,
    launcher: Arc<dyn DaemonLauncher>,
    lock_dir: &Path,
    project_root: &Path,
    host_list: &[&str],
    tls: bool,
) -> Instance {
    Instance::new(
        client_for(daemon),
        launcher,
        settings(lock_dir, project_root, tls),
        hosts(host_list),
    )
}
