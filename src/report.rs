//! Operator-facing summary lines

use crate::identity::{HostnameSet, Upstream};
use crate::reconcile::Registration;

/// Lines announcing a successful registration
pub fn ready_lines(hosts: &HostnameSet, upstream: &Upstream, registration: &Registration, tls: bool) -> Vec<String> {
    let scheme = if tls { "https" } else { "http" };
    let mut lines: Vec<String> = hosts
        .iter()
        .map(|h| format!("  {}://{}", scheme, h))
        .collect();
    lines.push(format!("  -> {}", upstream.normalized().dial()));
    lines.push(format!("  route {}", registration.route_id));
    if !registration.swept.is_empty() {
        lines.push(format!("  removed stale entries: {}", registration.swept.join(", ")));
    }
    lines
}

/// How to make the hostnames resolve locally on this platform
pub fn resolution_hints(hosts: &HostnameSet) -> Vec<String> {
    let unresolved: Vec<&str> = hosts
        .iter()
        .filter(|h| *h != "localhost" && !h.ends_with(".localhost"))
        .collect();
    if unresolved.is_empty() {
        return Vec::new();
    }

    let hosts_file = if cfg!(windows) {
        r"C:\Windows\System32\drivers\etc\hosts"
    } else {
        "/etc/hosts"
    };

    let mut hints = vec![format!("Add to {} if these names do not resolve:", hosts_file)];
    hints.extend(unresolved.iter().map(|h| format!("  127.0.0.1 {}", h)));
    if cfg!(target_os = "macos") {
        hints.push("Then flush the resolver cache: sudo dscacheutil -flushcache; sudo killall -HUP mDNSResponder".to_string());
    } else if cfg!(windows) {
        hints.push("Then flush the resolver cache: ipconfig /flushdns".to_string());
    }
    hints
}
