//! Devroute - shared reverse-proxy routes for local dev servers
//!
//! Each dev server process registers its own route and TLS policy on one
//! long-lived proxy daemon through the daemon's admin API:
//! - Starts and scaffolds the daemon if needed, serialized by a file lock
//! - Derives a deterministic route identity from hostnames and project root
//! - Replaces (never appends) its entries and sweeps stale overlapping ones
//! - Removes its entries with bounded retries when the server or process stops

pub mod admin;
pub mod config;
pub mod daemon;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod lock;
pub mod reconcile;
pub mod report;
pub mod route;
