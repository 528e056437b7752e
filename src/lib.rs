//! frontdoor - A rule-driven HTTP/HTTPS front door
//!
//! This library implements a configurable front door that:
//! - Terminates HTTP and HTTPS connections on any number of listeners
//! - Resolves TLS certificates per SNI hostname on demand, with
//!   single-flight reads and permanent caching
//! - Routes every request through an ordered rule list to pluggable
//!   actions (proxy, redirect, static files, directory index,
//!   diagnostics), with explicit fallthrough between rules
//! - Dispatches WebSocket and other protocol upgrades to
//!   upgrade-capable actions
//! - Supervises a pool of worker processes: scaling, rolling restart,
//!   graceful drain, and signal-driven reconfiguration without dropping
//!   traffic

pub mod actions;
pub mod cluster;
pub mod config;
pub mod error;
pub mod pool;
pub mod router;
pub mod server;
pub mod tls;
pub mod worker;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
