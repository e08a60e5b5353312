//! # hostsd
//!
//! The local name-resolution fast path of a network-configuration daemon.
//! Resolution requests arrive as commands on a control socket, each one is
//! answered from an index over the static hosts file by its own worker
//! thread, and the lookup step of every worker is serialized through one
//! shared lock.
//!
//! ## Modules
//!
//! - [`hosts`]: Memory-mapped hosts file, sorted index, staleness checks
//! - [`resolver`]: Address records and legacy host entries from index hits
//! - [`proxy`]: Command validation, per-request workers, the shared lock
//! - [`reply`]: Reply content and its encoding on the client connection
//! - [`server`]: Control socket listener
//! - [`config`]: Configuration loading, validation, and hot-reload support
//! - [`error`]: Error types and status codes
//! - [`logging`]: Logging setup and configuration
//!
//! ## Example
//!
//! ```ignore
//! use hostsd::{HostResolver, HostsIndex, ProxyDispatcher, MemoryClient};
//! use std::sync::{Arc, Mutex};
//!
//! let resolver = HostResolver::new(HostsIndex::new("/etc/hosts"));
//! let dispatcher = ProxyDispatcher::new(Arc::new(Mutex::new(resolver)));
//!
//! let client = Arc::new(MemoryClient::new());
//! dispatcher.dispatch(1, &["getaddrinfo", "localhost", "80", "-1", "-1", "-1", "-1"], client.clone())?;
//! ```

pub mod config;
pub mod error;
pub mod hosts;
pub mod logging;
pub mod proxy;
pub mod reply;
pub mod resolver;
pub mod server;

pub use config::{AppConfig, ConfigManager};
pub use error::{HostsError, QueryKind, Result, Status};
pub use hosts::{HostsIndex, HostsSnapshot, IndexEntry, Refresh};
pub use proxy::{ProxyDispatcher, RequestWorker, ResolutionRequest, SharedResolver};
pub use reply::{ClientSink, MemoryClient, Reply, StreamClient};
pub use resolver::{AddrHints, AddrInfo, AddressFamily, HostEntry, HostResolver};
pub use server::ControlServer;
