//! Resolution proxy: command dispatch and per-request workers.
//!
//! The [`ProxyDispatcher`] receives argv-style commands from the control
//! channel, validates their shape, copies the arguments into an owned
//! [`ResolutionRequest`] and starts a [`RequestWorker`] on its own thread.
//! It never waits for the worker.
//!
//! Every worker takes the shared resolution lock around the freshness check
//! and the lookup, releases it, writes its reply to the originating client
//! and exits. Lookups therefore run one at a time while reply writes
//! overlap. The lock also covers the non-reentrant system service database.

use crate::error::{HostsError, QueryKind, Result};
use crate::reply::{ClientSink, Reply};
use crate::resolver::{AddrHints, AddressFamily, HostResolver};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use tracing::{debug, error, trace, warn};

/// The resolver behind the shared resolution lock.
pub type SharedResolver = Arc<Mutex<HostResolver>>;

/// Marker for a null host or service argument.
const NULL_ARG: &str = "^";

/// One query, owning copies of every argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionRequest {
    /// Forward resolution.
    AddrInfo {
        host: Option<String>,
        service: Option<String>,
        hints: Option<AddrHints>,
    },
    /// Legacy lookup keyed by a raw address.
    HostByAddr {
        address: Vec<u8>,
        family: AddressFamily,
    },
    /// Legacy lookup keyed by name.
    HostByName { name: String, family: AddressFamily },
}

impl ResolutionRequest {
    /// Status namespace of this request.
    pub fn kind(&self) -> QueryKind {
        match self {
            ResolutionRequest::AddrInfo { .. } => QueryKind::AddrInfo,
            _ => QueryKind::HostEnt,
        }
    }

    /// Validates `argv` (command name first) and copies it into a request.
    pub fn parse(argv: &[&str]) -> Result<Self> {
        let (&command, args) = argv
            .split_first()
            .ok_or_else(|| HostsError::bad_arguments("Empty command"))?;

        match command {
            "getaddrinfo" => Self::parse_addr_info(args),
            "gethostbyaddr" => Self::parse_host_by_addr(args),
            "gethostbyname" => Self::parse_host_by_name(args),
            other => Err(HostsError::bad_arguments(format!(
                "Unknown command: {other}"
            ))),
        }
    }

    fn parse_addr_info(args: &[&str]) -> Result<Self> {
        let [host, service, flags, family, socktype, protocol] = args else {
            return Err(wrong_arity("getaddrinfo", args.len(), 6));
        };

        let flags = parse_int("flags", flags)?;
        let family = parse_int("family", family)?;
        let socktype = parse_int("socktype", socktype)?;
        let protocol = parse_int("protocol", protocol)?;

        let hints = [flags, family, socktype, protocol]
            .iter()
            .any(|&v| v != -1)
            .then(|| AddrHints {
                flags,
                family: AddressFamily::from_raw(family),
                socktype,
                protocol,
            });

        Ok(ResolutionRequest::AddrInfo {
            host: optional(host).map(owned).transpose()?,
            service: optional(service).map(owned).transpose()?,
            hints,
        })
    }

    fn parse_host_by_addr(args: &[&str]) -> Result<Self> {
        let [address, length, family] = args else {
            return Err(wrong_arity("gethostbyaddr", args.len(), 3));
        };

        let length = parse_int("length", length)?;
        let family = AddressFamily::from_raw(parse_int("family", family)?);
        let expected = family.address_len().ok_or_else(|| {
            HostsError::bad_arguments(format!("Unsupported family: {}", family.as_raw()))
        })?;

        if usize::try_from(length).ok() != Some(expected) {
            return Err(HostsError::bad_arguments(format!(
                "Address length {length} does not match family {}",
                family.as_raw()
            )));
        }

        let parse_failed =
            || HostsError::bad_arguments(format!("inet_pton(\"{address}\") failed"));
        let octets = match family {
            AddressFamily::Inet => address
                .parse::<Ipv4Addr>()
                .map_err(|_| parse_failed())?
                .octets()
                .to_vec(),
            _ => address
                .parse::<Ipv6Addr>()
                .map_err(|_| parse_failed())?
                .octets()
                .to_vec(),
        };

        Ok(ResolutionRequest::HostByAddr {
            address: octets,
            family,
        })
    }

    fn parse_host_by_name(args: &[&str]) -> Result<Self> {
        let [name, family] = args else {
            return Err(wrong_arity("gethostbyname", args.len(), 2));
        };

        Ok(ResolutionRequest::HostByName {
            name: owned(name)?,
            family: AddressFamily::from_raw(parse_int("family", family)?),
        })
    }
}

fn wrong_arity(command: &str, got: usize, expected: usize) -> HostsError {
    HostsError::bad_arguments(format!(
        "{command}: expected {expected} arguments, got {got}"
    ))
}

fn parse_int(field: &str, value: &str) -> Result<i32> {
    value
        .parse()
        .map_err(|_| HostsError::bad_arguments(format!("Invalid {field}: {value}")))
}

fn optional(arg: &str) -> Option<&str> {
    (arg != NULL_ARG).then_some(arg)
}

/// Copies an argument out of the command buffer without aborting on OOM.
fn owned(arg: &str) -> Result<String> {
    let mut copy = String::new();
    copy.try_reserve_exact(arg.len())
        .map_err(|e| HostsError::AllocationFailure {
            message: e.to_string(),
        })?;
    copy.push_str(arg);
    Ok(copy)
}

/// The synchronous reply for a command the dispatcher refused.
pub fn rejection_reply(argv: &[&str], err: &HostsError) -> Reply {
    match err {
        HostsError::BadArguments { .. } => Reply::BadArguments(err.to_string()),
        other => {
            let kind = match argv.first() {
                Some(&"getaddrinfo") => QueryKind::AddrInfo,
                _ => QueryKind::HostEnt,
            };
            Reply::Failed(other.status(kind))
        }
    }
}

fn lock(resolver: &SharedResolver) -> MutexGuard<'_, HostResolver> {
    resolver.lock().unwrap_or_else(|poisoned| {
        warn!("Resolution lock poisoned by a panicked worker, recovering");
        poisoned.into_inner()
    })
}

/// Bound on concurrently running workers. Zero means unbounded.
#[derive(Debug, Clone)]
struct WorkerLimit {
    active: Arc<AtomicUsize>,
    max: usize,
}

/// Held by a worker for its whole life; frees the slot on drop.
#[derive(Debug)]
pub struct WorkerPermit {
    active: Arc<AtomicUsize>,
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WorkerLimit {
    fn new(max: usize) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            max,
        }
    }

    fn acquire(&self) -> Result<WorkerPermit> {
        let max = self.max;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .map_err(|_| HostsError::Busy { limit: max })?;
        Ok(WorkerPermit {
            active: Arc::clone(&self.active),
        })
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// Executes one request on its own thread.
pub struct RequestWorker {
    seq: u32,
    request: ResolutionRequest,
    client: Arc<dyn ClientSink>,
    resolver: SharedResolver,
    _permit: Option<WorkerPermit>,
}

impl RequestWorker {
    /// Creates a worker that owns `request` and answers on `client`.
    pub fn new(
        seq: u32,
        request: ResolutionRequest,
        client: Arc<dyn ClientSink>,
        resolver: SharedResolver,
    ) -> Self {
        Self {
            seq,
            request,
            client,
            resolver,
            _permit: None,
        }
    }

    fn with_permit(mut self, permit: WorkerPermit) -> Self {
        self._permit = Some(permit);
        self
    }

    /// Runs the worker on a new detached thread.
    pub fn start(self) -> Result<()> {
        let name = format!("resolve-{}", self.seq);
        thread::Builder::new().name(name).spawn(move || self.run())?;
        Ok(())
    }

    /// Resolves, replies, and releases everything the worker owns.
    pub fn run(self) {
        let kind = self.request.kind();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.resolve()))
            .unwrap_or_else(|_| {
                error!(seq = self.seq, "Resolution panicked");
                Err(HostsError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "resolution panicked",
                )))
            });

        let reply = match outcome {
            Ok(reply) => reply,
            Err(e) if e.is_not_found() => {
                debug!(seq = self.seq, error = %e, "Lookup miss");
                Reply::Failed(e.status(kind))
            }
            Err(e) => {
                warn!(seq = self.seq, error = %e, "Lookup failed");
                Reply::Failed(e.status(kind))
            }
        };

        // Written outside the lock; may block on a slow client.
        if let Err(e) = self.client.send(self.seq, &reply) {
            warn!(seq = self.seq, error = %e, "Failed to write reply to client");
        }
        trace!(seq = self.seq, "Worker finished");
    }

    fn resolve(&self) -> Result<Reply> {
        let mut resolver = lock(&self.resolver);
        resolver.ensure_fresh();

        match &self.request {
            ResolutionRequest::AddrInfo {
                host,
                service,
                hints,
            } => resolver
                .get_addr_info(host.as_deref(), service.as_deref(), hints.as_ref())
                .map(Reply::Addresses),
            ResolutionRequest::HostByAddr { address, family } => {
                let text = address_text(address).ok_or_else(|| {
                    HostsError::bad_arguments("Address has no valid length")
                })?;
                resolver
                    .get_host_by_name(&text, *family)
                    .map(Reply::Host)
            }
            ResolutionRequest::HostByName { name, family } => resolver
                .get_host_by_name(name, *family)
                .map(Reply::Host),
        }
    }
}

/// Canonical text of a raw 4- or 16-byte address.
fn address_text(raw: &[u8]) -> Option<String> {
    let ip = match raw.len() {
        4 => IpAddr::from(<[u8; 4]>::try_from(raw).ok()?),
        16 => IpAddr::from(<[u8; 16]>::try_from(raw).ok()?),
        _ => return None,
    };
    Some(ip.to_string())
}

/// Validates commands and launches workers.
#[derive(Clone)]
pub struct ProxyDispatcher {
    resolver: SharedResolver,
    limit: WorkerLimit,
}

impl ProxyDispatcher {
    /// Creates a dispatcher with no bound on concurrent workers.
    pub fn new(resolver: SharedResolver) -> Self {
        Self::with_max_workers(resolver, 0)
    }

    /// Creates a dispatcher that refuses work beyond `max_workers` live workers.
    pub fn with_max_workers(resolver: SharedResolver, max_workers: usize) -> Self {
        Self {
            resolver,
            limit: WorkerLimit::new(max_workers),
        }
    }

    /// The shared resolver.
    pub fn resolver(&self) -> &SharedResolver {
        &self.resolver
    }

    /// Number of workers currently alive.
    pub fn active_workers(&self) -> usize {
        self.limit.active()
    }

    /// Dispatches one command. Returns once the worker is started.
    ///
    /// Errors are for the caller to report synchronously; no worker exists
    /// for a rejected command.
    pub fn dispatch(&self, seq: u32, argv: &[&str], client: Arc<dyn ClientSink>) -> Result<()> {
        let request = ResolutionRequest::parse(argv).map_err(|e| {
            debug!(seq, error = %e, "Rejected command");
            e
        })?;
        let permit = self.limit.acquire().map_err(|e| {
            warn!(seq, error = %e, "Worker limit reached");
            e
        })?;

        trace!(seq, request = ?request, "Starting worker");
        RequestWorker::new(seq, request, client, Arc::clone(&self.resolver))
            .with_permit(permit)
            .start()
    }
}
