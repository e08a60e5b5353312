//! Error types for the hosts resolution daemon.
//!
//! Lookup failures, request validation failures and configuration problems
//! all surface through [`HostsError`]. Errors that reach a client are
//! translated into a numeric [`Status`] in the resolver-library numbering.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the daemon.
#[derive(Error, Debug)]
pub enum HostsError {
    /// Name absent from the index, unparsable as a literal, or of the wrong family.
    #[error("No such name: {name}")]
    NotFound { name: String },

    /// Command shape rejected by the dispatcher before any worker was spawned.
    #[error("Bad arguments: {message}")]
    BadArguments { message: String },

    /// The hosts file could not be opened, locked, or mapped.
    #[error("Hosts file unavailable at {}: {source}", .path.display())]
    ResourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Copying the request out of the command buffer failed.
    #[error("Allocation failure: {message}")]
    AllocationFailure { message: String },

    /// All worker slots are taken.
    #[error("Too many concurrent requests (limit {limit})")]
    Busy { limit: usize },

    /// Configuration file could not be found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}")]
    ConfigValidation { message: String },

    /// The configuration file watcher could not be set up.
    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),

    /// I/O error wrapper.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostsError {
    /// Creates a not-found error for `name`.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Creates a new bad-arguments error.
    pub fn bad_arguments(message: impl Into<String>) -> Self {
        Self::BadArguments {
            message: message.into(),
        }
    }

    /// Creates a new configuration parse error.
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
        }
    }

    /// Creates a new configuration validation error.
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Returns true for the expected "no such name" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Maps the error onto the status namespace of the query that failed.
    pub fn status(&self, kind: QueryKind) -> Status {
        match (self, kind) {
            (Self::NotFound { .. }, QueryKind::AddrInfo) => Status::NoName,
            (Self::NotFound { .. }, QueryKind::HostEnt) => Status::HostNotFound,
            (Self::Busy { .. }, QueryKind::AddrInfo) => Status::Again,
            (Self::Busy { .. }, QueryKind::HostEnt) => Status::TryAgain,
            (Self::AllocationFailure { .. }, QueryKind::AddrInfo) => Status::Memory,
            (_, QueryKind::AddrInfo) => Status::Fail,
            (_, QueryKind::HostEnt) => Status::NoRecovery,
        }
    }
}

/// Which resolver API a request mirrors; selects the status namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// `getaddrinfo`-style forward resolution.
    AddrInfo,
    /// `gethostbyname` / `gethostbyaddr`-style legacy lookups.
    HostEnt,
}

/// Status codes written back to clients.
///
/// The `EAI_*` values follow the BSD `netdb.h` numbering and the `h_errno`
/// values follow the classic resolver numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// `EAI_AGAIN`
    Again,
    /// `EAI_FAIL`
    Fail,
    /// `EAI_MEMORY`
    Memory,
    /// `EAI_NONAME`
    NoName,
    /// `HOST_NOT_FOUND`
    HostNotFound,
    /// `TRY_AGAIN`
    TryAgain,
    /// `NO_RECOVERY`
    NoRecovery,
}

impl Status {
    /// Numeric code as sent on the wire.
    pub fn code(self) -> i32 {
        match self {
            Status::Again => 2,
            Status::Fail => 4,
            Status::Memory => 6,
            Status::NoName => 8,
            Status::HostNotFound => 1,
            Status::TryAgain => 2,
            Status::NoRecovery => 3,
        }
    }

    /// Symbolic name, used in reply messages and logs.
    pub fn name(self) -> &'static str {
        match self {
            Status::Again => "EAI_AGAIN",
            Status::Fail => "EAI_FAIL",
            Status::Memory => "EAI_MEMORY",
            Status::NoName => "EAI_NONAME",
            Status::HostNotFound => "HOST_NOT_FOUND",
            Status::TryAgain => "TRY_AGAIN",
            Status::NoRecovery => "NO_RECOVERY",
        }
    }
}

/// Result type alias using HostsError.
pub type Result<T> = std::result::Result<T, HostsError>;
