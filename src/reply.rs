//! Replies to control-channel clients.
//!
//! Every reply is rendered as one or more complete lines and written with a
//! single `write_all` under the connection's write lock, so replies from
//! concurrent workers never interleave.
//!
//! ```text
//! 222 <seq> addrinfo <family> <socktype> <protocol> <hex sockaddr>
//! 222 <seq> hostent <name> <family> <address>
//! 200 <seq> 0
//! 401 <seq> <status code> <status name>
//! 500 <seq> <message>
//! ```

use crate::error::Status;
use crate::resolver::{AddrInfo, HostEntry};
use std::fmt::Write as _;
use std::io::{self, Write};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Response codes used on the control channel.
pub mod code {
    /// Command completed.
    pub const COMMAND_OKAY: u16 = 200;
    /// One result record of a resolver query.
    pub const QUERY_RESULT: u16 = 222;
    /// The resolver query failed.
    pub const OPERATION_FAILED: u16 = 401;
    /// The command line could not be understood.
    pub const SYNTAX_ERROR: u16 = 500;
}

/// Logical content of one reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Zero or more address records, then success.
    Addresses(Vec<AddrInfo>),
    /// One legacy host entry, then success.
    Host(HostEntry),
    /// The query failed with this status.
    Failed(Status),
    /// The command was rejected before dispatch.
    BadArguments(String),
}

impl Reply {
    /// Renders the reply as newline-terminated lines tagged with `seq`.
    pub fn encode(&self, seq: u32) -> String {
        let mut out = String::new();
        // Writing to a String cannot fail.
        match self {
            Reply::Addresses(records) => {
                for ai in records {
                    let _ = writeln!(
                        out,
                        "{} {} addrinfo {} {} {} {}",
                        code::QUERY_RESULT,
                        seq,
                        ai.family.as_raw(),
                        ai.socktype,
                        ai.protocol,
                        hex::encode(ai.encoded_addr()),
                    );
                }
                let _ = writeln!(out, "{} {} 0", code::COMMAND_OKAY, seq);
            }
            Reply::Host(entry) => {
                for addr in &entry.addresses {
                    let _ = writeln!(
                        out,
                        "{} {} hostent {} {} {}",
                        code::QUERY_RESULT,
                        seq,
                        entry.name,
                        entry.family.as_raw(),
                        addr,
                    );
                }
                let _ = writeln!(out, "{} {} 0", code::COMMAND_OKAY, seq);
            }
            Reply::Failed(status) => {
                let _ = writeln!(
                    out,
                    "{} {} {} {}",
                    code::OPERATION_FAILED,
                    seq,
                    status.code(),
                    status.name(),
                );
            }
            Reply::BadArguments(message) => {
                let line = message.replace('\n', " ");
                let _ = writeln!(out, "{} {} {}", code::SYNTAX_ERROR, seq, line);
            }
        }
        out
    }
}

/// The client connection a command arrived on.
pub trait ClientSink: Send + Sync {
    /// Writes `reply` for command `seq`. May block.
    fn send(&self, seq: u32, reply: &Reply) -> io::Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A client backed by any byte stream, typically a Unix socket.
pub struct StreamClient<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> StreamClient<W> {
    /// Wraps `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> ClientSink for StreamClient<W> {
    fn send(&self, seq: u32, reply: &Reply) -> io::Result<()> {
        let encoded = reply.encode(seq);
        let mut writer = lock(&self.writer);
        writer.write_all(encoded.as_bytes())?;
        writer.flush()
    }
}

/// A client that keeps replies in memory. Used by tests and tooling.
#[derive(Default)]
pub struct MemoryClient {
    replies: Mutex<Vec<(u32, Reply)>>,
    arrived: Condvar,
}

impl MemoryClient {
    /// Creates an empty client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replies received so far.
    pub fn replies(&self) -> Vec<(u32, Reply)> {
        lock(&self.replies).clone()
    }

    /// Waits until at least `count` replies arrived or `timeout` elapsed,
    /// then returns what has arrived.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> Vec<(u32, Reply)> {
        let deadline = Instant::now() + timeout;
        let mut replies = lock(&self.replies);
        while replies.len() < count {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            replies = match self.arrived.wait_timeout(replies, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        replies.clone()
    }
}

impl ClientSink for MemoryClient {
    fn send(&self, seq: u32, reply: &Reply) -> io::Result<()> {
        lock(&self.replies).push((seq, reply.clone()));
        self.arrived.notify_all();
        Ok(())
    }
}
