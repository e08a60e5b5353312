//! Control socket listener.
//!
//! Accepts Unix socket connections and turns each received line into an
//! argv-style command for the [`ProxyDispatcher`]. A line may start with a
//! decimal sequence number, which is echoed in every reply to that command:
//!
//! ```text
//! 12 getaddrinfo example.local 80 -1 -1 -1 -1
//! ```
//!
//! Each connection is read on its own thread; workers write their replies
//! straight to the connection from their own threads.

use crate::error::Result;
use crate::proxy::{rejection_reply, ProxyDispatcher};
use crate::reply::{ClientSink, StreamClient};
use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tokio::net::UnixListener;
use tracing::{debug, info, trace, warn};

/// Splits a command line into its sequence number and argv.
///
/// Returns `None` for blank lines.
pub fn parse_line(line: &str) -> Option<(u32, Vec<&str>)> {
    let mut tokens: Vec<&str> = line.split_ascii_whitespace().collect();
    let first = *tokens.first()?;

    let seq = if first.bytes().all(|b| b.is_ascii_digit()) {
        match first.parse() {
            Ok(seq) => {
                tokens.remove(0);
                seq
            }
            Err(_) => 0,
        }
    } else {
        0
    };

    Some((seq, tokens))
}

/// Handles one command line, replying synchronously if it is rejected.
pub fn handle_line(line: &str, client: &Arc<dyn ClientSink>, dispatcher: &ProxyDispatcher) {
    let Some((seq, argv)) = parse_line(line) else {
        return;
    };
    trace!(seq, command = ?argv.first(), "Command received");

    if let Err(e) = dispatcher.dispatch(seq, &argv, Arc::clone(client)) {
        let reply = rejection_reply(&argv, &e);
        if let Err(write_err) = client.send(seq, &reply) {
            warn!(seq, error = %write_err, "Failed to write rejection to client");
        }
    }
}

/// Reads commands from `reader` until end of stream.
pub fn serve_connection<R: Read>(
    reader: R,
    client: Arc<dyn ClientSink>,
    dispatcher: &ProxyDispatcher,
) -> io::Result<()> {
    for line in BufReader::new(reader).lines() {
        handle_line(&line?, &client, dispatcher);
    }
    Ok(())
}

fn serve_stream(stream: UnixStream, dispatcher: &ProxyDispatcher) -> io::Result<()> {
    let writer = stream.try_clone()?;
    let client: Arc<dyn ClientSink> = Arc::new(StreamClient::new(writer));
    serve_connection(stream, client, dispatcher)
}

/// The listening control socket.
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    dispatcher: ProxyDispatcher,
}

impl ControlServer {
    /// Binds the control socket at `path`, replacing a stale socket file.
    pub fn bind<P: AsRef<Path>>(path: P, dispatcher: ProxyDispatcher) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path)?;
        info!(socket = %path.display(), "Control socket listening");

        Ok(Self {
            listener,
            path: path.to_path_buf(),
            dispatcher,
        })
    }

    /// Path of the control socket.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts connections until the task is dropped.
    pub async fn run(&self) -> Result<()> {
        loop {
            let stream = match self.listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(error = %e, "Failed to accept control connection");
                    continue;
                }
            };

            let dispatcher = self.dispatcher.clone();
            if let Err(e) = serve_detached(stream, dispatcher) {
                warn!(error = %e, "Failed to start control connection");
            }
        }
    }
}

/// Hands a connection to its own reader thread. Reader threads are not tied
/// to the runtime, so an idle client cannot hold up shutdown.
fn serve_detached(stream: tokio::net::UnixStream, dispatcher: ProxyDispatcher) -> io::Result<()> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;

    thread::Builder::new()
        .name("control-conn".to_string())
        .spawn(move || {
            debug!("Control connection opened");
            match serve_stream(stream, &dispatcher) {
                Ok(()) => debug!("Control connection closed"),
                Err(e) => debug!(error = %e, "Control connection ended with error"),
            }
        })?;
    Ok(())
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!(socket = %self.path.display(), error = %e, "Could not remove control socket");
        }
    }
}
