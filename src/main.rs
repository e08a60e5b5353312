//! hostsd daemon entry point.
//!
//! ```bash
//! hostsd                                  # ./hostsd.yaml or /etc/hostsd/config.yaml
//! hostsd -c /etc/hostsd/alt.yaml
//! hostsd --hosts ./hosts -s /tmp/hostsd.sock -vv
//! ```

use clap::Parser;
use hostsd::config::{AppConfig, ConfigManager, LogLevel};
use hostsd::{logging, ControlServer, HostResolver, HostsIndex, ProxyDispatcher, SharedResolver};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Configuration files tried, in order, when `--config` is not given.
const CONFIG_SEARCH_PATH: &[&str] = &["./hostsd.yaml", "/etc/hostsd/config.yaml"];

/// Serves hosts-file lookups on the resolver control socket.
#[derive(Parser, Debug)]
#[command(name = "hostsd", author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "HOSTSD_CONFIG")]
    config: Option<PathBuf>,

    /// Control socket path, overriding server.socket_path
    #[arg(short, long, env = "HOSTSD_SOCKET")]
    socket: Option<PathBuf>,

    /// Hosts file, overriding hosts.path and pinning it across reloads
    #[arg(long, env = "HOSTSD_HOSTS")]
    hosts: Option<PathBuf>,

    /// More output: -v info, -vv debug, -vvv trace, -vvvv also dependencies
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Errors only
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Args {
    fn log_level(&self) -> Option<LogLevel> {
        match (self.quiet, self.verbose) {
            (true, _) => Some(LogLevel::Error),
            (false, 0) => None,
            (false, 1) => Some(LogLevel::Info),
            (false, 2) => Some(LogLevel::Debug),
            (false, _) => Some(LogLevel::Trace),
        }
    }

    fn verbose_deps(&self) -> bool {
        self.verbose > 3
    }

    /// Applies command-line overrides on top of the file configuration.
    fn apply(&self, config: &mut AppConfig) {
        if let Some(socket) = &self.socket {
            config.server.socket_path = socket.display().to_string();
        }
        if let Some(hosts) = &self.hosts {
            config.hosts.path = hosts.display().to_string();
        }
    }
}

/// Finds and loads the configuration. Without a usable file the defaults
/// apply and no reload watcher is started.
fn load_config(explicit: Option<&PathBuf>) -> (AppConfig, Option<ConfigManager>) {
    let found = explicit.cloned().or_else(|| {
        CONFIG_SEARCH_PATH
            .iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.is_file())
    });
    let Some(path) = found else {
        return (AppConfig::default(), None);
    };

    match ConfigManager::new(&path) {
        Ok(manager) => (manager.get(), Some(manager)),
        Err(e) => {
            eprintln!("hostsd: ignoring {}: {}; using defaults", path.display(), e);
            (AppConfig::default(), None)
        }
    }
}

/// Retargets the hosts index whenever the configuration is reloaded.
fn spawn_reload_task(manager: ConfigManager, resolver: SharedResolver) {
    let mut reloads = match manager.start_watcher() {
        Ok(rx) => rx,
        Err(e) => {
            warn!(error = %e, "Configuration hot reload disabled");
            return;
        }
    };

    tokio::spawn(async move {
        while reloads.recv().await.is_some() {
            let hosts_path = manager.get().hosts_path();
            let mut resolver = resolver.lock().unwrap_or_else(|p| p.into_inner());
            resolver.index_mut().set_path(hosts_path);
        }
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let (mut config, manager) = load_config(args.config.as_ref());
    args.apply(&mut config);

    let _log_guard = match logging::init_logging(&config.logging, args.log_level(), args.verbose_deps()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("hostsd: cannot initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        socket = %config.server.socket_path,
        hosts = %config.hosts.path,
        max_workers = config.server.max_workers,
        "hostsd starting"
    );

    let resolver: SharedResolver =
        Arc::new(Mutex::new(HostResolver::new(HostsIndex::new(config.hosts_path()))));

    if let (Some(manager), None) = (manager, &args.hosts) {
        spawn_reload_task(manager, Arc::clone(&resolver));
    }

    let dispatcher = ProxyDispatcher::with_max_workers(resolver, config.server.max_workers);
    let server = match ControlServer::bind(&config.server.socket_path, dispatcher) {
        Ok(server) => server,
        Err(e) => {
            error!(socket = %config.server.socket_path, error = %e, "Cannot bind control socket");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        outcome = server.run() => match outcome {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "Control socket failed");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            ExitCode::SUCCESS
        }
    }
}
