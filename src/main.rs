//! Proxy process entry point.
//!
//! Parses the CLI, loads configuration, builds the shared domain map,
//! spawns the worker supervisor, and runs the main event loop until a
//! quit signal arrives. Exit codes: 0 normal, 1 argument/config/start
//! error.

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::cell::RefCell;

use clap::Parser;

use pushpin_proxy::config::{load_config, loader::resolve_routes_file};
use pushpin_proxy::config::watcher::RoutesWatcher;
use pushpin_proxy::engine::EngineConfig;
use pushpin_proxy::event_loop::EventLoop;
use pushpin_proxy::lifecycle::{Signal, SignalListener};
use pushpin_proxy::observability::{init_logging, init_metrics};
use pushpin_proxy::routing::DomainMap;
use pushpin_proxy::worker::Supervisor;

const DEFAULT_CONFIG: &str = "/etc/pushpin/pushpin.toml";

/// Main-thread registration budget: a handful of timers plus the signal
/// pipe.
const MAIN_REGISTRATIONS_MAX: usize = 110;

#[derive(Parser, Debug)]
#[command(name = "pushpin-proxy", version, about = "Pushpin proxy component.")]
struct Args {
    /// Config file.
    #[arg(long, value_name = "file")]
    config: Option<PathBuf>,

    /// File to log to.
    #[arg(long, value_name = "file")]
    logfile: Option<PathBuf>,

    /// Log level (default: 2).
    #[arg(long, value_name = "x")]
    loglevel: Option<u8>,

    /// Verbose output. Same as --loglevel=3.
    #[arg(long)]
    verbose: bool,

    /// Override ipc_prefix config option.
    #[arg(long = "ipc-prefix", value_name = "prefix")]
    ipc_prefix: Option<String>,

    /// Add route (overrides routes file). May be given multiple times.
    #[arg(long = "route", value_name = "line")]
    route: Vec<String>,

    /// Log update checks as debug level.
    #[arg(long = "quiet-check")]
    quiet_check: bool,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args = Args::parse();

    let level = if args.verbose {
        3
    } else {
        args.loglevel.unwrap_or(2)
    };

    let log_file = match init_logging(level, args.logfile.as_deref()) {
        Ok(log_file) => log_file,
        Err(e) => {
            eprintln!(
                "failed to open log file: {}: {}",
                args.logfile
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                e
            );
            return 1;
        }
    };

    tracing::debug!("starting...");

    if args.quiet_check {
        tracing::debug!("update checks will log at debug level");
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    let mut config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %config_path.display(), error = %e, "failed to load config");
            return 1;
        }
    };

    if let Some(prefix) = args.ipc_prefix.as_deref() {
        config.proxy.apply_ipc_prefix(prefix);
    }

    if !config.proxy.new_event_loop {
        // the embedded-host loop is gone; the native loop serves both
        tracing::debug!("new_event_loop=false ignored; using the native event loop");
    }

    // routes from the CLI override the routes file entirely
    let routes_path = resolve_routes_file(&config_path, &config.proxy.routesfile);
    let domain_map = if !args.route.is_empty() {
        Arc::new(DomainMap::from_lines(&args.route))
    } else {
        match DomainMap::from_file(&routes_path) {
            Ok(map) => Arc::new(map),
            Err(e) => {
                tracing::error!(path = %routes_path.display(), error = %e, "failed to load routes");
                return 1;
            }
        }
    };

    if !config.proxy.prometheus_port.is_empty() {
        match config.proxy.prometheus_port.parse::<u16>() {
            Ok(port) => init_metrics(([0, 0, 0, 0], port).into(), &config.proxy.prometheus_prefix),
            Err(_) => {
                tracing::error!(port = %config.proxy.prometheus_port, "invalid prometheus_port");
                return 1;
            }
        }
    }

    let signal_listener = match SignalListener::start() {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            return 1;
        }
    };

    let mut event_loop = match EventLoop::new(MAIN_REGISTRATIONS_MAX) {
        Ok(event_loop) => event_loop,
        Err(e) => {
            tracing::error!(error = %e, "failed to create event loop");
            return 1;
        }
    };
    let handle = event_loop.handle();

    let engine_config = EngineConfig::from_config(&config);
    let supervisor = match Supervisor::start(&engine_config, config.proxy.workers, Arc::clone(&domain_map)) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            tracing::error!(error = %e, "failed to start workers");
            return 1;
        }
    };

    // routes changes fan out to every worker's deferred-call queue
    domain_map.on_changed(supervisor.change_broadcaster());

    // file-change reload, in addition to SIGHUP
    let _watcher = if args.route.is_empty() {
        let map = Arc::clone(&domain_map);
        match RoutesWatcher::start(&routes_path, move || {
            if let Err(e) = map.reload() {
                tracing::warn!(error = %e, "routes reload failed; keeping previous set");
            }
        }) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(error = %e, "routes file watching unavailable");
                None
            }
        }
    } else {
        None
    };

    let supervisor = Rc::new(RefCell::new(Some(supervisor)));

    {
        let supervisor = Rc::clone(&supervisor);
        let handle = handle.clone();
        let domain_map = Arc::clone(&domain_map);
        let register = signal_listener.register(&event_loop.handle(), move |signal| match signal {
            Signal::Quit => {
                tracing::info!("stopping...");
                if let Some(mut supervisor) = supervisor.borrow_mut().take() {
                    supervisor.stop();
                }
                tracing::debug!("stopped");
                handle.exit(0);
            }
            Signal::Hup => {
                tracing::info!("reloading");
                if let Some(log_file) = log_file.as_ref() {
                    log_file.reopen();
                }
                if let Err(e) = domain_map.reload() {
                    tracing::warn!(error = %e, "routes reload failed; keeping previous set");
                }
            }
        });

        if let Err(e) = register {
            tracing::error!(error = %e, "failed to register signal pipe");
            return 1;
        }
    }

    tracing::info!("started");

    event_loop.exec()
}
