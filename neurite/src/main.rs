use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use neurite::config::{init_logging, Config};
use neurite::routes;
use neurite::state::AppState;
use neurite::uia;
use neurite::users::Privileges;
use neurite_core::random_string;
use neurite_db::Db;
use neurite_http::Listener;
use neurite_scheduler::Scheduler;

/// The scheduler wakes up once a minute.
const SCHEDULER_TICK: Duration = Duration::from_secs(60);
/// Stale UIA sessions are collected every half hour.
const UIA_CLEANUP_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Parser)]
#[command(
    name = "neurite",
    version,
    about = "A Matrix homeserver over a flat-file JSON object store"
)]
struct Args {
    /// Data directory holding the object store
    #[arg(short = 'd', long = "data-dir")]
    data_dir: std::path::PathBuf,

    /// Log at debug level regardless of the configured log level
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("unable to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(args))
}

async fn run(args: Args) -> ExitCode {
    // The store opens with caching off; the configured ceiling is applied
    // once the configuration has been read from it.
    let db = match Db::open(&args.data_dir, 0) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("unable to open data directory as a database: {e}");
            return ExitCode::FAILURE;
        }
    };

    // First run against an empty data directory: write a default config
    // and mint a single-use, all-privilege registration token so an admin
    // account can be created.
    let admin_token = if Config::exists(&db) {
        None
    } else {
        if let Err(e) = Config::create_default(&db).await {
            eprintln!("unable to create default configuration: {e}");
            return ExitCode::FAILURE;
        }
        let token = random_string(32);
        match neurite::regtoken::create(&db, &token, None, 0, 1, Privileges::ALL).await {
            Ok(Some(_)) => Some(token),
            Ok(None) | Err(_) => {
                eprintln!("unable to create admin registration token");
                return ExitCode::FAILURE;
            }
        }
    };

    let config = match Config::load(&db).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("unable to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config.log, args.verbose) {
        eprintln!("unable to set up logging: {e}");
        return ExitCode::FAILURE;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        server_name = %config.server_name,
        "starting neurite"
    );

    if let Some(token) = admin_token {
        tracing::info!("a default configuration was created in the database");
        tracing::info!("admin registration token: {token}");
        tracing::info!("it grants ALL privileges and is valid for one registration");
    }

    let pid_file = config.pid.clone();
    if let Some(path) = &pid_file {
        if let Err(e) = std::fs::write(path, format!("{}\n", std::process::id())) {
            tracing::error!(path = %path, error = %e, "couldn't write PID file");
            return ExitCode::FAILURE;
        }
    }

    tracing::debug!(base_url = %config.base_url(), "configuration loaded");
    tracing::debug!(
        max_cache = config.max_cache,
        registration = config.registration,
        federation = config.federation,
        "applying settings"
    );

    if config.max_cache == 0 {
        tracing::warn!("database caching is disabled; set maxCache if this is not intended");
    }
    db.set_max_cache(config.max_cache as usize);

    if config.run_as.is_some() {
        tracing::warn!("runAs is configured, but privilege dropping is not performed; run under a process supervisor instead");
    }

    let cancel = CancellationToken::new();

    let scheduler = Scheduler::new(SCHEDULER_TICK);
    let cleanup_db = db.clone();
    scheduler
        .every("uia-session-cleanup", UIA_CLEANUP_INTERVAL, move || {
            let db = cleanup_db.clone();
            async move { uia::cleanup(&db).await }
        })
        .await;
    let scheduler_handle = scheduler.start(cancel.clone());
    tracing::info!("job scheduler started");

    let app = routes::router(AppState::new(db.clone()));

    // Bind every listener before serving any of them, so a bad config
    // fails fast instead of leaving a half-listening server.
    let mut listeners = Vec::new();
    for listener_config in config.listener_configs() {
        match Listener::bind(&listener_config) {
            Ok(listener) => listeners.push(listener),
            Err(e) => {
                tracing::error!(port = listener_config.port, error = %e, "unable to bind listener");
                cancel.cancel();
                return ExitCode::FAILURE;
            }
        }
    }

    let mut serve_handles = Vec::new();
    for listener in listeners {
        serve_handles.push(tokio::spawn(listener.serve(app.clone(), cancel.clone())));
    }

    wait_for_shutdown_signal().await;
    tracing::info!("shutting down");
    cancel.cancel();

    for handle in serve_handles {
        let _ = handle.await;
    }
    let _ = scheduler_handle.await;

    if let Some(path) = &pid_file {
        let _ = std::fs::remove_file(path);
    }

    tracing::info!("goodbye");
    ExitCode::SUCCESS
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::error!(error = %e, "unable to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
