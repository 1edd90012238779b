// Citadel CLI - engine lifecycle commands
//
// `start` runs the engine in the foreground until a signal or a control
// `stop` arrives; `stop` and `status` talk to the running engine over
// its control socket. Exit code 0 means a clean stop; a forced queue
// drain exits non-zero.

mod control;
mod tracing;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::UnixListener;
use tokio::sync::mpsc;

use citadel_config::{load_config, CitadelConfig};
use citadel_engine::auth::StoreAuthProvider;
use citadel_engine::stream::LoginConfig;
use citadel_engine::users::MemoryUserStore;
use citadel_engine::{Engine, EngineConfig, QueueConfig};

#[derive(Parser)]
#[command(name = "citadel", version, about = "Multi-user server engine")]
struct Cli {
    /// Configuration file (default: $CITADEL_CONFIG or ~/.citadel/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine in the foreground
    Start,
    /// Stop a running engine
    Stop,
    /// Report a running engine's status
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("citadel: {err}");
            return ExitCode::FAILURE;
        }
    };

    let outcome = match cli.command {
        Command::Start => run_start(&config).await,
        Command::Stop => run_stop(&config).await,
        Command::Status => run_status(&config).await,
    };

    match outcome {
        Ok(code) => code,
        Err(err) => {
            eprintln!("citadel: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_start(config: &CitadelConfig) -> Result<ExitCode> {
    crate::tracing::init_tracing(&config.log.level);

    // The in-memory store stands in for the external user store; real
    // deployments wire their own UserStore/AuthProvider pair here.
    let users = Arc::new(MemoryUserStore::new());
    let auth = Arc::new(StoreAuthProvider::new(users));
    let engine = Engine::new(engine_config(config), auth);

    engine.start().await.context("engine start failed")?;

    let socket_path = &config.engine.control_socket;
    // A stale socket from a crashed run would block the bind.
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("cannot bind control socket {}", socket_path.display()))?;

    let (stop_tx, mut stop_rx) = mpsc::channel(1);
    let control = tokio::spawn(control::serve(listener, engine.handle(), stop_tx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            eprintln!("citadel: interrupt, stopping");
        }
        _ = stop_rx.recv() => {
            eprintln!("citadel: stop requested");
        }
    }

    control.abort();
    let clean = engine.stop().await.context("engine stop failed")?;
    let _ = std::fs::remove_file(socket_path);

    if clean {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("citadel: queue drain timed out; workers were terminated");
        Ok(ExitCode::FAILURE)
    }
}

async fn run_stop(config: &CitadelConfig) -> Result<ExitCode> {
    let response =
        control::request(&config.engine.control_socket, control::Request::Stop).await?;
    println!("{response}");
    Ok(ExitCode::SUCCESS)
}

async fn run_status(config: &CitadelConfig) -> Result<ExitCode> {
    let response =
        control::request(&config.engine.control_socket, control::Request::Status).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(ExitCode::SUCCESS)
}

fn engine_config(config: &CitadelConfig) -> EngineConfig {
    let defaults = QueueConfig::default();
    let max_workers = if config.queue.max_workers == 0 {
        defaults.max_workers
    } else {
        config.queue.max_workers
    };
    EngineConfig {
        tick_length: Duration::from_millis(config.engine.tick_length_ms),
        queue: QueueConfig {
            min_workers: config.queue.min_workers,
            max_workers,
            supervisor_threshold: Duration::from_millis(config.queue.supervisor_threshold_ms),
        },
        login: LoginConfig {
            max_tries: config.login.max_tries,
            timeout: Duration::from_millis(config.login.timeout_ms),
            banner: config.login.banner.clone(),
        },
        shutdown_timeout: Duration::from_millis(config.queue.shutdown_timeout_ms),
    }
}
