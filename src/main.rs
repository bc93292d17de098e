use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tollgate::adapter::RateLimitGuard;
use tollgate::config::{LoggingConfig, TollgateConfig};
use tollgate::{CounterStore, LimiterStore, MemoryStore, RedisStore};

#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about = "Shared-store rate limiter")]
struct Cli {
    /// YAML configuration file; TOLLGATE__* variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run rate limit checks for an identifier and print each verdict
    Check {
        identifier: String,

        /// Number of checks to run
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,

        /// Pause between checks, in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        /// Use an in-process store instead of Redis
        #[arg(long)]
        memory: bool,
    },
    /// Check that the counter store is reachable
    Ping,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TollgateConfig::load(cli.config.as_deref())?;

    init_tracing(&config.logging);

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &cli.config {
        info!(path = %path.display(), "Loaded configuration");
    }

    match cli.command {
        Command::Ping => {
            let store = RedisStore::connect(&config.store).await?;
            store.ping().await?;
            println!("PONG");
            store.close().await;
        }
        Command::Check {
            identifier,
            count,
            interval_ms,
            memory,
        } => {
            let redis = if memory {
                None
            } else {
                Some(RedisStore::connect(&config.store).await?)
            };
            let store: Arc<dyn CounterStore> = match &redis {
                Some(redis) => Arc::new(redis.clone()),
                None => Arc::new(MemoryStore::new()),
            };

            let limiter = Arc::new(LimiterStore::from_config(&config, store)?);
            info!(
                quota = limiter.policy().quota(),
                capacity = limiter.policy().capacity(),
                window = ?limiter.policy().window(),
                "Rate limiter initialized"
            );
            let guard = RateLimitGuard::with_config(limiter, &config.adapter);

            tokio::select! {
                result = run_checks(&guard, &identifier, count, interval_ms) => result?,
                _ = shutdown_signal() => {}
            }

            if let Some(redis) = redis {
                redis.close().await;
            }
        }
    }

    info!("Tollgate stopped");
    Ok(())
}

async fn run_checks(
    guard: &RateLimitGuard<LimiterStore>,
    identifier: &str,
    count: u32,
    interval_ms: u64,
) -> anyhow::Result<()> {
    for i in 0..count {
        if i > 0 && interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
        let verdict = guard.evaluate_identifier(identifier).await;
        println!(
            "{} {}",
            verdict.status_code(),
            serde_json::to_string(&verdict)?
        );
    }
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
