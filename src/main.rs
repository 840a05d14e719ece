//! LruKV - An In-Memory LRU Cache Server
//!
//! This is the main entry point for the LruKV server.
//! It parses the command line, sets up logging and storage, and runs the
//! selected transport until Ctrl+C.

use anyhow::Context;
use lrukv::config::{help_text, Cli, NetworkKind, ServerConfig};
use lrukv::connection::{mt_nonblocking, st_coroutine, st_nonblocking, BlockingServer, Service};
use lrukv::storage;
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tokio::signal;
use tokio::task::LocalSet;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn main() -> anyhow::Result<()> {
    let config = match ServerConfig::from_args(std::env::args().skip(1)) {
        Ok(Cli::Run(config)) => config,
        Ok(Cli::Help) => {
            println!("{}", help_text());
            return Ok(());
        }
        Ok(Cli::Version) => {
            println!("LruKV version {}", lrukv::VERSION);
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("{}", help_text());
            std::process::exit(1);
        }
    };

    init_logging(&config.log_level)?;
    print_banner(&config);

    let storage = storage::build(config.storage, config.capacity, config.shards)
        .context("Failed to create storage")?;
    info!(
        backend = %config.storage,
        capacity = config.capacity,
        shards = config.shards,
        "Storage initialized"
    );

    let service = Service::new(storage)
        .with_max_output_queue(config.max_output_queue)
        .with_max_item_size(config.max_item_size);

    match config.network {
        NetworkKind::StNonblocking => run_st_nonblocking(&config, service)?,
        NetworkKind::MtNonblocking => run_mt_nonblocking(&config, service)?,
        NetworkKind::MtBlocking => run_mt_blocking(&config, service)?,
        NetworkKind::StCoroutine => run_st_coroutine(&config, service)?,
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Sets up `tracing`; `RUST_LOG` wins over `--log-level`.
fn init_logging(default_filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .with_context(|| format!("Invalid log filter: {}", default_filter))?;

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to install log subscriber")
}

fn print_banner(config: &ServerConfig) {
    println!(
        r#"
LruKV v{} - In-Memory LRU Cache Server
──────────────────────────────────────────────────────────────
Address:   {}
Network:   {}
Storage:   {} ({} bytes{})
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        lrukv::VERSION,
        config.bind_address(),
        config.network,
        config.storage,
        config.capacity,
        match config.storage {
            lrukv::StorageKind::Striped => format!(", {} shards", config.shards),
            lrukv::StorageKind::Lru => String::new(),
        },
    );
}

/// Resolves once Ctrl+C is pressed.
async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping server..."),
        Err(e) => {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    }
}

fn run_st_nonblocking(config: &ServerConfig, service: Service) -> anyhow::Result<()> {
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    LocalSet::new().block_on(&runtime, async {
        let listener = bind(config).await?;
        st_nonblocking::serve(listener, service, shutdown_signal()).await?;
        Ok(())
    })
}

fn run_mt_nonblocking(config: &ServerConfig, service: Service) -> anyhow::Result<()> {
    let runtime = Builder::new_multi_thread()
        .worker_threads(config.workers)
        .thread_name("lrukv-reactor")
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    runtime.block_on(async {
        let listener = bind(config).await?;
        mt_nonblocking::serve(listener, service, shutdown_signal()).await?;
        Ok(())
    })
}

fn run_mt_blocking(config: &ServerConfig, service: Service) -> anyhow::Result<()> {
    let listener = std::net::TcpListener::bind(config.bind_address())
        .with_context(|| format!("Failed to bind {}", config.bind_address()))?;
    let mut server = BlockingServer::start(listener, service, config.blocking_options())
        .context("Failed to start blocking server")?;

    // Only used to wait for the signal
    Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?
        .block_on(shutdown_signal());

    server.stop();
    Ok(())
}

fn run_st_coroutine(config: &ServerConfig, service: Service) -> anyhow::Result<()> {
    let listener = std::net::TcpListener::bind(config.bind_address())
        .with_context(|| format!("Failed to bind {}", config.bind_address()))?;
    st_coroutine::serve(listener, service, shutdown_signal()).context("Coroutine server failed")
}

async fn bind(config: &ServerConfig) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address()))?;
    info!("Listening on {}", config.bind_address());
    Ok(listener)
}
