//! maprelay - Sign-in relay for synthetic device registration
//!
//! Serves the provider's mobile sign-in pages through a reverse proxy so a
//! browser can complete the login, then registers a new device with the
//! captured access token and stores its credentials.

use anyhow::Result;
use clap::Parser;
use maprelay_auth::{BundleStore, SessionPool};
use maprelay_core::Config;
use maprelay_proxy::ProxyOptions;
use maprelay_server::{create_router, AppState};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

/// maprelay - Register devices through a proxied mobile sign-in
#[derive(Parser, Debug)]
#[command(name = "maprelay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to bind the HTTP server to
    #[arg(short, long, default_value = "127.0.0.1", env = "MAPRELAY_BIND")]
    bind: IpAddr,

    /// Server port
    #[arg(short, long, default_value = "8080", env = "MAPRELAY_PORT")]
    port: u16,

    /// Browser-facing base URL (defaults to http://<Host header>)
    #[arg(long, env = "MAPRELAY_PUBLIC_URL")]
    public_url: Option<String>,

    /// Lifetime of a login attempt in seconds
    #[arg(long, default_value = "300", env = "MAPRELAY_SESSION_TTL")]
    ttl: i64,

    /// Seconds between sweeps of expired login attempts
    #[arg(long, default_value = "60", env = "MAPRELAY_SWEEP_INTERVAL")]
    sweep_interval: u64,

    /// Timeout for requests to the provider in seconds
    #[arg(long, default_value = "30", env = "MAPRELAY_TIMEOUT")]
    timeout: u64,

    /// Path of the registered-device store
    #[arg(long, env = "MAPRELAY_STORE_PATH")]
    store_path: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(log_level.into())
                .add_directive("hyper=warn".parse()?),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    info!("maprelay v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::new()
        .with_bind(args.bind)
        .with_port(args.port)
        .with_public_url(args.public_url)
        .with_session_ttl(args.ttl)
        .with_sweep_interval(args.sweep_interval)
        .with_request_timeout(args.timeout)
        .with_store_path(args.store_path);
    config.validate()?;

    let store = match &config.store_path {
        Some(path) => BundleStore::with_path(path.clone()).await?,
        None => BundleStore::new().await?,
    };
    info!(
        "Device store at {:?} ({} devices)",
        store.path(),
        store.count().await
    );

    let pool = Arc::new(SessionPool::new(
        ProxyOptions::default().with_timeout(config.request_timeout()),
    ));

    // Expired login attempts are also evicted lazily on lookup
    let sweeper = {
        let pool = pool.clone();
        let period = config.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let swept = pool.sweep_expired().await;
                if swept > 0 {
                    debug!("Sweeper removed {} login sessions", swept);
                }
            }
        })
    };

    let addr = SocketAddr::new(config.bind, config.port);
    let state = Arc::new(AppState::new(config, pool, Arc::new(store)));
    let router = create_router(state);

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    sweeper.abort();
    info!("Goodbye!");
    Ok(())
}
