mod adapter;
mod api;
mod auth;
mod convert;
mod db;
mod error;
mod events;
mod ledger;
mod lnd;
mod pipeline;
mod policy;
mod pricing;
mod registry;
mod seed;
mod settler;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use toll_core::db::Database;

use crate::adapter::{AdapterDeps, HttpUpstream, Upstream};
use crate::events::EventBus;
use crate::lnd::LndClient;
use crate::policy::SpendCache;
use crate::pricing::PricingOracle;
use crate::registry::ProviderRegistry;

#[derive(Parser, Debug, Clone)]
struct Args {
    /// Directory path for storing gateway data in a SQLite database.
    #[arg(long, env = "TOLL_DATA_DIR")]
    toll_data_dir: PathBuf,

    /// Network address and port for the HTTP API server to bind to.
    #[arg(long, env = "API_BIND", default_value = "0.0.0.0:8080")]
    api_bind: SocketAddr,

    /// LND REST endpoint used to create and watch Lightning invoices.
    #[arg(long, env = "LND_REST_URL")]
    lnd_rest_url: Option<Url>,

    /// Path to the LND macaroon authorizing invoice operations.
    #[arg(long, env = "LND_MACAROON_PATH")]
    lnd_macaroon_path: Option<PathBuf>,

    /// Accept self-signed TLS certificates from the LND REST endpoint.
    #[arg(long, env = "LND_ACCEPT_INVALID_CERTS", default_value = "false")]
    lnd_accept_invalid_certs: bool,

    /// Expiration time in seconds for all generated funding invoices.
    #[arg(long, env = "INVOICE_EXPIRY_SECS", default_value = "3600")]
    invoice_expiry_secs: u32,

    /// Base URL of the hosted card checkout page.
    #[arg(long, env = "CHECKOUT_BASE_URL")]
    checkout_base_url: Option<Url>,

    /// Shared secret for verifying card checkout webhooks.
    #[arg(long, env = "CHECKOUT_WEBHOOK_SECRET")]
    checkout_webhook_secret: Option<String>,

    /// Shared secret for the admin review routes.
    #[arg(long, env = "TOLL_ADMIN_TOKEN")]
    admin_token: Option<String>,

    /// URL returning the current BTC/USD rate as JSON.
    #[arg(
        long,
        env = "RATE_URL",
        default_value = "https://api.coinbase.com/v2/prices/BTC-USD/spot"
    )]
    rate_url: Url,

    /// Seconds between BTC/USD rate refreshes.
    #[arg(long, env = "RATE_REFRESH_SECS", default_value = "300")]
    rate_refresh_secs: u64,

    /// Deadline in seconds for a single upstream execute call.
    #[arg(long, env = "EXECUTE_DEADLINE_SECS", default_value = "60")]
    execute_deadline_secs: u64,

    /// Hard ceiling in seconds for the whole call pipeline.
    #[arg(long, env = "PIPELINE_DEADLINE_SECS", default_value = "120")]
    pipeline_deadline_secs: u64,

    /// Maximum number of concurrently processed calls; the database pool is
    /// sized to twice this.
    #[arg(long, env = "MAX_CONCURRENT_CALLS", default_value = "16")]
    max_concurrent_calls: u32,

    /// Seconds a cached per-agent daily spend total stays fresh; 0 disables
    /// the cache.
    #[arg(long, env = "SPEND_CACHE_TTL_SECS", default_value = "60")]
    spend_cache_ttl_secs: u64,
}

#[derive(Clone)]
pub struct AppState {
    args: Args,
    db: Database,
    registry: Arc<ProviderRegistry>,
    pricing: Arc<PricingOracle>,
    spend: Arc<SpendCache>,
    events: EventBus,
    upstream: Arc<dyn Upstream>,
    lnd: Option<Arc<LndClient>>,
}

impl AppState {
    fn execute_deadline(&self) -> Duration {
        Duration::from_secs(self.args.execute_deadline_secs)
    }

    fn pipeline_deadline(&self) -> Duration {
        Duration::from_secs(self.args.pipeline_deadline_secs)
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");

    info!("Signal received, shutting down gracefully...");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    ensure!(
        args.toll_data_dir.is_dir(),
        "Toll data dir is not a directory"
    );

    info!("Starting Toll Gateway...");

    let db = Database::new(
        &args.toll_data_dir,
        toll_daemon_db::MIGRATIONS,
        args.max_concurrent_calls * 2,
    )?;

    let pricing = Arc::new(PricingOracle::new(db.clone()));

    pricing.load_rate_from_db().await?;

    let upstream: Arc<dyn Upstream> = Arc::new(HttpUpstream::new()?);

    let registry = Arc::new(ProviderRegistry::new());

    seed::seed_services(&db).await?;

    seed::register_providers(
        &db,
        &registry,
        AdapterDeps {
            pricing: pricing.clone(),
            upstream: upstream.clone(),
        },
    )
    .await?;

    let lnd = match (&args.lnd_rest_url, &args.lnd_macaroon_path) {
        (Some(rest_url), Some(macaroon_path)) => Some(Arc::new(LndClient::new(
            rest_url.clone(),
            macaroon_path,
            args.lnd_accept_invalid_certs,
        )?)),
        _ => None,
    };

    let state = AppState {
        args: args.clone(),
        db,
        registry,
        pricing: pricing.clone(),
        spend: Arc::new(SpendCache::new(Duration::from_secs(args.spend_cache_ttl_secs))),
        events: EventBus::new(1000),
        upstream,
        lnd,
    };

    let ct = CancellationToken::new();

    tokio::spawn(pricing.run(
        args.rate_url.clone(),
        Duration::from_secs(args.rate_refresh_secs),
        ct.child_token(),
    ));

    tokio::spawn(settler::run_invoice_settler(state.clone(), ct.child_token()));

    tokio::spawn(settler::run_invoice_expiry(state.clone(), ct.child_token()));

    let listener = TcpListener::bind(args.api_bind)
        .await
        .context("Failed to bind to API address")?;

    info!(api_bind = ?args.api_bind, "API server listening");

    axum::serve(listener, api::router().with_state(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Failed to start HTTP server")?;

    ct.cancel();

    info!("Graceful shutdown complete");

    Ok(())
}

/// Bare state for unit tests: empty registry, no rate, no node
#[cfg(test)]
pub fn test_state(db: Database) -> AppState {
    let args = Args::parse_from(["toll-daemon", "--toll-data-dir", "/tmp"]);

    AppState {
        args,
        registry: Arc::new(ProviderRegistry::new()),
        pricing: Arc::new(PricingOracle::new(db.clone())),
        spend: Arc::new(SpendCache::new(Duration::from_secs(60))),
        events: EventBus::new(256),
        upstream: Arc::new(HttpUpstream::new().expect("Failed to build test upstream")),
        lnd: None,
        db,
    }
}
