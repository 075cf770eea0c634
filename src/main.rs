// Tip Ledger Server
// Custodial tipping ledger + operator relay over HTTP

use anyhow::Result;
use chrono::Duration;
use std::sync::Arc;
use tip_ledger::api;
use tip_ledger::clock::{Clock, SystemClock};
use tip_ledger::command::CommandParser;
use tip_ledger::config::Config;
use tip_ledger::custody::{Custody, HttpCustody, TrackingCustody};
use tip_ledger::store::{MemoryStore, PgStore, Store};
use tip_ledger::{ServiceSettings, TipService};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const MAX_DB_CONNECTIONS: u32 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tip_ledger=info".parse()?)
                .add_directive("sqlx=warn".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!("Starting Tip Ledger Server");

    let config = Config::from_env()?;
    config.log_summary();

    match (&config.database_url, &config.custody_url) {
        (Some(url), Some(custody)) => {
            let store = PgStore::connect(url, MAX_DB_CONNECTIONS).await?;
            serve(config.clone(), store, HttpCustody::new(custody)).await
        }
        (Some(url), None) => {
            let store = PgStore::connect(url, MAX_DB_CONNECTIONS).await?;
            warn!("CUSTODY_URL not set, custody is tracked in-process only");
            serve(config.clone(), store, TrackingCustody::new()).await
        }
        (None, Some(custody)) => {
            warn!("DATABASE_URL not set, ledger state is kept in memory");
            serve(config.clone(), MemoryStore::new(), HttpCustody::new(custody)).await
        }
        (None, None) => {
            warn!("DATABASE_URL not set, ledger state is kept in memory");
            serve(config.clone(), MemoryStore::new(), TrackingCustody::new()).await
        }
    }
}

async fn serve<S: Store, K: Custody>(config: Config, store: S, custody: K) -> Result<()> {
    let store = Arc::new(store);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let settings = ServiceSettings {
        admin: config.admin.clone(),
        fee_account: config.fee_account.clone(),
        fees: config.fee_schedule()?,
        dedup_retention: Duration::hours(config.dedup_retention_hours),
        parser: CommandParser::new(config.tokens.clone(), config.bot_handle.as_deref()),
    };
    let service = TipService::new(store, Arc::new(custody), clock, settings);

    // Seed supported tokens from configuration
    for spec in &config.tokens {
        if service.add_supported_token(&config.admin, &spec.token).await? {
            info!("Seeded supported token {} ({})", spec.symbol, spec.token);
        }
    }

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build router
    let app = api::router(service)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Tip Ledger listening on {}", listener.local_addr()?);

    axum::serve(listener, app.into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))
}
