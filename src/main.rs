use std::sync::Arc;

use anyhow::Context;

use cloudcode_proxy::account::AccountPool;
use cloudcode_proxy::api::{router, AppState};
use cloudcode_proxy::config::{CliOverrides, Config};
use cloudcode_proxy::failover::FailoverController;
use cloudcode_proxy::health::{HealthPolicy, HealthTracker};
use cloudcode_proxy::models::ModelCatalog;
use cloudcode_proxy::scheduler::build_scheduler;
use cloudcode_proxy::token_provider::StaticTokenProvider;
use cloudcode_proxy::transport::{build_client, UpstreamTransport};
use cloudcode_proxy::translator::Translators;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(err) = run().await {
        tracing::error!(error = %err, "fatal startup error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let cli = CliOverrides::parse(std::env::args()).context("parsing CLI flags")?;

    let mut config = Config::from_env().context("loading configuration from environment")?;
    config.apply_cli(&cli);

    init_tracing(config.debug);

    // DFS cycle check happens inside ModelCatalog::new; a fixed catalog today,
    // but kept fallible so a future configurable catalog refuses to start
    // rather than deadlocking the failover loop on a fallback cycle.
    let catalog = Arc::new(ModelCatalog::default_catalog());

    let pool = Arc::new(AccountPool::load(config.accounts_file.clone()).await.context("loading account pool")?);
    if config.trigger_reset {
        pool.clear_all_rate_limits().await.context("clearing rate limits for --trigger-reset")?;
        tracing::info!("cleared rate-limit records for all accounts (--trigger-reset)");
    }

    let health = Arc::new(HealthTracker::new(pool.clone(), HealthPolicy::from(&config)));
    let scheduler = build_scheduler(
        config.default_strategy,
        pool.clone(),
        health.clone(),
        config.global_quota_threshold,
        config.max_wait_before_error,
    );

    let client = build_client().context("building upstream HTTP client")?;
    let transport = Arc::new(UpstreamTransport::new(client, config.endpoint_fallbacks.clone(), config.request_timeout));
    let translators = Arc::new(Translators::new());
    let token_provider = Arc::new(StaticTokenProvider::new());

    let failover = Arc::new(FailoverController {
        catalog: catalog.clone(),
        scheduler,
        health: health.clone(),
        token_provider,
        transport,
        translators,
        fallback_enabled: config.fallback_enabled,
        max_wait_before_error: config.max_wait_before_error,
        thinking_tag_mode: config.thinking_tag_mode,
    });

    let state = Arc::new(AppState {
        failover,
        catalog,
        health,
        proxy_secret: config.proxy_secret.clone(),
    });

    let app = router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, strategy = ?config.default_strategy, "cloudcode-proxy listening");

    let listener = tokio::net::TcpListener::bind(addr).await.context("binding listen address")?;
    axum::serve(listener, app).await.context("serving requests")?;

    Ok(())
}

fn init_tracing(debug: bool) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let default_level = if debug { "cloudcode_proxy=debug,tower_http=debug" } else { "cloudcode_proxy=info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
