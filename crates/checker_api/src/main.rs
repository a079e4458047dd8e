//! email-checker service entry point.
//!
//! Runs either as a one-shot CLI that validates a comma-separated list of
//! emails, or as an HTTP server with a worker pool. Cluster mode is
//! implied by configuring a shared key-value store; authentication by
//! configuring a database.

use anyhow::Context;
use axum::Router;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use checker_core::auth::AuthService;
use checker_core::cache::{CacheProvider, MemoryCache, SharedCache};
use checker_core::helo::{Counter, HeloRotator, MemoryCounter, SharedCounter};
use checker_core::metrics::Metrics;
use checker_core::mx::MxResolver;
use checker_core::pipeline::EmailChecker;
use checker_core::smtp::{ProberConfig, SmtpProber};
use checker_core::storage::{MemoryStore, RedisStore, TaskStore};
use checker_core::throttle::ThrottleManager;
use checker_core::webhook::WebhookDispatcher;
use checker_core::worker::WorkerPool;
use checker_core::{CheckerConfig, KvClient};

mod config;
mod error;
mod loader;
mod middleware;
mod routes;
mod state;

use config::{load_config, AppConfig};
pub use state::AppState;

/// Bulk email validation service.
#[derive(Debug, Parser)]
#[command(name = "email-checker", version, about)]
pub struct Args {
    /// Comma-separated list of emails for one-shot mode.
    #[arg(long, env = "EMAIL_CHECKER_EMAILS")]
    pub emails: Option<String>,

    /// DNS server IP address for MX lookups.
    #[arg(long, env = "EMAIL_CHECKER_DNS")]
    pub dns: Option<String>,

    /// Number of concurrent workers.
    #[arg(long, env = "EMAIL_CHECKER_WORKERS")]
    pub workers: Option<usize>,

    /// Run in server mode.
    #[arg(long, env = "EMAIL_CHECKER_SERVER")]
    pub server: bool,

    /// Server port.
    #[arg(long, env = "EMAIL_CHECKER_PORT")]
    pub port: Option<u16>,

    /// Shared store addresses (host:port); more than one selects cluster
    /// topology.
    #[arg(long, env = "EMAIL_CHECKER_REDIS", value_delimiter = ',')]
    pub redis: Vec<String>,

    #[arg(long = "redis-pass", env = "EMAIL_CHECKER_REDIS_PASS")]
    pub redis_pass: Option<String>,

    #[arg(long = "redis-db", env = "EMAIL_CHECKER_REDIS_DB")]
    pub redis_db: Option<i64>,

    #[arg(long = "pg-host", env = "EMAIL_CHECKER_PG_HOST")]
    pub pg_host: Option<String>,

    #[arg(long = "pg-port", env = "EMAIL_CHECKER_PG_PORT")]
    pub pg_port: Option<u16>,

    #[arg(long = "pg-user", env = "EMAIL_CHECKER_PG_USER")]
    pub pg_user: Option<String>,

    #[arg(long = "pg-password", env = "EMAIL_CHECKER_PG_PASSWORD")]
    pub pg_password: Option<String>,

    #[arg(long = "pg-db", env = "EMAIL_CHECKER_PG_DB")]
    pub pg_db: Option<String>,

    /// Database SSL mode (disable/require/verify-full).
    #[arg(long = "pg-ssl", env = "EMAIL_CHECKER_PG_SSL")]
    pub pg_ssl: Option<String>,

    /// Admin key expected on X-Admin-Key.
    #[arg(long = "admin-key", env = "EMAIL_CHECKER_ADMIN_KEY")]
    pub admin_key: Option<String>,

    /// Comma-separated HELO/EHLO rotation domains. Required.
    #[arg(long = "helo-domains", env = "EMAIL_CHECKER_HELO_DOMAINS", value_delimiter = ',')]
    pub helo_domains: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = load_config()?;
    config.apply_args(&args);

    init_tracing(&config)?;
    info!("email-checker v{}", env!("CARGO_PKG_VERSION"));

    if args.server {
        run_server(config).await
    } else {
        run_once(&args, config).await
    }
}

/// Components shared by the CLI and server modes.
struct Engine {
    checker: Arc<EmailChecker>,
    cache: Arc<dyn CacheProvider>,
    metrics: Arc<Metrics>,
}

async fn build_engine(config: &AppConfig, kv: Option<KvClient>) -> anyhow::Result<Engine> {
    let checker_config = CheckerConfig {
        max_workers: config.engine.max_workers,
        ..CheckerConfig::default()
    };

    let cache: Arc<dyn CacheProvider> = match &kv {
        Some(kv) => Arc::new(SharedCache::new(kv.clone())),
        None => Arc::new(MemoryCache::new()),
    };

    let counter: Arc<dyn Counter> = match &kv {
        Some(kv) => Arc::new(SharedCounter::new(kv.clone())),
        None => Arc::new(MemoryCounter::default()),
    };
    let rotator = Arc::new(HeloRotator::new(
        config.engine.helo_domains.clone(),
        counter,
    )?);

    let dns_server: IpAddr = config
        .engine
        .dns_server
        .parse()
        .with_context(|| format!("invalid DNS server {:?}", config.engine.dns_server))?;
    let resolver = Arc::new(MxResolver::new(dns_server, cache.clone(), &checker_config)?);

    let oracle = Arc::new(loader::load_disposable_domains().await?);
    let throttle = Arc::new(ThrottleManager::new(cache.clone()));
    let metrics = Arc::new(Metrics::default());
    let prober = Arc::new(
        SmtpProber::new(rotator, throttle, ProberConfig::default())
            .with_metrics(metrics.clone()),
    );

    let checker = Arc::new(EmailChecker::new(
        checker_config,
        cache.clone(),
        resolver,
        oracle,
        prober,
    ));

    Ok(Engine {
        checker,
        cache,
        metrics,
    })
}

/// One-shot mode: validate `--emails` and print the reports as JSON.
async fn run_once(args: &Args, config: AppConfig) -> anyhow::Result<()> {
    let raw = args
        .emails
        .as_deref()
        .context("please provide emails using --emails")?;
    let emails: Vec<String> = raw
        .split(',')
        .map(|email| email.trim().to_string())
        .filter(|email| !email.is_empty())
        .collect();

    info!(count = emails.len(), "starting one-shot processing");
    let engine = build_engine(&config, None).await?;
    let reports = engine.checker.process_emails(&emails).await;

    println!("{}", serde_json::to_string_pretty(&reports)?);
    info!(count = reports.len(), "processing completed");
    Ok(())
}

async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    let cluster_mode = config.cluster_mode();

    let kv = if cluster_mode {
        Some(
            KvClient::connect(
                &config.redis.addrs,
                &config.redis.password,
                config.redis.db,
            )
            .await?,
        )
    } else {
        None
    };

    let db = if config.postgres_configured() {
        let pool = PgPoolOptions::new()
            .max_connections(25)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.postgres_url())
            .await
            .context("connecting to database")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("running database migrations")?;
        info!(host = %config.postgres.host, "database connected");
        Some(pool)
    } else {
        info!("no database configured, running unauthenticated");
        None
    };

    let engine = build_engine(&config, kv.clone()).await?;

    let store: Arc<dyn TaskStore> = match &kv {
        Some(kv) => Arc::new(RedisStore::new(kv.clone(), engine.cache.clone())),
        None => Arc::new(MemoryStore::new(engine.cache.clone())),
    };

    let auth = db
        .as_ref()
        .map(|pool| Arc::new(AuthService::new(pool.clone(), kv.clone(), cluster_mode)));

    let webhooks = Arc::new(WebhookDispatcher::new(kv.clone(), engine.metrics.clone()));
    let pool = Arc::new(WorkerPool::new(
        store.clone(),
        engine.checker.clone(),
        webhooks,
        auth.clone(),
        kv.clone(),
        engine.metrics.clone(),
        config.engine.max_workers,
    ));
    let _worker_handles = pool.start();

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;

    let state = Arc::new(AppState {
        config,
        store,
        cache: engine.cache,
        auth,
        db,
        metrics: engine.metrics,
    });
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, cluster_mode, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server shut down gracefully");
    Ok(())
}

fn create_router(state: Arc<AppState>) -> Router {
    routes::build_routes(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
}

fn init_tracing(config: &AppConfig) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.observability.log_level.clone().into());

    if config.observability.json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("received SIGTERM, starting graceful shutdown");
        },
    }
}
