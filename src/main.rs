//! Flashguard demo
//!
//! Seeds an in-memory store, then drives the two protected paths:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           flashguard                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  Read storm  │───▶│  CacheAside  │───▶│  Repository  │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  Flash sale  │───▶│   Seckill    │───▶│ Transaction  │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! With `--metrics-addr` the process keeps serving `/metrics` until Ctrl-C.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use flashguard::adapters::{InMemoryCacheStore, InMemoryDatabase, LoggingEventPublisher};
use flashguard::cache::{warm_up_filter, CacheAside, ExistenceFilter, KeySpace, TypeListCache};
use flashguard::domain::model::{RequestContext, SeckillVoucher, Shop, ShopType, VoucherId};
use flashguard::domain::ports::CacheStore;
use flashguard::seckill::UserLockMode;
use flashguard::{GuardConfig, GuardMetrics, IdGenerator, SeckillPipeline};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Flashguard - cache guard and flash-sale admission demo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "FLASHGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Number of shops to seed
    #[arg(long, env = "FLASHGUARD_SHOPS", default_value = "100")]
    shops: i64,

    /// Concurrent readers in the read storm
    #[arg(long, env = "FLASHGUARD_READERS", default_value = "200")]
    readers: usize,

    /// Distinct users in the flash sale
    #[arg(long, env = "FLASHGUARD_USERS", default_value = "500")]
    users: i64,

    /// Voucher stock for the flash sale
    #[arg(long, env = "FLASHGUARD_STOCK", default_value = "100")]
    stock: i32,

    /// Per-user lock mode; overrides the config file
    #[arg(long, env = "FLASHGUARD_LOCK_MODE", value_enum)]
    lock_mode: Option<UserLockMode>,

    /// Redis URL; overrides the config file
    #[cfg(feature = "redis")]
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Serve /metrics on this address after the demo
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Log every order and invalidation event at info level
    #[arg(long, env = "FLASHGUARD_LOG_EVENTS")]
    log_events: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => GuardConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => GuardConfig::default(),
    };
    if let Some(mode) = args.lock_mode {
        config.seckill.lock_mode = mode;
    }

    info!("Starting flashguard demo");
    info!("  Shops: {}", args.shops);
    info!("  Readers: {}", args.readers);
    info!("  Users: {}, stock: {}", args.users, args.stock);
    info!("  User lock mode: {:?}", config.seckill.lock_mode);

    let metrics = Arc::new(GuardMetrics::new()?);
    let cache = cache_store(&args, &config).await?;
    let db = seed(&args);

    // Existence filter
    let filter = Arc::new(ExistenceFilter::with_config(config.filter_config())?);
    let keys = KeySpace::shop();
    warm_up_filter::<Shop>(&db, &filter, &keys).await?;

    let reader = CacheAside::new(
        Arc::clone(&cache),
        Arc::new(db.clone()),
        filter,
        keys,
        config.reader_config(),
        Arc::clone(&metrics),
    )
    .with_events(Arc::new(event_log(&args)));

    run_read_storm(&reader, &db, &args).await;

    let types = TypeListCache::new(Arc::clone(&cache), Arc::new(db.clone()), Arc::clone(&metrics));
    let listed = types.list().await?;
    info!(count = listed.len(), "Shop types listed");

    // Flash sale
    let ids = IdGenerator::with_config(Arc::clone(&cache), &config.id)
        .with_metrics(Arc::clone(&metrics));
    let pipeline = Arc::new(SeckillPipeline::new(
        Arc::new(db.clone()),
        Arc::clone(&cache),
        ids,
        config.seckill_config(),
        Arc::new(event_log(&args)),
        Arc::clone(&metrics),
    ));
    run_flash_sale(pipeline, &db, &args).await;

    if let Some(addr) = args.metrics_addr.clone() {
        let served = Arc::clone(&metrics);
        tokio::select! {
            result = run_metrics_server(&addr, served) => {
                if let Err(e) = result {
                    error!("Metrics server error: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C");
            }
        }
    }

    info!("Demo complete");
    Ok(())
}

// =============================================================================
// Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "redis=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

fn event_log(args: &Args) -> LoggingEventPublisher {
    if args.log_events {
        LoggingEventPublisher::info_level()
    } else {
        LoggingEventPublisher::debug_level()
    }
}

#[cfg(feature = "redis")]
async fn cache_store(args: &Args, config: &GuardConfig) -> anyhow::Result<Arc<dyn CacheStore>> {
    let url = args.redis_url.as_ref().or(config.redis_url.as_ref());
    match url {
        Some(url) => {
            let store = flashguard::adapters::RedisCacheStore::connect(url)
                .await
                .context("connecting to Redis")?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(InMemoryCacheStore::new())),
    }
}

#[cfg(not(feature = "redis"))]
async fn cache_store(_args: &Args, config: &GuardConfig) -> anyhow::Result<Arc<dyn CacheStore>> {
    if config.redis_url.is_some() {
        warn!("redis_url is set but the redis feature is disabled; using in-memory cache");
    }
    Ok(Arc::new(InMemoryCacheStore::new()))
}

fn seed(args: &Args) -> InMemoryDatabase {
    let db = InMemoryDatabase::new();
    for id in 1..=args.shops {
        let mut shop = Shop::new(id, format!("Shop {}", id), (id % 3) + 1);
        shop.avg_price = 50 + id % 100;
        db.insert_shop(shop);
    }
    for (id, name) in [(1, "Food"), (2, "KTV"), (3, "Spa")] {
        db.insert_shop_type(ShopType {
            id,
            name: name.to_string(),
            icon: format!("/types/{}.png", id),
            sort: id as i32,
        });
    }

    let now = Utc::now();
    db.insert_voucher(SeckillVoucher::new(
        1,
        args.stock,
        now - chrono::Duration::minutes(1),
        now + chrono::Duration::hours(1),
    ));
    // Widen the rebuild window so the storm actually contends
    db.set_read_delay(Duration::from_millis(20));
    db
}

// =============================================================================
// Scenarios
// =============================================================================

async fn run_read_storm(reader: &CacheAside<Shop>, db: &InMemoryDatabase, args: &Args) {
    let started = Instant::now();
    let handles: Vec<_> = (0..args.readers)
        .map(|i| {
            let reader = reader.clone();
            // Mostly the hot shop, with some ids that do not exist
            let id = if i % 4 == 3 { 1_000_000 + i as i64 } else { 1 };
            tokio::spawn(async move { reader.get(id).await })
        })
        .collect();

    let (mut found, mut missing, mut failed) = (0usize, 0usize, 0usize);
    for handle in handles {
        match handle.await {
            Ok(Ok(Some(_))) => found += 1,
            Ok(Ok(None)) => missing += 1,
            Ok(Err(e)) => {
                warn!("Read failed: {}", e);
                failed += 1;
            }
            Err(e) => {
                error!("Reader task panicked: {}", e);
                failed += 1;
            }
        }
    }

    info!(
        found,
        missing,
        failed,
        store_reads = db.shop_reads(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Read storm finished"
    );
}

async fn run_flash_sale(pipeline: Arc<SeckillPipeline>, db: &InMemoryDatabase, args: &Args) {
    let started = Instant::now();
    let handles: Vec<_> = (1..=args.users)
        .map(|user| {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                pipeline
                    .seckill_voucher(&RequestContext::new(user), VoucherId(1))
                    .await
            })
        })
        .collect();

    let mut tally: BTreeMap<&'static str, usize> = BTreeMap::new();
    for handle in handles {
        let label = match handle.await {
            Ok(Ok(outcome)) => outcome.label(),
            Ok(Err(e)) => {
                warn!("Seckill failed: {}", e);
                "error"
            }
            Err(e) => {
                error!("Seckill task panicked: {}", e);
                "error"
            }
        };
        *tally.entry(label).or_default() += 1;
    }

    info!(
        ?tally,
        orders = db.orders().len(),
        remaining_stock = db.voucher_stock(VoucherId(1)).unwrap_or_default(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Flash sale finished"
    );
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: Arc<GuardMetrics>) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
    }

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
        metrics: Arc<GuardMetrics>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => match metrics.render() {
                Ok(text) => {
                    let mut response = respond(StatusCode::OK, text);
                    response.headers_mut().insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static("text/plain; version=0.0.4"),
                    );
                    response
                }
                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            },
            "/healthz" => respond(StatusCode::OK, "ok"),
            _ => respond(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics server address '{}'", addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind metrics server")?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("metrics server accept")?;
        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |req| metrics_handler(req, Arc::clone(&metrics)));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_mode_flag_is_validated() {
        let args = Args::try_parse_from(["flashguard", "--lock-mode", "distributed"]).unwrap();
        assert_eq!(args.lock_mode, Some(UserLockMode::Distributed));

        assert!(Args::try_parse_from(["flashguard", "--lock-mode", "global"]).is_err());
    }

    #[test]
    fn test_log_events_selects_info_publisher() {
        let args = Args::try_parse_from(["flashguard", "--log-events"]).unwrap();
        assert!(args.log_events);
        assert_eq!(event_log(&args).level(), Level::INFO);
    }
}
