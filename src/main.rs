//! Apolo Rater
//!
//! Real-time rating and balance debiting daemon. Loads the configuration,
//! connects storage, warms the catalog and runs the action plan scheduler
//! until interrupted.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use apolo_core::config::AppConfig;
use apolo_rating::notify::LogMailer;
use apolo_rating::{
    ActionPlanner, ActionRuntime, ActionSettings, Guardian, Rater, RatingSettings, Scheduler,
    TriggerProcessor,
};
use apolo_store::{AccountStore, Catalog, StoreCdrSink};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging
fn init_tracing(config: &AppConfig) {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| config.logging.level.clone());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "apolo_rater={},apolo_rating={},apolo_store={},apolo_core={},redis=warn",
            log_level, log_level, log_level, log_level
        ))
    });

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.logging.json {
        registry.with(fmt::layer().json().with_current_span(true)).init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = match env::var("APOLO_CONFIG") {
        Ok(path) => AppConfig::from_file(&path),
        Err(_) => AppConfig::load(),
    }
    .context("loading configuration")?;

    init_tracing(&config);

    info!("Starting Apolo Rater v{}", env!("CARGO_PKG_VERSION"));

    let store = apolo_store::connect(&config.storage)
        .await
        .context("connecting storage")?;
    let catalog = Arc::new(Catalog::new(
        store.clone(),
        Duration::from_millis(config.storage.negative_cache_ttl_ms),
    ));
    let accounts = Arc::new(AccountStore::new(store.clone()));
    let cdrs = Arc::new(StoreCdrSink::new(store));

    if config.rating_plans.precache {
        let loaded = catalog.precache(&[]).await.context("precaching catalog")?;
        info!("Precached {} catalog entries", loaded);
    }

    let settings = RatingSettings::from(&config.general);
    let guardian = Arc::new(Guardian::new());
    let runtime = Arc::new(
        ActionRuntime::new(
            catalog.clone(),
            accounts.clone(),
            cdrs,
            ActionSettings::from(&config),
        )
        .context("building action runtime")?
        .with_mailer(Arc::new(LogMailer::new(&config.mailer))),
    );
    let triggers = Arc::new(TriggerProcessor::new(
        catalog.clone(),
        accounts.clone(),
        guardian.clone(),
        runtime,
        settings.lock_timeout,
        settings.rounding_decimals,
    ));
    let planner = Arc::new(ActionPlanner::new(
        catalog.clone(),
        accounts.clone(),
        guardian.clone(),
        triggers.clone(),
        settings.lock_timeout,
        settings.rounding_decimals,
    ));
    let _rater = Rater::new(catalog, accounts, guardian, triggers, settings);

    let scheduler = Arc::new(Scheduler::new(planner, config.scheduler.task_concurrency));
    let worker = if config.scheduler.enabled {
        let scheduler = scheduler.clone();
        Some(tokio::spawn(async move { scheduler.run().await }))
    } else {
        warn!("Scheduler disabled, action plans will not run");
        None
    };

    info!("Rater ready");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");

    scheduler.shutdown();
    if let Some(worker) = worker {
        if let Err(e) = worker.await {
            warn!("Scheduler task ended abnormally: {}", e);
        }
    }
    Ok(())
}
