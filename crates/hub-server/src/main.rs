//! Standalone entry point: wires storage, the core `Hub`, and the axum
//! transport into one running process. A host embedding the hub as a
//! library would do this wiring itself and skip this binary entirely.

mod cli;
mod config;
mod storage;

use std::sync::Arc;

use clap::Parser;
use hub_core::{Hub, HubSchedule, HubStorage, PluginRegistry};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::config::Settings;
use crate::storage::{MemoryInstances, MemoryMetricHistory, MemoryMetricSources, MemorySystemConfig};

fn init_tracing(settings: &Settings, cli_filter: Option<&str>) -> anyhow::Result<()> {
    let directive = cli_filter.unwrap_or(&settings.logging.filter);
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(dir) = &settings.logging.dir {
        let file_appender = tracing_appender::rolling::daily(dir, "hub-server.log");
        let (writer, guard) = tracing_appender::non_blocking(file_appender);
        // Leak the guard: it must outlive the subscriber, which lives for the
        // process (hub-log's macros assume a subscriber is installed for good).
        Box::leak(Box::new(guard));
        tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load()?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    init_tracing(&settings, cli.log_filter.as_deref())?;

    hub_log::log_info!("starting hub-server on {}:{}", settings.server.host, settings.server.port);

    // A host embedding this as a library registers its own plugins here
    // (§4.1); integration-specific adapters are out of scope for this crate.
    let plugins = PluginRegistry::new();

    let storage = HubStorage {
        instances: Arc::new(MemoryInstances::default()),
        metric_history: Arc::new(MemoryMetricHistory::default()),
        metric_sources: Arc::new(MemoryMetricSources::default()),
        system_config: Arc::new(MemorySystemConfig::default()),
    };

    let schedule = HubSchedule {
        aggregation_cron: settings.schedule.aggregation_cron.clone(),
        reprobe_cron: settings.schedule.reprobe_cron.clone(),
    };

    let hub = Hub::new(plugins, storage, schedule);
    hub.start().await?;

    let app = axum::Router::new()
        .nest("/hub", hub_axum::router(hub.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    hub_log::log_info!("listening on {addr}");

    let shutdown_hub = hub.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            hub_log::log_info!("shutdown signal received, draining the hub");
            if let Err(err) = shutdown_hub.shutdown().await {
                hub_log::log_error!("error during hub shutdown: {err}");
            }
        })
        .await?;

    Ok(())
}
