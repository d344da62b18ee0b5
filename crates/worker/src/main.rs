//! `sdrelay-worker` -- Stable Diffusion WebUI queue worker.
//!
//! Startup order: configuration, backend readiness (fatal if the backend
//! never reports idle), Redis, then the dispatcher. No message is
//! consumed before the backend is confirmed idle.
//!
//! Configuration is read from the environment (and `.env`); see
//! [`WorkerConfig::from_env`]. `LOG_FORMAT=json` switches to JSON logs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sdrelay_events::{CallbackPublisher, RedisBus, RedisBusConfig};
use sdrelay_pipeline::{JobProcessor, Pipeline};
use sdrelay_sdwebui::readiness::wait_until_ready;
use sdrelay_sdwebui::{ResilientClient, SdWebUiApi};
use sdrelay_storage::{BlobStore, RedisBackend};
use sdrelay_worker::cli::Args;
use sdrelay_worker::config::WorkerConfig;
use sdrelay_worker::dispatcher::Dispatcher;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound of one queue poll; also the shutdown latency.
const BUS_POLL_TIMEOUT: Duration = Duration::from_secs(1);

const DEFAULT_LOG_FILTER: &str = "sdrelay_worker=info,sdrelay_pipeline=info,sdrelay_sdwebui=info,\
                                  sdrelay_events=info,sdrelay_storage=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer()))
        .init();

    let args = Args::parse();
    let config = WorkerConfig::from_env().context("invalid configuration")?;
    let binding = config.binding(args.worker);

    tracing::info!(
        worker = %binding.kind,
        queue = %binding.queue,
        routing_key = %binding.routing_key,
        backend = %config.api_endpoint,
        concurrency = config.concurrency,
        "Starting sdrelay-worker",
    );

    let transport = ResilientClient::new(
        config.api_endpoint.clone(),
        config.check_policy,
        config.post_policy,
    )
    .context("failed to build backend HTTP client")?;
    let api = SdWebUiApi::new(transport);

    wait_until_ready(&api, &config.readiness)
        .await
        .context("backend did not become ready")?;

    let backend = RedisBackend::connect(&config.redis_url)
        .await
        .context("failed to connect blob store")?;
    let blobs = BlobStore::new(Arc::new(backend), config.blobs.clone());

    let bus = Arc::new(
        RedisBus::connect(
            &config.redis_url,
            RedisBusConfig {
                exchange: config.exchange.clone(),
                queue: binding.queue.clone(),
                poll_timeout: BUS_POLL_TIMEOUT,
            },
        )
        .await
        .context("failed to connect message bus")?,
    );
    bus.bind(&binding.routing_key).await?;
    bus.requeue_inflight().await?;

    let publisher = CallbackPublisher::new(bus.clone());
    let processor = JobProcessor::new(Pipeline::new(api, blobs.clone()), blobs, publisher);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
            }
            cancel.cancel();
        }
    });

    Dispatcher::new(bus, Arc::new(processor), config.concurrency)
        .run(cancel)
        .await;

    Ok(())
}
