use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use component_sidecar::auth::AsapSigner;
use component_sidecar::channel::CommandChannel;
use component_sidecar::commander::CommanderService;
use component_sidecar::config::AppConfig;
use component_sidecar::metrics;
use component_sidecar::request::AuthenticatedClient;
use component_sidecar::routes;
use component_sidecar::state::AppState;
use component_sidecar::stats::{LocalStatusSource, StatsPipeline};
use component_sidecar::telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::from_env().context("loading configuration")?;
    init_tracing(&cfg.log_level);

    let signer = Arc::new(
        AsapSigner::from_key_file(&cfg.asap_signing_key_file, cfg.asap_config())
            .context("loading ASAP signing key")?,
    );
    let client = AuthenticatedClient::new(Arc::clone(&signer), cfg.request_policy());
    let commander = CommanderService::new(cfg.commander_config(), client.clone());

    let channel = CommandChannel::new(cfg.channel_config(), Arc::clone(&signer), Arc::new(commander));
    let _channel_task = channel.spawn();

    let pipeline = StatsPipeline::new(cfg.identity(), Arc::new(channel.clone()));
    let source = Arc::new(LocalStatusSource::new(client, cfg.stats_retrieve_url()));
    let _collector = pipeline.spawn_collector(source, cfg.stats_polling_interval());
    let _reporter = pipeline.spawn_reporter(cfg.stats_reporting_interval());

    let app: Router = routes::router(AppState::new(pipeline));

    info!(
        addr = %cfg.bind_addr(),
        component_key = %cfg.instance_key,
        component_type = %cfg.component_type,
        environment = %cfg.environment,
        region = %cfg.region,
        ws_server = %cfg.ws_server_url,
        ws_path = %cfg.ws_server_path,
        stats_url = %cfg.stats_retrieve_url(),
        start_url = %cfg.start_url(),
        stop_url = %cfg.stop_url(),
        polling_secs = cfg.stats_polling_interval,
        reporting_secs = cfg.stats_reporting_interval,
        volatile_events = cfg.volatile_events,
        "starting component sidecar"
    );
    warn!("starting in unprotected api mode");
    metrics::BOOT_COUNTER.inc();

    let listener = tokio::net::TcpListener::bind(cfg.bind_addr())
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr()))?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutting down");
        })
        .await
        .context("http server")?;
    Ok(())
}
