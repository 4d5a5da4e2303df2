use std::sync::Arc;
use std::time::Duration;

use council::config::Config;
use council::model::{Event, Mode};
use council::orchestrator::Orchestrator;
use council::registry::ProcessingRegistry;
use council::service;
use council::session::InMemorySessionStore;
use council::transport::format_sse_frame;
use council::upstream::client::UpstreamClient;

/// This binary is a smoke-test harness for the council subsystem, not a
/// server: the HTTP router, auth, and wire transport that would front these
/// primitives in production are an external collaborator's responsibility
/// (SPEC_FULL.md §1). It runs one council turn end to end against whatever
/// gateway and models are configured, printing the SSE wire frames the
/// real adapter would forward to a client.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();
    tracing::info!("council starting");

    let config = Arc::new(Config::from_env());
    let client = Arc::new(UpstreamClient::new(config.gateway_base_url.clone(), config.gateway_api_key.clone()));
    let store = Arc::new(InMemorySessionStore::new());
    let registry = ProcessingRegistry::new(config.max_concurrent_processing, config.grace_period, config.stale_threshold);
    tokio::spawn(Arc::clone(&registry).run_sweeper(config.sweep_interval));

    let orchestrator = Orchestrator::new(Arc::clone(&config), client, Arc::clone(&store));

    let created = service::create_session(store.as_ref(), &config, "demo-user").await?;
    let mode = if config.modes.contains_key(&Mode::Lite) { Mode::Lite } else { Mode::Ultra };

    let (subscriber_rx, handle) = service::send_message(
        &registry,
        &orchestrator,
        &config,
        "demo-user",
        &created.session_id,
        "Hello, council.".to_string(),
        Some(mode),
        None,
    )
    .await?;

    print_until_complete(subscriber_rx).await;
    registry.remove_client(&handle).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    tracing::info!("council shutting down");
    Ok(())
}

async fn print_until_complete(mut rx: tokio::sync::mpsc::Receiver<Event>) {
    while let Some(event) = rx.recv().await {
        let terminal = matches!(event, Event::Complete | Event::Error { .. });
        print!("{}", format_sse_frame(&event));
        if terminal {
            break;
        }
    }
}
