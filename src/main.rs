//! # Keystone
//!
//! Command line entry point for the Bundle reconciliation engine.
//!
//! - `validate` loads a bundle manifest and prints the order its resources
//!   would be processed in, or the graph error that prevents processing.
//! - `run` loads the bundle into an in-memory store, starts the coordinator,
//!   waits for one completed pass (or Ctrl+C) and prints the resulting status.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use keystone_reconciler::{
    Bundle, BundleProcessor, ControllerConfig, Coordinator, InMemoryStore, ResourceGraph, TransitionMetrics,
};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Validate { bundle } => validate(&bundle),
        Commands::Run {
            bundle,
            config,
            namespace,
            metrics,
        } => run(&bundle, config.as_deref(), &namespace, metrics).await,
    }
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_bundle(path: &Path) -> Result<Bundle> {
    keystone_core::load::from_file(path).with_context(|| format!("Failed to load bundle from {}", path.display()))
}

fn load_config(path: Option<&Path>) -> Result<ControllerConfig> {
    let config: ControllerConfig = match path {
        Some(path) => keystone_core::load::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ControllerConfig::default(),
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn validate(path: &Path) -> Result<()> {
    let bundle = load_bundle(path)?;
    let graph = match ResourceGraph::build(&bundle.spec.resources) {
        Ok(graph) => graph,
        Err(e) => bail!("Bundle {:?} has an invalid dependency graph: {e}", bundle.metadata.name),
    };

    info!(bundle = %bundle.metadata.name, resources = graph.len(), "Dependency graph is valid");
    for (position, name) in graph.ordered_names().into_iter().enumerate() {
        println!("{}. {name}", position + 1);
    }
    Ok(())
}

async fn run(bundle_path: &Path, config_path: Option<&Path>, namespace: &str, print_metrics: bool) -> Result<()> {
    let start_time = Instant::now();
    let config = load_config(config_path)?;

    let mut bundle = load_bundle(bundle_path)?;
    if bundle.metadata.namespace.is_none() {
        bundle.metadata.namespace = Some(namespace.to_string());
    }
    if let Some(watched) = &config.namespace {
        if bundle.metadata.namespace.as_deref() != Some(watched.as_str()) {
            bail!("Bundle is outside the watched namespace {watched:?}");
        }
    }

    let registry = Registry::new();
    let metrics = TransitionMetrics::new(&config.app_name).context("Failed to create metrics")?;
    metrics.register(&registry).context("Failed to register metrics")?;

    let store = Arc::new(InMemoryStore::new());
    let processor = BundleProcessor::builder()
        .with_store(store.clone())
        .with_cache(store.clone())
        .with_config(config.clone())
        .with_metrics(metrics)
        .build()
        .context("Failed to build bundle processor")?;
    let coordinator = Arc::new(Coordinator::new(Arc::new(processor), store.clone(), &config));

    let bundle = store.insert_bundle(bundle);
    let bundle_ref = bundle.bundle_ref();
    info!(bundle = %bundle_ref, resources = bundle.spec.resources.len(), "Bundle loaded");

    let (shutdown, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(Arc::clone(&coordinator).run(shutdown_rx));
    let reply = coordinator.request_bundle(bundle_ref.clone());

    let reconciled = tokio::select! {
        reply = reply => reply.ok(),
        () = wait_for_shutdown() => None,
    };

    if shutdown.send(true).is_err() {
        warn!("Coordinator already stopped");
    }
    running.await.context("Coordinator task failed")?;

    let Some(reconciled) = reconciled else {
        bail!("Bundle {bundle_ref} was not reconciled");
    };
    info!(
        bundle = %bundle_ref,
        ready = reconciled.status.is_ready,
        objects = store.objects().len(),
        elapsed_ms = start_time.elapsed().as_millis() as u64,
        "Pass completed"
    );

    let status = serde_json::to_string_pretty(&reconciled.status).context("Failed to encode status")?;
    println!("{status}");

    if print_metrics {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        println!("{}", String::from_utf8_lossy(&buffer));
    }
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C). Never resolves if the signal cannot
/// be listened for.
async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(err) => {
            error!("Failed to listen for shutdown signal: {}", err);
            std::future::pending::<()>().await;
        }
    }
}
