//! Coordination engine server binary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use coordinator::cluster::ClusterClient;
use coordinator::config::EngineConfig;
use coordinator::detect::deployment::DeploymentDetector;
use coordinator::detect::layers::LayerDetector;
use coordinator::health::HealthChecker;
use coordinator::inference::InferenceClient;
use coordinator::metrics::MetricsCollector;
use coordinator::orchestrate::adapters::{ClusterAdapter, InternalAdapter};
use coordinator::orchestrate::Orchestrator;
use coordinator::plan::Planner;
use coordinator::recommend::RecommendationEngine;
use coordinator::remediate::direct::DirectRemediator;
use coordinator::remediate::gitops::{ArgoClient, GitopsRemediator};
use coordinator::remediate::helm::{HelmCli, HelmRemediator};
use coordinator::remediate::operator::OperatorRemediator;
use coordinator::remediate::{Remediator, RemediatorSelector};
use coordinator::server::{build_router, AppState};
use coordinator::store::Store;
use coordinator::telemetry::TelemetryReader;

/// Self-healing coordination engine.
#[derive(Parser)]
#[command(name = "coordinator")]
#[command(about = "Self-healing coordination engine - classifies incidents and drives multi-layer remediation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and workflow executor.
    Serve {
        /// Listen address override (defaults to LISTEN_ADDR or 0.0.0.0:8080).
        #[arg(long)]
        listen: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { listen } => serve(listen).await,
    }
}

async fn serve(listen_override: Option<String>) -> Result<()> {
    let mut config = EngineConfig::from_env().context("Failed to load configuration")?;
    if let Some(listen) = listen_override {
        config.listen_addr = listen;
    }

    // Single-writer store; running more than one replica corrupts it.
    info!(
        listen = %config.listen_addr,
        data_dir = %config.data_dir,
        "Starting coordination engine (single active instance assumed)"
    );

    let root_cancel = CancellationToken::new();
    let metrics = MetricsCollector::new();

    let cluster = ClusterClient::infer(&config.cluster)
        .await
        .context("Failed to connect to the cluster API")?;
    let store = Arc::new(Store::open(&config.data_dir).await?);
    let telemetry = TelemetryReader::new(&config.telemetry)?;
    let inference = InferenceClient::new(&config.inference)?;
    let argo = ArgoClient::new(&config.gitops)?;

    let detector = Arc::new(DeploymentDetector::new(
        cluster.clone(),
        &config.detection,
        metrics.clone(),
    ));
    detector
        .cache()
        .start_sweeper(config.detection.cache_sweep_interval, root_cancel.clone());

    let layer_detector = Arc::new(LayerDetector::new(
        Some(inference.clone()),
        &config.detection,
        metrics.clone(),
    ));

    let gitops_remediator: Arc<dyn Remediator> =
        Arc::new(GitopsRemediator::new(argo.clone()));
    let helm_remediator: Arc<dyn Remediator> = Arc::new(HelmRemediator::new(Arc::new(
        HelmCli::new(config.execution.helm_timeout),
    )));
    let operator_remediator: Arc<dyn Remediator> = Arc::new(OperatorRemediator::new(
        cluster.clone(),
        config.execution.max_owner_depth,
    ));
    let direct_remediator: Arc<dyn Remediator> = Arc::new(DirectRemediator::new(cluster.clone()));
    let selector = Arc::new(RemediatorSelector::new(
        vec![
            gitops_remediator,
            helm_remediator,
            operator_remediator,
            Arc::clone(&direct_remediator),
        ],
        direct_remediator,
    ));

    let health_checker = Arc::new(HealthChecker::new(cluster.clone()));
    let internal: Arc<dyn InternalAdapter> = Arc::new(ClusterAdapter::new(
        cluster.clone(),
        config.execution.mco_stability_timeout,
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        detector,
        layer_detector,
        Planner::new(config.execution.checkpoint_timeout),
        selector,
        health_checker,
        internal,
        metrics.clone(),
        root_cancel.clone(),
    ));

    let state = Arc::new(AppState {
        orchestrator: orchestrator.clone(),
        store: store.clone(),
        inference,
        telemetry: telemetry.clone(),
        gitops: argo,
        cluster,
        recommendations: RecommendationEngine::new(telemetry, store),
        metrics,
    });

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!(listen = %config.listen_addr, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    // Listener is closed; give running workflows the grace window to
    // observe cancellation before the process exits.
    root_cancel.cancel();
    let deadline = tokio::time::Instant::now() + config.shutdown_grace;
    while orchestrator.active_workflows() > 0 {
        if tokio::time::Instant::now() >= deadline {
            warn!(
                remaining = orchestrator.active_workflows(),
                "Grace window elapsed with workflows still running, forcing exit"
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    info!("Coordination engine stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received interrupt, shutting down"),
        () = terminate => info!("Received terminate, shutting down"),
    }
}
