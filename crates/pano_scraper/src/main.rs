mod compute;
mod config;
mod discovery;
mod error;
mod fetch;
mod metrics;
mod orchestrator;
mod points;
mod project;
mod prune;
mod remote;
mod shutdown;
mod storage;

use crate::config::{Cli, Command, PruneCmd};
use crate::metrics::Metrics;
use crate::orchestrator::Pipeline;
use crate::remote::{CbkTileClient, GeoPhotoClient};
use crate::shutdown::Shutdown;
use anyhow::Context;
use clap::Parser;
use panocore::catalog::read_catalog;
use std::{collections::HashSet, net::SocketAddr, path::Path, sync::Arc};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    tracing::info!(config = ?cli, "Loaded configuration.");

    let metrics = Arc::new(Metrics::new());
    if let Some(addr) = cli.metrics_listen_addr {
        spawn_metrics_server(&metrics, addr);
    }

    if let Command::Prune(cmd) = &cli.command {
        return prune_panoramas(cmd, &cli.work_dir).await;
    }
    let Some(cfg) = cli.command.pipeline(&cli.work_dir) else {
        return Ok(());
    };

    let endpoints = cli.command.endpoints();
    let metadata = GeoPhotoClient::new(endpoints.metadata_url, endpoints.metadata_concurrency)
        .context("Failed to build the metadata service client")?;
    let tiles = CbkTileClient::new(&endpoints.tile_url, endpoints.tile_concurrency)
        .context("Failed to build the tile service client")?;

    let (trigger, shutdown) = Shutdown::new();
    tokio::spawn(shutdown::listen_for_signals(trigger));

    let pipeline = Pipeline::new(Arc::new(metadata), Arc::new(tiles), metrics, cfg);
    let outcome = pipeline.run(shutdown).await;

    tracing::info!(
        summary = ?outcome.summary,
        failures = outcome.failures.len(),
        failure_report = ?outcome.failure_report,
        catalog = ?outcome.catalog,
        "Run finished."
    );
    println!("{}", serde_json::to_string_pretty(&outcome.summary)?);

    match outcome.error {
        Some(e) => Err(e).context("Pipeline run failed"),
        None => Ok(()),
    }
}

fn spawn_metrics_server(metrics: &Metrics, addr: SocketAddr) {
    let router = metrics.router();
    tokio::spawn(async move {
        let served = async {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::info!(%addr, "Serving metrics.");
            axum::serve(listener, router.into_make_service()).await?;
            Ok::<(), anyhow::Error>(())
        };
        if let Err(e) = served.await {
            tracing::error!(error = %e, "Metrics server task failed.");
        }
    });
}

async fn prune_panoramas(cmd: &PruneCmd, work_dir: &Path) -> anyhow::Result<()> {
    let catalog_path = config::resolve(work_dir, &cmd.catalog);
    let loaded = read_catalog(&catalog_path)
        .with_context(|| format!("Failed to read catalog {}", catalog_path.display()))?;
    let keep: HashSet<String> = loaded
        .catalog
        .iter()
        .filter(|r| r.capture_year.is_some())
        .map(|r| r.id.clone())
        .collect();
    tracing::info!(catalog = %catalog_path.display(), dated = keep.len(), dry_run = cmd.dry_run, "Pruning panoramas.");

    let pano_dir = cmd.pano_dir.clone();
    let dry_run = cmd.dry_run;
    let report = tokio::task::spawn_blocking(move || prune::prune(&pano_dir, &keep, dry_run))
        .await
        .context("Prune task failed")?
        .with_context(|| format!("Failed to prune {}", cmd.pano_dir.display()))?;

    tracing::info!(
        scanned = report.scanned,
        kept = report.kept,
        deleted = report.deleted,
        unparseable = report.unparseable,
        dry_run,
        "Prune finished."
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
