use crate::{
    error::{FailureKind, ItemFailure, PipelineError, ServiceError},
    metrics::Metrics,
    remote::{Backoff, MetadataService},
    shutdown::Shutdown,
};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use panocore::{catalog::write_catalog, Catalog, PanoramaRecord, Point};
use serde::Serialize;
use std::{
    fs, io,
    path::{Path, PathBuf},
};

const CATALOG_PREFIX: &str = "panoids_";
const AUDIT_SUFFIX: &str = ".run.json";

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub search_radius_m: u32,
    /// Metadata queries in flight at once.
    pub concurrency: usize,
    /// Attempts per point, including the first.
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Keep only the candidate closest to each query point.
    pub nearest_only: bool,
    pub progress_every: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            search_radius_m: 10,
            concurrency: 50,
            max_retries: 4,
            backoff: Backoff::default(),
            nearest_only: false,
            progress_every: 500,
        }
    }
}

#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub catalog: Catalog,
    pub points_queried: usize,
    pub failed_points: usize,
    /// Failed queries and rejected records.
    pub failures: Vec<ItemFailure>,
}

/// Queries every point and merges the answers into one catalog.
///
/// Answers are merged in point order whatever order they arrive in, so the
/// first point to mention an id decides its metadata. A point whose query
/// keeps failing is recorded and skipped; a permanent refusal from the
/// service ends the scan.
pub async fn discover<M: MetadataService>(
    service: &M,
    points: &[Point],
    opts: &DiscoveryOptions,
    metrics: &Metrics,
    mut shutdown: Shutdown,
) -> Result<DiscoveryReport, PipelineError> {
    let total = points.len();
    tracing::info!(
        points = total,
        search_radius_m = opts.search_radius_m,
        concurrency = opts.concurrency,
        "Starting panorama discovery."
    );

    let mut answers = stream::iter(points.iter().copied().enumerate())
        .map(|(idx, point)| async move { (idx, point, query_point(service, point, opts, metrics).await) })
        .buffered(opts.concurrency.max(1));

    let mut report = DiscoveryReport::default();
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.wait() => {
                tracing::warn!(processed = report.points_queried, total, "Discovery cancelled.");
                return Err(PipelineError::Cancelled);
            }
            next = answers.next() => next,
        };
        let Some((idx, point, answer)) = next else { break };

        report.points_queried += 1;
        metrics.points_queried_total.inc();

        match answer {
            Ok(records) => merge(&mut report, point, records, opts.nearest_only, metrics),
            Err((ServiceError::Permanent(msg), _)) => {
                tracing::error!(point = idx, error = %msg, "Metadata service refused the query; aborting discovery.");
                return Err(PipelineError::NetworkPermanent(msg));
            }
            Err((e, attempts)) => {
                tracing::warn!(point = idx, lat = point.latitude, lon = point.longitude, attempts, error = %e, "Point query failed.");
                metrics.query_failures_total.inc();
                report.failed_points += 1;
                report.failures.push(ItemFailure::new(
                    format!("point {idx} ({}, {})", point.latitude, point.longitude),
                    FailureKind::QueryFailed,
                    attempts,
                    e,
                ));
            }
        }

        if opts.progress_every > 0 && report.points_queried % opts.progress_every == 0 {
            tracing::info!(
                processed = report.points_queried,
                total,
                unique = report.catalog.len(),
                failed = report.failed_points,
                "Discovery progress."
            );
        }
    }

    tracing::info!(
        processed = report.points_queried,
        unique = report.catalog.len(),
        failed = report.failed_points,
        "Discovery finished."
    );
    Ok(report)
}

async fn query_point<M: MetadataService>(
    service: &M,
    point: Point,
    opts: &DiscoveryOptions,
    metrics: &Metrics,
) -> Result<Vec<PanoramaRecord>, (ServiceError, u32)> {
    let mut attempt = 1;
    loop {
        match service.find_nearby(point, opts.search_radius_m).await {
            Ok(records) => return Ok(records),
            Err(e) if e.is_transient() && attempt < opts.max_retries => {
                let delay = opts.backoff.delay(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying metadata query.");
                metrics.query_retries_total.inc();
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err((e, attempt)),
        }
    }
}

fn merge(report: &mut DiscoveryReport, point: Point, records: Vec<PanoramaRecord>, nearest_only: bool, metrics: &Metrics) {
    let mut valid = Vec::with_capacity(records.len());
    for record in records {
        match record.validate() {
            Ok(()) => valid.push(record),
            Err(e) => {
                tracing::warn!(panoid = %record.id, error = %e, "Skipping invalid panorama record.");
                metrics.metadata_invalid_total.inc();
                report
                    .failures
                    .push(ItemFailure::new(record.id.clone(), FailureKind::MetadataInvalid, 1, e));
            }
        }
    }

    if nearest_only {
        valid = valid
            .into_iter()
            .min_by(|a, b| {
                a.location()
                    .distance_km(&point)
                    .total_cmp(&b.location().distance_km(&point))
            })
            .into_iter()
            .collect();
    }

    for record in valid {
        if report.catalog.insert(record) {
            metrics.panoramas_discovered_total.inc();
        }
    }
}

/// What produced a discovery catalog; written next to it.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryAudit {
    pub source: String,
    pub points: usize,
    pub skipped_rows: usize,
    pub duplicate_points: usize,
    pub search_radius_m: u32,
    pub nearest_only: bool,
    pub discovered: usize,
    pub failed_points: usize,
    pub created_at: DateTime<Utc>,
}

fn catalog_file_name(at: DateTime<Utc>) -> String {
    format!("{CATALOG_PREFIX}{}.json", at.format("%Y%m%dT%H%M%SZ"))
}

/// Writes the catalog and its audit sidecar into `work_dir`; returns the
/// catalog path.
pub fn persist(work_dir: &Path, catalog: &Catalog, audit: &DiscoveryAudit) -> Result<PathBuf, PipelineError> {
    let path = work_dir.join(catalog_file_name(audit.created_at));
    write_catalog(&path, catalog.records())?;

    let sidecar = audit_path(&path);
    let body = serde_json::to_vec_pretty(audit).map_err(io::Error::other);
    body.and_then(|b| fs::write(&sidecar, b))
        .map_err(|source| PipelineError::StorageUnwritable { path: sidecar, source })?;
    Ok(path)
}

fn audit_path(catalog: &Path) -> PathBuf {
    let stem = catalog
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    catalog.with_file_name(format!("{stem}{AUDIT_SUFFIX}"))
}

/// Most recent discovery catalog in `work_dir`, by the timestamp in its name.
pub fn newest_catalog(work_dir: &Path) -> io::Result<Option<PathBuf>> {
    let entries = match fs::read_dir(work_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut newest: Option<(String, PathBuf)> = None;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(stamp) = name
            .strip_prefix(CATALOG_PREFIX)
            .and_then(|rest| rest.strip_suffix(".json"))
        else {
            continue;
        };
        if name.ends_with(AUDIT_SUFFIX) || chrono::NaiveDateTime::parse_from_str(stamp, "%Y%m%dT%H%M%SZ").is_err() {
            continue;
        }
        if newest.as_ref().map_or(true, |(best, _)| stamp > best.as_str()) {
            newest = Some((stamp.to_string(), entry.path()));
        }
    }
    Ok(newest.map(|(_, path)| path))
}
