//! Stage sequencing: Discover → Filter → Fetch → Project → Cleanup.
//!
//! Every stage is optional. A stage that runs without its upstream stage
//! reads the upstream artifact from disk, and fails with
//! `MissingDependency` when it is not there. Catalogs pass between stages
//! in memory within one run and are written once, at the end of the stage
//! that produces them.

use crate::{
    compute::ComputePool,
    discovery::{self, DiscoveryAudit, DiscoveryOptions},
    error::{ItemFailure, PipelineError},
    fetch::{FetchEngine, FetchOptions},
    metrics::{Metrics, RunSummary},
    points::PointSource,
    project::{self, ProjectionSettings, Projector},
    remote::{MetadataService, TileService},
    shutdown::Shutdown,
};
use chrono::{DateTime, Utc};
use panocore::{
    catalog::{read_catalog, write_catalog},
    filter, Catalog, FilterOptions, ImageryLayout,
};
use serde::Serialize;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Which stages run. Projection is inline with fetch when both run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagePlan {
    pub discover: bool,
    pub filter: bool,
    pub fetch: bool,
    pub project: bool,
    /// Delete each panorama once its faces are written.
    pub cleanup: bool,
}

impl StagePlan {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.cleanup && !self.project {
            return Err(PipelineError::InputInvalid(
                "cleanup deletes projected panoramas and needs the project stage".into(),
            ));
        }
        if !(self.discover || self.filter || self.fetch || self.project) {
            return Err(PipelineError::InputInvalid("no stage selected".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Discovery catalogs and failure reports go here.
    pub work_dir: PathBuf,
    pub plan: StagePlan,
    pub points: Option<PointSource>,
    pub discovery: DiscoveryOptions,
    /// Filter input when discovery does not run; the newest discovery
    /// catalog in `work_dir` when unset.
    pub raw_catalog: Option<PathBuf>,
    pub filter: FilterOptions,
    /// Written by the filter; read by fetch and project.
    pub catalog: PathBuf,
    pub fetch: FetchOptions,
    pub layout: ImageryLayout,
    pub projection: ProjectionSettings,
    /// 0 uses one thread per core.
    pub compute_threads: usize,
}

impl PipelineConfig {
    pub fn new(work_dir: impl Into<PathBuf>, plan: StagePlan) -> Self {
        Self {
            work_dir: work_dir.into(),
            plan,
            points: None,
            discovery: DiscoveryOptions::default(),
            raw_catalog: None,
            filter: FilterOptions::default(),
            catalog: PathBuf::from("panoids_with_dates.json"),
            fetch: FetchOptions::default(),
            layout: ImageryLayout::new("panoramas", "cube_pano"),
            projection: ProjectionSettings::default(),
            compute_threads: 0,
        }
    }
}

/// End state of a run, reported even when a stage aborted it.
#[derive(Debug)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub raw_catalog: Option<PathBuf>,
    pub catalog: Option<PathBuf>,
    pub failures: Vec<ItemFailure>,
    pub failure_report: Option<PathBuf>,
    /// The systemic error that stopped the run, if any.
    pub error: Option<PipelineError>,
}

#[derive(Default)]
struct RunState {
    raw: Option<Catalog>,
    raw_path: Option<PathBuf>,
    clean: Option<Catalog>,
    clean_path: Option<PathBuf>,
    failures: Vec<ItemFailure>,
}

pub struct Pipeline<M, T> {
    metadata: Arc<M>,
    tiles: Arc<T>,
    metrics: Arc<Metrics>,
    cfg: PipelineConfig,
}

impl<M: MetadataService, T: TileService> Pipeline<M, T> {
    pub fn new(metadata: Arc<M>, tiles: Arc<T>, metrics: Arc<Metrics>, cfg: PipelineConfig) -> Self {
        Self {
            metadata,
            tiles,
            metrics,
            cfg,
        }
    }

    pub async fn run(&self, shutdown: Shutdown) -> RunOutcome {
        let started = Utc::now();
        let mut state = RunState::default();
        let error = self.run_stages(&mut state, shutdown).await.err();
        if let Some(e) = &error {
            tracing::error!(error = %e, "Run stopped.");
        }

        let failure_report = if state.failures.is_empty() {
            None
        } else {
            match write_failure_report(&self.cfg.work_dir, started, &state.failures) {
                Ok(path) => {
                    tracing::info!(path = %path.display(), failures = state.failures.len(), "Failure report written.");
                    Some(path)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Could not write the failure report.");
                    None
                }
            }
        };

        RunOutcome {
            summary: self.metrics.summary(),
            raw_catalog: state.raw_path,
            catalog: state.clean_path,
            failures: state.failures,
            failure_report,
            error,
        }
    }

    async fn run_stages(&self, st: &mut RunState, shutdown: Shutdown) -> Result<(), PipelineError> {
        let plan = self.cfg.plan;
        plan.validate()?;

        if plan.discover {
            self.discover(st, shutdown.clone()).await?;
        }
        if plan.filter {
            ensure_running(&shutdown)?;
            self.filter(st)?;
        }
        if !(plan.fetch || plan.project) {
            return Ok(());
        }
        ensure_running(&shutdown)?;

        let catalog = match st.clean.take() {
            Some(c) => c,
            None => {
                let stage = if plan.fetch { "fetch" } else { "project" };
                load_upstream(&self.cfg.catalog, stage)?
            }
        };
        let pool = Arc::new(ComputePool::new(self.cfg.compute_threads)?);
        let layout = Arc::new(self.cfg.layout.clone());
        let projector = if plan.project {
            Some(Arc::new(Projector::new(
                pool.clone(),
                layout.clone(),
                self.cfg.projection.clone(),
            )?))
        } else {
            None
        };

        if plan.fetch {
            let mut engine = FetchEngine::new(
                self.tiles.clone(),
                layout,
                pool,
                self.cfg.fetch.clone(),
                self.metrics.clone(),
            )?;
            if let Some(projector) = projector {
                engine = engine.with_inline_projection(projector, plan.cleanup);
            }
            let report = engine.run(catalog.records(), shutdown).await?;
            st.failures.extend(report.failures);
        } else if let Some(projector) = projector {
            let report = project::project_directory(&projector, &catalog, plan.cleanup, &self.metrics, shutdown).await?;
            st.failures.extend(report.failures);
        }
        Ok(())
    }

    async fn discover(&self, st: &mut RunState, shutdown: Shutdown) -> Result<(), PipelineError> {
        let source = self.cfg.points.as_ref().ok_or_else(|| PipelineError::MissingDependency {
            stage: "discover",
            what: "a points file or a grid center".into(),
        })?;
        let set = source.load()?;
        tracing::info!(
            source = %source.describe(),
            points = set.points.len(),
            skipped_rows = set.skipped_rows,
            duplicates = set.duplicates,
            "Loaded scrape points."
        );
        if set.points.is_empty() {
            return Err(PipelineError::InputInvalid(format!(
                "{} yielded no usable points",
                source.describe()
            )));
        }

        let report = discovery::discover(
            self.metadata.as_ref(),
            &set.points,
            &self.cfg.discovery,
            &self.metrics,
            shutdown,
        )
        .await?;

        let audit = DiscoveryAudit {
            source: source.describe(),
            points: set.points.len(),
            skipped_rows: set.skipped_rows,
            duplicate_points: set.duplicates,
            search_radius_m: self.cfg.discovery.search_radius_m,
            nearest_only: self.cfg.discovery.nearest_only,
            discovered: report.catalog.len(),
            failed_points: report.failed_points,
            created_at: Utc::now(),
        };
        let path = discovery::persist(&self.cfg.work_dir, &report.catalog, &audit)?;
        tracing::info!(path = %path.display(), records = report.catalog.len(), "Discovery catalog written.");

        st.failures.extend(report.failures);
        st.raw = Some(report.catalog);
        st.raw_path = Some(path);
        Ok(())
    }

    fn filter(&self, st: &mut RunState) -> Result<(), PipelineError> {
        let raw = match st.raw.take() {
            Some(c) => c,
            None => {
                let path = match &self.cfg.raw_catalog {
                    Some(p) => p.clone(),
                    None => discovery::newest_catalog(&self.cfg.work_dir)
                        .map_err(|e| PipelineError::InputInvalid(format!("cannot list {}: {e}", self.cfg.work_dir.display())))?
                        .ok_or_else(|| PipelineError::MissingDependency {
                            stage: "filter",
                            what: format!("a discovery catalog (panoids_*.json) in {}", self.cfg.work_dir.display()),
                        })?,
                };
                let catalog = load_upstream(&path, "filter")?;
                st.raw_path = Some(path);
                catalog
            }
        };

        let outcome = filter::filter(raw.into_records(), &self.cfg.filter);
        let stats = outcome.stats;
        self.metrics.records_kept_total.inc_by(stats.kept as u64);
        self.metrics
            .records_dropped_total
            .inc_by((stats.input - stats.kept) as u64);

        write_catalog(&self.cfg.catalog, &outcome.kept)?;
        tracing::info!(
            path = %self.cfg.catalog.display(),
            input = stats.input,
            kept = stats.kept,
            kept_year_month = stats.kept_year_month,
            kept_year_only = stats.kept_year_only,
            kept_undated = stats.kept_undated,
            dropped_no_year = stats.dropped_no_year,
            dropped_month_without_year = stats.dropped_month_without_year,
            dropped_invalid_month = stats.dropped_invalid_month,
            cleared_invalid_month = stats.cleared_invalid_month,
            dropped_other_year = stats.dropped_other_year,
            "Filtered catalog written."
        );

        st.clean = Some(outcome.kept.into_iter().collect());
        st.clean_path = Some(self.cfg.catalog.clone());
        Ok(())
    }
}

fn ensure_running(shutdown: &Shutdown) -> Result<(), PipelineError> {
    if shutdown.is_triggered() {
        return Err(PipelineError::Cancelled);
    }
    Ok(())
}

fn load_upstream(path: &Path, stage: &'static str) -> Result<Catalog, PipelineError> {
    if !path.is_file() {
        return Err(PipelineError::MissingDependency {
            stage,
            what: format!("catalog {}", path.display()),
        });
    }
    let loaded = read_catalog(path)?;
    if loaded.skipped_rows > 0 || loaded.duplicate_rows > 0 {
        tracing::warn!(
            path = %path.display(),
            skipped_rows = loaded.skipped_rows,
            duplicate_rows = loaded.duplicate_rows,
            "Catalog rows ignored."
        );
    }
    tracing::info!(path = %path.display(), records = loaded.catalog.len(), stage, "Catalog loaded.");
    Ok(loaded.catalog)
}

#[derive(Serialize)]
struct FailureReport<'a> {
    created_at: DateTime<Utc>,
    failures: &'a [ItemFailure],
}

fn write_failure_report(work_dir: &Path, started: DateTime<Utc>, failures: &[ItemFailure]) -> io::Result<PathBuf> {
    std::fs::create_dir_all(work_dir)?;
    let path = work_dir.join(format!("failures_{}.json", started.format("%Y%m%dT%H%M%SZ")));
    let body = serde_json::to_vec_pretty(&FailureReport {
        created_at: started,
        failures,
    })
    .map_err(io::Error::other)?;
    std::fs::write(&path, body)?;
    Ok(path)
}
