//! Tile fetch and panorama assembly.
//!
//! A bounded set of panorama workers (`workers`) pulls records in turn; each
//! worker fetches the panorama's missing tiles, with every tile request
//! holding a permit from one global limiter (`tile_concurrency`). Tiles that
//! arrived are kept across retry rounds, so a retry only asks for what is
//! still missing. The assembled image reaches disk through a temp file and a
//! rename, and is optionally projected straight away.

use crate::{
    compute::ComputePool,
    error::{FailureKind, ItemError, ItemFailure, PipelineError, ServiceError},
    metrics::Metrics,
    project::{delete_source, FacePlan, Projector},
    remote::{Backoff, TileService},
    shutdown::Shutdown,
    storage,
};
use futures::{stream, StreamExt};
use panocore::{filter, EquirectangularImage, ImageryLayout, PanoramaRecord, StitchError, TileGrid, TileSet};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub zoom: u8,
    /// Panoramas assembled concurrently.
    pub workers: usize,
    /// Tile requests in flight across all workers.
    pub tile_concurrency: usize,
    /// Assembly rounds per panorama, including the first.
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub skip_existing: bool,
    /// Leave out records without a capture year.
    pub require_year: bool,
    pub jpeg_quality: u8,
    pub progress_every: usize,
    /// Stop after this many records, counted after the year check.
    pub limit: Option<usize>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            zoom: 5,
            workers: 8,
            tile_concurrency: 64,
            max_attempts: 5,
            backoff: Backoff::default(),
            skip_existing: true,
            require_year: false,
            jpeg_quality: 92,
            progress_every: 100,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchReport {
    pub attempted: usize,
    pub fetched: usize,
    pub skipped: usize,
    pub failed: usize,
    pub projected: usize,
    pub failed_project: usize,
    pub deleted: usize,
    #[serde(skip)]
    pub failures: Vec<ItemFailure>,
}

struct InlineProjection {
    projector: Arc<Projector>,
    delete_source: bool,
}

#[derive(Debug)]
enum Projection {
    NotRequested,
    Excluded,
    AlreadyDone,
    Written { deleted: bool },
    Failed(ItemFailure),
}

#[derive(Debug)]
struct Outcome {
    /// False when the panorama was already on disk.
    fetched: bool,
    projection: Projection,
}

pub struct FetchEngine<T> {
    tiles: Arc<T>,
    layout: Arc<ImageryLayout>,
    pool: Arc<ComputePool>,
    grid: TileGrid,
    opts: FetchOptions,
    inline: Option<InlineProjection>,
    limiter: Arc<Semaphore>,
    metrics: Arc<Metrics>,
}

impl<T: TileService> FetchEngine<T> {
    pub fn new(
        tiles: Arc<T>,
        layout: Arc<ImageryLayout>,
        pool: Arc<ComputePool>,
        opts: FetchOptions,
        metrics: Arc<Metrics>,
    ) -> Result<Self, PipelineError> {
        let grid = TileGrid::for_zoom(opts.zoom).ok_or_else(|| {
            PipelineError::InputInvalid(format!(
                "zoom {} is not served (max {})",
                opts.zoom,
                panocore::tiles::MAX_ZOOM
            ))
        })?;
        if opts.max_attempts == 0 {
            return Err(PipelineError::InputInvalid("max attempts must be at least 1".into()));
        }
        Ok(Self {
            tiles,
            layout,
            pool,
            grid,
            limiter: Arc::new(Semaphore::new(opts.tile_concurrency.max(1))),
            opts,
            inline: None,
            metrics,
        })
    }

    /// Projects each panorama right after it is assembled (or found on
    /// disk without its faces). With `delete_source`, the panorama file is
    /// removed once its faces are written.
    pub fn with_inline_projection(mut self, projector: Arc<Projector>, delete_source: bool) -> Self {
        self.inline = Some(InlineProjection {
            projector,
            delete_source,
        });
        self
    }

    pub async fn run(&self, records: &[PanoramaRecord], mut shutdown: Shutdown) -> Result<FetchReport, PipelineError> {
        storage::ensure_writable(&self.layout.pano_root)?;
        if self.inline.is_some() {
            storage::ensure_writable(&self.layout.cube_root)?;
        }

        let mut records: Vec<&PanoramaRecord> = records
            .iter()
            .filter(|r| !self.opts.require_year || filter::keep(r, true))
            .collect();
        if self.opts.require_year {
            tracing::info!(eligible = records.len(), "Kept records with a capture year.");
        }
        if let Some(n) = self.opts.limit {
            records.truncate(n);
        }
        let total = records.len();
        tracing::info!(
            panoramas = total,
            zoom = self.grid.zoom,
            tiles_per_panorama = self.grid.len(),
            workers = self.opts.workers,
            tile_concurrency = self.opts.tile_concurrency,
            inline_projection = self.inline.is_some(),
            "Starting panorama fetch."
        );

        let mut results = stream::iter(records)
            .map(|record| async move { (record.id.as_str(), self.process(record).await) })
            .buffer_unordered(self.opts.workers.max(1));

        let mut report = FetchReport::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    tracing::warn!(processed = report.attempted, total, "Fetch cancelled; in-flight panoramas dropped.");
                    return Err(PipelineError::Cancelled);
                }
                next = results.next() => next,
            };
            let Some((id, result)) = next else { break };
            report.attempted += 1;

            match result {
                Ok(outcome) => self.record(&mut report, id, outcome),
                Err(ItemError::Failed(failure)) => {
                    tracing::warn!(panoid = %id, kind = ?failure.kind, attempts = failure.attempts, error = %failure.detail, "Panorama failed.");
                    self.metrics.panoramas_failed_total.inc();
                    report.failed += 1;
                    report.failures.push(failure);
                }
                Err(ItemError::Fatal(e)) => {
                    tracing::error!(panoid = %id, error = %e, "Aborting fetch.");
                    return Err(e);
                }
            }

            if self.opts.progress_every > 0 && report.attempted % self.opts.progress_every == 0 {
                tracing::info!(
                    processed = report.attempted,
                    total,
                    fetched = report.fetched,
                    skipped = report.skipped,
                    failed = report.failed,
                    "Fetch progress."
                );
            }
        }

        tracing::info!(
            fetched = report.fetched,
            skipped = report.skipped,
            failed = report.failed,
            projected = report.projected,
            failed_project = report.failed_project,
            "Fetch finished."
        );
        Ok(report)
    }

    fn record(&self, report: &mut FetchReport, id: &str, outcome: Outcome) {
        if outcome.fetched {
            report.fetched += 1;
        } else {
            report.skipped += 1;
            self.metrics.panoramas_skipped_total.inc();
        }
        match outcome.projection {
            Projection::NotRequested | Projection::AlreadyDone => {}
            Projection::Excluded => tracing::debug!(panoid = %id, "No capture date; not projected."),
            Projection::Written { deleted } => {
                report.projected += 1;
                self.metrics.projections_total.inc();
                if deleted {
                    report.deleted += 1;
                    self.metrics.panoramas_deleted_total.inc();
                }
            }
            Projection::Failed(failure) => {
                tracing::warn!(panoid = %id, kind = ?failure.kind, error = %failure.detail, "Projection failed.");
                report.failed_project += 1;
                self.metrics.projections_failed_total.inc();
                report.failures.push(failure);
            }
        }
    }

    async fn process(&self, record: &PanoramaRecord) -> Result<Outcome, ItemError> {
        if let Err(e) = record.validate() {
            return Err(ItemFailure::new(record.id.clone(), FailureKind::MetadataInvalid, 0, e).into());
        }

        let pano_path = self.layout.panorama_path(record);
        let plan = self
            .inline
            .as_ref()
            .map(|inline| inline.projector.plan(&record.id, Some(record)));

        if self.opts.skip_existing {
            if let (Some(inline), Some(FacePlan::Complete)) = (&self.inline, &plan) {
                if inline.delete_source || pano_path.is_file() {
                    return Ok(Outcome {
                        fetched: false,
                        projection: Projection::AlreadyDone,
                    });
                }
            }
            if pano_path.is_file() {
                let projection = match (&self.inline, plan) {
                    (Some(inline), Some(FacePlan::Pending(targets))) => {
                        match inline.projector.project_file(&record.id, pano_path.clone(), targets).await {
                            Ok(n) => {
                                self.metrics.faces_written_total.inc_by(n as u64);
                                Projection::Written {
                                    deleted: inline.delete_source && delete_source(&pano_path).await,
                                }
                            }
                            Err(failure) => Projection::Failed(failure),
                        }
                    }
                    (Some(_), Some(FacePlan::Excluded)) => Projection::Excluded,
                    _ => Projection::NotRequested,
                };
                tracing::debug!(panoid = %record.id, path = %pano_path.display(), "Panorama already on disk.");
                return Ok(Outcome {
                    fetched: false,
                    projection,
                });
            }
        }

        let image = Arc::new(self.assemble(record).await?);

        let write_path = pano_path.clone();
        let quality = self.opts.jpeg_quality;
        let to_write = image.clone();
        self.pool
            .run(move || storage::write_jpeg_atomic(&write_path, &to_write.pixels, quality))
            .await
            .map_err(ItemError::Fatal)?
            .map_err(|e| {
                ItemFailure::new(
                    record.id.clone(),
                    FailureKind::StorageWriteFailed,
                    1,
                    format!("{}: {e}", pano_path.display()),
                )
            })?;
        self.metrics.panoramas_fetched_total.inc();
        tracing::debug!(panoid = %record.id, path = %pano_path.display(), "Panorama written.");

        let projection = match (&self.inline, plan) {
            (Some(inline), Some(FacePlan::Pending(targets))) => match inline.projector.write_faces(image, targets).await {
                Ok(n) => {
                    self.metrics.faces_written_total.inc_by(n as u64);
                    Projection::Written {
                        deleted: inline.delete_source && delete_source(&pano_path).await,
                    }
                }
                Err(failure) => Projection::Failed(failure),
            },
            (Some(_), Some(FacePlan::Complete)) => Projection::AlreadyDone,
            (Some(_), Some(FacePlan::Excluded)) => Projection::Excluded,
            _ => Projection::NotRequested,
        };

        Ok(Outcome {
            fetched: true,
            projection,
        })
    }

    /// Fetches every tile of the panorama, retrying rounds with backoff while
    /// the failures are transient, then stitches on the compute pool. Tiles
    /// that arrive but do not decode are dropped and fetched again.
    async fn assemble(&self, record: &PanoramaRecord) -> Result<EquirectangularImage, ItemError> {
        let mut set = TileSet::new(record.id.as_str(), self.grid);
        let mut attempt = 1;
        loop {
            let mut errors = self.fetch_missing(&mut set).await;
            if set.is_complete() {
                let (returned, stitched) = self
                    .pool
                    .run(move || {
                        let stitched = set.stitch();
                        (set, stitched)
                    })
                    .await
                    .map_err(ItemError::Fatal)?;
                set = returned;
                match stitched {
                    Ok(image) => return Ok(image),
                    Err(StitchError::Decode { tiles, source, .. }) => {
                        tracing::debug!(panoid = %record.id, tiles = tiles.len(), error = %source, "Dropping undecodable tiles.");
                        for key in tiles {
                            set.remove(key);
                        }
                        errors.push(ServiceError::Unavailable(format!("undecodable tile: {source}")));
                    }
                    Err(e) => {
                        return Err(ItemFailure::new(record.id.clone(), FailureKind::TileFetchFailed, attempt, e).into())
                    }
                }
            }

            if let Some(ServiceError::Permanent(msg)) = errors.iter().find(|e| matches!(e, ServiceError::Permanent(_))) {
                return Err(ItemError::Fatal(PipelineError::NetworkPermanent(msg.clone())));
            }
            let missing = set.missing().len();
            let detail = || {
                let first = errors
                    .first()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "no response".into());
                format!("{missing} of {} tiles missing: {first}", self.grid.len())
            };
            let retryable = errors.iter().all(ServiceError::is_transient);
            if !retryable || attempt >= self.opts.max_attempts {
                return Err(ItemFailure::new(record.id.clone(), FailureKind::TileFetchFailed, attempt, detail()).into());
            }

            let delay = self.opts.backoff.delay(attempt);
            tracing::debug!(panoid = %record.id, attempt, missing, delay_ms = delay.as_millis() as u64, "Retrying missing tiles.");
            self.metrics.tile_retries_total.inc();
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// One round over the tiles not yet in `set`; returns the errors seen.
    async fn fetch_missing(&self, set: &mut TileSet) -> Vec<ServiceError> {
        let zoom = self.grid.zoom;
        let id = set.panorama_id().to_string();
        let id = id.as_str();

        let results: Vec<_> = stream::iter(set.missing())
            .map(|key| async move {
                // The limiter is never closed.
                let _permit = self.limiter.acquire().await.ok();
                (key, self.tiles.fetch_tile(id, zoom, key).await)
            })
            .buffer_unordered(self.opts.tile_concurrency.max(1))
            .collect()
            .await;

        let mut errors = Vec::new();
        for (key, result) in results {
            match result {
                Ok(bytes) => {
                    self.metrics.tiles_fetched_total.inc();
                    set.insert(key, bytes);
                }
                Err(e) => {
                    tracing::debug!(panoid = %id, row = key.row, col = key.col, error = %e, "Tile fetch failed.");
                    errors.push(e);
                }
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::ProjectionSettings;
    use crate::remote::fake::FakeTiles;
    use panocore::{Face, ProjectionConfig};
    use std::{path::Path, sync::atomic::Ordering, time::Duration};

    fn opts() -> FetchOptions {
        FetchOptions {
            zoom: 0,
            workers: 2,
            tile_concurrency: 4,
            max_attempts: 5,
            backoff: Backoff {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(4),
            },
            ..FetchOptions::default()
        }
    }

    fn layout(root: &Path) -> Arc<ImageryLayout> {
        Arc::new(ImageryLayout::new(root.join("panoramas"), root.join("cube_pano")))
    }

    fn build_engine(root: &Path, tiles: Arc<FakeTiles>, opts: FetchOptions) -> (FetchEngine<FakeTiles>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let pool = Arc::new(ComputePool::new(2).unwrap());
        let engine = FetchEngine::new(tiles, layout(root), pool, opts, metrics.clone()).unwrap();
        (engine, metrics)
    }

    fn projector(root: &Path) -> Arc<Projector> {
        let settings = ProjectionSettings {
            config: ProjectionConfig {
                face_size: 16,
                fov_deg: 90.0,
            },
            ..ProjectionSettings::default()
        };
        Arc::new(Projector::new(Arc::new(ComputePool::new(2).unwrap()), layout(root), settings).unwrap())
    }

    fn abc123() -> PanoramaRecord {
        PanoramaRecord::new("abc123", 40.0, -73.0).with_date(Some(2021), Some(6))
    }

    #[tokio::test]
    async fn fetches_and_projects_the_documented_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let tiles = Arc::new(FakeTiles::solid([30, 60, 90]));
        let (engine, metrics) = build_engine(dir.path(), tiles, opts());
        let engine = engine.with_inline_projection(projector(dir.path()), false);
        let (_t, shutdown) = Shutdown::new();

        let report = engine.run(&[abc123()], shutdown).await.unwrap();

        assert_eq!((report.fetched, report.projected, report.failed), (1, 1, 0));
        let pano = storage::read_rgb(&dir.path().join("panoramas/abc123.jpg")).unwrap();
        assert_eq!(pano.dimensions(), (416, 208));
        for face in Face::ALL {
            assert!(dir.path().join(format!("cube_pano/2021/abc123_{face}.jpg")).is_file());
        }
        assert_eq!(metrics.faces_written_total.get(), 4);
    }

    #[tokio::test]
    async fn second_run_skips_everything_without_tile_requests() {
        let dir = tempfile::tempdir().unwrap();
        let tiles = Arc::new(FakeTiles::solid([1, 2, 3]));
        let (engine, _) = build_engine(dir.path(), tiles.clone(), opts());
        let records: Vec<_> = ["a1", "b2", "c3"]
            .iter()
            .map(|id| PanoramaRecord::new(*id, 1.0, 1.0).with_date(Some(2020), None))
            .collect();
        let (_t, shutdown) = Shutdown::new();

        let first = engine.run(&records, shutdown.clone()).await.unwrap();
        let calls = tiles.calls();
        let bytes = std::fs::read(dir.path().join("panoramas/a1.jpg")).unwrap();

        let second = engine.run(&records, shutdown).await.unwrap();
        assert_eq!(first.fetched, 3);
        assert_eq!(second.skipped, first.fetched);
        assert_eq!(second.fetched, 0);
        assert_eq!(tiles.calls(), calls);
        assert_eq!(std::fs::read(dir.path().join("panoramas/a1.jpg")).unwrap(), bytes);
    }

    #[tokio::test]
    async fn transient_failures_within_the_bound_still_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let tiles = Arc::new(FakeTiles::solid([9, 9, 9]));
        tiles.transient_failures.store(3, Ordering::SeqCst);
        let (engine, metrics) = build_engine(dir.path(), tiles.clone(), opts());
        let (_t, shutdown) = Shutdown::new();

        let report = engine.run(&[abc123()], shutdown).await.unwrap();

        assert_eq!((report.fetched, report.failed), (1, 0));
        assert_eq!(tiles.calls(), 4);
        assert_eq!(metrics.tile_retries_total.get(), 3);
        assert!(dir.path().join("panoramas/abc123.jpg").is_file());
    }

    #[tokio::test]
    async fn failures_beyond_the_bound_leave_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let tiles = Arc::new(FakeTiles::solid([9, 9, 9]));
        tiles.transient_failures.store(100, Ordering::SeqCst);
        let (engine, metrics) = build_engine(dir.path(), tiles.clone(), opts());
        let (_t, shutdown) = Shutdown::new();

        let report = engine.run(&[abc123()], shutdown).await.unwrap();

        assert_eq!((report.fetched, report.failed), (0, 1));
        assert_eq!(report.failures[0].kind, FailureKind::TileFetchFailed);
        assert_eq!(report.failures[0].attempts, 5);
        assert_eq!(tiles.calls(), 5);
        assert_eq!(metrics.panoramas_failed_total.get(), 1);
        let leftovers = std::fs::read_dir(dir.path().join("panoramas")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn missing_tiles_fail_without_retrying() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = FakeTiles::solid([0, 0, 0]);
        fake.not_found = true;
        let tiles = Arc::new(fake);
        let (engine, _) = build_engine(dir.path(), tiles.clone(), opts());
        let (_t, shutdown) = Shutdown::new();

        let report = engine.run(&[abc123()], shutdown).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(tiles.calls(), 1);
    }

    #[tokio::test]
    async fn permanent_refusal_aborts_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = FakeTiles::solid([0, 0, 0]);
        fake.permanent = true;
        let (engine, _) = build_engine(dir.path(), Arc::new(fake), opts());
        let (_t, shutdown) = Shutdown::new();

        let err = engine.run(&[abc123()], shutdown).await.unwrap_err();
        assert!(matches!(err, PipelineError::NetworkPermanent(_)));
    }

    #[tokio::test]
    async fn invalid_records_are_reported_not_fetched() {
        let dir = tempfile::tempdir().unwrap();
        let tiles = Arc::new(FakeTiles::solid([0, 0, 0]));
        let (engine, _) = build_engine(dir.path(), tiles.clone(), opts());
        let (_t, shutdown) = Shutdown::new();

        let bad = PanoramaRecord::new("../escape", 1.0, 1.0);
        let report = engine.run(&[bad], shutdown).await.unwrap();
        assert_eq!(report.failures[0].kind, FailureKind::MetadataInvalid);
        assert_eq!(tiles.calls(), 0);
    }

    #[tokio::test]
    async fn delete_after_projection_then_resume_skips_on_faces() {
        let dir = tempfile::tempdir().unwrap();
        let tiles = Arc::new(FakeTiles::solid([5, 5, 5]));
        let (engine, _) = build_engine(dir.path(), tiles.clone(), opts());
        let engine = engine.with_inline_projection(projector(dir.path()), true);
        let (_t, shutdown) = Shutdown::new();

        let first = engine.run(&[abc123()], shutdown.clone()).await.unwrap();
        assert_eq!((first.fetched, first.projected, first.deleted), (1, 1, 1));
        assert!(!dir.path().join("panoramas/abc123.jpg").exists());
        assert!(dir.path().join("cube_pano/2021/abc123_left.jpg").is_file());

        let calls = tiles.calls();
        let second = engine.run(&[abc123()], shutdown).await.unwrap();
        assert_eq!((second.fetched, second.skipped), (0, 1));
        assert_eq!(tiles.calls(), calls);
    }

    #[tokio::test]
    async fn existing_panorama_gets_its_missing_faces() {
        let dir = tempfile::tempdir().unwrap();
        let tiles = Arc::new(FakeTiles::solid([5, 5, 5]));
        let (plain, _) = build_engine(dir.path(), tiles.clone(), opts());
        let (_t, shutdown) = Shutdown::new();
        plain.run(&[abc123()], shutdown.clone()).await.unwrap();
        let calls = tiles.calls();

        let (engine, _) = build_engine(dir.path(), tiles.clone(), opts());
        let engine = engine.with_inline_projection(projector(dir.path()), false);
        let report = engine.run(&[abc123()], shutdown).await.unwrap();

        assert_eq!((report.skipped, report.projected), (1, 1));
        assert_eq!(tiles.calls(), calls);
        assert!(dir.path().join("cube_pano/2021/abc123_front.jpg").is_file());
    }

    #[tokio::test]
    async fn limit_caps_the_records_processed() {
        let dir = tempfile::tempdir().unwrap();
        let tiles = Arc::new(FakeTiles::solid([5, 5, 5]));
        let (engine, _) = build_engine(
            dir.path(),
            tiles,
            FetchOptions {
                limit: Some(1),
                ..opts()
            },
        );
        let records = vec![abc123(), PanoramaRecord::new("other", 1.0, 1.0)];
        let (_t, shutdown) = Shutdown::new();
        let report = engine.run(&records, shutdown).await.unwrap();
        assert_eq!(report.attempted, 1);
        assert!(!dir.path().join("panoramas/other.jpg").exists());
    }

    #[tokio::test]
    async fn undated_records_are_skipped_when_a_year_is_required() {
        let dir = tempfile::tempdir().unwrap();
        let tiles = Arc::new(FakeTiles::solid([5, 5, 5]));
        let (engine, _) = build_engine(
            dir.path(),
            tiles.clone(),
            FetchOptions {
                require_year: true,
                limit: Some(1),
                ..opts()
            },
        );
        let records = vec![PanoramaRecord::new("undated", 1.0, 1.0), abc123()];
        let (_t, shutdown) = Shutdown::new();

        let report = engine.run(&records, shutdown).await.unwrap();

        assert_eq!((report.attempted, report.fetched), (1, 1));
        assert_eq!(tiles.calls(), 1);
        assert!(dir.path().join("panoramas/abc123.jpg").is_file());
        assert!(!dir.path().join("panoramas/undated.jpg").exists());
    }

    #[tokio::test]
    async fn undecodable_tile_is_fetched_again() {
        let dir = tempfile::tempdir().unwrap();
        let tiles = Arc::new(FakeTiles::solid([7, 7, 7]));
        tiles.corrupt_responses.store(1, Ordering::SeqCst);
        let (engine, metrics) = build_engine(dir.path(), tiles.clone(), opts());
        let (_t, shutdown) = Shutdown::new();

        let report = engine.run(&[abc123()], shutdown).await.unwrap();

        assert_eq!((report.fetched, report.failed), (1, 0));
        assert_eq!(tiles.calls(), 2);
        assert_eq!(metrics.tile_retries_total.get(), 1);
        let pano = storage::read_rgb(&dir.path().join("panoramas/abc123.jpg")).unwrap();
        assert_eq!(pano.dimensions(), (416, 208));
    }

    #[tokio::test]
    async fn shutdown_during_tile_fetch_cancels_and_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let entered = Arc::new(tokio::sync::Notify::new());
        let tiles = Arc::new(FakeTiles {
            blocked: Some(("stuck".into(), entered.clone())),
            ..FakeTiles::solid([5, 5, 5])
        });
        let (engine, _) = build_engine(
            dir.path(),
            tiles,
            FetchOptions {
                workers: 1,
                ..opts()
            },
        );
        let records = vec![
            abc123(),
            PanoramaRecord::new("stuck", 1.0, 1.0).with_date(Some(2022), None),
        ];
        let (trigger, shutdown) = Shutdown::new();

        let (result, ()) = tokio::join!(engine.run(&records, shutdown), async {
            entered.notified().await;
            trigger.fire();
        });

        assert!(matches!(result, Err(PipelineError::Cancelled)));
        let pano = storage::read_rgb(&dir.path().join("panoramas/abc123.jpg")).unwrap();
        assert_eq!(pano.dimensions(), (416, 208));
        let mut names: Vec<_> = std::fs::read_dir(dir.path().join("panoramas"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["abc123.jpg".to_string()]);
    }

    #[test]
    fn rejects_unserved_zoom() {
        let dir = tempfile::tempdir().unwrap();
        let tiles = Arc::new(FakeTiles::solid([0, 0, 0]));
        let pool = Arc::new(ComputePool::new(1).unwrap());
        let result = FetchEngine::new(
            tiles,
            layout(dir.path()),
            pool,
            FetchOptions {
                zoom: 9,
                ..opts()
            },
            Arc::new(Metrics::new()),
        );
        assert!(matches!(result, Err(PipelineError::InputInvalid(_))));
    }
}
