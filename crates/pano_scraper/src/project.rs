use crate::{
    compute::ComputePool,
    error::{FailureKind, ItemFailure, PipelineError},
    metrics::Metrics,
    shutdown::Shutdown,
    storage,
};
use futures::{stream, StreamExt};
use panocore::{
    cubemap, layout::panorama_id_from_path, Catalog, EquirectangularImage, Face, ImageryLayout, PanoramaRecord,
    ProjectionConfig,
};
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

#[derive(Debug, Clone)]
pub struct ProjectionSettings {
    pub config: ProjectionConfig,
    pub faces: Vec<Face>,
    /// Re-project even when every face already exists.
    pub force: bool,
    pub jpeg_quality: u8,
}

impl Default for ProjectionSettings {
    fn default() -> Self {
        Self {
            config: ProjectionConfig::default(),
            faces: Face::ALL.to_vec(),
            force: false,
            jpeg_quality: 92,
        }
    }
}

impl ProjectionSettings {
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.config
            .validate()
            .map_err(|e| PipelineError::InputInvalid(e.to_string()))?;
        if self.faces.is_empty() {
            return Err(PipelineError::InputInvalid("at least one face must be enabled".into()));
        }
        Ok(())
    }
}

/// What projection still has to do for one panorama.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FacePlan {
    /// No usable date and the missing-date policy excludes it.
    Excluded,
    /// All faces exist and re-projection was not forced.
    Complete,
    Pending(Vec<(Face, PathBuf)>),
}

/// Projects panoramas into cube faces on the compute pool and writes them.
pub struct Projector {
    pool: Arc<ComputePool>,
    layout: Arc<ImageryLayout>,
    settings: Arc<ProjectionSettings>,
}

impl Projector {
    pub fn new(
        pool: Arc<ComputePool>,
        layout: Arc<ImageryLayout>,
        settings: ProjectionSettings,
    ) -> Result<Self, PipelineError> {
        settings.validate()?;
        Ok(Self {
            pool,
            layout,
            settings: Arc::new(settings),
        })
    }

    pub fn layout(&self) -> &ImageryLayout {
        &self.layout
    }

    pub fn plan(&self, panorama_id: &str, record: Option<&PanoramaRecord>) -> FacePlan {
        match self.layout.face_paths(panorama_id, record, &self.settings.faces) {
            None => FacePlan::Excluded,
            Some(paths) if !self.settings.force && paths.iter().all(|(_, p)| p.is_file()) => FacePlan::Complete,
            Some(paths) => FacePlan::Pending(paths),
        }
    }

    /// Projects an in-memory panorama; returns the number of faces written.
    pub async fn write_faces(
        &self,
        image: Arc<EquirectangularImage>,
        targets: Vec<(Face, PathBuf)>,
    ) -> Result<usize, ItemFailure> {
        let settings = self.settings.clone();
        let id = image.panorama_id.clone();
        self.pool
            .run(move || render_and_write(&image, &targets, &settings))
            .await
            .map_err(|e| ItemFailure::new(id, FailureKind::ProjectionFailed, 1, e))?
    }

    /// Loads a stored panorama and projects it.
    pub async fn project_file(
        &self,
        panorama_id: &str,
        path: PathBuf,
        targets: Vec<(Face, PathBuf)>,
    ) -> Result<usize, ItemFailure> {
        let settings = self.settings.clone();
        let id = panorama_id.to_string();
        let job_id = id.clone();
        self.pool
            .run(move || {
                let pixels = storage::read_rgb(&path).map_err(|e| {
                    ItemFailure::new(
                        job_id.clone(),
                        FailureKind::ProjectionFailed,
                        1,
                        format!("cannot decode {}: {e}", path.display()),
                    )
                })?;
                render_and_write(&EquirectangularImage::new(job_id, pixels), &targets, &settings)
            })
            .await
            .map_err(|e| ItemFailure::new(id, FailureKind::ProjectionFailed, 1, e))?
    }
}

fn render_and_write(
    image: &EquirectangularImage,
    targets: &[(Face, PathBuf)],
    settings: &ProjectionSettings,
) -> Result<usize, ItemFailure> {
    let faces: Vec<Face> = targets.iter().map(|(f, _)| *f).collect();
    let set = cubemap::project(image, &faces, &settings.config)
        .map_err(|e| ItemFailure::new(image.panorama_id.clone(), FailureKind::ProjectionFailed, 1, e))?;

    // `project` returns faces in request order.
    for (face, (_, path)) in set.faces.iter().zip(targets) {
        storage::write_jpeg_atomic(path, &face.pixels, settings.jpeg_quality).map_err(|e| {
            ItemFailure::new(
                image.panorama_id.clone(),
                FailureKind::StorageWriteFailed,
                1,
                format!("{}: {e}", path.display()),
            )
        })?;
    }
    Ok(set.faces.len())
}

/// Removes a source panorama once its faces are on disk. Failures are
/// logged; the faces are already durable.
pub async fn delete_source(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Could not delete projected panorama.");
            false
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectReport {
    pub scanned: usize,
    pub projected: usize,
    pub skipped_existing: usize,
    /// Panoramas the missing-date policy kept out of projection.
    pub excluded: usize,
    pub deleted: usize,
    #[serde(skip)]
    pub failures: Vec<ItemFailure>,
}

enum Projected {
    Written { faces: usize, deleted: bool },
    AlreadyDone { deleted: bool },
    Excluded,
}

/// Projects every stored panorama under the layout's panorama root, using
/// `catalog` for date grouping. With `delete_source`, a panorama is removed
/// once all its faces exist.
pub async fn project_directory(
    projector: &Projector,
    catalog: &Catalog,
    delete_source: bool,
    metrics: &Metrics,
    mut shutdown: Shutdown,
) -> Result<ProjectReport, PipelineError> {
    let root = projector.layout().pano_root.clone();
    if !root.is_dir() {
        return Err(PipelineError::MissingDependency {
            stage: "project",
            what: format!("panorama directory {}", root.display()),
        });
    }
    storage::ensure_writable(&projector.layout().cube_root)?;

    let files = tokio::task::spawn_blocking(move || scan_panoramas(&root))
        .await
        .map_err(|e| PipelineError::ComputePool(e.to_string()))?;
    tracing::info!(
        panoramas = files.len(),
        catalog = catalog.len(),
        delete_source,
        "Starting projection."
    );

    let width = projector.pool.threads().max(1);
    let mut results = stream::iter(files)
        .map(|(id, path)| async move {
            let outcome = project_one(projector, catalog.get(&id), &id, &path, delete_source).await;
            (id, outcome)
        })
        .buffer_unordered(width);

    let mut report = ProjectReport::default();
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.wait() => {
                tracing::warn!(scanned = report.scanned, projected = report.projected, "Projection cancelled.");
                return Err(PipelineError::Cancelled);
            }
            next = results.next() => next,
        };
        let Some((id, outcome)) = next else { break };
        report.scanned += 1;

        match outcome {
            Ok(Projected::Written { faces, deleted }) => {
                report.projected += 1;
                metrics.projections_total.inc();
                metrics.faces_written_total.inc_by(faces as u64);
                if deleted {
                    report.deleted += 1;
                    metrics.panoramas_deleted_total.inc();
                }
            }
            Ok(Projected::AlreadyDone { deleted }) => {
                report.skipped_existing += 1;
                if deleted {
                    report.deleted += 1;
                    metrics.panoramas_deleted_total.inc();
                }
            }
            Ok(Projected::Excluded) => {
                tracing::debug!(panoid = %id, "No capture date; excluded from projection.");
                report.excluded += 1;
            }
            Err(failure) => {
                tracing::warn!(panoid = %id, kind = ?failure.kind, error = %failure.detail, "Projection failed.");
                metrics.projections_failed_total.inc();
                report.failures.push(failure);
            }
        }
    }

    tracing::info!(
        scanned = report.scanned,
        projected = report.projected,
        skipped_existing = report.skipped_existing,
        excluded = report.excluded,
        failed = report.failures.len(),
        deleted = report.deleted,
        "Projection finished."
    );
    Ok(report)
}

async fn project_one(
    projector: &Projector,
    record: Option<&PanoramaRecord>,
    id: &str,
    path: &Path,
    delete: bool,
) -> Result<Projected, ItemFailure> {
    match projector.plan(id, record) {
        FacePlan::Excluded => Ok(Projected::Excluded),
        FacePlan::Complete => Ok(Projected::AlreadyDone {
            deleted: delete && delete_source(path).await,
        }),
        FacePlan::Pending(targets) => {
            let faces = projector.project_file(id, path.to_path_buf(), targets).await?;
            Ok(Projected::Written {
                faces,
                deleted: delete && delete_source(path).await,
            })
        }
    }
}

/// Stored panoramas under `root` as `(id, path)`, sorted by path.
fn scan_panoramas(root: &Path) -> Vec<(String, PathBuf)> {
    let mut found: Vec<(String, PathBuf)> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable entry.");
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| panorama_id_from_path(e.path()).map(|id| (id, e.into_path())))
        .collect();
    found.sort_by(|a, b| a.1.cmp(&b.1));
    found
}
