use crate::cubemap::Face;
use crate::record::PanoramaRecord;
use std::path::{Path, PathBuf};

/// Extension of every persisted panorama and face.
pub const IMAGE_EXT: &str = "jpg";

/// Directory used for faces of undated panoramas under [`MissingDatePolicy::Unknown`].
pub const UNKNOWN_DATE_DIR: &str = "unknown";

/// How projection treats a panorama with no capture year (or no catalog entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingDatePolicy {
    /// Exclude it from projection.
    #[default]
    Skip,
    /// Project it under `unknown/`.
    Unknown,
}

/// Where panoramas and cube faces live on disk.
///
/// ```text
/// <pano_root>/[<year>/]<panoid>.jpg
/// <cube_root>/<year>/[<MM>/]<panoid>_<face>.jpg
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageryLayout {
    pub pano_root: PathBuf,
    pub cube_root: PathBuf,
    /// Partition panoramas by capture year.
    pub pano_by_year: bool,
    /// Add a two-digit month level (`00` when unknown) under the year.
    pub group_by_month: bool,
    pub missing_date: MissingDatePolicy,
}

impl ImageryLayout {
    pub fn new(pano_root: impl Into<PathBuf>, cube_root: impl Into<PathBuf>) -> Self {
        Self {
            pano_root: pano_root.into(),
            cube_root: cube_root.into(),
            pano_by_year: false,
            group_by_month: false,
            missing_date: MissingDatePolicy::Skip,
        }
    }

    pub fn panorama_path(&self, record: &PanoramaRecord) -> PathBuf {
        let mut path = self.pano_root.clone();
        if self.pano_by_year {
            if let Some(year) = record.capture_year {
                path.push(year.to_string());
            }
        }
        path.push(format!("{}.{IMAGE_EXT}", record.id));
        path
    }

    /// Relative date directory for a record's faces, or `None` when the
    /// record must be excluded from projection.
    pub fn date_dir(&self, record: Option<&PanoramaRecord>) -> Option<PathBuf> {
        match record.and_then(|r| r.capture_year.map(|y| (y, r.valid_month()))) {
            Some((year, month)) => {
                let mut dir = PathBuf::from(year.to_string());
                if self.group_by_month {
                    dir.push(format!("{:02}", month.unwrap_or(0)));
                }
                Some(dir)
            }
            None => match self.missing_date {
                MissingDatePolicy::Skip => None,
                MissingDatePolicy::Unknown => Some(PathBuf::from(UNKNOWN_DATE_DIR)),
            },
        }
    }

    /// Output path of each requested face, or `None` when excluded.
    pub fn face_paths(
        &self,
        panorama_id: &str,
        record: Option<&PanoramaRecord>,
        faces: &[Face],
    ) -> Option<Vec<(Face, PathBuf)>> {
        let dir = self.cube_root.join(self.date_dir(record)?);
        Some(
            faces
                .iter()
                .map(|&face| (face, dir.join(format!("{panorama_id}_{face}.{IMAGE_EXT}"))))
                .collect(),
        )
    }

    /// True when every requested face of the panorama is already on disk.
    pub fn faces_exist(&self, panorama_id: &str, record: Option<&PanoramaRecord>, faces: &[Face]) -> bool {
        self.face_paths(panorama_id, record, faces)
            .is_some_and(|paths| paths.iter().all(|(_, p)| p.is_file()))
    }
}

/// Panorama id encoded in a persisted panorama's file name.
pub fn panorama_id_from_path(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?;
    if !ext.eq_ignore_ascii_case(IMAGE_EXT) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    (!stem.is_empty()).then(|| stem.to_string())
}
