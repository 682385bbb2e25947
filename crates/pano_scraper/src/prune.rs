use crate::storage;
use panocore::{
    layout::{panorama_id_from_path, IMAGE_EXT},
    PanoramaRecord,
};
use serde::Serialize;
use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub scanned: usize,
    pub kept: usize,
    pub deleted: usize,
    pub unparseable: usize,
}

/// Deletes stored panoramas whose id is not in `keep`. With `dry_run`, only
/// logs what would go.
pub fn prune(pano_root: &Path, keep: &HashSet<String>, dry_run: bool) -> io::Result<PruneReport> {
    let mut files: Vec<_> = walkdir::WalkDir::new(pano_root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(IMAGE_EXT))
        })
        .collect();
    files.sort();
    prune_paths(files, keep, dry_run)
}

fn prune_paths(files: Vec<PathBuf>, keep: &HashSet<String>, dry_run: bool) -> io::Result<PruneReport> {
    let mut report = PruneReport::default();
    for path in files {
        report.scanned += 1;
        let id = panorama_id_from_path(&path)
            .filter(|id| PanoramaRecord::new(id.as_str(), 0.0, 0.0).validate().is_ok());
        let Some(id) = id else {
            report.unparseable += 1;
            continue;
        };
        if keep.contains(&id) {
            report.kept += 1;
            continue;
        }

        if dry_run {
            tracing::info!(path = %path.display(), "Would delete.");
            report.deleted += 1;
        } else if storage::remove_if_exists(&path)? {
            tracing::debug!(path = %path.display(), "Deleted.");
            report.deleted += 1;
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn setup() -> (tempfile::TempDir, HashSet<String>) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("2021")).unwrap();
        for name in ["keep1.jpg", "drop1.jpg", "2021/keep2.jpg", "not an id.jpg", "notes.txt"] {
            fs::write(root.join(name), b"x").unwrap();
        }
        let keep = ["keep1", "keep2"].iter().map(|s| s.to_string()).collect();
        (dir, keep)
    }

    #[test]
    fn deletes_only_panoramas_outside_the_keep_set() {
        let (dir, keep) = setup();
        let report = prune(dir.path(), &keep, false).unwrap();
        assert_eq!(
            report,
            PruneReport {
                scanned: 4,
                kept: 2,
                deleted: 1,
                unparseable: 1
            }
        );
        assert!(!dir.path().join("drop1.jpg").exists());
        assert!(dir.path().join("2021/keep2.jpg").exists());
        assert!(dir.path().join("notes.txt").exists());
        assert!(dir.path().join("not an id.jpg").exists());
    }

    #[test]
    fn files_already_gone_are_not_counted_as_deleted() {
        let (dir, keep) = setup();
        let files = vec![dir.path().join("drop1.jpg"), dir.path().join("vanished.jpg")];
        let report = prune_paths(files, &keep, false).unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.deleted, 1);
        assert!(!dir.path().join("drop1.jpg").exists());
    }

    #[test]
    fn dry_run_deletes_nothing() {
        let (dir, keep) = setup();
        let report = prune(dir.path(), &keep, true).unwrap();
        assert_eq!(report.deleted, 1);
        assert!(dir.path().join("drop1.jpg").exists());
    }
}
