use crate::record::PanoramaRecord;
use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Keys under which older catalog files nest the record array.
const WRAPPER_KEYS: [&str; 4] = ["panoids", "data", "items", "records"];

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("catalog {path}: invalid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("catalog {path}: expected an array of records (or an object wrapping one)")]
    Shape { path: PathBuf },
}

/// An ordered, id-unique set of panorama records.
///
/// Insertion order is preserved so a catalog written twice from the same
/// discovery run is byte-identical.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    records: Vec<PanoramaRecord>,
    index: HashMap<String, usize>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `record` unless its id is already present. The first
    /// occurrence wins; returns whether the record was new.
    pub fn insert(&mut self, record: PanoramaRecord) -> bool {
        if self.index.contains_key(&record.id) {
            return false;
        }
        self.index.insert(record.id.clone(), self.records.len());
        self.records.push(record);
        true
    }

    pub fn get(&self, id: &str) -> Option<&PanoramaRecord> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PanoramaRecord> {
        self.records.iter()
    }

    pub fn records(&self) -> &[PanoramaRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<PanoramaRecord> {
        self.records
    }
}

impl FromIterator<PanoramaRecord> for Catalog {
    fn from_iter<I: IntoIterator<Item = PanoramaRecord>>(iter: I) -> Self {
        let mut catalog = Catalog::new();
        for record in iter {
            catalog.insert(record);
        }
        catalog
    }
}

/// Result of reading a catalog file.
#[derive(Debug)]
pub struct LoadedCatalog {
    pub catalog: Catalog,
    /// Rows that did not match the record schema.
    pub skipped_rows: usize,
    /// Rows whose id was already present earlier in the file.
    pub duplicate_rows: usize,
}

/// Parses catalog JSON. Rows that fail the strict record schema are
/// skipped and counted rather than failing the whole file.
pub fn parse_catalog(bytes: &[u8], path: &Path) -> Result<LoadedCatalog, CatalogError> {
    let root: Value = serde_json::from_slice(bytes).map_err(|source| CatalogError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let rows = match root {
        Value::Array(rows) => rows,
        Value::Object(mut map) => WRAPPER_KEYS
            .iter()
            .find_map(|k| match map.remove(*k) {
                Some(Value::Array(rows)) => Some(rows),
                _ => None,
            })
            .ok_or_else(|| CatalogError::Shape {
                path: path.to_path_buf(),
            })?,
        _ => {
            return Err(CatalogError::Shape {
                path: path.to_path_buf(),
            })
        }
    };

    let mut catalog = Catalog::new();
    let mut skipped_rows = 0;
    let mut duplicate_rows = 0;
    for row in rows {
        match serde_json::from_value::<PanoramaRecord>(row) {
            Ok(record) => {
                if !catalog.insert(record) {
                    duplicate_rows += 1;
                }
            }
            Err(_) => skipped_rows += 1,
        }
    }

    Ok(LoadedCatalog {
        catalog,
        skipped_rows,
        duplicate_rows,
    })
}

pub fn read_catalog<P: AsRef<Path>>(path: P) -> Result<LoadedCatalog, CatalogError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_catalog(&bytes, path)
}

/// Writes `records` as a pretty-printed JSON array. The file is written to a
/// temporary sibling first and renamed into place, so readers never observe
/// a half-written catalog.
pub fn write_catalog<P: AsRef<Path>>(path: P, records: &[PanoramaRecord]) -> Result<(), CatalogError> {
    let path = path.as_ref();
    let io_err = |source: io::Error| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    serde_json::to_writer_pretty(&mut tmp, records).map_err(|source| CatalogError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    tmp.write_all(b"\n").map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    sync_dir(dir).map_err(io_err)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
