//! panocore: the runtime-free half of the street-level panorama pipeline.
//!
//! - `record`:   scrape points and panorama records (the catalog entity).
//! - `catalog`:  JSON catalog codec, first-wins dedup by panorama id.
//! - `filter`:   capture-date filter over a record set.
//! - `tiles`:    tile-grid layout per zoom level and tile stitching.
//! - `cubemap`:  equirectangular to perspective face projection.
//! - `layout`:   on-disk naming of panoramas and cube faces.
//!
//! Catalog file (JSON, pretty-printed):
//!   [ { "panoid": "abc123", "lat": 40.0, "lon": -73.0,
//!       "year": 2021, "month": 6, "neighbors": ["def456"] }, ... ]
//!   `year`, `month` and `neighbors` are omitted when absent.
//!
//! Nothing in here performs network I/O or spawns tasks; the async
//! pipeline in `pano_scraper` drives these pieces.

pub mod catalog;
pub mod cubemap;
pub mod filter;
pub mod layout;
pub mod record;
pub mod tiles;

pub use catalog::{Catalog, CatalogError, LoadedCatalog};
pub use cubemap::{CubeFace, CubeFaceSet, Face, ProjectError, ProjectionConfig};
pub use filter::{DropReason, FilterOptions, FilterOutcome, FilterStats, InvalidMonth};
pub use layout::{ImageryLayout, MissingDatePolicy};
pub use record::{PanoramaRecord, Point, RecordError};
pub use tiles::{EquirectangularImage, StitchError, TileGrid, TileKey, TileSet};
