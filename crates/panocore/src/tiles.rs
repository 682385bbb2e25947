use image::{imageops, RgbImage};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Edge length of one tile served by the tile service, in pixels.
pub const TILE_SIZE: u32 = 512;

/// Highest zoom level the tile service serves.
pub const MAX_ZOOM: u8 = 5;

#[derive(Debug, thiserror::Error)]
pub enum StitchError {
    #[error("panorama {id}: {missing} of {total} tiles missing")]
    Incomplete { id: String, missing: usize, total: usize },
    /// `tiles` lists every undecodable position; `source` is the first error.
    #[error("panorama {id}: {} tile(s) could not be decoded: {source}", .tiles.len())]
    Decode {
        id: String,
        tiles: Vec<TileKey>,
        #[source]
        source: image::ImageError,
    },
}

/// Position of one tile within a panorama's grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub row: u32,
    pub col: u32,
}

/// Tile grid of a panorama at one zoom level.
///
/// The full equirectangular image at zoom `z` is `416·2^z × 208·2^z` px,
/// covered by 512 px tiles; tiles on the right and bottom edges overhang
/// and are cropped during stitching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub zoom: u8,
    pub cols: u32,
    pub rows: u32,
    pub tile_size: u32,
    pub width: u32,
    pub height: u32,
}

impl TileGrid {
    pub fn for_zoom(zoom: u8) -> Option<Self> {
        if zoom > MAX_ZOOM {
            return None;
        }
        let width = 416u32 << zoom;
        let height = 208u32 << zoom;
        Some(Self {
            zoom,
            cols: width.div_ceil(TILE_SIZE),
            rows: height.div_ceil(TILE_SIZE),
            tile_size: TILE_SIZE,
            width,
            height,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        (self.cols * self.rows) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All tile positions, row-major.
    pub fn keys(&self) -> impl Iterator<Item = TileKey> + '_ {
        (0..self.rows).flat_map(move |row| (0..self.cols).map(move |col| TileKey { row, col }))
    }

    /// Pixel offset of a tile's top-left corner in the assembled image.
    #[inline]
    pub fn offset(&self, key: TileKey) -> (i64, i64) {
        (
            (key.col * self.tile_size) as i64,
            (key.row * self.tile_size) as i64,
        )
    }
}

/// Encoded tiles collected for one panorama during assembly.
#[derive(Debug, Clone)]
pub struct TileSet {
    panorama_id: String,
    grid: TileGrid,
    tiles: BTreeMap<TileKey, Vec<u8>>,
}

impl TileSet {
    pub fn new(panorama_id: impl Into<String>, grid: TileGrid) -> Self {
        Self {
            panorama_id: panorama_id.into(),
            grid,
            tiles: BTreeMap::new(),
        }
    }

    pub fn panorama_id(&self) -> &str {
        &self.panorama_id
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    pub fn insert(&mut self, key: TileKey, bytes: Vec<u8>) {
        self.tiles.insert(key, bytes);
    }

    /// Drops a tile so it is fetched again; false when it was not held.
    pub fn remove(&mut self, key: TileKey) -> bool {
        self.tiles.remove(&key).is_some()
    }

    /// Positions not fetched yet, row-major.
    pub fn missing(&self) -> Vec<TileKey> {
        self.grid
            .keys()
            .filter(|k| !self.tiles.contains_key(k))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.tiles.len() == self.grid.len()
    }

    /// Decodes every tile and copies it into one contiguous image at its
    /// fixed grid offset. Decoding runs in parallel; placement does not.
    pub fn stitch(&self) -> Result<EquirectangularImage, StitchError> {
        let missing = self.grid.len() - self.tiles.len();
        if missing > 0 {
            return Err(StitchError::Incomplete {
                id: self.panorama_id.clone(),
                missing,
                total: self.grid.len(),
            });
        }

        let results: Vec<_> = self
            .tiles
            .par_iter()
            .map(|(key, bytes)| (*key, image::load_from_memory(bytes).map(|img| img.to_rgb8())))
            .collect();

        let mut decoded = Vec::with_capacity(results.len());
        let mut undecodable = Vec::new();
        let mut first_error = None;
        for (key, result) in results {
            match result {
                Ok(tile) => decoded.push((key, tile)),
                Err(e) => {
                    undecodable.push(key);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(source) = first_error {
            return Err(StitchError::Decode {
                id: self.panorama_id.clone(),
                tiles: undecodable,
                source,
            });
        }

        let mut canvas = RgbImage::new(self.grid.width, self.grid.height);
        for (key, tile) in &decoded {
            let (x, y) = self.grid.offset(*key);
            imageops::replace(&mut canvas, tile, x, y);
        }

        Ok(EquirectangularImage {
            panorama_id: self.panorama_id.clone(),
            pixels: canvas,
        })
    }
}

/// A full 360°×180° panorama, longitude along x and latitude along y.
#[derive(Debug, Clone)]
pub struct EquirectangularImage {
    pub panorama_id: String,
    pub pixels: RgbImage,
}

impl EquirectangularImage {
    pub fn new(panorama_id: impl Into<String>, pixels: RgbImage) -> Self {
        Self {
            panorama_id: panorama_id.into(),
            pixels,
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    fn png_tile(size: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(size, size, Rgb(color));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn grid_dimensions_per_zoom() {
        let z5 = TileGrid::for_zoom(5).unwrap();
        assert_eq!((z5.width, z5.height), (13312, 6656));
        assert_eq!((z5.cols, z5.rows), (26, 13));
        assert_eq!(z5.len(), 338);

        let z1 = TileGrid::for_zoom(1).unwrap();
        assert_eq!((z1.width, z1.height, z1.cols, z1.rows), (832, 416, 2, 1));

        let z0 = TileGrid::for_zoom(0).unwrap();
        assert_eq!((z0.cols, z0.rows), (1, 1));

        assert!(TileGrid::for_zoom(6).is_none());
    }

    #[test]
    fn stitch_places_tiles_at_grid_offsets_and_crops_overhang() {
        let grid = TileGrid::for_zoom(1).unwrap();
        let mut set = TileSet::new("p", grid);
        set.insert(TileKey { row: 0, col: 0 }, png_tile(TILE_SIZE, [255, 0, 0]));
        assert_eq!(set.missing(), vec![TileKey { row: 0, col: 1 }]);
        set.insert(TileKey { row: 0, col: 1 }, png_tile(TILE_SIZE, [0, 0, 255]));
        assert!(set.is_complete());

        let pano = set.stitch().unwrap();
        assert_eq!((pano.width(), pano.height()), (832, 416));
        assert_eq!(pano.pixels.get_pixel(511, 415), &Rgb([255, 0, 0]));
        assert_eq!(pano.pixels.get_pixel(512, 0), &Rgb([0, 0, 255]));
        assert_eq!(pano.pixels.get_pixel(831, 415), &Rgb([0, 0, 255]));
    }

    #[test]
    fn stitch_refuses_partial_tile_sets() {
        let grid = TileGrid::for_zoom(1).unwrap();
        let mut set = TileSet::new("p", grid);
        set.insert(TileKey { row: 0, col: 0 }, png_tile(TILE_SIZE, [1, 2, 3]));
        assert!(matches!(
            set.stitch(),
            Err(StitchError::Incomplete { missing: 1, total: 2, .. })
        ));
    }

    #[test]
    fn undecodable_tiles_are_reported_and_can_be_refetched() {
        let grid = TileGrid::for_zoom(1).unwrap();
        let mut set = TileSet::new("p", grid);
        let bad = TileKey { row: 0, col: 1 };
        set.insert(TileKey { row: 0, col: 0 }, png_tile(TILE_SIZE, [1, 2, 3]));
        set.insert(bad, b"<html>rate limited</html>".to_vec());

        let tiles = match set.stitch() {
            Err(StitchError::Decode { tiles, .. }) => tiles,
            other => panic!("expected a decode error, got {other:?}"),
        };
        assert_eq!(tiles, vec![bad]);

        assert!(set.remove(bad));
        assert_eq!(set.missing(), vec![bad]);
        set.insert(bad, png_tile(TILE_SIZE, [4, 5, 6]));
        assert_eq!(set.stitch().unwrap().pixels.get_pixel(600, 10), &Rgb([4, 5, 6]));
    }
}
