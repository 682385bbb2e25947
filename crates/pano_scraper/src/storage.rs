use crate::error::PipelineError;
use image::{codecs::jpeg::JpegEncoder, RgbImage};
use std::{
    fs,
    io::{self, BufWriter, Write},
    path::Path,
};

/// Creates `root` if needed and proves a file can be created inside it.
pub fn ensure_writable(root: &Path) -> Result<(), PipelineError> {
    let unwritable = |source| PipelineError::StorageUnwritable {
        path: root.to_path_buf(),
        source,
    };
    fs::create_dir_all(root).map_err(unwritable)?;
    tempfile::NamedTempFile::new_in(root).map_err(unwritable)?;
    Ok(())
}

/// Encodes `img` as JPEG into a temporary sibling of `path`, flushes it to
/// stable storage and renames it into place. Either the complete file
/// appears at `path` or nothing does.
pub fn write_jpeg_atomic(path: &Path, img: &RgbImage, quality: u8) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut out = BufWriter::new(tmp.as_file_mut());
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
            .encode_image(img)
            .map_err(io::Error::other)?;
        out.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    sync_dir(dir)
}

/// Flushes directory entry changes (the rename above) to stable storage.
#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// Decodes a stored panorama.
pub fn read_rgb(path: &Path) -> Result<RgbImage, image::ImageError> {
    Ok(image::open(path)?.to_rgb8())
}

/// Removes `path`; returns false when it was already gone.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
