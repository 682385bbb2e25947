//! Equirectangular → perspective face projection.
//!
//! Camera frame: +z looks forward, +x to the right, +y up. Longitude 0 is the
//! horizontal center of the equirectangular image and grows to the right;
//! latitude +90° is the top row.
//!
//! Face yaw convention (rotation about +y, clockwise seen from above):
//!   front =   0°  (image center)
//!   right =  90°  (three quarters across)
//!   back  = 180°  (left/right seam)
//!   left  = 270°  (one quarter across)
//!
//! Sampling is bilinear with longitude wrapping and latitude clamping, and a
//! single round-half-up rule, so identical inputs give identical bytes.

use crate::tiles::EquirectangularImage;
use image::RgbImage;
use rayon::prelude::*;
use std::f64::consts::{PI, TAU};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProjectError {
    #[error("face size must be positive")]
    ZeroFaceSize,
    #[error("field of view {0}° must be in (0, 180)")]
    BadFov(f64),
    #[error("panorama {0}: source image is empty")]
    EmptySource(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Face {
    Front,
    Right,
    Back,
    Left,
}

impl Face {
    pub const ALL: [Face; 4] = [Face::Front, Face::Right, Face::Back, Face::Left];

    #[inline]
    pub fn yaw_deg(self) -> f64 {
        match self {
            Face::Front => 0.0,
            Face::Right => 90.0,
            Face::Back => 180.0,
            Face::Left => 270.0,
        }
    }

    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            Face::Front => "front",
            Face::Right => "right",
            Face::Back => "back",
            Face::Left => "left",
        }
    }
}

impl fmt::Display for Face {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Face {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "front" => Ok(Face::Front),
            "right" => Ok(Face::Right),
            "back" => Ok(Face::Back),
            "left" => Ok(Face::Left),
            other => Err(format!("unknown face {other:?} (expected front, right, back or left)")),
        }
    }
}

/// Output geometry, independent of the source resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionConfig {
    /// Width and height of each square face, in pixels.
    pub face_size: u32,
    /// Horizontal (and vertical) field of view of each face, in degrees.
    pub fov_deg: f64,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            face_size: 1024,
            fov_deg: 90.0,
        }
    }
}

impl ProjectionConfig {
    pub fn validate(&self) -> Result<(), ProjectError> {
        if self.face_size == 0 {
            return Err(ProjectError::ZeroFaceSize);
        }
        if !(self.fov_deg > 0.0 && self.fov_deg < 180.0) {
            return Err(ProjectError::BadFov(self.fov_deg));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CubeFace {
    pub panorama_id: String,
    pub face: Face,
    pub pixels: RgbImage,
}

#[derive(Debug, Clone)]
pub struct CubeFaceSet {
    pub panorama_id: String,
    pub faces: Vec<CubeFace>,
}

impl CubeFaceSet {
    pub fn get(&self, face: Face) -> Option<&CubeFace> {
        self.faces.iter().find(|f| f.face == face)
    }
}

/// Projects `src` into the requested faces.
pub fn project(
    src: &EquirectangularImage,
    faces: &[Face],
    cfg: &ProjectionConfig,
) -> Result<CubeFaceSet, ProjectError> {
    cfg.validate()?;
    if src.width() == 0 || src.height() == 0 {
        return Err(ProjectError::EmptySource(src.panorama_id.clone()));
    }

    let faces = faces
        .iter()
        .map(|&face| CubeFace {
            panorama_id: src.panorama_id.clone(),
            face,
            pixels: render_face(&src.pixels, face, cfg),
        })
        .collect();

    Ok(CubeFaceSet {
        panorama_id: src.panorama_id.clone(),
        faces,
    })
}

/// Renders one perspective face. Rows are sampled in parallel; each output
/// pixel depends only on its own ray, so the result is thread-count independent.
pub fn render_face(src: &RgbImage, face: Face, cfg: &ProjectionConfig) -> RgbImage {
    let n = cfg.face_size as usize;
    let half_extent = (cfg.fov_deg.to_radians() / 2.0).tan();
    let (sin_yaw, cos_yaw) = face.yaw_deg().to_radians().sin_cos();
    let (w, h) = (src.width() as f64, src.height() as f64);

    let mut buf = vec![0u8; n * n * 3];
    buf.par_chunks_mut(n * 3).enumerate().for_each(|(i, row)| {
        let y = (1.0 - 2.0 * (i as f64 + 0.5) / n as f64) * half_extent;
        for j in 0..n {
            let x = (2.0 * (j as f64 + 0.5) / n as f64 - 1.0) * half_extent;

            // Rotate the ray (x, y, 1) about the vertical axis by the face yaw.
            let xr = x * cos_yaw + sin_yaw;
            let zr = cos_yaw - x * sin_yaw;

            let lon = xr.atan2(zr);
            let lat = y.atan2(xr.hypot(zr));

            let u = (lon / TAU + 0.5) * w - 0.5;
            let v = (0.5 - lat / PI) * h - 0.5;

            row[j * 3..j * 3 + 3].copy_from_slice(&sample_bilinear(src, u, v));
        }
    });

    // Buffer length is n*n*3 by construction.
    RgbImage::from_raw(cfg.face_size, cfg.face_size, buf).unwrap_or_default()
}

/// Bilinear sample at continuous pixel coordinates (pixel centers at integers).
/// Columns wrap around the 360° seam; rows clamp at the poles.
fn sample_bilinear(src: &RgbImage, u: f64, v: f64) -> [u8; 3] {
    let w = src.width() as i64;
    let h = src.height() as i64;

    let x0 = u.floor();
    let y0 = v.floor();
    let fx = u - x0;
    let fy = v - y0;

    let xa = (x0 as i64).rem_euclid(w) as u32;
    let xb = (x0 as i64 + 1).rem_euclid(w) as u32;
    let ya = (y0 as i64).clamp(0, h - 1) as u32;
    let yb = (y0 as i64 + 1).clamp(0, h - 1) as u32;

    let p00 = src.get_pixel(xa, ya).0;
    let p10 = src.get_pixel(xb, ya).0;
    let p01 = src.get_pixel(xa, yb).0;
    let p11 = src.get_pixel(xb, yb).0;

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f64 * (1.0 - fx) + p10[c] as f64 * fx;
        let bottom = p01[c] as f64 * (1.0 - fx) + p11[c] as f64 * fx;
        let value = top * (1.0 - fy) + bottom * fy;
        out[c] = (value + 0.5).floor().clamp(0.0, 255.0) as u8;
    }
    out
}
