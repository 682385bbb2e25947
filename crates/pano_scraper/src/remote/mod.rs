//! Remote collaborators: the panorama metadata service and the tile service.
//!
//! Both sit behind traits so the pipeline can run against in-process fakes.

mod geophoto;
mod tiles;

pub use geophoto::{GeoPhotoClient, DEFAULT_SEARCH_URL};
pub use tiles::{CbkTileClient, DEFAULT_TILE_URL};

use crate::error::ServiceError;
use panocore::{PanoramaRecord, Point, TileKey};
use rand::Rng;
use std::{future::Future, time::Duration};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Looks up panoramas near a location.
pub trait MetadataService: Send + Sync + 'static {
    fn find_nearby(
        &self,
        point: Point,
        radius_m: u32,
    ) -> impl Future<Output = Result<Vec<PanoramaRecord>, ServiceError>> + Send;
}

/// Serves encoded tiles of a panorama at a zoom level.
pub trait TileService: Send + Sync + 'static {
    fn fetch_tile(
        &self,
        panorama_id: &str,
        zoom: u8,
        key: TileKey,
    ) -> impl Future<Output = Result<Vec<u8>, ServiceError>> + Send;
}

/// Exponential backoff with a cap and up to 10% jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_ms = (base.as_millis() / 10) as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

pub(crate) fn http_client(timeout: Duration, max_idle: usize) -> Result<reqwest::Client, ServiceError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(max_idle)
        .user_agent(concat!("pano_scraper/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ServiceError::Invalid(format!("cannot build HTTP client: {e}")))
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-process stand-ins for the remote services.

    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    };
    use tokio::sync::Notify;

    #[derive(Default)]
    pub struct FakeMetadata {
        pub by_point: HashMap<(i64, i64), Vec<PanoramaRecord>>,
        /// Per-point errors, consumed front to back before answering.
        pub errors: Mutex<HashMap<(i64, i64), Vec<ServiceError>>>,
        pub calls: AtomicUsize,
    }

    impl FakeMetadata {
        pub fn with(mut self, point: Point, records: Vec<PanoramaRecord>) -> Self {
            self.by_point.insert(point.dedup_key(), records);
            self
        }

        pub fn failing(self, point: Point, errors: Vec<ServiceError>) -> Self {
            self.errors
                .lock()
                .unwrap()
                .insert(point.dedup_key(), errors);
            self
        }
    }

    impl MetadataService for FakeMetadata {
        async fn find_nearby(&self, point: Point, _radius_m: u32) -> Result<Vec<PanoramaRecord>, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(errs) = self.errors.lock().unwrap().get_mut(&point.dedup_key()) {
                if !errs.is_empty() {
                    return Err(errs.remove(0));
                }
            }
            Ok(self.by_point.get(&point.dedup_key()).cloned().unwrap_or_default())
        }
    }

    /// Serves the same solid-color PNG for every tile.
    pub struct FakeTiles {
        pub tile: Vec<u8>,
        /// Transient failures to return before succeeding, counted per call.
        pub transient_failures: AtomicU32,
        /// Responses that are not images, returned before the real tile.
        pub corrupt_responses: AtomicU32,
        /// Requests for this panorama signal the notifier and never finish.
        pub blocked: Option<(String, Arc<Notify>)>,
        pub not_found: bool,
        pub permanent: bool,
        pub calls: AtomicUsize,
    }

    impl FakeTiles {
        pub fn solid(color: [u8; 3]) -> Self {
            let img = RgbImage::from_pixel(panocore::tiles::TILE_SIZE, panocore::tiles::TILE_SIZE, Rgb(color));
            let mut buf = Cursor::new(Vec::new());
            img.write_to(&mut buf, ImageFormat::Png).unwrap();
            Self {
                tile: buf.into_inner(),
                transient_failures: AtomicU32::new(0),
                corrupt_responses: AtomicU32::new(0),
                blocked: None,
                not_found: false,
                permanent: false,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TileService for FakeTiles {
        async fn fetch_tile(&self, panorama_id: &str, _zoom: u8, _key: TileKey) -> Result<Vec<u8>, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((id, entered)) = &self.blocked {
                if id == panorama_id {
                    entered.notify_one();
                    std::future::pending::<()>().await;
                }
            }
            if self.permanent {
                return Err(ServiceError::Permanent("HTTP 403 Forbidden".into()));
            }
            if self.not_found {
                return Err(ServiceError::NotFound);
            }
            if self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ServiceError::Unavailable("HTTP 503 Service Unavailable".into()));
            }
            if self
                .corrupt_responses
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Ok(b"<html>rate limited</html>".to_vec());
            }
            Ok(self.tile.clone())
        }
    }
}
