use super::{http_client, MetadataService, DEFAULT_TIMEOUT};
use crate::error::ServiceError;
use panocore::{PanoramaRecord, Point};
use regex::Regex;
use std::sync::OnceLock;

pub const DEFAULT_SEARCH_URL: &str =
    "https://maps.googleapis.com/maps/api/js/GeoPhotoService.SingleImageSearch";

/// Client for the `SingleImageSearch` metadata endpoint.
#[derive(Debug, Clone)]
pub struct GeoPhotoClient {
    http: reqwest::Client,
    base_url: String,
}

impl GeoPhotoClient {
    pub fn new(base_url: impl Into<String>, concurrency: usize) -> Result<Self, ServiceError> {
        Ok(Self {
            http: http_client(DEFAULT_TIMEOUT, concurrency)?,
            base_url: base_url.into(),
        })
    }

    fn search_url(&self, point: Point, radius_m: u32) -> String {
        format!(
            "{}?pb=!1m5!1sapiv3!5sUS!11m2!1m1!1b0!2m4!1m2!3d{}!4d{}!2d{radius_m}\
             !3m10!2m2!1sen!2sGB!9m1!1e2!11m4!1m3!1e2!2b1!3e2!\
             4m10!1e1!1e2!1e3!1e4!1e8!1e6!5m1!1e2!6m1!1e2&callback=_xdc_._v2mub5",
            self.base_url, point.latitude, point.longitude
        )
    }
}

impl MetadataService for GeoPhotoClient {
    async fn find_nearby(&self, point: Point, radius_m: u32) -> Result<Vec<PanoramaRecord>, ServiceError> {
        let resp = self.http.get(self.search_url(point, radius_m)).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(ServiceError::from_status(status));
        }
        let body = resp.text().await?;
        parse_search_response(&body)
    }
}

fn panorama_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\[[0-9]+,"(.+?)"\].+?\[\[null,null,(-?[0-9]+\.[0-9]+),(-?[0-9]+\.[0-9]+)"#)
            .expect("static regex")
    })
}

fn date_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([0-9]?[0-9]?[0-9])?,?\[(20[0-9][0-9]),([0-9]+)\]").expect("static regex"))
}

/// Extracts panorama records from a `SingleImageSearch` response body.
///
/// The first panorama is the one nearest the query and takes the last date
/// in the body; the remaining dates are assigned in order to the other
/// panoramas counting back from the end of the list. Dates with a month
/// outside 1..=12 are ignored.
pub fn parse_search_response(body: &str) -> Result<Vec<PanoramaRecord>, ServiceError> {
    let mut records: Vec<PanoramaRecord> = Vec::new();
    for caps in panorama_pattern().captures_iter(body) {
        let id = &caps[1];
        let lat: f64 = caps[2]
            .parse()
            .map_err(|_| ServiceError::Invalid(format!("bad latitude {:?} for {id}", &caps[2])))?;
        let lon: f64 = caps[3]
            .parse()
            .map_err(|_| ServiceError::Invalid(format!("bad longitude {:?} for {id}", &caps[3])))?;
        let duplicate = records
            .iter()
            .any(|r| r.id == id && r.latitude == lat && r.longitude == lon);
        if !duplicate {
            records.push(PanoramaRecord::new(id, lat, lon));
        }
    }
    if records.is_empty() {
        return Ok(records);
    }

    let mut dates: Vec<(i32, u32)> = date_pattern()
        .captures_iter(body)
        .filter_map(|caps| {
            let year = caps[2].parse().ok()?;
            let month = caps[3].parse().ok()?;
            (1..=12).contains(&month).then_some((year, month))
        })
        .collect();

    if let Some((year, month)) = dates.pop() {
        records[0].capture_year = Some(year);
        records[0].capture_month = Some(month);
    }
    let n = records.len();
    for (i, (year, month)) in dates.into_iter().rev().enumerate() {
        // Index 0 already holds the nearest panorama's date.
        if i + 1 >= n {
            break;
        }
        let r = &mut records[n - 1 - i];
        r.capture_year = Some(year);
        r.capture_month = Some(month);
    }
    Ok(records)
}
