use crate::error::PipelineError;
use panocore::Point;
use std::{collections::HashSet, fs::File, io, path::PathBuf};

/// Where the scrape points of a discovery run come from.
#[derive(Debug, Clone, PartialEq)]
pub enum PointSource {
    /// A CSV file with `latitude` and `longitude` columns.
    Csv(PathBuf),
    /// A lattice around a center, trimmed to a radius.
    Grid {
        center: Point,
        radius_km: f64,
        resolution: u32,
    },
}

/// Points read from a source, after validation and deduplication.
#[derive(Debug, Clone, Default)]
pub struct PointSet {
    pub points: Vec<Point>,
    pub skipped_rows: usize,
    pub duplicates: usize,
}

impl PointSource {
    pub fn load(&self) -> Result<PointSet, PipelineError> {
        match self {
            PointSource::Csv(path) => {
                let file = File::open(path).map_err(|e| {
                    PipelineError::InputInvalid(format!("cannot open points file {}: {e}", path.display()))
                })?;
                read_points(file)
            }
            PointSource::Grid {
                center,
                radius_km,
                resolution,
            } => {
                if !(radius_km.is_finite() && *radius_km > 0.0) {
                    return Err(PipelineError::InputInvalid(format!(
                        "grid radius must be positive, got {radius_km}"
                    )));
                }
                if !in_range(*center) {
                    return Err(PipelineError::InputInvalid(format!(
                        "grid center ({}, {}) is out of range",
                        center.latitude, center.longitude
                    )));
                }
                let mut dedup = Dedup::default();
                for p in Point::grid_around(*center, *radius_km, *resolution) {
                    dedup.push(p);
                }
                Ok(dedup.set)
            }
        }
    }

    /// Short description for the discovery audit record.
    pub fn describe(&self) -> String {
        match self {
            PointSource::Csv(path) => path.display().to_string(),
            PointSource::Grid {
                center,
                radius_km,
                resolution,
            } => format!(
                "grid({},{} r={radius_km}km n={resolution})",
                center.latitude, center.longitude
            ),
        }
    }
}

/// Parses `"lat,lon"`.
pub fn parse_center(s: &str) -> Result<Point, PipelineError> {
    let bad = || PipelineError::InputInvalid(format!("expected \"lat,lon\", got {s:?}"));
    let (lat, lon) = s.split_once(',').ok_or_else(bad)?;
    let lat: f64 = lat.trim().parse().map_err(|_| bad())?;
    let lon: f64 = lon.trim().parse().map_err(|_| bad())?;
    Ok(Point::new(lat, lon))
}

/// Reads points from CSV. Headers are matched case-insensitively; rows that
/// do not parse or are out of range are skipped, and points equal at six
/// decimal places are collapsed onto the first.
pub fn read_points<R: io::Read>(reader: R) -> Result<PointSet, PipelineError> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr
        .headers()
        .map_err(|e| PipelineError::InputInvalid(format!("points file has no readable header: {e}")))?
        .clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim_start_matches('\u{feff}').eq_ignore_ascii_case(name))
    };
    let (lat_col, lon_col) = match (column("latitude"), column("longitude")) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(PipelineError::InputInvalid(
                "points file must have latitude and longitude columns".into(),
            ))
        }
    };

    let mut dedup = Dedup::default();
    for row in rdr.records() {
        let parsed = row.ok().and_then(|row| {
            let lat = row.get(lat_col)?.parse::<f64>().ok()?;
            let lon = row.get(lon_col)?.parse::<f64>().ok()?;
            Some(Point::new(lat, lon))
        });
        match parsed {
            Some(p) if in_range(p) => dedup.push(p),
            _ => dedup.set.skipped_rows += 1,
        }
    }
    Ok(dedup.set)
}

fn in_range(p: Point) -> bool {
    p.latitude.is_finite()
        && p.longitude.is_finite()
        && (-90.0..=90.0).contains(&p.latitude)
        && (-180.0..=180.0).contains(&p.longitude)
}

#[derive(Default)]
struct Dedup {
    set: PointSet,
    seen: HashSet<(i64, i64)>,
}

impl Dedup {
    fn push(&mut self, p: Point) {
        if self.seen.insert(p.dedup_key()) {
            self.set.points.push(p);
        } else {
            self.set.duplicates += 1;
        }
    }
}
