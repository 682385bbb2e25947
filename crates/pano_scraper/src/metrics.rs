use axum::{response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use serde::Serialize;

/// Prometheus collectors for one pipeline process.
///
/// Shared across tasks behind an `Arc`. The counters double as the run's
/// progress record, so a summary can be produced even when a stage aborts.
pub struct Metrics {
    pub registry: Registry,
    pub points_queried_total: IntCounter,
    pub query_failures_total: IntCounter,
    pub query_retries_total: IntCounter,
    /// Distinct panoramas added to the discovery catalog.
    pub panoramas_discovered_total: IntCounter,
    pub metadata_invalid_total: IntCounter,
    pub records_kept_total: IntCounter,
    pub records_dropped_total: IntCounter,
    pub tiles_fetched_total: IntCounter,
    pub tile_retries_total: IntCounter,
    pub panoramas_fetched_total: IntCounter,
    pub panoramas_skipped_total: IntCounter,
    pub panoramas_failed_total: IntCounter,
    pub faces_written_total: IntCounter,
    pub projections_total: IntCounter,
    pub projections_failed_total: IntCounter,
    pub panoramas_deleted_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("pano_scraper".into()), None)
            .expect("Failed to create custom metrics registry");

        macro_rules! reg {
            ($name:expr, $help:expr) => {{
                let collector = IntCounter::new($name, $help).expect("Invalid metric definition");
                registry
                    .register(Box::new(collector.clone()))
                    .expect("Failed to register metric");
                collector
            }};
        }

        Self {
            points_queried_total: reg!("points_queried_total", "Query points sent to the metadata service"),
            query_failures_total: reg!(
                "query_failures_total",
                "Query points that failed after all retries"
            ),
            query_retries_total: reg!("query_retries_total", "Metadata queries retried after a transient error"),
            panoramas_discovered_total: reg!(
                "panoramas_discovered_total",
                "Distinct panoramas added to the discovery catalog"
            ),
            metadata_invalid_total: reg!(
                "metadata_invalid_total",
                "Panorama records rejected by validation"
            ),
            records_kept_total: reg!("records_kept_total", "Records kept by the date filter"),
            records_dropped_total: reg!("records_dropped_total", "Records dropped by the date filter"),
            tiles_fetched_total: reg!("tiles_fetched_total", "Tiles downloaded successfully"),
            tile_retries_total: reg!(
                "tile_retries_total",
                "Assembly rounds retried after transient tile failures"
            ),
            panoramas_fetched_total: reg!(
                "panoramas_fetched_total",
                "Panoramas assembled and written to disk"
            ),
            panoramas_skipped_total: reg!(
                "panoramas_skipped_total",
                "Panoramas skipped because their output already existed"
            ),
            panoramas_failed_total: reg!(
                "panoramas_failed_total",
                "Panoramas that could not be fetched or written"
            ),
            faces_written_total: reg!("faces_written_total", "Cube faces written to disk"),
            projections_total: reg!("projections_total", "Panoramas projected into cube faces"),
            projections_failed_total: reg!(
                "projections_failed_total",
                "Panoramas whose projection failed"
            ),
            panoramas_deleted_total: reg!(
                "panoramas_deleted_total",
                "Source panoramas deleted after projection"
            ),
            registry,
        }
    }

    /// Creates an `axum::Router` that serves the metrics on the `/metrics` endpoint.
    pub fn router(&self) -> Router {
        let registry = self.registry.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let registry = registry.clone();
                async move {
                    let metric_families = registry.gather();
                    let mut buffer = Vec::new();
                    let encoder = TextEncoder::new();
                    encoder
                        .encode(&metric_families, &mut buffer)
                        .expect("Failed to encode metrics");
                    String::from_utf8(buffer)
                        .expect("Metrics buffer is not valid UTF-8")
                        .into_response()
                }
            }),
        )
    }

    /// Snapshot of the run-level counts.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            discovered: self.panoramas_discovered_total.get(),
            failed_queries: self.query_failures_total.get(),
            kept: self.records_kept_total.get(),
            dropped: self.records_dropped_total.get(),
            fetched: self.panoramas_fetched_total.get(),
            skipped: self.panoramas_skipped_total.get(),
            failed_fetch: self.panoramas_failed_total.get(),
            projected: self.projections_total.get(),
            failed_project: self.projections_failed_total.get(),
            deleted: self.panoramas_deleted_total.get(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts reported at the end of every run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub discovered: u64,
    pub failed_queries: u64,
    pub kept: u64,
    pub dropped: u64,
    pub fetched: u64,
    pub skipped: u64,
    pub failed_fetch: u64,
    pub projected: u64,
    pub failed_project: u64,
    pub deleted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_reads_counters() {
        let m = Metrics::new();
        m.panoramas_fetched_total.inc_by(3);
        m.panoramas_skipped_total.inc();
        let s = m.summary();
        assert_eq!(s.fetched, 3);
        assert_eq!(s.skipped, 1);
        assert_eq!(s.failed_fetch, 0);
    }

    #[test]
    fn gathers_under_the_process_prefix() {
        let m = Metrics::new();
        m.tiles_fetched_total.inc();
        let names: Vec<_> = m.registry.gather().iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"pano_scraper_tiles_fetched_total".to_string()));
    }
}
