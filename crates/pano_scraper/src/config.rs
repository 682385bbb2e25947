use crate::{
    discovery::DiscoveryOptions,
    fetch::FetchOptions,
    orchestrator::{PipelineConfig, StagePlan},
    points::{parse_center, PointSource},
    project::ProjectionSettings,
    remote::{Backoff, DEFAULT_SEARCH_URL, DEFAULT_TILE_URL},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use panocore::{
    Face, FilterOptions, ImageryLayout, InvalidMonth, MissingDatePolicy, Point, ProjectionConfig,
};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

const CLEAN_CATALOG: &str = "panoids_with_dates.json";

/// `pano_scraper` - Street-level panorama scraper.
///
/// Discovers panoramas around a set of scrape points, keeps the ones with a
/// known capture date, downloads and stitches their tiles into
/// equirectangular images and projects them into cube faces. Each stage can
/// run on its own and resumes from what is already on disk.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Directory holding discovery catalogs and failure reports.
    ///
    /// Relative catalog paths given to other options resolve against it.
    #[arg(long, global = true, env = "PANO_WORK_DIR", default_value = ".")]
    pub work_dir: PathBuf,

    /// The listen address for the Prometheus metrics server.
    ///
    /// When set, run counters are served on `/metrics` for the lifetime of
    /// the process.
    #[arg(long, global = true, env = "PANO_METRICS_LISTEN_ADDR")]
    pub metrics_listen_addr: Option<SocketAddr>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Query the metadata service around every scrape point.
    Discover(DiscoverCmd),
    /// Keep the records of a discovery catalog that carry a capture date.
    Filter(FilterCmd),
    /// Download and stitch the panoramas of a catalog.
    Fetch(FetchCmd),
    /// Project stored panoramas into cube faces.
    Project(ProjectCmd),
    /// Run several stages in sequence.
    Run(RunCmd),
    /// Delete stored panoramas that are not dated records of a catalog.
    Prune(PruneCmd),
}

#[derive(Args, Debug)]
pub struct DiscoverCmd {
    #[command(flatten)]
    pub points: PointArgs,
    #[command(flatten)]
    pub discovery: DiscoveryArgs,
}

#[derive(Args, Debug)]
pub struct FilterCmd {
    /// Discovery catalog to filter; the newest `panoids_*.json` in the work
    /// directory when omitted.
    #[arg(long = "in")]
    pub input: Option<PathBuf>,
    /// Where the filtered catalog is written.
    #[arg(long = "out", default_value = CLEAN_CATALOG)]
    pub output: PathBuf,
    #[command(flatten)]
    pub filter: FilterArgs,
}

#[derive(Args, Debug)]
pub struct FetchCmd {
    /// Catalog of panoramas to fetch.
    #[arg(long, default_value = CLEAN_CATALOG)]
    pub catalog: PathBuf,
    #[command(flatten)]
    pub fetch: FetchArgs,
    #[command(flatten)]
    pub storage: StorageArgs,
    #[command(flatten)]
    pub projection: ProjectionArgs,
    /// Project each panorama into cube faces as soon as it is stored.
    #[arg(long)]
    pub project: bool,
    /// Delete each panorama once its faces are written.
    #[arg(long, requires = "project")]
    pub delete_pano: bool,
    /// Skip records without a capture year.
    #[arg(long)]
    pub require_year: bool,
}

#[derive(Args, Debug)]
pub struct ProjectCmd {
    /// Catalog used to group faces by capture date.
    #[arg(long, default_value = CLEAN_CATALOG)]
    pub catalog: PathBuf,
    #[command(flatten)]
    pub storage: StorageArgs,
    #[command(flatten)]
    pub projection: ProjectionArgs,
    /// Delete each panorama once its faces are written.
    #[arg(long)]
    pub delete: bool,
}

#[derive(Args, Debug)]
pub struct RunCmd {
    #[command(flatten)]
    pub points: PointArgs,
    #[command(flatten)]
    pub discovery: DiscoveryArgs,
    #[command(flatten)]
    pub filter: FilterArgs,
    #[command(flatten)]
    pub fetch: FetchArgs,
    #[command(flatten)]
    pub storage: StorageArgs,
    #[command(flatten)]
    pub projection: ProjectionArgs,

    /// Discovery catalog read when discovery is skipped.
    #[arg(long)]
    pub raw_catalog: Option<PathBuf>,
    /// Filtered catalog, written by the filter and read by later stages.
    #[arg(long, default_value = CLEAN_CATALOG)]
    pub catalog: PathBuf,

    #[arg(long)]
    pub skip_discover: bool,
    #[arg(long)]
    pub skip_filter: bool,
    #[arg(long)]
    pub skip_fetch: bool,
    /// Project panoramas into cube faces.
    #[arg(long)]
    pub project: bool,
    /// Delete each panorama once its faces are written.
    #[arg(long, requires = "project")]
    pub cleanup: bool,
}

#[derive(Args, Debug)]
pub struct PruneCmd {
    /// Catalog whose dated records are kept.
    #[arg(long, default_value = CLEAN_CATALOG)]
    pub catalog: PathBuf,
    #[arg(long, default_value = "panoramas")]
    pub pano_dir: PathBuf,
    /// List what would be deleted without deleting.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct PointArgs {
    /// CSV file of scrape points with `latitude` and `longitude` columns.
    #[arg(long, conflicts_with = "center")]
    pub points: Option<PathBuf>,
    /// Center of a generated point grid, as `LAT,LON`.
    #[arg(long, value_parser = parse_center, allow_hyphen_values = true)]
    pub center: Option<Point>,
    /// Radius of the generated grid.
    #[arg(long, default_value_t = 1.0)]
    pub radius_km: f64,
    /// Grid divisions per side.
    #[arg(long, default_value_t = 10)]
    pub resolution: u32,
}

impl PointArgs {
    pub fn source(&self) -> Option<PointSource> {
        if let Some(path) = &self.points {
            return Some(PointSource::Csv(path.clone()));
        }
        self.center.map(|center| PointSource::Grid {
            center,
            radius_km: self.radius_km,
            resolution: self.resolution,
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct DiscoveryArgs {
    /// Search radius around each point, in meters.
    #[arg(long, default_value_t = 10)]
    pub search_radius_m: u32,
    /// Metadata queries in flight at once.
    #[arg(long, default_value_t = 50)]
    pub concurrency: usize,
    /// Attempts per point before it is recorded as failed.
    #[arg(long, default_value_t = 4)]
    pub max_retries: u32,
    /// Keep only the panorama closest to each point.
    #[arg(long)]
    pub nearest_only: bool,
    #[arg(long, default_value_t = 500)]
    pub progress_every: usize,
    #[arg(long, env = "PANO_METADATA_URL", default_value = DEFAULT_SEARCH_URL)]
    pub metadata_url: String,
}

impl DiscoveryArgs {
    pub fn options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            search_radius_m: self.search_radius_m,
            concurrency: self.concurrency,
            max_retries: self.max_retries,
            backoff: Backoff::default(),
            nearest_only: self.nearest_only,
            progress_every: self.progress_every,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidMonthArg {
    /// Keep the record without its month.
    Clear,
    /// Drop the record.
    Drop,
}

impl From<InvalidMonthArg> for InvalidMonth {
    fn from(arg: InvalidMonthArg) -> Self {
        match arg {
            InvalidMonthArg::Clear => InvalidMonth::Clear,
            InvalidMonthArg::Drop => InvalidMonth::Drop,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingDateArg {
    /// Do not project undated panoramas.
    Skip,
    /// Project them under `unknown/`.
    Unknown,
}

impl From<MissingDateArg> for MissingDatePolicy {
    fn from(arg: MissingDateArg) -> Self {
        match arg {
            MissingDateArg::Skip => MissingDatePolicy::Skip,
            MissingDateArg::Unknown => MissingDatePolicy::Unknown,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct FilterArgs {
    /// Drop records without a capture year.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub require_year: bool,
    /// What to do with a month outside 1-12.
    #[arg(long, value_enum, default_value_t = InvalidMonthArg::Clear)]
    pub invalid_month: InvalidMonthArg,
    /// Keep only records captured in this year.
    #[arg(long)]
    pub only_year: Option<i32>,
}

impl FilterArgs {
    pub fn options(&self) -> FilterOptions {
        FilterOptions {
            require_year: self.require_year,
            invalid_month: self.invalid_month.into(),
            only_year: self.only_year,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct FetchArgs {
    /// Panoramas assembled concurrently.
    #[arg(long, default_value_t = 8)]
    pub workers: usize,
    /// Tile requests in flight across all workers.
    #[arg(long, default_value_t = 64)]
    pub tile_concurrency: usize,
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u8).range(0..=5))]
    pub zoom: u8,
    /// Assembly attempts per panorama.
    #[arg(long, default_value_t = 5)]
    pub max_attempts: u32,
    /// First retry delay; doubles per retry up to 10 s.
    #[arg(long, default_value_t = 1000)]
    pub backoff_ms: u64,
    /// Download panoramas even when they are already stored.
    #[arg(long)]
    pub no_skip_existing: bool,
    /// Stop after this many catalog records.
    #[arg(long)]
    pub max: Option<usize>,
    /// Log fetch progress every this many panoramas.
    #[arg(long, default_value_t = 100)]
    pub fetch_progress_every: usize,
    #[arg(long, env = "PANO_TILE_URL", default_value = DEFAULT_TILE_URL)]
    pub tile_url: String,
}

impl FetchArgs {
    pub fn options(&self, jpeg_quality: u8) -> FetchOptions {
        let cap = Duration::from_secs(10);
        FetchOptions {
            zoom: self.zoom,
            workers: self.workers,
            tile_concurrency: self.tile_concurrency,
            max_attempts: self.max_attempts,
            backoff: Backoff {
                initial: Duration::from_millis(self.backoff_ms).min(cap),
                max: cap,
            },
            skip_existing: !self.no_skip_existing,
            require_year: false,
            jpeg_quality,
            progress_every: self.fetch_progress_every,
            limit: self.max,
        }
    }
}

/// Where panoramas and faces live on disk.
#[derive(Args, Debug, Clone)]
pub struct StorageArgs {
    #[arg(long, default_value = "panoramas")]
    pub pano_dir: PathBuf,
    #[arg(long, default_value = "cube_pano")]
    pub cube_dir: PathBuf,
    /// Store panoramas under a capture-year directory.
    #[arg(long)]
    pub pano_by_year: bool,
    /// Group faces by month below the year directory.
    #[arg(long)]
    pub group_by_month: bool,
    #[arg(long, value_enum, default_value_t = MissingDateArg::Skip)]
    pub missing_date: MissingDateArg,
    /// JPEG quality of stored panoramas and faces.
    #[arg(long, default_value_t = 92, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub jpeg_quality: u8,
}

impl StorageArgs {
    pub fn layout(&self) -> ImageryLayout {
        ImageryLayout {
            pano_by_year: self.pano_by_year,
            group_by_month: self.group_by_month,
            missing_date: self.missing_date.into(),
            ..ImageryLayout::new(&self.pano_dir, &self.cube_dir)
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ProjectionArgs {
    /// Width and height of each face, in pixels.
    #[arg(long, default_value_t = 1024)]
    pub face_size: u32,
    /// Field of view of each face, in degrees.
    #[arg(long, default_value_t = 90.0)]
    pub fov: f64,
    /// Faces to write, comma separated; all four when omitted.
    #[arg(long, value_delimiter = ',')]
    pub sides: Vec<Face>,
    /// Threads for stitching and projection; one per core when 0.
    #[arg(long, default_value_t = 0)]
    pub compute_threads: usize,
    /// Re-project panoramas whose faces already exist.
    #[arg(long)]
    pub force: bool,
}

impl ProjectionArgs {
    pub fn settings(&self, jpeg_quality: u8) -> ProjectionSettings {
        ProjectionSettings {
            config: ProjectionConfig {
                face_size: self.face_size,
                fov_deg: self.fov,
            },
            faces: if self.sides.is_empty() {
                Face::ALL.to_vec()
            } else {
                self.sides.clone()
            },
            force: self.force,
            jpeg_quality,
        }
    }
}

/// Service endpoints and their connection pool sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub metadata_url: String,
    pub metadata_concurrency: usize,
    pub tile_url: String,
    pub tile_concurrency: usize,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            metadata_url: DEFAULT_SEARCH_URL.to_string(),
            metadata_concurrency: 1,
            tile_url: DEFAULT_TILE_URL.to_string(),
            tile_concurrency: 1,
        }
    }
}

impl Command {
    /// Pipeline configuration of a stage command; `None` for `prune`.
    pub fn pipeline(&self, work_dir: &Path) -> Option<PipelineConfig> {
        let cfg = match self {
            Command::Discover(cmd) => {
                let mut cfg = PipelineConfig::new(
                    work_dir,
                    StagePlan {
                        discover: true,
                        ..StagePlan::default()
                    },
                );
                cfg.points = cmd.points.source();
                cfg.discovery = cmd.discovery.options();
                cfg
            }
            Command::Filter(cmd) => {
                let mut cfg = PipelineConfig::new(
                    work_dir,
                    StagePlan {
                        filter: true,
                        ..StagePlan::default()
                    },
                );
                cfg.raw_catalog = cmd.input.as_deref().map(|p| resolve(work_dir, p));
                cfg.catalog = resolve(work_dir, &cmd.output);
                cfg.filter = cmd.filter.options();
                cfg
            }
            Command::Fetch(cmd) => {
                let mut cfg = PipelineConfig::new(
                    work_dir,
                    StagePlan {
                        fetch: true,
                        project: cmd.project,
                        cleanup: cmd.delete_pano,
                        ..StagePlan::default()
                    },
                );
                cfg.catalog = resolve(work_dir, &cmd.catalog);
                cfg.fetch = cmd.fetch.options(cmd.storage.jpeg_quality);
                cfg.fetch.require_year = cmd.require_year;
                cfg.layout = cmd.storage.layout();
                cfg.projection = cmd.projection.settings(cmd.storage.jpeg_quality);
                cfg.compute_threads = cmd.projection.compute_threads;
                cfg
            }
            Command::Project(cmd) => {
                let mut cfg = PipelineConfig::new(
                    work_dir,
                    StagePlan {
                        project: true,
                        cleanup: cmd.delete,
                        ..StagePlan::default()
                    },
                );
                cfg.catalog = resolve(work_dir, &cmd.catalog);
                cfg.layout = cmd.storage.layout();
                cfg.projection = cmd.projection.settings(cmd.storage.jpeg_quality);
                cfg.compute_threads = cmd.projection.compute_threads;
                cfg
            }
            Command::Run(cmd) => {
                let mut cfg = PipelineConfig::new(
                    work_dir,
                    StagePlan {
                        discover: !cmd.skip_discover,
                        filter: !cmd.skip_filter,
                        fetch: !cmd.skip_fetch,
                        project: cmd.project,
                        cleanup: cmd.cleanup,
                    },
                );
                cfg.points = cmd.points.source();
                cfg.discovery = cmd.discovery.options();
                cfg.raw_catalog = cmd.raw_catalog.as_deref().map(|p| resolve(work_dir, p));
                cfg.filter = cmd.filter.options();
                cfg.catalog = resolve(work_dir, &cmd.catalog);
                cfg.fetch = cmd.fetch.options(cmd.storage.jpeg_quality);
                cfg.fetch.require_year = cmd.filter.require_year;
                cfg.layout = cmd.storage.layout();
                cfg.projection = cmd.projection.settings(cmd.storage.jpeg_quality);
                cfg.compute_threads = cmd.projection.compute_threads;
                cfg
            }
            Command::Prune(_) => return None,
        };
        Some(cfg)
    }

    pub fn endpoints(&self) -> Endpoints {
        let mut endpoints = Endpoints::default();
        let (discovery, fetch) = match self {
            Command::Discover(cmd) => (Some(&cmd.discovery), None),
            Command::Fetch(cmd) => (None, Some(&cmd.fetch)),
            Command::Run(cmd) => (Some(&cmd.discovery), Some(&cmd.fetch)),
            Command::Filter(_) | Command::Project(_) | Command::Prune(_) => (None, None),
        };
        if let Some(d) = discovery {
            endpoints.metadata_url = d.metadata_url.clone();
            endpoints.metadata_concurrency = d.concurrency;
        }
        if let Some(f) = fetch {
            endpoints.tile_url = f.tile_url.clone();
            endpoints.tile_concurrency = f.tile_concurrency;
        }
        endpoints
    }
}

/// Relative catalog paths live in the work directory.
pub fn resolve(work_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        work_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("pano_scraper").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_defaults_cover_discover_filter_fetch() {
        let cli = parse(&["--work-dir", "/data", "run", "--points", "pts.csv"]);
        let cfg = cli.command.pipeline(&cli.work_dir).unwrap();
        assert_eq!(
            cfg.plan,
            StagePlan {
                discover: true,
                filter: true,
                fetch: true,
                project: false,
                cleanup: false,
            }
        );
        assert_eq!(cfg.points, Some(PointSource::Csv("pts.csv".into())));
        assert_eq!(cfg.catalog, PathBuf::from("/data/panoids_with_dates.json"));
        assert_eq!(cfg.discovery.search_radius_m, 10);
        assert_eq!(cfg.fetch.zoom, 5);
        assert_eq!(cfg.fetch.workers, 8);
        assert_eq!(cfg.fetch.tile_concurrency, 64);
        assert!(cfg.fetch.skip_existing);
        assert_eq!(cfg.projection.faces, Face::ALL.to_vec());
        assert_eq!(cfg.layout.pano_root, PathBuf::from("panoramas"));
        assert!(cfg.filter.require_year);
        assert!(cfg.fetch.require_year);
    }

    #[test]
    fn fetch_requires_a_year_only_when_asked() {
        let cli = parse(&["fetch"]);
        assert!(!cli.command.pipeline(&cli.work_dir).unwrap().fetch.require_year);

        let cli = parse(&["fetch", "--require-year", "--max", "3"]);
        let cfg = cli.command.pipeline(&cli.work_dir).unwrap();
        assert!(cfg.fetch.require_year);
        assert_eq!(cfg.fetch.limit, Some(3));
    }

    #[test]
    fn grid_center_accepts_negative_coordinates() {
        let cli = parse(&["discover", "--center", "-33.9,18.4", "--radius-km", "2"]);
        let cfg = cli.command.pipeline(&cli.work_dir).unwrap();
        assert_eq!(
            cfg.points,
            Some(PointSource::Grid {
                center: Point::new(-33.9, 18.4),
                radius_km: 2.0,
                resolution: 10,
            })
        );
    }

    #[test]
    fn points_and_center_conflict() {
        let err = Cli::try_parse_from(["pano_scraper", "discover", "--points", "a.csv", "--center", "1,2"]);
        assert!(err.is_err());
    }

    #[test]
    fn deletion_requires_projection() {
        assert!(Cli::try_parse_from(["pano_scraper", "fetch", "--delete-pano"]).is_err());
        assert!(Cli::try_parse_from(["pano_scraper", "run", "--cleanup"]).is_err());

        let cli = parse(&["fetch", "--project", "--delete-pano"]);
        let cfg = cli.command.pipeline(&cli.work_dir).unwrap();
        assert!(cfg.plan.project && cfg.plan.cleanup);
    }

    #[test]
    fn projection_and_storage_options() {
        let cli = parse(&[
            "project",
            "--sides",
            "front,back",
            "--face-size",
            "512",
            "--missing-date",
            "unknown",
            "--group-by-month",
            "--jpeg-quality",
            "80",
            "--delete",
        ]);
        let cfg = cli.command.pipeline(&cli.work_dir).unwrap();
        assert_eq!(cfg.projection.faces, vec![Face::Front, Face::Back]);
        assert_eq!(cfg.projection.config.face_size, 512);
        assert_eq!(cfg.projection.jpeg_quality, 80);
        assert_eq!(cfg.layout.missing_date, MissingDatePolicy::Unknown);
        assert!(cfg.layout.group_by_month);
        assert!(cfg.plan.cleanup);

        assert!(Cli::try_parse_from(["pano_scraper", "project", "--sides", "up"]).is_err());
        assert!(Cli::try_parse_from(["pano_scraper", "fetch", "--zoom", "6"]).is_err());
    }

    #[test]
    fn filter_options() {
        let cli = parse(&[
            "filter",
            "--in",
            "raw.json",
            "--require-year",
            "false",
            "--invalid-month",
            "drop",
            "--only-year",
            "2019",
        ]);
        let cfg = cli.command.pipeline(&cli.work_dir).unwrap();
        assert_eq!(cfg.raw_catalog, Some(PathBuf::from("./raw.json")));
        assert_eq!(
            cfg.filter,
            FilterOptions {
                require_year: false,
                invalid_month: InvalidMonth::Drop,
                only_year: Some(2019),
            }
        );
    }

    #[test]
    fn backoff_is_capped() {
        let cli = parse(&["fetch", "--backoff-ms", "60000"]);
        let cfg = cli.command.pipeline(&cli.work_dir).unwrap();
        assert_eq!(cfg.fetch.backoff.initial, Duration::from_secs(10));
    }

    #[test]
    fn endpoints_follow_the_command() {
        let cli = parse(&["run", "--tile-url", "http://localhost:9000/cbk", "--concurrency", "5"]);
        let endpoints = cli.command.endpoints();
        assert_eq!(endpoints.tile_url, "http://localhost:9000/cbk");
        assert_eq!(endpoints.metadata_concurrency, 5);

        let cli = parse(&["prune", "--dry-run"]);
        assert!(cli.command.pipeline(&cli.work_dir).is_none());
        assert_eq!(cli.command.endpoints(), Endpoints::default());
    }
}
