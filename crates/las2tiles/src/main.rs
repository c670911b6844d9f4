mod discover;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tiler::options::{DEFAULT_GRID_SIZE_M, DEFAULT_MAX_DEPTH, DEFAULT_MIN_POINTS_PER_TILE};
use tiler::{
    CancellationToken, ConstantGeoid, Egm2008Geoid, GeoidModel, LasFile, LogSink, RunReport,
    SourceProvider, Tiler, TilerOptions, Wgs84Reprojector,
};

#[derive(Parser, Debug)]
#[command(name = "las2tiles", version, about = "Convert LAS/LAZ point clouds into Cesium 3D Tiles")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a single LAS/LAZ file.
    File {
        /// Input .las or .laz file.
        input: PathBuf,

        #[command(flatten)]
        settings: Settings,
    },
    /// Convert every LAS/LAZ file found directly inside a folder.
    Folder {
        /// Folder to scan (not recursive).
        input: PathBuf,

        /// Merge all files into one tileset instead of one tileset per file.
        #[arg(long, env = "LAS2TILES_JOIN")]
        join: bool,

        #[command(flatten)]
        settings: Settings,
    },
}

#[derive(Args, Debug, Clone)]
struct Settings {
    /// Output directory.
    #[arg(short = 'o', long, env = "LAS2TILES_OUT")]
    out: PathBuf,

    /// EPSG code of the input coordinates.
    #[arg(short = 'e', long, env = "LAS2TILES_EPSG")]
    epsg: u32,

    /// Point spacing at the coarsest level of detail, in metres.
    #[arg(short = 'r', long, env = "LAS2TILES_RESOLUTION", default_value_t = DEFAULT_GRID_SIZE_M)]
    resolution: f64,

    /// Metres added to every Z before reprojection.
    #[arg(
        short = 'z',
        long = "z-offset",
        env = "LAS2TILES_Z_OFFSET",
        default_value_t = 0.0,
        allow_negative_numbers = true
    )]
    z_offset: f64,

    /// Maximum octree depth.
    #[arg(short = 'd', long, env = "LAS2TILES_DEPTH", default_value_t = DEFAULT_MAX_DEPTH)]
    depth: u32,

    /// Minimum number of points a tile must hold.
    #[arg(
        short = 'm',
        long = "min-points-per-tile",
        env = "LAS2TILES_MIN_POINTS_PER_TILE",
        default_value_t = DEFAULT_MIN_POINTS_PER_TILE
    )]
    min_points_per_tile: usize,

    /// Input heights are above the geoid rather than the ellipsoid.
    #[arg(short = 'g', long, env = "LAS2TILES_GEOID")]
    geoid: bool,

    /// Colours are already 8 bit per channel.
    #[arg(long = "8-bit", env = "LAS2TILES_8_BIT")]
    eight_bit: bool,

    /// Worker threads (defaults to the number of CPUs).
    #[arg(short = 'w', long, env = "LAS2TILES_WORKERS")]
    workers: Option<usize>,

    /// Constant geoid undulation in metres, used with --geoid instead of EGM2008.
    #[arg(long, env = "LAS2TILES_GEOID_UNDULATION", allow_negative_numbers = true)]
    geoid_undulation: Option<f64>,
}

impl Settings {
    fn options(&self) -> TilerOptions {
        let mut options = TilerOptions::default()
            .with_grid_size(self.resolution)
            .with_max_depth(self.depth)
            .with_min_points_per_tile(self.min_points_per_tile)
            .with_elevation_offset(self.z_offset)
            .with_geoid_elevation(self.geoid)
            .with_eight_bit_color(self.eight_bit);
        if let Some(workers) = self.workers {
            options = options.with_num_workers(workers);
        }
        options
    }

    fn tiler(&self) -> Result<Tiler> {
        let geoid: Arc<dyn GeoidModel> = match self.geoid_undulation {
            Some(undulation) => Arc::new(ConstantGeoid(undulation)),
            None => Arc::new(Egm2008Geoid),
        };
        let tiler = Tiler::new(self.options())
            .context("invalid settings")?
            .with_reprojector(Arc::new(Wgs84Reprojector::new(geoid)));
        Ok(tiler)
    }

    fn log(&self) {
        info!("output:              {}", self.out.display());
        info!("source EPSG:         {}", self.epsg);
        info!("resolution:          {} m", self.resolution);
        info!("z offset:            {} m", self.z_offset);
        info!("max depth:           {}", self.depth);
        info!("min points per tile: {}", self.min_points_per_tile);
        match self.geoid_undulation {
            Some(n) => info!("geoid heights:       {} (constant undulation {n} m)", self.geoid),
            None => info!("geoid heights:       {} (EGM2008)", self.geoid),
        }
        info!("8-bit colours:       {}", self.eight_bit);
    }
}

/// What one invocation has to do.
struct Plan {
    inputs: Vec<PathBuf>,
    join: bool,
    settings: Settings,
}

impl Plan {
    fn from_command(command: Command) -> Result<Plan> {
        match command {
            Command::File { input, settings } => {
                if !input.is_file() {
                    bail!("input file '{}' does not exist", input.display());
                }
                Ok(Plan {
                    inputs: vec![input],
                    join: true,
                    settings,
                })
            }
            Command::Folder {
                input,
                join,
                settings,
            } => {
                let inputs = discover::point_cloud_files(&input)?;
                if inputs.is_empty() {
                    warn!("no .las/.laz files found in {}", input.display());
                }
                Ok(Plan {
                    inputs,
                    join,
                    settings,
                })
            }
        }
    }

    fn execute(self, cancel: &CancellationToken) -> Result<RunReport> {
        let tiler = self.settings.tiler()?;
        info!("workers:             {}", tiler.options().num_workers);
        info!("inputs:              {} (join: {})", self.inputs.len(), self.join);

        let providers: Vec<Arc<dyn SourceProvider>> = self
            .inputs
            .into_iter()
            .map(|path| Arc::new(LasFile(path)) as Arc<dyn SourceProvider>)
            .collect();

        let out = &self.settings.out;
        let epsg = self.settings.epsg;
        let report = if self.join {
            tiler.process_files(providers, out, epsg, cancel, &LogSink)
        } else {
            tiler.process_each(providers, out, epsg, cancel, &LogSink)
        };
        report.context("failed to start tiling")
    }
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let plan = Plan::from_command(cli.command)?;
    plan.settings.log();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            warn!("interrupt received, cancelling...");
            cancel.cancel();
        });
    }

    let started = Instant::now();
    let worker_cancel = cancel.clone();
    let report = tokio::task::spawn_blocking(move || plan.execute(&worker_cancel))
        .await
        .context("tiling task panicked")??;

    let (ok, failed) = (report.succeeded(), report.failed());
    let stats = report.into_result();
    info!(
        "finished in {:.2}s: {ok} job(s) succeeded, {failed} failed",
        started.elapsed().as_secs_f64()
    );

    if cancel.is_cancelled() {
        bail!("cancelled");
    }
    let stats = stats.context("tiling failed")?;
    let points: usize = stats.iter().map(|s| s.points).sum();
    info!("{points} points written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn file_command_uses_defaults() {
        let cli = Cli::try_parse_from(["las2tiles", "file", "scan.laz", "-o", "out", "-e", "32632"]).unwrap();
        let Command::File { input, settings } = cli.command else {
            panic!("expected the file command");
        };
        assert_eq!(input, PathBuf::from("scan.laz"));

        let options = settings.options();
        assert_eq!(options.grid_size, 20.0);
        assert_eq!(options.max_depth, 10);
        assert_eq!(options.min_points_per_tile, 5000);
        assert!(!options.geoid_elevation);
        assert!(!options.eight_bit_color);
        assert_eq!(settings.geoid_undulation, None);
        options.validate().unwrap();
    }

    #[test]
    fn folder_command_reads_every_flag() {
        let cli = Cli::try_parse_from([
            "las2tiles", "folder", "clouds", "--join", "--out", "tiles", "--epsg", "4326", "-r", "2.5",
            "-z", "-12.5", "-d", "12", "-m", "100", "-g", "--8-bit", "-w", "3", "--geoid-undulation",
            "-47.1",
        ])
        .unwrap();
        let Command::Folder {
            input,
            join,
            settings,
        } = cli.command
        else {
            panic!("expected the folder command");
        };
        assert_eq!(input, PathBuf::from("clouds"));
        assert!(join);
        assert_eq!(settings.epsg, 4326);
        assert_eq!(settings.geoid_undulation, Some(-47.1));

        let options = settings.options();
        assert_eq!(options.grid_size, 2.5);
        assert_eq!(options.elevation_offset, -12.5);
        assert_eq!(options.max_depth, 12);
        assert_eq!(options.min_points_per_tile, 100);
        assert_eq!(options.num_workers, 3);
        assert!(options.geoid_elevation);
        assert!(options.eight_bit_color);
    }

    #[test]
    fn out_of_range_settings_are_rejected() {
        let cli = Cli::try_parse_from(["las2tiles", "file", "a.las", "-o", "o", "-e", "4326", "-d", "30"]).unwrap();
        let Command::File { settings, .. } = cli.command else {
            panic!("expected the file command");
        };
        assert!(settings.tiler().is_err());
    }

    #[test]
    fn missing_epsg_is_a_usage_error() {
        assert!(Cli::try_parse_from(["las2tiles", "file", "a.las", "-o", "out"]).is_err());
    }

    #[test]
    fn empty_folder_joins_into_a_root_only_tileset() {
        let input = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let out_dir = out.path().to_string_lossy().into_owned();
        let in_dir = input.path().to_string_lossy().into_owned();

        let cli = Cli::try_parse_from([
            "las2tiles", "folder", in_dir.as_str(), "--join", "-o", out_dir.as_str(), "-e", "4978",
        ])
        .unwrap();
        let plan = Plan::from_command(cli.command).unwrap();
        let stats = plan.execute(&CancellationToken::new()).unwrap().into_result().unwrap();

        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].points, 0);
        assert!(out.path().join("tileset.json").is_file());
    }
}
