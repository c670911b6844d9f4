use crate::error::{Result, TilerError};

pub const DEFAULT_GRID_SIZE_M: f64 = 20.0;
pub const DEFAULT_MAX_DEPTH: u32 = 10;
pub const DEFAULT_MIN_POINTS_PER_TILE: usize = 5000;

/// How the per-job local origin is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BaselinePolicy {
    /// Centre of the reprojected bounding box.
    #[default]
    BoundingBoxCenter,
    /// The first reprojected point of the job.
    FirstPoint,
}

/// Options bundle consumed by the engine.
#[derive(Debug, Clone)]
pub struct TilerOptions {
    /// Approximate point spacing at the coarsest level of detail, in metres.
    pub grid_size: f64,
    /// Maximum depth of the tree; the root is depth 0.
    pub max_depth: u32,
    /// Minimum number of points a tile must hold to exist on its own.
    pub min_points_per_tile: usize,
    /// Metres added to Z in the source reference system before reprojection.
    pub elevation_offset: f64,
    /// Interpret Z as height above the geoid instead of the ellipsoid.
    pub geoid_elevation: bool,
    /// Interpret colours (and intensity) as already 8-bit.
    pub eight_bit_color: bool,
    /// Size of the worker pool.
    pub num_workers: usize,
    pub baseline: BaselinePolicy,
}

/// Host parallelism, falling back to a single worker when it cannot be queried.
pub fn default_num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Default for TilerOptions {
    fn default() -> Self {
        Self {
            grid_size: DEFAULT_GRID_SIZE_M,
            max_depth: DEFAULT_MAX_DEPTH,
            min_points_per_tile: DEFAULT_MIN_POINTS_PER_TILE,
            elevation_offset: 0.0,
            geoid_elevation: false,
            eight_bit_color: false,
            num_workers: default_num_workers(),
            baseline: BaselinePolicy::default(),
        }
    }
}

impl TilerOptions {
    pub fn with_grid_size(mut self, grid_size: f64) -> Self {
        self.grid_size = grid_size;
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_min_points_per_tile(mut self, min_points: usize) -> Self {
        self.min_points_per_tile = min_points;
        self
    }

    pub fn with_elevation_offset(mut self, offset: f64) -> Self {
        self.elevation_offset = offset;
        self
    }

    pub fn with_geoid_elevation(mut self, geoid: bool) -> Self {
        self.geoid_elevation = geoid;
        self
    }

    pub fn with_eight_bit_color(mut self, eight_bit: bool) -> Self {
        self.eight_bit_color = eight_bit;
        self
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_baseline(mut self, baseline: BaselinePolicy) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.5..=1000.0).contains(&self.grid_size) {
            return Err(TilerError::InvalidOptions(format!(
                "grid size must be between 0.5 and 1000 meters, got {}",
                self.grid_size
            )));
        }
        if !(2..=20).contains(&self.max_depth) {
            return Err(TilerError::InvalidOptions(format!(
                "max depth must be between 2 and 20, got {}",
                self.max_depth
            )));
        }
        if self.min_points_per_tile < 1 {
            return Err(TilerError::InvalidOptions(
                "min points per tile must be at least 1".into(),
            ));
        }
        if self.num_workers < 1 {
            return Err(TilerError::InvalidOptions(
                "at least one worker is required".into(),
            ));
        }
        if !self.elevation_offset.is_finite() {
            return Err(TilerError::InvalidOptions(
                "elevation offset must be a finite number".into(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn validate_srid(srid: u32) -> Result<()> {
    if srid == 0 {
        return Err(TilerError::InvalidOptions(
            "source EPSG code must be positive".into(),
        ));
    }
    Ok(())
}
