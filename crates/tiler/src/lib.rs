//! Point cloud tiling engine.
//!
//! LAS/LAZ points are reprojected to ECEF, rebased on a per-job baseline,
//! organised in a level-of-detail octree and written as 3D Tiles
//! (`tileset.json` plus one `.pnts` payload per non-empty node).
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use tiler::{CancellationToken, LasFile, LogSink, SourceProvider, Tiler, TilerOptions};
//!
//! let tiler = Tiler::new(TilerOptions::default())?;
//! let inputs: Vec<Arc<dyn SourceProvider>> = vec![Arc::new(LasFile("scan.laz".into()))];
//! let report = tiler.process_files(inputs, Path::new("out"), 32632, &CancellationToken::new(), &LogSink)?;
//! report.into_result()?;
//! # Ok::<(), tiler::TilerError>(())
//! ```

pub mod cancel;
pub mod error;
pub mod events;
pub mod export;
pub mod geom;
pub mod normalize;
pub mod octree;
pub mod options;
pub mod pipeline;
pub mod reproject;
pub mod source;
pub mod stream;

pub use cancel::CancellationToken;
pub use error::{Result, TilerError};
pub use events::{CollectingSink, EventKind, EventSink, LogSink, NullSink, TilerEvent};
pub use export::{ExportSummary, TileExporter, Tileset};
pub use geom::{Aabb, Baseline, LocalPoint, RawPoint};
pub use normalize::{NormalizedCloud, Normalizer};
pub use octree::{BuildParams, Octree, OctreeNode};
pub use options::{BaselinePolicy, TilerOptions};
pub use pipeline::{JobReport, JobState, JobStats, RunReport, Tiler, TilingJob};
pub use reproject::{
    ConstantGeoid, Egm2008Geoid, GeoidModel, Reprojector, SourceCrs, VerticalDatum, Wgs84Reprojector,
};
pub use source::{LasFile, MemoryInput, MemorySource, PointSource, SourceProvider};
pub use stream::PointStream;
