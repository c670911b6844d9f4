//! Point sources: pull-based producers of [`RawPoint`]s.

use crate::error::{Result, TilerError};
use crate::geom::RawPoint;
use glam::DVec3;
use las::Reader;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Sequential producer of raw points. Single consumer; no rewind.
pub trait PointSource {
    /// Number of points declared by the input.
    fn count(&self) -> u64;

    /// EPSG code declared by the input, if any.
    fn srid(&self) -> Option<u32>;

    /// `Ok(None)` marks the end of the stream.
    fn next_point(&mut self) -> Result<Option<RawPoint>>;
}

/// Describes how to open a [`PointSource`] from inside a worker.
pub trait SourceProvider: Send + Sync + fmt::Debug {
    /// Human readable identifier used in events and errors.
    fn name(&self) -> String;

    /// Directory name used for the job output in independent mode.
    fn stem(&self) -> String {
        self.name()
    }

    fn open(&self) -> Result<Box<dyn PointSource>>;
}

// ==============================
// === LAS / LAZ              ===
// ==============================

/// GeoKeyDirectoryTag VLR, LAS 1.4 layout.
const GEOKEY_USER_ID: &str = "LASF_Projection";
const GEOKEY_RECORD_ID: u16 = 34735;
const PROJECTED_CS_TYPE_KEY: u16 = 3072;
const GEOGRAPHIC_TYPE_KEY: u16 = 2048;
const USER_DEFINED: u16 = 32767;

/// Extract an EPSG code from a raw GeoKeyDirectory record.
///
/// Layout: u16 header `[version, revision, minor, key_count]` followed by
/// `key_count` entries of `[key_id, tiff_tag_location, count, value]`. Only
/// keys stored inline (`tiff_tag_location == 0`) are considered; a projected
/// CRS takes precedence over a geographic one.
pub fn parse_geokey_srid(data: &[u8]) -> Option<u32> {
    let words: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();

    let key_count = *words.get(3)? as usize;
    let mut projected = None;
    let mut geographic = None;

    for entry in words.get(4..)?.chunks_exact(4).take(key_count) {
        let (key_id, location, value) = (entry[0], entry[1], entry[3]);
        if location != 0 || value == 0 || value == USER_DEFINED {
            continue;
        }
        match key_id {
            PROJECTED_CS_TYPE_KEY => projected = Some(value as u32),
            GEOGRAPHIC_TYPE_KEY => geographic = Some(value as u32),
            _ => {}
        }
    }

    projected.or(geographic)
}

/// Streams points out of a `.las` or `.laz` file.
pub struct LasSource {
    name: String,
    reader: Reader,
    count: u64,
    srid: Option<u32>,
}

impl LasSource {
    /// Open the file and read its header.
    pub fn open(path: &Path) -> Result<Self> {
        let name = path.display().to_string();
        let file = File::open(path).map_err(|e| TilerError::read(&name, e))?;
        let reader = Reader::new(BufReader::new(file)).map_err(|e| TilerError::read(&name, e))?;

        let header = reader.header();
        let count = header.number_of_points();
        let srid = header
            .vlrs()
            .iter()
            .chain(header.evlrs().iter())
            .find(|vlr| vlr.user_id == GEOKEY_USER_ID && vlr.record_id == GEOKEY_RECORD_ID)
            .and_then(|vlr| parse_geokey_srid(&vlr.data));

        log::debug!("{name}: {count} points, declared srid {srid:?}");

        Ok(Self {
            name,
            reader,
            count,
            srid,
        })
    }
}

impl PointSource for LasSource {
    fn count(&self) -> u64 {
        self.count
    }

    fn srid(&self) -> Option<u32> {
        self.srid
    }

    fn next_point(&mut self) -> Result<Option<RawPoint>> {
        match self.reader.points().next() {
            None => Ok(None),
            Some(Err(e)) => Err(TilerError::read(&self.name, e)),
            Some(Ok(p)) => {
                let color = p.color.map_or([0; 3], |c| [c.red, c.green, c.blue]);
                Ok(Some(RawPoint {
                    position: DVec3::new(p.x, p.y, p.z),
                    color,
                    intensity: p.intensity,
                    classification: u8::from(p.classification),
                }))
            }
        }
    }
}

/// A LAS/LAZ file on disk.
#[derive(Debug, Clone)]
pub struct LasFile(pub PathBuf);

impl SourceProvider for LasFile {
    fn name(&self) -> String {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.0.display().to_string())
    }

    fn stem(&self) -> String {
        self.0
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name())
    }

    fn open(&self) -> Result<Box<dyn PointSource>> {
        Ok(Box::new(LasSource::open(&self.0)?))
    }
}

// ==============================
// === In-memory              ===
// ==============================

/// Serves a fixed list of points; handy for embedding and tests.
#[derive(Debug, Clone)]
pub struct MemorySource {
    points: Arc<[RawPoint]>,
    cursor: usize,
    srid: Option<u32>,
}

impl MemorySource {
    pub fn new(points: impl Into<Arc<[RawPoint]>>, srid: Option<u32>) -> Self {
        Self {
            points: points.into(),
            cursor: 0,
            srid,
        }
    }
}

impl PointSource for MemorySource {
    fn count(&self) -> u64 {
        self.points.len() as u64
    }

    fn srid(&self) -> Option<u32> {
        self.srid
    }

    fn next_point(&mut self) -> Result<Option<RawPoint>> {
        let point = self.points.get(self.cursor).copied();
        if point.is_some() {
            self.cursor += 1;
        }
        Ok(point)
    }
}

/// Named in-memory input; every `open` starts a fresh pass.
#[derive(Debug, Clone)]
pub struct MemoryInput {
    pub name: String,
    pub points: Arc<[RawPoint]>,
    pub srid: Option<u32>,
}

impl MemoryInput {
    pub fn new(name: impl Into<String>, points: Vec<RawPoint>, srid: Option<u32>) -> Self {
        Self {
            name: name.into(),
            points: points.into(),
            srid,
        }
    }
}

impl SourceProvider for MemoryInput {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn open(&self) -> Result<Box<dyn PointSource>> {
        Ok(Box::new(MemorySource::new(self.points.clone(), self.srid)))
    }
}
