//! Source reference system → WGS-84 geocentric (EPSG:4978) conversion.
//!
//! The engine only depends on the [`Reprojector`] trait. [`Wgs84Reprojector`]
//! is the built-in implementation: it resolves any EPSG code known to the
//! bundled EPSG database, converts through `proj4rs` to WGS-84 geodetic
//! coordinates and caches one [`SourceCrs`] per code.

use crate::error::{Result, TilerError};
use dashmap::DashMap;
use glam::DVec3;
use pnts::{ecef_to_geodetic, geodetic_to_ecef};
use proj4rs::proj::Proj;
use std::fmt;
use std::sync::Arc;

const GEOCENTRIC_SRID: u32 = 4978;
const WGS84_GEODETIC: &str = "+proj=longlat +datum=WGS84 +no_defs";

/// Vertical reference of the input heights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerticalDatum {
    /// Heights above the WGS-84 ellipsoid.
    Ellipsoid,
    /// Orthometric heights above the geoid.
    Geoid,
}

/// Converts coordinates expressed in `srid` to ECEF metres.
pub trait Reprojector: Send + Sync {
    fn reproject(&self, coord: DVec3, srid: u32, datum: VerticalDatum) -> Result<DVec3>;
}

/// Geoid undulation (geoid height above the ellipsoid) lookup.
pub trait GeoidModel: Send + Sync {
    fn undulation(&self, lat_deg: f64, lon_deg: f64) -> Result<f64, String>;
}

/// Same undulation everywhere. Useful when the local separation of a small
/// survey area is known better than the global model.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConstantGeoid(pub f64);

impl GeoidModel for ConstantGeoid {
    fn undulation(&self, _lat_deg: f64, _lon_deg: f64) -> Result<f64, String> {
        Ok(self.0)
    }
}

/// Global EGM2008 geoid, bundled with the `egm2008` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct Egm2008Geoid;

impl GeoidModel for Egm2008Geoid {
    fn undulation(&self, lat_deg: f64, lon_deg: f64) -> Result<f64, String> {
        egm2008::geoid_height(lat_deg as f32, lon_deg as f32)
            .map(f64::from)
            .map_err(|e| format!("no EGM2008 height at ({lat_deg}, {lon_deg}): {e:?}"))
    }
}

/// A resolved source reference system.
pub enum SourceCrs {
    /// Already ECEF metres.
    Geocentric,
    /// Anything `proj4rs` can take to WGS-84 geodetic coordinates.
    Proj {
        definition: &'static str,
        from: Proj,
        to: Proj,
        /// x/y are longitude/latitude in degrees rather than metres.
        angular: bool,
    },
}

impl fmt::Debug for SourceCrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceCrs::Geocentric => f.write_str("Geocentric"),
            SourceCrs::Proj { definition, .. } => write!(f, "Proj({definition})"),
        }
    }
}

impl SourceCrs {
    /// Look `srid` up in the EPSG database.
    pub fn from_epsg(srid: u32) -> Result<SourceCrs> {
        if srid == GEOCENTRIC_SRID {
            return Ok(SourceCrs::Geocentric);
        }

        // Legacy Google code, never registered with EPSG.
        let code = if srid == 900913 { 3857 } else { srid };
        let definition = u16::try_from(code)
            .ok()
            .and_then(crs_definitions::from_code)
            .map(|def| def.proj4)
            .ok_or_else(|| TilerError::projection(srid, "unknown EPSG code"))?;

        if definition.contains("+proj=geocent") {
            return Ok(SourceCrs::Geocentric);
        }

        let from = Proj::from_proj_string(definition)
            .map_err(|e| TilerError::projection(srid, format!("unsupported definition '{definition}': {e}")))?;
        let to = Proj::from_proj_string(WGS84_GEODETIC)
            .map_err(|e| TilerError::projection(srid, e.to_string()))?;

        Ok(SourceCrs::Proj {
            definition,
            from,
            to,
            angular: definition.contains("+proj=longlat") || definition.contains("+proj=latlong"),
        })
    }

    /// (lat_deg, lon_deg, h) above the WGS-84 ellipsoid.
    fn to_geodetic(&self, c: DVec3, srid: u32) -> Result<(f64, f64, f64)> {
        match self {
            SourceCrs::Geocentric => Ok(ecef_to_geodetic(c.x, c.y, c.z)),
            SourceCrs::Proj { from, to, angular, .. } => {
                let mut p = if *angular {
                    (c.x.to_radians(), c.y.to_radians(), c.z)
                } else {
                    (c.x, c.y, c.z)
                };
                proj4rs::transform::transform(from, to, &mut p)
                    .map_err(|e| TilerError::projection(srid, format!("cannot transform {c}: {e}")))?;
                Ok((p.1.to_degrees(), p.0.to_degrees(), p.2))
            }
        }
    }
}

/// Built-in reprojector with a per-SRID cache of resolved systems.
pub struct Wgs84Reprojector {
    cache: DashMap<u32, Arc<SourceCrs>>,
    geoid: Arc<dyn GeoidModel>,
}

impl Default for Wgs84Reprojector {
    fn default() -> Self {
        Self::new(Arc::new(Egm2008Geoid))
    }
}

impl Wgs84Reprojector {
    pub fn new(geoid: Arc<dyn GeoidModel>) -> Self {
        Self {
            cache: DashMap::new(),
            geoid,
        }
    }

    /// Resolve (and cache) the reference system for `srid`.
    pub fn source_crs(&self, srid: u32) -> Result<Arc<SourceCrs>> {
        if let Some(crs) = self.cache.get(&srid) {
            return Ok(crs.clone());
        }

        let crs = Arc::new(SourceCrs::from_epsg(srid)?);
        log::debug!("initialised EPSG:{srid} as {crs:?}");
        Ok(self.cache.entry(srid).or_insert(crs).clone())
    }

    pub fn cached_systems(&self) -> usize {
        self.cache.len()
    }
}

impl Reprojector for Wgs84Reprojector {
    fn reproject(&self, coord: DVec3, srid: u32, datum: VerticalDatum) -> Result<DVec3> {
        let crs = self.source_crs(srid)?;

        if matches!(*crs, SourceCrs::Geocentric) && datum == VerticalDatum::Ellipsoid {
            return Ok(coord);
        }

        let (lat, lon, mut h) = crs.to_geodetic(coord, srid)?;
        if !(lat.is_finite() && lon.is_finite() && h.is_finite()) || lat.abs() > 90.0 {
            return Err(TilerError::projection(
                srid,
                format!("coordinate {coord} is outside the valid domain"),
            ));
        }

        if datum == VerticalDatum::Geoid {
            h += self
                .geoid
                .undulation(lat, lon)
                .map_err(|reason| TilerError::projection(srid, reason))?;
        }

        Ok(DVec3::from_array(geodetic_to_ecef(lat, lon, h)))
    }
}
