//! Raw points → baseline-relative single precision points.
//!
//! Two passes over the job's points:
//!   1. reproject every point to ECEF in f64 and accumulate the extent;
//!   2. fix the baseline, then subtract it and narrow to f32.
//! No f32 value exists before the baseline is known.

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::geom::{Baseline, DAabb, LocalPoint, RawPoint};
use crate::options::{BaselinePolicy, TilerOptions};
use crate::reproject::{Reprojector, VerticalDatum};
use glam::DVec3;
use rayon::prelude::*;

const CHUNK: usize = 65_536;

/// Output of the normaliser for one job.
#[derive(Debug, Clone)]
pub struct NormalizedCloud {
    pub baseline: Baseline,
    /// ECEF extent of all points (empty for an empty job).
    pub extent: DAabb,
    pub points: Vec<LocalPoint>,
}

/// Narrow a colour channel to 8 bit.
///
/// 16-bit input is scaled by dropping the low byte; 8-bit input passes through
/// and out-of-range values clamp to 255.
#[inline]
pub fn to_eight_bit(value: u16, eight_bit_input: bool) -> u8 {
    if eight_bit_input {
        value.min(u8::MAX as u16) as u8
    } else {
        (value >> 8) as u8
    }
}

pub struct Normalizer<'a> {
    reprojector: &'a dyn Reprojector,
    options: &'a TilerOptions,
}

impl<'a> Normalizer<'a> {
    pub fn new(reprojector: &'a dyn Reprojector, options: &'a TilerOptions) -> Self {
        Self {
            reprojector,
            options,
        }
    }

    fn datum(&self) -> VerticalDatum {
        if self.options.geoid_elevation {
            VerticalDatum::Geoid
        } else {
            VerticalDatum::Ellipsoid
        }
    }

    /// Reproject one point to ECEF, applying the elevation offset first.
    pub fn reproject(&self, point: &RawPoint, srid: u32) -> Result<DVec3> {
        let mut coord = point.position;
        coord.z += self.options.elevation_offset;
        self.reprojector.reproject(coord, srid, self.datum())
    }

    /// Pass 1: ECEF positions and their extent.
    fn project_all(
        &self,
        raw: &[RawPoint],
        srid: u32,
        cancel: &CancellationToken,
    ) -> Result<(Vec<DVec3>, DAabb)> {
        let chunks: Vec<(Vec<DVec3>, DAabb)> = raw
            .par_chunks(CHUNK)
            .map(|chunk| {
                cancel.check()?;
                let mut extent = DAabb::EMPTY;
                let mut out = Vec::with_capacity(chunk.len());
                for point in chunk {
                    let ecef = self.reproject(point, srid)?;
                    extent.include(ecef);
                    out.push(ecef);
                }
                Ok((out, extent))
            })
            .collect::<Result<_>>()?;

        let mut ecef = Vec::with_capacity(raw.len());
        let mut extent = DAabb::EMPTY;
        for (chunk, chunk_extent) in chunks {
            ecef.extend(chunk);
            extent = extent.merge(chunk_extent);
        }

        Ok((ecef, extent))
    }

    fn baseline(&self, ecef: &[DVec3], extent: &DAabb) -> Baseline {
        match self.options.baseline {
            _ if extent.is_empty() => Baseline::default(),
            BaselinePolicy::BoundingBoxCenter => Baseline(extent.center()),
            BaselinePolicy::FirstPoint => Baseline(ecef[0]),
        }
    }

    /// Reproject, rebase and narrow a job's points.
    pub fn normalize(
        &self,
        raw: &[RawPoint],
        srid: u32,
        cancel: &CancellationToken,
    ) -> Result<NormalizedCloud> {
        let (ecef, extent) = self.project_all(raw, srid, cancel)?;
        let baseline = self.baseline(&ecef, &extent);
        let eight_bit = self.options.eight_bit_color;

        // Pass 2
        let points = raw
            .par_iter()
            .zip(ecef.par_iter())
            .map(|(point, &ecef)| LocalPoint {
                position: baseline.to_local(ecef),
                color: point.color.map(|c| to_eight_bit(c, eight_bit)),
                // LAS intensity is 16 bit whatever the colour depth.
                intensity: to_eight_bit(point.intensity, false),
                classification: point.classification,
            })
            .collect();

        Ok(NormalizedCloud {
            baseline,
            extent,
            points,
        })
    }
}
