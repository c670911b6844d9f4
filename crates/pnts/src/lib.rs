//! PNTS: 3D Tiles point cloud payloads (version 1) anchored on an f64 RTC center.
//!
//! - Positions are f32 offsets (metres) from `RTC_CENTER`, which is WGS-84 ECEF.
//! - Per-point RGB (u8 x3) lives in the feature table.
//! - Per-point intensity and classification (u8) live in the batch table.
//!
//! File layout (little-endian):
//!   00  : [u8;4]  magic = b"pnts"
//!   04  : u32     version = 1
//!   08  : u32     byte_length (whole file)
//!   0C  : u32     feature_table_json_byte_length
//!   10  : u32     feature_table_binary_byte_length
//!   14  : u32     batch_table_json_byte_length
//!   18  : u32     batch_table_binary_byte_length
//!   1C  : feature table JSON   (space padded)
//!   ..  : feature table binary (f32 x,y,z * N then u8 r,g,b * N, zero padded)
//!   ..  : batch table JSON     (space padded)
//!   ..  : batch table binary   (u8 intensity * N then u8 classification * N, zero padded)
//!
//! Every section ends on an 8-byte boundary measured from the start of the file.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::Path;

pub const PNTS_MAGIC: [u8; 4] = *b"pnts";
pub const PNTS_VERSION: u32 = 1;
pub const PNTS_HEADER_LEN: usize = 28;

const SECTION_ALIGN: usize = 8;

/// A decoded (or to-be-encoded) point cloud payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PntsTile {
    /// Earth-centred origin the positions are relative to.
    pub rtc_center: [f64; 3],
    pub positions: Vec<[f32; 3]>,
    pub colors: Vec<[u8; 3]>,
    pub intensities: Vec<u8>,
    pub classifications: Vec<u8>,
}

impl PntsTile {
    pub fn with_capacity(rtc_center: [f64; 3], capacity: usize) -> Self {
        Self {
            rtc_center,
            positions: Vec::with_capacity(capacity),
            colors: Vec::with_capacity(capacity),
            intensities: Vec::with_capacity(capacity),
            classifications: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn push(&mut self, position: [f32; 3], color: [u8; 3], intensity: u8, classification: u8) {
        self.positions.push(position);
        self.colors.push(color);
        self.intensities.push(intensity);
        self.classifications.push(classification);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn check_lengths(&self) -> io::Result<()> {
        let n = self.positions.len();
        if self.colors.len() != n || self.intensities.len() != n || self.classifications.len() != n {
            return Err(bad("attribute length != positions length"));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BinaryRef {
    #[serde(rename = "byteOffset")]
    byte_offset: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct FeatureTableHeader {
    points_length: u32,
    rtc_center: [f64; 3],
    position: BinaryRef,
    rgb: Option<BinaryRef>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchProperty {
    byte_offset: usize,
    component_type: String,
    #[serde(rename = "type")]
    kind: String,
}

impl BatchProperty {
    fn unsigned_byte_scalar(byte_offset: usize) -> Self {
        Self {
            byte_offset,
            component_type: "UNSIGNED_BYTE".to_owned(),
            kind: "SCALAR".to_owned(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct BatchTableHeader {
    intensity: Option<BatchProperty>,
    classification: Option<BatchProperty>,
}

#[inline(always)]
fn padding(len: usize) -> usize {
    (SECTION_ALIGN - len % SECTION_ALIGN) % SECTION_ALIGN
}

/// Serialise `value` and pad it with spaces so that `offset + len` is aligned.
fn padded_json<T: Serialize>(value: &T, offset: usize) -> io::Result<Vec<u8>> {
    let mut json = serde_json::to_vec(value)?;
    let pad = padding(offset + json.len());
    json.resize(json.len() + pad, b' ');
    Ok(json)
}

fn pad_zero(buf: &mut Vec<u8>) {
    let pad = padding(buf.len());
    buf.resize(buf.len() + pad, 0);
}

fn extend_positions(out: &mut Vec<u8>, positions: &[[f32; 3]]) {
    #[cfg(target_endian = "little")]
    {
        out.extend_from_slice(bytemuck::cast_slice(positions));
    }

    #[cfg(not(target_endian = "little"))]
    {
        for p in positions {
            out.extend_from_slice(&p[0].to_le_bytes());
            out.extend_from_slice(&p[1].to_le_bytes());
            out.extend_from_slice(&p[2].to_le_bytes());
        }
    }
}

fn section_len(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| bad("pnts section exceeds 4 GiB"))
}

/// Encode a tile into its binary representation. This is the single source of truth for writing.
pub fn encode_pnts(tile: &PntsTile) -> io::Result<Vec<u8>> {
    tile.check_lengths()?;
    let n = tile.len();
    let points_length = section_len(n)?;

    // Feature table
    let feature_json = padded_json(
        &FeatureTableHeader {
            points_length,
            rtc_center: tile.rtc_center,
            position: BinaryRef { byte_offset: 0 },
            rgb: Some(BinaryRef { byte_offset: n * 12 }),
        },
        PNTS_HEADER_LEN,
    )?;

    let mut feature_bin = Vec::<u8>::with_capacity(n * 15 + SECTION_ALIGN);
    extend_positions(&mut feature_bin, &tile.positions);
    feature_bin.extend_from_slice(bytemuck::cast_slice(&tile.colors));
    pad_zero(&mut feature_bin);

    // Batch table
    let batch_offset = PNTS_HEADER_LEN + feature_json.len() + feature_bin.len();
    let batch_json = padded_json(
        &BatchTableHeader {
            intensity: Some(BatchProperty::unsigned_byte_scalar(0)),
            classification: Some(BatchProperty::unsigned_byte_scalar(n)),
        },
        batch_offset,
    )?;

    let mut batch_bin = Vec::<u8>::with_capacity(n * 2 + SECTION_ALIGN);
    batch_bin.extend_from_slice(&tile.intensities);
    batch_bin.extend_from_slice(&tile.classifications);
    pad_zero(&mut batch_bin);

    let byte_length = batch_offset + batch_json.len() + batch_bin.len();

    let mut out = Vec::<u8>::with_capacity(byte_length);
    out.extend_from_slice(&PNTS_MAGIC);
    out.extend_from_slice(&PNTS_VERSION.to_le_bytes());
    out.extend_from_slice(&section_len(byte_length)?.to_le_bytes());
    out.extend_from_slice(&section_len(feature_json.len())?.to_le_bytes());
    out.extend_from_slice(&section_len(feature_bin.len())?.to_le_bytes());
    out.extend_from_slice(&section_len(batch_json.len())?.to_le_bytes());
    out.extend_from_slice(&section_len(batch_bin.len())?.to_le_bytes());
    out.extend_from_slice(&feature_json);
    out.extend_from_slice(&feature_bin);
    out.extend_from_slice(&batch_json);
    out.extend_from_slice(&batch_bin);

    debug_assert_eq!(out.len(), byte_length);
    Ok(out)
}

/// Encode `tile` into `writer`; returns the number of bytes written.
pub fn write_to<W: Write>(mut writer: W, tile: &PntsTile) -> io::Result<u64> {
    let bytes = encode_pnts(tile)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(bytes.len() as u64)
}

pub fn write_file<P: AsRef<Path>>(path: P, tile: &PntsTile) -> io::Result<u64> {
    let file = File::create(path)?;
    write_to(BufWriter::new(file), tile)
}

#[inline(always)]
fn need(buf: &[u8], want: usize) -> io::Result<()> {
    if buf.len() < want {
        Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated pnts"))
    } else {
        Ok(())
    }
}

#[inline(always)]
fn take<'a>(buf: &mut &'a [u8], n: usize) -> io::Result<&'a [u8]> {
    need(buf, n)?;
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

#[inline(always)]
fn le_u32(buf: &mut &[u8]) -> io::Result<u32> {
    let b = take(buf, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[cold]
fn bad(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg.to_owned())
}

fn slice_at(bin: &[u8], offset: usize, len: usize) -> io::Result<&[u8]> {
    let end = offset.checked_add(len).ok_or_else(|| bad("binary reference overflow"))?;
    bin.get(offset..end).ok_or_else(|| bad("binary reference out of bounds"))
}

/// Parse a pnts payload from a contiguous byte slice.
pub fn parse_pnts_bytes(mut p: &[u8]) -> io::Result<PntsTile> {
    let total = p.len();

    // Header
    if take(&mut p, 4)? != PNTS_MAGIC.as_slice() {
        return Err(bad("bad pnts magic"));
    }
    if le_u32(&mut p)? != PNTS_VERSION {
        return Err(bad("unsupported pnts version"));
    }

    let byte_length = le_u32(&mut p)? as usize;
    if byte_length > total {
        return Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated pnts"));
    }

    let feature_json_len = le_u32(&mut p)? as usize;
    let feature_bin_len = le_u32(&mut p)? as usize;
    let batch_json_len = le_u32(&mut p)? as usize;
    let batch_bin_len = le_u32(&mut p)? as usize;

    // Feature table
    let header: FeatureTableHeader = serde_json::from_slice(take(&mut p, feature_json_len)?)?;
    let feature_bin = take(&mut p, feature_bin_len)?;
    let n = header.points_length as usize;

    let positions = slice_at(feature_bin, header.position.byte_offset, n * 12)?
        .chunks_exact(12)
        .map(|c| {
            [
                f32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                f32::from_le_bytes([c[4], c[5], c[6], c[7]]),
                f32::from_le_bytes([c[8], c[9], c[10], c[11]]),
            ]
        })
        .collect();

    let colors = match header.rgb {
        Some(rgb) => slice_at(feature_bin, rgb.byte_offset, n * 3)?
            .chunks_exact(3)
            .map(|c| [c[0], c[1], c[2]])
            .collect(),
        None => vec![[255, 255, 255]; n],
    };

    // Batch table (optional for foreign writers)
    let (intensities, classifications) = if batch_json_len > 0 {
        let batch: BatchTableHeader = serde_json::from_slice(take(&mut p, batch_json_len)?)?;
        let batch_bin = take(&mut p, batch_bin_len)?;

        let column = |prop: Option<BatchProperty>| -> io::Result<Vec<u8>> {
            match prop {
                Some(prop) => Ok(slice_at(batch_bin, prop.byte_offset, n)?.to_vec()),
                None => Ok(vec![0; n]),
            }
        };

        (column(batch.intensity)?, column(batch.classification)?)
    } else {
        (vec![0; n], vec![0; n])
    };

    Ok(PntsTile {
        rtc_center: header.rtc_center,
        positions,
        colors,
        intensities,
        classifications,
    })
}

pub fn read_file<P: AsRef<Path>>(path: P) -> io::Result<PntsTile> {
    let bytes = std::fs::read(path)?;
    parse_pnts_bytes(&bytes)
}

pub mod wgs84 {
    /// Semi-major axis (equatorial radius) in meters.
    pub const A: f64 = 6_378_137.0;

    /// Flattening factor (1 / 298.257223563).
    pub const F: f64 = 1.0 / 298.257_223_563;

    /// First eccentricity squared.
    pub const E2: f64 = F * (2.0 - F);

    /// Semi-minor axis (polar radius) in meters.
    pub const B: f64 = A * (1.0 - F);

    /// Second eccentricity squared.
    pub const E2P: f64 = (A * A - B * B) / (B * B);
}

/// Geodetic (degrees, ellipsoidal height in metres) to WGS-84 ECEF metres.
#[inline]
pub fn geodetic_to_ecef(lat_deg: f64, lon_deg: f64, h_m: f64) -> [f64; 3] {
    let (sin_lat, cos_lat) = lat_deg.to_radians().sin_cos();
    let (sin_lon, cos_lon) = lon_deg.to_radians().sin_cos();

    // Prime vertical radius of curvature
    let n = wgs84::A / (1.0 - wgs84::E2 * sin_lat * sin_lat).sqrt();

    [
        (n + h_m) * cos_lat * cos_lon,
        (n + h_m) * cos_lat * sin_lon,
        (n * (1.0 - wgs84::E2) + h_m) * sin_lat,
    ]
}

/// WGS-84 ECEF metres to (lat_deg, lon_deg, h_m) using Bowring's closed form.
#[inline]
pub fn ecef_to_geodetic(x: f64, y: f64, z: f64) -> (f64, f64, f64) {
    let p = (x * x + y * y).sqrt();
    let lon = y.atan2(x);

    let theta = (z * wgs84::A).atan2(p * wgs84::B);
    let (sin_theta, cos_theta) = theta.sin_cos();

    let lat = (z + wgs84::E2P * wgs84::B * sin_theta.powi(3))
        .atan2(p - wgs84::E2 * wgs84::A * cos_theta.powi(3));

    let sin_lat = lat.sin();
    let n = wgs84::A / (1.0 - wgs84::E2 * sin_lat * sin_lat).sqrt();

    // Near the poles p / cos(lat) is unstable; use the z-based form there.
    let h = if lat.cos().abs() > 1e-6 {
        p / lat.cos() - n
    } else {
        z.abs() / sin_lat.abs() - n * (1.0 - wgs84::E2)
    };

    (lat.to_degrees(), lon.to_degrees(), h)
}
