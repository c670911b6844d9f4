use glam::{DVec3, Vec3};

/// A point as read from the input, in its source reference system.
///
/// Colour and intensity keep the LAS record width (16 bit); narrowing to
/// 8 bit happens during normalisation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawPoint {
    pub position: DVec3,
    pub color: [u16; 3],
    pub intensity: u16,
    pub classification: u8,
}

impl RawPoint {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            position: DVec3::new(x, y, z),
            ..Default::default()
        }
    }

    pub fn with_color(mut self, r: u16, g: u16, b: u16) -> Self {
        self.color = [r, g, b];
        self
    }

    pub fn with_intensity(mut self, intensity: u16) -> Self {
        self.intensity = intensity;
        self
    }

    pub fn with_classification(mut self, classification: u8) -> Self {
        self.classification = classification;
        self
    }
}

/// A point expressed as a single precision offset from the job baseline.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LocalPoint {
    pub position: Vec3,
    pub color: [u8; 3],
    pub intensity: u8,
    pub classification: u8,
}

/// ECEF origin shared by every [`LocalPoint`] of one job.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Baseline(pub DVec3);

impl Baseline {
    /// `(ecef - baseline)` narrowed to f32.
    #[inline]
    pub fn to_local(&self, ecef: DVec3) -> Vec3 {
        (ecef - self.0).as_vec3()
    }

    #[inline]
    pub fn to_ecef(&self, local: Vec3) -> DVec3 {
        self.0 + local.as_dvec3()
    }
}

/// Axis-aligned box in local (baseline-relative) coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const EMPTY: Aabb = Aabb {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    pub fn from_points(points: &[LocalPoint]) -> Aabb {
        points.iter().fold(Aabb::EMPTY, |mut acc, p| {
            acc.include(p.position);
            acc
        })
    }

    #[inline]
    pub fn include(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[inline]
    pub fn extent(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn contains(&self, other: &Aabb) -> bool {
        self.min.cmple(other.min).all() && self.max.cmpge(other.max).all()
    }

    /// Octant index of `p` relative to `center`: bit 0 = +x, bit 1 = +y, bit 2 = +z.
    #[inline]
    pub fn octant(center: Vec3, p: Vec3) -> usize {
        (p.x >= center.x) as usize | ((p.y >= center.y) as usize) << 1 | ((p.z >= center.z) as usize) << 2
    }
}

/// Axis-aligned box in f64 (used for the ECEF extent in the normaliser).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DAabb {
    pub min: DVec3,
    pub max: DVec3,
}

impl DAabb {
    pub const EMPTY: DAabb = DAabb {
        min: DVec3::splat(f64::INFINITY),
        max: DVec3::splat(f64::NEG_INFINITY),
    };

    #[inline]
    pub fn include(&mut self, p: DVec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    pub fn merge(self, other: DAabb) -> DAabb {
        DAabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    #[inline]
    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }
}
