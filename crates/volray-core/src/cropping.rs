//! Cropping regions.
//!
//! Six axis-aligned planes split the volume into 3x3x3 regions. Bit `i` of
//! the region flags keeps region `i`, with regions numbered x fastest.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VolrayError};

/// Keep only the central region.
pub const CROP_SUBVOLUME: u32 = 0x000_2000;
/// Keep the three central slabs along every axis.
pub const CROP_FENCE: u32 = 0x2eb_feba;
/// Complement of [`CROP_FENCE`].
pub const CROP_INVERTED_FENCE: u32 = 0x514_0145;
/// Keep the central cross.
pub const CROP_CROSS: u32 = 0x041_7410;
/// Complement of [`CROP_CROSS`].
pub const CROP_INVERTED_CROSS: u32 = 0x7be_8bef;

/// Number of entries in the region table handed to the shader.
pub const REGION_TABLE_LEN: usize = 32;

/// Cropping configuration, in the volume's dataset coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cropping {
    /// Whether cropping is applied.
    pub enabled: bool,
    /// `[xmin, xmax, ymin, ymax, zmin, zmax]`.
    pub planes: [f64; 6],
    /// One bit per region, 27 regions.
    pub region_flags: u32,
}

impl Default for Cropping {
    fn default() -> Self {
        Self {
            enabled: false,
            planes: [0.0; 6],
            region_flags: CROP_SUBVOLUME,
        }
    }
}

impl Cropping {
    /// Fails when cropping is enabled and some axis has `min >= max`.
    pub fn validate(&self) -> Result<()> {
        if self.enabled && (0..3).any(|axis| self.planes[2 * axis] >= self.planes[2 * axis + 1]) {
            return Err(VolrayError::InvalidCroppingPlanes(self.planes));
        }
        Ok(())
    }

    /// Cropping planes clamped to `bounds`.
    #[must_use]
    pub fn clamped_planes(&self, bounds: [f64; 6]) -> [f64; 6] {
        let mut planes = self.planes;
        for axis in 0..3 {
            let (lo, hi) = (bounds[2 * axis], bounds[2 * axis + 1]);
            planes[2 * axis] = planes[2 * axis].clamp(lo, hi);
            planes[2 * axis + 1] = planes[2 * axis + 1].clamp(lo, hi);
        }
        planes
    }

    /// Expands the region flags into the table sampled by the shader.
    ///
    /// Entry 0 is unused; entry `i + 1` is 1 when region `i` is kept.
    #[must_use]
    pub fn region_table(&self) -> [i32; REGION_TABLE_LEN] {
        let mut table = [0; REGION_TABLE_LEN];
        for (region, entry) in table.iter_mut().skip(1).take(27).enumerate() {
            *entry = i32::from(self.region_flags & (1 << region) != 0);
        }
        table
    }
}
