//! Splitting a voxel grid into bricks.
//!
//! Each brick owns a tile of voxels; tiles cover the grid exactly. The texture
//! uploaded for a brick extends its tile by one voxel past every internal upper
//! boundary, so neighbouring textures share a one-voxel seam and trilinear
//! sampling stays continuous across bricks.

use glam::{DMat4, DVec3};

use crate::error::{Result, VolrayError};

/// Inclusive `[start, end]` voxel ranges of one axis split into `partitions` tiles.
///
/// The last tile receives the remainder. More partitions than voxels are
/// clamped to one voxel per tile.
pub fn split_axis(voxels: usize, partitions: usize) -> Vec<(usize, usize)> {
    let voxels = voxels.max(1);
    let parts = partitions.clamp(1, voxels);
    let base = voxels / parts;
    (0..parts)
        .map(|i| {
            let start = i * base;
            let end = if i + 1 == parts {
                voxels - 1
            } else {
                (i + 1) * base - 1
            };
            (start, end)
        })
        .collect()
}

/// One brick of a partitioned grid, in voxel index space.
#[derive(Debug, Clone, PartialEq)]
pub struct BrickExtent {
    /// Voxels owned by this brick, `[x0, x1, y0, y1, z0, z1]` inclusive.
    pub tile: [usize; 6],
    /// Voxels uploaded for this brick, inclusive; the tile plus seam voxels.
    pub texture: [usize; 6],
    /// Region rendered by this brick, in continuous point-index coordinates.
    pub geometry: [f64; 6],
}

impl BrickExtent {
    /// Texture size per axis.
    pub fn texture_dims(&self) -> [usize; 3] {
        [0, 1, 2].map(|a| self.texture[2 * a + 1] - self.texture[2 * a] + 1)
    }

    /// Number of uploaded voxels.
    pub fn texture_voxels(&self) -> usize {
        self.texture_dims().iter().product()
    }

    /// Maps normalized texture coordinates to continuous point-index coordinates.
    ///
    /// Texel centers sit at `(i + 0.5) / m`; cell-centered voxels sit half a
    /// cell past their lower point.
    #[allow(clippy::cast_precision_loss)]
    pub fn texture_to_index(&self, cell_data: bool) -> DMat4 {
        let center = if cell_data { 0.5 } else { 0.0 };
        let dims = self.texture_dims();
        let offset = DVec3::new(
            self.texture[0] as f64 + center - 0.5,
            self.texture[2] as f64 + center - 0.5,
            self.texture[4] as f64 + center - 0.5,
        );
        let scale = DVec3::new(dims[0] as f64, dims[1] as f64, dims[2] as f64);
        DMat4::from_translation(offset) * DMat4::from_scale(scale)
    }

    /// Texture-space step between adjacent voxels.
    #[allow(clippy::cast_precision_loss)]
    pub fn cell_step(&self) -> DVec3 {
        let dims = self.texture_dims();
        DVec3::new(
            1.0 / dims[0] as f64,
            1.0 / dims[1] as f64,
            1.0 / dims[2] as f64,
        )
    }
}

/// Splits a grid of `dims` voxels into `partitions` bricks, x fastest.
#[allow(clippy::cast_precision_loss)]
pub fn split_extent(
    dims: [usize; 3],
    partitions: [u16; 3],
    cell_data: bool,
) -> Result<Vec<BrickExtent>> {
    if partitions.contains(&0) {
        return Err(VolrayError::InvalidPartitions(partitions));
    }
    let axes: Vec<Vec<(usize, usize)>> = (0..3)
        .map(|a| split_axis(dims[a], usize::from(partitions[a])))
        .collect();

    let mut bricks = Vec::with_capacity(axes.iter().map(Vec::len).product());
    for (kz, &z) in axes[2].iter().enumerate() {
        for (ky, &y) in axes[1].iter().enumerate() {
            for (kx, &x) in axes[0].iter().enumerate() {
                let ranges = [(x, kx), (y, ky), (z, kz)];
                let mut tile = [0; 6];
                let mut texture = [0; 6];
                let mut geometry = [0.0; 6];
                for (a, &((start, end), k)) in ranges.iter().enumerate() {
                    let first = k == 0;
                    let last = k + 1 == axes[a].len();
                    let tex_end = if last { end } else { end + 1 };
                    tile[2 * a] = start;
                    tile[2 * a + 1] = end;
                    texture[2 * a] = start;
                    texture[2 * a + 1] = tex_end;
                    if cell_data {
                        geometry[2 * a] = if first { 0.0 } else { start as f64 + 0.5 };
                        geometry[2 * a + 1] = if last {
                            dims[a].max(1) as f64
                        } else {
                            tex_end as f64 + 0.5
                        };
                    } else {
                        geometry[2 * a] = start as f64;
                        geometry[2 * a + 1] = tex_end as f64;
                    }
                }
                bricks.push(BrickExtent {
                    tile,
                    texture,
                    geometry,
                });
            }
        }
    }
    Ok(bricks)
}
