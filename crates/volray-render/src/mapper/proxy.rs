//! Camera-facing proxy geometry of bricks.
//!
//! Each brick is drawn as its bounding box; only front faces are rasterized
//! and every fragment starts a ray. When the near plane cuts a box, the box is
//! clipped and capped on the plane, otherwise rays of fragments behind the
//! camera would never start.

use std::collections::HashMap;

use glam::{DMat4, DVec3};
use volray_core::geometry::{near_plane_offset, plane_intersects};
use volray_core::{Camera, Plane, ProxyMesh};

use crate::error::RenderResult;
use crate::gpu::{GeometryHandle, GpuBackend};

/// Everything the geometry of one brick depends on.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ProxyKey {
    corners: [DVec3; 8],
    matrix: DMat4,
    /// Offset near plane in world space, or `None` while it misses the box.
    near: Option<[f64; 4]>,
}

#[derive(Debug)]
struct ProxyEntry {
    key: ProxyKey,
    geometry: Option<GeometryHandle>,
    clipped: bool,
    used: bool,
}

/// Geometry of one brick for the current camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proxy {
    /// `None` when the box lies entirely behind the near plane.
    pub geometry: Option<GeometryHandle>,
    /// True if the box was cut by the near plane.
    pub clipped: bool,
}

/// Cached proxy meshes, one per brick.
#[derive(Debug, Default)]
pub struct ProxyCache {
    entries: HashMap<(String, usize), ProxyEntry>,
}

impl ProxyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Geometry for brick `block` of `owner`.
    ///
    /// `corners` are in the coordinates the mesh is drawn in; `matrix` takes
    /// them to world space. The mesh is rebuilt only when the corners, the
    /// matrix or the clipping near plane change.
    pub fn geometry(
        &mut self,
        gpu: &mut dyn GpuBackend,
        owner: &str,
        block: usize,
        corners: &[DVec3; 8],
        matrix: &DMat4,
        camera: &Camera,
    ) -> RenderResult<Proxy> {
        let world: Vec<DVec3> = corners.iter().map(|c| matrix.transform_point3(*c)).collect();
        let near_plane = camera.near_plane();
        let near = plane_intersects(&near_plane, &world).then(|| {
            near_plane
                .offset(near_plane_offset(camera.near, camera.far))
                .coefficients()
                .to_array()
        });
        let key = ProxyKey {
            corners: *corners,
            matrix: *matrix,
            near,
        };

        let id = (owner.to_string(), block);
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.key == key {
                entry.used = true;
                return Ok(Proxy {
                    geometry: entry.geometry,
                    clipped: entry.clipped,
                });
            }
        }

        let mut mesh = match near {
            Some(coefficients) => {
                let world_plane = Plane::from_coefficients(coefficients.into());
                let local = world_plane.transformed(&matrix.inverse());
                log::debug!("{owner} brick {block}: clipping proxy at the near plane");
                ProxyMesh::clipped_box(corners, &local)
            }
            None => ProxyMesh::from_box(corners),
        };
        mesh.match_handedness(matrix);

        let geometry = if mesh.is_empty() {
            None
        } else {
            Some(gpu.create_geometry(&mesh.positions_f32(), &mesh.indices())?)
        };
        if let Some(old) = self.entries.remove(&id) {
            if let Some(handle) = old.geometry {
                gpu.release_geometry(handle);
            }
        }
        self.entries.insert(
            id,
            ProxyEntry {
                key,
                geometry,
                clipped: mesh.clipped,
                used: true,
            },
        );
        Ok(Proxy {
            geometry,
            clipped: mesh.clipped,
        })
    }

    /// Drops the meshes of bricks that were not requested since the last call.
    pub fn collect_unused(&mut self, gpu: &mut dyn GpuBackend) {
        self.entries.retain(|_, entry| {
            if !entry.used {
                if let Some(handle) = entry.geometry {
                    gpu.release_geometry(handle);
                }
                return false;
            }
            entry.used = false;
            true
        });
    }

    /// Number of cached meshes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Releases every mesh.
    pub fn release(&mut self, gpu: &mut dyn GpuBackend) {
        for (_, entry) in self.entries.drain() {
            if let Some(handle) = entry.geometry {
                gpu.release_geometry(handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordingBackend;
    use volray_core::geometry::box_corners;

    fn unit_box() -> [DVec3; 8] {
        box_corners([-1.0, 1.0, -1.0, 1.0, -1.0, 1.0])
    }

    #[test]
    fn test_outside_camera_uses_full_box() {
        let mut gpu = RecordingBackend::new();
        let mut cache = ProxyCache::new();
        let mut camera = Camera::new(1.0);
        camera.position = DVec3::new(0.0, 0.0, 5.0);
        let proxy = cache
            .geometry(&mut gpu, "v0g0", 0, &unit_box(), &DMat4::IDENTITY, &camera)
            .unwrap();
        assert!(!proxy.clipped);
        let (positions, indices) = gpu.geometry(proxy.geometry.unwrap()).unwrap();
        assert_eq!(positions.len(), 8);
        assert_eq!(indices.len(), 36);
    }

    #[test]
    fn test_inside_camera_clips_and_caches() {
        let mut gpu = RecordingBackend::new();
        let mut cache = ProxyCache::new();
        let mut camera = Camera::new(1.0);
        camera.position = DVec3::new(0.0, 0.0, 0.5);
        camera.near = 0.1;
        let proxy = cache
            .geometry(&mut gpu, "v0g0", 0, &unit_box(), &DMat4::IDENTITY, &camera)
            .unwrap();
        assert!(proxy.clipped);
        assert!(proxy.geometry.is_some());

        let created = gpu.stats().geometries_created;
        let again = cache
            .geometry(&mut gpu, "v0g0", 0, &unit_box(), &DMat4::IDENTITY, &camera)
            .unwrap();
        assert_eq!(again, proxy);
        assert_eq!(gpu.stats().geometries_created, created);

        camera.position = DVec3::new(0.0, 0.0, 5.0);
        let outside = cache
            .geometry(&mut gpu, "v0g0", 0, &unit_box(), &DMat4::IDENTITY, &camera)
            .unwrap();
        assert!(!outside.clipped);
        assert_eq!(gpu.live_geometries(), 1);
    }

    #[test]
    fn test_unused_meshes_are_collected() {
        let mut gpu = RecordingBackend::new();
        let mut cache = ProxyCache::new();
        let mut camera = Camera::new(1.0);
        camera.position = DVec3::new(0.0, 0.0, 5.0);
        for block in 0..2 {
            cache
                .geometry(&mut gpu, "v0g0", block, &unit_box(), &DMat4::IDENTITY, &camera)
                .unwrap();
        }
        cache.collect_unused(&mut gpu);
        assert_eq!(cache.len(), 2);
        cache
            .geometry(&mut gpu, "v0g0", 0, &unit_box(), &DMat4::IDENTITY, &camera)
            .unwrap();
        cache.collect_unused(&mut gpu);
        assert_eq!(cache.len(), 1);
        assert_eq!(gpu.live_geometries(), 1);
        cache.release(&mut gpu);
        assert!(cache.is_empty());
        assert_eq!(gpu.live_geometries(), 0);
    }
}
