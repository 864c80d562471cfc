//! Proxy geometry that triggers ray casting.
//!
//! Each brick is drawn as its bounding box. When the camera's near plane cuts
//! through the box, the box is clipped by that plane and the cut is capped, so
//! rays start on the near plane instead of at faces behind the camera.

use glam::{DMat4, DVec3};

use crate::plane::Plane;

/// Corner indices of a box, x in bit 0, y in bit 1, z in bit 2.
const BOX_FACES: [[usize; 4]; 6] = [
    [0, 2, 6, 4],
    [1, 3, 7, 5],
    [0, 1, 5, 4],
    [2, 3, 7, 6],
    [0, 1, 3, 2],
    [4, 5, 7, 6],
];

/// Twelve triangles covering the six faces of a box.
pub const BOX_TRIANGLES: [[u32; 3]; 12] = [
    [0, 1, 2],
    [1, 3, 2],
    [1, 5, 3],
    [5, 7, 3],
    [5, 4, 7],
    [4, 6, 7],
    [4, 0, 6],
    [0, 2, 6],
    [2, 3, 6],
    [3, 7, 6],
    [0, 4, 1],
    [1, 4, 5],
];

const AREA_EPSILON: f64 = 1.0e-12;

/// The eight corners of `[x0, x1, y0, y1, z0, z1]`.
pub fn box_corners(bounds: [f64; 6]) -> [DVec3; 8] {
    std::array::from_fn(|i| {
        DVec3::new(
            bounds[usize::from(i & 1 != 0)],
            bounds[2 + usize::from(i & 2 != 0)],
            bounds[4 + usize::from(i & 4 != 0)],
        )
    })
}

/// True if `plane` touches or crosses the convex hull of `points`.
pub fn plane_intersects(plane: &Plane, points: &[DVec3]) -> bool {
    let mut positive = false;
    let mut negative = false;
    for p in points {
        let d = plane.signed_distance(*p);
        if d == 0.0 {
            return true;
        }
        if d > 0.0 {
            positive = true;
        } else {
            negative = true;
        }
    }
    positive && negative
}

/// Offset applied to the near plane before clipping, so the cap is not itself
/// clipped by the rasterizer.
pub fn near_plane_offset(near: f64, far: f64) -> f64 {
    ((far - near) * 0.001).max(f64::from(f32::EPSILON) * 1000.0)
}

/// Triangle mesh in the volume's dataset coordinates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyMesh {
    pub vertices: Vec<DVec3>,
    pub triangles: Vec<[u32; 3]>,
    /// True if the mesh was cut by a plane.
    pub clipped: bool,
}

impl ProxyMesh {
    /// The full box, wound counter-clockwise seen from outside.
    pub fn from_box(corners: &[DVec3; 8]) -> Self {
        let mut mesh = Self {
            vertices: corners.to_vec(),
            triangles: BOX_TRIANGLES.to_vec(),
            clipped: false,
        };
        mesh.orient_outward();
        mesh
    }

    /// The box restricted to the positive side of `plane`, capped on the plane.
    ///
    /// Returns the full box when the plane misses it and an empty mesh when
    /// the box lies entirely on the negative side.
    pub fn clipped_box(corners: &[DVec3; 8], plane: &Plane) -> Self {
        let distances = corners.map(|c| plane.signed_distance(c));
        if distances.iter().all(|&d| d >= 0.0) {
            return Self::from_box(corners);
        }
        if distances.iter().all(|&d| d <= 0.0) {
            return Self {
                clipped: true,
                ..Self::default()
            };
        }

        let mut polygons: Vec<Vec<DVec3>> = Vec::with_capacity(7);
        let mut cut_points: Vec<DVec3> = Vec::new();
        for face in BOX_FACES {
            let mut out = Vec::with_capacity(5);
            for k in 0..4 {
                let (a, b) = (face[k], face[(k + 1) % 4]);
                let (da, db) = (distances[a], distances[b]);
                if da >= 0.0 {
                    out.push(corners[a]);
                }
                if (da >= 0.0) != (db >= 0.0) {
                    let t = da / (da - db);
                    let p = corners[a].lerp(corners[b], t);
                    out.push(p);
                    cut_points.push(p);
                }
            }
            if out.len() >= 3 {
                polygons.push(out);
            }
        }

        let cap = order_on_plane(&dedup_points(cut_points), plane.normal());
        if cap.len() >= 3 {
            polygons.push(cap);
        }

        let mut mesh = Self {
            clipped: true,
            ..Self::default()
        };
        for polygon in polygons {
            mesh.push_fan(&polygon);
        }
        mesh.orient_outward();
        mesh
    }

    fn push_fan(&mut self, polygon: &[DVec3]) {
        #[allow(clippy::cast_possible_truncation)]
        let base = self.vertices.len() as u32;
        self.vertices.extend_from_slice(polygon);
        #[allow(clippy::cast_possible_truncation)]
        for k in 1..polygon.len() as u32 - 1 {
            let tri = [base, base + k, base + k + 1];
            if triangle_normal(&self.vertices, tri).length_squared() > AREA_EPSILON {
                self.triangles.push(tri);
            }
        }
    }

    /// Winds every triangle counter-clockwise as seen from outside.
    ///
    /// Valid for convex meshes only.
    fn orient_outward(&mut self) {
        if self.vertices.is_empty() {
            return;
        }
        #[allow(clippy::cast_precision_loss)]
        let centroid = self.vertices.iter().copied().sum::<DVec3>() / self.vertices.len() as f64;
        for tri in &mut self.triangles {
            let normal = triangle_normal(&self.vertices, *tri);
            let center = (self.vertices[tri[0] as usize]
                + self.vertices[tri[1] as usize]
                + self.vertices[tri[2] as usize])
                / 3.0;
            if normal.dot(center - centroid) < 0.0 {
                tri.swap(1, 2);
            }
        }
    }

    /// Reverses every triangle; used when the model matrix mirrors space.
    pub fn flip_winding(&mut self) {
        for tri in &mut self.triangles {
            tri.swap(1, 2);
        }
    }

    /// Flips the winding if `matrix` has a non-positive determinant.
    pub fn match_handedness(&mut self, matrix: &DMat4) {
        if matrix.determinant() <= 0.0 {
            self.flip_winding();
        }
    }

    /// Vertex positions as f32 triples.
    #[allow(clippy::cast_possible_truncation)]
    pub fn positions_f32(&self) -> Vec<[f32; 3]> {
        self.vertices
            .iter()
            .map(|v| [v.x as f32, v.y as f32, v.z as f32])
            .collect()
    }

    /// Flat index list.
    pub fn indices(&self) -> Vec<u32> {
        self.triangles.iter().flatten().copied().collect()
    }

    /// True when there is nothing to draw.
    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }
}

fn triangle_normal(vertices: &[DVec3], tri: [u32; 3]) -> DVec3 {
    let a = vertices[tri[0] as usize];
    let b = vertices[tri[1] as usize];
    let c = vertices[tri[2] as usize];
    (b - a).cross(c - a)
}

fn dedup_points(points: Vec<DVec3>) -> Vec<DVec3> {
    let mut unique: Vec<DVec3> = Vec::with_capacity(points.len());
    for p in points {
        if !unique.iter().any(|q| q.distance_squared(p) < 1e-18) {
            unique.push(p);
        }
    }
    unique
}

/// Sorts coplanar points by angle around their centroid.
fn order_on_plane(points: &[DVec3], normal: DVec3) -> Vec<DVec3> {
    if points.len() < 3 {
        return points.to_vec();
    }
    #[allow(clippy::cast_precision_loss)]
    let centroid = points.iter().copied().sum::<DVec3>() / points.len() as f64;
    let u = normal.any_orthonormal_vector();
    let v = normal.cross(u);
    let mut keyed: Vec<(f64, DVec3)> = points
        .iter()
        .map(|p| {
            let d = *p - centroid;
            (d.dot(v).atan2(d.dot(u)), *p)
        })
        .collect();
    keyed.sort_by(|a, b| a.0.total_cmp(&b.0));
    keyed.into_iter().map(|(_, p)| p).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box() -> [DVec3; 8] {
        box_corners([0.0, 1.0, 0.0, 1.0, 0.0, 1.0])
    }

    fn signed_volume(mesh: &ProxyMesh) -> f64 {
        mesh.triangles
            .iter()
            .map(|t| {
                let a = mesh.vertices[t[0] as usize];
                let b = mesh.vertices[t[1] as usize];
                let c = mesh.vertices[t[2] as usize];
                a.dot(b.cross(c)) / 6.0
            })
            .sum()
    }

    #[test]
    fn test_box_corners_order() {
        let c = unit_box();
        assert_eq!(c[0], DVec3::ZERO);
        assert_eq!(c[1], DVec3::X);
        assert_eq!(c[2], DVec3::Y);
        assert_eq!(c[4], DVec3::Z);
        assert_eq!(c[7], DVec3::ONE);
    }

    #[test]
    fn test_full_box_is_closed_and_outward() {
        let mesh = ProxyMesh::from_box(&unit_box());
        assert_eq!(mesh.triangles.len(), 12);
        assert!(!mesh.clipped);
        assert!((signed_volume(&mesh) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_plane_intersection() {
        let corners = unit_box();
        assert!(plane_intersects(&Plane::new(DVec3::splat(0.5), DVec3::Z), &corners));
        assert!(plane_intersects(&Plane::new(DVec3::ZERO, DVec3::Z), &corners));
        assert!(!plane_intersects(&Plane::new(DVec3::splat(2.0), DVec3::Z), &corners));
    }

    #[test]
    fn test_clip_halves_volume_and_caps() {
        let plane = Plane::new(DVec3::new(0.0, 0.0, 0.5), DVec3::Z);
        let mesh = ProxyMesh::clipped_box(&unit_box(), &plane);
        assert!(mesh.clipped);
        assert!((signed_volume(&mesh) - 0.5).abs() < 1e-9);
        assert!(mesh.vertices.iter().all(|v| v.z >= 0.5 - 1e-12));
    }

    #[test]
    fn test_oblique_clip_volume() {
        // Cuts off the corner tetrahedron at the origin with volume 1/6.
        let plane = Plane::new(DVec3::X, DVec3::ONE);
        let mesh = ProxyMesh::clipped_box(&unit_box(), &plane);
        assert!((signed_volume(&mesh) - (1.0 - 1.0 / 6.0)).abs() < 1e-9);
    }

    #[test]
    fn test_clip_outside_cases() {
        let keep_all = ProxyMesh::clipped_box(&unit_box(), &Plane::new(DVec3::splat(-1.0), DVec3::Z));
        assert!(!keep_all.clipped);
        assert_eq!(keep_all.triangles.len(), 12);

        let drop_all = ProxyMesh::clipped_box(&unit_box(), &Plane::new(DVec3::splat(2.0), DVec3::Z));
        assert!(drop_all.is_empty());
    }

    #[test]
    fn test_match_handedness_flips_for_mirror() {
        let mut mesh = ProxyMesh::from_box(&unit_box());
        let before = mesh.triangles.clone();
        mesh.match_handedness(&DMat4::IDENTITY);
        assert_eq!(mesh.triangles, before);
        mesh.match_handedness(&DMat4::from_scale(DVec3::new(-1.0, 1.0, 1.0)));
        assert!((signed_volume(&mesh) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_near_plane_offset_floor() {
        assert!((near_plane_offset(0.1, 1000.0) - 0.9999).abs() < 1e-9);
        assert!(near_plane_offset(1.0, 1.0) > 0.0);
    }
}
