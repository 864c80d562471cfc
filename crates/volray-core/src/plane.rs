//! Oriented planes for clipping, slicing and near-plane tests.

use glam::{DMat4, DVec3, DVec4};

/// Maximum number of clipping planes passed to the ray caster.
pub const MAX_CLIPPING_PLANES: usize = 6;

/// A plane through `origin` with unit `normal`.
///
/// The normal points toward the kept half-space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    origin: DVec3,
    normal: DVec3,
}

impl Default for Plane {
    fn default() -> Self {
        Self {
            origin: DVec3::ZERO,
            normal: DVec3::Z,
        }
    }
}

impl Plane {
    /// Creates a plane; the normal is normalized.
    pub fn new(origin: DVec3, normal: DVec3) -> Self {
        Self {
            origin,
            normal: normal.normalize_or(DVec3::Z),
        }
    }

    /// Creates the plane `a*x + b*y + c*z + d = 0`.
    pub fn from_coefficients(coefficients: DVec4) -> Self {
        let n = coefficients.truncate();
        let len2 = n.length_squared();
        if len2 == 0.0 {
            return Self::default();
        }
        let origin = -n * (coefficients.w / len2);
        Self::new(origin, n)
    }

    /// A point on the plane.
    pub fn origin(&self) -> DVec3 {
        self.origin
    }

    /// Unit normal.
    pub fn normal(&self) -> DVec3 {
        self.normal
    }

    /// `(a, b, c, d)` with a unit normal.
    pub fn coefficients(&self) -> DVec4 {
        self.normal.extend(-self.normal.dot(self.origin))
    }

    /// Signed distance; positive on the normal side.
    pub fn signed_distance(&self, point: DVec3) -> f64 {
        (point - self.origin).dot(self.normal)
    }

    /// True if `point` is on the kept side (or on the plane).
    pub fn is_kept(&self, point: DVec3) -> bool {
        self.signed_distance(point) >= 0.0
    }

    /// Projects a point onto the plane.
    pub fn project(&self, point: DVec3) -> DVec3 {
        point - self.signed_distance(point) * self.normal
    }

    /// The plane moved `distance` along its normal.
    #[must_use]
    pub fn offset(&self, distance: f64) -> Self {
        Self {
            origin: self.origin + self.normal * distance,
            normal: self.normal,
        }
    }

    /// The same plane expressed in the frame reached through `matrix`.
    ///
    /// Normals transform by the inverse transpose.
    #[must_use]
    pub fn transformed(&self, matrix: &DMat4) -> Self {
        let origin = matrix.transform_point3(self.origin);
        let normal = matrix.inverse().transpose().transform_vector3(self.normal);
        Self::new(origin, normal)
    }
}

/// Flattens clipping planes as `[count, ox, oy, oz, nx, ny, nz, ...]`.
///
/// Planes beyond [`MAX_CLIPPING_PLANES`] are dropped with a warning.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn flatten_clipping_planes(planes: &[Plane]) -> Vec<f32> {
    if planes.len() > MAX_CLIPPING_PLANES {
        log::warn!(
            "{} clipping planes requested, only the first {MAX_CLIPPING_PLANES} are used",
            planes.len()
        );
    }
    let used = &planes[..planes.len().min(MAX_CLIPPING_PLANES)];
    let mut out = Vec::with_capacity(1 + used.len() * 6);
    out.push(used.len() as f32);
    for plane in used {
        out.extend(plane.origin.to_array().map(|v| v as f32));
        out.extend(plane.normal.to_array().map(|v| v as f32));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_distance() {
        let plane = Plane::new(DVec3::ZERO, DVec3::Y);
        assert!(plane.signed_distance(DVec3::new(0.0, 1.0, 0.0)) > 0.0);
        assert!(plane.signed_distance(DVec3::new(0.0, -1.0, 0.0)) < 0.0);
        assert!(plane.signed_distance(DVec3::new(1.0, 0.0, 1.0)).abs() < 1e-12);
        assert!(plane.is_kept(DVec3::new(3.0, 0.0, 0.0)));
    }

    #[test]
    fn test_coefficients_roundtrip() {
        let plane = Plane::new(DVec3::new(0.0, 0.0, 2.0), DVec3::new(0.0, 0.0, 3.0));
        let c = plane.coefficients();
        assert_eq!(c, DVec4::new(0.0, 0.0, 1.0, -2.0));
        let back = Plane::from_coefficients(c * 4.0);
        assert!((back.origin() - plane.origin()).length() < 1e-12);
        assert!((back.normal() - plane.normal()).length() < 1e-12);
    }

    #[test]
    fn test_transformed_under_nonuniform_scale() {
        let plane = Plane::new(DVec3::new(1.0, 1.0, 0.0), DVec3::new(1.0, 1.0, 0.0));
        let m = DMat4::from_scale(DVec3::new(2.0, 1.0, 1.0));
        let t = plane.transformed(&m);
        // A point on the original plane stays on the transformed plane.
        let p = DVec3::new(2.0, 0.0, 5.0);
        assert!(plane.signed_distance(p).abs() < 1e-12);
        assert!(t.signed_distance(m.transform_point3(p)).abs() < 1e-9);
    }

    #[test]
    fn test_offset_and_project() {
        let plane = Plane::new(DVec3::ZERO, DVec3::X).offset(2.0);
        assert!((plane.origin().x - 2.0).abs() < 1e-12);
        assert_eq!(plane.project(DVec3::new(5.0, 1.0, 1.0)), DVec3::new(2.0, 1.0, 1.0));
    }

    #[test]
    fn test_flatten_clipping_planes() {
        let planes = vec![Plane::new(DVec3::ZERO, DVec3::X); 8];
        let flat = flatten_clipping_planes(&planes);
        assert_eq!(flat.len(), 1 + MAX_CLIPPING_PLANES * 6);
        assert!((flat[0] - 6.0).abs() < f32::EPSILON);
        assert!((flat[4] - 1.0).abs() < f32::EPSILON);
    }
}
