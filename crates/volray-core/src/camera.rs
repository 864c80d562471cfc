//! Camera state consumed by the ray caster.

use glam::{DMat4, DVec3, DVec4};

use crate::plane::Plane;

/// Camera projection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProjectionMode {
    /// Perspective projection.
    #[default]
    Perspective,
    /// Parallel (orthographic) projection.
    Parallel,
}

/// Index of the near plane in [`Camera::frustum_planes`].
pub const NEAR_PLANE: usize = 4;

/// A 3D camera.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    /// Camera position in world space.
    pub position: DVec3,
    /// Point the camera is looking at.
    pub focal_point: DVec3,
    /// Up vector.
    pub view_up: DVec3,
    /// Vertical field of view in radians.
    pub view_angle: f64,
    /// Aspect ratio (width / height).
    pub aspect_ratio: f64,
    /// Near clipping distance.
    pub near: f64,
    /// Far clipping distance.
    pub far: f64,
    /// Projection mode.
    pub projection_mode: ProjectionMode,
    /// Half height of the view in parallel projection.
    pub parallel_scale: f64,
}

impl Camera {
    /// Creates a camera at `(0, 0, 3)` looking at the origin.
    #[must_use]
    pub fn new(aspect_ratio: f64) -> Self {
        Self {
            position: DVec3::new(0.0, 0.0, 3.0),
            focal_point: DVec3::ZERO,
            view_up: DVec3::Y,
            view_angle: std::f64::consts::FRAC_PI_6,
            aspect_ratio,
            near: 0.01,
            far: 1000.0,
            projection_mode: ProjectionMode::Perspective,
            parallel_scale: 1.0,
        }
    }

    /// True for parallel projection.
    pub fn is_parallel(&self) -> bool {
        self.projection_mode == ProjectionMode::Parallel
    }

    /// World-to-view matrix.
    #[must_use]
    pub fn view_matrix(&self) -> DMat4 {
        DMat4::look_at_rh(self.position, self.focal_point, self.view_up)
    }

    /// View-to-clip matrix with a `[0, 1]` depth range.
    #[must_use]
    pub fn projection_matrix(&self) -> DMat4 {
        match self.projection_mode {
            ProjectionMode::Perspective => {
                DMat4::perspective_rh(self.view_angle, self.aspect_ratio, self.near, self.far)
            }
            ProjectionMode::Parallel => {
                let half_height = self.parallel_scale;
                let half_width = half_height * self.aspect_ratio;
                DMat4::orthographic_rh(
                    -half_width,
                    half_width,
                    -half_height,
                    half_height,
                    self.near,
                    self.far,
                )
            }
        }
    }

    /// World-to-clip matrix.
    #[must_use]
    pub fn view_projection_matrix(&self) -> DMat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// Unit vector from the position toward the focal point.
    #[must_use]
    pub fn direction_of_projection(&self) -> DVec3 {
        (self.focal_point - self.position).normalize_or(DVec3::NEG_Z)
    }

    /// Frustum planes in world space with normals pointing inward.
    ///
    /// Order: left, right, bottom, top, near, far.
    #[must_use]
    pub fn frustum_planes(&self) -> [Plane; 6] {
        let m = self.view_projection_matrix();
        let (r0, r1, r2, r3) = (m.row(0), m.row(1), m.row(2), m.row(3));
        let coefficients: [DVec4; 6] = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2];
        coefficients.map(Plane::from_coefficients)
    }

    /// The near clipping plane in world space, normal pointing into the frustum.
    #[must_use]
    pub fn near_plane(&self) -> Plane {
        self.frustum_planes()[NEAR_PLANE]
    }

    /// Places the camera to frame an axis-aligned box, looking down -Z.
    pub fn look_at_box(&mut self, min: DVec3, max: DVec3) {
        let center = (min + max) * 0.5;
        let size = (max - min).length();
        self.focal_point = center;
        self.position = center + DVec3::new(0.0, 0.0, size * 1.5);
        self.near = size * 0.01;
        self.far = size * 10.0;
        self.parallel_scale = ((max - min).y.max((max - min).x / self.aspect_ratio) * 0.6).max(0.1);
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(1.0)
    }
}
