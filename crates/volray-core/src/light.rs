//! Scene lights and the lighting complexity they imply.

use glam::DVec3;

/// Maximum number of lights uploaded to the ray caster.
pub const MAX_LIGHTS: usize = 6;

/// Frame in which a light is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LightKind {
    /// Located at the camera, pointing at the focal point.
    #[default]
    Headlight,
    /// Defined in camera coordinates.
    CameraLight,
    /// Defined in world coordinates.
    SceneLight,
}

/// A light source.
#[derive(Debug, Clone, PartialEq)]
pub struct Light {
    pub kind: LightKind,
    pub switch: bool,
    pub intensity: f64,
    pub ambient_color: DVec3,
    pub diffuse_color: DVec3,
    pub specular_color: DVec3,
    pub position: DVec3,
    pub focal_point: DVec3,
    /// Positional (spot/point) instead of directional.
    pub positional: bool,
    /// Spot cone half angle in degrees; 180 or more means a point light.
    pub cone_angle: f64,
    pub exponent: f64,
    /// Constant, linear and quadratic attenuation.
    pub attenuation: DVec3,
}

impl Default for Light {
    fn default() -> Self {
        Self {
            kind: LightKind::Headlight,
            switch: true,
            intensity: 1.0,
            ambient_color: DVec3::ZERO,
            diffuse_color: DVec3::ONE,
            specular_color: DVec3::ONE,
            position: DVec3::new(0.0, 0.0, 1.0),
            focal_point: DVec3::ZERO,
            positional: false,
            cone_angle: 30.0,
            exponent: 1.0,
            attenuation: DVec3::new(1.0, 0.0, 0.0),
        }
    }
}

impl Light {
    /// A headlight of unit intensity.
    pub fn headlight() -> Self {
        Self::default()
    }

    /// Direction the light travels, from position to focal point.
    pub fn direction(&self) -> DVec3 {
        (self.focal_point - self.position).normalize_or(DVec3::NEG_Z)
    }
}

/// How much of the lighting model the shader has to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum LightComplexity {
    /// No shading.
    #[default]
    None,
    /// A single unit-intensity headlight.
    Headlight,
    /// Directional lights.
    Directional,
    /// At least one positional light.
    Positional,
}

impl LightComplexity {
    /// Derives the complexity from the active lights.
    pub fn from_lights(shade: bool, lights: &[Light]) -> Self {
        if !shade {
            return LightComplexity::None;
        }
        let mut complexity = LightComplexity::None;
        let mut switched_on = 0;
        for light in lights.iter().filter(|l| l.switch) {
            switched_on += 1;
            if complexity == LightComplexity::None {
                complexity = LightComplexity::Headlight;
            }
            if complexity == LightComplexity::Headlight
                && (switched_on > 1
                    || (light.intensity - 1.0).abs() > f64::EPSILON
                    || light.kind != LightKind::Headlight)
            {
                complexity = LightComplexity::Directional;
            }
            if light.positional {
                return LightComplexity::Positional;
            }
        }
        complexity
    }

    /// Numeric level, 0 to 3.
    pub fn level(self) -> u32 {
        match self {
            LightComplexity::None => 0,
            LightComplexity::Headlight => 1,
            LightComplexity::Directional => 2,
            LightComplexity::Positional => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complexity_without_shading() {
        assert_eq!(
            LightComplexity::from_lights(false, &[Light::headlight()]),
            LightComplexity::None
        );
    }

    #[test]
    fn test_complexity_levels() {
        let head = Light::headlight();
        assert_eq!(LightComplexity::from_lights(true, &[]), LightComplexity::None);
        assert_eq!(
            LightComplexity::from_lights(true, std::slice::from_ref(&head)),
            LightComplexity::Headlight
        );

        let dim = Light { intensity: 0.5, ..Light::headlight() };
        assert_eq!(LightComplexity::from_lights(true, &[dim]), LightComplexity::Directional);

        assert_eq!(
            LightComplexity::from_lights(true, &[head.clone(), head.clone()]),
            LightComplexity::Directional
        );

        let spot = Light { positional: true, kind: LightKind::SceneLight, ..Light::headlight() };
        assert_eq!(LightComplexity::from_lights(true, &[head, spot]), LightComplexity::Positional);
    }

    #[test]
    fn test_switched_off_lights_ignored() {
        let off = Light { switch: false, positional: true, ..Light::headlight() };
        assert_eq!(LightComplexity::from_lights(true, &[off]), LightComplexity::None);
    }
}
