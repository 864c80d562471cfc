//! Configuration options for the volume mapper.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cropping::Cropping;
use crate::error::{Result, VolrayError};

/// Default texture memory budget when the device does not report one.
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 128 * 1024 * 1024;

/// Compositing rule used when accumulating samples along a ray.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BlendMode {
    /// Front-to-back alpha compositing.
    #[default]
    Composite,
    /// Maximum intensity projection.
    MaximumIntensity,
    /// Minimum intensity projection.
    MinimumIntensity,
    /// Average of the samples inside the configured range.
    AverageIntensity,
    /// Sum of weighted samples.
    Additive,
    /// First crossing of any contour value.
    Isosurface,
    /// Single slice through the volume.
    Slice,
}

impl BlendMode {
    /// All blend modes, in declaration order.
    pub const ALL: [BlendMode; 7] = [
        BlendMode::Composite,
        BlendMode::MaximumIntensity,
        BlendMode::MinimumIntensity,
        BlendMode::AverageIntensity,
        BlendMode::Additive,
        BlendMode::Isosurface,
        BlendMode::Slice,
    ];

    /// Returns true for blend modes that accumulate opacity along the ray.
    ///
    /// Only these modes need sample-distance opacity correction and the
    /// depth pre-pass.
    #[must_use]
    pub fn is_compositing(self) -> bool {
        matches!(self, BlendMode::Composite)
    }

    /// Returns a short display name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            BlendMode::Composite => "composite",
            BlendMode::MaximumIntensity => "mip",
            BlendMode::MinimumIntensity => "minip",
            BlendMode::AverageIntensity => "average",
            BlendMode::Additive => "additive",
            BlendMode::Isosurface => "isosurface",
            BlendMode::Slice => "slice",
        }
    }
}

/// Texture sampling mode for volume data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Interpolation {
    /// Nearest voxel.
    Nearest,
    /// Trilinear.
    #[default]
    Linear,
}

/// How a mask volume restricts rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MaskType {
    /// Voxels with a zero mask value are skipped.
    #[default]
    Binary,
    /// Mask values select one of the label color tables.
    LabelMap,
}

/// Scalar type of the depth output written in render-to-image mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DepthImageFormat {
    /// 8-bit normalized.
    Unorm8,
    /// 16-bit normalized.
    Unorm16,
    /// 32-bit float.
    #[default]
    Float32,
}

/// Configuration of a volume mapper.
///
/// Every field has a default, so partial JSON documents are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperOptions {
    /// Blend mode used by the ray caster.
    pub blend_mode: BlendMode,

    /// Ray step in world units when not auto-adjusted.
    pub sample_distance: f64,

    /// Derive the ray step from the data spacing and the reduction factor.
    pub auto_adjust_sample_distances: bool,

    /// Derive the ray step from the data spacing only.
    pub lock_sample_distance_to_input_spacing: bool,

    /// Screen-space subsampling factor (1 renders at full resolution).
    pub image_sample_distance: f64,

    /// Lower bound for the adaptive image sample distance.
    pub minimum_image_sample_distance: f64,

    /// Upper bound for the adaptive image sample distance.
    pub maximum_image_sample_distance: f64,

    /// Window applied to the final color.
    pub final_color_window: f64,

    /// Level applied to the final color.
    pub final_color_level: f64,

    /// Brick grid used when streaming large volumes.
    pub partitions: [u16; 3],

    /// GPU texture memory budget in bytes.
    pub max_memory_in_bytes: u64,

    /// Fraction of the budget a single volume may use.
    pub max_memory_fraction: f64,

    /// Offset ray starts by a noise texture to hide wood-grain artifacts.
    pub use_jittering: bool,

    /// Render an isosurface depth pre-pass to bound the ray length.
    pub use_depth_pass: bool,

    /// Contour values for the depth pre-pass.
    pub depth_pass_contour_values: Vec<f64>,

    /// Render into owned color and depth textures instead of the frame target.
    pub render_to_image: bool,

    /// Scalar type of the depth texture in render-to-image mode.
    pub depth_image_format: DepthImageFormat,

    /// Write the back-face depth when a ray accumulates nothing.
    pub clamp_depth_to_backface: bool,

    /// Cropping regions.
    pub cropping: Cropping,

    /// Scalar range considered by the average-intensity blend mode.
    pub average_ip_scalar_range: [f64; 2],

    /// Interpretation of the mask volume.
    pub mask_type: MaskType,

    /// Blend between the label-map colors and the regular transfer function.
    pub mask_blend_factor: f64,
}

impl Default for MapperOptions {
    fn default() -> Self {
        Self {
            blend_mode: BlendMode::Composite,
            sample_distance: 1.0,
            auto_adjust_sample_distances: true,
            lock_sample_distance_to_input_spacing: false,
            image_sample_distance: 1.0,
            minimum_image_sample_distance: 1.0,
            maximum_image_sample_distance: 10.0,
            final_color_window: 1.0,
            final_color_level: 0.5,
            partitions: [1, 1, 1],
            max_memory_in_bytes: DEFAULT_MAX_MEMORY_BYTES,
            max_memory_fraction: 0.75,
            use_jittering: false,
            use_depth_pass: false,
            depth_pass_contour_values: Vec::new(),
            render_to_image: false,
            depth_image_format: DepthImageFormat::Float32,
            clamp_depth_to_backface: false,
            cropping: Cropping::default(),
            average_ip_scalar_range: [f64::MIN, f64::MAX],
            mask_type: MaskType::Binary,
            mask_blend_factor: 1.0,
        }
    }
}

impl MapperOptions {
    /// Parses options from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Loads options from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Serializes the options to pretty-printed JSON.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.partitions.contains(&0) {
            return Err(VolrayError::InvalidPartitions(self.partitions));
        }
        if !(self.sample_distance > 0.0) {
            return Err(VolrayError::InvalidOption {
                name: "sample_distance",
                reason: format!("must be positive, got {}", self.sample_distance),
            });
        }
        if !(self.image_sample_distance > 0.0) {
            return Err(VolrayError::InvalidOption {
                name: "image_sample_distance",
                reason: format!("must be positive, got {}", self.image_sample_distance),
            });
        }
        if self.minimum_image_sample_distance > self.maximum_image_sample_distance {
            return Err(VolrayError::InvalidOption {
                name: "minimum_image_sample_distance",
                reason: "must not exceed maximum_image_sample_distance".to_string(),
            });
        }
        if self.final_color_window == 0.0 {
            return Err(VolrayError::InvalidOption {
                name: "final_color_window",
                reason: "must be non-zero".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.max_memory_fraction) {
            return Err(VolrayError::InvalidOption {
                name: "max_memory_fraction",
                reason: format!("must lie in [0, 1], got {}", self.max_memory_fraction),
            });
        }
        Ok(())
    }

    /// Scale and bias applied to the final color, from window and level.
    #[must_use]
    pub fn final_color_scale_bias(&self) -> (f64, f64) {
        let scale = 1.0 / self.final_color_window;
        let bias = 0.5 - self.final_color_level / self.final_color_window;
        (scale, bias)
    }

    /// Texture memory available to a single volume.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn volume_memory_budget(&self) -> u64 {
        (self.max_memory_in_bytes as f64 * self.max_memory_fraction) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = MapperOptions::default();
        assert_eq!(opts.blend_mode, BlendMode::Composite);
        assert_eq!(opts.partitions, [1, 1, 1]);
        assert!(opts.auto_adjust_sample_distances);
        assert!((opts.image_sample_distance - 1.0).abs() < f64::EPSILON);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_final_color_scale_bias_identity() {
        let (scale, bias) = MapperOptions::default().final_color_scale_bias();
        assert!((scale - 1.0).abs() < 1e-12);
        assert!(bias.abs() < 1e-12);
    }

    #[test]
    fn test_partial_json() {
        let opts =
            MapperOptions::from_json_str(r#"{ "blend_mode": "MaximumIntensity", "partitions": [2, 2, 1] }"#)
                .unwrap();
        assert_eq!(opts.blend_mode, BlendMode::MaximumIntensity);
        assert_eq!(opts.partitions, [2, 2, 1]);
        assert!((opts.sample_distance - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_json_rejects_zero_partition() {
        let err = MapperOptions::from_json_str(r#"{ "partitions": [0, 1, 1] }"#).unwrap_err();
        assert!(matches!(err, VolrayError::InvalidPartitions(_)));
    }

    #[test]
    fn test_json_roundtrip_preserves_cropping() {
        let mut opts = MapperOptions::default();
        opts.cropping.enabled = true;
        opts.cropping.planes = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let text = opts.to_json_string().unwrap();
        let back = MapperOptions::from_json_str(&text).unwrap();
        assert_eq!(back, opts);
    }

    #[test]
    fn test_compositing_modes() {
        let compositing: Vec<_> = BlendMode::ALL.iter().filter(|b| b.is_compositing()).collect();
        assert_eq!(compositing, vec![&BlendMode::Composite]);
    }
}
