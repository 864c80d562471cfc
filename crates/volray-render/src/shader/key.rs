//! The feature combination a ray-casting program is built for.

use std::fmt::Write as _;

use volray_core::{BlendMode, ComponentMode, LightComplexity, MaskType, SelectionPass};

/// Per-input part of a [`ShaderKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputFeatures {
    /// Name prefix of the input's uniforms and textures.
    pub tag: String,
    pub components: usize,
    pub mode: ComponentMode,
    /// Per table set: sampled through a 2D transfer function.
    pub transfer_2d: Vec<bool>,
    /// Per table set: gradient-opacity table in use.
    pub gradient_opacity: Vec<bool>,
    /// Gradients are computed for this input.
    pub gradients: bool,
    pub shade: bool,
}

impl InputFeatures {
    /// Number of transfer-function sets the input samples.
    pub fn table_sets(&self) -> usize {
        self.mode.table_sets(self.components)
    }
}

/// Every choice that changes the generated source.
///
/// Two frames with equal keys and no newer property, configuration or
/// customization stamps reuse the same program.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ShaderKey {
    pub blend_mode: BlendMode,
    pub parallel_projection: bool,
    pub inputs: Vec<InputFeatures>,
    pub light_complexity: LightComplexity,
    pub num_lights: usize,
    pub cropping: bool,
    pub clipping: bool,
    pub clipped_voxel_intensity: bool,
    pub mask: Option<MaskType>,
    pub label_map_tables: usize,
    pub picking: SelectionPass,
    pub render_to_image: bool,
    pub depth_pass: bool,
    pub scene_depth: bool,
    pub jittering: bool,
    pub iso_contours: usize,
}

impl ShaderKey {
    /// True when more than one input is composited in a single draw.
    pub fn multi_volume(&self) -> bool {
        self.inputs.len() > 1
    }

    /// True when the lighting model is evaluated.
    pub fn shading(&self) -> bool {
        self.light_complexity != LightComplexity::None && self.inputs.iter().any(|i| i.shade)
    }

    /// Short human-readable summary, used in logs and compile errors.
    pub fn describe(&self) -> String {
        let mut out = format!(
            "{} {} inputs={}",
            self.blend_mode.name(),
            if self.parallel_projection { "parallel" } else { "perspective" },
            self.inputs.len()
        );
        for input in &self.inputs {
            let _ = write!(out, " {}:{}x{:?}", input.tag, input.components, input.mode);
            if input.transfer_2d.iter().any(|&b| b) {
                out.push_str("+2d");
            }
            if input.gradient_opacity.iter().any(|&b| b) {
                out.push_str("+gradop");
            }
        }
        if self.shading() {
            let _ = write!(out, " lights={}x{:?}", self.num_lights, self.light_complexity);
        }
        let flags = [
            (self.cropping, "cropping"),
            (self.clipping, "clipping"),
            (self.clipped_voxel_intensity, "clipped-intensity"),
            (self.render_to_image, "rtt"),
            (self.depth_pass, "depth-pass"),
            (self.scene_depth, "scene-depth"),
            (self.jittering, "jitter"),
        ];
        for (on, name) in flags {
            if on {
                out.push(' ');
                out.push_str(name);
            }
        }
        if let Some(mask) = self.mask {
            let _ = write!(out, " mask={mask:?}");
        }
        if self.picking != SelectionPass::None {
            let _ = write!(out, " pick={:?}", self.picking);
        }
        if self.blend_mode == BlendMode::Isosurface {
            let _ = write!(out, " contours={}", self.iso_contours);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn input(tag: &str) -> InputFeatures {
        InputFeatures {
            tag: tag.to_string(),
            components: 1,
            mode: ComponentMode::Independent,
            transfer_2d: vec![false],
            gradient_opacity: vec![false],
            gradients: false,
            shade: false,
        }
    }

    fn hash(key: &ShaderKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_single_flag_changes_key() {
        let a = ShaderKey {
            inputs: vec![input("v0g0")],
            ..ShaderKey::default()
        };
        let b = ShaderKey {
            cropping: true,
            ..a.clone()
        };
        assert_ne!(a, b);
        assert_eq!(hash(&a), hash(&a.clone()));
    }

    #[test]
    fn test_input_identity_is_part_of_key() {
        let a = ShaderKey {
            inputs: vec![input("v0g0")],
            ..ShaderKey::default()
        };
        let b = ShaderKey {
            inputs: vec![input("v0g1")],
            ..ShaderKey::default()
        };
        assert_ne!(a, b);
    }

    #[test]
    fn test_describe_lists_features() {
        let key = ShaderKey {
            inputs: vec![input("v0g0"), input("v1g0")],
            cropping: true,
            picking: SelectionPass::CellIdLow24,
            ..ShaderKey::default()
        };
        let text = key.describe();
        assert!(key.multi_volume());
        assert!(text.contains("composite"));
        assert!(text.contains("cropping"));
        assert!(text.contains("CellIdLow24"));
        assert!(!text.contains("clipping"));
    }
}
