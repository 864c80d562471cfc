//! Assembly of complete programs from the template and fragment tables.

use crate::gpu::{ProgramSource, SampleKind, SamplerDecl, TextureDimension, UniformDecl, UniformKind};
use crate::shader::fragments::{
    self, InputFeature, Slot, FRAGMENTS, INPUT_FRAGMENTS,
};
use crate::shader::key::{InputFeatures, ShaderKey};
use crate::shader::uniforms::interface_source;
use crate::shader::{ReplacementStage, ShaderReplacement};

const RAYCAST_TEMPLATE: &str = include_str!("../shaders/raycast.wgsl");
const UNIFORMS_MARKER: &str = "//VOLRAY::Uniforms::Dec";

/// Builder for the ray-casting program of one [`ShaderKey`].
#[derive(Debug)]
pub struct ShaderBuilder<'a> {
    key: &'a ShaderKey,
    replacements: Vec<ShaderReplacement>,
    label: Option<String>,
}

impl<'a> ShaderBuilder<'a> {
    /// Creates a builder for `key`.
    #[must_use]
    pub fn new(key: &'a ShaderKey) -> Self {
        Self {
            key,
            replacements: Vec::new(),
            label: None,
        }
    }

    /// Adds user replacements, applied in order.
    #[must_use]
    pub fn with_replacements(
        mut self,
        replacements: impl IntoIterator<Item = ShaderReplacement>,
    ) -> Self {
        self.replacements.extend(replacements);
        self
    }

    /// Sets the program label for debugging.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Assembles the program.
    pub fn build(self) -> ProgramSource {
        let key = self.key;
        let mut source = RAYCAST_TEMPLATE.to_string();
        self.apply_stage(&mut source, ReplacementStage::Template);

        for slot in Slot::ALL {
            let text = slot_source(key, slot);
            source = source.replacen(slot.marker(), text.trim_end_matches('\n'), 1);
        }

        let (uniforms, samplers) = declarations(key);
        source = source.replacen(UNIFORMS_MARKER, &interface_source(&uniforms, &samplers), 1);

        self.apply_stage(&mut source, ReplacementStage::Assembled);

        ProgramSource {
            label: self
                .label
                .unwrap_or_else(|| format!("raycast [{}]", key.describe())),
            source,
            uniforms,
            samplers,
        }
    }

    fn apply_stage(&self, source: &mut String, stage: ReplacementStage) {
        for replacement in self.replacements.iter().filter(|r| r.stage == stage) {
            if !replacement.apply(source) {
                log::debug!(
                    "shader replacement '{}' matched nothing",
                    replacement.original
                );
            }
        }
    }
}

/// Uniforms and textures of the program for `key`, program-wide first.
pub fn declarations(key: &ShaderKey) -> (Vec<UniformDecl>, Vec<SamplerDecl>) {
    let (mut uniforms, mut samplers) = fragments::global_interface(key);
    for input in &key.inputs {
        uniforms.extend(fragments::input_uniforms(input));
        samplers.extend(fragments::input_samplers(input));
    }
    (uniforms, samplers)
}

fn slot_source(key: &ShaderKey, slot: Slot) -> String {
    let first = key.inputs.first().map_or("", |i| i.tag.as_str());
    let contours = key.iso_contours.max(1).to_string();
    let mut out = String::new();
    for fragment in FRAGMENTS
        .iter()
        .filter(|f| f.slot == slot && f.feature.enabled(key))
    {
        out.push_str(
            &fragment
                .source
                .replace("{first}", first)
                .replace("{contours}", &contours),
        );
    }

    for (index, input) in key.inputs.iter().enumerate() {
        let rows = input_rows(key, input, index, slot);
        match slot {
            Slot::Samples if !rows.is_empty() => {
                out.push_str(&format!(
                    "        {{\n            let tp = (u.{tag}_world_to_tex * vec4<f32>(pos, 1.0)).xyz;\n            if (all(tp >= u.{tag}_tex_min.xyz) && all(tp <= u.{tag}_tex_max.xyz)) {{\n{rows}            }}\n        }}\n",
                    tag = input.tag
                ));
            }
            Slot::ComputeDec => {
                out.push_str(&rows);
                out.push_str(&fragments::classify_source(input));
            }
            _ => out.push_str(&rows),
        }
    }
    out
}

fn input_rows(key: &ShaderKey, input: &InputFeatures, index: usize, slot: Slot) -> String {
    let m = fragments::measure_component(input).to_string();
    let mut out = String::new();
    for fragment in INPUT_FRAGMENTS
        .iter()
        .filter(|f| f.slot == slot && f.feature.enabled(key, input, index))
    {
        let text = if fragment.feature == InputFeature::LabelMap {
            fragments::label_map_source(input, key.label_map_tables)
        } else {
            fragment.source.to_string()
        };
        out.push_str(&text.replace("{tag}", &input.tag).replace("{m}", &m));
    }
    out
}

/// Program that draws a reduced-resolution image onto the frame.
pub fn build_composite_program() -> ProgramSource {
    let uniforms = vec![UniformDecl {
        name: "source_region".into(),
        kind: UniformKind::Vec4,
        count: None,
    }];
    let samplers = vec![SamplerDecl {
        name: "source".into(),
        dimension: TextureDimension::D2,
        sample: SampleKind::Filterable,
    }];
    let source = include_str!("../shaders/composite.wgsl")
        .replacen(UNIFORMS_MARKER, &interface_source(&uniforms, &samplers), 1);
    ProgramSource {
        label: "image sample composite".into(),
        source,
        uniforms,
        samplers,
    }
}

/// Program that rasterizes the depth-pass contour mesh.
pub fn build_depth_contour_program() -> ProgramSource {
    let uniforms = vec![UniformDecl {
        name: "model_view_projection".into(),
        kind: UniformKind::Mat4,
        count: None,
    }];
    let source = include_str!("../shaders/depth_contour.wgsl")
        .replacen(UNIFORMS_MARKER, &interface_source(&uniforms, &[]), 1);
    ProgramSource {
        label: "depth pass contours".into(),
        source,
        uniforms,
        samplers: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volray_core::{BlendMode, ComponentMode, LightComplexity, MaskType, SelectionPass};

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

    fn single() -> ShaderKey {
        ShaderKey {
            inputs: vec![input("v0g0")],
            ..ShaderKey::default()
        }
    }

    #[test]
    fn test_all_markers_are_substituted() {
        let program = ShaderBuilder::new(&single()).build();
        assert!(!program.source.contains("//VOLRAY::"));
        assert!(!program.source.contains("{tag}"));
        assert!(program.source.contains("fn v0g0_classify("));
        assert!(program.source.contains("struct Uniforms"));
        assert!(program.label.contains("composite"));
    }

    #[test]
    fn test_features_add_their_fragments() {
        let plain = ShaderBuilder::new(&single()).build();
        assert!(!plain.source.contains("cropping_regions"));

        let cropped = ShaderBuilder::new(&ShaderKey {
            cropping: true,
            ..single()
        })
        .build();
        assert!(cropped.source.contains("u.cropping_regions[region + 1]"));
        assert!(cropped.source.contains("u.v0g0_world_to_dataset"));
        assert!(cropped.uniforms.iter().any(|u| u.name == "cropping_planes"));
        assert_ne!(plain.source, cropped.source);
    }

    #[test]
    fn test_parallel_projection_uses_view_direction() {
        let key = ShaderKey {
            parallel_projection: true,
            ..single()
        };
        let source = ShaderBuilder::new(&key).build().source;
        assert!(source.contains("normalize(u.camera_direction.xyz)"));
        assert!(!source.contains("world - u.camera_position.xyz"));
    }

    #[test]
    fn test_multi_volume_samples_every_input() {
        let key = ShaderKey {
            inputs: vec![input("v0g0"), input("v1g0")],
            ..ShaderKey::default()
        };
        let program = ShaderBuilder::new(&key).build();
        assert!(program.source.contains("v0g0_fetch(tp)"));
        assert!(program.source.contains("v1g0_fetch(tp)"));
        let volumes: Vec<_> = program
            .samplers
            .iter()
            .filter(|s| s.name.ends_with("_volume"))
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(volumes, ["v0g0_volume", "v1g0_volume"]);
    }

    #[test]
    fn test_shading_follows_light_complexity() {
        let mut shaded = input("v0g0");
        shaded.shade = true;
        shaded.gradients = true;
        let key = ShaderKey {
            inputs: vec![shaded],
            light_complexity: LightComplexity::Positional,
            num_lights: 2,
            ..ShaderKey::default()
        };
        let program = ShaderBuilder::new(&key).build();
        assert!(program.source.contains("fn shade("));
        assert!(program.source.contains("u.light_cone[i]"));
        assert!(program.source.contains("v0g0_normal(g)"));
        assert!(program.uniforms.iter().any(|u| u.name == "light_position"));

        let headlight = ShaderKey {
            light_complexity: LightComplexity::Headlight,
            ..key
        };
        let source = ShaderBuilder::new(&headlight).build().source;
        assert!(source.contains("abs(dot(normal, -ray_dir))"));
        assert!(!source.contains("light_cone"));
    }

    #[test]
    fn test_blend_modes_select_accumulation() {
        let mip = ShaderKey {
            blend_mode: BlendMode::MaximumIntensity,
            ..single()
        };
        let source = ShaderBuilder::new(&mip).build().source;
        assert!(source.contains("return a > b;"));
        assert!(source.contains("v0g0_extreme_scalar"));
        assert!(!source.contains("OPACITY_THRESHOLD) {"));

        let iso = ShaderKey {
            blend_mode: BlendMode::Isosurface,
            iso_contours: 3,
            ..single()
        };
        let program = ShaderBuilder::new(&iso).build();
        assert!(program.source.contains("const NUM_CONTOURS: i32 = 3;"));
        let iso_values = program
            .uniforms
            .iter()
            .find(|u| u.name == "iso_values")
            .map(|u| u.count);
        assert_eq!(iso_values, Some(Some(3)));
    }

    #[test]
    fn test_picking_passes() {
        let actor = ShaderKey {
            picking: SelectionPass::ActorId,
            ..single()
        };
        let source = ShaderBuilder::new(&actor).build().source;
        assert!(source.contains("color = u.pick_prop_color;"));

        let high = ShaderKey {
            picking: SelectionPass::CellIdHigh24,
            ..single()
        };
        let source = ShaderBuilder::new(&high).build().source;
        assert!(source.contains("picked_id >> 24u"));
        assert!(source.contains("var picked = false;"));
    }

    #[test]
    fn test_label_map_only_on_first_input() {
        let key = ShaderKey {
            inputs: vec![input("v0g0")],
            mask: Some(MaskType::LabelMap),
            label_map_tables: 3,
            ..ShaderKey::default()
        };
        let source = ShaderBuilder::new(&key).build().source;
        assert!(source.contains("if (label == 3)"));
        assert!(source.contains("fn mask_value("));
        assert!(!source.contains("if (mask_value(pos) <= 0.0)"));
    }

    #[test]
    fn test_replacements_by_stage() {
        let key = single();
        let program = ShaderBuilder::new(&key)
            .with_replacements([
                ShaderReplacement::new(
                    "//VOLRAY::Shading::Exit",
                    "    color = vec4<f32>(color.rgb, 1.0);\n//VOLRAY::Shading::Exit",
                ),
                ShaderReplacement::new("MAX_STEPS", "MAX_MARCH").with_replace_all().after_assembly(),
            ])
            .build();
        assert!(program.source.contains("color = vec4<f32>(color.rgb, 1.0);"));
        assert!(program.source.contains("const MAX_MARCH"));
        assert!(!program.source.contains("MAX_STEPS"));
    }

    #[test]
    fn test_render_to_image_outputs() {
        let key = ShaderKey {
            render_to_image: true,
            ..single()
        };
        let source = ShaderBuilder::new(&key).build().source;
        assert!(source.contains("@builtin(frag_depth) frag_depth: f32,"));
        assert!(source.contains("out.frag_depth = z;"));
    }

    #[test]
    fn test_auxiliary_programs() {
        let composite = build_composite_program();
        assert!(composite.source.contains("var source: texture_2d<f32>;"));
        assert!(composite.source.contains("source_region: vec4<f32>,"));
        let contour = build_depth_contour_program();
        assert!(contour.source.contains("model_view_projection: mat4x4<f32>,"));
        assert!(contour.samplers.is_empty());
    }
}
