//! Source fragments of the ray-casting program.
//!
//! Each row of [`FRAGMENTS`] maps a feature and a template slot to a snippet.
//! Rows are independent: a feature contributes to every slot it needs and no
//! snippet knows which other features are enabled, so the number of snippets
//! grows with the number of features, not with their combinations.
//!
//! Per-input rows use `{tag}` for the input's name prefix and `{m}` for the
//! component that drives single-value blend modes. Global rows may use
//! `{first}` (tag of the first input), `{contours}` and `{labels}`.

use std::fmt::Write as _;

use volray_core::{BlendMode, ComponentMode, LightComplexity, MaskType, SelectionPass};
use volray_core::{MAX_CLIPPING_PLANES, MAX_COMPONENTS, MAX_LIGHTS};

use crate::gpu::{SampleKind, SamplerDecl, TextureDimension, UniformDecl, UniformKind};
use crate::shader::key::{InputFeatures, ShaderKey};

/// A substitution point of the template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    BaseDec,
    BaseVertex,
    BaseInit,
    BaseExit,
    TerminationDec,
    TerminationInit,
    TerminationImpl,
    CroppingDec,
    CroppingInit,
    CroppingImpl,
    ClippingDec,
    ClippingInit,
    ClippingImpl,
    MaskDec,
    MaskImpl,
    ShadingDec,
    ShadingInit,
    ShadingExit,
    ComputeDec,
    PickingDec,
    PickingInit,
    PickingExit,
    RenderToImageDec,
    RenderToImageOutputs,
    RenderToImageInit,
    RenderToImageExit,
    /// Per-input sampling, inside the march loop.
    Samples,
}

impl Slot {
    /// Every slot, in the order they are substituted.
    pub const ALL: [Slot; 27] = [
        Slot::BaseDec,
        Slot::BaseVertex,
        Slot::BaseInit,
        Slot::BaseExit,
        Slot::TerminationDec,
        Slot::TerminationInit,
        Slot::TerminationImpl,
        Slot::CroppingDec,
        Slot::CroppingInit,
        Slot::CroppingImpl,
        Slot::ClippingDec,
        Slot::ClippingInit,
        Slot::ClippingImpl,
        Slot::MaskDec,
        Slot::MaskImpl,
        Slot::ShadingDec,
        Slot::ShadingInit,
        Slot::ShadingExit,
        Slot::ComputeDec,
        Slot::PickingDec,
        Slot::PickingInit,
        Slot::PickingExit,
        Slot::RenderToImageDec,
        Slot::RenderToImageOutputs,
        Slot::RenderToImageInit,
        Slot::RenderToImageExit,
        Slot::Samples,
    ];

    /// The template line this slot replaces.
    pub fn marker(self) -> &'static str {
        match self {
            Slot::BaseDec => "//VOLRAY::Base::Dec",
            Slot::BaseVertex => "//VOLRAY::Base::Vertex",
            Slot::BaseInit => "//VOLRAY::Base::Init",
            Slot::BaseExit => "//VOLRAY::Base::Exit",
            Slot::TerminationDec => "//VOLRAY::Termination::Dec",
            Slot::TerminationInit => "//VOLRAY::Termination::Init",
            Slot::TerminationImpl => "//VOLRAY::Termination::Impl",
            Slot::CroppingDec => "//VOLRAY::Cropping::Dec",
            Slot::CroppingInit => "//VOLRAY::Cropping::Init",
            Slot::CroppingImpl => "//VOLRAY::Cropping::Impl",
            Slot::ClippingDec => "//VOLRAY::Clipping::Dec",
            Slot::ClippingInit => "//VOLRAY::Clipping::Init",
            Slot::ClippingImpl => "//VOLRAY::Clipping::Impl",
            Slot::MaskDec => "//VOLRAY::Mask::Dec",
            Slot::MaskImpl => "//VOLRAY::Mask::Impl",
            Slot::ShadingDec => "//VOLRAY::Shading::Dec",
            Slot::ShadingInit => "//VOLRAY::Shading::Init",
            Slot::ShadingExit => "//VOLRAY::Shading::Exit",
            Slot::ComputeDec => "//VOLRAY::Compute::Dec",
            Slot::PickingDec => "//VOLRAY::Picking::Dec",
            Slot::PickingInit => "//VOLRAY::Picking::Init",
            Slot::PickingExit => "//VOLRAY::Picking::Exit",
            Slot::RenderToImageDec => "//VOLRAY::RenderToImage::Dec",
            Slot::RenderToImageOutputs => "//VOLRAY::RenderToImage::Outputs",
            Slot::RenderToImageInit => "//VOLRAY::RenderToImage::Init",
            Slot::RenderToImageExit => "//VOLRAY::RenderToImage::Exit",
            Slot::Samples => "//VOLRAY::Samples",
        }
    }
}

/// A program-wide feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Always,
    Perspective,
    Parallel,
    Blend(BlendMode),
    /// Blend modes that stop once the ray is opaque.
    OpacityTermination,
    Gradients,
    Cropping,
    Clipping,
    /// Clipped samples are skipped rather than replaced.
    ClippingSkips,
    ClippedVoxelIntensity,
    Lighting(LightComplexity),
    Mask,
    BinaryMask,
    Picking(SelectionPass),
    CellPicking,
    RenderToImage,
    DepthPass,
    SceneDepth,
    Jittering,
}

impl Feature {
    /// True if the feature is part of `key`.
    pub fn enabled(self, key: &ShaderKey) -> bool {
        match self {
            Feature::Always => true,
            Feature::Perspective => !key.parallel_projection,
            Feature::Parallel => key.parallel_projection,
            Feature::Blend(mode) => key.blend_mode == mode,
            Feature::OpacityTermination => {
                matches!(key.blend_mode, BlendMode::Composite | BlendMode::Isosurface)
            }
            Feature::Gradients => key.inputs.iter().any(|i| i.gradients),
            Feature::Cropping => key.cropping,
            Feature::Clipping => key.clipping,
            Feature::ClippingSkips => key.clipping && !key.clipped_voxel_intensity,
            Feature::ClippedVoxelIntensity => key.clipping && key.clipped_voxel_intensity,
            Feature::Lighting(level) => key.shading() && key.light_complexity == level,
            Feature::Mask => key.mask.is_some(),
            Feature::BinaryMask => key.mask == Some(MaskType::Binary),
            Feature::Picking(pass) => key.picking == pass,
            Feature::CellPicking => matches!(
                key.picking,
                SelectionPass::CellIdLow24 | SelectionPass::CellIdHigh24
            ),
            Feature::RenderToImage => key.render_to_image,
            Feature::DepthPass => key.depth_pass,
            Feature::SceneDepth => key.scene_depth,
            Feature::Jittering => key.jittering,
        }
    }
}

/// One snippet of the program.
#[derive(Debug, Clone, Copy)]
pub struct Fragment {
    pub feature: Feature,
    pub slot: Slot,
    pub source: &'static str,
}

const fn frag(feature: Feature, slot: Slot, source: &'static str) -> Fragment {
    Fragment {
        feature,
        slot,
        source,
    }
}

/// Program-wide snippets, in emission order within each slot.
pub static FRAGMENTS: &[Fragment] = &[
    frag(
        Feature::Always,
        Slot::BaseDec,
        "const MAX_STEPS: i32 = 16384;\nconst OPACITY_THRESHOLD: f32 = 0.99;\n",
    ),
    frag(
        Feature::Perspective,
        Slot::BaseDec,
        "fn ray_direction(world: vec3<f32>) -> vec3<f32> {
    return normalize(world - u.camera_position.xyz);
}
",
    ),
    frag(
        Feature::Parallel,
        Slot::BaseDec,
        "fn ray_direction(world: vec3<f32>) -> vec3<f32> {
    return normalize(u.camera_direction.xyz);
}
",
    ),
    frag(
        Feature::Gradients,
        Slot::BaseDec,
        "struct Gradient {
    dx: vec4<f32>,
    dy: vec4<f32>,
    dz: vec4<f32>,
}

fn gradient_magnitudes(g: Gradient) -> vec4<f32> {
    return sqrt(g.dx * g.dx + g.dy * g.dy + g.dz * g.dz);
}
",
    ),
    frag(
        Feature::Blend(BlendMode::MaximumIntensity),
        Slot::BaseDec,
        "const EXTREME_START: f32 = -3.0e38;

fn extreme_better(a: f32, b: f32) -> bool {
    return a > b;
}
",
    ),
    frag(
        Feature::Blend(BlendMode::MinimumIntensity),
        Slot::BaseDec,
        "const EXTREME_START: f32 = 3.0e38;

fn extreme_better(a: f32, b: f32) -> bool {
    return a < b;
}
",
    ),
    frag(
        Feature::Blend(BlendMode::Isosurface),
        Slot::BaseDec,
        "const NUM_CONTOURS: i32 = {contours};\n",
    ),
    // Ray bounds
    frag(
        Feature::SceneDepth,
        Slot::TerminationInit,
        "    {
        let texel = depth_texel(in.clip_position.xy, textureDimensions(scene_depth), u.depth_scale.x);
        let d = textureLoad(scene_depth, texel, 0);
        if (d < 1.0) {
            march_end = min(march_end, depth_to_t(in.clip_position.xy, d, ray));
        }
    }
",
    ),
    frag(
        Feature::DepthPass,
        Slot::TerminationInit,
        "    {
        let texel = depth_texel(in.clip_position.xy, textureDimensions(depth_pass_depth), 1.0);
        let d = textureLoad(depth_pass_depth, texel, 0);
        if (d < 1.0) {
            ray.t_start = max(ray.t_start, depth_to_t(in.clip_position.xy, d, ray));
        }
    }
",
    ),
    frag(
        Feature::Jittering,
        Slot::TerminationInit,
        "    {
        let size = vec2<i32>(textureDimensions(noise));
        let jitter = textureLoad(noise, vec2<i32>(in.clip_position.xy) % size, 0).r;
        ray.t_start = ray.t_start + jitter * u.sample_distance.x;
    }
",
    ),
    frag(
        Feature::Blend(BlendMode::Slice),
        Slot::TerminationInit,
        "    march_end = -1.0;\n",
    ),
    frag(
        Feature::RenderToImage,
        Slot::TerminationImpl,
        "        if (first_hit < 0.0 && color.a > 0.0) {
            first_hit = t;
        }
",
    ),
    frag(
        Feature::OpacityTermination,
        Slot::TerminationImpl,
        "        if (color.a >= OPACITY_THRESHOLD) {
            break;
        }
",
    ),
    frag(
        Feature::CellPicking,
        Slot::TerminationImpl,
        "        if (picked) {
            break;
        }
",
    ),
    // Cropping, in the first input's dataset coordinates
    frag(
        Feature::Cropping,
        Slot::CroppingImpl,
        "        {
            let dp = (u.{first}_world_to_dataset * vec4<f32>(pos, 1.0)).xyz;
            let lo = vec3<f32>(u.cropping_planes[0].x, u.cropping_planes[0].z, u.cropping_planes[1].x);
            let hi = vec3<f32>(u.cropping_planes[0].y, u.cropping_planes[0].w, u.cropping_planes[1].y);
            let bin = vec3<i32>(step(lo, dp) + step(hi, dp));
            let region = bin.x + 3 * bin.y + 9 * bin.z;
            if (u.cropping_regions[region + 1].x < 0.5) {
                skip = true;
            }
        }
",
    ),
    // Clipping planes in world coordinates
    frag(
        Feature::Clipping,
        Slot::ClippingImpl,
        "        for (var i = 0; i < i32(u.clip_count.x); i = i + 1) {
            if (dot(pos - u.clip_planes[2 * i].xyz, u.clip_planes[2 * i + 1].xyz) < 0.0) {
                clipped = true;
            }
        }
",
    ),
    frag(
        Feature::ClippingSkips,
        Slot::ClippingImpl,
        "        skip = skip || clipped;\n",
    ),
    // Masking
    frag(
        Feature::Mask,
        Slot::MaskDec,
        "fn mask_value(pos: vec3<f32>) -> f32 {
    let mtp = (u.mask_world_to_tex * vec4<f32>(pos, 1.0)).xyz;
    if (any(mtp < vec3<f32>(0.0)) || any(mtp > vec3<f32>(1.0))) {
        return 0.0;
    }
    return textureSampleLevel(mask_volume, mask_volume_s, mtp, 0.0).r * u.mask_scale_bias.x
        + u.mask_scale_bias.y;
}
",
    ),
    frag(
        Feature::BinaryMask,
        Slot::MaskImpl,
        "        if (mask_value(pos) <= 0.0) {
            skip = true;
        }
",
    ),
    // Lighting
    frag(
        Feature::Lighting(LightComplexity::Headlight),
        Slot::ShadingDec,
        "fn shade(rgb: vec3<f32>, normal: vec3<f32>, ray_dir: vec3<f32>, pos: vec3<f32>, k: vec4<f32>) -> vec3<f32> {
    let ndl = abs(dot(normal, -ray_dir));
    let specular = select(0.0, pow(ndl, k.w), ndl > 0.0);
    return rgb * (k.x + k.y * ndl) + vec3<f32>(k.z * specular);
}
",
    ),
    frag(
        Feature::Lighting(LightComplexity::Directional),
        Slot::ShadingDec,
        "fn shade(rgb: vec3<f32>, normal: vec3<f32>, ray_dir: vec3<f32>, pos: vec3<f32>, k: vec4<f32>) -> vec3<f32> {
    var n = (u.view_matrix * vec4<f32>(normal, 0.0)).xyz;
    let v = -(u.view_matrix * vec4<f32>(ray_dir, 0.0)).xyz;
    if (dot(n, v) < 0.0) {
        n = -n;
    }
    var ambient = vec3<f32>(0.0);
    var diffuse = vec3<f32>(0.0);
    var specular = vec3<f32>(0.0);
    for (var i = 0; i < i32(u.light_count.x); i = i + 1) {
        let l = -u.light_direction[i].xyz;
        ambient = ambient + u.light_ambient[i].rgb;
        let ndl = dot(n, l);
        if (ndl > 0.0) {
            diffuse = diffuse + ndl * u.light_diffuse[i].rgb;
            let ndh = max(dot(n, normalize(l + v)), 0.0);
            specular = specular + pow(ndh, k.w) * u.light_specular[i].rgb;
        }
    }
    return rgb * (k.x + ambient + k.y * diffuse) + k.z * specular;
}
",
    ),
    frag(
        Feature::Lighting(LightComplexity::Positional),
        Slot::ShadingDec,
        "fn shade(rgb: vec3<f32>, normal: vec3<f32>, ray_dir: vec3<f32>, pos: vec3<f32>, k: vec4<f32>) -> vec3<f32> {
    var n = (u.view_matrix * vec4<f32>(normal, 0.0)).xyz;
    let v = -(u.view_matrix * vec4<f32>(ray_dir, 0.0)).xyz;
    let p = (u.view_matrix * vec4<f32>(pos, 1.0)).xyz;
    if (dot(n, v) < 0.0) {
        n = -n;
    }
    var ambient = vec3<f32>(0.0);
    var diffuse = vec3<f32>(0.0);
    var specular = vec3<f32>(0.0);
    for (var i = 0; i < i32(u.light_count.x); i = i + 1) {
        var l = -u.light_direction[i].xyz;
        var attenuation = 1.0;
        ambient = ambient + u.light_ambient[i].rgb;
        if (u.light_cone[i].z > 0.5) {
            let to_light = u.light_position[i].xyz - p;
            let distance = length(to_light);
            l = to_light / max(distance, 1e-8);
            let a = u.light_attenuation[i].xyz;
            attenuation = 1.0 / max(a.x + a.y * distance + a.z * distance * distance, 1e-8);
            if (u.light_cone[i].x > -1.0) {
                let cos_angle = dot(-l, normalize(u.light_direction[i].xyz));
                if (cos_angle < u.light_cone[i].x) {
                    attenuation = 0.0;
                } else {
                    attenuation = attenuation * pow(cos_angle, u.light_cone[i].y);
                }
            }
        }
        let ndl = dot(n, l);
        if (ndl > 0.0) {
            diffuse = diffuse + attenuation * ndl * u.light_diffuse[i].rgb;
            let ndh = max(dot(n, normalize(l + v)), 0.0);
            specular = specular + attenuation * pow(ndh, k.w) * u.light_specular[i].rgb;
        }
    }
    return rgb * (k.x + ambient + k.y * diffuse) + k.z * specular;
}
",
    ),
    // Picking
    frag(
        Feature::CellPicking,
        Slot::PickingInit,
        "    var picked = false;\n    var picked_id = 0u;\n",
    ),
    frag(
        Feature::Picking(SelectionPass::ActorId),
        Slot::PickingExit,
        "    if (color.a <= 0.0) {
        discard;
    }
    color = u.pick_prop_color;
",
    ),
    frag(
        Feature::Picking(SelectionPass::CellIdLow24),
        Slot::PickingExit,
        "    if (!picked) {
        discard;
    }
    let pick_value = picked_id & 0xFFFFFFu;
    color = vec4<f32>(vec3<f32>(vec3<u32>(pick_value >> 16u, pick_value >> 8u, pick_value) & vec3<u32>(255u)) / 255.0, 1.0);
",
    ),
    frag(
        Feature::Picking(SelectionPass::CellIdHigh24),
        Slot::PickingExit,
        "    if (!picked) {
        discard;
    }
    let pick_value = picked_id >> 24u;
    color = vec4<f32>(vec3<f32>(vec3<u32>(pick_value >> 16u, pick_value >> 8u, pick_value) & vec3<u32>(255u)) / 255.0, 1.0);
",
    ),
    // Render to image
    frag(
        Feature::RenderToImage,
        Slot::RenderToImageOutputs,
        "    @location(1) depth_image: vec4<f32>,\n    @builtin(frag_depth) frag_depth: f32,\n",
    ),
    frag(
        Feature::RenderToImage,
        Slot::RenderToImageInit,
        "    var first_hit = -1.0;\n",
    ),
    frag(
        Feature::RenderToImage,
        Slot::RenderToImageExit,
        "    var depth_t = first_hit;
    if (depth_t < 0.0 && u.clamp_to_backface.x > 0.5) {
        depth_t = ray.t_end;
    }
    var z = 1.0;
    if (depth_t >= 0.0) {
        let clip = u.view_projection * vec4<f32>(ray.origin + ray.dir * depth_t, 1.0);
        z = clamp(clip.z / clip.w, 0.0, 1.0);
    }
    out.depth_image = vec4<f32>(z, 0.0, 0.0, 1.0);
    out.frag_depth = z;
",
    ),
];

/// Uniforms and textures a program-wide feature declares.
#[derive(Debug, Clone, Copy)]
pub struct FeatureInterface {
    pub feature: Feature,
    pub uniforms: &'static [(&'static str, UniformKind, Option<usize>)],
    pub textures: &'static [(&'static str, TextureDimension, SampleKind)],
}

const LIGHTS: Option<usize> = Some(MAX_LIGHTS);

/// Program-wide declarations. Sized arrays that depend on the key (contour
/// values, label tables) are added by the builder.
pub static INTERFACES: &[FeatureInterface] = &[
    FeatureInterface {
        feature: Feature::Always,
        uniforms: &[
            ("view_projection", UniformKind::Mat4, None),
            ("inv_view_projection", UniformKind::Mat4, None),
            ("view_matrix", UniformKind::Mat4, None),
            ("geometry_to_world", UniformKind::Mat4, None),
            ("camera_position", UniformKind::Vec4, None),
            ("camera_direction", UniformKind::Vec4, None),
            ("sample_distance", UniformKind::Scalar, None),
            ("final_color", UniformKind::Vec4, None),
            ("viewport", UniformKind::Vec4, None),
            ("depth_scale", UniformKind::Scalar, None),
        ],
        textures: &[],
    },
    FeatureInterface {
        feature: Feature::Cropping,
        uniforms: &[
            ("cropping_planes", UniformKind::Vec4, Some(2)),
            ("cropping_regions", UniformKind::Scalar, Some(32)),
        ],
        textures: &[],
    },
    FeatureInterface {
        feature: Feature::Clipping,
        uniforms: &[
            ("clip_count", UniformKind::Scalar, None),
            ("clip_planes", UniformKind::Vec4, Some(2 * MAX_CLIPPING_PLANES)),
        ],
        textures: &[],
    },
    FeatureInterface {
        feature: Feature::ClippedVoxelIntensity,
        uniforms: &[("clipped_voxel_intensity", UniformKind::Scalar, None)],
        textures: &[],
    },
    FeatureInterface {
        feature: Feature::Mask,
        uniforms: &[
            ("mask_world_to_tex", UniformKind::Mat4, None),
            ("mask_scale_bias", UniformKind::Vec4, None),
            ("mask_blend", UniformKind::Scalar, None),
        ],
        textures: &[("mask_volume", TextureDimension::D3, SampleKind::Filterable)],
    },
    FeatureInterface {
        feature: Feature::Lighting(LightComplexity::Directional),
        uniforms: &[
            ("light_count", UniformKind::Scalar, None),
            ("light_ambient", UniformKind::Vec4, LIGHTS),
            ("light_diffuse", UniformKind::Vec4, LIGHTS),
            ("light_specular", UniformKind::Vec4, LIGHTS),
            ("light_direction", UniformKind::Vec4, LIGHTS),
        ],
        textures: &[],
    },
    FeatureInterface {
        feature: Feature::Lighting(LightComplexity::Positional),
        uniforms: &[
            ("light_count", UniformKind::Scalar, None),
            ("light_ambient", UniformKind::Vec4, LIGHTS),
            ("light_diffuse", UniformKind::Vec4, LIGHTS),
            ("light_specular", UniformKind::Vec4, LIGHTS),
            ("light_direction", UniformKind::Vec4, LIGHTS),
            ("light_position", UniformKind::Vec4, LIGHTS),
            ("light_attenuation", UniformKind::Vec4, LIGHTS),
            ("light_cone", UniformKind::Vec4, LIGHTS),
        ],
        textures: &[],
    },
    FeatureInterface {
        feature: Feature::Picking(SelectionPass::ActorId),
        uniforms: &[("pick_prop_color", UniformKind::Vec4, None)],
        textures: &[],
    },
    FeatureInterface {
        feature: Feature::Blend(BlendMode::AverageIntensity),
        uniforms: &[("average_range", UniformKind::Vec4, None)],
        textures: &[],
    },
    FeatureInterface {
        feature: Feature::Blend(BlendMode::Slice),
        uniforms: &[
            ("slice_origin", UniformKind::Vec4, None),
            ("slice_normal", UniformKind::Vec4, None),
        ],
        textures: &[],
    },
    FeatureInterface {
        feature: Feature::RenderToImage,
        uniforms: &[("clamp_to_backface", UniformKind::Scalar, None)],
        textures: &[],
    },
    FeatureInterface {
        feature: Feature::SceneDepth,
        uniforms: &[],
        textures: &[("scene_depth", TextureDimension::D2, SampleKind::Depth)],
    },
    FeatureInterface {
        feature: Feature::DepthPass,
        uniforms: &[],
        textures: &[("depth_pass_depth", TextureDimension::D2, SampleKind::Depth)],
    },
    FeatureInterface {
        feature: Feature::Jittering,
        uniforms: &[],
        textures: &[("noise", TextureDimension::D2, SampleKind::Unfilterable)],
    },
];

/// A feature of one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputFeature {
    Always,
    Gradients,
    ClippedVoxelIntensity,
    /// Blend modes that classify every sample.
    ClassifyEachSample,
    Blend(BlendMode),
    /// Front-to-back compositing of `src`.
    Compositing,
    /// Single-value projections (maximum and minimum intensity).
    Extreme,
    Shading,
    LabelMap,
    CellPicking,
}

impl InputFeature {
    /// True if the feature applies to input `index` of `key`.
    pub fn enabled(self, key: &ShaderKey, input: &InputFeatures, index: usize) -> bool {
        match self {
            InputFeature::Always => true,
            InputFeature::Gradients => input.gradients,
            InputFeature::ClippedVoxelIntensity => key.clipping && key.clipped_voxel_intensity,
            InputFeature::ClassifyEachSample => {
                matches!(key.blend_mode, BlendMode::Composite | BlendMode::Additive)
                    || (key.blend_mode != BlendMode::Isosurface
                        && key.picking != SelectionPass::None)
            }
            InputFeature::Blend(mode) => key.blend_mode == mode,
            InputFeature::Compositing => {
                matches!(key.blend_mode, BlendMode::Composite | BlendMode::Isosurface)
            }
            InputFeature::Extreme => matches!(
                key.blend_mode,
                BlendMode::MaximumIntensity | BlendMode::MinimumIntensity
            ),
            InputFeature::Shading => {
                input.shade
                    && input.gradients
                    && key.light_complexity != LightComplexity::None
                    && matches!(key.blend_mode, BlendMode::Composite | BlendMode::Isosurface)
            }
            InputFeature::LabelMap => {
                index == 0
                    && key.mask == Some(MaskType::LabelMap)
                    && key.label_map_tables > 0
                    && (matches!(key.blend_mode, BlendMode::Composite | BlendMode::Isosurface))
            }
            InputFeature::CellPicking => Feature::CellPicking.enabled(key),
        }
    }
}

/// One per-input snippet.
#[derive(Debug, Clone, Copy)]
pub struct InputFragment {
    pub feature: InputFeature,
    pub slot: Slot,
    pub source: &'static str,
}

const fn input_frag(feature: InputFeature, slot: Slot, source: &'static str) -> InputFragment {
    InputFragment {
        feature,
        slot,
        source,
    }
}

/// Per-input snippets, in emission order within each slot. `Samples` rows
/// run inside a block where `tp` is the sample's texture coordinate and the
/// sample lies inside the input's current brick.
pub static INPUT_FRAGMENTS: &[InputFragment] = &[
    input_frag(
        InputFeature::Always,
        Slot::ComputeDec,
        "fn {tag}_fetch(tp: vec3<f32>) -> vec4<f32> {
    return textureSampleLevel({tag}_volume, {tag}_volume_s, tp, 0.0) * u.{tag}_scale + u.{tag}_bias;
}
",
    ),
    input_frag(
        InputFeature::Gradients,
        Slot::ComputeDec,
        "fn {tag}_gradient(tp: vec3<f32>) -> Gradient {
    let s = u.{tag}_cell_step.xyz;
    var g: Gradient;
    g.dx = ({tag}_fetch(tp + vec3<f32>(s.x, 0.0, 0.0)) - {tag}_fetch(tp - vec3<f32>(s.x, 0.0, 0.0))) * 0.5;
    g.dy = ({tag}_fetch(tp + vec3<f32>(0.0, s.y, 0.0)) - {tag}_fetch(tp - vec3<f32>(0.0, s.y, 0.0))) * 0.5;
    g.dz = ({tag}_fetch(tp + vec3<f32>(0.0, 0.0, s.z)) - {tag}_fetch(tp - vec3<f32>(0.0, 0.0, s.z))) * 0.5;
    return g;
}

fn {tag}_normal(g: Gradient) -> vec3<f32> {
    let s = u.{tag}_cell_step.xyz;
    let gt = vec3<f32>(g.dx[{m}] / s.x, g.dy[{m}] / s.y, g.dz[{m}] / s.z);
    let n = (transpose(u.{tag}_world_to_tex) * vec4<f32>(gt, 0.0)).xyz;
    let len = length(n);
    if (len < 1e-8) {
        return vec3<f32>(0.0);
    }
    return -n / len;
}
",
    ),
    // Ray extent through the input's brick
    input_frag(
        InputFeature::Always,
        Slot::BaseInit,
        "    {
        let o = (u.{tag}_world_to_tex * vec4<f32>(ray.origin, 1.0)).xyz;
        let d = (u.{tag}_world_to_tex * vec4<f32>(ray.dir, 0.0)).xyz;
        let span = slab(o, d, u.{tag}_tex_min.xyz, u.{tag}_tex_max.xyz);
        if (span.x <= span.y) {
            ray.t_end = max(ray.t_end, span.y);
        }
    }
",
    ),
    input_frag(
        InputFeature::Extreme,
        Slot::BaseInit,
        "    var {tag}_extreme = EXTREME_START;
    var {tag}_extreme_scalar = vec4<f32>(0.0);
    var {tag}_hit = false;
",
    ),
    input_frag(
        InputFeature::Blend(BlendMode::AverageIntensity),
        Slot::BaseInit,
        "    var {tag}_sum = 0.0;\n    var {tag}_count = 0.0;\n",
    ),
    input_frag(
        InputFeature::Blend(BlendMode::Additive),
        Slot::BaseInit,
        "    var {tag}_sum = 0.0;\n",
    ),
    input_frag(
        InputFeature::Blend(BlendMode::Isosurface),
        Slot::BaseInit,
        "    var {tag}_prev = 0.0;\n    var {tag}_has_prev = false;\n",
    ),
    // Sampling
    input_frag(
        InputFeature::Always,
        Slot::Samples,
        "                var scalar = {tag}_fetch(tp);
                var gmag = vec4<f32>(0.0);
",
    ),
    input_frag(
        InputFeature::ClippedVoxelIntensity,
        Slot::Samples,
        "                if (clipped) {
                    scalar = vec4<f32>(u.clipped_voxel_intensity.x);
                }
",
    ),
    input_frag(
        InputFeature::Gradients,
        Slot::Samples,
        "                let g = {tag}_gradient(tp);
                gmag = gradient_magnitudes(g);
",
    ),
    input_frag(
        InputFeature::ClassifyEachSample,
        Slot::Samples,
        "                var src = {tag}_classify(scalar, gmag);\n",
    ),
    input_frag(
        InputFeature::Blend(BlendMode::Isosurface),
        Slot::Samples,
        "                var src = vec4<f32>(0.0);
                let {tag}_m = scalar[{m}];
                if ({tag}_has_prev && {tag}_prev != {tag}_m) {
                    for (var i = 0; i < NUM_CONTOURS; i = i + 1) {
                        let iso = u.iso_values[i].x;
                        if (({tag}_prev - iso) * ({tag}_m - iso) <= 0.0) {
                            src = {tag}_classify(vec4<f32>(iso), gmag);
                            break;
                        }
                    }
                }
                {tag}_prev = {tag}_m;
                {tag}_has_prev = true;
",
    ),
    input_frag(InputFeature::LabelMap, Slot::Samples, "{label_map}"),
    input_frag(
        InputFeature::Shading,
        Slot::Samples,
        "                if (src.a > 0.0) {
                    src = vec4<f32>(shade(src.rgb, {tag}_normal(g), ray.dir, pos, u.{tag}_shading[{m}]), src.a);
                }
",
    ),
    input_frag(
        InputFeature::Compositing,
        Slot::Samples,
        "                if (src.a > 0.0) {
                    color = color + (1.0 - color.a) * vec4<f32>(src.rgb * src.a, src.a);
                }
",
    ),
    input_frag(
        InputFeature::Extreme,
        Slot::Samples,
        "                if (extreme_better(scalar[{m}], {tag}_extreme)) {
                    {tag}_extreme = scalar[{m}];
                    {tag}_extreme_scalar = scalar;
                    {tag}_hit = true;
                }
",
    ),
    input_frag(
        InputFeature::Blend(BlendMode::AverageIntensity),
        Slot::Samples,
        "                if (scalar[{m}] >= u.average_range.x && scalar[{m}] <= u.average_range.y) {
                    {tag}_sum = {tag}_sum + scalar[{m}];
                    {tag}_count = {tag}_count + 1.0;
                }
",
    ),
    input_frag(
        InputFeature::Blend(BlendMode::Additive),
        Slot::Samples,
        "                {
                    let r = u.{tag}_ranges[0];
                    let v = clamp((scalar[{m}] - r.z) / max(r.w - r.z, 1e-8), 0.0, 1.0);
                    {tag}_sum = {tag}_sum + src.a * v;
                }
",
    ),
    input_frag(
        InputFeature::CellPicking,
        Slot::Samples,
        "                if (!picked && src.a > 0.0) {
                    picked = true;
                    let dims = u.{tag}_volume_dims.xyz;
                    let cell = clamp(floor(tp * dims), vec3<f32>(0.0), dims - 1.0) + u.{tag}_voxel_offset.xyz;
                    let ijk = vec3<u32>(cell);
                    let full = vec3<u32>(u.{tag}_full_dims.xyz);
                    picked_id = ijk.x + full.x * (ijk.y + full.y * ijk.z);
                }
",
    ),
    // Results of single-value blend modes
    input_frag(
        InputFeature::Extreme,
        Slot::BaseExit,
        "    if ({tag}_hit) {
        let {tag}_c = {tag}_classify({tag}_extreme_scalar, vec4<f32>(0.0));
        color = max(color, vec4<f32>({tag}_c.rgb * {tag}_c.a, {tag}_c.a));
    }
",
    ),
    input_frag(
        InputFeature::Blend(BlendMode::AverageIntensity),
        Slot::BaseExit,
        "    if ({tag}_count > 0.0) {
        let {tag}_c = {tag}_classify(vec4<f32>({tag}_sum / {tag}_count), vec4<f32>(0.0));
        color = max(color, vec4<f32>({tag}_c.rgb * {tag}_c.a, {tag}_c.a));
    }
",
    ),
    input_frag(
        InputFeature::Blend(BlendMode::Additive),
        Slot::BaseExit,
        "    {
        let {tag}_a = clamp({tag}_sum * u.sample_distance.x, 0.0, 1.0);
        color = color + vec4<f32>(vec3<f32>({tag}_a), {tag}_a);
    }
",
    ),
    input_frag(
        InputFeature::Blend(BlendMode::Slice),
        Slot::BaseExit,
        "    {
        let denom = dot(ray.dir, u.slice_normal.xyz);
        if (abs(denom) > 1e-8) {
            let ts = dot(u.slice_origin.xyz - ray.origin, u.slice_normal.xyz) / denom;
            let tp = (u.{tag}_world_to_tex * vec4<f32>(ray.origin + ray.dir * ts, 1.0)).xyz;
            let inside = all(tp >= u.{tag}_tex_min.xyz) && all(tp <= u.{tag}_tex_max.xyz);
            if (ts >= ray.t_start && ts <= ray.t_end && inside) {
                let {tag}_c = {tag}_classify({tag}_fetch(tp), vec4<f32>(0.0));
                color = color + (1.0 - color.a) * vec4<f32>({tag}_c.rgb * {tag}_c.a, {tag}_c.a);
            }
        }
    }
",
    ),
];

/// Component that drives single-value blend modes and shading.
pub fn measure_component(input: &InputFeatures) -> usize {
    match input.mode {
        ComponentMode::Independent | ComponentMode::Invalid => 0,
        ComponentMode::LuminanceAlpha => input.components.saturating_sub(1),
        ComponentMode::Rgba => 3,
    }
}

/// Per-input uniforms, prefixed with the input's tag.
pub fn input_uniforms(input: &InputFeatures) -> Vec<UniformDecl> {
    const FIELDS: &[(&str, UniformKind, Option<usize>)] = &[
        ("world_to_tex", UniformKind::Mat4, None),
        ("world_to_dataset", UniformKind::Mat4, None),
        ("tex_min", UniformKind::Vec4, None),
        ("tex_max", UniformKind::Vec4, None),
        ("scale", UniformKind::Vec4, None),
        ("bias", UniformKind::Vec4, None),
        ("cell_step", UniformKind::Vec4, None),
        ("weights", UniformKind::Vec4, None),
        ("ranges", UniformKind::Vec4, Some(MAX_COMPONENTS)),
        ("grad_ranges", UniformKind::Vec4, Some(MAX_COMPONENTS)),
        ("shading", UniformKind::Vec4, Some(MAX_COMPONENTS)),
        ("volume_dims", UniformKind::Vec4, None),
        ("voxel_offset", UniformKind::Vec4, None),
        ("full_dims", UniformKind::Vec4, None),
    ];
    FIELDS
        .iter()
        .map(|&(name, kind, count)| UniformDecl {
            name: format!("{}_{name}", input.tag),
            kind,
            count,
        })
        .collect()
}

/// Per-input textures: the volume, then the tables each set samples.
pub fn input_samplers(input: &InputFeatures) -> Vec<SamplerDecl> {
    let filterable = |name: String, dimension| SamplerDecl {
        name,
        dimension,
        sample: SampleKind::Filterable,
    };
    let tag = &input.tag;
    let mut out = vec![filterable(format!("{tag}_volume"), TextureDimension::D3)];
    for set in 0..input.table_sets() {
        if input.transfer_2d.get(set).copied().unwrap_or(false) {
            out.push(filterable(format!("{tag}_tf2d_{set}"), TextureDimension::D2));
            continue;
        }
        if input.mode != ComponentMode::Rgba {
            out.push(filterable(format!("{tag}_color_{set}"), TextureDimension::D2));
        }
        out.push(filterable(format!("{tag}_opacity_{set}"), TextureDimension::D2));
        if input.gradient_opacity.get(set).copied().unwrap_or(false) {
            out.push(filterable(format!("{tag}_gradient_{set}"), TextureDimension::D2));
        }
    }
    out
}

/// Texture name of label color table `index` (1-based).
pub fn label_table_name(index: usize) -> String {
    format!("mask_label_{index}")
}

/// Program-wide uniforms and textures of `key`.
pub fn global_interface(key: &ShaderKey) -> (Vec<UniformDecl>, Vec<SamplerDecl>) {
    let mut uniforms = Vec::new();
    let mut samplers = Vec::new();
    for interface in INTERFACES.iter().filter(|i| i.feature.enabled(key)) {
        uniforms.extend(interface.uniforms.iter().map(|&(name, kind, count)| UniformDecl {
            name: name.to_string(),
            kind,
            count,
        }));
        samplers.extend(interface.textures.iter().map(|&(name, dimension, sample)| SamplerDecl {
            name: name.to_string(),
            dimension,
            sample,
        }));
    }
    if key.blend_mode == BlendMode::Isosurface {
        uniforms.push(UniformDecl {
            name: "iso_values".into(),
            kind: UniformKind::Scalar,
            count: Some(key.iso_contours.max(1)),
        });
    }
    if key.mask == Some(MaskType::LabelMap) {
        samplers.extend((1..=key.label_map_tables).map(|i| SamplerDecl {
            name: label_table_name(i),
            dimension: TextureDimension::D2,
            sample: SampleKind::Filterable,
        }));
    }
    (uniforms, samplers)
}

/// `{tag}_classify`: maps a sample and its gradient magnitudes to a
/// non-premultiplied color.
pub fn classify_source(input: &InputFeatures) -> String {
    let tag = &input.tag;
    let mut out = format!(
        "fn {tag}_classify(scalar: vec4<f32>, gmag: vec4<f32>) -> vec4<f32> {{\n"
    );
    match input.mode {
        ComponentMode::Independent | ComponentMode::Invalid => {
            out.push_str("    var rgb = vec3<f32>(0.0);\n    var alpha = 0.0;\n");
            for c in 0..input.table_sets() {
                out.push_str("    {\n");
                out.push_str(&component_lookup(input, c, c, c, None));
                let _ = writeln!(
                    out,
                    "        let w = u.{tag}_weights[{c}] * c_a;\n        rgb = rgb + w * c_rgb;\n        alpha = alpha + w;\n    }}"
                );
            }
            out.push_str(
                "    if (alpha > 0.0) {\n        rgb = rgb / alpha;\n    }\n    return vec4<f32>(rgb, clamp(alpha, 0.0, 1.0));\n}\n",
            );
        }
        ComponentMode::LuminanceAlpha => {
            let last = input.components.saturating_sub(1);
            out.push_str(&component_lookup(input, 0, 0, last, None));
            out.push_str("    return vec4<f32>(c_rgb, c_a);\n}\n");
        }
        ComponentMode::Rgba => {
            let rgb = format!("(scalar.rgb - u.{tag}_bias.rgb) / u.{tag}_scale.rgb");
            out.push_str(&component_lookup(input, 0, 0, 3, Some(&rgb)));
            out.push_str("    return vec4<f32>(clamp(c_rgb, vec3<f32>(0.0), vec3<f32>(1.0)), c_a);\n}\n");
        }
    }
    out
}

/// Declares `c_rgb` and `c_a` for table set `set`, indexing color with
/// component `color` and opacity with component `opacity`.
fn component_lookup(
    input: &InputFeatures,
    set: usize,
    color: usize,
    opacity: usize,
    direct_rgb: Option<&str>,
) -> String {
    let tag = &input.tag;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "        let r{set} = u.{tag}_ranges[{set}];\n        let gr{set} = u.{tag}_grad_ranges[{set}];"
    );
    let _ = writeln!(
        out,
        "        let ox = clamp((scalar[{opacity}] - r{set}.z) / max(r{set}.w - r{set}.z, 1e-8), 0.0, 1.0);"
    );
    let _ = writeln!(
        out,
        "        let gx = clamp((gmag[{opacity}] - gr{set}.x) / max(gr{set}.y - gr{set}.x, 1e-8), 0.0, 1.0);"
    );
    if input.transfer_2d.get(set).copied().unwrap_or(false) {
        let _ = writeln!(
            out,
            "        let t2 = textureSampleLevel({tag}_tf2d_{set}, {tag}_tf2d_{set}_s, vec2<f32>(ox, gx), 0.0);\n        let c_rgb = t2.rgb;\n        let c_a = t2.a;"
        );
        return out;
    }
    match direct_rgb {
        Some(expr) => {
            let _ = writeln!(out, "        let c_rgb = {expr};");
        }
        None => {
            let _ = writeln!(
                out,
                "        let cx = clamp((scalar[{color}] - r{set}.x) / max(r{set}.y - r{set}.x, 1e-8), 0.0, 1.0);\n        let c_rgb = textureSampleLevel({tag}_color_{set}, {tag}_color_{set}_s, vec2<f32>(cx, 0.5), 0.0).rgb;"
            );
        }
    }
    let _ = writeln!(
        out,
        "        var c_a = textureSampleLevel({tag}_opacity_{set}, {tag}_opacity_{set}_s, vec2<f32>(ox, 0.5), 0.0).r;"
    );
    if input.gradient_opacity.get(set).copied().unwrap_or(false) {
        let _ = writeln!(
            out,
            "        c_a = c_a * textureSampleLevel({tag}_gradient_{set}, {tag}_gradient_{set}_s, vec2<f32>(gx, 0.5), 0.0).r;"
        );
    }
    out
}

/// Label-map recoloring of the first input's sample: label `i` mixes the
/// color from table `i` in by the mask blend factor; label 0 is untouched.
pub fn label_map_source(input: &InputFeatures, tables: usize) -> String {
    let tag = &input.tag;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "                {{\n                    let label = i32(round(mask_value(pos)));\n                    let r = u.{tag}_ranges[0];\n                    let lx = clamp((scalar[0] - r.x) / max(r.y - r.x, 1e-8), 0.0, 1.0);"
    );
    for i in 1..=tables {
        let name = label_table_name(i);
        let _ = writeln!(
            out,
            "                    if (label == {i}) {{\n                        let lc = textureSampleLevel({name}, {name}_s, vec2<f32>(lx, 0.5), 0.0).rgb;\n                        src = vec4<f32>(mix(src.rgb, lc, u.mask_blend.x), src.a);\n                    }}"
        );
    }
    out.push_str("                }\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markers_are_unique() {
        let mut markers: Vec<_> = Slot::ALL.iter().map(|s| s.marker()).collect();
        markers.sort_unstable();
        markers.dedup();
        assert_eq!(markers.len(), Slot::ALL.len());
    }

    #[test]
    fn test_every_slot_is_in_the_template() {
        let template = include_str!("../shaders/raycast.wgsl");
        for slot in Slot::ALL {
            assert!(template.contains(slot.marker()), "{slot:?}");
        }
    }

    #[test]
    fn test_projection_rows_are_exclusive() {
        let key = ShaderKey::default();
        let rows = FRAGMENTS
            .iter()
            .filter(|f| f.source.contains("fn ray_direction") && f.feature.enabled(&key))
            .count();
        assert_eq!(rows, 1);
        let parallel = ShaderKey {
            parallel_projection: true,
            ..key
        };
        assert!(Feature::Parallel.enabled(&parallel));
        assert!(!Feature::Perspective.enabled(&parallel));
    }

    fn scalar_input(mode: ComponentMode, components: usize) -> InputFeatures {
        let sets = mode.table_sets(components);
        InputFeatures {
            tag: "v0g0".into(),
            components,
            mode,
            transfer_2d: vec![false; sets],
            gradient_opacity: vec![false; sets],
            gradients: false,
            shade: false,
        }
    }

    #[test]
    fn test_samplers_follow_table_usage() {
        let mut input = scalar_input(ComponentMode::Independent, 2);
        input.transfer_2d[1] = true;
        input.gradient_opacity[0] = true;
        let names: Vec<_> = input_samplers(&input).into_iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            [
                "v0g0_volume",
                "v0g0_color_0",
                "v0g0_opacity_0",
                "v0g0_gradient_0",
                "v0g0_tf2d_1"
            ]
        );

        let rgba = scalar_input(ComponentMode::Rgba, 4);
        let names: Vec<_> = input_samplers(&rgba).into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["v0g0_volume", "v0g0_opacity_0"]);
    }

    #[test]
    fn test_classify_samples_declared_tables() {
        let mut input = scalar_input(ComponentMode::Independent, 2);
        input.transfer_2d[1] = true;
        let source = classify_source(&input);
        assert!(source.starts_with("fn v0g0_classify("));
        assert!(source.contains("v0g0_color_0"));
        assert!(source.contains("v0g0_tf2d_1"));
        assert!(!source.contains("v0g0_color_1"));
        assert!(source.contains("u.v0g0_weights[1]"));

        let la = classify_source(&scalar_input(ComponentMode::LuminanceAlpha, 2));
        assert!(la.contains("scalar[1] - r0.z"));
        assert!(la.contains("scalar[0] - r0.x"));
    }

    #[test]
    fn test_label_tables_are_declared() {
        let key = ShaderKey {
            mask: Some(MaskType::LabelMap),
            label_map_tables: 2,
            ..ShaderKey::default()
        };
        let (uniforms, samplers) = global_interface(&key);
        assert!(uniforms.iter().any(|u| u.name == "mask_blend"));
        let names: Vec<_> = samplers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["mask_volume", "mask_label_1", "mask_label_2"]);
    }

    #[test]
    fn test_measure_component() {
        let mut input = InputFeatures {
            tag: "v0g0".into(),
            components: 2,
            mode: ComponentMode::LuminanceAlpha,
            transfer_2d: vec![false],
            gradient_opacity: vec![false],
            gradients: false,
            shade: false,
        };
        assert_eq!(measure_component(&input), 1);
        input.mode = ComponentMode::Independent;
        assert_eq!(measure_component(&input), 0);
    }
}
