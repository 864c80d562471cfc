//! Values of the ray-casting program's uniforms.
//!
//! Each function sets one group of uniforms; names the bound program does not
//! declare are ignored by the backend, so groups can be set unconditionally.

use glam::{DMat4, DVec3};
use volray_core::pick::index_to_color;
use volray_core::plane::flatten_clipping_planes;
use volray_core::{
    Camera, Cropping, Light, LightComplexity, LightKind, MapperOptions, Plane, VolumeProperty,
    MAX_COMPONENTS, MAX_LIGHTS,
};

use crate::brick::VolumeBlock;
use crate::gpu::{mat4_uniform, vec4_uniform, GpuBackend, UniformValue, Viewport};
use crate::input::VolumeInput;

/// Narrows to the range a shader float can hold.
#[allow(clippy::cast_possible_truncation)]
fn to_f32(v: f64) -> f32 {
    v.clamp(f64::from(f32::MIN), f64::from(f32::MAX)) as f32
}

#[allow(clippy::cast_precision_loss)]
fn dims_uniform(dims: [usize; 3]) -> UniformValue {
    UniformValue::Vec4([dims[0] as f32, dims[1] as f32, dims[2] as f32, 0.0])
}

/// Camera, viewport and the transform of the proxy geometry.
///
/// `viewport` is the region drawn in the current target; `depth_scale` maps
/// its fragment coordinates onto the scene depth texture.
pub fn set_view(
    gpu: &mut dyn GpuBackend,
    camera: &Camera,
    viewport: Viewport,
    depth_scale: f64,
    geometry_to_world: &DMat4,
) {
    let view_projection = camera.view_projection_matrix();
    gpu.set_uniform("view_projection", mat4_uniform(&view_projection));
    gpu.set_uniform(
        "inv_view_projection",
        mat4_uniform(&view_projection.inverse()),
    );
    gpu.set_uniform("view_matrix", mat4_uniform(&camera.view_matrix()));
    gpu.set_uniform("geometry_to_world", mat4_uniform(geometry_to_world));
    gpu.set_uniform("camera_position", vec4_uniform(camera.position, 1.0));
    gpu.set_uniform(
        "camera_direction",
        vec4_uniform(camera.direction_of_projection(), 0.0),
    );
    #[allow(clippy::cast_precision_loss)]
    gpu.set_uniform(
        "viewport",
        UniformValue::Vec4([
            viewport.x as f32,
            viewport.y as f32,
            viewport.width as f32,
            viewport.height as f32,
        ]),
    );
    gpu.set_uniform("depth_scale", UniformValue::Float(to_f32(depth_scale)));
}

/// Ray step and final color window/level.
pub fn set_sampling(gpu: &mut dyn GpuBackend, options: &MapperOptions, sample_distance: f64) {
    gpu.set_uniform(
        "sample_distance",
        UniformValue::Float(to_f32(sample_distance)),
    );
    let (scale, bias) = options.final_color_scale_bias();
    gpu.set_uniform(
        "final_color",
        UniformValue::Vec4([to_f32(scale), to_f32(bias), 0.0, 0.0]),
    );
}

/// Lights in view space, colors premultiplied by intensity.
///
/// A lone unit headlight needs no uniforms; positional parameters are only
/// uploaded when some light is positional.
pub fn set_lights(
    gpu: &mut dyn GpuBackend,
    camera: &Camera,
    lights: &[Light],
    complexity: LightComplexity,
) -> usize {
    if complexity < LightComplexity::Directional {
        return 0;
    }
    let view = camera.view_matrix();
    let active: Vec<&Light> = lights.iter().filter(|l| l.switch).take(MAX_LIGHTS).collect();

    let color = |c: DVec3, light: &Light| {
        let c = c * light.intensity;
        [to_f32(c.x), to_f32(c.y), to_f32(c.z), 1.0]
    };
    let direction = |light: &Light| match light.kind {
        LightKind::Headlight => DVec3::NEG_Z,
        LightKind::CameraLight => light.direction(),
        LightKind::SceneLight => view.transform_vector3(light.direction()).normalize_or(DVec3::NEG_Z),
    };
    let xyz = |v: DVec3, w: f32| [to_f32(v.x), to_f32(v.y), to_f32(v.z), w];

    #[allow(clippy::cast_precision_loss)]
    gpu.set_uniform("light_count", UniformValue::Float(active.len() as f32));
    gpu.set_uniform(
        "light_ambient",
        UniformValue::Vec4Array(active.iter().map(|l| color(l.ambient_color, l)).collect()),
    );
    gpu.set_uniform(
        "light_diffuse",
        UniformValue::Vec4Array(active.iter().map(|l| color(l.diffuse_color, l)).collect()),
    );
    gpu.set_uniform(
        "light_specular",
        UniformValue::Vec4Array(active.iter().map(|l| color(l.specular_color, l)).collect()),
    );
    gpu.set_uniform(
        "light_direction",
        UniformValue::Vec4Array(active.iter().map(|l| xyz(direction(l), 0.0)).collect()),
    );

    if complexity == LightComplexity::Positional {
        let position = |light: &Light| match light.kind {
            LightKind::Headlight => DVec3::ZERO,
            LightKind::CameraLight => light.position,
            LightKind::SceneLight => view.transform_point3(light.position),
        };
        gpu.set_uniform(
            "light_position",
            UniformValue::Vec4Array(active.iter().map(|l| xyz(position(l), 1.0)).collect()),
        );
        gpu.set_uniform(
            "light_attenuation",
            UniformValue::Vec4Array(active.iter().map(|l| xyz(l.attenuation, 0.0)).collect()),
        );
        gpu.set_uniform(
            "light_cone",
            UniformValue::Vec4Array(
                active
                    .iter()
                    .map(|l| {
                        // Cones of 90 degrees or more light every direction
                        let cos = if l.cone_angle < 90.0 {
                            to_f32(l.cone_angle.to_radians().cos())
                        } else {
                            -2.0
                        };
                        let positional = if l.positional { 1.0 } else { 0.0 };
                        [cos, to_f32(l.exponent), positional, 0.0]
                    })
                    .collect(),
            ),
        );
    }
    active.len()
}

/// Per-input uniforms for drawing `block` of `input`.
pub fn set_input(gpu: &mut dyn GpuBackend, input: &VolumeInput, block: &VolumeBlock) {
    let matrix = input.volume.matrix;
    let world_to_dataset = matrix.inverse();
    let property = &input.volume.property;
    let bricks = input.bricks();
    let name = |suffix: &str| input.name(suffix);

    gpu.set_uniform(
        &name("world_to_tex"),
        mat4_uniform(&(block.dataset_to_texture * world_to_dataset)),
    );
    gpu.set_uniform(&name("world_to_dataset"), mat4_uniform(&world_to_dataset));
    gpu.set_uniform(&name("tex_min"), vec4_uniform(block.texture_bounds[0], 1.0));
    gpu.set_uniform(&name("tex_max"), vec4_uniform(block.texture_bounds[1], 1.0));
    let (scale, bias) = bricks.scale_bias();
    gpu.set_uniform(&name("scale"), UniformValue::Vec4(scale));
    gpu.set_uniform(&name("bias"), UniformValue::Vec4(bias));
    gpu.set_uniform(&name("cell_step"), vec4_uniform(block.cell_step, 0.0));

    let mut weights = [0.0; MAX_COMPONENTS];
    for (c, weight) in weights.iter_mut().enumerate() {
        *weight = to_f32(property.component(c).weight);
    }
    gpu.set_uniform(&name("weights"), UniformValue::Vec4(weights));

    let ranges = input.table_ranges();
    gpu.set_uniform(
        &name("ranges"),
        UniformValue::Vec4Array(
            ranges
                .iter()
                .map(|r| {
                    [
                        to_f32(r.color[0]),
                        to_f32(r.color[1]),
                        to_f32(r.opacity[0]),
                        to_f32(r.opacity[1]),
                    ]
                })
                .collect(),
        ),
    );
    gpu.set_uniform(
        &name("grad_ranges"),
        UniformValue::Vec4Array(
            ranges
                .iter()
                .map(|r| [to_f32(r.gradient[0]), to_f32(r.gradient[1]), 0.0, 0.0])
                .collect(),
        ),
    );
    gpu.set_uniform(
        &name("shading"),
        UniformValue::Vec4Array(
            (0..MAX_COMPONENTS)
                .map(|c| {
                    let k = property.component(c);
                    [
                        to_f32(k.ambient),
                        to_f32(k.diffuse),
                        to_f32(k.specular),
                        to_f32(k.specular_power),
                    ]
                })
                .collect(),
        ),
    );

    let texture = block.extent.texture;
    gpu.set_uniform(&name("volume_dims"), dims_uniform(block.extent.texture_dims()));
    gpu.set_uniform(
        &name("voxel_offset"),
        dims_uniform([texture[0], texture[2], texture[4]]),
    );
    gpu.set_uniform(&name("full_dims"), dims_uniform(bricks.dims()));
}

/// Cropping planes of the first input, clamped to its `bounds`.
pub fn set_cropping(gpu: &mut dyn GpuBackend, cropping: &Cropping, bounds: [f64; 6]) {
    let p = cropping.clamped_planes(bounds).map(to_f32);
    gpu.set_uniform(
        "cropping_planes",
        UniformValue::Vec4Array(vec![[p[0], p[1], p[2], p[3]], [p[4], p[5], 0.0, 0.0]]),
    );
    #[allow(clippy::cast_precision_loss)]
    gpu.set_uniform(
        "cropping_regions",
        UniformValue::FloatArray(cropping.region_table().iter().map(|&r| r as f32).collect()),
    );
}

/// World-space clipping planes and the intensity of clipped voxels.
pub fn set_clipping(gpu: &mut dyn GpuBackend, planes: &[Plane], clipped_intensity: Option<f64>) {
    let flat = flatten_clipping_planes(planes);
    gpu.set_uniform("clip_count", UniformValue::Float(flat[0]));
    gpu.set_uniform(
        "clip_planes",
        UniformValue::Vec4Array(
            flat[1..]
                .chunks_exact(3)
                .map(|v| [v[0], v[1], v[2], 0.0])
                .collect(),
        ),
    );
    if let Some(intensity) = clipped_intensity {
        gpu.set_uniform(
            "clipped_voxel_intensity",
            UniformValue::Float(to_f32(intensity)),
        );
    }
}

/// Parameters of the blend modes that need any: contour values, the
/// averaged scalar range and the slice plane.
pub fn set_blend(
    gpu: &mut dyn GpuBackend,
    options: &MapperOptions,
    property: &VolumeProperty,
    matrix: &DMat4,
) {
    gpu.set_uniform(
        "iso_values",
        UniformValue::FloatArray(property.iso_surface_values().iter().map(|&v| to_f32(v)).collect()),
    );
    let [lo, hi] = options.average_ip_scalar_range;
    gpu.set_uniform(
        "average_range",
        UniformValue::Vec4([to_f32(lo), to_f32(hi), 0.0, 0.0]),
    );
    let slice = property.slice_plane().transformed(matrix);
    gpu.set_uniform("slice_origin", vec4_uniform(slice.origin(), 1.0));
    gpu.set_uniform("slice_normal", vec4_uniform(slice.normal(), 0.0));
}

/// Color written for the prop during the prop-id pass.
pub fn set_pick_color(gpu: &mut dyn GpuBackend, prop_id: u32) {
    let [r, g, b] = index_to_color(prop_id);
    gpu.set_uniform(
        "pick_prop_color",
        UniformValue::Vec4([
            f32::from(r) / 255.0,
            f32::from(g) / 255.0,
            f32::from(b) / 255.0,
            1.0,
        ]),
    );
}

/// Mask lookup: world to mask texture, value scale and bias, label blend.
pub fn set_mask(
    gpu: &mut dyn GpuBackend,
    world_to_tex: &DMat4,
    scale_bias: (f32, f32),
    blend_factor: f64,
) {
    gpu.set_uniform("mask_world_to_tex", mat4_uniform(world_to_tex));
    gpu.set_uniform(
        "mask_scale_bias",
        UniformValue::Vec4([scale_bias.0, scale_bias.1, 0.0, 0.0]),
    );
    gpu.set_uniform("mask_blend", UniformValue::Float(to_f32(blend_factor)));
}

/// Render-to-image depth fallback for rays that hit nothing.
pub fn set_render_to_image(gpu: &mut dyn GpuBackend, clamp_to_backface: bool) {
    gpu.set_uniform(
        "clamp_to_backface",
        UniformValue::Float(if clamp_to_backface { 1.0 } else { 0.0 }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordingBackend;

    fn vec4s(gpu: &RecordingBackend, name: &str) -> Vec<[f32; 4]> {
        match gpu.uniform(name) {
            Some(UniformValue::Vec4Array(v)) => v.clone(),
            other => panic!("{name}: {other:?}"),
        }
    }

    #[test]
    fn test_headlight_sets_no_light_uniforms() {
        let mut gpu = RecordingBackend::new();
        let camera = Camera::new(1.0);
        let n = set_lights(
            &mut gpu,
            &camera,
            &[Light::headlight()],
            LightComplexity::Headlight,
        );
        assert_eq!(n, 0);
        assert!(gpu.uniform("light_count").is_none());
    }

    #[test]
    fn test_lights_are_premultiplied_and_in_view_space() {
        let mut gpu = RecordingBackend::new();
        let mut camera = Camera::new(1.0);
        camera.position = DVec3::new(0.0, 0.0, 5.0);
        let scene = Light {
            kind: LightKind::SceneLight,
            intensity: 0.5,
            position: DVec3::new(0.0, 0.0, 5.0),
            focal_point: DVec3::ZERO,
            ..Light::default()
        };
        let off = Light {
            switch: false,
            ..Light::default()
        };
        let n = set_lights(
            &mut gpu,
            &camera,
            &[scene, off],
            LightComplexity::Directional,
        );
        assert_eq!(n, 1);
        let diffuse = vec4s(&gpu, "light_diffuse");
        assert_eq!(diffuse.len(), 1);
        assert!((diffuse[0][0] - 0.5).abs() < 1e-6);
        // Pointing at the focal point from the eye is -Z in view space
        let direction = vec4s(&gpu, "light_direction");
        assert!((direction[0][2] + 1.0).abs() < 1e-5);
        assert!(gpu.uniform("light_position").is_none());
    }

    #[test]
    fn test_positional_cone() {
        let mut gpu = RecordingBackend::new();
        let camera = Camera::new(1.0);
        let spot = Light {
            kind: LightKind::SceneLight,
            positional: true,
            cone_angle: 60.0,
            exponent: 2.0,
            ..Light::default()
        };
        let point = Light {
            cone_angle: 180.0,
            ..spot.clone()
        };
        set_lights(&mut gpu, &camera, &[spot, point], LightComplexity::Positional);
        let cone = vec4s(&gpu, "light_cone");
        assert!((cone[0][0] - 0.5).abs() < 1e-6);
        assert_eq!(cone[0][1], 2.0);
        assert_eq!(cone[0][2], 1.0);
        assert_eq!(cone[1][0], -2.0);
    }

    #[test]
    fn test_clipping_planes_pair_origin_and_normal() {
        let mut gpu = RecordingBackend::new();
        let planes = [
            Plane::new(DVec3::new(1.0, 2.0, 3.0), DVec3::X),
            Plane::new(DVec3::ZERO, DVec3::Z),
        ];
        set_clipping(&mut gpu, &planes, Some(0.25));
        assert_eq!(gpu.uniform("clip_count"), Some(&UniformValue::Float(2.0)));
        let flat = vec4s(&gpu, "clip_planes");
        assert_eq!(flat.len(), 4);
        assert_eq!(flat[0], [1.0, 2.0, 3.0, 0.0]);
        assert_eq!(flat[1], [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(
            gpu.uniform("clipped_voxel_intensity"),
            Some(&UniformValue::Float(0.25))
        );
    }

    #[test]
    fn test_cropping_planes_are_clamped() {
        let mut gpu = RecordingBackend::new();
        let cropping = Cropping {
            enabled: true,
            planes: [-10.0, 5.0, 1.0, 2.0, 3.0, 40.0],
            region_flags: 1 << 13,
        };
        set_cropping(&mut gpu, &cropping, [0.0, 10.0, 0.0, 10.0, 0.0, 10.0]);
        let planes = vec4s(&gpu, "cropping_planes");
        assert_eq!(planes[0], [0.0, 5.0, 1.0, 2.0]);
        assert_eq!(planes[1], [3.0, 10.0, 0.0, 0.0]);
        match gpu.uniform("cropping_regions") {
            Some(UniformValue::FloatArray(regions)) => {
                assert_eq!(regions.len(), 32);
                assert_eq!(regions[14], 1.0);
                assert_eq!(regions.iter().sum::<f32>(), 1.0);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn test_average_range_is_clamped_to_f32() {
        let mut gpu = RecordingBackend::new();
        let options = MapperOptions::default();
        set_blend(&mut gpu, &options, &VolumeProperty::new(), &DMat4::IDENTITY);
        match gpu.uniform("average_range") {
            Some(UniformValue::Vec4(v)) => {
                assert!(v[0].is_finite() && v[1].is_finite());
                assert!(v[0] < v[1]);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn test_pick_color_encodes_prop_id() {
        let mut gpu = RecordingBackend::new();
        set_pick_color(&mut gpu, 0x01_02_03);
        match gpu.uniform("pick_prop_color") {
            Some(UniformValue::Vec4(v)) => {
                assert!((v[0] * 255.0 - 1.0).abs() < 1e-4);
                assert!((v[2] * 255.0 - 3.0).abs() < 1e-4);
            }
            other => panic!("{other:?}"),
        }
    }
}
