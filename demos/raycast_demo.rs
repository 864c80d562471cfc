#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
//! Headless ray casting of a synthetic volume.
//!
//! Demonstrates:
//! - Building an `ImageData` and its transfer functions
//! - Composite rendering split into bricks
//! - Maximum intensity projection of the same data
//! - Render-to-image outputs (color and normalized depth)
//!
//! Usage: `cargo run --example raycast_demo [options.json]`

use volray::{
    fit_camera, BlendMode, HeadlessRenderer, ImageData, Light, MapperOptions, ScalarArray,
    ScalarData, Volume, VolumeMapper, VolumeProperty,
};

/// Two overlapping Gaussian blobs in a unit cube.
fn blobs(n: usize) -> Vec<f32> {
    let mut values = Vec::with_capacity(n * n * n);
    let blob = |x: f32, y: f32, z: f32, c: [f32; 3], r: f32| {
        let d2 = (x - c[0]).powi(2) + (y - c[1]).powi(2) + (z - c[2]).powi(2);
        (-d2 / (r * r)).exp()
    };
    for k in 0..n {
        for j in 0..n {
            for i in 0..n {
                let x = i as f32 / (n - 1) as f32;
                let y = j as f32 / (n - 1) as f32;
                let z = k as f32 / (n - 1) as f32;
                let v = blob(x, y, z, [0.35, 0.4, 0.5], 0.2) + 0.7 * blob(x, y, z, [0.65, 0.6, 0.45], 0.15);
                values.push(v * 255.0);
            }
        }
    }
    values
}

fn property() -> VolumeProperty {
    let mut property = VolumeProperty::new();
    property.set_shade(true);
    let component = property.component_mut(0);
    component.color.add_rgb_point(0.0, [0.0, 0.0, 0.0]);
    component.color.add_rgb_point(80.0, [0.9, 0.3, 0.1]);
    component.color.add_rgb_point(255.0, [1.0, 1.0, 0.9]);
    component.scalar_opacity.add_point(0.0, 0.0);
    component.scalar_opacity.add_point(40.0, 0.0);
    component.scalar_opacity.add_point(255.0, 0.6);
    property
}

fn main() -> volray::Result<()> {
    env_logger::init();

    let options = match std::env::args().nth(1) {
        Some(path) => MapperOptions::load(path)?,
        None => MapperOptions {
            partitions: [2, 2, 1],
            use_jittering: true,
            ..MapperOptions::default()
        },
    };

    let n = 96;
    let mut image = ImageData::new([n, n, n]);
    image.set_point_scalars(ScalarArray::new("blobs", 1, ScalarData::F32(blobs(n)))?)?;

    let mut mapper = VolumeMapper::new(options.clone());
    mapper.add_input(Volume::new(image, property()));

    let (width, height) = (800, 600);
    let camera = fit_camera(&mapper, f64::from(width) / f64::from(height));
    let lights = [Light::headlight()];

    let mut renderer = HeadlessRenderer::new(width, height)?;

    // --- Composite ---
    let stats = renderer.render(&mut mapper, &camera, &lights)?;
    log::info!("composite: {} draws, skipped {:?}", stats.draw_calls, stats.skipped_inputs);
    renderer.save("raycast_composite.png")?;

    // --- Maximum intensity ---
    mapper.set_options(MapperOptions {
        blend_mode: BlendMode::MaximumIntensity,
        ..options.clone()
    })?;
    let stats = renderer.render(&mut mapper, &camera, &lights)?;
    log::info!("maximum intensity: rebuilt shader {}", stats.shader_rebuilt);
    renderer.save("raycast_mip.png")?;

    // --- Render to image ---
    mapper.set_options(MapperOptions {
        render_to_image: true,
        ..options
    })?;
    renderer.render(&mut mapper, &camera, &lights)?;
    renderer.save_image_output(&mapper, "raycast_image.png", false)?;
    renderer.save_image_output(&mapper, "raycast_depth.png", true)?;

    renderer.release(&mut mapper);
    println!("wrote raycast_composite.png, raycast_mip.png, raycast_image.png, raycast_depth.png");
    Ok(())
}
