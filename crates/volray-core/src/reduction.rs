//! Adaptive image and sample distances.
//!
//! When the mapper is allowed to auto-adjust, the time the last frame took
//! is compared against the time the renderer allocated to the volume. Slow
//! frames coarsen the image sample distance, fast frames refine it.

use glam::{DMat4, DVec3};

use crate::options::MapperOptions;

/// Fallback draw time in seconds before any frame has been measured.
const DEFAULT_TIME_TO_DRAW: f64 = 10.0;

/// Allocated times below this are treated as interactive.
const INTERACTIVE_TIME: f64 = 1.0;

/// Tracks measured draw times and the resulting reduction factor.
#[derive(Debug, Clone)]
pub struct ReductionController {
    factor: f64,
    small_time_to_draw: f64,
    big_time_to_draw: f64,
}

impl Default for ReductionController {
    fn default() -> Self {
        Self {
            factor: 1.0,
            small_time_to_draw: 0.0,
            big_time_to_draw: 0.0,
        }
    }
}

impl ReductionController {
    /// Current reduction factor, in `(0, 1]`.
    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Records how long the last frame took, bucketed by the allocated time.
    pub fn record_time_to_draw(&mut self, seconds: f64, allocated_time: f64) {
        if allocated_time < INTERACTIVE_TIME {
            self.small_time_to_draw = seconds;
        } else {
            self.big_time_to_draw = seconds;
        }
    }

    /// Recomputes the reduction factor and returns the image sample distance to use.
    pub fn update(&mut self, options: &MapperOptions, allocated_time: f64) -> f64 {
        if !options.auto_adjust_sample_distances {
            self.factor = 1.0 / options.image_sample_distance;
            return options.image_sample_distance;
        }

        let old_factor = self.factor;
        let mut time_to_draw = if allocated_time < INTERACTIVE_TIME {
            if self.small_time_to_draw > 0.0 {
                self.small_time_to_draw
            } else {
                self.big_time_to_draw / 3.0
            }
        } else {
            self.big_time_to_draw
        };
        if time_to_draw <= 0.0 {
            time_to_draw = DEFAULT_TIME_TO_DRAW;
        }

        let full_time = time_to_draw / old_factor;
        let new_factor = allocated_time / full_time;

        let mut factor = ((new_factor + old_factor) / 2.0).min(1.0);
        factor = if factor < 0.2 {
            0.1
        } else if factor < 0.5 {
            0.2
        } else if factor < 1.0 {
            0.5
        } else {
            1.0
        };

        let distance = (1.0 / factor).clamp(
            options.minimum_image_sample_distance,
            options.maximum_image_sample_distance,
        );
        self.factor = 1.0 / distance;
        distance
    }
}

/// Ray step in world units for this frame.
///
/// `inputs` lists the spacing and model matrix of every active volume.
pub fn effective_sample_distance(
    options: &MapperOptions,
    inputs: &[(DVec3, DMat4)],
    reduction_factor: f64,
) -> f64 {
    let adjust = options.auto_adjust_sample_distances || options.lock_sample_distance_to_input_spacing;
    if !adjust || inputs.is_empty() {
        return options.sample_distance;
    }

    let min_spacing = inputs
        .iter()
        .flat_map(|(spacing, matrix)| {
            let columns = [matrix.x_axis, matrix.y_axis, matrix.z_axis];
            (0..3).map(move |i| spacing[i].abs() * columns[i].truncate().length())
        })
        .filter(|s| *s > 0.0)
        .fold(f64::INFINITY, f64::min);
    if !min_spacing.is_finite() {
        return options.sample_distance;
    }

    if options.auto_adjust_sample_distances && reduction_factor > 0.0 && reduction_factor < 1.0 {
        min_spacing / reduction_factor
    } else {
        min_spacing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_image_sample_distance() {
        let options = MapperOptions {
            auto_adjust_sample_distances: false,
            image_sample_distance: 2.0,
            ..MapperOptions::default()
        };
        let mut controller = ReductionController::default();
        assert!((controller.update(&options, 0.1) - 2.0).abs() < 1e-12);
        assert!((controller.factor() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_slow_frames_coarsen_and_fast_frames_refine() {
        let options = MapperOptions::default();
        let mut controller = ReductionController::default();
        controller.record_time_to_draw(1.0, 0.1);
        let coarse = controller.update(&options, 0.1);
        assert!(coarse > 1.0);
        assert!(coarse <= options.maximum_image_sample_distance);

        for _ in 0..8 {
            controller.record_time_to_draw(0.001, 0.1);
            controller.update(&options, 0.1);
        }
        assert!((controller.factor() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_distance_clamped_to_configured_bounds() {
        let options = MapperOptions {
            maximum_image_sample_distance: 2.0,
            ..MapperOptions::default()
        };
        let mut controller = ReductionController::default();
        controller.record_time_to_draw(100.0, 0.01);
        let d = controller.update(&options, 0.01);
        assert!((d - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_sample_distance_modes() {
        let inputs = [(DVec3::new(0.5, 2.0, 1.0), DMat4::from_scale(DVec3::new(1.0, 1.0, 0.25)))];
        let fixed = MapperOptions {
            auto_adjust_sample_distances: false,
            sample_distance: 0.7,
            ..MapperOptions::default()
        };
        assert!((effective_sample_distance(&fixed, &inputs, 1.0) - 0.7).abs() < 1e-12);

        let auto = MapperOptions::default();
        assert!((effective_sample_distance(&auto, &inputs, 1.0) - 0.25).abs() < 1e-12);
        assert!((effective_sample_distance(&auto, &inputs, 0.5) - 0.5).abs() < 1e-12);

        let locked = MapperOptions {
            auto_adjust_sample_distances: false,
            lock_sample_distance_to_input_spacing: true,
            ..MapperOptions::default()
        };
        assert!((effective_sample_distance(&locked, &inputs, 0.5) - 0.25).abs() < 1e-12);
    }
}
