//! Volume appearance properties.

use crate::image_data::ScalarArray;
use crate::options::Interpolation;
use crate::plane::Plane;
use crate::timestamp::TimeStamp;
use crate::transfer_function::{ColorTransferFunction, PiecewiseFunction, TransferFunction2D};

/// Maximum number of scalar components per volume.
pub const MAX_COMPONENTS: usize = 4;

/// How the scalar components of a volume are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentMode {
    /// Each component has its own transfer functions.
    Independent,
    /// Luminance (and alpha): the first component indexes the color, the last the opacity.
    LuminanceAlpha,
    /// RGB color plus an opacity component.
    Rgba,
    /// A combination the ray caster cannot render.
    Invalid,
}

impl ComponentMode {
    /// Derives the mode from the independence flag and the component count.
    pub fn resolve(independent: bool, components: usize) -> Self {
        if independent {
            return ComponentMode::Independent;
        }
        match components {
            1 | 2 => ComponentMode::LuminanceAlpha,
            4 => ComponentMode::Rgba,
            3 => {
                log::warn!("3 dependent components are not supported; expected 1, 2 or 4");
                ComponentMode::Invalid
            }
            _ => ComponentMode::Invalid,
        }
    }

    /// Derives the mode for a scalar array under `property`.
    pub fn for_array(property: &VolumeProperty, scalars: &ScalarArray) -> Self {
        Self::resolve(property.independent_components(), scalars.components())
    }

    /// Number of transfer-function sets this mode needs for `components`.
    pub fn table_sets(self, components: usize) -> usize {
        match self {
            ComponentMode::Independent => components,
            ComponentMode::LuminanceAlpha | ComponentMode::Rgba => 1,
            ComponentMode::Invalid => 0,
        }
    }
}

/// Whether opacity is a function of scalar alone or of scalar and gradient magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransferFunctionMode {
    #[default]
    OneD,
    TwoD,
}

/// Transfer functions and shading coefficients of one component.
#[derive(Debug, Clone)]
pub struct ComponentProperty {
    /// Scalar to color.
    pub color: ColorTransferFunction,
    /// Scalar to opacity.
    pub scalar_opacity: PiecewiseFunction,
    /// Gradient magnitude to opacity; disabled when `None`.
    pub gradient_opacity: Option<PiecewiseFunction>,
    /// Combined table used in [`TransferFunctionMode::TwoD`].
    pub transfer_2d: Option<TransferFunction2D>,
    /// Distance over which the scalar opacity is calibrated.
    pub scalar_opacity_unit_distance: f64,
    /// Weight of this component in multi-component blending.
    pub weight: f64,
    pub ambient: f64,
    pub diffuse: f64,
    pub specular: f64,
    pub specular_power: f64,
}

impl Default for ComponentProperty {
    fn default() -> Self {
        Self {
            color: ColorTransferFunction::new(),
            scalar_opacity: PiecewiseFunction::new(),
            gradient_opacity: None,
            transfer_2d: None,
            scalar_opacity_unit_distance: 1.0,
            weight: 1.0,
            ambient: 0.1,
            diffuse: 0.7,
            specular: 0.2,
            specular_power: 10.0,
        }
    }
}

/// Appearance of one volume.
///
/// Property-level settings bump [`VolumeProperty::mtime`]; editing the transfer
/// functions of a component only bumps the function's own stamp.
#[derive(Debug, Clone)]
pub struct VolumeProperty {
    components: [ComponentProperty; MAX_COMPONENTS],
    independent_components: bool,
    interpolation: Interpolation,
    shade: bool,
    transfer_function_mode: TransferFunctionMode,
    iso_surface_values: Vec<f64>,
    clipped_voxel_intensity: Option<f64>,
    slice_plane: Plane,
    label_colors: Vec<ColorTransferFunction>,
    mtime: TimeStamp,
}

impl Default for VolumeProperty {
    fn default() -> Self {
        Self {
            components: Default::default(),
            independent_components: true,
            interpolation: Interpolation::Linear,
            shade: false,
            transfer_function_mode: TransferFunctionMode::OneD,
            iso_surface_values: Vec::new(),
            clipped_voxel_intensity: None,
            slice_plane: Plane::default(),
            label_colors: Vec::new(),
            mtime: TimeStamp::now(),
        }
    }
}

impl VolumeProperty {
    /// Creates a property with empty transfer functions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Properties of component `i`.
    pub fn component(&self, i: usize) -> &ComponentProperty {
        &self.components[i]
    }

    /// Mutable properties of component `i`.
    pub fn component_mut(&mut self, i: usize) -> &mut ComponentProperty {
        &mut self.components[i]
    }

    pub fn independent_components(&self) -> bool {
        self.independent_components
    }

    pub fn set_independent_components(&mut self, independent: bool) {
        if self.independent_components != independent {
            self.independent_components = independent;
            self.mtime.modified();
        }
    }

    pub fn interpolation(&self) -> Interpolation {
        self.interpolation
    }

    pub fn set_interpolation(&mut self, interpolation: Interpolation) {
        if self.interpolation != interpolation {
            self.interpolation = interpolation;
            self.mtime.modified();
        }
    }

    pub fn shade(&self) -> bool {
        self.shade
    }

    pub fn set_shade(&mut self, shade: bool) {
        if self.shade != shade {
            self.shade = shade;
            self.mtime.modified();
        }
    }

    pub fn transfer_function_mode(&self) -> TransferFunctionMode {
        self.transfer_function_mode
    }

    pub fn set_transfer_function_mode(&mut self, mode: TransferFunctionMode) {
        if self.transfer_function_mode != mode {
            self.transfer_function_mode = mode;
            self.mtime.modified();
        }
    }

    /// Contour values for the isosurface blend mode, ascending.
    pub fn iso_surface_values(&self) -> &[f64] {
        &self.iso_surface_values
    }

    pub fn set_iso_surface_values(&mut self, mut values: Vec<f64>) {
        values.sort_by(f64::total_cmp);
        self.iso_surface_values = values;
        self.mtime.modified();
    }

    /// Intensity substituted for voxels removed by clipping planes.
    pub fn clipped_voxel_intensity(&self) -> Option<f64> {
        self.clipped_voxel_intensity
    }

    pub fn set_clipped_voxel_intensity(&mut self, intensity: Option<f64>) {
        self.clipped_voxel_intensity = intensity;
        self.mtime.modified();
    }

    /// Plane used by the slice blend mode.
    pub fn slice_plane(&self) -> &Plane {
        &self.slice_plane
    }

    pub fn set_slice_plane(&mut self, plane: Plane) {
        self.slice_plane = plane;
        self.mtime.modified();
    }

    /// Label colors used by label-map masking; at most 3 are used.
    pub fn label_colors(&self) -> &[ColorTransferFunction] {
        &self.label_colors
    }

    pub fn set_label_colors(&mut self, colors: Vec<ColorTransferFunction>) {
        self.label_colors = colors;
        self.mtime.modified();
    }

    /// Mutable label colors for in-place seeding by the table cache.
    pub fn label_colors_mut(&mut self) -> &mut [ColorTransferFunction] {
        &mut self.label_colors
    }

    /// Last modification of a property-level setting.
    pub fn mtime(&self) -> TimeStamp {
        self.mtime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_data::ScalarData;

    #[test]
    fn test_component_mode_resolution() {
        assert_eq!(ComponentMode::resolve(true, 3), ComponentMode::Independent);
        assert_eq!(ComponentMode::resolve(false, 1), ComponentMode::LuminanceAlpha);
        assert_eq!(ComponentMode::resolve(false, 2), ComponentMode::LuminanceAlpha);
        assert_eq!(ComponentMode::resolve(false, 4), ComponentMode::Rgba);
        assert_eq!(ComponentMode::resolve(false, 3), ComponentMode::Invalid);
        assert_eq!(ComponentMode::resolve(false, 5), ComponentMode::Invalid);
    }

    #[test]
    fn test_table_sets() {
        assert_eq!(ComponentMode::Independent.table_sets(3), 3);
        assert_eq!(ComponentMode::Rgba.table_sets(4), 1);
        assert_eq!(ComponentMode::Invalid.table_sets(3), 0);
    }

    #[test]
    fn test_for_array_uses_property_flag() {
        let mut property = VolumeProperty::new();
        let array = ScalarArray::new("rgba", 4, ScalarData::U8(vec![0; 8])).unwrap();
        assert_eq!(ComponentMode::for_array(&property, &array), ComponentMode::Independent);
        property.set_independent_components(false);
        assert_eq!(ComponentMode::for_array(&property, &array), ComponentMode::Rgba);
    }

    #[test]
    fn test_setters_bump_mtime_only_on_change() {
        let mut property = VolumeProperty::new();
        let t0 = property.mtime();
        property.set_shade(false);
        assert_eq!(property.mtime(), t0);
        property.set_shade(true);
        assert!(property.mtime() > t0);
    }

    #[test]
    fn test_function_edits_do_not_touch_property_mtime() {
        let mut property = VolumeProperty::new();
        let t0 = property.mtime();
        property.component_mut(0).scalar_opacity.add_point(0.0, 1.0);
        assert_eq!(property.mtime(), t0);
    }

    #[test]
    fn test_iso_values_sorted() {
        let mut property = VolumeProperty::new();
        property.set_iso_surface_values(vec![3.0, -1.0, 2.0]);
        assert_eq!(property.iso_surface_values(), &[-1.0, 2.0, 3.0]);
    }
}
