//! Transfer functions: scalar value (and optionally gradient magnitude) to
//! color and opacity.

use crate::error::{Result, VolrayError};
use crate::timestamp::TimeStamp;

/// Smallest accepted width of a scalar range.
pub const MIN_RANGE_SPAN: f64 = 1.0e-5;

/// Upper bound for [`PiecewiseFunction::estimate_min_number_of_samples`].
const MAX_SAMPLE_ESTIMATE: usize = 1 << 16;

/// Returns `range` widened to a minimal non-zero span when degenerate.
///
/// Transfer-function editing routinely produces transient empty ranges, which
/// would otherwise divide by zero when normalizing scalars.
#[must_use]
pub fn sanitize_range(range: [f64; 2]) -> [f64; 2] {
    let [mut lo, mut hi] = range;
    if !lo.is_finite() || !hi.is_finite() {
        lo = if lo.is_finite() { lo } else { 0.0 };
        hi = if hi.is_finite() { hi } else { lo + 1.0 };
    }
    if hi < lo {
        std::mem::swap(&mut lo, &mut hi);
    }
    let min_span = MIN_RANGE_SPAN * lo.abs().max(1.0);
    if hi - lo < min_span {
        hi = lo + min_span;
    }
    [lo, hi]
}

/// Positions of `n` evenly spaced samples over `range`, endpoints included.
fn sample_positions(range: [f64; 2], n: usize) -> impl Iterator<Item = f64> {
    #[allow(clippy::cast_precision_loss)]
    let step = if n > 1 {
        (range[1] - range[0]) / (n - 1) as f64
    } else {
        0.0
    };
    #[allow(clippy::cast_precision_loss)]
    (0..n).map(move |i| range[0] + step * i as f64)
}

/// Smallest distance between consecutive node positions.
fn min_node_spacing(xs: impl Iterator<Item = f64>) -> Option<f64> {
    let mut prev: Option<f64> = None;
    let mut best: Option<f64> = None;
    for x in xs {
        if let Some(p) = prev {
            let d = x - p;
            if d > 0.0 {
                best = Some(best.map_or(d, |b: f64| b.min(d)));
            }
        }
        prev = Some(x);
    }
    best
}

fn estimate_samples(spacing: Option<f64>, range: [f64; 2]) -> usize {
    match spacing {
        Some(d) => {
            let ideal = ((range[1] - range[0]) / d).ceil();
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let ideal = if ideal.is_finite() && ideal > 0.0 {
                (ideal as usize).saturating_add(1)
            } else {
                1
            };
            ideal.min(MAX_SAMPLE_ESTIMATE)
        }
        None => 1,
    }
}

/// A piecewise-linear scalar function, used for scalar and gradient opacity.
#[derive(Debug, Clone, Default)]
pub struct PiecewiseFunction {
    nodes: Vec<[f64; 2]>,
    mtime: TimeStamp,
}

impl PiecewiseFunction {
    /// Creates an empty function.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            mtime: TimeStamp::now(),
        }
    }

    /// Creates a linear ramp from `(range[0], y0)` to `(range[1], y1)`.
    #[must_use]
    pub fn ramp(range: [f64; 2], y0: f64, y1: f64) -> Self {
        let mut f = Self::new();
        f.add_point(range[0], y0);
        f.add_point(range[1], y1);
        f
    }

    /// Adds a node, replacing any node at the same position.
    pub fn add_point(&mut self, x: f64, y: f64) {
        match self.nodes.binary_search_by(|n| n[0].total_cmp(&x)) {
            Ok(i) => self.nodes[i][1] = y,
            Err(i) => self.nodes.insert(i, [x, y]),
        }
        self.mtime.modified();
    }

    /// Removes every node.
    pub fn remove_all_points(&mut self) {
        self.nodes.clear();
        self.mtime.modified();
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the function has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes as `[x, y]`, sorted by x.
    pub fn nodes(&self) -> &[[f64; 2]] {
        &self.nodes
    }

    /// Last modification.
    pub fn mtime(&self) -> TimeStamp {
        self.mtime
    }

    /// Span of the node positions.
    pub fn range(&self) -> Option<[f64; 2]> {
        Some([self.nodes.first()?[0], self.nodes.last()?[0]])
    }

    /// Seeds an empty function with a 0-to-1 ramp over `range`.
    ///
    /// Returns true if the function was seeded.
    pub fn ensure_default_ramp(&mut self, range: [f64; 2]) -> bool {
        if !self.nodes.is_empty() {
            return false;
        }
        let range = sanitize_range(range);
        log::debug!("seeding empty opacity function over {range:?}");
        self.add_point(range[0], 0.0);
        self.add_point(range[1], 1.0);
        true
    }

    /// Evaluates the function, clamping outside the node span.
    pub fn value(&self, x: f64) -> f64 {
        let Some(first) = self.nodes.first() else {
            return 0.0;
        };
        if x <= first[0] {
            return first[1];
        }
        let i = self.nodes.partition_point(|n| n[0] <= x);
        if i >= self.nodes.len() {
            return self.nodes[self.nodes.len() - 1][1];
        }
        let [x0, y0] = self.nodes[i - 1];
        let [x1, y1] = self.nodes[i];
        let t = (x - x0) / (x1 - x0);
        y0 + (y1 - y0) * t
    }

    /// Samples `n` values evenly over `range`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn sample_table(&self, range: [f64; 2], n: usize) -> Vec<f32> {
        sample_positions(range, n).map(|x| self.value(x) as f32).collect()
    }

    /// Number of samples needed to resolve the closest pair of nodes over `range`.
    pub fn estimate_min_number_of_samples(&self, range: [f64; 2]) -> usize {
        estimate_samples(min_node_spacing(self.nodes.iter().map(|n| n[0])), range)
    }
}

/// A piecewise-linear RGB color function.
#[derive(Debug, Clone, Default)]
pub struct ColorTransferFunction {
    nodes: Vec<(f64, [f64; 3])>,
    mtime: TimeStamp,
}

impl ColorTransferFunction {
    /// Creates an empty function.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            mtime: TimeStamp::now(),
        }
    }

    /// Creates a black-to-white ramp over `range`.
    #[must_use]
    pub fn grayscale(range: [f64; 2]) -> Self {
        let mut f = Self::new();
        f.add_rgb_point(range[0], [0.0; 3]);
        f.add_rgb_point(range[1], [1.0; 3]);
        f
    }

    /// Adds a node, replacing any node at the same position.
    pub fn add_rgb_point(&mut self, x: f64, rgb: [f64; 3]) {
        match self.nodes.binary_search_by(|n| n.0.total_cmp(&x)) {
            Ok(i) => self.nodes[i].1 = rgb,
            Err(i) => self.nodes.insert(i, (x, rgb)),
        }
        self.mtime.modified();
    }

    /// Removes every node.
    pub fn remove_all_points(&mut self) {
        self.nodes.clear();
        self.mtime.modified();
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the function has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Last modification.
    pub fn mtime(&self) -> TimeStamp {
        self.mtime
    }

    /// Span of the node positions.
    pub fn range(&self) -> Option<[f64; 2]> {
        Some([self.nodes.first()?.0, self.nodes.last()?.0])
    }

    /// Seeds an empty function with a black-to-white ramp over `range`.
    ///
    /// Returns true if the function was seeded.
    pub fn ensure_default_ramp(&mut self, range: [f64; 2]) -> bool {
        if !self.nodes.is_empty() {
            return false;
        }
        let range = sanitize_range(range);
        log::debug!("seeding empty color function over {range:?}");
        self.add_rgb_point(range[0], [0.0; 3]);
        self.add_rgb_point(range[1], [1.0; 3]);
        true
    }

    /// Evaluates the function, clamping outside the node span.
    pub fn value(&self, x: f64) -> [f64; 3] {
        let Some(first) = self.nodes.first() else {
            return [0.0; 3];
        };
        if x <= first.0 {
            return first.1;
        }
        let i = self.nodes.partition_point(|n| n.0 <= x);
        if i >= self.nodes.len() {
            return self.nodes[self.nodes.len() - 1].1;
        }
        let (x0, c0) = self.nodes[i - 1];
        let (x1, c1) = self.nodes[i];
        let t = (x - x0) / (x1 - x0);
        [
            c0[0] + (c1[0] - c0[0]) * t,
            c0[1] + (c1[1] - c0[1]) * t,
            c0[2] + (c1[2] - c0[2]) * t,
        ]
    }

    /// Samples `n` colors evenly over `range`, flattened as RGB triples.
    #[allow(clippy::cast_possible_truncation)]
    pub fn sample_table(&self, range: [f64; 2], n: usize) -> Vec<f32> {
        sample_positions(range, n)
            .flat_map(|x| self.value(x).map(|c| c as f32))
            .collect()
    }

    /// Number of samples needed to resolve the closest pair of nodes over `range`.
    pub fn estimate_min_number_of_samples(&self, range: [f64; 2]) -> usize {
        estimate_samples(min_node_spacing(self.nodes.iter().map(|n| n.0)), range)
    }
}

/// A 2D transfer function: scalar value (x) by gradient magnitude (y) to RGBA.
#[derive(Debug, Clone)]
pub struct TransferFunction2D {
    width: usize,
    height: usize,
    texels: Vec<[f32; 4]>,
    mtime: TimeStamp,
}

impl TransferFunction2D {
    /// Creates a function from row-major RGBA texels.
    pub fn new(width: usize, height: usize, texels: Vec<[f32; 4]>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(VolrayError::InvalidTransferFunction2D { width, height });
        }
        if texels.len() != width * height {
            return Err(VolrayError::SizeMismatch {
                expected: width * height,
                actual: texels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            texels,
            mtime: TimeStamp::now(),
        })
    }

    /// Native dimensions `(width, height)`.
    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Texel at `(x, y)`.
    pub fn texel(&self, x: usize, y: usize) -> [f32; 4] {
        self.texels[y * self.width + x]
    }

    /// Mutable texels; marks the function modified.
    pub fn texels_mut(&mut self) -> &mut [[f32; 4]] {
        self.mtime.modified();
        &mut self.texels
    }

    /// Last modification.
    pub fn mtime(&self) -> TimeStamp {
        self.mtime
    }

    /// Nearest-neighbour resample to `width` x `height`, flattened RGBA.
    pub fn resample(&self, width: usize, height: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(width * height * 4);
        for y in 0..height {
            let sy = y * self.height / height.max(1);
            for x in 0..width {
                let sx = x * self.width / width.max(1);
                out.extend_from_slice(&self.texel(sx, sy));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_degenerate_range() {
        let r = sanitize_range([3.0, 3.0]);
        assert!(r[1] > r[0]);
        assert!((r[0] - 3.0).abs() < f64::EPSILON);

        let r = sanitize_range([5.0, 1.0]);
        assert_eq!(r, [1.0, 5.0]);
    }

    #[test]
    fn test_piecewise_value_interpolates_and_clamps() {
        let f = PiecewiseFunction::ramp([0.0, 10.0], 0.0, 1.0);
        assert!((f.value(5.0) - 0.5).abs() < 1e-12);
        assert!((f.value(-1.0)).abs() < 1e-12);
        assert!((f.value(11.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_add_point_bumps_mtime_and_replaces() {
        let mut f = PiecewiseFunction::new();
        let t0 = f.mtime();
        f.add_point(1.0, 0.2);
        assert!(f.mtime() > t0);
        f.add_point(1.0, 0.7);
        assert_eq!(f.len(), 1);
        assert!((f.value(1.0) - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_default_ramp_only_when_empty() {
        let mut f = PiecewiseFunction::new();
        assert!(f.ensure_default_ramp([0.0, 255.0]));
        assert_eq!(f.len(), 2);
        assert!(!f.ensure_default_ramp([0.0, 1.0]));
        assert_eq!(f.range(), Some([0.0, 255.0]));

        let mut c = ColorTransferFunction::new();
        assert!(c.ensure_default_ramp([2.0, 2.0]));
        assert_eq!(c.value(100.0), [1.0; 3]);
    }

    #[test]
    fn test_estimate_samples_follows_node_spacing() {
        let mut f = PiecewiseFunction::new();
        f.add_point(0.0, 0.0);
        f.add_point(0.5, 1.0);
        f.add_point(100.0, 0.0);
        assert_eq!(f.estimate_min_number_of_samples([0.0, 100.0]), 201);
        assert_eq!(PiecewiseFunction::new().estimate_min_number_of_samples([0.0, 1.0]), 1);
    }

    #[test]
    fn test_color_sample_table_layout() {
        let c = ColorTransferFunction::grayscale([0.0, 1.0]);
        let table = c.sample_table([0.0, 1.0], 3);
        assert_eq!(table.len(), 9);
        assert!((table[3] - 0.5).abs() < 1e-6);
        assert!((table[8] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_transfer_2d_validation_and_resample() {
        assert!(TransferFunction2D::new(0, 4, vec![]).is_err());
        assert!(TransferFunction2D::new(2, 2, vec![[0.0; 4]; 3]).is_err());
        let tf = TransferFunction2D::new(2, 1, vec![[1.0, 0.0, 0.0, 1.0], [0.0, 1.0, 0.0, 1.0]]).unwrap();
        let out = tf.resample(4, 2);
        assert_eq!(out.len(), 4 * 2 * 4);
        assert!((out[0] - 1.0).abs() < f32::EPSILON);
        assert!((out[3 * 4 + 1] - 1.0).abs() < f32::EPSILON);
    }
}
