//! Layout of the generated uniform block and texture bindings.
//!
//! Every uniform occupies whole vec4 slots: scalars use the `x` lane, matrices
//! four slots, arrays one element per slot group. The WGSL struct and the
//! byte layout are derived from the same declaration list, so they cannot
//! drift apart.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::gpu::{SampleKind, SamplerDecl, TextureDimension, UniformDecl, UniformKind, UniformValue};

/// Bytes per vec4 slot.
pub const SLOT_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    /// First slot.
    offset: usize,
    kind: UniformKind,
    count: usize,
}

/// Slot offsets of a declaration list.
#[derive(Debug, Clone, Default)]
pub struct UniformLayout {
    entries: HashMap<String, Entry>,
    slots: usize,
}

impl UniformLayout {
    /// Lays out `decls` in order. Later duplicates of a name are ignored.
    pub fn new(decls: &[UniformDecl]) -> Self {
        let mut entries = HashMap::new();
        let mut slots = 0;
        for decl in decls {
            if entries.contains_key(&decl.name) {
                continue;
            }
            let count = decl.count.unwrap_or(1);
            entries.insert(
                decl.name.clone(),
                Entry {
                    offset: slots,
                    kind: decl.kind,
                    count,
                },
            );
            slots += decl.kind.slots() * count;
        }
        Self { entries, slots }
    }

    /// Size of the block in bytes; never zero.
    pub fn byte_size(&self) -> usize {
        self.slots.max(1) * SLOT_BYTES
    }

    /// True if `name` is declared.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Writes `value` into `block` (one f32 per lane). Returns false for
    /// undeclared names.
    ///
    /// Integers are stored as floats. Values longer than the declaration are
    /// truncated.
    #[allow(clippy::cast_precision_loss)]
    pub fn write(&self, block: &mut [f32], name: &str, value: &UniformValue) -> bool {
        let Some(entry) = self.entries.get(name) else {
            return false;
        };
        let lanes = entry.kind.slots() * 4;
        let capacity = entry.count;
        let base = entry.offset * 4;
        let mut put = |index: usize, data: &[f32]| {
            if index < capacity {
                let start = base + index * lanes;
                let end = (start + data.len().min(lanes)).min(block.len());
                if start < end {
                    block[start..end].copy_from_slice(&data[..end - start]);
                }
            }
        };
        match value {
            UniformValue::Float(v) => put(0, &[*v]),
            UniformValue::Int(v) => put(0, &[*v as f32]),
            UniformValue::Vec2(v) => put(0, v),
            UniformValue::Vec3(v) => put(0, v),
            UniformValue::Vec4(v) => put(0, v),
            UniformValue::Mat4(m) => put(0, m.as_flattened()),
            UniformValue::FloatArray(values) => {
                for (i, v) in values.iter().enumerate() {
                    put(i, &[*v]);
                }
            }
            UniformValue::IntArray(values) => {
                for (i, v) in values.iter().enumerate() {
                    put(i, &[*v as f32]);
                }
            }
            UniformValue::Vec4Array(values) => {
                for (i, v) in values.iter().enumerate() {
                    put(i, v);
                }
            }
            UniformValue::Mat4Array(values) => {
                for (i, m) in values.iter().enumerate() {
                    put(i, m.as_flattened());
                }
            }
        }
        true
    }
}

/// Binding slots of one texture declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureBinding {
    pub name: String,
    pub texture: u32,
    /// Companion sampler, for filterable textures.
    pub sampler: Option<u32>,
    pub dimension: TextureDimension,
    pub sample: SampleKind,
}

/// Binding 0 is the uniform block; textures follow in declaration order, each
/// filterable texture directly followed by its sampler.
pub fn texture_bindings(samplers: &[SamplerDecl]) -> Vec<TextureBinding> {
    let mut next = 1;
    samplers
        .iter()
        .map(|decl| {
            let texture = next;
            next += 1;
            let sampler = (decl.sample == SampleKind::Filterable).then(|| {
                next += 1;
                next - 1
            });
            TextureBinding {
                name: decl.name.clone(),
                texture,
                sampler,
                dimension: decl.dimension,
                sample: decl.sample,
            }
        })
        .collect()
}

fn wgsl_type(kind: UniformKind) -> &'static str {
    match kind {
        UniformKind::Scalar | UniformKind::Vec4 => "vec4<f32>",
        UniformKind::Mat4 => "mat4x4<f32>",
    }
}

/// WGSL declarations of the uniform block `u` and every texture binding.
pub fn interface_source(uniforms: &[UniformDecl], samplers: &[SamplerDecl]) -> String {
    let mut out = String::from("struct Uniforms {\n");
    let mut seen = std::collections::HashSet::new();
    for decl in uniforms.iter().filter(|d| seen.insert(d.name.as_str())) {
        let ty = wgsl_type(decl.kind);
        match decl.count {
            Some(n) => {
                let _ = writeln!(out, "    {}: array<{ty}, {n}>,", decl.name);
            }
            None => {
                let _ = writeln!(out, "    {}: {ty},", decl.name);
            }
        }
    }
    if seen.is_empty() {
        out.push_str("    unused: vec4<f32>,\n");
    }
    out.push_str("}\n\n@group(0) @binding(0) var<uniform> u: Uniforms;\n");

    for binding in texture_bindings(samplers) {
        let ty = match (binding.sample, binding.dimension) {
            (SampleKind::Depth, _) => "texture_depth_2d",
            (_, TextureDimension::D2) => "texture_2d<f32>",
            (_, TextureDimension::D3) => "texture_3d<f32>",
        };
        let _ = writeln!(
            out,
            "@group(0) @binding({}) var {}: {ty};",
            binding.texture, binding.name
        );
        if let Some(sampler) = binding.sampler {
            let _ = writeln!(
                out,
                "@group(0) @binding({sampler}) var {}_s: sampler;",
                binding.name
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(name: &str, kind: UniformKind, count: Option<usize>) -> UniformDecl {
        UniformDecl {
            name: name.to_string(),
            kind,
            count,
        }
    }

    #[test]
    fn test_layout_offsets() {
        let layout = UniformLayout::new(&[
            decl("a", UniformKind::Scalar, None),
            decl("m", UniformKind::Mat4, None),
            decl("arr", UniformKind::Scalar, Some(3)),
        ]);
        assert_eq!(layout.byte_size(), (1 + 4 + 3) * SLOT_BYTES);

        let mut block = vec![0.0; layout.byte_size() / 4];
        assert!(layout.write(&mut block, "a", &UniformValue::Int(7)));
        assert!(layout.write(
            &mut block,
            "arr",
            &UniformValue::FloatArray(vec![1.0, 2.0, 3.0, 4.0])
        ));
        assert!(!layout.write(&mut block, "missing", &UniformValue::Float(1.0)));
        assert_eq!(block[0], 7.0);
        // arr starts at slot 5; elements are one slot apart, the extra value is dropped.
        assert_eq!(block[20], 1.0);
        assert_eq!(block[24], 2.0);
        assert_eq!(block[28], 3.0);
        assert_eq!(block.len(), 32);
    }

    #[test]
    fn test_bindings_pair_samplers() {
        let samplers = [
            SamplerDecl {
                name: "vol".into(),
                dimension: TextureDimension::D3,
                sample: SampleKind::Filterable,
            },
            SamplerDecl {
                name: "depth".into(),
                dimension: TextureDimension::D2,
                sample: SampleKind::Depth,
            },
            SamplerDecl {
                name: "tf".into(),
                dimension: TextureDimension::D2,
                sample: SampleKind::Filterable,
            },
        ];
        let bindings = texture_bindings(&samplers);
        assert_eq!((bindings[0].texture, bindings[0].sampler), (1, Some(2)));
        assert_eq!((bindings[1].texture, bindings[1].sampler), (3, None));
        assert_eq!((bindings[2].texture, bindings[2].sampler), (4, Some(5)));

        let source = interface_source(&[decl("x", UniformKind::Vec4, None)], &samplers);
        assert!(source.contains("x: vec4<f32>,"));
        assert!(source.contains("var vol: texture_3d<f32>;"));
        assert!(source.contains("var vol_s: sampler;"));
        assert!(source.contains("var depth: texture_depth_2d;"));
        assert!(!source.contains("depth_s"));
    }
}
