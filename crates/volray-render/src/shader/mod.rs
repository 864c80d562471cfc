//! Shader management.
//!
//! The ray-casting program is assembled from [`fragments`] for the feature
//! combination in a [`ShaderKey`], then compiled through a [`ProgramCache`]
//! keyed by the final source text.

pub mod builder;
pub mod cache;
pub mod fragments;
pub mod key;
pub mod uniforms;

pub use builder::{build_composite_program, build_depth_contour_program, ShaderBuilder};
pub use cache::ProgramCache;
pub use key::{InputFeatures, ShaderKey};
pub use uniforms::{UniformLayout, SLOT_BYTES};

/// When a [`ShaderReplacement`] is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReplacementStage {
    /// Before the feature fragments are substituted; can target slot markers.
    #[default]
    Template,
    /// On the assembled program.
    Assembled,
}

/// A user-supplied text substitution applied to the generated program.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderReplacement {
    pub original: String,
    pub replacement: String,
    pub replace_all: bool,
    pub stage: ReplacementStage,
}

impl ShaderReplacement {
    /// Replaces the first occurrence of `original` in the template.
    pub fn new(original: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            original: original.into(),
            replacement: replacement.into(),
            replace_all: false,
            stage: ReplacementStage::Template,
        }
    }

    /// Replaces every occurrence instead of the first.
    #[must_use]
    pub fn with_replace_all(mut self) -> Self {
        self.replace_all = true;
        self
    }

    /// Applies the replacement to the assembled program instead.
    #[must_use]
    pub fn after_assembly(mut self) -> Self {
        self.stage = ReplacementStage::Assembled;
        self
    }

    /// Applies the replacement to `source`; returns false if nothing matched.
    pub fn apply(&self, source: &mut String) -> bool {
        if self.original.is_empty() || !source.contains(&self.original) {
            return false;
        }
        *source = if self.replace_all {
            source.replace(&self.original, &self.replacement)
        } else {
            source.replacen(&self.original, &self.replacement, 1)
        };
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replacement_first_or_all() {
        let mut source = String::from("a b a");
        assert!(ShaderReplacement::new("a", "c").apply(&mut source));
        assert_eq!(source, "c b a");

        let mut source = String::from("a b a");
        assert!(ShaderReplacement::new("a", "c")
            .with_replace_all()
            .apply(&mut source));
        assert_eq!(source, "c b c");

        assert!(!ShaderReplacement::new("z", "c").apply(&mut source));
        assert!(!ShaderReplacement::new("", "c").apply(&mut source));
    }
}
