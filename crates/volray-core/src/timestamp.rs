//! Modification timestamps.
//!
//! Every mutable object in the data model (functions, properties, image data,
//! mapper options) carries a [`TimeStamp`] that is bumped on mutation. Caches
//! compare these stamps against the stamp recorded at their last rebuild.

use std::sync::atomic::{AtomicU64, Ordering};

static GLOBAL_TIME: AtomicU64 = AtomicU64::new(0);

/// A point on the global, monotonically increasing modification clock.
///
/// The default stamp (zero) is older than any stamp handed out by
/// [`TimeStamp::now`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeStamp(u64);

impl TimeStamp {
    /// A stamp newer than any real modification.
    pub const MAX: Self = Self(u64::MAX);

    /// Returns a fresh stamp, strictly newer than every stamp issued before.
    #[must_use]
    pub fn now() -> Self {
        Self(GLOBAL_TIME.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Marks this stamp as modified right now.
    pub fn modified(&mut self) {
        *self = Self::now();
    }

    /// Returns the raw counter value.
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }

    /// Returns true if this stamp was never set.
    #[must_use]
    pub fn is_unset(self) -> bool {
        self.0 == 0
    }
}
