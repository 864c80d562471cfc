//! Texture unit allocation.
//!
//! Units are a shared device resource. Each acquisition returns a
//! [`UnitGuard`] that hands the unit back when dropped, so early returns and
//! errors never leak a unit.

use std::cell::Cell;
use std::rc::Rc;

use crate::error::{RenderError, RenderResult};
use crate::gpu::{GpuBackend, TextureHandle};

/// Upper bound on units tracked by the pool.
const MAX_TRACKED_UNITS: u32 = 64;

/// Pool of texture units.
#[derive(Debug, Clone)]
pub struct TextureUnits {
    in_use: Rc<Cell<u64>>,
    capacity: u32,
}

impl TextureUnits {
    /// Creates a pool of `capacity` units (at most 64).
    pub fn new(capacity: u32) -> Self {
        Self {
            in_use: Rc::new(Cell::new(0)),
            capacity: capacity.min(MAX_TRACKED_UNITS),
        }
    }

    /// Number of units in the pool.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of units currently held.
    pub fn in_use(&self) -> u32 {
        self.in_use.get().count_ones()
    }

    /// Takes the lowest free unit.
    pub fn acquire(&self) -> RenderResult<UnitGuard> {
        let mask = self.in_use.get();
        let unit = (!mask).trailing_zeros();
        if unit >= self.capacity {
            return Err(RenderError::TextureUnitsExhausted(self.capacity));
        }
        self.in_use.set(mask | (1 << unit));
        Ok(UnitGuard {
            pool: Rc::clone(&self.in_use),
            unit,
        })
    }
}

/// A held texture unit, released on drop.
#[derive(Debug)]
pub struct UnitGuard {
    pool: Rc<Cell<u64>>,
    unit: u32,
}

impl UnitGuard {
    /// The unit index.
    pub fn unit(&self) -> u32 {
        self.unit
    }
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        self.pool.set(self.pool.get() & !(1 << self.unit));
    }
}

/// Binds `texture` to a fresh unit and points sampler `name` at it.
pub fn activate(
    gpu: &mut dyn GpuBackend,
    units: &TextureUnits,
    name: &str,
    texture: TextureHandle,
) -> RenderResult<UnitGuard> {
    let guard = units.acquire()?;
    gpu.bind_texture(guard.unit(), texture)?;
    gpu.set_sampler(name, guard.unit());
    Ok(guard)
}

/// Unbinds the texture held by `guard` and returns the unit to the pool.
#[allow(clippy::needless_pass_by_value)]
pub fn deactivate(gpu: &mut dyn GpuBackend, guard: UnitGuard) {
    gpu.unbind_texture(guard.unit());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_lowest_free() {
        let units = TextureUnits::new(4);
        let a = units.acquire().unwrap();
        let b = units.acquire().unwrap();
        assert_eq!((a.unit(), b.unit()), (0, 1));
        drop(a);
        let c = units.acquire().unwrap();
        assert_eq!(c.unit(), 0);
        assert_eq!(units.in_use(), 2);
    }

    #[test]
    fn test_exhaustion_and_release_on_drop() {
        let units = TextureUnits::new(2);
        {
            let _a = units.acquire().unwrap();
            let _b = units.acquire().unwrap();
            assert!(matches!(
                units.acquire(),
                Err(RenderError::TextureUnitsExhausted(2))
            ));
        }
        assert_eq!(units.in_use(), 0);
    }

    #[test]
    fn test_guards_released_on_error_path() {
        fn bind_three(units: &TextureUnits) -> RenderResult<Vec<UnitGuard>> {
            let mut held = Vec::new();
            for _ in 0..3 {
                held.push(units.acquire()?);
            }
            Ok(held)
        }
        let units = TextureUnits::new(2);
        assert!(bind_three(&units).is_err());
        assert_eq!(units.in_use(), 0);
    }
}
