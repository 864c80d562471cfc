//! Compiled programs keyed by their final source text.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::error::RenderResult;
use crate::gpu::{GpuBackend, ProgramHandle, ProgramSource};

/// Programs kept alive by default.
pub const DEFAULT_CAPACITY: usize = 16;

#[derive(Debug)]
struct CachedProgram {
    source: String,
    handle: ProgramHandle,
    last_used: u64,
}

/// Least-recently-used cache of compiled programs.
///
/// Two sources share a program only if their text is identical; evicted
/// programs are released on the device.
#[derive(Debug)]
pub struct ProgramCache {
    programs: HashMap<u64, CachedProgram>,
    capacity: usize,
    clock: u64,
}

impl Default for ProgramCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ProgramCache {
    /// Creates a cache holding at most `capacity` programs (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            programs: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    fn hash_source(source: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        source.hash(&mut hasher);
        hasher.finish()
    }

    /// Returns the program for `program`, compiling it if needed.
    ///
    /// The flag is true when a compilation happened.
    pub fn get_or_compile(
        &mut self,
        gpu: &mut dyn GpuBackend,
        program: &ProgramSource,
    ) -> RenderResult<(ProgramHandle, bool)> {
        self.clock += 1;
        let hash = Self::hash_source(&program.source);
        if let Some(cached) = self.programs.get_mut(&hash) {
            if cached.source == program.source {
                cached.last_used = self.clock;
                return Ok((cached.handle, false));
            }
            // Hash collision with different text
            log::debug!("program cache collision for {}", program.label);
            if let Some(stale) = self.programs.remove(&hash) {
                gpu.release_program(stale.handle);
            }
        }

        let handle = match gpu.compile_program(program) {
            Ok(handle) => handle,
            Err(err) => {
                log::error!("{err}");
                return Err(err);
            }
        };
        log::info!("compiled program {}", program.label);

        if self.programs.len() >= self.capacity {
            self.evict_oldest(gpu);
        }
        self.programs.insert(
            hash,
            CachedProgram {
                source: program.source.clone(),
                handle,
                last_used: self.clock,
            },
        );
        Ok((handle, true))
    }

    fn evict_oldest(&mut self, gpu: &mut dyn GpuBackend) {
        let oldest = self
            .programs
            .iter()
            .min_by_key(|(_, p)| p.last_used)
            .map(|(hash, _)| *hash);
        if let Some(program) = oldest.and_then(|hash| self.programs.remove(&hash)) {
            log::debug!("evicting program {:?}", program.handle);
            gpu.release_program(program.handle);
        }
    }

    /// Number of cached programs.
    pub fn len(&self) -> usize {
        self.programs.len()
    }

    /// True if no program is cached.
    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// Releases every program.
    pub fn release_all(&mut self, gpu: &mut dyn GpuBackend) {
        for (_, program) in self.programs.drain() {
            gpu.release_program(program.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordingBackend;

    fn program(text: &str) -> ProgramSource {
        ProgramSource {
            label: text.to_string(),
            source: text.to_string(),
            uniforms: Vec::new(),
            samplers: Vec::new(),
        }
    }

    #[test]
    fn test_identical_source_is_reused() {
        let mut gpu = RecordingBackend::new();
        let mut cache = ProgramCache::default();
        let (a, compiled) = cache.get_or_compile(&mut gpu, &program("a")).unwrap();
        assert!(compiled);
        let (again, compiled) = cache.get_or_compile(&mut gpu, &program("a")).unwrap();
        assert!(!compiled);
        assert_eq!(a, again);
        let (b, _) = cache.get_or_compile(&mut gpu, &program("b")).unwrap();
        assert_ne!(a, b);
        assert_eq!(gpu.stats().programs_compiled, 2);
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let mut gpu = RecordingBackend::new();
        let mut cache = ProgramCache::new(2);
        cache.get_or_compile(&mut gpu, &program("a")).unwrap();
        cache.get_or_compile(&mut gpu, &program("b")).unwrap();
        cache.get_or_compile(&mut gpu, &program("a")).unwrap();
        cache.get_or_compile(&mut gpu, &program("c")).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(gpu.live_programs(), 2);
        // "b" was evicted, "a" survived
        let (_, compiled) = cache.get_or_compile(&mut gpu, &program("a")).unwrap();
        assert!(!compiled);

        cache.release_all(&mut gpu);
        assert!(cache.is_empty());
        assert_eq!(gpu.live_programs(), 0);
    }

    #[test]
    fn test_compile_failure_is_reported() {
        let mut gpu = RecordingBackend::new();
        gpu.fail_programs_containing(Some("broken"));
        let mut cache = ProgramCache::default();
        assert!(cache.get_or_compile(&mut gpu, &program("broken")).is_err());
        assert!(cache.is_empty());
    }
}
