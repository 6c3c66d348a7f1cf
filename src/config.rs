use anyhow::{anyhow, Result};

use crate::common::Cycle;
use crate::memory::cache::NUM_SETS;
use crate::register::vector_register::{VEC_LEN, VEC_REG_COUNT};

pub const DEFAULT_MEMORY_LINES: usize = 8000;
pub const DEFAULT_MEMORY_DELAY: Cycle = 3;
pub const DEFAULT_CACHE_LINES: usize = 16;
pub const DEFAULT_MAX_CYCLES: Cycle = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Number of 4-word lines in main memory
    pub lines: usize,
    /// Extra polls a request waits before completing
    pub delay: Cycle,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            lines: DEFAULT_MEMORY_LINES,
            delay: DEFAULT_MEMORY_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub lines: usize,
    pub write_allocate: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lines: DEFAULT_CACHE_LINES,
            write_allocate: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub use_pipeline: bool,
    pub use_cache: bool,
    /// Runs still going after this many cycles are aborted
    pub max_cycles: Cycle,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            use_pipeline: true,
            use_cache: true,
            max_cycles: DEFAULT_MAX_CYCLES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemConfig {
    pub memory: MemoryConfig,
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
    pub vector_count: usize,
    pub vector_len: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            memory: MemoryConfig::default(),
            cache: CacheConfig::default(),
            pipeline: PipelineConfig::default(),
            vector_count: VEC_REG_COUNT,
            vector_len: VEC_LEN,
        }
    }
}

impl SystemConfig {
    /// Checks the configuration for values the machine can't be built with
    pub fn validate(&self) -> Result<()> {
        if self.memory.lines == 0 {
            return Err(anyhow!("Main memory must hold at least one line"));
        }
        if self.cache.lines == 0 || self.cache.lines % NUM_SETS != 0 {
            return Err(anyhow!(
                "Cache line count must be a non-zero multiple of {NUM_SETS}, got {}",
                self.cache.lines
            ));
        }
        if self.vector_count == 0 || self.vector_count > VEC_REG_COUNT {
            return Err(anyhow!(
                "Vector register count must be between 1 and {VEC_REG_COUNT}, got {}",
                self.vector_count
            ));
        }
        if self.vector_len == 0 {
            return Err(anyhow!("Vector registers must hold at least one slot"));
        }
        if self.pipeline.max_cycles == 0 {
            return Err(anyhow!("Cycle limit must be non-zero"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SystemConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_unbalanced_cache() {
        let mut config = SystemConfig::default();
        config.cache.lines = 6;
        assert!(config.validate().is_err());
        config.cache.lines = 0;
        assert!(config.validate().is_err());
        config.cache.lines = 4;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_empty_memory() {
        let mut config = SystemConfig::default();
        config.memory.lines = 0;
        assert!(config.validate().is_err());
    }
}
