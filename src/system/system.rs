#![warn(clippy::all, clippy::pedantic)]

use std::fmt::Display;

use anyhow::{anyhow, bail, Result};
use log::{info, warn};
use strum_macros::{Display, EnumString};

use crate::common::{word_from_raw, Address, Cycle, PipelineStage, Word};
use crate::config::SystemConfig;
use crate::instruction::instruction::{RawInstruction, HALT};
use crate::memory::cache::Cache;
use crate::memory::memory_system::{complete_blocking, Memory, MemoryInterface};
use crate::pipeline::pipeline::{
    CompletionCallback, ExecutionContext, Pipeline, RunReport, SystemMessage,
};
use crate::register::register_system::RegisterSet;
use crate::register::vector_register::VectorRegisterSet;

/// Which memory interface the pipeline talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum MemoryMode {
    #[default]
    Cache,
    Direct,
}

pub struct System {
    pub config: SystemConfig,
    pub registers: RegisterSet,
    pub vector_registers: VectorRegisterSet,
    pub cache: Cache,
    pub pipeline: Pipeline,
    memory_mode: MemoryMode,
}

impl System {
    pub fn new(config: SystemConfig) -> Result<Self> {
        config.validate()?;
        let memory = Memory::new(config.memory.lines, config.memory.delay)?;
        let cache = Cache::new(config.cache.lines, memory)?
            .with_write_allocate(config.cache.write_allocate);

        Ok(Self {
            config,
            registers: RegisterSet::new(),
            vector_registers: VectorRegisterSet::new(config.vector_count, config.vector_len),
            cache,
            pipeline: Pipeline::new(),
            memory_mode: if config.pipeline.use_cache {
                MemoryMode::Cache
            } else {
                MemoryMode::Direct
            },
        })
    }

    /// Puts the whole machine back into its initial state, memory included
    pub fn reset(&mut self) -> Result<()> {
        info!("Resetting system");
        *self = Self::new(self.config)?;
        Ok(())
    }

    pub fn clock(&self) -> Cycle {
        self.pipeline.clock()
    }

    pub fn memory(&self) -> &Memory {
        self.cache.main_memory()
    }

    pub fn memory_mode(&self) -> MemoryMode {
        self.memory_mode
    }

    pub fn set_memory_mode(&mut self, mode: MemoryMode) {
        self.memory_mode = mode;
    }

    /// Debug read of a word as the program would see it, preferring the
    /// cached copy
    pub fn peek(&self, address: Address) -> Word {
        self.cache
            .peek(address)
            .unwrap_or_else(|| self.memory().peek(address))
    }

    /// Writes `program` into main memory starting at `start`, followed by a
    /// HALT unless it already ends with one. Returns the number of words
    /// written.
    pub fn load_program(&mut self, start: Address, program: &[RawInstruction]) -> Result<usize> {
        let mut words = program.to_vec();
        if words.last() != Some(&HALT) {
            words.push(HALT);
        }

        let capacity = self.memory().capacity();
        if words.len() > capacity {
            bail!(
                "Program is too large to fit in main memory: {} > {capacity}",
                words.len()
            );
        }

        // an abandoned run may still hold the memory tracker
        self.cache.clear_pending();
        let limit = 4 * (self.config.memory.delay + 1);
        for (offset, &raw) in words.iter().enumerate() {
            let address = start + offset;
            // stale cached copies would shadow the new program
            self.cache.invalidate(address);
            let memory = self.cache.main_memory_mut();
            complete_blocking(limit, || {
                memory.write(PipelineStage::System, address, word_from_raw(raw))
            })
            .map_err(|e| anyhow!("Loading word {offset} at address {address}: {e}"))?;
        }
        info!("Loaded {} words at address {start}", words.len());

        Ok(words.len())
    }

    /// Begins a run at `start` without driving it
    pub fn start(
        &mut self,
        start: Address,
        use_pipelining: bool,
        on_complete: Option<CompletionCallback>,
    ) {
        self.cache.clear_pending();
        self.registers.set_pc(start);
        self.pipeline.start(use_pipelining, on_complete);
    }

    /// Advances the running program by one cycle
    pub fn step(&mut self) -> Result<SystemMessage> {
        let Self {
            registers,
            vector_registers,
            cache,
            pipeline,
            memory_mode,
            ..
        } = self;
        let memory: &mut dyn MemoryInterface = match memory_mode {
            MemoryMode::Cache => &mut *cache,
            MemoryMode::Direct => cache.main_memory_mut(),
        };
        let mut ctx = ExecutionContext {
            registers,
            vector_registers,
            memory,
        };

        let message = pipeline.step(&mut ctx);
        if message.is_err() {
            cache.clear_pending();
        }
        message
    }

    /// Runs the program at `start` until HALT retires. `on_complete` receives
    /// the same report that is returned.
    pub fn run(
        &mut self,
        start: Address,
        use_pipelining: bool,
        mode: MemoryMode,
        on_complete: Option<CompletionCallback>,
    ) -> Result<RunReport> {
        self.memory_mode = mode;
        self.start(start, use_pipelining, on_complete);

        let max_cycles = self.config.pipeline.max_cycles;
        loop {
            if self.clock() >= max_cycles {
                warn!("Run exceeded {max_cycles} cycles, aborting");
                self.pipeline.reset();
                self.cache.clear_pending();
                bail!("Program did not halt within {max_cycles} cycles");
            }
            match self.step()? {
                SystemMessage::Running => {}
                SystemMessage::Halt => return Ok(self.pipeline.report()),
                SystemMessage::Idle => bail!("Pipeline stopped without reaching HALT"),
            }
        }
    }

    /// Runs with the configured pipelining and memory mode
    pub fn run_to_completion(&mut self, start: Address) -> Result<RunReport> {
        self.run(
            start,
            self.config.pipeline.use_pipeline,
            self.memory_mode,
            None,
        )
    }
}

impl Display for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.pipeline)?;
        writeln!(f, "{}", self.registers)?;
        write!(f, "{}", self.vector_registers)
    }
}
