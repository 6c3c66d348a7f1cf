#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::collections::BTreeMap;
use std::fmt::Display;

use anyhow::Result;
use log::{error, info};

use crate::common::{Cycle, PipelineStage};
use crate::instruction::instruction::{instr_type, BRANCH_TYPE, HALT};
use crate::memory::memory_system::MemoryInterface;
use crate::pipeline::decode::PipelineDecode;
use crate::pipeline::execute::PipelineExecute;
use crate::pipeline::fetch::PipelineFetch;
use crate::pipeline::instruction::{InstrId, InstructionState, PipelineInstruction};
use crate::pipeline::memory::PipelineMemory;
use crate::pipeline::write_back::PipelineWriteBack;
use crate::register::register_system::RegisterSet;
use crate::register::vector_register::VectorRegisterSet;

const NUM_STAGES: usize = PipelineStage::STAGES.len();
const FETCH_SLOT: usize = 0;
const WRITE_BACK_SLOT: usize = NUM_STAGES - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMessage {
    Running,
    Halt,
    /// Nothing is running
    Idle,
}

/// Summary of a finished run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub cycles: Cycle,
    /// Instructions that completed Write Back, HALT excluded
    pub retired: usize,
    /// Instruction-cycles spent stalled on a hazard
    pub stalls: usize,
    pub halt_id: Option<InstrId>,
}

impl Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} cycles, {} instructions retired, {} stall cycles",
            self.cycles, self.retired, self.stalls
        )?;
        if let Some(id) = self.halt_id {
            write!(f, ", halted at INSTR_{id}")?;
        }
        Ok(())
    }
}

/// The state every stage works against
pub struct ExecutionContext<'a> {
    pub registers: &'a mut RegisterSet,
    pub vector_registers: &'a mut VectorRegisterSet,
    pub memory: &'a mut dyn MemoryInterface,
}

pub type CompletionCallback = Box<dyn FnOnce(&RunReport)>;

/// Cycle-driven scheduler over the five stage slots. Each cycle every
/// occupied stage does its work (Write Back first), completed instructions
/// move forward into free slots, and a new instruction may be admitted into
/// Fetch.
pub struct Pipeline {
    clock: Cycle,
    running: bool,
    use_pipeline: bool,
    slots: [Option<InstrId>; NUM_STAGES],
    in_flight: BTreeMap<InstrId, PipelineInstruction>,
    next_id: InstrId,
    /// A fetched branch that hasn't passed Memory Access yet
    unresolved_branch: Option<InstrId>,
    /// Id of the HALT instruction, no instruction at or past it is admitted
    end_id: Option<InstrId>,
    retired: usize,
    stalls: usize,
    on_complete: Option<CompletionCallback>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            clock: 0,
            running: false,
            use_pipeline: true,
            slots: [None; NUM_STAGES],
            in_flight: BTreeMap::new(),
            next_id: 0,
            unresolved_branch: None,
            end_id: None,
            retired: 0,
            stalls: 0,
            on_complete: None,
        }
    }

    /// Begins a run at the current program counter. `on_complete` fires once,
    /// after the instruction before HALT retires.
    pub fn start(&mut self, use_pipeline: bool, on_complete: Option<CompletionCallback>) {
        *self = Self::new();
        info!(
            "Pipeline: starting {} run",
            if use_pipeline { "pipelined" } else { "non-pipelined" }
        );
        self.use_pipeline = use_pipeline;
        self.on_complete = on_complete;
        self.running = true;
        self.admit();
    }

    /// Drops the current run without firing its completion callback
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn clock(&self) -> Cycle {
        self.clock
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_pipelined(&self) -> bool {
        self.use_pipeline
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            cycles: self.clock,
            retired: self.retired,
            stalls: self.stalls,
            halt_id: self.end_id,
        }
    }

    /// The instruction occupying each stage
    pub fn stage_contents(&self) -> Vec<(PipelineStage, Option<&PipelineInstruction>)> {
        PipelineStage::STAGES
            .iter()
            .zip(self.slots.iter())
            .map(|(&stage, slot)| (stage, slot.and_then(|id| self.in_flight.get(&id))))
            .collect()
    }

    /// Advances the pipeline by one cycle. A fault stops the run and is
    /// returned, the completion callback is dropped unfired.
    pub fn step(&mut self, ctx: &mut ExecutionContext) -> Result<SystemMessage> {
        if !self.running {
            return Ok(SystemMessage::Idle);
        }
        self.clock += 1;
        info!("Pipeline: cycle {}", self.clock);

        if let Err(e) = self.work(ctx) {
            error!("Pipeline: run stopped at cycle {}: {e}", self.clock);
            self.running = false;
            self.on_complete = None;
            return Err(e);
        }
        self.advance();

        if self.end_id.is_some() && self.in_flight.is_empty() {
            return Ok(self.finish());
        }
        self.admit();

        Ok(SystemMessage::Running)
    }

    /// Runs each occupied stage once, from Write Back down to Fetch
    fn work(&mut self, ctx: &mut ExecutionContext) -> Result<()> {
        for idx in (0..NUM_STAGES).rev() {
            let Some(id) = self.slots[idx] else {
                continue;
            };
            let Some(mut instr) = self.in_flight.remove(&id) else {
                error!("Pipeline: INSTR_{id} missing from the in-flight set");
                self.slots[idx] = None;
                continue;
            };
            let result = self.process(&mut instr, ctx);
            if instr.raw_instr == Some(HALT) {
                info!("Pipeline: HALT reached at INSTR_{id}");
                self.end_id = Some(id);
                self.slots[idx] = None;
            } else {
                self.in_flight.insert(id, instr);
            }
            result?;
        }
        Ok(())
    }

    fn process(
        &mut self,
        instr: &mut PipelineInstruction,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        match instr.state {
            InstructionState::Ready => {}
            InstructionState::Stalled { .. } => {
                self.stalls += 1;
                return Ok(());
            }
            InstructionState::Completed => return Ok(()),
        }

        match instr.stage {
            PipelineStage::Fetch => {
                PipelineFetch::fetch(instr, ctx);
                if instr.state == InstructionState::Completed
                    && instr.raw_instr.is_some_and(|raw| instr_type(raw) == BRANCH_TYPE)
                {
                    self.unresolved_branch = Some(instr.id);
                }
            }
            PipelineStage::Decode => PipelineDecode::decode(instr, &self.in_flight),
            PipelineStage::Execute => {
                PipelineExecute::execute(instr, ctx.registers, ctx.vector_registers)?;
            }
            PipelineStage::Memory => {
                PipelineMemory::memory(instr, ctx)?;
                if instr.state == InstructionState::Completed
                    && self.unresolved_branch == Some(instr.id)
                {
                    self.unresolved_branch = None;
                }
            }
            PipelineStage::WriteBack => {
                PipelineWriteBack::write_back(instr, ctx.registers, ctx.vector_registers);
            }
            PipelineStage::System => {
                error!("Pipeline: INSTR_{} outside of the pipeline", instr.id);
            }
        }
        Ok(())
    }

    fn slot_completed(&self, idx: usize) -> bool {
        self.slots[idx]
            .and_then(|id| self.in_flight.get(&id))
            .is_some_and(|instr| instr.state == InstructionState::Completed)
    }

    /// Retires Write Back, then moves completed instructions forward
    fn advance(&mut self) {
        if self.slot_completed(WRITE_BACK_SLOT) {
            if let Some(id) = self.slots[WRITE_BACK_SLOT].take() {
                self.in_flight.remove(&id);
                self.retired += 1;
                info!("Pipeline: INSTR_{id} retired");
                self.wake(id);
            }
        }

        for idx in (0..WRITE_BACK_SLOT).rev() {
            if self.slots[idx + 1].is_some() || !self.slot_completed(idx) {
                continue;
            }
            let Some(id) = self.slots[idx].take() else {
                continue;
            };
            if let Some(instr) = self.in_flight.get_mut(&id) {
                instr.enter(PipelineStage::STAGES[idx + 1]);
            }
            self.slots[idx + 1] = Some(id);
        }
    }

    /// Releases every instruction stalled on `producer`
    fn wake(&mut self, producer: InstrId) {
        for instr in self.in_flight.values_mut() {
            let stalled_on_producer = matches!(
                instr.state,
                InstructionState::Stalled { waiting_on } if waiting_on == producer
            );
            if stalled_on_producer {
                info!("Pipeline: INSTR_{} released by INSTR_{producer}", instr.id);
                instr.complete_stage();
            }
        }
    }

    /// Places a fresh instruction in Fetch when the admission policy allows it.
    /// Pipelined runs only hold back behind an unresolved branch, otherwise
    /// the previous instruction has to retire first.
    fn admit(&mut self) {
        if self.end_id.is_some() || self.slots[FETCH_SLOT].is_some() {
            return;
        }
        let blocked = if self.use_pipeline {
            self.unresolved_branch.is_some()
        } else {
            !self.in_flight.is_empty()
        };
        if blocked {
            return;
        }

        let id = self.next_id;
        self.next_id += 1;
        info!("Pipeline: admitting INSTR_{id} into Fetch");
        self.in_flight.insert(id, PipelineInstruction::new(id));
        self.slots[FETCH_SLOT] = Some(id);
    }

    fn finish(&mut self) -> SystemMessage {
        self.running = false;
        let report = self.report();
        info!("Pipeline: run complete, {report}");
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(&report);
        }
        SystemMessage::Halt
    }
}

impl Display for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Cycle {}", self.clock)?;
        for (stage, instr) in self.stage_contents() {
            match instr {
                Some(instr) => writeln!(f, "{:<14} {instr}", stage.to_string())?,
                None => writeln!(f, "{:<14} -", stage.to_string())?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::cell::Cell;
    use std::rc::Rc;

    use crate::instruction::assembler::assemble;
    use crate::memory::memory_system::Memory;

    struct Machine {
        registers: RegisterSet,
        vectors: VectorRegisterSet,
        memory: Memory,
        pipeline: Pipeline,
    }

    impl Machine {
        fn new(program: &[&str], delay: usize) -> Self {
            let mut memory = Memory::new(64, delay).unwrap();
            for (address, line) in program.iter().enumerate() {
                let raw = assemble(line).unwrap();
                memory.force_store(address, crate::common::word_from_raw(raw));
            }
            memory.force_store(program.len(), crate::common::word_from_raw(HALT));
            Self {
                registers: RegisterSet::new(),
                vectors: VectorRegisterSet::default(),
                memory,
                pipeline: Pipeline::new(),
            }
        }

        fn run(&mut self, use_pipeline: bool) -> RunReport {
            self.pipeline.start(use_pipeline, None);
            let mut ctx = ExecutionContext {
                registers: &mut self.registers,
                vector_registers: &mut self.vectors,
                memory: &mut self.memory,
            };
            for _ in 0..1000 {
                if self.pipeline.step(&mut ctx).unwrap() == SystemMessage::Halt {
                    return self.pipeline.report();
                }
            }
            panic!("program never halted");
        }
    }

    #[test]
    fn idle_until_started() {
        let mut machine = Machine::new(&[], 0);
        let mut ctx = ExecutionContext {
            registers: &mut machine.registers,
            vector_registers: &mut machine.vectors,
            memory: &mut machine.memory,
        };
        assert_eq!(
            SystemMessage::Idle,
            machine.pipeline.step(&mut ctx).unwrap()
        );
    }

    #[test]
    fn halt_only_program_completes_once() {
        let mut machine = Machine::new(&[], 0);
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        let on_complete: CompletionCallback = Box::new(move |_| counter.set(counter.get() + 1));
        machine.pipeline.start(true, Some(on_complete));
        let mut ctx = ExecutionContext {
            registers: &mut machine.registers,
            vector_registers: &mut machine.vectors,
            memory: &mut machine.memory,
        };
        assert_eq!(
            SystemMessage::Halt,
            machine.pipeline.step(&mut ctx).unwrap()
        );
        assert_eq!(
            SystemMessage::Idle,
            machine.pipeline.step(&mut ctx).unwrap()
        );
        assert_eq!(1, calls.get());
        assert_eq!(0, machine.pipeline.report().retired);
        assert_eq!(Some(0), machine.pipeline.report().halt_id);
    }

    #[test]
    fn hazard_stalls_consumer() {
        let mut machine = Machine::new(&["LOAD R0 0", "ADD R0 R0 1"], 0);
        let report = machine.run(true);
        assert_eq!(1, machine.registers.read(0));
        assert_eq!(2, report.retired);
        assert!(report.stalls > 0);
    }

    #[test]
    fn overlapping_is_faster_than_serial() {
        let program = ["LOAD R0 1", "LOAD R1 2", "LOAD R2 3", "ADD R3 R4 R5"];
        let pipelined = Machine::new(&program, 0).run(true);
        let mut serial_machine = Machine::new(&program, 0);
        let serial = serial_machine.run(false);
        assert_eq!(4, serial.retired);
        assert_eq!(0, serial.stalls);
        assert_eq!(5 * 4 + 1, serial.cycles);
        assert!(pipelined.cycles < serial.cycles);
        assert_eq!(3, serial_machine.registers.read(2));
    }

    #[test]
    fn no_fetch_past_unresolved_branch() {
        let mut machine = Machine::new(&["BRANCH 2", "LOAD R0 9", "LOAD R1 4"], 0);
        machine.run(true);
        assert_eq!(0, machine.registers.read(0));
        assert_eq!(4, machine.registers.read(1));
    }

    #[test]
    fn stage_contents_follow_instruction() {
        let mut machine = Machine::new(&["LOAD R0 1"], 0);
        machine.pipeline.start(true, None);
        let mut ctx = ExecutionContext {
            registers: &mut machine.registers,
            vector_registers: &mut machine.vectors,
            memory: &mut machine.memory,
        };
        machine.pipeline.step(&mut ctx).unwrap();
        let contents = machine.pipeline.stage_contents();
        assert_eq!(Some(0), contents[1].1.map(|instr| instr.id));
        assert_eq!(Some(1), contents[0].1.map(|instr| instr.id));
    }

    #[test]
    fn fault_drops_callback() {
        let mut machine = Machine::new(&["LOAD R1 0", "DIVIDE R0 R0 R1"], 0);
        let fired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fired);
        machine
            .pipeline
            .start(true, Some(Box::new(move |_| flag.set(true))));
        let mut ctx = ExecutionContext {
            registers: &mut machine.registers,
            vector_registers: &mut machine.vectors,
            memory: &mut machine.memory,
        };
        let mut outcome = Ok(SystemMessage::Running);
        for _ in 0..100 {
            outcome = machine.pipeline.step(&mut ctx);
            if !matches!(outcome, Ok(SystemMessage::Running)) {
                break;
            }
        }
        assert!(outcome.is_err());
        assert!(!machine.pipeline.is_running());
        assert!(!fired.get());
    }
}
