use std::collections::HashSet;
use std::fmt::Display;

use crate::common::{Address, PipelineStage, Word};
use crate::instruction::instruction::{Instruction, RawInstruction, ScalarOp};
use crate::register::register_system::{ConditionCode, RegisterRef};
use crate::register::vector_register::VectorSlot;

/// Program-order sequence number assigned when an instruction enters Fetch
pub type InstrId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionState {
    /// Work for the current stage is still outstanding
    Ready,
    /// Decoded, but waiting for an older instruction to retire
    Stalled { waiting_on: InstrId },
    /// Current stage finished, free to move on
    Completed,
}

/// A value committed to the register files in Write Back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineInstructionResult {
    Register { dest_reg: usize, data: Word },
    Vector {
        dest_reg: usize,
        data: Vec<VectorSlot>,
    },
    Append { dest_reg: usize, data: Word },
}

/// ALU operand that may still have to be fetched from memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Value(Word),
    Deref(Address),
}

/// Work staged by Execute for Memory Access. Progress made across polls is
/// kept in the action itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryAction {
    Alu {
        op: ScalarOp,
        rd: usize,
        swap_reg: Option<usize>,
        flags: Word,
        lhs: Operand,
        rhs: Operand,
    },
    Load {
        dest_reg: usize,
        address: Address,
    },
    Store {
        address: Address,
        data: Word,
    },
    VectorLoad {
        dest_reg: usize,
        base: Address,
        length: usize,
        loaded: Vec<VectorSlot>,
    },
    VectorStore {
        base: Address,
        data: Vec<Word>,
        written: usize,
    },
    Branch {
        cond: ConditionCode,
        target: Address,
        return_address: Option<Word>,
    },
}

/// An instruction in flight through the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineInstruction {
    pub id: InstrId,
    pub stage: PipelineStage,
    pub state: InstructionState,
    /// Address the instruction was fetched from
    pub address: Option<Address>,
    pub raw_instr: Option<RawInstruction>,
    pub decode_instr: Option<Instruction>,
    pub completed_stages: Vec<PipelineStage>,
    /// Registers this instruction will write
    pub stall_set: HashSet<RegisterRef>,
    /// Registers this instruction reads
    pub read_set: HashSet<RegisterRef>,
    pub memory_action: Option<MemoryAction>,
    pub results: Vec<PipelineInstructionResult>,
}

impl PipelineInstruction {
    pub fn new(id: InstrId) -> Self {
        Self {
            id,
            stage: PipelineStage::Fetch,
            state: InstructionState::Ready,
            address: None,
            raw_instr: None,
            decode_instr: None,
            completed_stages: Vec::new(),
            stall_set: HashSet::new(),
            read_set: HashSet::new(),
            memory_action: None,
            results: Vec::new(),
        }
    }

    /// Marks the current stage's work as done
    pub fn complete_stage(&mut self) {
        self.state = InstructionState::Completed;
        self.completed_stages.push(self.stage);
    }

    /// Moves the instruction into `stage` with that stage's work outstanding
    pub fn enter(&mut self, stage: PipelineStage) {
        self.stage = stage;
        self.state = InstructionState::Ready;
    }

    pub fn is_branch(&self) -> bool {
        self.decode_instr.is_some_and(|instr| instr.is_branch())
    }

    pub fn is_compare(&self) -> bool {
        self.decode_instr.is_some_and(|instr| instr.is_compare())
    }
}

impl Display for PipelineInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "INSTR_{}", self.id)?;
        if let Some(address) = self.address {
            write!(f, " @{address}")?;
        }
        match (self.decode_instr, self.raw_instr) {
            (Some(instr), _) => write!(f, ": {instr}")?,
            (None, Some(raw)) => write!(f, ": 0x{raw:08X}")?,
            (None, None) => {}
        }
        match self.state {
            InstructionState::Ready => {}
            InstructionState::Stalled { waiting_on } => {
                write!(f, " (stalled on INSTR_{waiting_on})")?;
            }
            InstructionState::Completed => write!(f, " (done)")?,
        }

        Ok(())
    }
}
