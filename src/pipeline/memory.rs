use anyhow::{bail, Result};
use log::info;

use crate::common::{PipelineStage, Word};
use crate::memory::memory_system::{MemResponse, MemoryInterface};
use crate::pipeline::execute::scalar_results;
use crate::pipeline::instruction::{
    MemoryAction, Operand, PipelineInstruction, PipelineInstructionResult,
};
use crate::pipeline::pipeline::ExecutionContext;
use crate::register::register_system::LINK_REG;

#[derive(Debug, Default)]
pub struct PipelineMemory {}

impl PipelineMemory {
    /// Polls the memory work staged by Execute. The stage completes once
    /// every access the instruction needs has been served.
    pub fn memory(instr: &mut PipelineInstruction, ctx: &mut ExecutionContext) -> Result<()> {
        let Some(mut action) = instr.memory_action.take() else {
            instr.complete_stage();
            return Ok(());
        };

        let done = Self::progress(&mut action, ctx, &mut instr.results)?;
        if done {
            info!(
                "Pipeline::Memory: INSTR_{} finished memory access",
                instr.id
            );
            instr.complete_stage();
        } else {
            info!("Pipeline::Memory: INSTR_{} waiting on memory", instr.id);
        }
        instr.memory_action = Some(action);
        Ok(())
    }

    fn progress(
        action: &mut MemoryAction,
        ctx: &mut ExecutionContext,
        results: &mut Vec<PipelineInstructionResult>,
    ) -> Result<bool> {
        match action {
            MemoryAction::Alu {
                op,
                rd,
                swap_reg,
                flags,
                lhs,
                rhs,
            } => {
                let Some(lhs) = resolve(lhs, &mut *ctx.memory) else {
                    return Ok(false);
                };
                let Some(rhs) = resolve(rhs, &mut *ctx.memory) else {
                    return Ok(false);
                };
                results.extend(scalar_results(*op, *rd, *swap_reg, *flags, lhs, rhs)?);
            }
            MemoryAction::Load { dest_reg, address } => {
                match ctx.memory.read(PipelineStage::Memory, *address) {
                    MemResponse::Wait => return Ok(false),
                    MemResponse::Complete(data) => {
                        results.push(PipelineInstructionResult::Register {
                            dest_reg: *dest_reg,
                            data,
                        });
                    }
                }
            }
            MemoryAction::Store { address, data } => {
                if ctx.memory.store(PipelineStage::Memory, *address, *data).is_wait() {
                    return Ok(false);
                }
            }
            MemoryAction::VectorLoad {
                dest_reg,
                base,
                length,
                loaded,
            } => {
                while loaded.len() < *length {
                    match ctx.memory.read(PipelineStage::Memory, *base + loaded.len()) {
                        MemResponse::Wait => return Ok(false),
                        MemResponse::Complete(word) => loaded.push(Some(word)),
                    }
                }
                results.push(PipelineInstructionResult::Vector {
                    dest_reg: *dest_reg,
                    data: loaded.clone(),
                });
            }
            MemoryAction::VectorStore {
                base,
                data,
                written,
            } => {
                while *written < data.len() {
                    match ctx.memory.write_line_partial(
                        PipelineStage::Memory,
                        *base + *written,
                        &data[*written..],
                    ) {
                        MemResponse::Wait => return Ok(false),
                        MemResponse::Complete(0) => {
                            bail!("Vector store to {} made no progress", *base + *written)
                        }
                        MemResponse::Complete(count) => *written += count,
                    }
                }
            }
            MemoryAction::Branch {
                cond,
                target,
                return_address,
            } => {
                if ctx.registers.condition_holds(*cond) {
                    info!("Pipeline::Memory: branch {cond} taken to {target}");
                    ctx.registers.set_pc(*target);
                    if let Some(data) = *return_address {
                        results.push(PipelineInstructionResult::Register {
                            dest_reg: LINK_REG,
                            data,
                        });
                    }
                } else {
                    info!("Pipeline::Memory: branch {cond} not taken");
                }
            }
        }

        Ok(true)
    }
}

/// Replaces a dereferenced operand with the word it points to, `None` while
/// memory is still busy
fn resolve(operand: &mut Operand, memory: &mut dyn MemoryInterface) -> Option<Word> {
    if let Operand::Deref(address) = *operand {
        *operand = Operand::Value(memory.read(PipelineStage::Memory, address).complete()?);
    }
    match *operand {
        Operand::Value(value) => Some(value),
        Operand::Deref(_) => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::instruction::instruction::ScalarOp;
    use crate::memory::memory_system::Memory;
    use crate::register::register_system::{ConditionCode, RegisterSet};
    use crate::register::vector_register::VectorRegisterSet;

    struct Fixture {
        registers: RegisterSet,
        vectors: VectorRegisterSet,
        memory: Memory,
    }

    impl Fixture {
        fn new(delay: usize) -> Self {
            Self {
                registers: RegisterSet::new(),
                vectors: VectorRegisterSet::default(),
                memory: Memory::new(64, delay).unwrap(),
            }
        }

        /// Polls the instruction until Memory Access completes, returning the
        /// number of polls taken
        fn run(&mut self, instr: &mut PipelineInstruction) -> usize {
            let mut ctx = ExecutionContext {
                registers: &mut self.registers,
                vector_registers: &mut self.vectors,
                memory: &mut self.memory,
            };
            for polls in 1..100 {
                PipelineMemory::memory(instr, &mut ctx).unwrap();
                if instr.completed_stages.contains(&PipelineStage::Memory) {
                    return polls;
                }
            }
            panic!("memory access never completed");
        }
    }

    fn with_action(action: MemoryAction) -> PipelineInstruction {
        let mut instr = PipelineInstruction::new(0);
        instr.enter(PipelineStage::Memory);
        instr.memory_action = Some(action);
        instr
    }

    #[test]
    fn load_waits_for_memory() {
        let mut fixture = Fixture::new(2);
        fixture.memory.force_store(30, 8);
        let mut instr = with_action(MemoryAction::Load {
            dest_reg: 2,
            address: 30,
        });
        assert_eq!(3, fixture.run(&mut instr));
        assert_eq!(
            vec![PipelineInstructionResult::Register {
                dest_reg: 2,
                data: 8
            }],
            instr.results
        );
    }

    #[test]
    fn deref_operands_read_in_turn() {
        let mut fixture = Fixture::new(1);
        fixture.memory.force_store(5, 6);
        fixture.memory.force_store(9, 7);
        let mut instr = with_action(MemoryAction::Alu {
            op: ScalarOp::Multiply,
            rd: 1,
            swap_reg: None,
            flags: 0,
            lhs: Operand::Deref(5),
            rhs: Operand::Deref(9),
        });
        fixture.run(&mut instr);
        assert_eq!(
            vec![PipelineInstructionResult::Register {
                dest_reg: 1,
                data: 42
            }],
            instr.results
        );
    }

    #[test]
    fn vector_store_spans_lines() {
        let mut fixture = Fixture::new(1);
        let data: Vec<Word> = (1..=6).collect();
        let mut instr = with_action(MemoryAction::VectorStore {
            base: 2,
            data: data.clone(),
            written: 0,
        });
        fixture.run(&mut instr);
        for (offset, word) in data.into_iter().enumerate() {
            assert_eq!(word, fixture.memory.peek(2 + offset));
        }
    }

    #[test]
    fn vector_load_fills_prefix() {
        let mut fixture = Fixture::new(0);
        for address in 0..5 {
            fixture.memory.force_store(address, Word::try_from(address).unwrap() * 2);
        }
        let mut instr = with_action(MemoryAction::VectorLoad {
            dest_reg: 3,
            base: 1,
            length: 3,
            loaded: Vec::new(),
        });
        assert_eq!(1, fixture.run(&mut instr));
        assert_eq!(
            vec![PipelineInstructionResult::Vector {
                dest_reg: 3,
                data: vec![Some(2), Some(4), Some(6)],
            }],
            instr.results
        );
    }

    #[test]
    fn branch_follows_condition_register() {
        let mut fixture = Fixture::new(0);
        fixture.registers.set_pc(4);
        let mut instr = with_action(MemoryAction::Branch {
            cond: ConditionCode::LT,
            target: 1,
            return_address: Some(4),
        });
        fixture.run(&mut instr);
        assert_eq!(4, fixture.registers.pc());
        assert!(instr.results.is_empty());

        fixture.registers.write_normal(1 << 4, 13);
        let mut instr = with_action(MemoryAction::Branch {
            cond: ConditionCode::LT,
            target: 1,
            return_address: Some(4),
        });
        fixture.run(&mut instr);
        assert_eq!(1, fixture.registers.pc());
        assert_eq!(
            vec![PipelineInstructionResult::Register {
                dest_reg: LINK_REG,
                data: 4
            }],
            instr.results
        );
    }
}
