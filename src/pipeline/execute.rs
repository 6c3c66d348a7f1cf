#![warn(clippy::all, clippy::pedantic)]

use anyhow::{anyhow, bail, Result};
use log::{info, warn};

use crate::common::{word_from_raw, word_to_address, Address, Word};
use crate::instruction::instruction::{Instruction, ScalarOp, VectorOp};
use crate::pipeline::instruction::{
    MemoryAction, Operand, PipelineInstruction, PipelineInstructionResult,
};
use crate::register::register_system::{
    flags_to_word, get_comparison_flags, ConditionCode, RegisterSet, COND_REG, FLAG_COUNT,
    LINK_REG,
};
use crate::register::vector_register::{VectorRegisterSet, VectorSlot};

#[derive(Debug, Default)]
pub struct PipelineExecute {}

impl PipelineExecute {
    /// Reads operands and computes every result that needs no memory. Work
    /// that does is staged as a `MemoryAction` for Memory Access.
    pub fn execute(
        instr: &mut PipelineInstruction,
        registers: &RegisterSet,
        vectors: &VectorRegisterSet,
    ) -> Result<()> {
        let Some(decoded) = instr.decode_instr else {
            instr.complete_stage();
            return Ok(());
        };
        info!("Pipeline::Execute: INSTR_{} executing {decoded}", instr.id);

        let reg = |num: usize| registers.read(num);
        let addr = |num: usize| word_to_address(registers.read(num));
        let flags = registers.read(COND_REG);

        match decoded {
            Instruction::Type0 { op, rd, r1, r2, .. } => {
                let swap_reg = (op == ScalarOp::Swap).then_some(r2);
                instr.results = scalar_results(op, rd, swap_reg, flags, reg(r1), reg(r2))?;
            }
            Instruction::Type1 { op, rd, r1, r2, .. } => {
                instr.memory_action = Some(alu_action(
                    op,
                    rd,
                    flags,
                    Operand::Deref(addr(r1)),
                    Operand::Deref(addr(r2)),
                ));
            }
            Instruction::Type2 { op, rd, r1, r2, .. } => {
                instr.memory_action = Some(alu_action(
                    op,
                    rd,
                    flags,
                    Operand::Deref(addr(r1)),
                    Operand::Value(reg(r2)),
                ));
            }
            Instruction::Type3 {
                op,
                rd,
                r1,
                immediate,
            } => {
                let rhs = word_from_raw(immediate);
                instr.results = scalar_results(op, rd, None, flags, reg(r1), rhs)?;
            }
            Instruction::Type4 {
                op,
                rd,
                r1,
                immediate,
            } => {
                instr.memory_action = Some(alu_action(
                    op,
                    rd,
                    flags,
                    Operand::Deref(addr(r1)),
                    Operand::Value(word_from_raw(immediate)),
                ));
            }
            Instruction::Type5 {
                op: ScalarOp::Load,
                rd,
                r1,
            } => {
                instr.memory_action = Some(MemoryAction::Load {
                    dest_reg: rd,
                    address: addr(r1),
                });
            }
            Instruction::Type5 { rd, r1, .. } => {
                instr.memory_action = Some(MemoryAction::Store {
                    address: addr(rd),
                    data: reg(r1),
                });
            }
            Instruction::Type6 {
                op: ScalarOp::Load,
                rd,
                immediate,
            } => {
                instr.results = vec![PipelineInstructionResult::Register {
                    dest_reg: rd,
                    data: word_from_raw(immediate),
                }];
            }
            Instruction::Type6 { rd, immediate, .. } => {
                instr.memory_action = Some(MemoryAction::Store {
                    address: addr(rd),
                    data: word_from_raw(immediate),
                });
            }
            Instruction::Type7 { cond, link, offset } => {
                let address = instr.address.unwrap_or_default();
                let target = if cond == ConditionCode::Return {
                    addr(LINK_REG)
                } else {
                    branch_target(address, offset)?
                };
                let return_address = if link {
                    Some(word_from_raw(u32::try_from(address + 1)?))
                } else {
                    None
                };
                instr.memory_action = Some(MemoryAction::Branch {
                    cond,
                    target,
                    return_address,
                });
            }
            Instruction::Type8 {
                op: VectorOp::Load,
                vd,
                r1,
                length,
            } => {
                instr.memory_action = Some(MemoryAction::VectorLoad {
                    dest_reg: vd,
                    base: addr(r1),
                    length,
                    loaded: Vec::with_capacity(length),
                });
            }
            Instruction::Type8 {
                op: VectorOp::Store,
                vd,
                r1,
                length,
            } => {
                // absent slots are stored as zero
                let data = vectors
                    .get(vd)
                    .iter()
                    .take(length)
                    .map(|slot| slot.unwrap_or_default())
                    .collect();
                instr.memory_action = Some(MemoryAction::VectorStore {
                    base: addr(r1),
                    data,
                    written: 0,
                });
            }
            Instruction::Type8 { vd, r1, .. } => {
                instr.results = vec![PipelineInstructionResult::Append {
                    dest_reg: vd,
                    data: reg(r1),
                }];
            }
            Instruction::Type9 {
                op,
                vd,
                v1,
                v2,
                length,
                ..
            } => {
                let data = (0..length)
                    .map(|i| match (vectors.get_slot(v1, i), vectors.get_slot(v2, i)) {
                        (Some(lhs), Some(rhs)) => vector_alu(op, lhs, rhs).map(Some),
                        _ => Ok(None),
                    })
                    .collect::<Result<Vec<VectorSlot>>>()?;
                instr.results = vec![PipelineInstructionResult::Vector { dest_reg: vd, data }];
            }
            Instruction::Type10 {
                op,
                vd,
                v1,
                immediate,
                length,
                ..
            } => {
                let rhs = word_from_raw(immediate);
                let data = (0..length)
                    .map(|i| {
                        vectors
                            .get_slot(v1, i)
                            .map(|lhs| vector_alu(op, lhs, rhs))
                            .transpose()
                    })
                    .collect::<Result<Vec<VectorSlot>>>()?;
                instr.results = vec![PipelineInstructionResult::Vector { dest_reg: vd, data }];
            }
            Instruction::Halt | Instruction::Invalid(_) => {
                info!("Pipeline::Execute: INSTR_{} is a NOOP", instr.id);
            }
        }

        instr.complete_stage();
        Ok(())
    }
}

fn alu_action(op: ScalarOp, rd: usize, flags: Word, lhs: Operand, rhs: Operand) -> MemoryAction {
    MemoryAction::Alu {
        op,
        rd,
        swap_reg: None,
        flags,
        lhs: if op.uses_a() { lhs } else { Operand::Value(0) },
        rhs: if op.uses_b() { rhs } else { Operand::Value(0) },
    }
}

fn branch_target(address: Address, offset: i32) -> Result<Address> {
    isize::try_from(address)
        .ok()
        .and_then(|address| address.checked_add(isize::try_from(offset).ok()?))
        .and_then(|target| Address::try_from(target).ok())
        .ok_or_else(|| anyhow!("Branch from {address} by {offset} leaves the address space"))
}

fn overflowed((value, overflow): (Word, bool), op: impl std::fmt::Display) -> Word {
    if overflow {
        warn!("Pipeline::Execute: {op} overflowed, result wrapped to {value}");
    }
    value
}

/// Scalar ALU. Division and modulo by zero fault the instruction.
pub fn alu(op: ScalarOp, lhs: Word, rhs: Word) -> Result<Word> {
    Ok(match op {
        ScalarOp::Add => overflowed(lhs.overflowing_add(rhs), op),
        ScalarOp::Subtract => overflowed(lhs.overflowing_sub(rhs), op),
        ScalarOp::Multiply => overflowed(lhs.overflowing_mul(rhs), op),
        ScalarOp::Divide => {
            if rhs == 0 {
                bail!("Division by zero ({lhs} / 0)");
            }
            overflowed(lhs.overflowing_div(rhs), op)
        }
        ScalarOp::Modulo => {
            if rhs == 0 {
                bail!("Division by zero ({lhs} % 0)");
            }
            overflowed(lhs.overflowing_rem(rhs), op)
        }
        ScalarOp::And => lhs & rhs,
        ScalarOp::Or => lhs | rhs,
        ScalarOp::Xor => lhs ^ rhs,
        ScalarOp::Not => !lhs,
        ScalarOp::Shift => {
            warn!("Pipeline::Execute: opcode 7 is shared with BRANCH, executing as SHIFT");
            lhs.wrapping_shl(rhs.rem_euclid(32).unsigned_abs())
        }
        ScalarOp::Swap => rhs,
        ScalarOp::Compare => flags_to_word(get_comparison_flags(lhs, rhs)),
        ScalarOp::SetFlag | ScalarOp::Load | ScalarOp::Store => {
            bail!("{op} is not an ALU operation")
        }
    })
}

/// Register writes produced by a scalar ALU op on resolved operands
pub fn scalar_results(
    op: ScalarOp,
    rd: usize,
    swap_reg: Option<usize>,
    flags: Word,
    lhs: Word,
    rhs: Word,
) -> Result<Vec<PipelineInstructionResult>> {
    let register = |dest_reg, data| PipelineInstructionResult::Register { dest_reg, data };
    Ok(match op {
        ScalarOp::SetFlag => {
            let bit = rhs.rem_euclid(Word::try_from(FLAG_COUNT)?);
            vec![register(COND_REG, flags | (1 << bit))]
        }
        ScalarOp::Compare => vec![register(COND_REG, alu(op, lhs, rhs)?)],
        ScalarOp::Swap => {
            let mut results = Vec::with_capacity(2);
            if let Some(other) = swap_reg {
                results.push(register(other, lhs));
            }
            results.push(register(rd, rhs));
            results
        }
        _ => vec![register(rd, alu(op, lhs, rhs)?)],
    })
}

/// Element-wise vector ALU
pub fn vector_alu(op: VectorOp, lhs: Word, rhs: Word) -> Result<Word> {
    match op {
        VectorOp::Add => alu(ScalarOp::Add, lhs, rhs),
        VectorOp::Subtract => alu(ScalarOp::Subtract, lhs, rhs),
        VectorOp::Multiply => alu(ScalarOp::Multiply, lhs, rhs),
        VectorOp::Divide => alu(ScalarOp::Divide, lhs, rhs),
        VectorOp::Append | VectorOp::Load | VectorOp::Store => {
            bail!("Vector {op} has no element-wise form")
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::instruction::assembler::assemble;
    use crate::register::register_system::PC_REG;

    use rand::random;

    fn run(
        line: &str,
        registers: &RegisterSet,
        vectors: &VectorRegisterSet,
    ) -> Result<PipelineInstruction> {
        let mut instr = PipelineInstruction::new(0);
        instr.address = Some(10);
        instr.decode_instr = Some(crate::instruction::instruction::decode_raw_instr(
            assemble(line)?,
        ));
        PipelineExecute::execute(&mut instr, registers, vectors)?;
        Ok(instr)
    }

    fn reg_result(dest_reg: usize, data: Word) -> PipelineInstructionResult {
        PipelineInstructionResult::Register { dest_reg, data }
    }

    #[test]
    fn alu_matches_host_arithmetic() {
        for _ in 0..100 {
            let lhs = random::<i16>().into();
            let rhs: Word = random::<i16>().into();
            assert_eq!(lhs + rhs, alu(ScalarOp::Add, lhs, rhs).unwrap());
            assert_eq!(lhs - rhs, alu(ScalarOp::Subtract, lhs, rhs).unwrap());
            assert_eq!(lhs * rhs, alu(ScalarOp::Multiply, lhs, rhs).unwrap());
            assert_eq!(lhs ^ rhs, alu(ScalarOp::Xor, lhs, rhs).unwrap());
            if rhs != 0 {
                assert_eq!(lhs / rhs, alu(ScalarOp::Divide, lhs, rhs).unwrap());
                assert_eq!(lhs % rhs, alu(ScalarOp::Modulo, lhs, rhs).unwrap());
            }
        }
    }

    #[test]
    fn division_by_zero_faults() {
        assert!(alu(ScalarOp::Divide, 4, 0).is_err());
        assert!(alu(ScalarOp::Modulo, 4, 0).is_err());
        assert!(vector_alu(VectorOp::Divide, 4, 0).is_err());
    }

    #[test]
    fn overflow_wraps() {
        assert_eq!(Word::MIN, alu(ScalarOp::Add, Word::MAX, 1).unwrap());
        assert_eq!(Word::MIN, alu(ScalarOp::Divide, Word::MIN, -1).unwrap());
    }

    #[test]
    fn immediate_load_completes_in_execute() {
        let instr = run(
            "LOAD R3 42",
            &RegisterSet::new(),
            &VectorRegisterSet::default(),
        ).unwrap();
        assert_eq!(vec![reg_result(3, 42)], instr.results);
        assert!(instr.memory_action.is_none());
    }

    #[test]
    fn swap_writes_both_registers() {
        let mut registers = RegisterSet::new();
        registers.write_normal(1, 3);
        registers.write_normal(2, 4);
        let instr = run("SWAP R3 R3 R4", &registers, &VectorRegisterSet::default()).unwrap();
        assert!(instr.results.contains(&reg_result(3, 2)));
        assert!(instr.results.contains(&reg_result(4, 1)));
    }

    #[test]
    fn set_flag_ors_into_condition_register() {
        let mut registers = RegisterSet::new();
        registers.write_normal(0b1, COND_REG);
        let instr = run("SETFLAG 10", &registers, &VectorRegisterSet::default()).unwrap();
        assert_eq!(vec![reg_result(COND_REG, 0b1_0001)], instr.results);
    }

    #[test]
    fn deref_operands_are_staged() {
        let mut registers = RegisterSet::new();
        registers.write_normal(100, 1);
        let instr = run("ADD R0 [R1] 3", &registers, &VectorRegisterSet::default()).unwrap();
        assert!(instr.results.is_empty());
        assert_eq!(
            Some(MemoryAction::Alu {
                op: ScalarOp::Add,
                rd: 0,
                swap_reg: None,
                flags: 0,
                lhs: Operand::Deref(100),
                rhs: Operand::Value(3),
            }),
            instr.memory_action
        );
    }

    #[test]
    fn branch_target_is_relative_to_branch() {
        let registers = RegisterSet::new();
        let instr = run("CALL -4 IF EQ", &registers, &VectorRegisterSet::default()).unwrap();
        assert_eq!(
            Some(MemoryAction::Branch {
                cond: ConditionCode::EQ,
                target: 6,
                return_address: Some(11),
            }),
            instr.memory_action
        );
        assert!(run(
            "BRANCH -11",
            &RegisterSet::new(),
            &VectorRegisterSet::default(),
        ).is_err());
    }

    #[test]
    fn vector_ops_skip_absent_slots() {
        let mut vectors = VectorRegisterSet::default();
        vectors.set(1, &[Some(1), Some(2), None]);
        vectors.set(2, &[Some(10), Some(20), Some(30)]);
        let instr = run("MULTIPLY V0 V1 V2 3", &RegisterSet::new(), &vectors).unwrap();
        assert_eq!(
            vec![PipelineInstructionResult::Vector {
                dest_reg: 0,
                data: vec![Some(10), Some(40), None],
            }],
            instr.results
        );
        let instr = run("ADD V0 V1 5 2", &RegisterSet::new(), &vectors).unwrap();
        assert_eq!(
            vec![PipelineInstructionResult::Vector {
                dest_reg: 0,
                data: vec![Some(6), Some(7)],
            }],
            instr.results
        );
    }

    #[test]
    fn program_counter_is_untouched() {
        let mut registers = RegisterSet::new();
        registers.write_normal(77, PC_REG);
        run("ADD R0 R0 1", &registers, &VectorRegisterSet::default()).unwrap();
        assert_eq!(77, registers.pc());
    }
}
