use log::info;

use crate::pipeline::instruction::{PipelineInstruction, PipelineInstructionResult};
use crate::register::register_system::RegisterSet;
use crate::register::vector_register::VectorRegisterSet;

#[derive(Debug, Default)]
pub struct PipelineWriteBack {}

impl PipelineWriteBack {
    /// Commits every queued register write. APPEND results go through the
    /// vector file's append rather than a plain set.
    pub fn write_back(
        instr: &mut PipelineInstruction,
        registers: &mut RegisterSet,
        vectors: &mut VectorRegisterSet,
    ) {
        for result in instr.results.drain(..) {
            info!(
                "Pipeline::WriteBack: INSTR_{} committing {result:?}",
                instr.id
            );
            match result {
                PipelineInstructionResult::Register { dest_reg, data } => {
                    registers.write_normal(data, dest_reg);
                }
                PipelineInstructionResult::Vector { dest_reg, data } => {
                    vectors.set(dest_reg, &data);
                }
                PipelineInstructionResult::Append { dest_reg, data } => {
                    // a full vector drops the value, which is reported but not fatal
                    vectors.append(dest_reg, data);
                }
            }
        }
        instr.complete_stage();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::register::vector_register::VEC_LEN;

    #[test]
    fn commits_all_results() {
        let mut registers = RegisterSet::new();
        let mut vectors = VectorRegisterSet::default();
        let mut instr = PipelineInstruction::new(0);
        instr.results = vec![
            PipelineInstructionResult::Register {
                dest_reg: 4,
                data: -3,
            },
            PipelineInstructionResult::Vector {
                dest_reg: 1,
                data: vec![Some(5), None, Some(7)],
            },
            PipelineInstructionResult::Append {
                dest_reg: 1,
                data: 6,
            },
        ];
        PipelineWriteBack::write_back(&mut instr, &mut registers, &mut vectors);
        assert_eq!(-3, registers.read(4));
        assert_eq!(&[Some(5), Some(6), Some(7)], &vectors.get(1)[..3]);
        assert!(instr.results.is_empty());
    }

    #[test]
    fn append_to_full_vector_is_dropped() {
        let mut registers = RegisterSet::new();
        let mut vectors = VectorRegisterSet::default();
        vectors.set(0, &[Some(1); VEC_LEN]);
        let mut instr = PipelineInstruction::new(0);
        instr.results = vec![PipelineInstructionResult::Append {
            dest_reg: 0,
            data: 9,
        }];
        PipelineWriteBack::write_back(&mut instr, &mut registers, &mut vectors);
        assert_eq!(vec![Some(1); VEC_LEN], vectors.get(0));
    }
}
