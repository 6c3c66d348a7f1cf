use log::info;

use crate::common::{raw_from_word, PipelineStage};
use crate::instruction::instruction::HALT;
use crate::memory::memory_system::MemResponse;
use crate::pipeline::instruction::PipelineInstruction;
use crate::pipeline::pipeline::ExecutionContext;

#[derive(Debug, Default)]
pub struct PipelineFetch {}

impl PipelineFetch {
    /// Polls memory for the word at the program counter. The program counter
    /// advances once the word arrives, unless it is the HALT sentinel.
    pub fn fetch(instr: &mut PipelineInstruction, ctx: &mut ExecutionContext) {
        let address = *instr.address.get_or_insert_with(|| ctx.registers.pc());
        info!(
            "Pipeline::Fetch: INSTR_{} issuing fetch from address {address}",
            instr.id
        );

        match ctx.memory.read(PipelineStage::Fetch, address) {
            MemResponse::Wait => {
                info!("Pipeline::Fetch: INSTR_{} waiting on memory", instr.id);
            }
            MemResponse::Complete(word) => {
                let raw = raw_from_word(word);
                instr.raw_instr = Some(raw);
                if raw == HALT {
                    info!("Pipeline::Fetch: INSTR_{} is HALT", instr.id);
                } else {
                    ctx.registers.step_pc();
                    info!("Pipeline::Fetch: INSTR_{} got 0x{raw:08X}", instr.id);
                }
                instr.complete_stage();
            }
        }
    }
}
