use std::collections::BTreeMap;

use log::info;

use crate::instruction::instruction::decode_raw_instr;
use crate::pipeline::instruction::{InstrId, InstructionState, PipelineInstruction};

#[derive(Debug, Default)]
pub struct PipelineDecode {}

impl PipelineDecode {
    /// Decodes the fetched word and checks it against every older instruction
    /// still in flight. A hazard leaves the instruction stalled on its
    /// youngest producer.
    pub fn decode(
        instr: &mut PipelineInstruction,
        in_flight: &BTreeMap<InstrId, PipelineInstruction>,
    ) {
        if instr.decode_instr.is_none() {
            let Some(raw) = instr.raw_instr else {
                // nothing was fetched, pass the empty slot along
                instr.complete_stage();
                return;
            };
            let decoded = decode_raw_instr(raw);
            instr.read_set = decoded.get_src_regs().into_iter().collect();
            instr.stall_set = decoded.get_dest_regs().into_iter().collect();
            instr.decode_instr = Some(decoded);
            info!("Pipeline::Decode: INSTR_{} decoded as {decoded}", instr.id);
        }

        if let Some(producer) = Self::find_producer(instr, in_flight) {
            info!(
                "Pipeline::Decode: INSTR_{} stalled on INSTR_{producer}",
                instr.id
            );
            instr.state = InstructionState::Stalled {
                waiting_on: producer,
            };
        } else {
            instr.complete_stage();
        }
    }

    /// The youngest older instruction `instr` must wait for: one that writes
    /// a register `instr` reads, or, for branches, any pending COMPARE
    pub fn find_producer(
        instr: &PipelineInstruction,
        in_flight: &BTreeMap<InstrId, PipelineInstruction>,
    ) -> Option<InstrId> {
        let is_branch = instr.is_branch();
        in_flight
            .range(..instr.id)
            .rev()
            .find(|(_, older)| {
                !older.stall_set.is_disjoint(&instr.read_set) || (is_branch && older.is_compare())
            })
            .map(|(&id, _)| id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::instruction::assembler::assemble;

    fn fetched(id: InstrId, line: &str) -> PipelineInstruction {
        let mut instr = PipelineInstruction::new(id);
        instr.raw_instr = Some(assemble(line).unwrap());
        instr
    }

    fn decoded(id: InstrId, line: &str) -> PipelineInstruction {
        let mut instr = fetched(id, line);
        PipelineDecode::decode(&mut instr, &BTreeMap::new());
        instr
    }

    #[test]
    fn independent_instruction_completes() {
        let mut in_flight = BTreeMap::new();
        in_flight.insert(0, decoded(0, "LOAD R1 4"));
        let mut instr = fetched(1, "ADD R2 R3 R4");
        PipelineDecode::decode(&mut instr, &in_flight);
        assert_eq!(InstructionState::Completed, instr.state);
    }

    #[test]
    fn read_after_write_stalls_on_youngest_producer() {
        let mut in_flight = BTreeMap::new();
        in_flight.insert(0, decoded(0, "LOAD R0 0"));
        in_flight.insert(1, decoded(1, "LOAD R0 7"));
        in_flight.insert(2, decoded(2, "LOAD R5 7"));
        let mut instr = fetched(3, "ADD R0 R0 1");
        PipelineDecode::decode(&mut instr, &in_flight);
        assert_eq!(InstructionState::Stalled { waiting_on: 1 }, instr.state);
    }

    #[test]
    fn branch_waits_for_compare() {
        let mut in_flight = BTreeMap::new();
        in_flight.insert(4, decoded(4, "COMPARE R0 5"));
        in_flight.insert(5, decoded(5, "ADD R1 R1 1"));
        let mut instr = fetched(6, "BRANCH -2 IF LT");
        PipelineDecode::decode(&mut instr, &in_flight);
        assert_eq!(InstructionState::Stalled { waiting_on: 4 }, instr.state);
    }

    #[test]
    fn unconditional_branch_still_waits_for_compare() {
        let mut in_flight = BTreeMap::new();
        in_flight.insert(0, decoded(0, "COMPARE R0 R1"));
        let mut instr = fetched(1, "BRANCH 3");
        PipelineDecode::decode(&mut instr, &in_flight);
        assert_eq!(InstructionState::Stalled { waiting_on: 0 }, instr.state);
    }

    #[test]
    fn vector_and_scalar_registers_are_disjoint() {
        let mut in_flight = BTreeMap::new();
        in_flight.insert(0, decoded(0, "LOAD R2 1"));
        let mut instr = fetched(1, "ADD V3 V2 V2 4");
        PipelineDecode::decode(&mut instr, &in_flight);
        assert_eq!(InstructionState::Completed, instr.state);
    }

    #[test]
    fn younger_instructions_are_ignored() {
        let mut in_flight = BTreeMap::new();
        in_flight.insert(9, decoded(9, "LOAD R0 0"));
        let mut instr = fetched(3, "ADD R0 R0 1");
        PipelineDecode::decode(&mut instr, &in_flight);
        assert_eq!(InstructionState::Completed, instr.state);
    }
}
