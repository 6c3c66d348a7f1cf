use std::fmt::Display;

use log::warn;
use strum_macros::{Display, EnumIter, EnumString, FromRepr};

use crate::register::register_system::{ConditionCode, RegisterRef, COND_REG, LINK_REG};

const MASK_1: u32 = 0b1;
const MASK_4: u32 = 0b1111;
const MASK_5: u32 = 0b1_1111;
const MASK_8: u32 = 0b1111_1111;
const MASK_12: u32 = 0b1111_1111_1111;
const MASK_22: u32 = 0b11_1111_1111_1111_1111_1111;

const COND_SHIFT: u32 = 28;
const TYPE_SHIFT: u32 = 24;
const OPCODE_SHIFT: u32 = 20;
const LINK_SHIFT: u32 = 23;
const SIGN_SHIFT: u32 = 22;
const RD_SHIFT: u32 = 15;
const R1_SHIFT: u32 = 11;
const R2_SHIFT: u32 = 7;
const IMM_SHIFT: u32 = 3;
const VEC_MEM_LEN_SHIFT: u32 = 6;
const VEC_LEN_SHIFT: u32 = 2;
const VEC_IMM_SHIFT: u32 = 5;

pub type RawInstruction = u32;

pub const HALT: RawInstruction = 0x0F00_0000;
pub const BRANCH_TYPE: u32 = 7;

/// Largest immediate accepted by types 3, 4
pub const MAX_ALU_IMMEDIATE: u32 = MASK_8;
/// Largest immediate accepted by type 6
pub const MAX_MEM_IMMEDIATE: u32 = MASK_12;
/// Largest immediate or length in the vector types
pub const MAX_VEC_FIELD: u32 = MASK_5;
/// Largest branch offset magnitude
pub const MAX_BRANCH_OFFSET: u32 = MASK_22;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    EnumIter,
    FromRepr,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[repr(u32)]
pub enum ScalarOp {
    Add = 0,
    Subtract = 1,
    Multiply = 2,
    And = 3,
    Divide = 4,
    Or = 5,
    #[strum(to_string = "SETFLAG", serialize = "SET-FLAG")]
    SetFlag = 6,
    Shift = 7, // shares its opcode with BRANCH
    Modulo = 8,
    Not = 9,
    Xor = 10,
    Swap = 11,
    Compare = 12,
    Load = 13,
    Store = 14,
}

impl ScalarOp {
    /// Ops valid in the register/immediate ALU types 0-4
    pub fn is_alu(self) -> bool {
        !self.is_memory()
    }

    /// Ops valid in the load/store types 5, 6
    pub fn is_memory(self) -> bool {
        matches!(self, ScalarOp::Load | ScalarOp::Store)
    }

    /// Whether the op writes its `rd` field
    pub fn writes_rd(self) -> bool {
        !matches!(self, ScalarOp::Compare | ScalarOp::SetFlag)
    }

    /// Whether the op reads its first (`r1`) operand
    pub fn uses_a(self) -> bool {
        self != ScalarOp::SetFlag
    }

    /// Whether the op reads its second operand
    pub fn uses_b(self) -> bool {
        self != ScalarOp::Not
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    EnumIter,
    FromRepr,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[repr(u32)]
pub enum VectorOp {
    Add = 0,
    Subtract = 1,
    Multiply = 2,
    Divide = 4,
    Append = 7,
    Load = 13,
    Store = 14,
}

impl VectorOp {
    /// Ops valid in the element-wise types 9, 10
    pub fn is_alu(self) -> bool {
        !self.is_memory()
    }

    /// Ops valid in type 8
    pub fn is_memory(self) -> bool {
        matches!(self, VectorOp::Load | VectorOp::Store | VectorOp::Append)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Copy)]
pub enum Instruction {
    Type0 {
        cond: u32,
        op: ScalarOp,
        rd: usize,
        r1: usize,
        r2: usize,
    }, // reg op reg
    Type1 {
        cond: u32,
        op: ScalarOp,
        rd: usize,
        r1: usize,
        r2: usize,
    }, // [reg] op [reg]
    Type2 {
        cond: u32,
        op: ScalarOp,
        rd: usize,
        r1: usize,
        r2: usize,
    }, // [reg] op reg
    Type3 {
        op: ScalarOp,
        rd: usize,
        r1: usize,
        immediate: u32,
    }, // reg op imm
    Type4 {
        op: ScalarOp,
        rd: usize,
        r1: usize,
        immediate: u32,
    }, // [reg] op imm
    Type5 {
        op: ScalarOp,
        rd: usize,
        r1: usize,
    }, // register addressed load/store
    Type6 {
        op: ScalarOp,
        rd: usize,
        immediate: u32,
    }, // immediate load/store
    Type7 {
        cond: ConditionCode,
        link: bool,
        offset: i32,
    }, // branch
    Type8 {
        op: VectorOp,
        vd: usize,
        r1: usize,
        length: usize,
    }, // vector load/store/append
    Type9 {
        cond: u32,
        op: VectorOp,
        vd: usize,
        v1: usize,
        v2: usize,
        length: usize,
    }, // vector op vector
    Type10 {
        cond: u32,
        op: VectorOp,
        vd: usize,
        v1: usize,
        immediate: u32,
        length: usize,
    }, // vector op imm
    Halt,
    Invalid(RawInstruction),
}

fn field(raw: RawInstruction, shift: u32, mask: u32) -> usize {
    usize::try_from((raw >> shift) & mask).unwrap_or_default()
}

fn bits(value: usize, mask: u32, shift: u32) -> u32 {
    (u32::try_from(value).unwrap_or_default() & mask) << shift
}

fn header(cond: u32, instr_type: u32, opcode: u32) -> u32 {
    ((cond & MASK_4) << COND_SHIFT)
        | (instr_type << TYPE_SHIFT)
        | ((opcode & MASK_4) << OPCODE_SHIFT)
}

/// Type field of a raw word, without decoding the rest
pub fn instr_type(raw: RawInstruction) -> u32 {
    (raw >> TYPE_SHIFT) & MASK_4
}

/// Transform a raw u32 into an `Instruction`
pub fn decode_raw_instr(raw: RawInstruction) -> Instruction {
    if raw == HALT {
        return Instruction::Halt;
    }

    let instr_type = instr_type(raw);
    let cond = (raw >> COND_SHIFT) & MASK_4;
    let opcode = (raw >> OPCODE_SHIFT) & MASK_4;
    let rd = field(raw, RD_SHIFT, MASK_4);
    let r1 = field(raw, R1_SHIFT, MASK_4);
    let r2 = field(raw, R2_SHIFT, MASK_4);

    let decoded = match instr_type {
        0..=4 => ScalarOp::from_repr(opcode)
            .filter(|op| op.is_alu())
            .map(|op| {
                let immediate = (raw >> IMM_SHIFT) & MASK_8;
                match instr_type {
                    0 => Instruction::Type0 {
                        cond,
                        op,
                        rd,
                        r1,
                        r2,
                    },
                    1 => Instruction::Type1 {
                        cond,
                        op,
                        rd,
                        r1,
                        r2,
                    },
                    2 => Instruction::Type2 {
                        cond,
                        op,
                        rd,
                        r1,
                        r2,
                    },
                    3 => Instruction::Type3 {
                        op,
                        rd,
                        r1,
                        immediate,
                    },
                    _ => Instruction::Type4 {
                        op,
                        rd,
                        r1,
                        immediate,
                    },
                }
            }),
        5 => ScalarOp::from_repr(opcode)
            .filter(|op| op.is_memory())
            .map(|op| Instruction::Type5 { op, rd, r1 }),
        6 => ScalarOp::from_repr(opcode)
            .filter(|op| op.is_memory())
            .map(|op| Instruction::Type6 {
                op,
                rd,
                immediate: (raw >> IMM_SHIFT) & MASK_12,
            }),
        7 => ConditionCode::from_repr(cond).map(|cond| {
            let magnitude = i32::try_from(raw & MASK_22).unwrap_or_default();
            let negative = (raw >> SIGN_SHIFT) & MASK_1 == 1;
            Instruction::Type7 {
                cond,
                link: (raw >> LINK_SHIFT) & MASK_1 == 1,
                offset: if negative { -magnitude } else { magnitude },
            }
        }),
        8 => VectorOp::from_repr(opcode)
            .filter(|op| op.is_memory())
            .map(|op| Instruction::Type8 {
                op,
                vd: rd,
                r1,
                length: field(raw, VEC_MEM_LEN_SHIFT, MASK_5),
            }),
        9 => VectorOp::from_repr(opcode)
            .filter(|op| op.is_alu())
            .map(|op| Instruction::Type9 {
                cond,
                op,
                vd: rd,
                v1: r1,
                v2: r2,
                length: field(raw, VEC_LEN_SHIFT, MASK_5),
            }),
        10 => VectorOp::from_repr(opcode)
            .filter(|op| op.is_alu())
            .map(|op| Instruction::Type10 {
                cond,
                op,
                vd: rd,
                v1: r1,
                immediate: (raw >> VEC_IMM_SHIFT) & MASK_5,
                length: field(raw, 0, MASK_5),
            }),
        _ => None,
    };

    decoded.unwrap_or_else(|| {
        warn!("Decoded invalid instruction 0x{raw:08X}");
        Instruction::Invalid(raw)
    })
}

impl Instruction {
    /// Packs the instruction back into its raw word
    pub fn encode(&self) -> RawInstruction {
        match *self {
            Instruction::Type0 {
                cond,
                op,
                rd,
                r1,
                r2,
            } => {
                header(cond, 0, op as u32)
                    | bits(rd, MASK_4, RD_SHIFT)
                    | bits(r1, MASK_4, R1_SHIFT)
                    | bits(r2, MASK_4, R2_SHIFT)
            }
            Instruction::Type1 {
                cond,
                op,
                rd,
                r1,
                r2,
            } => {
                header(cond, 1, op as u32)
                    | bits(rd, MASK_4, RD_SHIFT)
                    | bits(r1, MASK_4, R1_SHIFT)
                    | bits(r2, MASK_4, R2_SHIFT)
            }
            Instruction::Type2 {
                cond,
                op,
                rd,
                r1,
                r2,
            } => {
                header(cond, 2, op as u32)
                    | bits(rd, MASK_4, RD_SHIFT)
                    | bits(r1, MASK_4, R1_SHIFT)
                    | bits(r2, MASK_4, R2_SHIFT)
            }
            Instruction::Type3 {
                op,
                rd,
                r1,
                immediate,
            } => {
                header(0, 3, op as u32)
                    | bits(rd, MASK_4, RD_SHIFT)
                    | bits(r1, MASK_4, R1_SHIFT)
                    | ((immediate & MASK_8) << IMM_SHIFT)
            }
            Instruction::Type4 {
                op,
                rd,
                r1,
                immediate,
            } => {
                header(0, 4, op as u32)
                    | bits(rd, MASK_4, RD_SHIFT)
                    | bits(r1, MASK_4, R1_SHIFT)
                    | ((immediate & MASK_8) << IMM_SHIFT)
            }
            Instruction::Type5 { op, rd, r1 } => {
                header(0, 5, op as u32) | bits(rd, MASK_4, RD_SHIFT) | bits(r1, MASK_4, R1_SHIFT)
            }
            Instruction::Type6 { op, rd, immediate } => {
                header(0, 6, op as u32)
                    | bits(rd, MASK_4, RD_SHIFT)
                    | ((immediate & MASK_12) << IMM_SHIFT)
            }
            Instruction::Type7 { cond, link, offset } => {
                ((cond as u32) << COND_SHIFT)
                    | (BRANCH_TYPE << TYPE_SHIFT)
                    | (u32::from(link) << LINK_SHIFT)
                    | (u32::from(offset < 0) << SIGN_SHIFT)
                    | (offset.unsigned_abs() & MASK_22)
            }
            Instruction::Type8 { op, vd, r1, length } => {
                header(0, 8, op as u32)
                    | bits(vd, MASK_4, RD_SHIFT)
                    | bits(r1, MASK_4, R1_SHIFT)
                    | bits(length, MASK_5, VEC_MEM_LEN_SHIFT)
            }
            Instruction::Type9 {
                cond,
                op,
                vd,
                v1,
                v2,
                length,
            } => {
                header(cond, 9, op as u32)
                    | bits(vd, MASK_4, RD_SHIFT)
                    | bits(v1, MASK_4, R1_SHIFT)
                    | bits(v2, MASK_4, R2_SHIFT)
                    | bits(length, MASK_5, VEC_LEN_SHIFT)
            }
            Instruction::Type10 {
                cond,
                op,
                vd,
                v1,
                immediate,
                length,
            } => {
                header(cond, 10, op as u32)
                    | bits(vd, MASK_4, RD_SHIFT)
                    | bits(v1, MASK_4, R1_SHIFT)
                    | ((immediate & MASK_5) << VEC_IMM_SHIFT)
                    | bits(length, MASK_5, 0)
            }
            Instruction::Halt => HALT,
            Instruction::Invalid(raw) => raw,
        }
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, Instruction::Type7 { .. })
    }

    /// Whether the instruction writes the comparison flags
    pub fn is_compare(&self) -> bool {
        self.scalar_op() == Some(ScalarOp::Compare)
    }

    /// The op of a scalar ALU instruction (types 0-4)
    pub fn scalar_op(&self) -> Option<ScalarOp> {
        match *self {
            Instruction::Type0 { op, .. }
            | Instruction::Type1 { op, .. }
            | Instruction::Type2 { op, .. }
            | Instruction::Type3 { op, .. }
            | Instruction::Type4 { op, .. } => Some(op),
            _ => None,
        }
    }

    /// Returns the registers read by the instruction
    pub fn get_src_regs(&self) -> Vec<RegisterRef> {
        let mut regs = Vec::new();
        match *self {
            Instruction::Type0 { op, r1, r2, .. }
            | Instruction::Type1 { op, r1, r2, .. }
            | Instruction::Type2 { op, r1, r2, .. } => {
                if op.uses_a() {
                    regs.push(RegisterRef::Scalar(r1));
                }
                if op.uses_b() {
                    regs.push(RegisterRef::Scalar(r2));
                }
                if op == ScalarOp::SetFlag {
                    regs.push(RegisterRef::Scalar(COND_REG));
                }
            }
            Instruction::Type3 { op, r1, .. } | Instruction::Type4 { op, r1, .. } => {
                if op.uses_a() {
                    regs.push(RegisterRef::Scalar(r1));
                }
                if op == ScalarOp::SetFlag {
                    regs.push(RegisterRef::Scalar(COND_REG));
                }
            }
            Instruction::Type5 { op, rd, r1 } => {
                regs.push(RegisterRef::Scalar(r1));
                if op == ScalarOp::Store {
                    regs.push(RegisterRef::Scalar(rd));
                }
            }
            Instruction::Type6 { op, rd, .. } => {
                if op == ScalarOp::Store {
                    regs.push(RegisterRef::Scalar(rd));
                }
            }
            Instruction::Type7 { cond, .. } => match cond {
                ConditionCode::Always => {}
                ConditionCode::Return => regs.push(RegisterRef::Scalar(LINK_REG)),
                _ => regs.push(RegisterRef::Scalar(COND_REG)),
            },
            Instruction::Type8 { op, vd, r1, .. } => {
                regs.push(RegisterRef::Scalar(r1));
                if op != VectorOp::Load {
                    regs.push(RegisterRef::Vector(vd));
                }
            }
            Instruction::Type9 { v1, v2, .. } => {
                regs.push(RegisterRef::Vector(v1));
                regs.push(RegisterRef::Vector(v2));
            }
            Instruction::Type10 { v1, .. } => regs.push(RegisterRef::Vector(v1)),
            Instruction::Halt | Instruction::Invalid(_) => {}
        }
        regs
    }

    /// Returns the registers written by the instruction
    pub fn get_dest_regs(&self) -> Vec<RegisterRef> {
        match *self {
            Instruction::Type0 {
                op: ScalarOp::Swap,
                rd,
                r2,
                ..
            } => vec![RegisterRef::Scalar(rd), RegisterRef::Scalar(r2)],
            Instruction::Type0 { op, rd, .. }
            | Instruction::Type1 { op, rd, .. }
            | Instruction::Type2 { op, rd, .. }
            | Instruction::Type3 { op, rd, .. }
            | Instruction::Type4 { op, rd, .. } => {
                if op.writes_rd() {
                    vec![RegisterRef::Scalar(rd)]
                } else {
                    vec![RegisterRef::Scalar(COND_REG)]
                }
            }
            Instruction::Type5 {
                op: ScalarOp::Load,
                rd,
                ..
            }
            | Instruction::Type6 {
                op: ScalarOp::Load,
                rd,
                ..
            } => vec![RegisterRef::Scalar(rd)],
            Instruction::Type7 { link: true, .. } => vec![RegisterRef::Scalar(LINK_REG)],
            Instruction::Type8 {
                op: VectorOp::Load | VectorOp::Append,
                vd,
                ..
            }
            | Instruction::Type9 { vd, .. }
            | Instruction::Type10 { vd, .. } => vec![RegisterRef::Vector(vd)],
            _ => Vec::new(),
        }
    }
}

/// Writes the operands of a scalar ALU op in assembler order: destination,
/// first operand, second operand, each only when the op uses it
fn write_alu(
    f: &mut std::fmt::Formatter<'_>,
    op: ScalarOp,
    rd: usize,
    lhs: &str,
    rhs: &str,
) -> std::fmt::Result {
    write!(f, "{op}")?;
    if op.writes_rd() {
        write!(f, " R{rd}")?;
    }
    if op.uses_a() {
        write!(f, " {lhs}")?;
    }
    if op.uses_b() {
        write!(f, " {rhs}")?;
    }
    Ok(())
}

impl Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Instruction::Type0 { op, rd, r1, r2, .. } => {
                write_alu(f, op, rd, &format!("R{r1}"), &format!("R{r2}"))
            }
            Instruction::Type1 { op, rd, r1, r2, .. } => {
                write_alu(f, op, rd, &format!("[R{r1}]"), &format!("[R{r2}]"))
            }
            Instruction::Type2 { op, rd, r1, r2, .. } => {
                write_alu(f, op, rd, &format!("[R{r1}]"), &format!("R{r2}"))
            }
            Instruction::Type3 {
                op,
                rd,
                r1,
                immediate,
            } => write_alu(f, op, rd, &format!("R{r1}"), &immediate.to_string()),
            Instruction::Type4 {
                op,
                rd,
                r1,
                immediate,
            } => write_alu(f, op, rd, &format!("[R{r1}]"), &immediate.to_string()),
            Instruction::Type5 { op, rd, r1 } => write!(f, "{op} R{rd} R{r1}"),
            Instruction::Type6 { op, rd, immediate } => write!(f, "{op} R{rd} {immediate}"),
            Instruction::Type7 {
                cond: ConditionCode::Return,
                link: false,
                offset: 0,
            } => write!(f, "RETURN"),
            Instruction::Type7 { cond, link, offset } => {
                let mnemonic = if link { "CALL" } else { "BRANCH" };
                write!(f, "{mnemonic} {offset}")?;
                if cond != ConditionCode::Always {
                    write!(f, " IF {cond}")?;
                }
                Ok(())
            }
            Instruction::Type8 {
                op: VectorOp::Append,
                vd,
                r1,
                ..
            } => write!(f, "APPEND V{vd} R{r1}"),
            Instruction::Type8 { op, vd, r1, length } => write!(f, "{op} V{vd} R{r1} {length}"),
            Instruction::Type9 {
                op,
                vd,
                v1,
                v2,
                length,
                ..
            } => write!(f, "{op} V{vd} V{v1} V{v2} {length}"),
            Instruction::Type10 {
                op,
                vd,
                v1,
                immediate,
                length,
                ..
            } => write!(f, "{op} V{vd} V{v1} {immediate} {length}"),
            Instruction::Halt => write!(f, "HALT"),
            Instruction::Invalid(raw) => write!(f, "INVALID (0x{raw:08X})"),
        }
    }
}
