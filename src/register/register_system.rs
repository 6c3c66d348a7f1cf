use std::fmt::Display;

use bitmaps::Bitmap;
use log::{error, info};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString, FromRepr};

use crate::common::{word_from_raw, word_to_address, Address, Word};

pub const GEN_REG_COUNT: usize = 16;
pub const FLAG_COUNT: usize = 6;
/// Holds the flags written by the last comparison
pub const COND_REG: usize = 13;
/// Return address written by linking branches
pub const LINK_REG: usize = 14;
pub const PC_REG: usize = 15;

#[derive(Debug, Clone, Copy, Display, EnumString, EnumIter, PartialEq, Eq, Hash)]
pub enum RegisterGroup {
    Scalar,
    Vector,
}

/// A register named by an instruction operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterRef {
    Scalar(usize),
    Vector(usize),
}

impl RegisterRef {
    pub fn group(self) -> RegisterGroup {
        match self {
            RegisterRef::Scalar(_) => RegisterGroup::Scalar,
            RegisterRef::Vector(_) => RegisterGroup::Vector,
        }
    }
}

impl Display for RegisterRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterRef::Scalar(num) => write!(f, "R{num}"),
            RegisterRef::Vector(num) => write!(f, "V{num}"),
        }
    }
}

/// Branch conditions. The first six double as the bit index of the matching
/// flag in the condition register.
#[allow(clippy::upper_case_acronyms)]
#[derive(
    Debug,
    Clone,
    Copy,
    EnumString,
    EnumIter,
    Display,
    FromRepr,
    PartialEq,
    Eq,
    Hash,
)]
#[strum(ascii_case_insensitive)]
#[repr(u32)]
pub enum ConditionCode {
    EQ = 0, // Equal
    NE = 1, // Not equal
    GT = 2, // Greater than
    GTE = 3, // Greater than or equal
    LT = 4, // Less than
    LTE = 5, // Less than or equal
    #[strum(to_string = "ALWAYS", serialize = "AL")]
    Always = 6,
    #[strum(to_string = "RET")]
    Return = 7,
}

impl ConditionCode {
    /// Flag bit tested by the condition, if it tests one
    pub fn flag_index(self) -> Option<usize> {
        match self {
            ConditionCode::Always | ConditionCode::Return => None,
            flag => usize::try_from(flag as u32).ok(),
        }
    }
}

/// Returns the set of flag values resulting from a comparison of the two values
pub fn get_comparison_flags(lhs: Word, rhs: Word) -> Bitmap<FLAG_COUNT> {
    let mut flags = Bitmap::new();
    flags.set(ConditionCode::EQ as usize, lhs == rhs);
    flags.set(ConditionCode::NE as usize, lhs != rhs);
    flags.set(ConditionCode::GT as usize, lhs > rhs);
    flags.set(ConditionCode::GTE as usize, lhs >= rhs);
    flags.set(ConditionCode::LT as usize, lhs < rhs);
    flags.set(ConditionCode::LTE as usize, lhs <= rhs);
    info!("Comparing {lhs} and {rhs}, result: {flags:?}");

    flags
}

/// Packs comparison flags into the low bits of a word
pub fn flags_to_word(flags: Bitmap<FLAG_COUNT>) -> Word {
    Word::from(flags.into_value())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterSet {
    pub general: [Word; GEN_REG_COUNT],
}

impl RegisterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a register, out of range reads yield 0
    pub fn read(&self, num: usize) -> Word {
        if let Some(&val) = self.general.get(num) {
            val
        } else {
            error!(
                "Attempted to read general register {num}, max index is {GEN_REG_COUNT}, returning 0"
            );
            0
        }
    }

    /// Writes a register, out of range writes are a NOOP
    pub fn write_normal(&mut self, data: Word, num: usize) {
        if let Some(reg) = self.general.get_mut(num) {
            info!("Wrote {data} to general register {num}");
            *reg = data;
        } else {
            error!(
                "Attempted to write to general register {num}, max index is {GEN_REG_COUNT}, treating write as NOOP"
            );
        }
    }

    pub fn pc(&self) -> Address {
        word_to_address(self.general[PC_REG])
    }

    pub fn set_pc(&mut self, address: Address) {
        let pc = word_from_raw(u32::try_from(address).unwrap_or(u32::MAX));
        info!(
            "Setting program counter, old: {}, new: {address}",
            self.pc()
        );
        self.general[PC_REG] = pc;
    }

    /// Increments the program counter by one word
    pub fn step_pc(&mut self) {
        self.general[PC_REG] = self.general[PC_REG].wrapping_add(1);
    }

    /// Flags held in the condition register
    pub fn status(&self) -> Bitmap<FLAG_COUNT> {
        let mut flags = Bitmap::new();
        for idx in 0..FLAG_COUNT {
            flags.set(idx, self.general[COND_REG] & (1 << idx) != 0);
        }
        flags
    }

    /// Whether a branch under `cond` is taken in the current state
    pub fn condition_holds(&self, cond: ConditionCode) -> bool {
        match cond.flag_index() {
            Some(idx) => self.status().get(idx),
            None => true,
        }
    }
}

impl Display for RegisterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut accum = String::new();
        for (i, reg) in self.general.iter().enumerate() {
            let name = match i {
                COND_REG => String::from("CND"),
                LINK_REG => String::from("LR "),
                PC_REG => String::from("PC "),
                _ => format!("R{i:02}"),
            };
            accum += &format!("{name}: {reg}\n");
        }

        let status = self.status();
        for cond in ConditionCode::iter() {
            if let Some(idx) = cond.flag_index() {
                accum += &format!("{cond}: {}\n", status.get(idx));
            }
        }

        write!(f, "{accum}")?;
        Ok(())
    }
}
