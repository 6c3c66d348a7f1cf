use strum_macros::{Display, EnumIter};

pub type Cycle = usize;
pub type Word = i32;
pub type Address = usize;

/// Number of words held by a single memory/cache line
pub const LINE_LEN: usize = 4;

#[derive(
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Display,
    EnumIter,
)]
pub enum PipelineStage {
    Fetch,
    Decode,
    Execute,
    #[strum(serialize = "Memory Access")]
    Memory,
    #[strum(serialize = "Write Back")]
    WriteBack,
    #[default]
    System, // for calls from outside the pipeline (loader, debugger)
}

impl PipelineStage {
    /// The five pipeline stages, in program order
    pub const STAGES: [PipelineStage; 5] = [
        PipelineStage::Fetch,
        PipelineStage::Decode,
        PipelineStage::Execute,
        PipelineStage::Memory,
        PipelineStage::WriteBack,
    ];

    /// Position of the stage within the pipeline, `None` for `System`
    pub fn index(self) -> Option<usize> {
        Self::STAGES.iter().position(|&stage| stage == self)
    }

    /// The stage an instruction moves to after this one
    pub fn next(self) -> Option<PipelineStage> {
        self.index().and_then(|idx| Self::STAGES.get(idx + 1).copied())
    }
}

/// Reinterprets a raw 32-bit pattern as a signed machine word
pub fn word_from_raw(raw: u32) -> Word {
    Word::from_be_bytes(raw.to_be_bytes())
}

/// Reinterprets a signed machine word as its raw 32-bit pattern
pub fn raw_from_word(word: Word) -> u32 {
    u32::from_be_bytes(word.to_be_bytes())
}

/// Register contents used as an address are read as unsigned
pub fn word_to_address(word: Word) -> Address {
    usize::try_from(raw_from_word(word)).unwrap_or_default()
}
