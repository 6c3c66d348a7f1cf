pub mod decode;
pub mod execute;
pub mod fetch;
pub mod instruction;
pub mod memory;
pub mod pipeline;
pub mod write_back;
