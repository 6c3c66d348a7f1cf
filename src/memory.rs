pub mod cache;
pub mod memory_line;
pub mod memory_system;
