#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_inception, clippy::module_name_repetitions)]

pub mod common;
pub mod config;
pub mod instruction;
pub mod memory;
pub mod pipeline;
pub mod register;
pub mod system;
