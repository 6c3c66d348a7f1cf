pub mod register_system;
pub mod vector_register;
