pub mod executor;
pub mod memory;
