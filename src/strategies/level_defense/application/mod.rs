mod closing;
pub mod filters;
pub mod orchestrator;
pub mod tasks;
