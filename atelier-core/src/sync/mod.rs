pub mod echo;
pub mod orchestrator;
pub mod queue;
pub mod status;
