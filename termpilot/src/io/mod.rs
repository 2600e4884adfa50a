//! Side-effecting collaborators of the orchestrator.

pub mod config;
pub mod model;
pub mod operator;
pub mod process;
pub mod shell;
pub mod turn_log;
