//! Model-driven terminal operator.
//!
//! A language model proposes one shell command at a time; the orchestrator
//! gates it, runs it and feeds the result back until the model declares the
//! goal complete or the step budget runs out. The architecture enforces a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (safety gate, session context, shared types).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting collaborators (shell adapters, model client, config,
//!   turn log, operator prompts). Consumed through traits so tests can script them.
//!
//! [`orchestrator`] coordinates the two to implement a run.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
