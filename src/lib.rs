pub mod checks;
pub mod errors;
pub mod forge_config;
pub mod git;
pub mod hooks;
pub mod logging;
pub mod runner;
pub mod select;
pub mod state;
pub mod status;
pub mod validate;
pub mod workspace;

// Shared document types, so callers need only this crate.
pub use forge_common::{Plan, PhaseTemplate, State, Status};
