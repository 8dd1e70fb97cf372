//! Port trait definitions (Hexagonal Architecture)
//!
//! - WorkStore: persistence and state machine for work items
//! - Executor: the external actor that runs prompts

pub mod executor;
pub mod work_store;

pub use executor::{ExecutionResult, Executor};
pub use work_store::{WorkFilter, WorkStore};
