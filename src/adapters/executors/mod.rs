//! Executor adapters.

pub mod command;
pub mod mock;

pub use command::CommandExecutor;
pub use mock::{MockExecutor, MockResponse};
