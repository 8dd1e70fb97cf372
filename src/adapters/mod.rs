//! Adapters implementing the domain ports.

pub mod executors;
pub mod sqlite;
