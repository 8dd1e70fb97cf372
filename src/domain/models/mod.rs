pub mod config;
pub mod iteration;
pub mod validation;
pub mod work_item;

pub use config::{
    Config, ConvergenceConfig, DatabaseConfig, ExecutorConfig, LoggingConfig, SchedulerConfig,
};
pub use iteration::{CompletionReason, IterationRecord, IterationSession};
pub use validation::{CompletionType, ValidationConfig, ValidationResult};
pub use work_item::{
    ExecutionMode, Priority, WorkContext, WorkItem, WorkItemPatch, WorkResult, WorkStatus,
    MAX_CONTEXT_EXTENSIONS,
};
