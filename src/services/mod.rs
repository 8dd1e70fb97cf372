pub mod convergence_validator;
pub mod dependency_resolver;
pub mod iteration_controller;
pub mod scheduler;
pub mod stuck_detection;
pub mod work_queue_service;

pub use dependency_resolver::DependencyResolver;
pub use iteration_controller::IterationController;
pub use scheduler::{DispatchOutcome, Scheduler, SchedulerStats, SubtaskReport};
pub use stuck_detection::{PhraseMatcher, RegexMatcher, StuckMatcher};
pub use work_queue_service::WorkQueueService;
