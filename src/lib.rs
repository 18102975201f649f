pub mod analytics;
pub mod config;
pub mod dag;
pub mod errors;
pub mod observability;
pub mod progress;
pub mod recovery;
pub mod resources;
pub mod stage;
pub mod ui;
pub mod util;

pub use config::{FailureHandling, ProcessingConfig, StagehandToml};
pub use dag::{ParallelEngine, RunContext, RunReport, StageContext, StageExecutor};
pub use errors::{SchedulerError, StageError};
