//! Unified error type for the dispatch core.
//!
//! Each submodule owns its own error type and this module aggregates them
//! into a single top-level [`Error`] enum via `#[from]` conversions, the
//! same shape used throughout this codebase's other error hierarchies.

pub use crate::agent_loop::RunnerError;
pub use crate::bus::BusError;
pub use crate::completion_schema::CompletionSchemaError;
pub use crate::config::ConfigError;
pub use crate::policy::PolicyError;
pub use crate::scheduler::SchedulerError;
pub use crate::tool::ToolError;

/// Result type alias for dispatch-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The top-level error type for the dispatch core.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Policy engine or policy-loader error.
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    /// Message bus error.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// Scheduler error.
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Tool validation/execution error.
    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    /// Completion-schema validation error.
    #[error("completion schema error: {0}")]
    CompletionSchema(#[from] CompletionSchemaError),

    /// Agent loop / LLM runner error.
    #[error("runner error: {0}")]
    Runner(#[from] RunnerError),

    /// Runtime configuration error.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
