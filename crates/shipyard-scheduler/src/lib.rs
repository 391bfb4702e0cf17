//! Job scheduling for Shipyard pipelines.
//!
//! Runs each pipeline stage as its own queue. Jobs carry a group id (the
//! project); within a queue, jobs of one group are leased strictly one at a
//! time and in enqueue order, while different groups run in parallel up to
//! the queue's concurrency.
//!
//! Two store backends are provided: an in-process store, and PostgreSQL,
//! which enforces group exclusivity with a partial unique index.

pub mod context;
pub mod error;
pub mod job;
pub mod lease;
pub mod orchestrator;
pub mod payload;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use context::EngineContext;
pub use error::{QueueError, QueueResult, StageError, StageErrorKind};
pub use job::{Job, JobId, JobState, Lease, QueueCounts, RetentionStats};
pub use orchestrator::{
    Collaborators, StageOrchestrator, SubmitPipeline, SubmittedPipeline, enqueue_pipeline,
};
pub use shutdown::{DrainReport, ShutdownCoordinator};
pub use store::{JobStore, MemoryJobStore, PgJobStore};
pub use worker::{StageHandler, WorkerPool};
