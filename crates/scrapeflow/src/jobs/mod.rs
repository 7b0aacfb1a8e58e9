pub mod events;
pub mod memory;
pub mod model;
pub mod queue;
pub mod repo;
pub mod retry;
pub mod runner;
pub mod store;

pub use events::{JobSummary, QueueEvent};
pub use memory::MemoryJobStore;
pub use model::{Job, JobPatch, JobStatus, JobType, NewJob, OutputFormat, QueueJob};
pub use queue::{JobQueue, QueueConfig, QueueStats};
pub use repo::JobsRepo;
pub use runner::{JobExecutor, JobOutcome, JobRunner};
pub use store::{JobStore, ListFilter};
