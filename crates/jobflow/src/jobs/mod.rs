pub mod lifecycle;
pub mod memory;
pub mod model;
pub mod reaper;
pub mod recurring;
pub mod registry;
pub mod repo;
pub mod retry;
pub mod store;

pub use lifecycle::{LifecycleEngine, Outcome};
pub use memory::MemoryJobStore;
pub use model::{DeadReason, Job, JobStatus, NewJob, Transition};
pub use registry::{HandlerError, HandlerOptions, HandlerRegistry, JobContext};
pub use repo::JobsRepo;
pub use store::JobStore;
