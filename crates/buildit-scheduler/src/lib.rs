//! Build scheduling for BuildIt.
//!
//! Owns the project store on disk, the build queue, workspace leases and
//! the executors that run builds.

pub mod history;
pub mod lease;
pub mod orchestrator;
pub mod pointers;
pub mod project;
pub mod queue;
pub mod registry;
pub mod storage;
pub mod ticker;
pub mod worker;

pub use history::BuildHistory;
pub use lease::{LeaseGuard, LeaseHolder, WorkspaceLease};
pub use orchestrator::{ExecutorSpec, ProjectScheduler, SchedulerOptions, Toolchain, WorkspaceInfo};
pub use pointers::{PointerKind, Pointers};
pub use project::ProjectStatus;
pub use queue::{BuildQueue, ItemState, QueueHandle, QueueItemInfo};
pub use registry::ItemRecord;
