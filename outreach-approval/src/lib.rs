pub mod queue;
pub mod scheduler;

pub use queue::{Approval, BulkApprovalResult, ErrorBody, QueueService, MAX_BULK_APPROVE};
pub use scheduler::{run, AutoApprovalScheduler, SweepOutcome, SweepReport, SweepResult};
