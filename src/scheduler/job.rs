//! Scheduled unit of GPU work.

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use crate::scheduler::Priority;

/// Priority levels for GPU job scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPriority {
    /// Sub-millisecond latency target; bypasses the batching window.
    Urgent = 0,
    Default = 1,
    /// Preloading and warmup; can wait.
    Background = 2,
}

impl JobPriority {
    /// Map onto the shared admission priority scale.
    pub(crate) fn as_queue_priority(self) -> Priority {
        match self {
            Self::Urgent => Priority::Critical,
            Self::Default => Priority::Normal,
            Self::Background => Priority::Background,
        }
    }
}

/// How the commit worker disposes of a dequeued job.
pub(crate) enum JobDisposition {
    /// Run the deferred operation and fulfill the completion slot.
    Execute,
    /// Fulfill the completion slot with a shutdown error without running.
    Shutdown,
}

pub(crate) type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Type-erased runner: executes the operation (or delivers the shutdown
/// error) and resolves the caller's completion slot either way.
pub(crate) type JobRunner = Box<dyn FnOnce(JobDisposition) -> JobFuture + Send>;

/// One enqueued GPU operation.
pub(crate) struct GpuJob {
    pub job_id: u64,
    pub priority: JobPriority,
    pub enqueued_at: Instant,
    pub run: JobRunner,
}

impl std::fmt::Debug for GpuJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuJob")
            .field("job_id", &self.job_id)
            .field("priority", &self.priority)
            .field("enqueued_at", &self.enqueued_at)
            .finish_non_exhaustive()
    }
}
