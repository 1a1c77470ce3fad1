//! Request scheduling: admission priority, GPU serialization, adaptive
//! tuning, and continuous batching.

pub mod adaptive;
pub mod continuous;
pub mod gpu;
mod job;
mod priority;
pub mod streaming;

pub use adaptive::{AdaptiveController, ControllerConfig, ControllerMetrics};
pub use continuous::{
    BatcherConfig, BatcherError, BatcherHealth, BatcherStats, ContinuousBatcher,
    GenerationRequest, OptimizationSummary,
};
pub use gpu::{GpuScheduler, GpuSchedulerConfig, GpuSchedulerError, GpuSchedulerStats};
pub use job::JobPriority;
pub use priority::{AsyncPriorityQueue, Priority, PriorityQueue, QueueError, QueueMetrics};
pub use streaming::{
    stream_channel, CompletionStats, FinishReason, StreamEvent, StreamReceiver, StreamSendError,
    StreamSender,
};
