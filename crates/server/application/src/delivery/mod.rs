//! The delivery engine.

pub mod dlq;
pub mod expiry;
pub mod orchestrator;
pub mod retry;

pub use dlq::{DeadLetterQueue, DeadLetterTask};
pub use expiry::ExpirySweep;
pub use orchestrator::{DeliveryOrchestrator, SubmissionOutcome, SubmitNotification};
pub use retry::{RetryScheduler, RetrySchedulerConfig};
