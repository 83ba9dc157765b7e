//! The ingestion backbone: periodic scheduling, the bounded worker pool,
//! progress reporting and the network speed detector that sizes the pool.

pub mod progress;
pub mod scheduler;
pub mod speed;

pub use progress::{ProgressSnapshot, TaskManager};
pub use scheduler::{
    adaptive_interval_minutes, backoff_factor, spawn, ConcurrencyGate, FetchJob, SchedulerHandle,
};
pub use speed::{classify, NetworkTier, SpeedDetector};
