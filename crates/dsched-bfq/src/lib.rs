#![warn(missing_docs)]

//! Budget Fair Queueing disk scheduler.
//!
//! Each submitter (a thread or process issuing I/O) gets exclusive access to
//! the device for a budget of bytes. Submitters are ordered by WF2Q+ finish
//! time, so throughput is shared in proportion to weight while each one keeps
//! the sequential locality of its own stream. Budgets adapt to how each
//! submitter actually behaves, and the device idles briefly after a
//! submitter drains in case it is about to issue again.

pub mod bio;
pub mod budget;
pub mod clock;
pub mod config;
pub mod driver;
pub mod error;
pub mod heuristics;
pub mod policy;
pub mod scheduler;
pub mod stats;
pub mod tdio;
pub mod timer;
pub mod wf2q;

pub use bio::{Bio, BioId, BioIdGen, BioKind};
pub use budget::{BudgetLimits, ExpireReason};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::BfqConfig;
pub use driver::{DiskDriver, MockDisk};
pub use error::{BfqError, BfqResult};
pub use heuristics::{FixedEwma, PeakRate, SeekStats, ThinkTimeStats};
pub use policy::{DiskSchedPolicy, EnqueueStatus};
pub use scheduler::BfqScheduler;
pub use stats::BfqStats;
pub use tdio::{SubmitterId, TdioSnapshot, ThreadIo};
pub use timer::{AsTimer, ManualAsTimer, TimerCallback, TokioAsTimer};
pub use wf2q::{Selected, Wf2qTree};
