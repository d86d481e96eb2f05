//! Scheduler: trigger engine, job events, and lifecycle supervision.

pub mod core;
pub mod lifecycle;
pub mod trigger;

pub use self::core::{DEFAULT_MISFIRE_GRACE, JobAction, JobEvent, JobInfo, JobOutcome, Scheduler};
pub use self::lifecycle::{LifecycleManager, load_state_file};
pub use self::trigger::{MisfireDecision, Trigger, misfire_decision};
