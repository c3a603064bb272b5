//! Timed test programs: constant holds, ramps and pin toggles.

pub mod item;
pub mod scheduler;
pub mod state;

pub use item::{Program, ProgramItem, SkipCondition};
pub use scheduler::{ramp_value, Scheduler, QUEUE_HIGH_WATER};
pub use state::{ProgramProgress, SchedulerState};
