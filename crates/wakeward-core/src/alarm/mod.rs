mod proof;
mod schedule;
mod store;

pub use proof::{ProofContext, ProofRequirement, ProofVerifier};
pub use schedule::{AlarmSchedule, DaySet, EscalationFlags, FireTime, MAX_STEP_INTERVAL_SECS};
pub use store::AlarmStore;
