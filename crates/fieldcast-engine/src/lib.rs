mod engine;
mod lock;
mod marker;
mod selfupdate;
mod transaction;

pub use engine::{
    DirtyPolicy, ResetReport, ResumeOutcome, StatePaths, StatusReport, SwitchOutcome,
    SwitchReport, UpdateEngine, PROGRAM_NAME, RESET_CONFIRMATION_TOKEN,
};
pub use lock::UpdateLock;
pub use marker::UpdateMarker;
pub use selfupdate::{CarryState, Handoff, SelfUpdateGuard};
pub use transaction::{restore_stash_handle, Transaction};
