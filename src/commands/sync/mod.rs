mod detect;
mod pacing;
mod run;
mod runner;

#[cfg(test)]
mod tests;

pub use detect::{Selection, is_stale, select_stale};
pub use run::{SyncSummary, execute_sync, run};
pub use runner::{RunOutcome, RunReport, SyncRunner};
