//! Phase derivation.
//!
//! The phase is never stored. It is re-derived from conditions and slice
//! counts so any reader (the orchestrator, a status view, an operator)
//! reaches the same answer from the same record.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::condition::ConditionType;
use super::task::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Splitting,
    Counting,
    Slicing,
    Merging,
    CleaningUp,
    Done,
}

impl Phase {
    pub fn of(status: &TaskStatus) -> Self {
        if status.is_true(ConditionType::Ready) {
            Phase::Done
        } else if status.is_true(ConditionType::MergeComplete) {
            Phase::CleaningUp
        } else if status.is_false(ConditionType::Progressing) || status.all_slices_finished() {
            Phase::Merging
        } else if status.slices_planned_count > 0 {
            Phase::Slicing
        } else if status.is_true(ConditionType::SplitComplete) {
            Phase::Counting
        } else {
            Phase::Splitting
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Splitting => "splitting",
            Phase::Counting => "counting",
            Phase::Slicing => "slicing",
            Phase::Merging => "merging",
            Phase::CleaningUp => "cleaning_up",
            Phase::Done => "done",
        };
        f.write_str(s)
    }
}
