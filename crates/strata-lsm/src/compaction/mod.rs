//! Compaction planning and execution.
//!
//! The planner picks the next task from the current version's scores and the seek budget;
//! the executor machinery (merging iterator, drop rules, task state machine) turns a picked
//! task into output files and the corresponding version edit.

mod executor;
mod planner;

pub(crate) use self::{
    executor::{CompactionPhase, DropFilter, MergingIter},
    planner::{Compaction, pick_compaction},
};
