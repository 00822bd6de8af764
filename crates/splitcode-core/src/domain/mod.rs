//! Domain model: tasks, jobs, conditions and the metadata they share.

pub mod condition;
pub mod ids;
pub mod job;
pub mod meta;
pub mod phase;
pub mod task;

pub use condition::{Condition, ConditionType, Conditions};
pub use ids::{ParseTaskIdError, TaskId};
pub use job::{BatchJob, JobCondition, JobSpec, JobStatus, JobType, UnknownJobType, VolumeMount};
pub use meta::{LabelSelector, ObjectMeta, OwnerReference, Resource};
pub use phase::Phase;
pub use task::{
    CleanupSpec, ConcurrencyStrategy, EncodeSpec, MediaUrl, SliceRef, StorageSpec, TaskSpec,
    TaskStatus, TranscodeTask,
};
