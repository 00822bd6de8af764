//! App - the reconcile logic and the driver that feeds it.
//!
//! # Components
//! - **TaskOrchestrator**: phase state machine for one task
//! - **JobFeedbackHandler**: maps a completed job onto its task
//! - **JobFactory**: deterministic job names, labels and rendered templates
//! - **Controller**: watchers, resync and the worker pool
//! - **WorkQueue** / **RequeuePolicy**: deduplicated keys with backoff

pub mod controller;
pub mod feedback;
pub mod jobs;
pub mod orchestrator;
pub mod retry;
pub mod work_queue;

pub use self::controller::{Controller, ControllerHandle, WorkKey};
pub use self::feedback::{Feedback, FeedbackContext, JobFeedbackHandler};
pub use self::jobs::{JobFactory, ensure_job, job_name};
pub use self::orchestrator::{Reconciled, TaskContext, TaskOrchestrator};
pub use self::retry::RequeuePolicy;
pub use self::work_queue::WorkQueue;
