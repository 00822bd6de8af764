//! splitcode-core
//!
//! Orchestration core for slice-parallel media transcoding: a source file
//! is split into segments, every segment is encoded by its own short-lived
//! batch job under a concurrency cap, and the results are merged.
//!
//! # Modules
//! - **domain**: tasks, jobs, conditions, phase derivation
//! - **ports**: the store, clock and id interfaces the core depends on
//! - **pipeline**: step pipeline engine every control-flow decision runs on
//! - **app**: task orchestrator, job feedback handler and the driver
//! - **impls**: in-memory store and simulated batch runner
//! - **config**: controller configuration loaded from TOML
//! - **observability**: progress view of a task

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod pipeline;
pub mod ports;

pub use config::ControllerConfig;
pub use error::{Error, Result};
