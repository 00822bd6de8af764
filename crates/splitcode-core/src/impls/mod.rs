//! Impls - in-process implementations of the ports, for development and
//! tests.
//!
//! - **InMemoryApi**: resource store with versions, selectors and watch
//! - **SimulatedBatchRunner**: completes jobs the way the batch platform
//!   would report them

pub mod memory_store;
pub mod simulated;

pub use self::memory_store::InMemoryApi;
pub use self::simulated::SimulatedBatchRunner;
