//! Ports: the interfaces the core needs from the outside world.
//!
//! - `store`: typed resource access with CAS updates and a change feed
//! - `clock`: current time for condition timestamps
//! - `id_generator`: task id minting

pub mod clock;
pub mod id_generator;
pub mod store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::store::{Api, WatchEvent, WatchEventKind};
