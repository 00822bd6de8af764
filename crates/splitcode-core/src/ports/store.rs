//! Resource store port.
//!
//! The store is the single source of truth for tasks and jobs. The core
//! depends only on this narrow interface: one `Api<R>` per resource kind,
//! with compare-and-swap updates and a change feed.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::{LabelSelector, Resource};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Added,
    Modified,
    Deleted,
}

/// Change notification. Carries only the name; receivers re-read state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub name: String,
}

/// Typed access to one kind of resource.
///
/// # Contract
/// - `create` fails with `Error::AlreadyExists` if the name is taken.
/// - `update` writes only if `metadata.resource_version` matches the stored
///   version, otherwise `Error::Conflict`; a missing object is
///   `Error::NotFound`. On success the returned object carries the new
///   version.
/// - `get` of a missing object is `Error::NotFound`.
/// - Every successful mutation is published on `watch`.
#[async_trait]
pub trait Api<R: Resource>: Send + Sync {
    async fn get(&self, name: &str) -> Result<R>;

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<R>>;

    async fn create(&self, object: R) -> Result<R>;

    async fn update(&self, object: R) -> Result<R>;

    async fn delete(&self, name: &str) -> Result<()>;

    /// Deletes every object matching `selector`, returning how many went.
    async fn delete_all(&self, selector: &LabelSelector) -> Result<usize>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}
