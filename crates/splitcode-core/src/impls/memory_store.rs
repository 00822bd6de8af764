//! In-memory resource store.
//!
//! Behaves like the cluster API the controller is written against: every
//! mutation bumps a store-wide resource version, stale updates conflict,
//! and every change is broadcast to watchers.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tracing::trace;

use crate::domain::{LabelSelector, Resource};
use crate::error::{Error, Result};
use crate::ports::{Api, Clock, SystemClock, WatchEvent, WatchEventKind};

const WATCH_CAPACITY: usize = 1024;

struct State<R> {
    objects: BTreeMap<String, R>,
    last_version: u64,
    /// Number of upcoming updates to reject with a conflict.
    injected_conflicts: usize,
}

impl<R: Resource> State<R> {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }
}

pub struct InMemoryApi<R> {
    state: Mutex<State<R>>,
    events: broadcast::Sender<WatchEvent>,
    clock: Arc<dyn Clock>,
}

impl<R: Resource> InMemoryApi<R> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                last_version: 0,
                injected_conflicts: 0,
            }),
            events,
            clock,
        }
    }

    /// Make the next `count` updates fail with `Error::Conflict`, as if
    /// another writer had raced each of them.
    pub async fn inject_conflicts(&self, count: usize) {
        self.state.lock().await.injected_conflicts = count;
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn publish(&self, kind: WatchEventKind, name: &str) {
        trace!(resource = R::KIND, ?kind, name, "watch event");
        // No receivers is fine: nobody is watching yet.
        let _ = self.events.send(WatchEvent {
            kind,
            name: name.to_string(),
        });
    }
}

impl<R: Resource> Default for InMemoryApi<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: Resource> Api<R> for InMemoryApi<R> {
    async fn get(&self, name: &str) -> Result<R> {
        let state = self.state.lock().await;
        state
            .objects
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(R::KIND, name))
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<R>> {
        let state = self.state.lock().await;
        Ok(state
            .objects
            .values()
            .filter(|o| selector.matches(&o.meta().labels))
            .cloned()
            .collect())
    }

    async fn create(&self, mut object: R) -> Result<R> {
        let name = object.name().to_string();
        {
            let mut state = self.state.lock().await;
            if state.objects.contains_key(&name) {
                return Err(Error::already_exists(R::KIND, name));
            }
            let version = state.next_version();
            let meta = object.meta_mut();
            meta.resource_version = version;
            meta.creation_timestamp = Some(self.clock.now());
            state.objects.insert(name.clone(), object.clone());
        }
        self.publish(WatchEventKind::Added, &name);
        Ok(object)
    }

    async fn update(&self, mut object: R) -> Result<R> {
        let name = object.name().to_string();
        {
            let mut state = self.state.lock().await;
            let stored_version = state
                .objects
                .get(&name)
                .map(|o| o.meta().resource_version)
                .ok_or_else(|| Error::not_found(R::KIND, &name))?;

            let expected = object.meta().resource_version;
            if state.injected_conflicts > 0 || expected != stored_version {
                state.injected_conflicts = state.injected_conflicts.saturating_sub(1);
                return Err(Error::Conflict {
                    kind: R::KIND,
                    name,
                    expected,
                    actual: stored_version,
                });
            }

            let creation = state
                .objects
                .get(&name)
                .and_then(|o| o.meta().creation_timestamp);
            let version = state.next_version();
            let meta = object.meta_mut();
            meta.resource_version = version;
            meta.creation_timestamp = creation;
            state.objects.insert(name.clone(), object.clone());
        }
        self.publish(WatchEventKind::Modified, &name);
        Ok(object)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let removed = self.state.lock().await.objects.remove(name);
        match removed {
            Some(_) => {
                self.publish(WatchEventKind::Deleted, name);
                Ok(())
            }
            None => Err(Error::not_found(R::KIND, name)),
        }
    }

    async fn delete_all(&self, selector: &LabelSelector) -> Result<usize> {
        let removed: Vec<String> = {
            let mut state = self.state.lock().await;
            let names: Vec<String> = state
                .objects
                .iter()
                .filter(|(_, o)| selector.matches(&o.meta().labels))
                .map(|(name, _)| name.clone())
                .collect();
            for name in &names {
                state.objects.remove(name);
            }
            names
        };
        for name in &removed {
            self.publish(WatchEventKind::Deleted, name);
        }
        Ok(removed.len())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BatchJob, JobSpec, JobStatus, ObjectMeta};

    fn job(name: &str, labels: &[(&str, &str)]) -> BatchJob {
        let mut metadata = ObjectMeta::named(name);
        for (k, v) in labels {
            metadata.labels.insert(k.to_string(), v.to_string());
        }
        BatchJob {
            metadata,
            spec: JobSpec {
                image: "img".into(),
                args: vec![],
                volume_mounts: vec![],
            },
            status: JobStatus::default(),
        }
    }

    #[tokio::test]
    async fn create_assigns_version_and_rejects_duplicates() {
        let api = InMemoryApi::<BatchJob>::new();
        let created = api.create(job("a", &[])).await.unwrap();
        assert_eq!(created.metadata.resource_version, 1);
        assert!(created.metadata.creation_timestamp.is_some());

        let err = api.create(job("a", &[])).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let api = InMemoryApi::<BatchJob>::new();
        let first = api.create(job("a", &[])).await.unwrap();

        let mut winner = first.clone();
        winner.status.complete = Some(true);
        let winner = api.update(winner).await.unwrap();
        assert!(winner.metadata.resource_version > first.metadata.resource_version);

        let err = api.update(first).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(api.get("a").await.unwrap().is_complete());
    }

    #[tokio::test]
    async fn update_of_missing_object_is_not_found() {
        let api = InMemoryApi::<BatchJob>::new();
        let err = api.update(job("ghost", &[])).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn injected_conflicts_are_consumed_one_per_update() {
        let api = InMemoryApi::<BatchJob>::new();
        let stored = api.create(job("a", &[])).await.unwrap();
        api.inject_conflicts(1).await;

        assert!(api.update(stored.clone()).await.unwrap_err().is_conflict());
        assert!(api.update(stored).await.is_ok());
    }

    #[tokio::test]
    async fn list_and_delete_all_honor_selectors() {
        let api = InMemoryApi::<BatchJob>::new();
        api.create(job("a", &[("task", "t1")])).await.unwrap();
        api.create(job("b", &[("task", "t1")])).await.unwrap();
        api.create(job("c", &[("task", "t2")])).await.unwrap();

        let selector = LabelSelector::everything().with("task", "t1");
        assert_eq!(api.list(&selector).await.unwrap().len(), 2);
        assert_eq!(api.delete_all(&selector).await.unwrap(), 2);
        assert_eq!(api.len().await, 1);
        assert!(api.get("c").await.is_ok());
    }

    #[tokio::test]
    async fn watchers_see_every_mutation() {
        let api = InMemoryApi::<BatchJob>::new();
        let mut rx = api.watch();

        let created = api.create(job("a", &[])).await.unwrap();
        api.update(created).await.unwrap();
        api.delete("a").await.unwrap();

        let kinds: Vec<_> = [
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|e| e.kind)
        .collect();
        assert_eq!(
            kinds,
            vec![
                WatchEventKind::Added,
                WatchEventKind::Modified,
                WatchEventKind::Deleted
            ]
        );
    }
}
