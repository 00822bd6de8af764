//! The transcoding task record and its slice bookkeeping.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::condition::{ConditionType, Conditions};
use super::ids::TaskId;
use super::meta::{ObjectMeta, Resource};

/// Logical location of a media file: a storage root plus a relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaUrl {
    pub root: String,
    pub path: String,
}

impl MediaUrl {
    pub fn new(root: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            path: path.into(),
        }
    }

    /// `root` and `path` joined with exactly one separator.
    pub fn resolve(&self) -> String {
        let root = self.root.trim_end_matches('/');
        let path = self.path.trim_start_matches('/');
        if root.is_empty() {
            format!("/{path}")
        } else {
            format!("{root}/{path}")
        }
    }
}

/// Shared volume mounted into every job of the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    pub volume: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodeSpec {
    /// Overrides the configured slice image when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Length of one slice.
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,

    /// Appended to the rendered slice arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

fn default_segment_seconds() -> u32 {
    60
}

impl Default for EncodeSpec {
    fn default() -> Self {
        Self {
            image: None,
            segment_seconds: default_segment_seconds(),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupSpec {
    #[serde(default)]
    pub delete_source: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyStrategy {
    pub max_count: u32,
}

/// Immutable snapshot taken from the originating blueprint at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub task_id: TaskId,
    pub source: MediaUrl,
    pub target: MediaUrl,
    pub storage: StorageSpec,
    #[serde(default)]
    pub encode: EncodeSpec,
    #[serde(default)]
    pub cleanup: CleanupSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<ConcurrencyStrategy>,
}

/// One slice job, identified by its job name and segment index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceRef {
    pub job_name: String,
    pub index: u32,
}

impl SliceRef {
    pub fn new(job_name: impl Into<String>, index: u32) -> Self {
        Self {
            job_name: job_name.into(),
            index,
        }
    }
}

/// Persisted progress of a task.
///
/// Invariant: `slices_scheduled` and `slices_finished` never share an index.
/// All slice mutations go through the methods below to keep it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    /// Zero until the count job reports; never changes afterwards.
    #[serde(default)]
    pub slices_planned_count: u32,
    #[serde(default)]
    pub slices_scheduled: Vec<SliceRef>,
    #[serde(default)]
    pub slices_finished: Vec<SliceRef>,
    #[serde(default)]
    pub conditions: Conditions,
}

impl TaskStatus {
    /// Smallest index below `slices_planned_count` that is neither scheduled
    /// nor finished, or `None` when all are accounted for or the cap is hit.
    pub fn next_slice_index(&self, cap: Option<u32>) -> Option<u32> {
        if let Some(cap) = cap
            && self.slices_scheduled.len() >= cap as usize
        {
            return None;
        }
        let taken: HashSet<u32> = self
            .slices_scheduled
            .iter()
            .chain(self.slices_finished.iter())
            .map(|s| s.index)
            .collect();
        (0..self.slices_planned_count).find(|index| !taken.contains(index))
    }

    pub fn is_scheduled(&self, index: u32) -> bool {
        self.slices_scheduled.iter().any(|s| s.index == index)
    }

    pub fn is_finished(&self, index: u32) -> bool {
        self.slices_finished.iter().any(|s| s.index == index)
    }

    /// Record a running slice job. Returns `false` if the index is already
    /// scheduled or finished.
    pub fn schedule_slice(&mut self, slice: SliceRef) -> bool {
        if self.is_scheduled(slice.index) || self.is_finished(slice.index) {
            return false;
        }
        self.slices_scheduled.push(slice);
        true
    }

    /// Move `index` from scheduled to finished. Returns `None` if it was not
    /// scheduled, which is how duplicate completions are recognized.
    pub fn finish_slice(&mut self, index: u32) -> Option<SliceRef> {
        let position = self.slices_scheduled.iter().position(|s| s.index == index)?;
        let slice = self.slices_scheduled.remove(position);
        self.slices_finished.push(slice.clone());
        Some(slice)
    }

    pub fn all_slices_finished(&self) -> bool {
        self.slices_planned_count > 0
            && self.slices_finished.len() >= self.slices_planned_count as usize
    }

    pub fn is_true(&self, kind: ConditionType) -> bool {
        self.conditions.is_true(kind)
    }

    pub fn is_false(&self, kind: ConditionType) -> bool {
        self.conditions.is_false(kind)
    }
}

/// One in-flight transcoding job for a single source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeTask {
    pub metadata: ObjectMeta,
    pub spec: TaskSpec,
    #[serde(default)]
    pub status: TaskStatus,
}

impl TranscodeTask {
    pub fn new(name: impl Into<String>, spec: TaskSpec) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            spec,
            status: TaskStatus::default(),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.spec.task_id
    }

    pub fn concurrency_cap(&self) -> Option<u32> {
        self.spec.concurrency.map(|c| c.max_count)
    }

    /// Directory on the shared volume holding this task's intermediates.
    pub fn work_dir(&self) -> String {
        format!(
            "{}/.splitcode/{}",
            self.spec.storage.mount_path.trim_end_matches('/'),
            self.spec.task_id
        )
    }
}

impl Resource for TranscodeTask {
    const KIND: &'static str = "TranscodeTask";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn status(planned: u32, scheduled: &[u32], finished: &[u32]) -> TaskStatus {
        TaskStatus {
            slices_planned_count: planned,
            slices_scheduled: scheduled
                .iter()
                .map(|i| SliceRef::new(format!("s-{i}"), *i))
                .collect(),
            slices_finished: finished
                .iter()
                .map(|i| SliceRef::new(format!("s-{i}"), *i))
                .collect(),
            conditions: Conditions::default(),
        }
    }

    #[rstest]
    #[case::nothing_planned(status(0, &[], &[]), None, None)]
    #[case::fresh(status(4, &[], &[]), None, Some(0))]
    #[case::skips_taken(status(4, &[0, 2], &[1]), None, Some(3))]
    #[case::prefers_lowest_gap(status(5, &[3], &[0, 4]), None, Some(1))]
    #[case::catch_up_after_restart(status(3, &[], &[0, 1]), Some(2), Some(2))]
    #[case::cap_reached(status(5, &[0, 1], &[]), Some(2), None)]
    #[case::cap_not_reached(status(5, &[0], &[1]), Some(2), Some(2))]
    #[case::all_accounted(status(3, &[2], &[0, 1]), None, None)]
    #[case::all_finished(status(3, &[], &[0, 1, 2]), Some(2), None)]
    fn next_slice_index_selects_smallest_free(
        #[case] status: TaskStatus,
        #[case] cap: Option<u32>,
        #[case] expected: Option<u32>,
    ) {
        assert_eq!(status.next_slice_index(cap), expected);
    }

    #[test]
    fn schedule_refuses_taken_indexes() {
        let mut status = status(3, &[0], &[1]);
        assert!(!status.schedule_slice(SliceRef::new("dup", 0)));
        assert!(!status.schedule_slice(SliceRef::new("dup", 1)));
        assert!(status.schedule_slice(SliceRef::new("s-2", 2)));
        assert_eq!(status.slices_scheduled.len(), 2);
    }

    #[test]
    fn finish_moves_between_sets_once() {
        let mut status = status(2, &[0, 1], &[]);
        assert_eq!(status.finish_slice(1), Some(SliceRef::new("s-1", 1)));
        assert!(status.is_finished(1));
        assert!(!status.is_scheduled(1));

        // Second delivery of the same completion.
        assert_eq!(status.finish_slice(1), None);
        assert_eq!(status.slices_finished.len(), 1);
    }

    #[test]
    fn all_finished_requires_a_plan() {
        assert!(!status(0, &[], &[]).all_slices_finished());
        assert!(!status(2, &[1], &[0]).all_slices_finished());
        assert!(status(2, &[], &[0, 1]).all_slices_finished());
    }

    #[test]
    fn media_url_joins_with_one_separator() {
        assert_eq!(MediaUrl::new("/mnt/in/", "/a/b.mkv").resolve(), "/mnt/in/a/b.mkv");
        assert_eq!(MediaUrl::new("", "a.mkv").resolve(), "/a.mkv");
    }

    #[test]
    fn status_serializes_camel_case() {
        let json = serde_json::to_value(status(2, &[1], &[0])).unwrap();
        assert_eq!(json["slicesPlannedCount"], 2);
        assert_eq!(json["slicesScheduled"][0]["jobName"], "s-1");
        assert_eq!(json["slicesFinished"][0]["index"], 0);
    }
}
