//! Task conditions: named, reasoned boolean milestones.
//!
//! Conditions are the externally observable record of what happened to a
//! task. The orchestrator derives the current phase from them, so every
//! mutation goes through [`Conditions::set`] which keeps one entry per type
//! and only bumps `last_transition_time` when the status actually flips.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    SplitComplete,
    CountComplete,
    Progressing,
    MergeComplete,
    Ready,
    Failed,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SplitComplete => "SplitComplete",
            Self::CountComplete => "CountComplete",
            Self::Progressing => "Progressing",
            Self::MergeComplete => "MergeComplete",
            Self::Ready => "Ready",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    pub status: bool,
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        kind: ConditionType,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: now,
        }
    }
}

/// Ordered set of conditions, at most one per [`ConditionType`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn get(&self, kind: ConditionType) -> Option<&Condition> {
        self.0.iter().find(|c| c.kind == kind)
    }

    /// True only when the condition is present with status true.
    pub fn is_true(&self, kind: ConditionType) -> bool {
        self.get(kind).is_some_and(|c| c.status)
    }

    /// True only when the condition is present with status false.
    /// An absent condition is neither true nor false.
    pub fn is_false(&self, kind: ConditionType) -> bool {
        self.get(kind).is_some_and(|c| !c.status)
    }

    /// Insert or replace the condition of the same type in place.
    ///
    /// Returns `true` if anything observable changed.
    pub fn set(&mut self, condition: Condition) -> bool {
        match self.0.iter_mut().find(|c| c.kind == condition.kind) {
            Some(existing) => {
                if existing.status == condition.status
                    && existing.reason == condition.reason
                    && existing.message == condition.message
                {
                    return false;
                }
                let flipped = existing.status != condition.status;
                let since = existing.last_transition_time;
                *existing = condition;
                if !flipped {
                    existing.last_transition_time = since;
                }
                true
            }
            None => {
                self.0.push(condition);
                true
            }
        }
    }

    /// Returns `true` if the condition was present.
    pub fn remove(&mut self, kind: ConditionType) -> bool {
        let before = self.0.len();
        self.0.retain(|c| c.kind != kind);
        before != self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
