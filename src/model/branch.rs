use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::model::Timepoint;

/// One immutable timespan in a branch's history.
///
/// A branch on disk is not a single record but the chain of these timespans
/// sharing a `path`; the unique record with no `end` is the current version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    /// Slash-delimited name; the root is the literal `MAIN`.
    pub path: String,
    /// Timepoint on the parent this branch was last rebased onto.
    pub base: Timepoint,
    /// Timepoint of the latest commit on this branch.
    pub head: Timepoint,
    /// Timepoint at which this timespan began.
    pub start: Timepoint,
    /// Timepoint at which this timespan was superseded; `None` means this is
    /// the current version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<Timepoint>,
    /// Exclusive-write flag held while a commit is open.
    pub locked: bool,
    /// Whether any content or promotion commit has landed since creation.
    pub contains_content: bool,
    /// Timepoint of the most recent promotion out of this branch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_promotion: Option<Timepoint>,
    /// Entity-version identifiers this branch supersedes relative to its
    /// parent; the payload a promotion carries upward.
    pub versions_replaced: BTreeSet<String>,
    /// Position relative to the parent head. Computed on lookup, never
    /// persisted.
    #[serde(skip)]
    pub state: Option<BranchState>,
}

impl Branch {
    /// New timespan opening at `timepoint` with `base = start = head`.
    pub fn new(path: impl Into<String>, timepoint: Timepoint) -> Self {
        Self {
            path: path.into(),
            base: timepoint,
            head: timepoint,
            start: timepoint,
            end: None,
            locked: false,
            contains_content: false,
            last_promotion: None,
            versions_replaced: BTreeSet::new(),
            state: None,
        }
    }

    pub fn is_current(&self) -> bool {
        self.end.is_none()
    }

    /// Derive and attach the state relative to the parent's head.
    pub fn update_state(&mut self, parent_head: Timepoint) {
        self.state = Some(BranchState::derive(self.base, self.head, parent_head));
    }

    pub fn with_state(mut self, state: BranchState) -> Self {
        self.state = Some(state);
        self
    }
}

/// Classification of a branch relative to its parent's head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchState {
    UpToDate,
    Forward,
    Behind,
    Diverged,
}

impl BranchState {
    /// State table: the branch is behind when its base predates the parent
    /// head, and ahead when its own head has moved past its base.
    pub fn derive(base: Timepoint, head: Timepoint, parent_head: Timepoint) -> Self {
        let ahead = head > base;
        if base < parent_head {
            if ahead {
                BranchState::Diverged
            } else {
                BranchState::Behind
            }
        } else if ahead {
            BranchState::Forward
        } else {
            BranchState::UpToDate
        }
    }
}
