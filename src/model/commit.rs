use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::model::{Branch, Timepoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitType {
    /// Content change on the branch itself.
    Content,
    /// Reparent the branch onto a newer parent head; no new content.
    Rebase,
    /// Push a child branch's replaced versions into this branch and reset
    /// the child.
    Promotion,
}

/// A transient unit of work opened against a branch.
///
/// Holds a snapshot of the branch's current timespan; the snapshot only
/// becomes persistent when the commit completes. Exactly one of
/// `complete_commit` / `rollback_commit` may consume a commit; the consumed
/// flag is taken at the point of no return, so a failed completion (for
/// example a listener abort) leaves the commit eligible for rollback.
#[derive(Debug)]
pub struct Commit {
    branch: Branch,
    commit_type: CommitType,
    timepoint: Timepoint,
    source_branch_path: Option<String>,
    rebase_previous_base: Option<Timepoint>,
    entity_versions_replaced: BTreeSet<String>,
    domain_entity_types: BTreeSet<String>,
    consumed: bool,
}

impl Commit {
    /// Bind a commit to a locked branch snapshot. The timepoint is assigned
    /// here and is strictly greater than the branch head.
    pub(crate) fn new(branch: Branch, commit_type: CommitType) -> Self {
        let timepoint = Timepoint::after(branch.head);
        Self {
            branch,
            commit_type,
            timepoint,
            source_branch_path: None,
            rebase_previous_base: None,
            entity_versions_replaced: BTreeSet::new(),
            domain_entity_types: BTreeSet::new(),
            consumed: false,
        }
    }

    pub fn branch(&self) -> &Branch {
        &self.branch
    }

    pub(crate) fn branch_mut(&mut self) -> &mut Branch {
        &mut self.branch
    }

    pub fn path(&self) -> &str {
        &self.branch.path
    }

    pub fn commit_type(&self) -> CommitType {
        self.commit_type
    }

    pub fn timepoint(&self) -> Timepoint {
        self.timepoint
    }

    /// Move the timepoint forward; a promotion needs it past the source
    /// branch's head too.
    pub(crate) fn advance_timepoint(&mut self, timepoint: Timepoint) {
        self.timepoint = timepoint;
    }

    pub fn source_branch_path(&self) -> Option<&str> {
        self.source_branch_path.as_deref()
    }

    pub(crate) fn set_source_branch_path(&mut self, source_branch_path: impl Into<String>) {
        self.source_branch_path = Some(source_branch_path.into());
    }

    /// The branch base before a rebase moved it; set only on rebase commits.
    pub fn rebase_previous_base(&self) -> Option<Timepoint> {
        self.rebase_previous_base
    }

    pub(crate) fn set_rebase_previous_base(&mut self, base: Timepoint) {
        self.rebase_previous_base = Some(base);
    }

    /// Record entity versions this commit supersedes relative to the parent.
    pub fn add_entity_versions_replaced<I>(&mut self, versions: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.entity_versions_replaced.extend(versions);
    }

    pub fn entity_versions_replaced(&self) -> &BTreeSet<String> {
        &self.entity_versions_replaced
    }

    /// Record a document type written under this commit's coordinates, so a
    /// rollback knows which collections to sweep.
    pub fn add_domain_entity_type(&mut self, entity_type: impl Into<String>) {
        self.domain_entity_types.insert(entity_type.into());
    }

    pub fn domain_entity_types(&self) -> &BTreeSet<String> {
        &self.domain_entity_types
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    pub(crate) fn mark_consumed(&mut self) {
        self.consumed = true;
    }
}
