//! Branch lifecycle, lookup, and the commit coordinator.

use anyhow::Result;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::error::BranchError;
use crate::logic::listener::CommitListener;
use crate::logic::paths;
use crate::model::{Branch, BranchState, Commit, CommitType, Timepoint};
use crate::store::query::{BoolQuery, BranchQuery, Clause};
use crate::store::traits::BranchStore;

/// Default paging bound applied to [`BranchService::find_all`].
const DEFAULT_FIND_ALL_PAGE_SIZE: usize = 10_000;

/// Versioned branch service over a document store.
///
/// Owns the listener registry and the process-wide write mutex that
/// serializes lock acquisition, commit completion, and rollback. Read-only
/// lookups are not serialized; they rely on the store's own consistency.
pub struct BranchService<S> {
    store: Arc<S>,
    write_lock: Mutex<()>,
    commit_listeners: RwLock<Vec<Arc<dyn CommitListener>>>,
    find_all_page_size: usize,
}

impl<S: BranchStore> BranchService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_find_all_page_size(store, DEFAULT_FIND_ALL_PAGE_SIZE)
    }

    /// As [`BranchService::new`] with an explicit paging bound for
    /// [`BranchService::find_all`].
    pub fn with_find_all_page_size(store: Arc<S>, find_all_page_size: usize) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
            commit_listeners: RwLock::new(Vec::new()),
            find_all_page_size,
        }
    }

    /// Create a branch. For non-root paths the parent must already exist.
    pub async fn create(&self, path: &str) -> Result<Branch> {
        self.do_create(path, false, Timepoint::now()).await
    }

    /// Create a branch, materializing any missing ancestors first. Every
    /// branch created by one call shares the same commit timepoint.
    pub async fn recursive_create(&self, path: &str) -> Result<Branch> {
        self.do_create(path, true, Timepoint::now()).await
    }

    async fn do_create(
        &self,
        path: &str,
        recursive: bool,
        commit_timepoint: Timepoint,
    ) -> Result<Branch> {
        Self::validate_path(path)?;

        debug!("Attempting to create branch {}", path);
        if self.exists(path).await? {
            return Err(BranchError::AlreadyExists(path.to_string()).into());
        }

        // Walk up to the nearest existing ancestor, collecting the paths
        // that still need to be materialized.
        let mut to_create = vec![path.to_string()];
        let mut parent_branch: Option<Branch> = None;
        let mut cursor = paths::parent_path(path);
        while let Some(parent_path) = cursor {
            if let Some(branch) = self.find_latest(parent_path).await? {
                debug!("Parent branch {:?}", branch);
                parent_branch = Some(branch);
                break;
            }
            if !recursive {
                return Err(BranchError::InvariantViolation(format!(
                    "Parent branch '{}' does not exist.",
                    parent_path
                ))
                .into());
            }
            to_create.push(parent_path.to_string());
            cursor = paths::parent_path(parent_path);
        }

        // Create top-down so every child sees its parent's head.
        let mut created: Option<Branch> = None;
        for branch_path in to_create.into_iter().rev() {
            let mut branch = Branch::new(branch_path, commit_timepoint);
            if let Some(parent) = &parent_branch {
                branch.base = parent.head;
            }
            info!("Creating branch {:?}", branch);
            let saved = self.store.save(branch).await?;
            parent_branch = Some(saved.clone());
            created = Some(saved);
        }

        created
            .map(|branch| branch.with_state(BranchState::UpToDate))
            .ok_or_else(|| {
                BranchError::InvariantViolation(format!("Branch '{}' was not created.", path))
                    .into()
            })
    }

    fn validate_path(path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(BranchError::InvalidArgument("Branch path is required.".to_string()).into());
        }
        if path.contains('_') {
            return Err(BranchError::InvalidArgument(format!(
                "Branch path may not contain the underscore character: {}",
                path
            ))
            .into());
        }
        Ok(())
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        let query = Self::current_branch_query(path, false)?;
        Ok(self.store.count(&query).await? > 0)
    }

    /// Remove every branch timespan. Destructive; test/admin only.
    pub async fn delete_all(&self) -> Result<()> {
        self.store.delete_all_branches().await
    }

    /// The current timespan of `path` with its state derived against the
    /// parent's head, or `None` when the branch does not exist.
    pub async fn find_latest(&self, path: &str) -> Result<Option<Branch>> {
        let query = Self::current_branch_query(path, true)?;
        let hits = self.store.find(&query).await?;

        let mut branch: Option<Branch> = None;
        let mut parent_branch: Option<Branch> = None;
        for hit in hits {
            if hit.path == path {
                if branch.is_some() {
                    return Err(self.illegal_state(format!(
                        "There should not be more than one version of branch {} with no end timepoint.",
                        path
                    )));
                }
                branch = Some(hit);
            } else {
                parent_branch = Some(hit);
            }
        }

        let Some(mut branch) = branch else {
            return Ok(None);
        };

        if paths::is_root(path) {
            return Ok(Some(branch.with_state(BranchState::UpToDate)));
        }

        let Some(parent_branch) = parent_branch else {
            return Err(self.illegal_state(format!("Parent branch of {} not found.", path)));
        };

        branch.update_state(parent_branch.head);
        Ok(Some(branch))
    }

    /// Query matching the current timespan of `path`, optionally picking up
    /// the parent's current timespan in the same round trip.
    fn current_branch_query(path: &str, include_parent: bool) -> Result<BranchQuery> {
        if path.is_empty() {
            return Err(BranchError::InvalidArgument("Branch path is required.".to_string()).into());
        }

        let mut path_clauses = BoolQuery::new().should(Clause::PathEquals(path.to_string()));
        if include_parent && !paths::is_root(path) {
            if let Some(parent_path) = paths::parent_path(path) {
                // Pick up the parent branch too.
                path_clauses = path_clauses.should(Clause::PathEquals(parent_path.to_string()));
            }
        }

        Ok(BranchQuery::new(
            BoolQuery::new()
                .must(Clause::Bool(path_clauses))
                .must_not(Clause::EndExists),
        ))
    }

    /// As [`BranchService::find_latest`], but absence is an error.
    pub async fn find_branch(&self, path: &str) -> Result<Branch> {
        self.find_latest(path)
            .await?
            .ok_or_else(|| BranchError::NotFound(path.to_string()).into())
    }

    /// The unique timespan of `path` that was live at `timepoint`.
    pub async fn find_at_timepoint(&self, path: &str, timepoint: Timepoint) -> Result<Branch> {
        let query = BranchQuery::new(
            BoolQuery::new()
                .must(Clause::PathEquals(path.to_string()))
                .must(Clause::StartLte(timepoint))
                .must(Clause::Bool(
                    BoolQuery::new()
                        .should(Clause::Bool(BoolQuery::new().must_not(Clause::EndExists)))
                        .should(Clause::EndGt(timepoint)),
                )),
        );
        let mut hits = self.store.find(&query).await?;
        if hits.len() > 1 {
            return Err(self.illegal_state(format!(
                "There should not be more than one version of branch {} at timepoint {}.",
                path, timepoint
            )));
        }
        hits.pop().ok_or_else(|| {
            BranchError::NotFoundAtTimepoint {
                path: path.to_string(),
                timepoint,
            }
            .into()
        })
    }

    /// All current timespans, ordered by path.
    pub async fn find_all(&self) -> Result<Vec<Branch>> {
        self.store
            .find(
                &BranchQuery::new(BoolQuery::new().must_not(Clause::EndExists))
                    .sorted_by_path()
                    .paged(0, self.find_all_page_size),
            )
            .await
    }

    /// Current timespans below `path`, ordered by path. This is a literal
    /// prefix match, so transitive descendants are included.
    pub async fn find_children(&self, path: &str) -> Result<Vec<Branch>> {
        self.store
            .find(
                &BranchQuery::new(
                    BoolQuery::new()
                        .must(Clause::PathPrefix(format!("{}/", path)))
                        .must_not(Clause::EndExists),
                )
                .sorted_by_path(),
            )
            .await
    }

    /// Children exactly one level below `path`.
    pub async fn find_direct_children(&self, path: &str) -> Result<Vec<Branch>> {
        let depth = path.split('/').count() + 1;
        Ok(self
            .find_children(path)
            .await?
            .into_iter()
            .filter(|branch| branch.path.split('/').count() == depth)
            .collect())
    }

    /// Open a content commit against `path`, acquiring the branch lock.
    pub async fn open_commit(&self, path: &str) -> Result<Commit> {
        self.do_open_commit(path, CommitType::Content).await
    }

    async fn do_open_commit(&self, path: &str, commit_type: CommitType) -> Result<Commit> {
        let branch = self.find_branch(path).await?;
        let branch = self.lock_branch(branch).await?;
        Ok(Commit::new(branch, commit_type))
    }

    /// Open a rebase commit: the snapshot's base moves to the parent's head
    /// as of the commit timepoint; the previous base is recorded on the
    /// commit. Nothing is persisted until completion.
    pub async fn open_rebase_commit(&self, path: &str) -> Result<Commit> {
        let mut commit = self.do_open_commit(path, CommitType::Rebase).await?;
        if let Some(parent_path) = paths::parent_path(path).map(str::to_string) {
            let parent_branch = self
                .find_at_timepoint(&parent_path, commit.timepoint())
                .await?;
            let previous_base = commit.branch().base;
            commit.set_rebase_previous_base(previous_base);
            commit.branch_mut().base = parent_branch.head;
        }
        Ok(commit)
    }

    /// Open a promotion commit on `path` with `source_path` as the child
    /// being promoted. The source branch is locked as well, so nothing can
    /// land on it while the promotion is in flight.
    pub async fn open_promotion_commit(&self, path: &str, source_path: &str) -> Result<Commit> {
        if !paths::is_descendant(path, source_path) {
            return Err(BranchError::InvalidArgument(format!(
                "Source branch '{}' must be a descendant of '{}'.",
                source_path, path
            ))
            .into());
        }

        let mut commit = self.do_open_commit(path, CommitType::Promotion).await?;

        let source_lock = match self.find_branch(source_path).await {
            Ok(source_branch) => self.lock_branch(source_branch).await,
            Err(err) => Err(err),
        };
        let source_branch = match source_lock {
            Ok(source_branch) => source_branch,
            Err(err) => {
                // Free the target lock before surfacing the source failure.
                if let Err(unlock_err) = self.unlock(path).await {
                    warn!(
                        "Failed to release lock on {} after promotion open failed: {:#}",
                        path, unlock_err
                    );
                }
                return Err(err);
            }
        };

        // The completion resolves the source at the commit timepoint, so the
        // timepoint must sit past the source head as well. The source is
        // locked, so its head cannot move again before completion.
        if source_branch.head >= commit.timepoint() {
            commit.advance_timepoint(Timepoint::after(source_branch.head));
        }

        commit.set_source_branch_path(source_path);
        Ok(commit)
    }

    async fn lock_branch(&self, mut branch: Branch) -> Result<Branch> {
        let _guard = self.write_lock.lock().await;
        if branch.locked {
            return Err(BranchError::Locked(branch.path).into());
        }
        branch.locked = true;
        self.store.save(branch).await
    }

    /// Complete a commit: run listeners, close the old timespan, and write
    /// the successor (plus the source close-and-reset for promotions) in one
    /// batch save.
    ///
    /// A listener failure aborts before anything is written and before the
    /// commit is consumed; the branch stays locked and the caller decides
    /// whether to roll back. A store failure mid-batch likewise leaves the
    /// commit open, so the branch can be recovered with
    /// [`BranchService::unlock`].
    pub async fn complete_commit(&self, commit: &mut Commit) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if commit.is_consumed() {
            return Err(BranchError::AlreadyConsumed(commit.path().to_string()).into());
        }

        for listener in self.commit_listeners.read().await.iter() {
            if let Err(err) = listener.pre_commit_completion(commit) {
                return Err(BranchError::ListenerAborted {
                    path: commit.path().to_string(),
                    reason: format!("{:#}", err),
                }
                .into());
            }
        }

        let timepoint = commit.timepoint();
        let commit_type = commit.commit_type();

        let mut old_timespan = commit.branch().clone();
        old_timespan.end = Some(timepoint);
        old_timespan.locked = false;

        let mut new_timespan = Branch::new(old_timespan.path.clone(), timepoint);
        new_timespan.base = old_timespan.base;
        new_timespan.contains_content =
            commit_type != CommitType::Rebase || old_timespan.contains_content;
        new_timespan.versions_replaced = old_timespan.versions_replaced.clone();
        new_timespan
            .versions_replaced
            .extend(commit.entity_versions_replaced().iter().cloned());

        let mut promotion_records: Vec<Branch> = Vec::new();
        if commit_type == CommitType::Promotion {
            let source_path = commit.source_branch_path().ok_or_else(|| {
                anyhow::Error::from(BranchError::InvalidArgument(format!(
                    "The source branch path must be set for a commit of type {:?}.",
                    CommitType::Promotion
                )))
            })?;

            // Absorb the source's replaced versions, close its timespan, and
            // start it over from the promotion timepoint.
            let mut old_source = self.find_at_timepoint(source_path, timepoint).await?;
            old_source.end = Some(timepoint);
            old_source.locked = false;
            new_timespan
                .versions_replaced
                .extend(old_source.versions_replaced.iter().cloned());
            promotion_records.push(old_source);

            let mut new_source = Branch::new(source_path, timepoint);
            new_source.last_promotion = Some(timepoint);
            debug!(
                "Updating branch base and clearing versions replaced {:?}",
                new_source
            );
            promotion_records.push(new_source);
        }

        debug!("Ending branch timespan {:?}", old_timespan);
        debug!("Starting branch timespan {:?}", new_timespan);
        let mut records = vec![old_timespan, new_timespan];
        records.append(&mut promotion_records);
        self.store.save_all(records).await?;

        commit.mark_consumed();
        Ok(())
    }

    /// Roll a commit back: delete any entity documents written under the
    /// commit's coordinates, then clear the write lock on the current
    /// timespan (and the promotion source's, if any).
    pub async fn rollback_commit(&self, commit: &mut Commit) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if commit.is_consumed() {
            return Err(BranchError::AlreadyConsumed(commit.path().to_string()).into());
        }

        for entity_type in commit.domain_entity_types() {
            self.store
                .delete_entity_documents(entity_type, commit.path(), commit.timepoint())
                .await?;
        }

        // The snapshot may carry in-memory edits (a rebased base), so the
        // lock is cleared on the stored record, not the snapshot.
        let mut records = vec![self.current_unlocked(commit.path()).await?];
        if let Some(source_path) = commit.source_branch_path() {
            records.push(self.current_unlocked(source_path).await?);
        }
        self.store.save_all(records).await?;

        commit.mark_consumed();
        Ok(())
    }

    async fn current_unlocked(&self, path: &str) -> Result<Branch> {
        let query = Self::current_branch_query(path, false)?.paged(0, 1);
        let mut hits = self.store.find(&query).await?;
        let mut branch = hits
            .pop()
            .ok_or_else(|| anyhow::Error::from(BranchError::NotFound(path.to_string())))?;
        branch.locked = false;
        Ok(branch)
    }

    /// Force-clear the write lock on a branch. Intended for recovery after a
    /// commit was neither completed nor rolled back, not for routine use.
    pub async fn unlock(&self, path: &str) -> Result<()> {
        let branch = self.current_unlocked(path).await?;
        self.store.save(branch).await?;
        Ok(())
    }

    /// Register a listener. Registrations are deduplicated by identity, so
    /// adding the same listener twice has no effect.
    pub async fn add_commit_listener(&self, listener: Arc<dyn CommitListener>) {
        let mut listeners = self.commit_listeners.write().await;
        if !listeners.iter().any(|existing| Arc::ptr_eq(existing, &listener)) {
            listeners.push(listener);
        }
    }

    fn illegal_state(&self, message: String) -> anyhow::Error {
        error!("{}", message);
        BranchError::InvariantViolation(message).into()
    }
}
