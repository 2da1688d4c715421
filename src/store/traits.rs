use anyhow::Result;

use crate::model::{Branch, Timepoint};
use crate::store::query::BranchQuery;

/// Boundary over the backing document store.
///
/// The service needs equality, range, existence, and prefix predicates with
/// boolean composition, batch saves, and a keyed delete for the
/// domain-entity documents written under a commit's coordinates. The
/// transient `state` field of a branch is never persisted.
#[async_trait::async_trait]
pub trait BranchStore: Send + Sync {
    async fn count(&self, query: &BranchQuery) -> Result<u64>;

    /// Matching timespans, respecting the query's sort and paging directives.
    async fn find(&self, query: &BranchQuery) -> Result<Vec<Branch>>;

    /// Upsert one timespan, keyed by `(path, start)`. Returns the stored
    /// record with its transient state cleared.
    async fn save(&self, branch: Branch) -> Result<Branch>;

    /// Batch upsert with best-effort atomicity across the records.
    async fn save_all(&self, branches: Vec<Branch>) -> Result<()>;

    /// Delete domain-entity documents of `entity_type` written at
    /// `(path, start)`.
    async fn delete_entity_documents(
        &self,
        entity_type: &str,
        path: &str,
        start: Timepoint,
    ) -> Result<()>;

    /// Remove every branch timespan. Destructive; test/admin only.
    async fn delete_all_branches(&self) -> Result<()>;
}
