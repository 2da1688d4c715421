use anyhow::Result;

use crate::model::Commit;

/// Hook invoked synchronously before a commit's branch records are written.
///
/// Listeners run in registration order. An error aborts the completion and
/// leaves the branch locked; the commit stays open so the caller can roll it
/// back.
pub trait CommitListener: Send + Sync {
    fn pre_commit_completion(&self, commit: &Commit) -> Result<()>;
}
