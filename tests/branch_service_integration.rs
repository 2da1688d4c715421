use anyhow::Result;
use branchvc::store::query::{BoolQuery, BranchQuery, Clause};
use branchvc::{
    Branch, BranchError, BranchService, BranchState, BranchStore, Commit, CommitListener,
    MemoryStore, Timepoint,
};
use std::sync::{Arc, Mutex};

fn new_service() -> (Arc<MemoryStore>, BranchService<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let service = BranchService::new(store.clone());
    (store, service)
}

fn kind(err: &anyhow::Error) -> &BranchError {
    err.downcast_ref::<BranchError>()
        .expect("expected a BranchError")
}

async fn timespans_of(store: &MemoryStore, path: &str) -> Vec<Branch> {
    let mut timespans = store
        .find(&BranchQuery::new(BoolQuery::new().must(Clause::PathEquals(
            path.to_string(),
        ))))
        .await
        .unwrap();
    timespans.sort_by_key(|timespan| timespan.start);
    timespans
}

#[tokio::test]
async fn create_main_opens_a_coherent_timespan() {
    let (_store, service) = new_service();
    let main = service.create("MAIN").await.unwrap();

    assert_eq!(main.path, "MAIN");
    assert_eq!(main.base, main.start);
    assert_eq!(main.head, main.start);
    assert!(main.end.is_none());
    assert!(!main.locked);
    assert!(!main.contains_content);
    assert_eq!(main.state, Some(BranchState::UpToDate));
}

#[tokio::test]
async fn create_validates_the_path() {
    let (_store, service) = new_service();

    let err = service.create("").await.unwrap_err();
    assert!(matches!(kind(&err), BranchError::InvalidArgument(_)));

    let err = service.create("MAIN/MY_BRANCH").await.unwrap_err();
    assert!(matches!(kind(&err), BranchError::InvalidArgument(_)));
}

#[tokio::test]
async fn create_rejects_duplicates_and_missing_parents() {
    let (_store, service) = new_service();

    let err = service.create("MAIN/A").await.unwrap_err();
    assert!(matches!(kind(&err), BranchError::InvariantViolation(_)));

    service.create("MAIN").await.unwrap();
    let err = service.create("MAIN").await.unwrap_err();
    assert!(matches!(kind(&err), BranchError::AlreadyExists(_)));

    service.create("MAIN/A").await.unwrap();
    assert!(service.exists("MAIN/A").await.unwrap());
    assert!(!service.exists("MAIN/B").await.unwrap());
}

#[tokio::test]
async fn recursive_create_shares_one_timepoint_across_the_ancestry() {
    let (_store, service) = new_service();
    let leaf = service.recursive_create("MAIN/A/B").await.unwrap();

    let main = service.find_branch("MAIN").await.unwrap();
    let a = service.find_branch("MAIN/A").await.unwrap();
    let b = service.find_branch("MAIN/A/B").await.unwrap();

    assert_eq!(leaf.path, "MAIN/A/B");
    for branch in [&main, &a, &b] {
        assert_eq!(branch.start, main.start);
        assert_eq!(branch.head, main.start);
        assert_eq!(branch.base, main.start);
    }
    assert_eq!(a.state, Some(BranchState::UpToDate));
    assert_eq!(b.state, Some(BranchState::UpToDate));
}

#[tokio::test]
async fn recursive_create_bases_children_on_the_existing_parent_head() {
    let (_store, service) = new_service();
    service.create("MAIN").await.unwrap();
    let main = service.find_branch("MAIN").await.unwrap();

    service.recursive_create("MAIN/A/B").await.unwrap();
    let a = service.find_branch("MAIN/A").await.unwrap();
    let b = service.find_branch("MAIN/A/B").await.unwrap();

    assert_eq!(a.base, main.head);
    assert_eq!(a.start, a.head);
    // The child rests on the parent materialized in the same call.
    assert_eq!(b.base, a.head);
    assert_eq!(b.start, a.start);
}

#[tokio::test]
async fn content_commit_closes_the_old_timespan_and_opens_a_new_one() {
    let (store, service) = new_service();
    let created = service.create("MAIN").await.unwrap();

    let mut commit = service.open_commit("MAIN").await.unwrap();
    assert!(commit.timepoint() > created.head);
    commit.add_entity_versions_replaced(["v1".to_string()]);
    service.complete_commit(&mut commit).await.unwrap();

    let latest = service.find_branch("MAIN").await.unwrap();
    assert_eq!(latest.start, commit.timepoint());
    assert_eq!(latest.head, commit.timepoint());
    assert!(latest.contains_content);
    assert!(latest.versions_replaced.contains("v1"));
    assert!(!latest.locked);

    let timespans = timespans_of(&store, "MAIN").await;
    assert_eq!(timespans.len(), 2);
    assert_eq!(timespans[0].end, Some(commit.timepoint()));
    assert_eq!(timespans[0].end, Some(timespans[1].start));
}

#[tokio::test]
async fn state_reflects_the_position_against_the_parent_head() {
    let (_store, service) = new_service();
    service.recursive_create("MAIN/A").await.unwrap();

    // Created together with its parent: up to date.
    let a = service.find_branch("MAIN/A").await.unwrap();
    assert_eq!(a.state, Some(BranchState::UpToDate));

    // A commit on the child moves it forward.
    let mut commit = service.open_commit("MAIN/A").await.unwrap();
    service.complete_commit(&mut commit).await.unwrap();
    let a = service.find_branch("MAIN/A").await.unwrap();
    assert_eq!(a.state, Some(BranchState::Forward));

    // A commit on the parent on top of that: diverged.
    let mut commit = service.open_commit("MAIN").await.unwrap();
    service.complete_commit(&mut commit).await.unwrap();
    let a = service.find_branch("MAIN/A").await.unwrap();
    assert_eq!(a.state, Some(BranchState::Diverged));

    // MAIN itself never leaves up to date.
    let main = service.find_branch("MAIN").await.unwrap();
    assert_eq!(main.state, Some(BranchState::UpToDate));
}

#[tokio::test]
async fn untouched_child_falls_behind_when_the_parent_advances() {
    let (_store, service) = new_service();
    service.recursive_create("MAIN/A").await.unwrap();

    let mut commit = service.open_commit("MAIN").await.unwrap();
    service.complete_commit(&mut commit).await.unwrap();

    let a = service.find_branch("MAIN/A").await.unwrap();
    assert_eq!(a.state, Some(BranchState::Behind));
}

#[tokio::test]
async fn rebase_moves_the_base_to_the_parent_head() {
    let (store, service) = new_service();
    service.recursive_create("MAIN/A").await.unwrap();
    let old_base = service.find_branch("MAIN/A").await.unwrap().base;

    let mut main_commit = service.open_commit("MAIN").await.unwrap();
    service.complete_commit(&mut main_commit).await.unwrap();
    let main_head = service.find_branch("MAIN").await.unwrap().head;

    let mut rebase = service.open_rebase_commit("MAIN/A").await.unwrap();
    assert_eq!(rebase.rebase_previous_base(), Some(old_base));
    assert_eq!(rebase.branch().base, main_head);
    service.complete_commit(&mut rebase).await.unwrap();

    let a = service.find_branch("MAIN/A").await.unwrap();
    assert_eq!(a.base, main_head);
    assert_eq!(a.start, rebase.timepoint());
    assert_eq!(a.head, rebase.timepoint());
    // Rebase alone does not mark the branch as containing content.
    assert!(!a.contains_content);

    let timespans = timespans_of(&store, "MAIN/A").await;
    assert_eq!(timespans.len(), 2);
    assert_eq!(timespans[0].end, Some(rebase.timepoint()));
}

#[tokio::test]
async fn rebase_preserves_existing_content_flag() {
    let (_store, service) = new_service();
    service.recursive_create("MAIN/A").await.unwrap();

    let mut content = service.open_commit("MAIN/A").await.unwrap();
    service.complete_commit(&mut content).await.unwrap();

    let mut main_commit = service.open_commit("MAIN").await.unwrap();
    service.complete_commit(&mut main_commit).await.unwrap();

    let mut rebase = service.open_rebase_commit("MAIN/A").await.unwrap();
    service.complete_commit(&mut rebase).await.unwrap();

    assert!(service.find_branch("MAIN/A").await.unwrap().contains_content);
}

#[tokio::test]
async fn promotion_absorbs_the_source_and_resets_it() {
    let (store, service) = new_service();
    service.recursive_create("MAIN/A").await.unwrap();

    let mut content = service.open_commit("MAIN/A").await.unwrap();
    content.add_entity_versions_replaced(["v1".to_string(), "v2".to_string()]);
    service.complete_commit(&mut content).await.unwrap();

    let mut promotion = service
        .open_promotion_commit("MAIN", "MAIN/A")
        .await
        .unwrap();
    service.complete_commit(&mut promotion).await.unwrap();
    let timepoint = promotion.timepoint();

    let main = service.find_branch("MAIN").await.unwrap();
    assert!(main.versions_replaced.contains("v1"));
    assert!(main.versions_replaced.contains("v2"));
    assert!(main.contains_content);
    assert_eq!(main.head, timepoint);

    let source = service.find_branch("MAIN/A").await.unwrap();
    assert!(!source.contains_content);
    assert!(source.versions_replaced.is_empty());
    assert_eq!(source.base, timepoint);
    assert_eq!(source.start, timepoint);
    assert_eq!(source.head, timepoint);
    assert_eq!(source.last_promotion, Some(timepoint));
    assert_eq!(source.state, Some(BranchState::UpToDate));

    let source_timespans = timespans_of(&store, "MAIN/A").await;
    let closed = &source_timespans[source_timespans.len() - 2];
    assert_eq!(closed.end, Some(timepoint));
}

#[tokio::test]
async fn promotion_requires_a_descendant_source() {
    let (_store, service) = new_service();
    service.recursive_create("MAIN/A").await.unwrap();

    let err = service
        .open_promotion_commit("MAIN", "MAIN")
        .await
        .unwrap_err();
    assert!(matches!(kind(&err), BranchError::InvalidArgument(_)));

    let err = service
        .open_promotion_commit("MAIN/A", "MAIN")
        .await
        .unwrap_err();
    assert!(matches!(kind(&err), BranchError::InvalidArgument(_)));
}

#[tokio::test]
async fn promotion_locks_the_source_branch() {
    let (_store, service) = new_service();
    service.recursive_create("MAIN/A").await.unwrap();

    let mut promotion = service
        .open_promotion_commit("MAIN", "MAIN/A")
        .await
        .unwrap();

    let err = service.open_commit("MAIN/A").await.unwrap_err();
    assert!(matches!(kind(&err), BranchError::Locked(_)));

    service.complete_commit(&mut promotion).await.unwrap();

    // Both locks are released by the completion batch.
    let mut commit = service.open_commit("MAIN/A").await.unwrap();
    service.rollback_commit(&mut commit).await.unwrap();
    let mut commit = service.open_commit("MAIN").await.unwrap();
    service.rollback_commit(&mut commit).await.unwrap();
}

#[tokio::test]
async fn failed_promotion_open_releases_the_target_lock() {
    let (_store, service) = new_service();
    service.recursive_create("MAIN/A").await.unwrap();

    let mut source_commit = service.open_commit("MAIN/A").await.unwrap();

    let err = service
        .open_promotion_commit("MAIN", "MAIN/A")
        .await
        .unwrap_err();
    assert!(matches!(kind(&err), BranchError::Locked(_)));

    // The target lock taken by the failed open is released again.
    let mut commit = service.open_commit("MAIN").await.unwrap();
    service.rollback_commit(&mut commit).await.unwrap();
    service.rollback_commit(&mut source_commit).await.unwrap();
}

#[tokio::test]
async fn second_open_fails_while_a_commit_is_in_flight() {
    let (_store, service) = new_service();
    service.create("MAIN").await.unwrap();

    let _commit = service.open_commit("MAIN").await.unwrap();
    let err = service.open_commit("MAIN").await.unwrap_err();
    assert!(matches!(kind(&err), BranchError::Locked(_)));
}

#[tokio::test]
async fn unlock_recovers_an_abandoned_commit() {
    let (_store, service) = new_service();
    service.create("MAIN").await.unwrap();

    let _abandoned = service.open_commit("MAIN").await.unwrap();
    service.unlock("MAIN").await.unwrap();

    let mut commit = service.open_commit("MAIN").await.unwrap();
    service.complete_commit(&mut commit).await.unwrap();

    let err = service.unlock("MISSING").await.unwrap_err();
    assert!(matches!(kind(&err), BranchError::NotFound(_)));
}

#[tokio::test]
async fn rollback_restores_the_state_before_the_open() {
    let (store, service) = new_service();
    service.create("MAIN").await.unwrap();
    let before = timespans_of(&store, "MAIN").await;

    let mut commit = service.open_commit("MAIN").await.unwrap();
    commit.add_domain_entity_type("concept");
    store
        .put_entity_document("concept", "MAIN", commit.timepoint())
        .await;
    assert_eq!(store.count_entity_documents("concept").await, 1);

    service.rollback_commit(&mut commit).await.unwrap();

    assert_eq!(store.count_entity_documents("concept").await, 0);
    assert_eq!(timespans_of(&store, "MAIN").await, before);
}

#[tokio::test]
async fn rollback_after_rebase_leaves_the_stored_base_untouched() {
    let (store, service) = new_service();
    service.recursive_create("MAIN/A").await.unwrap();

    let mut main_commit = service.open_commit("MAIN").await.unwrap();
    service.complete_commit(&mut main_commit).await.unwrap();

    let before = timespans_of(&store, "MAIN/A").await;
    let mut rebase = service.open_rebase_commit("MAIN/A").await.unwrap();
    service.rollback_commit(&mut rebase).await.unwrap();

    assert_eq!(timespans_of(&store, "MAIN/A").await, before);
}

#[tokio::test]
async fn complete_and_rollback_are_exactly_once() {
    let (_store, service) = new_service();
    service.create("MAIN").await.unwrap();

    let mut commit = service.open_commit("MAIN").await.unwrap();
    service.complete_commit(&mut commit).await.unwrap();

    let err = service.complete_commit(&mut commit).await.unwrap_err();
    assert!(matches!(kind(&err), BranchError::AlreadyConsumed(_)));
    let err = service.rollback_commit(&mut commit).await.unwrap_err();
    assert!(matches!(kind(&err), BranchError::AlreadyConsumed(_)));

    let mut commit = service.open_commit("MAIN").await.unwrap();
    service.rollback_commit(&mut commit).await.unwrap();
    let err = service.complete_commit(&mut commit).await.unwrap_err();
    assert!(matches!(kind(&err), BranchError::AlreadyConsumed(_)));
}

struct RecordingListener {
    name: &'static str,
    calls: Arc<Mutex<Vec<String>>>,
}

impl CommitListener for RecordingListener {
    fn pre_commit_completion(&self, commit: &Commit) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.name, commit.path()));
        Ok(())
    }
}

struct FailingListener;

impl CommitListener for FailingListener {
    fn pre_commit_completion(&self, _commit: &Commit) -> Result<()> {
        Err(anyhow::anyhow!("content validation failed"))
    }
}

#[tokio::test]
async fn listeners_run_in_registration_order_and_deduplicate() {
    let (_store, service) = new_service();
    service.create("MAIN").await.unwrap();

    let calls = Arc::new(Mutex::new(Vec::new()));
    let first = Arc::new(RecordingListener {
        name: "first",
        calls: calls.clone(),
    });
    let second = Arc::new(RecordingListener {
        name: "second",
        calls: calls.clone(),
    });
    service.add_commit_listener(first.clone()).await;
    service.add_commit_listener(second).await;
    // Registering the same listener again is a no-op.
    service.add_commit_listener(first).await;

    let mut commit = service.open_commit("MAIN").await.unwrap();
    service.complete_commit(&mut commit).await.unwrap();

    assert_eq!(
        calls.lock().unwrap().clone(),
        vec!["first:MAIN".to_string(), "second:MAIN".to_string()]
    );
}

#[tokio::test]
async fn listener_failure_aborts_the_completion() {
    let (store, service) = new_service();
    service.create("MAIN").await.unwrap();
    service.add_commit_listener(Arc::new(FailingListener)).await;

    let mut commit = service.open_commit("MAIN").await.unwrap();
    let err = service.complete_commit(&mut commit).await.unwrap_err();
    assert!(matches!(kind(&err), BranchError::ListenerAborted { .. }));

    // Nothing was written and the branch is still locked.
    assert_eq!(timespans_of(&store, "MAIN").await.len(), 1);
    assert!(timespans_of(&store, "MAIN").await[0].locked);

    // The commit is still open, so the caller can roll back.
    service.rollback_commit(&mut commit).await.unwrap();
    assert!(!timespans_of(&store, "MAIN").await[0].locked);
}

#[tokio::test]
async fn find_children_returns_transitive_descendants() {
    let (_store, service) = new_service();
    service.recursive_create("MAIN/A/B").await.unwrap();
    service.create("MAIN/C").await.unwrap();

    let children: Vec<String> = service
        .find_children("MAIN")
        .await
        .unwrap()
        .into_iter()
        .map(|branch| branch.path)
        .collect();
    assert_eq!(children, vec!["MAIN/A", "MAIN/A/B", "MAIN/C"]);

    let direct: Vec<String> = service
        .find_direct_children("MAIN")
        .await
        .unwrap()
        .into_iter()
        .map(|branch| branch.path)
        .collect();
    assert_eq!(direct, vec!["MAIN/A", "MAIN/C"]);

    let nested: Vec<String> = service
        .find_children("MAIN/A")
        .await
        .unwrap()
        .into_iter()
        .map(|branch| branch.path)
        .collect();
    assert_eq!(nested, vec!["MAIN/A/B"]);
}

#[tokio::test]
async fn find_children_only_returns_current_timespans() {
    let (_store, service) = new_service();
    service.recursive_create("MAIN/A").await.unwrap();

    let mut commit = service.open_commit("MAIN/A").await.unwrap();
    service.complete_commit(&mut commit).await.unwrap();

    let children = service.find_children("MAIN").await.unwrap();
    assert_eq!(children.len(), 1);
    assert!(children[0].is_current());
    assert_eq!(children[0].start, commit.timepoint());
}

#[tokio::test]
async fn find_all_returns_current_timespans_ordered_by_path() {
    let (_store, service) = new_service();
    service.recursive_create("MAIN/B").await.unwrap();
    service.create("MAIN/A").await.unwrap();

    let mut commit = service.open_commit("MAIN/B").await.unwrap();
    service.complete_commit(&mut commit).await.unwrap();

    let all: Vec<String> = service
        .find_all()
        .await
        .unwrap()
        .into_iter()
        .map(|branch| branch.path)
        .collect();
    assert_eq!(all, vec!["MAIN", "MAIN/A", "MAIN/B"]);
}

#[tokio::test]
async fn find_at_timepoint_selects_the_covering_timespan() {
    let (_store, service) = new_service();
    let created = service.create("MAIN").await.unwrap();

    let mut first = service.open_commit("MAIN").await.unwrap();
    service.complete_commit(&mut first).await.unwrap();
    let mut second = service.open_commit("MAIN").await.unwrap();
    service.complete_commit(&mut second).await.unwrap();

    let at_first = service
        .find_at_timepoint("MAIN", first.timepoint())
        .await
        .unwrap();
    assert_eq!(at_first.start, first.timepoint());
    assert_eq!(at_first.end, Some(second.timepoint()));

    let current = service
        .find_at_timepoint("MAIN", second.timepoint())
        .await
        .unwrap();
    assert!(current.is_current());

    let before_creation = Timepoint::from_millis(created.start.millis() - 1);
    let err = service
        .find_at_timepoint("MAIN", before_creation)
        .await
        .unwrap_err();
    assert!(matches!(
        kind(&err),
        BranchError::NotFoundAtTimepoint { .. }
    ));
}

#[tokio::test]
async fn find_latest_fails_when_the_parent_is_missing() {
    let (store, service) = new_service();
    store
        .save(Branch::new("MAIN/ORPHAN", Timepoint::now()))
        .await
        .unwrap();

    let err = service.find_latest("MAIN/ORPHAN").await.unwrap_err();
    assert!(matches!(kind(&err), BranchError::InvariantViolation(_)));
}

#[tokio::test]
async fn find_latest_fails_on_duplicate_current_timespans() {
    let (store, service) = new_service();
    store
        .save(Branch::new("MAIN", Timepoint::from_millis(100)))
        .await
        .unwrap();
    store
        .save(Branch::new("MAIN", Timepoint::from_millis(200)))
        .await
        .unwrap();

    let err = service.find_latest("MAIN").await.unwrap_err();
    assert!(matches!(kind(&err), BranchError::InvariantViolation(_)));
}

#[tokio::test]
async fn timespan_chains_stay_contiguous_under_a_mixed_workload() {
    let (store, service) = new_service();
    service.recursive_create("MAIN/A/B").await.unwrap();

    for _ in 0..3 {
        let mut commit = service.open_commit("MAIN/A/B").await.unwrap();
        commit.add_entity_versions_replaced(["v".to_string()]);
        service.complete_commit(&mut commit).await.unwrap();
    }
    let mut main_commit = service.open_commit("MAIN").await.unwrap();
    service.complete_commit(&mut main_commit).await.unwrap();

    let mut rebase = service.open_rebase_commit("MAIN/A").await.unwrap();
    service.complete_commit(&mut rebase).await.unwrap();

    let mut promotion = service
        .open_promotion_commit("MAIN/A", "MAIN/A/B")
        .await
        .unwrap();
    service.complete_commit(&mut promotion).await.unwrap();

    for path in ["MAIN", "MAIN/A", "MAIN/A/B"] {
        let timespans = timespans_of(&store, path).await;

        // Exactly one current timespan per path.
        let current: Vec<&Branch> = timespans
            .iter()
            .filter(|timespan| timespan.is_current())
            .collect();
        assert_eq!(current.len(), 1, "path {}", path);

        // Contiguous: each end meets the next start, only the last is open.
        for window in timespans.windows(2) {
            assert_eq!(window[0].end, Some(window[1].start), "path {}", path);
            assert!(window[0].head < window[1].head, "path {}", path);
        }
        assert!(timespans[timespans.len() - 1].is_current());
    }

    // The promotion carried the child's replaced versions upward.
    let a = service.find_branch("MAIN/A").await.unwrap();
    assert!(a.versions_replaced.contains("v"));
}
