//! # Versioned Branch Service
//!
//! A Git-like branching model over a document store. Branches form a
//! slash-delimited hierarchy rooted at `MAIN`; each branch is an append-only
//! chain of immutable timespan records, and clients open commits against a
//! branch to land content changes, rebases, or promotions.
//!
//! ## Core Concepts
//!
//! - **Timespans**: A branch's history is a chain of `[start, end)` records;
//!   the one with no `end` is the current version.
//! - **Commits**: A transient unit of work holding a locked branch snapshot;
//!   completion closes the old timespan and starts a new one.
//! - **State**: Each branch is classified against its parent's head as
//!   up to date, forward, behind, or diverged.
//! - **Promotion**: Pushes a child's replaced versions into its parent and
//!   resets the child.
//!
//! ## Example
//!
//! ```ignore
//! use branchvc::{BranchService, MemoryStore};
//! use std::sync::Arc;
//!
//! let service = BranchService::new(Arc::new(MemoryStore::new()));
//! service.create("MAIN").await?;
//! service.recursive_create("MAIN/PROJECT/TASK").await?;
//!
//! let mut commit = service.open_commit("MAIN/PROJECT/TASK").await?;
//! commit.add_entity_versions_replaced(["concept-v1".to_string()]);
//! service.complete_commit(&mut commit).await?;
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod store;

pub use config::Settings;
pub use error::BranchError;
pub use logic::branch_service::BranchService;
pub use logic::listener::CommitListener;
pub use logic::paths;
pub use model::{Branch, BranchState, Commit, CommitType, Timepoint};
pub use store::memory::MemoryStore;
pub use store::postgres::PostgresStore;
pub use store::query::{BoolQuery, BranchQuery, Clause, Page};
pub use store::traits::BranchStore;
