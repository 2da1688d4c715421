//! Query model for the branch document store.
//!
//! Mirrors the bool-query shape of a search store: clauses compose under
//! `must` / `should` / `must_not`, with optional sort and paging directives.
//! The in-memory store evaluates the model directly; the PostgreSQL store
//! compiles it to a WHERE clause.

use crate::model::{Branch, Timepoint};

/// A single predicate over a branch timespan document.
#[derive(Debug, Clone)]
pub enum Clause {
    PathEquals(String),
    PathPrefix(String),
    StartEquals(Timepoint),
    StartLte(Timepoint),
    /// Matches only documents whose `end` is present and greater than the
    /// given timepoint.
    EndGt(Timepoint),
    EndExists,
    Bool(BoolQuery),
}

impl Clause {
    pub fn matches(&self, branch: &Branch) -> bool {
        match self {
            Clause::PathEquals(path) => branch.path == *path,
            Clause::PathPrefix(prefix) => branch.path.starts_with(prefix.as_str()),
            Clause::StartEquals(timepoint) => branch.start == *timepoint,
            Clause::StartLte(timepoint) => branch.start <= *timepoint,
            Clause::EndGt(timepoint) => branch.end.map_or(false, |end| end > *timepoint),
            Clause::EndExists => branch.end.is_some(),
            Clause::Bool(inner) => inner.matches(branch),
        }
    }
}

/// Boolean composition of clauses.
///
/// Matches when every `must` clause matches, no `must_not` clause matches,
/// and, if any `should` clause is present, at least one of them matches.
#[derive(Debug, Clone, Default)]
pub struct BoolQuery {
    pub must: Vec<Clause>,
    pub should: Vec<Clause>,
    pub must_not: Vec<Clause>,
}

impl BoolQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn must(mut self, clause: Clause) -> Self {
        self.must.push(clause);
        self
    }

    pub fn should(mut self, clause: Clause) -> Self {
        self.should.push(clause);
        self
    }

    pub fn must_not(mut self, clause: Clause) -> Self {
        self.must_not.push(clause);
        self
    }

    pub fn matches(&self, branch: &Branch) -> bool {
        self.must.iter().all(|clause| clause.matches(branch))
            && !self.must_not.iter().any(|clause| clause.matches(branch))
            && (self.should.is_empty() || self.should.iter().any(|clause| clause.matches(branch)))
    }
}

/// Paging directive: skip `offset` documents, return at most `size`.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: usize,
    pub size: usize,
}

/// A bool query plus sort and paging directives.
#[derive(Debug, Clone)]
pub struct BranchQuery {
    pub query: BoolQuery,
    pub sort_by_path: bool,
    pub page: Option<Page>,
}

impl BranchQuery {
    pub fn new(query: BoolQuery) -> Self {
        Self {
            query,
            sort_by_path: false,
            page: None,
        }
    }

    pub fn sorted_by_path(mut self) -> Self {
        self.sort_by_path = true;
        self
    }

    pub fn paged(mut self, offset: usize, size: usize) -> Self {
        self.page = Some(Page { offset, size });
        self
    }
}
