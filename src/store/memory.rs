//! In-memory document store used by tests and embedders.

use anyhow::Result;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::model::{Branch, Timepoint};
use crate::store::query::BranchQuery;
use crate::store::traits::BranchStore;

/// Domain-entity documents are opaque to the branch service; only the
/// coordinates used by commit rollback are modeled here.
#[derive(Debug, Clone)]
struct EntityDocument {
    path: String,
    start: Timepoint,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    branches: RwLock<Vec<Branch>>,
    entity_documents: RwLock<HashMap<String, Vec<EntityDocument>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write an entity document under a commit's coordinates, as a client of
    /// the document store would during a content change.
    pub async fn put_entity_document(&self, entity_type: &str, path: &str, start: Timepoint) {
        self.entity_documents
            .write()
            .await
            .entry(entity_type.to_string())
            .or_default()
            .push(EntityDocument {
                path: path.to_string(),
                start,
            });
    }

    pub async fn count_entity_documents(&self, entity_type: &str) -> usize {
        self.entity_documents
            .read()
            .await
            .get(entity_type)
            .map_or(0, |documents| documents.len())
    }
}

#[async_trait::async_trait]
impl BranchStore for MemoryStore {
    async fn count(&self, query: &BranchQuery) -> Result<u64> {
        let branches = self.branches.read().await;
        Ok(branches
            .iter()
            .filter(|branch| query.query.matches(branch))
            .count() as u64)
    }

    async fn find(&self, query: &BranchQuery) -> Result<Vec<Branch>> {
        let branches = self.branches.read().await;
        let mut hits: Vec<Branch> = branches
            .iter()
            .filter(|branch| query.query.matches(branch))
            .cloned()
            .collect();
        if query.sort_by_path {
            hits.sort_by(|a, b| a.path.cmp(&b.path));
        }
        if let Some(page) = query.page {
            hits = hits.into_iter().skip(page.offset).take(page.size).collect();
        }
        Ok(hits)
    }

    async fn save(&self, branch: Branch) -> Result<Branch> {
        let mut stored = branch;
        stored.state = None;
        let mut branches = self.branches.write().await;
        if let Some(existing) = branches
            .iter_mut()
            .find(|existing| existing.path == stored.path && existing.start == stored.start)
        {
            *existing = stored.clone();
        } else {
            branches.push(stored.clone());
        }
        Ok(stored)
    }

    async fn save_all(&self, records: Vec<Branch>) -> Result<()> {
        let mut branches = self.branches.write().await;
        for record in records {
            let mut stored = record;
            stored.state = None;
            if let Some(existing) = branches
                .iter_mut()
                .find(|existing| existing.path == stored.path && existing.start == stored.start)
            {
                *existing = stored;
            } else {
                branches.push(stored);
            }
        }
        Ok(())
    }

    async fn delete_entity_documents(
        &self,
        entity_type: &str,
        path: &str,
        start: Timepoint,
    ) -> Result<()> {
        if let Some(documents) = self.entity_documents.write().await.get_mut(entity_type) {
            documents.retain(|document| !(document.path == path && document.start == start));
        }
        Ok(())
    }

    async fn delete_all_branches(&self) -> Result<()> {
        self.branches.write().await.clear();
        Ok(())
    }
}
