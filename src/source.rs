use std::{
    collections::{BTreeMap, HashMap},
    sync::{PoisonError, RwLock},
};

use crate::{doc_id::DocumentId, error::Result, tenant::TenantId};

/// Document text keyed by id. Sorted so rebuilds insert in a stable order.
pub type Documents = BTreeMap<DocumentId, String>;

/// Where the raw document text lives. Used to rebuild an index when no
/// usable snapshot exists.
pub trait DocumentSource: Send + Sync {
    /// Every document stored for `tenant`. Unknown tenants have none.
    fn get_all_documents(&self, tenant: &TenantId) -> Result<Documents>;
}

/// In-process document store.
#[derive(Debug, Default)]
pub struct MemoryDocuments {
    tenants: RwLock<HashMap<TenantId, Documents>>,
}

impl MemoryDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or replace a document.
    pub fn insert(
        &self,
        tenant: &TenantId,
        id: impl Into<DocumentId>,
        text: impl Into<String>,
    ) {
        self.tenants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(tenant.clone())
            .or_default()
            .insert(id.into(), text.into());
    }

    pub fn len(&self, tenant: &TenantId) -> usize {
        self.tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant)
            .map_or(0, BTreeMap::len)
    }
}

impl DocumentSource for MemoryDocuments {
    fn get_all_documents(&self, tenant: &TenantId) -> Result<Documents> {
        Ok(self
            .tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenants_are_separate() {
        let docs = MemoryDocuments::new();
        let a = TenantId::new("a").unwrap();
        let b = TenantId::new("b").unwrap();
        docs.insert(&a, "1", "hello");

        assert_eq!(docs.get_all_documents(&a).unwrap().len(), 1);
        assert!(docs.get_all_documents(&b).unwrap().is_empty());
        assert_eq!(docs.len(&b), 0);
    }

    #[test]
    fn insert_replaces_text() {
        let docs = MemoryDocuments::new();
        let t = TenantId::global();
        docs.insert(&t, "1", "old");
        docs.insert(&t, "1", "new");

        let all = docs.get_all_documents(&t).unwrap();
        assert_eq!(all.get("1").map(String::as_str), Some("new"));
    }
}
