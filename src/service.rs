use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    doc_id::DocumentId,
    error::{Error, Result},
    hnsw::{IndexStats, InternalId},
    registry::TenantRegistry,
    tenant::TenantId,
};

/// One ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub document_id: DocumentId,
    /// Cosine distance to the query, in `[0, 2]`.
    pub distance: f32,
    /// Cosine similarity, `1 - distance`.
    pub score: f32,
}

/// Index state of one tenant, as reported by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct TenantStatus {
    pub tenant: TenantId,
    pub documents: usize,
    pub dirty: bool,
    pub pending: usize,
    pub unreachable: usize,
    pub index: IndexStats,
}

/// Adds documents to and searches tenant indices.
#[derive(Debug)]
pub struct RetrievalService {
    registry: TenantRegistry,
}

impl RetrievalService {
    pub fn new(registry: TenantRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    /// Embed `text` and index it under `document_id`.
    ///
    /// The document counts as indexed only when this returns `Ok`. On any
    /// error the tenant's index, mapping and dirty flag are unchanged. The
    /// text itself is not stored; that is the document store's job.
    pub fn add_document(
        &self,
        tenant: &TenantId,
        document_id: impl Into<DocumentId>,
        text: &str,
    ) -> Result<InternalId> {
        let document = document_id.into();
        let handle = self.registry.get_or_create(tenant)?;

        if handle.read().mapping.contains(document.as_str()) {
            return Err(Error::DuplicateDocument {
                tenant: tenant.to_string(),
                document: document.into_string(),
            });
        }

        // Embed before locking so searches are not blocked on the provider.
        let vector = self.registry.embedder().embed(text)?;

        let mut state = handle.write();
        let id = state.insert(tenant, document.clone(), &vector)?;
        debug!(tenant = %tenant, document = %document, node = id, "document indexed");

        if let Err(e) = self.registry.after_insert(tenant, &mut state) {
            warn!(
                tenant = %tenant,
                error = %e,
                "periodic flush failed, index stays dirty"
            );
        }
        Ok(id)
    }

    /// The documents most similar to `query`, best first.
    ///
    /// `k` defaults to the configured `top_k`. Fewer results come back when
    /// the tenant holds fewer documents; an empty tenant yields none.
    pub fn search(
        &self,
        tenant: &TenantId,
        query: &str,
        k: Option<usize>,
    ) -> Result<Vec<SearchHit>> {
        let k = k.unwrap_or(self.registry.config().top_k);
        let handle = self.registry.get_or_create(tenant)?;
        if k == 0 || handle.read().is_empty() {
            return Ok(Vec::new());
        }

        let vector = self.registry.embedder().embed(query)?;

        let state = handle.read();
        let neighbours = state.index.knn(&vector, k)?;
        let mut hits = Vec::with_capacity(neighbours.len());
        for (id, distance) in neighbours {
            match state.mapping.document(id) {
                Some(document) => hits.push(SearchHit {
                    document_id: document.clone(),
                    distance,
                    score: 1.0 - distance,
                }),
                None => {
                    let err = Error::MappingInconsistency(format!(
                        "node {id} has no document"
                    ));
                    warn!(tenant = %tenant, error = %err, "skipping search result");
                }
            }
        }

        debug!(tenant = %tenant, k, hits = hits.len(), "search finished");
        Ok(hits)
    }

    pub fn status(&self, tenant: &TenantId) -> Result<TenantStatus> {
        let handle = self.registry.get_or_create(tenant)?;
        let state = handle.read();
        Ok(TenantStatus {
            tenant: tenant.clone(),
            documents: state.len(),
            dirty: state.is_dirty(),
            pending: state.pending(),
            unreachable: state.index.unreachable_count(),
            index: state.index.stats(),
        })
    }

    /// Re-embed all stored documents of `tenant`.
    pub fn rebuild(&self, tenant: &TenantId) -> Result<usize> {
        let handle = self.registry.rebuild(tenant)?;
        let count = handle.read().len();
        Ok(count)
    }

    pub fn flush(&self, tenant: &TenantId) -> Result<bool> {
        self.registry.flush(tenant)
    }

    pub fn flush_all(&self) -> Result<usize> {
        self.registry.flush_all()
    }

    pub fn shutdown(&self) -> Result<usize> {
        self.registry.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::EngineConfig,
        embedding::{Embedder, EmbeddingProvider, HashingEmbedder},
        snapshot::SnapshotStore,
        source::MemoryDocuments,
    };

    struct Broken;

    impl EmbeddingProvider for Broken {
        fn model_id(&self) -> &str {
            "broken"
        }

        fn dimension(&self) -> Result<usize> {
            Ok(8)
        }

        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(Error::Embedding("provider offline".into()))
        }
    }

    fn service_with(
        provider: impl EmbeddingProvider + 'static,
    ) -> (tempfile::TempDir, RetrievalService) {
        let tmp = tempfile::tempdir().unwrap();
        let registry = TenantRegistry::new(
            SnapshotStore::new(tmp.path().join("snapshots")),
            Arc::new(MemoryDocuments::new()),
            Embedder::new(Arc::new(provider)).with_attempts(1),
            EngineConfig {
                seed: Some(9),
                ..EngineConfig::default()
            },
        );
        (tmp, RetrievalService::new(registry))
    }

    #[test]
    fn add_then_search() {
        let (_tmp, service) = service_with(HashingEmbedder::new(64));
        let t = TenantId::global();
        service.add_document(&t, "a", "rust borrow checker").unwrap();
        service.add_document(&t, "b", "baking sourdough bread").unwrap();

        let hits = service.search(&t, "borrow checker", Some(1)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id.as_str(), "a");
        assert!((hits[0].score - (1.0 - hits[0].distance)).abs() < 1e-6);
    }

    #[test]
    fn default_k_comes_from_config() {
        let (_tmp, service) = service_with(HashingEmbedder::new(64));
        let t = TenantId::global();
        for i in 0..8 {
            service
                .add_document(&t, format!("doc-{i}"), &format!("text number {i}"))
                .unwrap();
        }
        assert_eq!(service.search(&t, "text", None).unwrap().len(), 5);
    }

    #[test]
    fn duplicate_is_rejected() {
        let (_tmp, service) = service_with(HashingEmbedder::new(16));
        let t = TenantId::global();
        service.add_document(&t, "a", "one").unwrap();
        assert!(matches!(
            service.add_document(&t, "a", "two"),
            Err(Error::DuplicateDocument { .. })
        ));
        assert_eq!(service.status(&t).unwrap().documents, 1);
    }

    #[test]
    fn embedding_failure_leaves_tenant_clean() {
        let (_tmp, service) = service_with(Broken);
        let t = TenantId::global();

        let err = service.add_document(&t, "a", "text").unwrap_err();
        assert!(err.is_retryable());

        let status = service.status(&t).unwrap();
        assert_eq!(status.documents, 0);
        assert!(!status.dirty);
    }

    #[test]
    fn empty_tenant_search_skips_provider() {
        let (_tmp, service) = service_with(Broken);
        let hits = service.search(&TenantId::global(), "anything", Some(5));
        assert!(hits.unwrap().is_empty());
    }

    #[test]
    fn status_reports_graph_health() {
        let (_tmp, service) = service_with(HashingEmbedder::new(16));
        let t = TenantId::global();
        service.add_document(&t, "a", "alpha").unwrap();
        service.add_document(&t, "b", "beta").unwrap();

        let status = service.status(&t).unwrap();
        assert_eq!(status.documents, 2);
        assert_eq!(status.pending, 2);
        assert!(status.dirty);
        assert_eq!(status.unreachable, 0);
        assert_eq!(status.index.nodes, 2);

        assert!(service.flush(&t).unwrap());
        assert!(!service.status(&t).unwrap().dirty);
    }
}
