use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use ragdex::{
    EngineConfig,
    Error,
    MemoryDocuments,
    RetrievalService,
    SnapshotStore,
    TenantId,
    TenantRegistry,
    embedding::{Embedder, EmbeddingProvider, HashingEmbedder},
    error::Operation,
    snapshot::GRAPH_FILE,
};

struct Harness {
    tmp: tempfile::TempDir,
    docs: Arc<MemoryDocuments>,
}

impl Harness {
    fn new() -> Self {
        Self {
            tmp: tempfile::tempdir().unwrap(),
            docs: Arc::new(MemoryDocuments::new()),
        }
    }

    fn store(&self) -> SnapshotStore {
        SnapshotStore::new(self.tmp.path().join("snapshots"))
    }

    fn service_with(
        &self,
        provider: Arc<dyn EmbeddingProvider>,
        config: EngineConfig,
    ) -> RetrievalService {
        let embedder = Embedder::new(provider)
            .with_timeout(config.embed_timeout)
            .with_attempts(config.embed_attempts);
        RetrievalService::new(TenantRegistry::new(
            self.store(),
            self.docs.clone(),
            embedder,
            config,
        ))
    }

    fn service(&self) -> RetrievalService {
        self.service_with(
            Arc::new(HashingEmbedder::new(128)),
            EngineConfig {
                seed: Some(17),
                ..EngineConfig::default()
            },
        )
    }

    /// Store a document in the source and index it.
    fn add(&self, service: &RetrievalService, tenant: &TenantId, id: &str, text: &str) {
        self.docs.insert(tenant, id, text);
        service.add_document(tenant, id, text).unwrap();
    }
}

fn tenant(name: &str) -> TenantId {
    TenantId::new(name).unwrap()
}

struct Stalled;

impl EmbeddingProvider for Stalled {
    fn model_id(&self) -> &str {
        "stalled"
    }

    fn dimension(&self) -> ragdex::Result<usize> {
        Ok(4)
    }

    fn embed(&self, _text: &str) -> ragdex::Result<Vec<f32>> {
        thread::sleep(Duration::from_secs(2));
        Ok(vec![1.0, 0.0, 0.0, 0.0])
    }
}

/// A model that takes far too long to load.
struct SlowModelLoad;

impl EmbeddingProvider for SlowModelLoad {
    fn model_id(&self) -> &str {
        "slow-model-load"
    }

    fn dimension(&self) -> ragdex::Result<usize> {
        thread::sleep(Duration::from_secs(2));
        Ok(4)
    }

    fn embed(&self, _text: &str) -> ragdex::Result<Vec<f32>> {
        Ok(vec![1.0, 0.0, 0.0, 0.0])
    }
}

#[test]
fn empty_index_search_returns_nothing() {
    let h = Harness::new();
    let hits = h
        .service()
        .search(&TenantId::global(), "anything", Some(5))
        .unwrap();
    assert!(hits.is_empty());
}

#[test]
fn identical_text_ranks_its_document_first() {
    let h = Harness::new();
    let service = h.service();
    let t = TenantId::global();
    h.add(&service, &t, "doc-1", "volcanic eruptions and lava flows");
    h.add(&service, &t, "doc-2", "sourdough starter feeding schedule");
    h.add(&service, &t, "doc-3", "orbital mechanics of geostationary satellites");

    let hits = service
        .search(&t, "sourdough starter feeding schedule", Some(3))
        .unwrap();
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].document_id.as_str(), "doc-2");
    assert!(hits[0].distance < 1e-5);
    assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
}

#[test]
fn fewer_documents_than_k_returns_all() {
    let h = Harness::new();
    let service = h.service();
    let t = TenantId::global();
    h.add(&service, &t, "a", "one");
    h.add(&service, &t, "b", "two");
    assert_eq!(service.search(&t, "one", Some(10)).unwrap().len(), 2);
}

#[test]
fn snapshot_round_trip_preserves_rankings() {
    let h = Harness::new();
    let t = tenant("alice");
    let queries = ["river delta", "compiler passes", "tea ceremony"];
    let before: Vec<_>;
    {
        let service = h.service();
        for i in 0..40 {
            let text = format!("note {i} about river delta compiler passes tea {}", i % 7);
            h.add(&service, &t, &format!("n{i}"), &text);
        }
        before = queries
            .iter()
            .map(|q| service.search(&t, q, Some(5)).unwrap())
            .collect();
        service.shutdown().unwrap();
    }

    let service = h.service();
    for (query, expected) in queries.iter().zip(&before) {
        let hits = service.search(&t, query, Some(5)).unwrap();
        assert_eq!(hits[0].document_id, expected[0].document_id, "{query}");
        assert_eq!(hits.len(), expected.len());
    }
}

#[test]
fn second_flush_is_a_noop() {
    let h = Harness::new();
    let service = h.service();
    let t = TenantId::global();
    h.add(&service, &t, "a", "alpha");

    assert!(service.flush(&t).unwrap());
    let path = h.store().tenant_dir(&t).join(GRAPH_FILE);
    let first = std::fs::read(&path).unwrap();
    assert!(!service.flush(&t).unwrap());
    assert_eq!(std::fs::read(&path).unwrap(), first);
}

#[test]
fn truncated_snapshot_rebuilds_from_documents() {
    let h = Harness::new();
    let t = tenant("bob");
    {
        let service = h.service();
        h.add(&service, &t, "kept-1", "glacier retreat measurements");
        h.add(&service, &t, "kept-2", "medieval trade routes");
        service.shutdown().unwrap();
    }

    let path = h.store().tenant_dir(&t).join(GRAPH_FILE);
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() / 3]).unwrap();

    let service = h.service();
    let hits = service.search(&t, "medieval trade routes", Some(2)).unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].document_id.as_str(), "kept-2");
    assert!(h.store().load(&t, 0).unwrap().is_some(), "snapshot replaced");
}

#[test]
fn tenants_never_see_each_others_documents() {
    let h = Harness::new();
    let service = h.service();
    let a = tenant("a");
    let b = tenant("b");
    h.add(&service, &a, "a-doc", "shared content about owls");
    h.add(&service, &b, "b-doc", "shared content about owls");

    let hits_a = service.search(&a, "shared content about owls", None).unwrap();
    let hits_b = service.search(&b, "shared content about owls", None).unwrap();
    assert_eq!(hits_a.len(), 1);
    assert_eq!(hits_a[0].document_id.as_str(), "a-doc");
    assert_eq!(hits_b.len(), 1);
    assert_eq!(hits_b[0].document_id.as_str(), "b-doc");

    service.shutdown().unwrap();
    let store = h.store();
    assert_ne!(store.tenant_dir(&a), store.tenant_dir(&b));
}

#[test]
fn duplicate_document_is_rejected() {
    let h = Harness::new();
    let service = h.service();
    let t = TenantId::global();
    h.add(&service, &t, "same", "first");

    let err = service.add_document(&t, "same", "second").unwrap_err();
    assert!(matches!(err, Error::DuplicateDocument { .. }));
    assert_eq!(service.search(&t, "second", None).unwrap().len(), 1);
}

#[test]
fn provider_timeout_is_reported_as_unavailable() {
    let h = Harness::new();
    let config = EngineConfig {
        embed_timeout: Duration::from_millis(50),
        embed_attempts: 1,
        ..EngineConfig::default()
    };
    let service = h.service_with(Arc::new(Stalled), config);
    let t = TenantId::global();

    let err = service.add_document(&t, "x", "text").unwrap_err();
    assert!(matches!(err, Error::EmbeddingTimeout { .. }));
    assert_eq!(
        err.user_message(Operation::AddDocument),
        "document not indexed, retry"
    );
    assert!(!service.registry().get(&t).unwrap().is_dirty());
    assert!(!service.flush(&t).unwrap());
}

#[test]
fn slow_model_load_is_reported_as_unavailable() {
    let h = Harness::new();
    let config = EngineConfig {
        embed_timeout: Duration::from_millis(50),
        embed_attempts: 1,
        ..EngineConfig::default()
    };
    let service = h.service_with(Arc::new(SlowModelLoad), config);
    let t = TenantId::global();

    let started = Instant::now();
    let err = service.search(&t, "anything", None).unwrap_err();
    assert!(matches!(err, Error::EmbeddingTimeout { .. }));
    assert_eq!(
        err.user_message(Operation::Search),
        "search temporarily unavailable"
    );
    let err = service.add_document(&t, "x", "text").unwrap_err();
    assert!(matches!(err, Error::EmbeddingTimeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(service.registry().get(&t).is_none(), "tenant not loaded");
}

#[test]
fn concurrent_adds_and_searches() {
    let h = Harness::new();
    let service = Arc::new(h.service());
    let t = TenantId::global();

    let workers: Vec<_> = (0..4)
        .map(|w| {
            let service = Arc::clone(&service);
            let t = t.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    let id = format!("w{w}-d{i}");
                    let text = format!("worker {w} document {i} topic {}", i % 5);
                    service.add_document(&t, id.as_str(), &text).unwrap();
                    let hits = service.search(&t, &text, Some(3)).unwrap();
                    assert!(!hits.is_empty());
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let status = service.status(&t).unwrap();
    assert_eq!(status.documents, 100);
    assert_eq!(status.index.nodes, 100);
    assert_eq!(status.unreachable, 0);
}

#[test]
fn rebuild_recovers_from_model_change() {
    let h = Harness::new();
    let t = TenantId::global();
    {
        let service = h.service();
        h.add(&service, &t, "a", "alpha beta");
        service.shutdown().unwrap();
    }

    let other = h.service_with(
        Arc::new(HashingEmbedder::new(64)),
        EngineConfig::default(),
    );
    let err = other.search(&t, "alpha", None).unwrap_err();
    assert!(err.requires_rebuild());

    assert_eq!(other.rebuild(&t).unwrap(), 1);
    let hits = other.search(&t, "alpha beta", None).unwrap();
    assert_eq!(hits[0].document_id.as_str(), "a");
}
