//! ragdex - per-tenant semantic document retrieval.
//!
//! Documents are embedded into vectors and indexed in a layered small-world
//! graph ([`HnswIndex`]), one per tenant. Indices grow incrementally, are
//! snapshotted to disk and rebuilt from the document store when a snapshot
//! is missing or unreadable.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ragdex::{
//!     EngineConfig, MemoryDocuments, RetrievalService, SnapshotStore,
//!     TenantId, TenantRegistry,
//!     embedding::{Embedder, HashingEmbedder},
//! };
//!
//! let registry = TenantRegistry::new(
//!     SnapshotStore::new("/tmp/ragdex-snapshots"),
//!     Arc::new(MemoryDocuments::new()),
//!     Embedder::new(Arc::new(HashingEmbedder::new(256))),
//!     EngineConfig::default(),
//! );
//! let service = RetrievalService::new(registry);
//!
//! let tenant = TenantId::new("alice").unwrap();
//! service
//!     .add_document(&tenant, "intro.md", "rust ownership and borrowing")
//!     .unwrap();
//!
//! for hit in service.search(&tenant, "borrowing", None).unwrap() {
//!     println!("{} (score: {:.3})", hit.document_id, hit.score);
//! }
//! service.shutdown().unwrap();
//! ```

pub mod cli;
pub mod config;
pub mod data_dir;
pub mod doc_id;
pub mod document_db;
pub mod embedding;
pub mod error;
pub mod hnsw;
pub mod mapping;
pub mod model_manager;
pub mod registry;
pub mod service;
pub mod snapshot;
pub mod source;
pub mod tenant;

pub use config::EngineConfig;
pub use data_dir::DataDir;
pub use doc_id::DocumentId;
pub use document_db::DocumentDb;
pub use error::{Error, Result};
pub use hnsw::{HnswIndex, HnswParams, InternalId};
pub use mapping::IdMapping;
pub use registry::{TenantHandle, TenantRegistry};
pub use service::{RetrievalService, SearchHit};
pub use snapshot::SnapshotStore;
pub use source::{DocumentSource, Documents, MemoryDocuments};
pub use tenant::TenantId;
