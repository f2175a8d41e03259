//! Live per-tenant indices.
//!
//! The registry holds at most one [`TenantHandle`] per tenant. A handle is
//! created on first access: from the tenant's snapshot when one exists, else
//! by embedding every document the [`DocumentSource`] holds for the tenant.
//!
//! Locking, outermost first:
//!
//! 1. the tenant table (held only to find or create a slot)
//! 2. the tenant slot (held while loading or rebuilding that tenant)
//! 3. the handle's `RwLock` (readers search, writers insert and flush)

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::{
    config::EngineConfig,
    doc_id::DocumentId,
    embedding::Embedder,
    error::{Error, Result},
    hnsw::{HnswIndex, InternalId},
    mapping::IdMapping,
    snapshot::SnapshotStore,
    source::DocumentSource,
    tenant::TenantId,
};

/// Index, mapping and flush bookkeeping of one tenant.
#[derive(Debug)]
pub struct TenantState {
    pub index: HnswIndex,
    pub mapping: IdMapping,
    dirty: bool,
    pending: usize,
}

impl TenantState {
    fn new(index: HnswIndex, mapping: IdMapping) -> Self {
        Self {
            index,
            mapping,
            dirty: false,
            pending: 0,
        }
    }

    /// Whether the live state has changes not yet in the snapshot.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Insertions since the last flush.
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    /// Insert an embedded document.
    ///
    /// Nothing changes and the dirty flag stays untouched when this fails.
    pub fn insert(
        &mut self,
        tenant: &TenantId,
        document: DocumentId,
        vector: &[f32],
    ) -> Result<InternalId> {
        if self.mapping.contains(document.as_str()) {
            return Err(Error::DuplicateDocument {
                tenant: tenant.to_string(),
                document: document.into_string(),
            });
        }
        if self.mapping.len() != self.index.len() {
            return Err(Error::MappingInconsistency(format!(
                "index has {} nodes, mapping has {} documents",
                self.index.len(),
                self.mapping.len()
            )));
        }

        let id = self.index.insert(vector)?;
        self.mapping.insert(id, document)?;
        self.mark_dirty();
        self.pending += 1;
        Ok(id)
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

/// The single live copy of a tenant's index.
#[derive(Debug)]
pub struct TenantHandle {
    tenant: TenantId,
    state: RwLock<TenantState>,
}

impl TenantHandle {
    fn new(tenant: TenantId, state: TenantState) -> Self {
        Self {
            tenant,
            state: RwLock::new(state),
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Shared access for queries.
    pub fn read(&self) -> RwLockReadGuard<'_, TenantState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access for inserts and flushes.
    pub fn write(&self) -> RwLockWriteGuard<'_, TenantState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_dirty(&self) -> bool {
        self.read().is_dirty()
    }
}

#[derive(Default)]
struct Slot {
    handle: Mutex<Option<Arc<TenantHandle>>>,
}

/// Owns the live index of every tenant touched by this process.
pub struct TenantRegistry {
    store: SnapshotStore,
    source: Arc<dyn DocumentSource>,
    embedder: Embedder,
    config: EngineConfig,
    slots: Mutex<HashMap<TenantId, Arc<Slot>>>,
}

impl TenantRegistry {
    pub fn new(
        store: SnapshotStore,
        source: Arc<dyn DocumentSource>,
        embedder: Embedder,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            source,
            embedder,
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    fn slot(&self, tenant: &TenantId) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(tenant.clone()).or_default())
    }

    fn loaded_handles(&self) -> Vec<Arc<TenantHandle>> {
        let slots: Vec<Arc<Slot>> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        slots
            .iter()
            .filter_map(|slot| {
                slot.handle
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            })
            .collect()
    }

    /// The tenant's handle if it is already loaded.
    pub fn get(&self, tenant: &TenantId) -> Option<Arc<TenantHandle>> {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant)
            .cloned()?;
        let handle = slot.handle.lock().unwrap_or_else(PoisonError::into_inner);
        handle.clone()
    }

    /// Tenants with a live handle.
    pub fn loaded_tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self
            .loaded_handles()
            .iter()
            .map(|h| h.tenant().clone())
            .collect();
        tenants.sort();
        tenants
    }

    /// The tenant's handle, loading or building it on first access.
    ///
    /// A corrupt snapshot is replaced by an index rebuilt from the document
    /// source. A snapshot from a different embedding model or dimension is
    /// refused until [`rebuild`](Self::rebuild) is called.
    pub fn get_or_create(&self, tenant: &TenantId) -> Result<Arc<TenantHandle>> {
        let slot = self.slot(tenant);
        let mut guard = slot.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = guard.as_ref() {
            return Ok(Arc::clone(handle));
        }

        let state = self.open(tenant)?;
        let handle = Arc::new(TenantHandle::new(tenant.clone(), state));
        *guard = Some(Arc::clone(&handle));

        // Persist an index built from the source, replacing any bad snapshot.
        {
            let mut state = handle.write();
            if state.is_dirty() {
                self.flush_state(tenant, &mut state)?;
            }
        }
        Ok(handle)
    }

    fn level_seed(&self) -> u64 {
        self.config.seed.unwrap_or_else(rand::random)
    }

    fn open(&self, tenant: &TenantId) -> Result<TenantState> {
        let dimension = self.embedder.dimension()?;

        match self.store.load(tenant, self.level_seed()) {
            Ok(Some(snapshot)) => {
                if snapshot.index.dimension() != dimension {
                    return Err(Error::DimensionMismatch {
                        expected: dimension,
                        got: snapshot.index.dimension(),
                    });
                }
                if snapshot.meta.model_id != self.embedder.model_id() {
                    return Err(Error::ProviderChanged {
                        stored: snapshot.meta.model_id,
                        active: self.embedder.model_id().to_string(),
                    });
                }

                let mut index = snapshot.index;
                index.set_ef_search(self.config.hnsw.ef_search);
                info!(
                    tenant = %tenant,
                    nodes = index.len(),
                    "loaded index snapshot"
                );
                Ok(TenantState::new(index, snapshot.mapping))
            }
            Ok(None) => {
                let state = self.build(tenant, dimension)?;
                if !state.is_empty() {
                    info!(
                        tenant = %tenant,
                        documents = state.len(),
                        "built index from stored documents"
                    );
                }
                Ok(state)
            }
            Err(Error::CorruptSnapshot(reason)) => {
                warn!(
                    tenant = %tenant,
                    %reason,
                    "snapshot is corrupt, rebuilding from stored documents"
                );
                let mut state = self.build(tenant, dimension)?;
                state.mark_dirty();
                Ok(state)
            }
            Err(e) => Err(e),
        }
    }

    /// Embed every source document of `tenant` into a fresh index.
    ///
    /// Documents are embedded in parallel and inserted in id order. The
    /// result is dirty when it holds any documents.
    fn build(&self, tenant: &TenantId, dimension: usize) -> Result<TenantState> {
        let documents = self.source.get_all_documents(tenant)?;

        let mut vectors = documents
            .into_par_iter()
            .map(|(id, text)| self.embedder.embed(&text).map(|v| (id, v)))
            .collect::<Result<Vec<_>>>()?;
        vectors.sort_by(|a, b| a.0.cmp(&b.0));

        let index = match self.config.seed {
            Some(seed) => HnswIndex::with_seed(dimension, self.config.hnsw, seed),
            None => HnswIndex::new(dimension, self.config.hnsw),
        };
        let mut state = TenantState::new(index, IdMapping::new());
        for (id, vector) in vectors {
            state.insert(tenant, id, &vector)?;
        }
        state.pending = 0;
        debug!(tenant = %tenant, nodes = state.len(), "index built");
        Ok(state)
    }

    /// Re-embed every stored document of `tenant` and replace its index and
    /// snapshot.
    ///
    /// This is the recovery path for [`Error::DimensionMismatch`] and
    /// [`Error::ProviderChanged`]. Searches on the tenant wait until it
    /// finishes.
    pub fn rebuild(&self, tenant: &TenantId) -> Result<Arc<TenantHandle>> {
        let slot = self.slot(tenant);
        let mut guard = slot.handle.lock().unwrap_or_else(PoisonError::into_inner);
        let dimension = self.embedder.dimension()?;
        let mut fresh = self.build(tenant, dimension)?;
        fresh.mark_dirty();

        let handle = match guard.as_ref() {
            Some(handle) => {
                let handle = Arc::clone(handle);
                let mut state = handle.write();
                *state = fresh;
                self.flush_state(tenant, &mut state)?;
                drop(state);
                handle
            }
            None => {
                let mut state = fresh;
                self.flush_state(tenant, &mut state)?;
                let handle = Arc::new(TenantHandle::new(tenant.clone(), state));
                *guard = Some(Arc::clone(&handle));
                handle
            }
        };

        info!(tenant = %tenant, nodes = handle.read().len(), "index rebuilt");
        Ok(handle)
    }

    /// Mark a loaded tenant as needing a flush. Returns `false` when the
    /// tenant is not loaded.
    pub fn mark_dirty(&self, tenant: &TenantId) -> bool {
        match self.get(tenant) {
            Some(handle) => {
                handle.write().mark_dirty();
                true
            }
            None => false,
        }
    }

    /// Flush after an insertion once `flush_every` insertions are pending.
    pub fn after_insert(
        &self,
        tenant: &TenantId,
        state: &mut TenantState,
    ) -> Result<bool> {
        if state.pending >= self.config.flush_every {
            return self.flush_state(tenant, state);
        }
        Ok(false)
    }

    /// Write the snapshot if the state is dirty. Returns whether anything
    /// was written.
    pub fn flush_state(
        &self,
        tenant: &TenantId,
        state: &mut TenantState,
    ) -> Result<bool> {
        if !state.dirty {
            return Ok(false);
        }
        self.store.save(
            tenant,
            self.embedder.model_id(),
            &state.index,
            &state.mapping,
        )?;
        state.dirty = false;
        state.pending = 0;
        info!(tenant = %tenant, nodes = state.len(), "flushed index snapshot");
        Ok(true)
    }

    /// Flush one tenant. A tenant that is not loaded or not dirty is left
    /// alone.
    pub fn flush(&self, tenant: &TenantId) -> Result<bool> {
        match self.get(tenant) {
            Some(handle) => self.flush_state(tenant, &mut handle.write()),
            None => Ok(false),
        }
    }

    /// Flush every loaded tenant. Every tenant is attempted; the first
    /// failure is returned. Returns the number of snapshots written.
    pub fn flush_all(&self) -> Result<usize> {
        let mut written = 0;
        let mut first_error = None;
        for handle in self.loaded_handles() {
            match self.flush_state(handle.tenant(), &mut handle.write()) {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(tenant = %handle.tenant(), error = %e, "flush failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Flush everything before the registry goes away.
    pub fn shutdown(&self) -> Result<usize> {
        self.flush_all()
    }
}

impl Drop for TenantRegistry {
    fn drop(&mut self) {
        if let Err(e) = self.flush_all() {
            error!(error = %e, "failed to flush indices on shutdown");
        }
    }
}

impl std::fmt::Debug for TenantRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantRegistry")
            .field("store", &self.store)
            .field("embedder", &self.embedder)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
