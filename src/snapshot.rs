//! Durable per-tenant snapshots of an index and its id mapping.
//!
//! Each tenant gets its own directory holding two artifacts:
//!
//! - `graph.bin`: binary graph state (header, vectors, adjacency) followed by
//!   a blake3 checksum of everything before it.
//! - `mapping.json`: snapshot metadata and the document ids in node order.
//!   It repeats the graph checksum so a graph/mapping pair from different
//!   saves is detected on load.
//!
//! Both are replaced atomically (temp file, fsync, rename). The graph is
//! written first.

use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    doc_id::DocumentId,
    error::{Error, Result},
    hnsw::{HnswIndex, HnswParams, InternalId, MAX_LEVEL, NodeParts},
    mapping::IdMapping,
    tenant::TenantId,
};

pub const GRAPH_FILE: &str = "graph.bin";
pub const MAPPING_FILE: &str = "mapping.json";

const MAGIC: &[u8; 8] = b"RGDXHNSW";
const FORMAT_VERSION: u32 = 1;
const CHECKSUM_LEN: usize = 32;
const NO_NODE: u32 = u32::MAX;

/// Descriptive part of `mapping.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub format_version: u32,
    pub tenant: TenantId,
    /// Embedding model the vectors were produced with.
    pub model_id: String,
    pub dimension: usize,
    pub node_count: usize,
    /// Hex blake3 checksum of the matching `graph.bin`.
    pub graph_checksum: String,
}

#[derive(Serialize, Deserialize)]
struct MappingFile {
    #[serde(flatten)]
    meta: SnapshotMeta,
    documents: Vec<DocumentId>,
}

/// A successfully loaded and validated snapshot.
#[derive(Debug)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub index: HnswIndex,
    pub mapping: IdMapping,
}

/// Snapshot storage rooted at one directory, one subdirectory per tenant.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tenant_dir(&self, tenant: &TenantId) -> PathBuf {
        self.root.join(tenant.storage_key())
    }

    /// Whether any snapshot artifact exists for the tenant.
    pub fn exists(&self, tenant: &TenantId) -> bool {
        let dir = self.tenant_dir(tenant);
        dir.join(GRAPH_FILE).exists() || dir.join(MAPPING_FILE).exists()
    }

    /// Persist `index` and `mapping` for `tenant`, replacing any previous
    /// snapshot.
    pub fn save(
        &self,
        tenant: &TenantId,
        model_id: &str,
        index: &HnswIndex,
        mapping: &IdMapping,
    ) -> Result<SnapshotMeta> {
        if index.len() != mapping.len() {
            return Err(Error::MappingInconsistency(format!(
                "index has {} nodes but mapping has {} documents",
                index.len(),
                mapping.len()
            )));
        }

        let dir = self.tenant_dir(tenant);
        std::fs::create_dir_all(&dir)?;

        let mut graph = encode_graph(index);
        let checksum = blake3::hash(&graph);
        graph.extend_from_slice(checksum.as_bytes());

        let meta = SnapshotMeta {
            format_version: FORMAT_VERSION,
            tenant: tenant.clone(),
            model_id: model_id.to_string(),
            dimension: index.dimension(),
            node_count: index.len(),
            graph_checksum: checksum.to_hex().to_string(),
        };
        let file = MappingFile {
            meta: meta.clone(),
            documents: mapping.documents().to_vec(),
        };

        write_atomic(&dir.join(GRAPH_FILE), &graph)?;
        write_atomic(&dir.join(MAPPING_FILE), &serde_json::to_vec_pretty(&file)?)?;

        debug!(
            tenant = %tenant,
            nodes = meta.node_count,
            bytes = graph.len(),
            "snapshot written"
        );
        Ok(meta)
    }

    /// Load the tenant's snapshot.
    ///
    /// Returns `Ok(None)` when the tenant has no snapshot at all. Every
    /// structural problem, including a half-present snapshot, is reported
    /// as [`Error::CorruptSnapshot`]. `seed` drives level assignment for
    /// nodes inserted after the load.
    pub fn load(&self, tenant: &TenantId, seed: u64) -> Result<Option<Snapshot>> {
        let dir = self.tenant_dir(tenant);
        let graph_path = dir.join(GRAPH_FILE);
        let mapping_path = dir.join(MAPPING_FILE);

        match (graph_path.exists(), mapping_path.exists()) {
            (false, false) => return Ok(None),
            (true, false) => {
                return Err(Error::CorruptSnapshot(format!(
                    "{MAPPING_FILE} is missing"
                )));
            }
            (false, true) => {
                return Err(Error::CorruptSnapshot(format!(
                    "{GRAPH_FILE} is missing"
                )));
            }
            (true, true) => {}
        }

        let graph = std::fs::read(&graph_path)?;
        let (index, checksum) = decode_graph(&graph, seed)?;

        let file: MappingFile =
            serde_json::from_slice(&std::fs::read(&mapping_path)?).map_err(
                |e| Error::CorruptSnapshot(format!("{MAPPING_FILE}: {e}")),
            )?;
        let meta = file.meta;

        if meta.format_version != FORMAT_VERSION {
            return Err(Error::CorruptSnapshot(format!(
                "unsupported mapping version {}",
                meta.format_version
            )));
        }
        if &meta.tenant != tenant {
            return Err(Error::CorruptSnapshot(format!(
                "snapshot belongs to tenant '{}'",
                meta.tenant
            )));
        }
        if meta.graph_checksum != checksum {
            return Err(Error::CorruptSnapshot(
                "mapping was written for a different graph".into(),
            ));
        }
        if meta.dimension != index.dimension() {
            return Err(Error::CorruptSnapshot(format!(
                "mapping dimension {} disagrees with graph dimension {}",
                meta.dimension,
                index.dimension()
            )));
        }
        if meta.node_count != index.len() || file.documents.len() != index.len()
        {
            return Err(Error::CorruptSnapshot(format!(
                "graph has {} nodes, mapping declares {} and lists {}",
                index.len(),
                meta.node_count,
                file.documents.len()
            )));
        }

        let mapping = IdMapping::from_documents(file.documents)
            .map_err(|e| Error::CorruptSnapshot(e.to_string()))?;

        debug!(tenant = %tenant, nodes = index.len(), "snapshot loaded");
        Ok(Some(Snapshot {
            meta,
            index,
            mapping,
        }))
    }

    /// Read only the metadata of a snapshot, without decoding the graph.
    pub fn read_meta(&self, tenant: &TenantId) -> Result<Option<SnapshotMeta>> {
        let path = self.tenant_dir(tenant).join(MAPPING_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let meta = serde_json::from_slice(&std::fs::read(&path)?)
            .map_err(|e| Error::CorruptSnapshot(format!("{MAPPING_FILE}: {e}")))?;
        Ok(Some(meta))
    }
}

/// Write `bytes` to `path` so readers see either the old or the new
/// content, never a mix.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let mut file = File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp_path, path)?;

    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn encode_graph(index: &HnswIndex) -> Vec<u8> {
    let params = index.params();
    let dim = index.dimension();
    let mut buf =
        Vec::with_capacity(64 + index.len() * (dim * 4 + params.m0 * 4 + 8));

    buf.extend_from_slice(MAGIC);
    put_u32(&mut buf, FORMAT_VERSION);
    put_u32(&mut buf, dim as u32);
    put_u32(&mut buf, params.m as u32);
    put_u32(&mut buf, params.m0 as u32);
    put_u32(&mut buf, params.ef_construction as u32);
    put_u32(&mut buf, params.ef_search as u32);
    put_u32(&mut buf, index.len() as u32);
    put_u32(&mut buf, index.next_id());
    put_u32(&mut buf, index.entry_point().unwrap_or(NO_NODE));
    buf.push(index.max_layer() as u8);

    for (vector, links, parent) in index.parts() {
        buf.push((links.len() - 1) as u8);
        put_u32(&mut buf, parent.unwrap_or(NO_NODE));
        for x in vector {
            buf.extend_from_slice(&x.to_le_bytes());
        }
        for layer in links {
            put_u32(&mut buf, layer.len() as u32);
            for &id in layer {
                put_u32(&mut buf, id);
            }
        }
    }
    buf
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.buf.len());
        let Some(end) = end else {
            return Err(Error::CorruptSnapshot(format!(
                "{GRAPH_FILE} truncated at byte {}",
                self.pos
            )));
        };
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Decode and validate `graph.bin`. Returns the index and the hex checksum.
fn decode_graph(bytes: &[u8], seed: u64) -> Result<(HnswIndex, String)> {
    let corrupt = |msg: String| Error::CorruptSnapshot(msg);

    if bytes.len() < MAGIC.len() + CHECKSUM_LEN {
        return Err(corrupt(format!("{GRAPH_FILE} is too short")));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    let checksum = blake3::hash(body);
    if checksum.as_bytes().as_slice() != trailer {
        return Err(corrupt(format!("{GRAPH_FILE} checksum mismatch")));
    }

    let mut r = Reader { buf: body, pos: 0 };
    if r.take(MAGIC.len())? != MAGIC {
        return Err(corrupt(format!("{GRAPH_FILE} has a bad magic number")));
    }
    let version = r.u32()?;
    if version != FORMAT_VERSION {
        return Err(corrupt(format!("unsupported graph version {version}")));
    }

    let dimension = r.u32()? as usize;
    let params = HnswParams {
        m: r.u32()? as usize,
        m0: r.u32()? as usize,
        ef_construction: r.u32()? as usize,
        ef_search: r.u32()? as usize,
    };
    let node_count = r.u32()? as usize;
    let next_id = r.u32()? as usize;
    if next_id != node_count {
        return Err(corrupt(format!(
            "next id {next_id} disagrees with node count {node_count}"
        )));
    }
    let entry = match r.u32()? {
        NO_NODE => None,
        id => Some(id as InternalId),
    };
    let max_layer = r.u8()? as usize;

    // Every node needs at least its level byte, parent, vector and layer-0
    // count.
    let min_node = 1 + 4 + dimension.saturating_mul(4) + 4;
    if node_count.saturating_mul(min_node) > r.remaining() {
        return Err(corrupt(format!(
            "{node_count} nodes cannot fit in {} bytes",
            r.remaining()
        )));
    }

    let mut parts = Vec::with_capacity(node_count);
    for id in 0..node_count {
        let level = r.u8()? as usize;
        if level > MAX_LEVEL {
            return Err(corrupt(format!("node {id} has level {level}")));
        }
        let parent = match r.u32()? {
            NO_NODE => None,
            p => Some(p as InternalId),
        };
        let vector = r
            .take(dimension * 4)?
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let mut links = Vec::with_capacity(level + 1);
        for _ in 0..=level {
            let count = r.u32()? as usize;
            if count.saturating_mul(4) > r.remaining() {
                return Err(corrupt(format!(
                    "node {id} declares {count} links past the end of file"
                )));
            }
            let mut layer = Vec::with_capacity(count);
            for _ in 0..count {
                layer.push(r.u32()?);
            }
            links.push(layer);
        }
        parts.push(NodeParts {
            vector,
            links,
            parent,
        });
    }
    if r.remaining() != 0 {
        return Err(corrupt(format!(
            "{} unexpected bytes after the last node",
            r.remaining()
        )));
    }

    let index = HnswIndex::from_parts(dimension, params, parts, entry, seed)?;
    if index.max_layer() != max_layer {
        return Err(corrupt(format!(
            "header says max layer {max_layer}, nodes reach {}",
            index.max_layer()
        )));
    }

    Ok((index, checksum.to_hex().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: usize) -> (HnswIndex, IdMapping) {
        let mut index = HnswIndex::with_seed(3, HnswParams::with_m(4), 5);
        let mut mapping = IdMapping::new();
        for i in 0..n {
            let x = i as f32;
            let id = index.insert(&[x.sin(), x.cos(), 1.0 + x * 0.1]).unwrap();
            mapping.insert(id, format!("doc-{i}").into()).unwrap();
        }
        (index, mapping)
    }

    fn tenant(name: &str) -> TenantId {
        TenantId::new(name).unwrap()
    }

    fn test_store() -> (tempfile::TempDir, SnapshotStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(tmp.path().join("snapshots"));
        (tmp, store)
    }

    #[test]
    fn missing_snapshot_loads_as_none() {
        let (_tmp, store) = test_store();
        assert!(store.load(&tenant("a"), 1).unwrap().is_none());
        assert!(!store.exists(&tenant("a")));
    }

    #[test]
    fn save_then_load_preserves_graph_and_mapping() {
        let (_tmp, store) = test_store();
        let (index, mapping) = sample(60);
        let t = tenant("alice");

        let meta = store.save(&t, "model-x", &index, &mapping).unwrap();
        assert_eq!(meta.node_count, 60);

        let loaded = store.load(&t, 1).unwrap().unwrap();
        assert_eq!(loaded.meta, meta);
        assert_eq!(loaded.mapping, mapping);
        assert_eq!(loaded.index.entry_point(), index.entry_point());
        assert_eq!(loaded.index.max_layer(), index.max_layer());
        assert!(index.parts().eq(loaded.index.parts()));

        let probe = [0.3, -0.2, 0.9];
        assert_eq!(
            index.knn(&probe, 7).unwrap(),
            loaded.index.knn(&probe, 7).unwrap()
        );
    }

    #[test]
    fn empty_index_round_trips() {
        let (_tmp, store) = test_store();
        let index = HnswIndex::with_seed(8, HnswParams::default(), 1);
        let t = tenant("empty");
        store.save(&t, "m", &index, &IdMapping::new()).unwrap();

        let loaded = store.load(&t, 1).unwrap().unwrap();
        assert!(loaded.index.is_empty());
        assert_eq!(loaded.index.dimension(), 8);
    }

    #[test]
    fn saving_twice_writes_identical_files() {
        let (_tmp, store) = test_store();
        let (index, mapping) = sample(20);
        let t = tenant("a");
        let dir = store.tenant_dir(&t);

        store.save(&t, "m", &index, &mapping).unwrap();
        let graph = std::fs::read(dir.join(GRAPH_FILE)).unwrap();
        let map = std::fs::read(dir.join(MAPPING_FILE)).unwrap();

        store.save(&t, "m", &index, &mapping).unwrap();
        assert_eq!(std::fs::read(dir.join(GRAPH_FILE)).unwrap(), graph);
        assert_eq!(std::fs::read(dir.join(MAPPING_FILE)).unwrap(), map);
        assert!(!dir.join("graph.bin.tmp").exists());
    }

    #[test]
    fn truncated_graph_is_corrupt() {
        let (_tmp, store) = test_store();
        let (index, mapping) = sample(10);
        let t = tenant("a");
        store.save(&t, "m", &index, &mapping).unwrap();

        let path = store.tenant_dir(&t).join(GRAPH_FILE);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert!(matches!(store.load(&t, 1), Err(Error::CorruptSnapshot(_))));
    }

    #[test]
    fn flipped_byte_is_corrupt() {
        let (_tmp, store) = test_store();
        let (index, mapping) = sample(10);
        let t = tenant("a");
        store.save(&t, "m", &index, &mapping).unwrap();

        let path = store.tenant_dir(&t).join(GRAPH_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[50] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(store.load(&t, 1), Err(Error::CorruptSnapshot(_))));
    }

    #[test]
    fn missing_mapping_is_corrupt() {
        let (_tmp, store) = test_store();
        let (index, mapping) = sample(5);
        let t = tenant("a");
        store.save(&t, "m", &index, &mapping).unwrap();
        std::fs::remove_file(store.tenant_dir(&t).join(MAPPING_FILE)).unwrap();

        assert!(store.exists(&t));
        assert!(matches!(store.load(&t, 1), Err(Error::CorruptSnapshot(_))));
    }

    #[test]
    fn mapping_from_another_save_is_corrupt() {
        let (_tmp, store) = test_store();
        let t = tenant("a");
        let (small, small_map) = sample(5);
        store.save(&t, "m", &small, &small_map).unwrap();
        let dir = store.tenant_dir(&t);
        let old_mapping = std::fs::read(dir.join(MAPPING_FILE)).unwrap();

        let (big, big_map) = sample(6);
        store.save(&t, "m", &big, &big_map).unwrap();
        std::fs::write(dir.join(MAPPING_FILE), old_mapping).unwrap();

        assert!(matches!(store.load(&t, 1), Err(Error::CorruptSnapshot(_))));
    }

    #[test]
    fn size_mismatch_refused_on_save() {
        let (_tmp, store) = test_store();
        let (index, _) = sample(3);
        let err = store
            .save(&tenant("a"), "m", &index, &IdMapping::new())
            .unwrap_err();
        assert!(matches!(err, Error::MappingInconsistency(_)));
    }

    #[test]
    fn tenants_use_separate_directories() {
        let (_tmp, store) = test_store();
        let a = store.tenant_dir(&tenant("a/b"));
        let b = store.tenant_dir(&tenant("a"));
        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(store.root()));
    }

    #[test]
    fn read_meta_skips_graph() {
        let (_tmp, store) = test_store();
        let (index, mapping) = sample(4);
        let t = tenant("a");
        assert!(store.read_meta(&t).unwrap().is_none());
        store.save(&t, "model-y", &index, &mapping).unwrap();

        let meta = store.read_meta(&t).unwrap().unwrap();
        assert_eq!(meta.model_id, "model-y");
        assert_eq!(meta.node_count, 4);
        assert_eq!(meta.dimension, 3);
    }
}
