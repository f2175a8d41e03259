//! Graph construction and k-nearest-neighbour search.
//!
//! **Insert**: draw a level `L`, descend greedily from the entry point down
//! to `L + 1`, then on each layer `L..=0` run a beam search with
//! `ef_construction` candidates and link the new node, in both directions,
//! to a diverse subset of them: a candidate is taken only when it is closer
//! to the new node than to every neighbour already taken, and leftover slots
//! are filled closest first. Full neighbour lists are re-selected the same
//! way.
//!
//! **Reachability**: on layer 0 every node except node 0 has a tree parent,
//! an earlier node it is linked to in both directions. Tree links are never
//! pruned, so layer 0 always contains a spanning tree and every node can be
//! reached from any entry point, however tightly the vectors cluster.
//!
//! **Query**: greedy descent to layer 1, then a beam search on layer 0 with
//! `max(ef_search, k)` candidates.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashSet, VecDeque},
};

use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::Serialize;

use super::{
    distance::{cosine_distance, normalize},
    params::{HnswParams, MAX_LEVEL},
};
use crate::error::{Error, Result};

/// Dense node id assigned at insertion time, starting at 0. Ids are never
/// reused.
pub type InternalId = u32;

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: InternalId,
    distance: f32,
}

impl Candidate {
    fn order(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.id.cmp(&other.id))
    }
}

/// Min-heap entry: the nearest candidate pops first.
struct Nearest(Candidate);

impl PartialEq for Nearest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Nearest {}

impl Ord for Nearest {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.order(&self.0)
    }
}

impl PartialOrd for Nearest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap entry: the farthest result sits on top so it can be evicted.
struct Farthest(Candidate);

impl PartialEq for Farthest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Farthest {}

impl Ord for Farthest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.order(&other.0)
    }
}

impl PartialOrd for Farthest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct Node {
    /// Unit-length copy of the inserted vector.
    vector: Vec<f32>,
    /// `links[layer]` holds the out-neighbours on that layer.
    links: Vec<Vec<InternalId>>,
    /// Layer-0 tree parent; `None` only for node 0.
    parent: Option<InternalId>,
    /// Tree links touching this node: the parent plus every child.
    tree_degree: usize,
}

impl Node {
    fn new(vector: Vec<f32>, level: usize) -> Self {
        Self {
            vector,
            links: vec![Vec::new(); level + 1],
            parent: None,
            tree_degree: 0,
        }
    }

    fn level(&self) -> usize {
        self.links.len() - 1
    }

    fn neighbours(&self, layer: usize) -> &[InternalId] {
        self.links.get(layer).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Raw node state used to persist and restore an index.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeParts {
    pub vector: Vec<f32>,
    pub links: Vec<Vec<InternalId>>,
    pub parent: Option<InternalId>,
}

/// Summary of the graph shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub nodes: usize,
    pub dimension: usize,
    pub max_layer: usize,
    pub entry_point: Option<InternalId>,
    /// Number of nodes present on each layer, layer 0 first.
    pub layer_nodes: Vec<usize>,
    pub edges: usize,
}

/// Approximate nearest-neighbour index over vectors of one fixed dimension.
///
/// Distances are cosine distances (`1 - cos`). Vectors are normalised once
/// when inserted and queries once per call, so each comparison is a dot
/// product.
pub struct HnswIndex {
    dimension: usize,
    params: HnswParams,
    nodes: Vec<Node>,
    entry_point: Option<InternalId>,
    max_layer: usize,
    rng: StdRng,
}

impl HnswIndex {
    /// Create an empty index with a random level seed.
    pub fn new(dimension: usize, params: HnswParams) -> Self {
        Self::with_seed(dimension, params, rand::random())
    }

    /// Create an empty index whose level assignment is reproducible.
    pub fn with_seed(dimension: usize, params: HnswParams, seed: u64) -> Self {
        Self {
            dimension,
            params,
            nodes: Vec::new(),
            entry_point: None,
            max_layer: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Rebuild an index from persisted parts.
    ///
    /// Every structural invariant is checked; violations are reported as
    /// [`Error::CorruptSnapshot`].
    pub fn from_parts(
        dimension: usize,
        params: HnswParams,
        parts: Vec<NodeParts>,
        entry_point: Option<InternalId>,
        seed: u64,
    ) -> Result<Self> {
        let corrupt = |msg: String| Error::CorruptSnapshot(msg);

        params.validate().map_err(corrupt)?;
        if parts.len() >= InternalId::MAX as usize {
            return Err(corrupt(format!("{} nodes is too many", parts.len())));
        }

        let count = parts.len();
        let levels: Vec<usize> =
            parts.iter().map(|p| p.links.len().saturating_sub(1)).collect();

        for (id, part) in parts.iter().enumerate() {
            if part.vector.len() != dimension {
                return Err(corrupt(format!(
                    "node {id} has dimension {}, index has {dimension}",
                    part.vector.len()
                )));
            }
            if part.vector.iter().any(|x| !x.is_finite()) {
                return Err(corrupt(format!("node {id} has non-finite values")));
            }
            if part.links.is_empty() || part.links.len() > MAX_LEVEL + 1 {
                return Err(corrupt(format!(
                    "node {id} has {} layers",
                    part.links.len()
                )));
            }
            for (layer, links) in part.links.iter().enumerate() {
                if links.len() > params.max_degree(layer) {
                    return Err(corrupt(format!(
                        "node {id} has {} links on layer {layer}, cap is {}",
                        links.len(),
                        params.max_degree(layer)
                    )));
                }
                let mut seen = HashSet::with_capacity(links.len());
                for &target in links {
                    let t = target as usize;
                    if t >= count {
                        return Err(corrupt(format!(
                            "node {id} links to missing node {target}"
                        )));
                    }
                    if t == id {
                        return Err(corrupt(format!("node {id} links to itself")));
                    }
                    if levels[t] < layer {
                        return Err(corrupt(format!(
                            "node {id} links to node {target} on layer {layer}, \
                             which that node does not reach"
                        )));
                    }
                    if !seen.insert(target) {
                        return Err(corrupt(format!(
                            "node {id} links to node {target} twice on layer {layer}"
                        )));
                    }
                }
            }
        }

        let mut tree_degree = vec![0usize; count];
        for (id, part) in parts.iter().enumerate() {
            match (id, part.parent) {
                (0, None) => continue,
                (0, Some(p)) => {
                    return Err(corrupt(format!("node 0 has tree parent {p}")));
                }
                (_, None) => {
                    return Err(corrupt(format!("node {id} has no tree parent")));
                }
                (_, Some(p)) if p as usize >= id => {
                    return Err(corrupt(format!(
                        "node {id} has tree parent {p}, which is not older"
                    )));
                }
                (_, Some(p)) => {
                    let child = id as InternalId;
                    if !part.links[0].contains(&p)
                        || !parts[p as usize].links[0].contains(&child)
                    {
                        return Err(corrupt(format!(
                            "tree link between {id} and {p} is not mutual"
                        )));
                    }
                    tree_degree[id] += 1;
                    tree_degree[p as usize] += 1;
                }
            }
        }
        if let Some(id) = tree_degree
            .iter()
            .position(|&d| d > params.tree_degree_cap())
        {
            return Err(corrupt(format!(
                "node {id} has {} tree links, cap is {}",
                tree_degree[id],
                params.tree_degree_cap()
            )));
        }

        let max_layer = match entry_point {
            None if count == 0 => 0,
            None => {
                return Err(corrupt("non-empty index without entry point".into()));
            }
            Some(ep) if ep as usize >= count => {
                return Err(corrupt(format!("entry point {ep} does not exist")));
            }
            Some(ep) => {
                let top = levels.iter().copied().max().unwrap_or(0);
                if levels[ep as usize] != top {
                    return Err(corrupt(format!(
                        "entry point {ep} is on layer {}, top layer is {top}",
                        levels[ep as usize]
                    )));
                }
                top
            }
        };

        let nodes: Vec<Node> = parts
            .into_iter()
            .zip(tree_degree)
            .map(|(p, tree_degree)| Node {
                vector: p.vector,
                links: p.links,
                parent: p.parent,
                tree_degree,
            })
            .collect();

        Ok(Self {
            dimension,
            params,
            nodes,
            entry_point,
            max_layer,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Export the node state in InternalId order as
    /// `(vector, links, tree parent)`.
    pub fn parts(
        &self,
    ) -> impl Iterator<Item = (&[f32], &[Vec<InternalId>], Option<InternalId>)>
    {
        self.nodes
            .iter()
            .map(|n| (n.vector.as_slice(), n.links.as_slice(), n.parent))
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    /// Change the default query frontier.
    pub fn set_ef_search(&mut self, ef: usize) {
        self.params.ef_search = ef.max(1);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The id the next insertion will receive.
    pub fn next_id(&self) -> InternalId {
        self.nodes.len() as InternalId
    }

    pub fn entry_point(&self) -> Option<InternalId> {
        self.entry_point
    }

    pub fn max_layer(&self) -> usize {
        self.max_layer
    }

    /// The stored (unit-length) vector of a node.
    pub fn vector(&self, id: InternalId) -> Option<&[f32]> {
        self.nodes.get(id as usize).map(|n| n.vector.as_slice())
    }

    /// Layer-0 tree parent of a node.
    pub fn parent(&self, id: InternalId) -> Option<InternalId> {
        self.nodes.get(id as usize).and_then(|n| n.parent)
    }

    /// Highest layer a node lives on.
    pub fn level(&self, id: InternalId) -> Option<usize> {
        self.nodes.get(id as usize).map(Node::level)
    }

    /// Out-neighbours of a node on one layer.
    pub fn neighbours(&self, id: InternalId, layer: usize) -> &[InternalId] {
        self.nodes
            .get(id as usize)
            .map(|n| n.neighbours(layer))
            .unwrap_or(&[])
    }

    fn check_vector(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }
        if let Some(pos) = vector.iter().position(|x| !x.is_finite()) {
            return Err(Error::InvalidVector(format!(
                "component {pos} is not a finite number"
            )));
        }
        Ok(())
    }

    #[inline]
    fn distance_to(&self, query: &[f32], id: InternalId) -> f32 {
        cosine_distance(query, &self.nodes[id as usize].vector)
    }

    fn random_level(&mut self) -> usize {
        let r: f64 = self.rng.random();
        let level = (-(1.0 - r).ln() * self.params.level_multiplier()).floor();
        (level as usize).min(MAX_LEVEL)
    }

    /// Insert a vector and return its id.
    ///
    /// Fails with [`Error::DimensionMismatch`], [`Error::InvalidVector`] or
    /// [`Error::CapacityExhausted`] without touching the index.
    pub fn insert(&mut self, vector: &[f32]) -> Result<InternalId> {
        self.check_vector(vector)?;
        if self.nodes.len() >= (InternalId::MAX - 1) as usize {
            return Err(Error::CapacityExhausted {
                capacity: (InternalId::MAX - 1) as usize,
            });
        }

        let id = self.nodes.len() as InternalId;
        let mut query = vector.to_vec();
        normalize(&mut query);
        let level = self.random_level();

        let Some(entry) = self.entry_point else {
            self.nodes.push(Node::new(query, level));
            self.entry_point = Some(id);
            self.max_layer = level;
            return Ok(id);
        };

        let mut current = entry;
        for layer in (level + 1..=self.max_layer).rev() {
            current = self.greedy_closest(&query, current, layer);
        }

        let mut selected: Vec<Vec<InternalId>> = vec![Vec::new(); level + 1];
        let mut parent = None;
        let mut entry_points = vec![current];
        for layer in (0..=level.min(self.max_layer)).rev() {
            let candidates = self.search_layer(
                &query,
                &entry_points,
                self.params.ef_construction,
                layer,
            );
            let required = if layer == 0 {
                let p = self.choose_parent(&candidates, id);
                parent = Some(p);
                vec![p]
            } else {
                Vec::new()
            };
            selected[layer] = self.select_neighbours(
                &candidates,
                self.params.max_degree(layer),
                &required,
            );
            entry_points = candidates.into_iter().map(|(n, _)| n).collect();
        }

        // Layer 0 is always searched, so the parent is set by now.
        let parent = parent.unwrap_or(id - 1);
        let mut node = Node::new(query, level);
        node.links.clone_from(&selected);
        node.parent = Some(parent);
        node.tree_degree = 1;
        self.nodes[parent as usize].tree_degree += 1;
        self.nodes.push(node);

        for (layer, neighbours) in selected.into_iter().enumerate() {
            for neighbour in neighbours {
                self.link(neighbour, id, layer);
            }
        }

        if level > self.max_layer {
            self.max_layer = level;
            self.entry_point = Some(id);
        }

        Ok(id)
    }

    /// Tree parent for node `id`: the closest candidate with spare tree
    /// capacity, else the previous node, which is always a leaf.
    fn choose_parent(
        &self,
        candidates: &[(InternalId, f32)],
        id: InternalId,
    ) -> InternalId {
        let cap = self.params.tree_degree_cap();
        candidates
            .iter()
            .map(|&(n, _)| n)
            .find(|&n| self.nodes[n as usize].tree_degree < cap)
            .unwrap_or(id - 1)
    }

    fn is_tree_link(&self, a: InternalId, b: InternalId) -> bool {
        self.nodes[a as usize].parent == Some(b)
            || self.nodes[b as usize].parent == Some(a)
    }

    /// Pick at most `m` links out of `candidates`, which are sorted by
    /// distance to the node being linked. `required` links come first.
    ///
    /// A candidate is taken when it is closer to the node than to every link
    /// taken so far, so one tight cluster cannot fill the whole list. Slots
    /// left over are filled with the closest remaining candidates.
    fn select_neighbours(
        &self,
        candidates: &[(InternalId, f32)],
        m: usize,
        required: &[InternalId],
    ) -> Vec<InternalId> {
        let mut chosen: Vec<InternalId> = required.to_vec();
        for &(id, distance) in candidates {
            if chosen.len() >= m {
                break;
            }
            if chosen.contains(&id) {
                continue;
            }
            let vector = &self.nodes[id as usize].vector;
            let covered = chosen.iter().any(|&c| {
                cosine_distance(vector, &self.nodes[c as usize].vector) < distance
            });
            if !covered {
                chosen.push(id);
            }
        }
        for &(id, _) in candidates {
            if chosen.len() >= m {
                break;
            }
            if !chosen.contains(&id) {
                chosen.push(id);
            }
        }
        chosen
    }

    /// Add the edge `from -> to` on `layer`. A full list is re-selected
    /// from its links plus `to`, keeping every tree link.
    fn link(&mut self, from: InternalId, to: InternalId, layer: usize) {
        let cap = self.params.max_degree(layer);
        let links = &self.nodes[from as usize].links[layer];
        if links.contains(&to) {
            return;
        }
        if links.len() < cap {
            self.nodes[from as usize].links[layer].push(to);
            return;
        }

        let base = &self.nodes[from as usize].vector;
        let mut ranked: Vec<(InternalId, f32)> = links
            .iter()
            .copied()
            .chain(std::iter::once(to))
            .map(|n| (n, cosine_distance(base, &self.nodes[n as usize].vector)))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        let required: Vec<InternalId> = if layer == 0 {
            ranked
                .iter()
                .map(|&(n, _)| n)
                .filter(|&n| self.is_tree_link(from, n))
                .collect()
        } else {
            Vec::new()
        };
        let kept = self.select_neighbours(&ranked, cap, &required);
        self.nodes[from as usize].links[layer] = kept;
    }

    /// Walk to the closest node on `layer` reachable by strictly improving
    /// steps.
    fn greedy_closest(
        &self,
        query: &[f32],
        start: InternalId,
        layer: usize,
    ) -> InternalId {
        let mut current = start;
        let mut best = self.distance_to(query, current);
        loop {
            let mut improved = false;
            for &n in self.nodes[current as usize].neighbours(layer) {
                let d = self.distance_to(query, n);
                if d < best {
                    best = d;
                    current = n;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Beam search on one layer. Returns up to `ef` nodes sorted by
    /// ascending distance.
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[InternalId],
        ef: usize,
        layer: usize,
    ) -> Vec<(InternalId, f32)> {
        let ef = ef.max(1);
        let mut visited: HashSet<InternalId> = HashSet::with_capacity(ef * 4);
        let mut candidates: BinaryHeap<Nearest> = BinaryHeap::with_capacity(ef);
        let mut results: BinaryHeap<Farthest> =
            BinaryHeap::with_capacity(ef + 1);

        for &ep in entry_points {
            if visited.insert(ep) {
                let c = Candidate {
                    id: ep,
                    distance: self.distance_to(query, ep),
                };
                candidates.push(Nearest(c));
                results.push(Farthest(c));
                if results.len() > ef {
                    results.pop();
                }
            }
        }

        while let Some(Nearest(current)) = candidates.pop() {
            if let Some(Farthest(worst)) = results.peek()
                && results.len() >= ef
                && current.distance > worst.distance
            {
                break;
            }

            for &n in self.nodes[current.id as usize].neighbours(layer) {
                if !visited.insert(n) {
                    continue;
                }
                let distance = self.distance_to(query, n);
                let admit = results.len() < ef
                    || results
                        .peek()
                        .is_some_and(|Farthest(w)| distance < w.distance);
                if admit {
                    let c = Candidate { id: n, distance };
                    candidates.push(Nearest(c));
                    results.push(Farthest(c));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut found: Vec<(InternalId, f32)> = results
            .into_iter()
            .map(|Farthest(c)| (c.id, c.distance))
            .collect();
        found.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        found
    }

    /// The `k` approximate nearest neighbours of `query`, closest first.
    ///
    /// Returns at most `min(k, len)` results; an empty index yields an empty
    /// list.
    pub fn knn(&self, query: &[f32], k: usize) -> Result<Vec<(InternalId, f32)>> {
        self.knn_with_ef(query, k, self.params.ef_search)
    }

    /// Like [`knn`](Self::knn) with an explicit frontier size. The frontier
    /// is never smaller than `k`.
    pub fn knn_with_ef(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
    ) -> Result<Vec<(InternalId, f32)>> {
        self.check_vector(query)?;
        let Some(entry) = self.entry_point else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut query = query.to_vec();
        normalize(&mut query);

        let mut current = entry;
        for layer in (1..=self.max_layer).rev() {
            current = self.greedy_closest(&query, current, layer);
        }

        let mut found = self.search_layer(&query, &[current], ef.max(k), 0);
        found.truncate(k);
        Ok(found)
    }

    pub fn stats(&self) -> IndexStats {
        let mut layer_nodes = vec![0usize; self.max_layer + 1];
        let mut edges = 0;
        for node in &self.nodes {
            for (layer, links) in node.links.iter().enumerate() {
                if let Some(count) = layer_nodes.get_mut(layer) {
                    *count += 1;
                }
                edges += links.len();
            }
        }
        if self.nodes.is_empty() {
            layer_nodes.clear();
        }

        IndexStats {
            nodes: self.nodes.len(),
            dimension: self.dimension,
            max_layer: self.max_layer,
            entry_point: self.entry_point,
            layer_nodes,
            edges,
        }
    }

    /// Number of nodes that cannot be reached from the entry point on
    /// layer 0.
    pub fn unreachable_count(&self) -> usize {
        let Some(entry) = self.entry_point else {
            return 0;
        };
        let mut seen = vec![false; self.nodes.len()];
        let mut queue = VecDeque::from([entry]);
        seen[entry as usize] = true;
        let mut reached = 1;
        while let Some(id) = queue.pop_front() {
            for &n in self.nodes[id as usize].neighbours(0) {
                if !seen[n as usize] {
                    seen[n as usize] = true;
                    reached += 1;
                    queue.push_back(n);
                }
            }
        }
        self.nodes.len() - reached
    }
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("dimension", &self.dimension)
            .field("nodes", &self.nodes.len())
            .field("max_layer", &self.max_layer)
            .field("entry_point", &self.entry_point)
            .finish_non_exhaustive()
    }
}
