use serde::{Deserialize, Serialize};

/// Highest layer a node can be drawn on.
pub const MAX_LEVEL: usize = 16;

/// Construction and search parameters of an [`HnswIndex`](super::HnswIndex).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswParams {
    /// Maximum out-degree on layers above 0.
    pub m: usize,
    /// Maximum out-degree on layer 0 (usually `2 * m`).
    pub m0: usize,
    /// Candidate frontier size while inserting.
    pub ef_construction: usize,
    /// Default candidate frontier size while querying; raised to `k` when
    /// a query asks for more results.
    pub ef_search: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self::with_m(16)
    }
}

impl HnswParams {
    /// Defaults for a given `m`: `m0 = 2m`, `ef_construction = 200`,
    /// `ef_search = 64`.
    pub fn with_m(m: usize) -> Self {
        Self {
            m,
            m0: m * 2,
            ef_construction: 200,
            ef_search: 64,
        }
    }

    /// Degree cap for `layer`.
    #[inline]
    pub fn max_degree(&self, layer: usize) -> usize {
        if layer == 0 { self.m0 } else { self.m }
    }

    /// Most layer-0 tree links a node may carry (its parent plus children).
    /// Tree links are never pruned, so this stays below the layer-0 cap.
    #[inline]
    pub fn tree_degree_cap(&self) -> usize {
        (self.m0 / 2).max(2)
    }

    /// Normalisation constant of the level distribution, `1 / ln(m)`.
    pub fn level_multiplier(&self) -> f64 {
        1.0 / (self.m.max(2) as f64).ln()
    }

    /// Check the parameters describe a usable graph.
    pub fn validate(&self) -> Result<(), String> {
        if self.m < 2 {
            return Err(format!("m must be at least 2, got {}", self.m));
        }
        if self.m0 < self.m {
            return Err(format!(
                "m0 ({}) must be at least m ({})",
                self.m0, self.m
            ));
        }
        if self.ef_construction < self.m {
            return Err(format!(
                "ef_construction ({}) must be at least m ({})",
                self.ef_construction, self.m
            ));
        }
        if self.ef_search == 0 {
            return Err("ef_search must be positive".to_string());
        }
        Ok(())
    }
}
