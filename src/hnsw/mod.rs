//! Layered small-world graph for approximate nearest-neighbour search.
//!
//! Every node lives on layer 0; a node drawn at level `L` also lives on all
//! layers `1..=L`. Upper layers are sparse and used for long jumps, layer 0
//! is dense and produces the final candidates.
//!
//! ```text
//! layer 2:  o-----------------------o
//! layer 1:  o-------o---------o-----o
//! layer 0:  o-o-o-o-o-o-o-o-o-o-o-o-o
//! ```

mod distance;
mod index;
mod params;

pub use distance::{cosine_distance, normalize};
pub use index::{HnswIndex, IndexStats, InternalId, NodeParts};
pub use params::{HnswParams, MAX_LEVEL};
