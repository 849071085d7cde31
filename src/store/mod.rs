//! Entity stores owned by a graph.
//!
//! Each store owns one entity kind keyed by id and ranks its keys by last
//! access. Cross references between kinds are plain ids resolved through the
//! owning graph; no store holds a pointer into another.
//!
//! ## Stores
//!
//! - [`NodeStore`] - image nodes and their completeness
//! - [`CellStore`] - cell membership and per-image covering cells
//! - [`SequenceStore`] - ordered sequences

mod access;
pub mod cells;
pub mod nodes;
pub mod sequences;

pub use cells::CellStore;
pub use nodes::NodeStore;
pub use sequences::SequenceStore;

/// The three stores of a graph, mutated together under one lock.
#[derive(Default)]
pub struct Stores {
    /// Image nodes.
    pub nodes: NodeStore,
    /// Cells.
    pub cells: CellStore,
    /// Sequences.
    pub sequences: SequenceStore,
}
