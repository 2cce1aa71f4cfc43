//! Dependency graph construction and ordering (spec.md §4.5).
//!
//! `UnitGraph` is immutable after construction: build from a discovered unit
//! list, then query cycles/levels/dependents without further mutation.

mod graph;

pub use graph::{DepVec, SortMode, UnitGraph};
