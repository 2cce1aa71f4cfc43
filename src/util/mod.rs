//! Small cross-cutting helpers shared by every layer: constants, interning.

pub mod constants;
pub mod interner;

pub use constants::*;
pub use interner::intern;
