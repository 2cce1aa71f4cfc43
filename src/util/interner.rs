//! Process-wide string interner for unit path keys.
//!
//! Unit identity is its canonicalized filesystem path; the same path string
//! recurs constantly (as an include target, a dependency reference, a graph
//! node) so interning it once avoids re-allocating on every reference, the
//! same tradeoff the DAG module made for task IDs.

use std::sync::{Arc, LazyLock};

use dashmap::DashMap;

static POOL: LazyLock<DashMap<Box<str>, Arc<str>>> = LazyLock::new(DashMap::new);

/// Intern a string, returning a shared `Arc<str>` deduplicated against every
/// other call with the same contents.
pub fn intern(s: &str) -> Arc<str> {
    if let Some(existing) = POOL.get(s) {
        return Arc::clone(&existing);
    }
    let arc: Arc<str> = Arc::from(s);
    POOL.insert(s.into(), Arc::clone(&arc));
    arc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_same_string_yields_same_pointer() {
        let a = intern("/units/vpc");
        let b = intern("/units/vpc");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn different_strings_intern_separately() {
        let a = intern("/units/vpc");
        let b = intern("/units/eks");
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
