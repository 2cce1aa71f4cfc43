//! UnitGraph - dependency DAG over units (spec.md §4.5)
//!
//! Generalizes the teacher's `FlowGraph` (Arc<str> + FxHashMap + SmallVec,
//! three-color DFS cycle detection) from task IDs to canonical unit paths,
//! and adds topological levels, alpha/dag sort modes, and external-dependency
//! marking that the original task-flow graph had no concept of.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::error::StratumError;
use crate::unit::Unit;
use crate::util::intern;

/// Stack-allocated deps: most units have 0-4 dependencies.
pub type DepVec = SmallVec<[Arc<str>; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMode {
    /// Lexical order within each topological level (deterministic, readable).
    Alpha,
    /// Whatever order the DAG naturally produced (insertion order within a level).
    Dag,
}

pub struct UnitGraph {
    /// unit path -> units that depend on it (successors in the "must run after" sense)
    dependents: FxHashMap<Arc<str>, DepVec>,
    /// unit path -> units it depends on (predecessors)
    dependencies: FxHashMap<Arc<str>, DepVec>,
    unit_paths: Vec<Arc<str>>,
    unit_set: FxHashSet<Arc<str>>,
    external: FxHashSet<Arc<str>>,
}

impl UnitGraph {
    /// Build a graph from a flat unit list. Each unit's `dependencies` field
    /// supplies the edges; units referenced as a dependency but absent from
    /// `units` are treated as external and still get a graph node.
    pub fn build(units: &[Unit]) -> Self {
        let capacity = units.len();
        let mut dependents: FxHashMap<Arc<str>, DepVec> =
            FxHashMap::with_capacity_and_hasher(capacity, Default::default());
        let mut dependencies: FxHashMap<Arc<str>, DepVec> =
            FxHashMap::with_capacity_and_hasher(capacity, Default::default());
        let mut unit_paths: Vec<Arc<str>> = Vec::with_capacity(capacity);
        let mut unit_set: FxHashSet<Arc<str>> =
            FxHashSet::with_capacity_and_hasher(capacity, Default::default());
        let mut external: FxHashSet<Arc<str>> = FxHashSet::default();

        for unit in units {
            let id = intern(unit.path.as_str());
            unit_paths.push(Arc::clone(&id));
            unit_set.insert(Arc::clone(&id));
            dependents.entry(Arc::clone(&id)).or_default();
            dependencies.entry(id).or_default();
        }

        for unit in units {
            let src = intern(unit.path.as_str());
            for dep in &unit.dependencies {
                let tgt_str = dep.target_path.as_str();
                let tgt = unit_set.get(tgt_str).cloned().unwrap_or_else(|| {
                    let arc = intern(tgt_str);
                    if !unit_set.contains(&arc) {
                        unit_paths.push(Arc::clone(&arc));
                        unit_set.insert(Arc::clone(&arc));
                        dependents.entry(Arc::clone(&arc)).or_default();
                        dependencies.entry(Arc::clone(&arc)).or_default();
                        external.insert(Arc::clone(&arc));
                    }
                    arc
                });

                dependents.entry(Arc::clone(&tgt)).or_default().push(Arc::clone(&src));
                dependencies.entry(src.clone()).or_default().push(tgt);
            }
        }

        Self {
            dependents,
            dependencies,
            unit_paths,
            unit_set,
            external,
        }
    }

    #[inline]
    pub fn get_dependencies(&self, unit_path: &str) -> &[Arc<str>] {
        static EMPTY: &[Arc<str>] = &[];
        self.dependencies.get(unit_path).map_or(EMPTY, SmallVec::as_slice)
    }

    #[inline]
    pub fn get_dependents(&self, unit_path: &str) -> &[Arc<str>] {
        static EMPTY: &[Arc<str>] = &[];
        self.dependents.get(unit_path).map_or(EMPTY, SmallVec::as_slice)
    }

    pub fn is_external(&self, unit_path: &str) -> bool {
        self.external.contains(unit_path)
    }

    pub fn contains(&self, unit_path: &str) -> bool {
        self.unit_set.contains(unit_path)
    }

    pub fn unit_count(&self) -> usize {
        self.unit_paths.len()
    }

    /// BFS path check (used for mock-output/`use`-style wiring validation).
    pub fn has_path(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }
        let mut visited: FxHashSet<&str> = FxHashSet::default();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(from);
        visited.insert(from);

        while let Some(current) = queue.pop_front() {
            if let Some(deps) = self.dependencies.get(current) {
                for dep in deps {
                    if dep.as_ref() == to {
                        return true;
                    }
                    if visited.insert(dep.as_ref()) {
                        queue.push_back(dep.as_ref());
                    }
                }
            }
        }
        false
    }

    /// Detect cycles using the standard three-color DFS algorithm.
    pub fn detect_cycles(&self) -> Result<(), StratumError> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut colors: FxHashMap<Arc<str>, Color> = self
            .unit_paths
            .iter()
            .map(|id| (Arc::clone(id), Color::White))
            .collect();
        let mut stack: Vec<Arc<str>> = Vec::new();

        fn dfs(
            node: Arc<str>,
            dependencies: &FxHashMap<Arc<str>, DepVec>,
            colors: &mut FxHashMap<Arc<str>, Color>,
            stack: &mut Vec<Arc<str>>,
        ) -> Result<(), String> {
            colors.insert(Arc::clone(&node), Color::Gray);
            stack.push(Arc::clone(&node));

            if let Some(deps) = dependencies.get(&node) {
                for dep in deps {
                    match colors.get(dep) {
                        Some(Color::Gray) => {
                            let cycle_start = stack
                                .iter()
                                .position(|x| x.as_ref() == dep.as_ref())
                                .unwrap_or(0);
                            let cycle: Vec<&str> =
                                stack[cycle_start..].iter().map(|s| s.as_ref()).collect();
                            return Err(format!("{} -> {}", cycle.join(" -> "), dep));
                        }
                        Some(Color::White) | None => {
                            dfs(Arc::clone(dep), dependencies, colors, stack)?;
                        }
                        Some(Color::Black) => {}
                    }
                }
            }

            stack.pop();
            colors.insert(node, Color::Black);
            Ok(())
        }

        for unit_path in &self.unit_paths {
            if colors.get(unit_path) == Some(&Color::White) {
                if let Err(cycle) = dfs(Arc::clone(unit_path), &self.dependencies, &mut colors, &mut stack) {
                    return Err(StratumError::CycleDetected { cycle });
                }
            }
        }

        Ok(())
    }

    /// Topological levels: level 0 has no dependencies, level N depends only
    /// on units in levels < N. Units within a level may run concurrently.
    pub fn levels(&self, sort: SortMode) -> Vec<Vec<Arc<str>>> {
        let mut remaining_deps: FxHashMap<Arc<str>, usize> = self
            .unit_paths
            .iter()
            .map(|id| (Arc::clone(id), self.dependencies.get(id).map_or(0, |d| d.len())))
            .collect();

        let mut levels = Vec::new();
        let mut placed: FxHashSet<Arc<str>> = FxHashSet::default();

        while placed.len() < self.unit_paths.len() {
            let mut ready: Vec<Arc<str>> = remaining_deps
                .iter()
                .filter(|(id, &count)| count == 0 && !placed.contains(*id))
                .map(|(id, _)| Arc::clone(id))
                .collect();

            if ready.is_empty() {
                // Cycle present; bail with whatever is left as a final level
                // rather than looping forever (detect_cycles is the real guard).
                let rest: Vec<Arc<str>> = self
                    .unit_paths
                    .iter()
                    .filter(|id| !placed.contains(*id))
                    .cloned()
                    .collect();
                if !rest.is_empty() {
                    levels.push(rest);
                }
                break;
            }

            if sort == SortMode::Alpha {
                ready.sort_by(|a, b| a.as_ref().cmp(b.as_ref()));
            }

            for id in &ready {
                placed.insert(Arc::clone(id));
                for dependent in self.get_dependents(id) {
                    if let Some(count) = remaining_deps.get_mut(dependent) {
                        *count = count.saturating_sub(1);
                    }
                }
            }

            levels.push(ready);
        }

        levels
    }

    /// Flat reverse order (destroy direction): dependents before their
    /// dependencies, i.e. the levels above reversed and each level reversed too.
    pub fn reverse_levels(&self, sort: SortMode) -> Vec<Vec<Arc<str>>> {
        self.levels(sort).into_iter().rev().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use std::collections::HashSet;
    use crate::unit::{Action, DependencyRef, FeatureFlag, HookSet, RetryConfig};
    use rustc_hash::FxHashMap as Map;

    fn unit_with_deps(path: &str, deps: &[&str]) -> Unit {
        Unit {
            path: Utf8PathBuf::from(path),
            config_path: Utf8PathBuf::from(format!("{path}/stratum.hcl")),
            includes: vec![],
            locals: Map::default(),
            inputs: Map::default(),
            dependencies: deps
                .iter()
                .map(|d| DependencyRef {
                    name: d.to_string(),
                    target_path: Utf8PathBuf::from(*d),
                    mock_outputs: None,
                    mock_outputs_allowed_commands: HashSet::new(),
                    skip_outputs: false,
                })
                .collect(),
            remote_state: None,
            terraform: None,
            hooks: HookSet::default(),
            retry: RetryConfig::default(),
            ignore: vec![],
            feature_flags: Map::<String, FeatureFlag>::default(),
            exclude_actions: HashSet::new(),
            external: false,
        }
    }

    #[test]
    fn detects_simple_cycle() {
        let units = vec![
            unit_with_deps("/a", &["/b"]),
            unit_with_deps("/b", &["/c"]),
            unit_with_deps("/c", &["/a"]),
        ];
        let graph = UnitGraph::build(&units);
        let err = graph.detect_cycles().unwrap_err();
        assert!(err.to_string().contains("STRATUM-200"));
    }

    #[test]
    fn no_cycle_linear() {
        let units = vec![
            unit_with_deps("/a", &[]),
            unit_with_deps("/b", &["/a"]),
            unit_with_deps("/c", &["/b"]),
        ];
        let graph = UnitGraph::build(&units);
        assert!(graph.detect_cycles().is_ok());
    }

    #[test]
    fn diamond_levels_in_order() {
        // a has no deps; b,c depend on a; d depends on b,c
        let units = vec![
            unit_with_deps("/a", &[]),
            unit_with_deps("/b", &["/a"]),
            unit_with_deps("/c", &["/a"]),
            unit_with_deps("/d", &["/b", "/c"]),
        ];
        let graph = UnitGraph::build(&units);
        assert!(graph.detect_cycles().is_ok());
        let levels = graph.levels(SortMode::Alpha);
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], vec![Arc::<str>::from("/a")]);
        assert!(graph.has_path("/d", "/a"));
    }

    #[test]
    fn dependency_outside_unit_list_is_marked_external() {
        let units = vec![unit_with_deps("/a", &["/outside/shared"])];
        let graph = UnitGraph::build(&units);
        assert!(graph.is_external("/outside/shared"));
        assert!(!graph.is_external("/a"));
    }

    #[test]
    fn reverse_levels_inverts_order() {
        let units = vec![unit_with_deps("/a", &[]), unit_with_deps("/b", &["/a"])];
        let graph = UnitGraph::build(&units);
        let forward = graph.levels(SortMode::Alpha);
        let reverse = graph.reverse_levels(SortMode::Alpha);
        assert_eq!(forward.len(), reverse.len());
        assert_eq!(forward[0], reverse[reverse.len() - 1]);
    }
}
