//! The `Unit` data model — spec.md §3.
//!
//! A unit is a directory containing a config file plus the IaC source it
//! wraps. Units are the nodes of the dependency graph (`crate::dag`) and the
//! work items of the runner pool (`crate::runner`).

use std::collections::HashSet;

use camino::Utf8PathBuf;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// The engine action being planned/applied/destroyed. Hooks, retry/ignore
/// rules, and mock-output allow-lists are all scoped to a subset of actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Init,
    Plan,
    Apply,
    Destroy,
    Validate,
    Output,
    Import,
    StateList,
    StateRm,
    Other,
}

impl Action {
    pub fn is_destructive(&self) -> bool {
        matches!(self, Action::Destroy)
    }
}

/// One `include` block: a named reference to a shared config file merged
/// into the including unit's own config.
#[derive(Debug, Clone)]
pub struct IncludeRef {
    pub label: String,
    pub source: Utf8PathBuf,
    pub merge_strategy: MergeStrategy,
    /// Bare (unlabeled) includes are a deprecated form (Design Note §9);
    /// tracked so the loader can emit a one-time warning.
    pub is_bare: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    NoMerge,
    #[default]
    Shallow,
    Deep,
    DeepMapOnly,
}

impl MergeStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "no_merge" => Some(Self::NoMerge),
            "shallow" => Some(Self::Shallow),
            "deep" => Some(Self::Deep),
            "deep_map_only" => Some(Self::DeepMapOnly),
            _ => None,
        }
    }
}

/// A `dependency` block: another unit whose outputs this unit consumes.
#[derive(Debug, Clone)]
pub struct DependencyRef {
    pub name: String,
    /// Canonicalized path to the target unit.
    pub target_path: Utf8PathBuf,
    pub mock_outputs: Option<Value>,
    pub mock_outputs_allowed_commands: HashSet<Action>,
    /// When true, a dependency read failure is non-fatal and the unit
    /// proceeds with `Value::Unknown` for every output of this dependency.
    pub skip_outputs: bool,
}

/// Opaque remote-state backend configuration. Concrete cloud backends are a
/// Non-goal; `StateReader` (crate::resolve) is the only extension surface.
#[derive(Debug, Clone)]
pub struct RemoteStateConfig {
    pub backend: String,
    pub config: Value,
    pub generate: Option<GenerateBlock>,
}

/// A unit's `terraform` block: where its IaC source lives and which files
/// the working-dir staging copy includes/excludes (spec.md §4.7).
#[derive(Debug, Clone, Default)]
pub struct TerraformSource {
    pub source: Option<Utf8PathBuf>,
    pub include_in_copy: Vec<String>,
    pub exclude_from_copy: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GenerateBlock {
    pub name: String,
    pub path: Utf8PathBuf,
    pub if_exists: IfExistsPolicy,
    pub contents: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfExistsPolicy {
    Overwrite,
    OverwriteTerragruntGenerated,
    Skip,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Before,
    After,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct HookSet {
    pub before: Vec<Hook>,
    pub after: Vec<Hook>,
    pub error: Vec<Hook>,
}

#[derive(Debug, Clone)]
pub struct Hook {
    pub name: String,
    pub commands: Vec<Action>,
    pub execute: Vec<String>,
    pub run_on_error: bool,
    /// If true, a non-zero hook exit fails the unit run.
    pub if_failed_fail_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RetryConfig {
    pub rules: Vec<RetryRule>,
}

#[derive(Debug, Clone)]
pub struct RetryRule {
    pub name: String,
    pub pattern: String,
    pub max_attempts: u32,
    pub sleep_interval_sec: u64,
}

#[derive(Debug, Clone)]
pub struct IgnoreRule {
    pub pattern: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureFlagType {
    Bool,
    String,
    Number,
}

#[derive(Debug, Clone)]
pub struct FeatureFlag {
    pub flag_type: FeatureFlagType,
    pub default: Value,
    /// Set from `--feature name=value` or `STRATUM_FEATURE`; overrides default.
    pub current: Option<Value>,
}

impl FeatureFlag {
    pub fn effective(&self) -> &Value {
        self.current.as_ref().unwrap_or(&self.default)
    }
}

/// A deployable configuration directory: the node type of the dependency
/// graph and the work item of the runner pool.
#[derive(Debug, Clone)]
pub struct Unit {
    /// Canonicalized absolute path; the identity key used everywhere else
    /// (graph nodes, dependency references, the evaluation cache).
    pub path: Utf8PathBuf,
    pub config_path: Utf8PathBuf,
    pub includes: Vec<IncludeRef>,
    pub locals: FxHashMap<String, Value>,
    pub inputs: FxHashMap<String, Value>,
    pub dependencies: Vec<DependencyRef>,
    pub remote_state: Option<RemoteStateConfig>,
    pub terraform: Option<TerraformSource>,
    pub hooks: HookSet,
    pub retry: RetryConfig,
    pub ignore: Vec<IgnoreRule>,
    pub feature_flags: FxHashMap<String, FeatureFlag>,
    pub exclude_actions: HashSet<Action>,
    /// True when this unit lies outside the discovery working directory,
    /// pulled in only because something inside the working directory
    /// depends on it (spec.md §4.5 "external dependency marking").
    pub external: bool,
}

impl Unit {
    /// A stable display name: the unit's path relative to nothing in
    /// particular, used only as a fallback when no base-dir is known.
    pub fn display_name(&self) -> &str {
        self.path.as_str()
    }

    pub fn hooks_for(&self, phase: HookPhase, action: Action) -> Vec<&Hook> {
        let pool = match phase {
            HookPhase::Before => &self.hooks.before,
            HookPhase::After => &self.hooks.after,
            HookPhase::Error => &self.hooks.error,
        };
        pool.iter()
            .filter(|h| h.commands.is_empty() || h.commands.contains(&action))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(path: &str) -> Unit {
        Unit {
            path: Utf8PathBuf::from(path),
            config_path: Utf8PathBuf::from(format!("{path}/stratum.hcl")),
            includes: vec![],
            locals: FxHashMap::default(),
            inputs: FxHashMap::default(),
            dependencies: vec![],
            remote_state: None,
            terraform: None,
            hooks: HookSet::default(),
            retry: RetryConfig::default(),
            ignore: vec![],
            feature_flags: FxHashMap::default(),
            exclude_actions: HashSet::new(),
            external: false,
        }
    }

    #[test]
    fn merge_strategy_parses_known_values() {
        assert_eq!(MergeStrategy::parse("deep"), Some(MergeStrategy::Deep));
        assert_eq!(MergeStrategy::parse("bogus"), None);
    }

    #[test]
    fn feature_flag_override_wins_over_default() {
        let flag = FeatureFlag {
            flag_type: FeatureFlagType::Bool,
            default: Value::Bool(false),
            current: Some(Value::Bool(true)),
        };
        assert_eq!(flag.effective(), &Value::Bool(true));
    }

    #[test]
    fn hooks_for_filters_by_action() {
        let mut u = unit("/units/vpc");
        u.hooks.before.push(Hook {
            name: "tag".into(),
            commands: vec![Action::Apply],
            execute: vec!["true".into()],
            run_on_error: false,
            if_failed_fail_run: true,
        });
        assert_eq!(u.hooks_for(HookPhase::Before, Action::Apply).len(), 1);
        assert_eq!(u.hooks_for(HookPhase::Before, Action::Plan).len(), 0);
    }
}
