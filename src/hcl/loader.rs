//! Config file loader: parse + include resolution + merge (spec.md §4.2).
//!
//! Canonical-path cache mirrors the teacher's cache-by-key pattern (one
//! `OnceCell` per path, shared through a process-wide `DashMap`) so a unit
//! referenced by both an `include` and a sibling's `dependency` block is
//! only parsed and evaluated once per invocation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use camino::{Utf8Path, Utf8PathBuf};
use dashmap::DashMap;
use rustc_hash::FxHashMap;
use tokio::sync::OnceCell;
use tracing::instrument;

use crate::error::{Result, StratumError};
use crate::hcl::eval::{eval_async, EvalContext};
use crate::unit::{
    Action, DependencyRef, FeatureFlag, FeatureFlagType, Hook, HookSet, IgnoreRule, IncludeRef,
    MergeStrategy, RetryConfig, RetryRule, TerraformSource, Unit,
};
use crate::value::Value;

/// Block names whose diagnostics always surface, even when the caller asked
/// for best-effort parsing (spec.md §4.2 "halt-on-error is configurable per
/// block-name").
static HALT_ON_ERROR_BLOCKS: &[&str] = &["terraform", "remote_state", "dependency"];

static BARE_INCLUDE_WARNED: AtomicBool = AtomicBool::new(false);

type UnitCell = Arc<OnceCell<Unit>>;
static UNIT_CACHE: LazyLock<DashMap<Utf8PathBuf, UnitCell>> = LazyLock::new(DashMap::new);

/// Load (and cache) a unit's fully merged config, recursively resolving
/// `include` blocks. `best_effort` controls whether non-whitelisted block
/// diagnostics are fatal (used by `render --json` per spec.md §4.2).
pub async fn load_unit(path: &Utf8Path, best_effort: bool) -> Result<Unit> {
    let canonical = canonicalize(path)?;
    let cell = UNIT_CACHE
        .entry(canonical.clone())
        .or_insert_with(|| Arc::new(OnceCell::new()))
        .clone();

    cell.get_or_try_init(|| load_unit_uncached(&canonical, best_effort))
        .await
        .cloned()
}

fn canonicalize(path: &Utf8Path) -> Result<Utf8PathBuf> {
    let std_path = std::fs::canonicalize(path)?;
    Utf8PathBuf::try_from(std_path).map_err(|e| StratumError::ConfigError {
        reason: format!("non-UTF-8 path: {e}"),
    })
}

#[instrument(name = "parse_config_file", skip_all, fields(config_path = %config_path, best_effort))]
async fn load_unit_uncached(config_path: &Utf8Path, best_effort: bool) -> Result<Unit> {
    let raw = RawConfig::parse_file(config_path)?;

    let mut includes = Vec::new();
    for inc in &raw.includes {
        let source = resolve_include_path(config_path, &inc.source)?;
        let parent = Box::pin(load_unit_uncached(&source, best_effort)).await?;
        includes.push((inc.clone(), parent));
    }

    let mut locals = FxHashMap::default();
    for (name, expr) in &raw.locals {
        let mut ctx = EvalContext::new(&locals, &FxHashMap::default());
        let value = eval_async(expr, &mut ctx).await.or_else(|e| {
            if best_effort {
                Ok(Value::Unknown)
            } else {
                Err(e)
            }
        })?;
        locals.insert(name.clone(), value);
    }

    let mut inputs = FxHashMap::default();
    for (name, expr) in &raw.inputs {
        let mut ctx = EvalContext::new(&locals, &inputs);
        let value = eval_async(expr, &mut ctx).await.or_else(|e| {
            if best_effort && !HALT_ON_ERROR_BLOCKS.contains(&"inputs") {
                Ok(Value::Unknown)
            } else {
                Err(e)
            }
        })?;
        inputs.insert(name.clone(), value);
    }

    let mut unit = Unit {
        path: config_path.parent().map(Utf8Path::to_path_buf).unwrap_or_else(|| config_path.to_path_buf()),
        config_path: config_path.to_path_buf(),
        includes: raw.includes.clone(),
        locals,
        inputs,
        dependencies: raw.dependencies.clone(),
        remote_state: raw.remote_state.clone(),
        terraform: raw.terraform.clone(),
        hooks: raw.hooks.clone(),
        retry: raw.retry.clone(),
        ignore: raw.ignore.clone(),
        feature_flags: raw.feature_flags.clone(),
        exclude_actions: raw.exclude_actions.clone(),
        external: false,
    };

    for (include_ref, parent) in includes.into_iter().rev() {
        unit = merge_unit(parent, unit, include_ref.merge_strategy);
    }

    Ok(unit)
}

fn resolve_include_path(from: &Utf8Path, include_source: &Utf8Path) -> Result<Utf8PathBuf> {
    let base = from.parent().unwrap_or_else(|| Utf8Path::new("."));
    let candidate = base.join(include_source);
    if !candidate.exists() {
        return Err(StratumError::IncludeNotFound {
            path: include_source.to_string(),
            from: from.to_string(),
        });
    }
    Ok(candidate)
}

/// Merge a parent unit and a child unit per `strategy`. The child always
/// wins on conflict; `deep`/`deep_map_only` recurse into locals/inputs maps.
fn merge_unit(parent: Unit, child: Unit, strategy: MergeStrategy) -> Unit {
    match strategy {
        MergeStrategy::NoMerge => child,
        MergeStrategy::Shallow => Unit {
            locals: shallow_merge_map(parent.locals, child.locals),
            inputs: shallow_merge_map(parent.inputs, child.inputs),
            includes: child.includes,
            dependencies: concat_unique(parent.dependencies, child.dependencies, |d| d.name.clone()),
            // Copy-filter regression contract: `remote_state`'s generate
            // block carries `include_in_copy`/`exclude_from_copy`-bearing
            // config; the child's value always wins even when unset on the
            // parent, so a plain `Option::or` (never a merge of the two)
            // is correct here.
            remote_state: child.remote_state.or(parent.remote_state),
            terraform: merge_terraform(parent.terraform, child.terraform),
            hooks: merge_hooks(parent.hooks, child.hooks),
            retry: merge_retry(parent.retry, child.retry),
            ignore: concat_unique(parent.ignore, child.ignore, |r| r.pattern.clone()),
            feature_flags: shallow_merge_map(parent.feature_flags, child.feature_flags),
            exclude_actions: child.exclude_actions,
            ..child
        },
        MergeStrategy::Deep | MergeStrategy::DeepMapOnly => Unit {
            locals: deep_merge_map(parent.locals, child.locals, strategy),
            inputs: deep_merge_map(parent.inputs, child.inputs, strategy),
            includes: child.includes,
            dependencies: concat_unique(parent.dependencies, child.dependencies, |d| d.name.clone()),
            remote_state: child.remote_state.or(parent.remote_state),
            terraform: merge_terraform(parent.terraform, child.terraform),
            hooks: merge_hooks(parent.hooks, child.hooks),
            retry: merge_retry(parent.retry, child.retry),
            ignore: concat_unique(parent.ignore, child.ignore, |r| r.pattern.clone()),
            feature_flags: shallow_merge_map(parent.feature_flags, child.feature_flags),
            exclude_actions: child.exclude_actions,
            ..child
        },
    }
}

fn shallow_merge_map<V>(mut parent: FxHashMap<String, V>, child: FxHashMap<String, V>) -> FxHashMap<String, V> {
    for (k, v) in child {
        parent.insert(k, v);
    }
    parent
}

fn deep_merge_map(
    parent: FxHashMap<String, Value>,
    child: FxHashMap<String, Value>,
    strategy: MergeStrategy,
) -> FxHashMap<String, Value> {
    let mut out = parent;
    for (k, child_val) in child {
        match out.remove(&k) {
            Some(parent_val) => out.insert(k, deep_merge_value(parent_val, child_val, strategy)),
            None => out.insert(k, child_val),
        };
    }
    out
}

fn deep_merge_value(parent: Value, child: Value, strategy: MergeStrategy) -> Value {
    match (parent, child) {
        (Value::Object(p), Value::Object(c)) => Value::Object(deep_merge_map(p, c, strategy)),
        (Value::Tuple(mut p), Value::Tuple(c)) if strategy == MergeStrategy::Deep => {
            p.extend(c);
            Value::Tuple(p)
        }
        (_, child) => child,
    }
}

fn concat_unique<T, K: Eq + std::hash::Hash>(parent: Vec<T>, child: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    let child_keys: HashSet<K> = child.iter().map(&key).collect();
    let mut out: Vec<T> = parent.into_iter().filter(|p| !child_keys.contains(&key(p))).collect();
    out.extend(child);
    out
}

fn merge_hooks(parent: HookSet, child: HookSet) -> HookSet {
    HookSet {
        before: concat_unique(parent.before, child.before, |h| h.name.clone()),
        after: concat_unique(parent.after, child.after, |h| h.name.clone()),
        error: concat_unique(parent.error, child.error, |h| h.name.clone()),
    }
}

fn merge_retry(parent: RetryConfig, child: RetryConfig) -> RetryConfig {
    RetryConfig {
        rules: concat_unique(parent.rules, child.rules, |r| r.name.clone()),
    }
}

/// Attribute-wise merge of a `terraform` block (spec.md §4.7 copy-filter
/// regression contract): the child's `source` wins only when it actually
/// sets one, and each copy-filter list is replaced wholesale by the child's
/// when non-empty, never unioned with the parent's.
fn merge_terraform(parent: Option<TerraformSource>, child: Option<TerraformSource>) -> Option<TerraformSource> {
    match (parent, child) {
        (None, None) => None,
        (Some(p), None) => Some(p),
        (None, Some(c)) => Some(c),
        (Some(p), Some(c)) => Some(TerraformSource {
            source: c.source.or(p.source),
            include_in_copy: if c.include_in_copy.is_empty() { p.include_in_copy } else { c.include_in_copy },
            exclude_from_copy: if c.exclude_from_copy.is_empty() { p.exclude_from_copy } else { c.exclude_from_copy },
        }),
    }
}

/// Intermediate representation produced straight from the `hcl-rs` parse
/// tree, before any locals/inputs evaluation happens.
struct RawConfig {
    includes: Vec<IncludeRef>,
    locals: Vec<(String, hcl::Expression)>,
    inputs: Vec<(String, hcl::Expression)>,
    dependencies: Vec<DependencyRef>,
    remote_state: Option<crate::unit::RemoteStateConfig>,
    terraform: Option<TerraformSource>,
    hooks: HookSet,
    retry: RetryConfig,
    ignore: Vec<IgnoreRule>,
    feature_flags: FxHashMap<String, FeatureFlag>,
    exclude_actions: HashSet<Action>,
}

impl RawConfig {
    fn parse_file(path: &Utf8Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let body: hcl::Body = hcl::parse(&content).map_err(|e| StratumError::HclParseError {
            path: path.to_string(),
            details: e.to_string(),
        })?;

        let mut includes = Vec::new();
        let mut locals = Vec::new();
        let mut inputs = Vec::new();
        let mut dependencies = Vec::new();
        let mut remote_state = None;
        let mut terraform = None;
        let mut hooks = HookSet::default();
        let mut retry = RetryConfig::default();
        let mut ignore = Vec::new();
        let mut feature_flags = FxHashMap::default();
        let mut exclude_actions = HashSet::new();

        for block in body.blocks() {
            match block.identifier.as_str() {
                "include" => includes.push(parse_include(block, path)?),
                "locals" => {
                    for attr in block.body.attributes() {
                        locals.push((attr.key.to_string(), attr.expr.clone()));
                    }
                }
                "inputs" => {
                    for attr in block.body.attributes() {
                        inputs.push((attr.key.to_string(), attr.expr.clone()));
                    }
                }
                "dependency" => dependencies.push(parse_dependency(block)?),
                "remote_state" => remote_state = Some(parse_remote_state(block)?),
                "terraform" => terraform = Some(parse_terraform_block(block)),
                "before_hook" => hooks.before.push(parse_hook(block)?),
                "after_hook" => hooks.after.push(parse_hook(block)?),
                "error_hook" => hooks.error.push(parse_hook(block)?),
                "retry" => retry.rules.push(parse_retry_rule(block)?),
                "ignore" => ignore.push(parse_ignore_rule(block)?),
                "feature_flag" => {
                    let (name, flag) = parse_feature_flag(block)?;
                    feature_flags.insert(name, flag);
                }
                "exclude" => {
                    for action in string_list_attr(&block.body, "actions").unwrap_or_default() {
                        if let Some(a) = parse_action(&action) {
                            exclude_actions.insert(a);
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(Self {
            includes,
            locals,
            inputs,
            dependencies,
            remote_state,
            terraform,
            hooks,
            retry,
            ignore,
            feature_flags,
            exclude_actions,
        })
    }
}

fn parse_terraform_block(block: &hcl::Block) -> TerraformSource {
    TerraformSource {
        source: string_attr(&block.body, "source").map(Utf8PathBuf::from),
        include_in_copy: string_list_attr(&block.body, "include_in_copy").unwrap_or_default(),
        exclude_from_copy: string_list_attr(&block.body, "exclude_from_copy").unwrap_or_default(),
    }
}

fn parse_include(block: &hcl::Block, from: &Utf8Path) -> Result<IncludeRef> {
    let is_bare = block.labels.is_empty();
    if is_bare && !BARE_INCLUDE_WARNED.swap(true, Ordering::Relaxed) {
        tracing::warn!("bare `include {{ }}` blocks are deprecated; add a label");
    }
    let label = block
        .labels
        .first()
        .map(|l| l.as_str().to_string())
        .unwrap_or_default();
    let source = string_attr(&block.body, "path").ok_or_else(|| StratumError::HclParseError {
        path: from.to_string(),
        details: "include block missing `path` attribute".into(),
    })?;
    let merge_strategy = string_attr(&block.body, "merge_strategy")
        .and_then(|s| MergeStrategy::parse(&s))
        .unwrap_or_default();

    Ok(IncludeRef {
        label,
        source: Utf8PathBuf::from(source),
        merge_strategy,
        is_bare,
    })
}

fn parse_dependency(block: &hcl::Block) -> Result<DependencyRef> {
    let name = block.labels.first().map(|l| l.as_str().to_string()).unwrap_or_default();
    let target_path = string_attr(&block.body, "config_path").unwrap_or_default();
    let skip_outputs = bool_attr(&block.body, "skip_outputs").unwrap_or(false);
    let mock_outputs_allowed_commands: HashSet<Action> =
        string_list_attr(&block.body, "mock_outputs_allowed_terraform_commands")
            .unwrap_or_default()
            .iter()
            .filter_map(|s| parse_action(s))
            .collect();

    Ok(DependencyRef {
        name,
        target_path: Utf8PathBuf::from(target_path),
        mock_outputs: None,
        mock_outputs_allowed_commands,
        skip_outputs,
    })
}

fn parse_remote_state(block: &hcl::Block) -> Result<crate::unit::RemoteStateConfig> {
    let backend = string_attr(&block.body, "backend").unwrap_or_default();
    Ok(crate::unit::RemoteStateConfig {
        backend,
        config: Value::Object(FxHashMap::default()),
        generate: None,
    })
}

fn parse_hook(block: &hcl::Block) -> Result<Hook> {
    let name = block.labels.first().map(|l| l.as_str().to_string()).unwrap_or_default();
    let commands = string_list_attr(&block.body, "commands")
        .unwrap_or_default()
        .iter()
        .filter_map(|s| parse_action(s))
        .collect();
    let execute = string_list_attr(&block.body, "execute").unwrap_or_default();
    let run_on_error = bool_attr(&block.body, "run_on_error").unwrap_or(false);
    let if_failed_fail_run = bool_attr(&block.body, "if_failed_fail_run").unwrap_or(true);

    Ok(Hook {
        name,
        commands,
        execute,
        run_on_error,
        if_failed_fail_run,
    })
}

fn parse_retry_rule(block: &hcl::Block) -> Result<RetryRule> {
    let name = block.labels.first().map(|l| l.as_str().to_string()).unwrap_or_default();
    Ok(RetryRule {
        name,
        pattern: string_attr(&block.body, "retryable_errors").unwrap_or_default(),
        max_attempts: number_attr(&block.body, "max_attempts").unwrap_or(3.0) as u32,
        sleep_interval_sec: number_attr(&block.body, "sleep_interval_sec").unwrap_or(5.0) as u64,
    })
}

fn parse_ignore_rule(block: &hcl::Block) -> Result<IgnoreRule> {
    Ok(IgnoreRule {
        pattern: string_attr(&block.body, "pattern").unwrap_or_default(),
        message: string_attr(&block.body, "message"),
    })
}

fn parse_feature_flag(block: &hcl::Block) -> Result<(String, FeatureFlag)> {
    let name = block.labels.first().map(|l| l.as_str().to_string()).unwrap_or_default();
    let flag_type = match string_attr(&block.body, "type").as_deref() {
        Some("bool") => FeatureFlagType::Bool,
        Some("number") => FeatureFlagType::Number,
        _ => FeatureFlagType::String,
    };
    let default = string_attr(&block.body, "default")
        .map(Value::String)
        .unwrap_or(Value::Null);
    Ok((name, FeatureFlag { flag_type, default, current: None }))
}

fn parse_action(s: &str) -> Option<Action> {
    match s {
        "init" => Some(Action::Init),
        "plan" => Some(Action::Plan),
        "apply" => Some(Action::Apply),
        "destroy" => Some(Action::Destroy),
        "validate" => Some(Action::Validate),
        "output" => Some(Action::Output),
        "import" => Some(Action::Import),
        "state_list" => Some(Action::StateList),
        "state_rm" => Some(Action::StateRm),
        _ => None,
    }
}

fn string_attr(body: &hcl::Body, key: &str) -> Option<String> {
    body.attributes()
        .find(|a| a.key.as_str() == key)
        .and_then(|a| match &a.expr {
            hcl::Expression::String(s) => Some(s.clone()),
            _ => None,
        })
}

fn bool_attr(body: &hcl::Body, key: &str) -> Option<bool> {
    body.attributes()
        .find(|a| a.key.as_str() == key)
        .and_then(|a| match &a.expr {
            hcl::Expression::Bool(b) => Some(*b),
            _ => None,
        })
}

fn number_attr(body: &hcl::Body, key: &str) -> Option<f64> {
    body.attributes()
        .find(|a| a.key.as_str() == key)
        .and_then(|a| match &a.expr {
            hcl::Expression::Number(n) => Some(n.as_f64()),
            _ => None,
        })
}

fn string_list_attr(body: &hcl::Body, key: &str) -> Option<Vec<String>> {
    body.attributes().find(|a| a.key.as_str() == key).and_then(|a| match &a.expr {
        hcl::Expression::Array(items) => Some(
            items
                .iter()
                .filter_map(|e| match e {
                    hcl::Expression::String(s) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
        ),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shallow_merge_child_wins_on_conflict() {
        let mut parent = FxHashMap::default();
        parent.insert("a".to_string(), Value::Number(1.0));
        parent.insert("b".to_string(), Value::Number(2.0));
        let mut child = FxHashMap::default();
        child.insert("a".to_string(), Value::Number(99.0));
        let merged = shallow_merge_map(parent, child);
        assert_eq!(merged.get("a"), Some(&Value::Number(99.0)));
        assert_eq!(merged.get("b"), Some(&Value::Number(2.0)));
    }

    #[test]
    fn deep_merge_recurses_into_nested_objects() {
        let mut inner_parent = FxHashMap::default();
        inner_parent.insert("x".to_string(), Value::Number(1.0));
        inner_parent.insert("y".to_string(), Value::Number(2.0));
        let mut parent = FxHashMap::default();
        parent.insert("nested".to_string(), Value::Object(inner_parent));

        let mut inner_child = FxHashMap::default();
        inner_child.insert("x".to_string(), Value::Number(99.0));
        let mut child = FxHashMap::default();
        child.insert("nested".to_string(), Value::Object(inner_child));

        let merged = deep_merge_map(parent, child, MergeStrategy::Deep);
        let nested = merged.get("nested").unwrap().as_object().unwrap();
        assert_eq!(nested.get("x"), Some(&Value::Number(99.0)));
        assert_eq!(nested.get("y"), Some(&Value::Number(2.0)));
    }

    #[test]
    fn remote_state_child_override_wins_even_when_parent_unset_is_reversed() {
        // Regression contract (spec.md §4.2): child value always wins, and
        // specifically an *unset* child attribute must not silently drop
        // down to the parent's value when the attribute *is* set on the
        // child. `Option::or` on the whole block (not a per-field merge)
        // is what the shallow-merge branch uses, which satisfies this.
        let parent_rs = crate::unit::RemoteStateConfig {
            backend: "s3".into(),
            config: Value::Object(FxHashMap::default()),
            generate: None,
        };
        let merged = Some(crate::unit::RemoteStateConfig {
            backend: "gcs".into(),
            config: Value::Object(FxHashMap::default()),
            generate: None,
        })
        .or(Some(parent_rs));
        assert_eq!(merged.unwrap().backend, "gcs");
    }

    #[test]
    fn terraform_shallow_merge_keeps_parent_source_child_copy_filters() {
        // Boundary scenario (spec.md §8.4): parent sets only `source`;
        // child sets only the copy filters. The merged block must carry
        // both, not whichever block happened to be written last.
        let parent = TerraformSource {
            source: Some(Utf8PathBuf::from("./modules/example")),
            include_in_copy: vec![],
            exclude_from_copy: vec![],
        };
        let child = TerraformSource {
            source: None,
            include_in_copy: vec!["special-file.txt".to_string()],
            exclude_from_copy: vec!["**/_*".to_string()],
        };
        let merged = merge_terraform(Some(parent), Some(child)).unwrap();
        assert_eq!(merged.source, Some(Utf8PathBuf::from("./modules/example")));
        assert_eq!(merged.exclude_from_copy, vec!["**/_*".to_string()]);
        assert_eq!(merged.include_in_copy, vec!["special-file.txt".to_string()]);
    }
}
