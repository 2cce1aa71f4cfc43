//! Dependency resolver: mock outputs, remote-state shortcut, engine fallback
//! (spec.md §4.3).
//!
//! At-most-once concurrent fetch per target path uses the same
//! `DashMap<K, Arc<OnceCell<..>>>` registry shape as the teacher's
//! `TaskExecutor::mcp_client_cache` (`runtime/executor.rs`), generalized from
//! an MCP client handle to a resolved output `Value`.

use std::sync::{Arc, LazyLock};

use camino::{Utf8Path, Utf8PathBuf};
use dashmap::DashMap;
use tokio::process::Command;
use tokio::sync::OnceCell;

use crate::error::{Result, StratumError};
use crate::unit::{Action, DependencyRef};
use crate::value::Value;

/// Adapter for a concrete remote-state backend (S3, GCS, Azure — none ship;
/// spec.md Non-goals exclude concrete cloud SDKs). Implementations parse a
/// backend's raw state object and return its `outputs` section.
pub trait StateReader: Send + Sync {
    fn read_outputs(&self, backend_config: &Value) -> std::result::Result<Value, BackendReadError>;
}

#[derive(Debug, thiserror::Error)]
#[error("backend read failed: {0}")]
pub struct BackendReadError(pub String);

type FetchResult = std::result::Result<Value, Arc<StratumError>>;
type FetchCell = Arc<OnceCell<FetchResult>>;

static FETCH_REGISTRY: LazyLock<DashMap<Utf8PathBuf, FetchCell>> = LazyLock::new(DashMap::new);

/// Resolve a dependency's outputs for the given action, following spec.md
/// §4.3's three-step path. `fetch_from_state` mirrors
/// `--dependency-fetch-output-from-state`; when set, an unknown backend
/// schema version degrades silently to the subprocess path (Open Question
/// decision, see DESIGN.md) rather than failing the run.
pub async fn resolve_dependency(
    dep: &DependencyRef,
    action: Action,
    fetch_from_state: bool,
    state_reader: Option<&dyn StateReader>,
    engine_bin: &str,
) -> Result<Value> {
    let cell = FETCH_REGISTRY
        .entry(dep.target_path.clone())
        .or_insert_with(|| Arc::new(OnceCell::new()))
        .clone();

    let target = dep.target_path.clone();
    let mock_outputs = dep.mock_outputs.clone();
    let allowed = dep.mock_outputs_allowed_commands.contains(&action);
    let engine_bin = engine_bin.to_string();

    let result = cell
        .get_or_init(|| async move {
            fetch_outputs(&target, fetch_from_state, state_reader, &engine_bin)
                .await
                .map_err(Arc::new)
        })
        .await
        .clone();

    match result {
        Ok(v) => Ok(v),
        Err(_e) if allowed => {
            if let Some(mocks) = mock_outputs {
                Ok(mocks)
            } else {
                Err(StratumError::DependencyOutputUnavailable { dep: dep.name.clone() })
            }
        }
        Err(e) if dep.skip_outputs => {
            tracing::warn!(dep = %dep.name, error = %e, "dependency outputs unavailable, skip_outputs=true");
            Ok(Value::Unknown)
        }
        Err(e) => Err((*e).clone_for_propagation()),
    }
}

async fn fetch_outputs(
    target: &Utf8Path,
    fetch_from_state: bool,
    state_reader: Option<&dyn StateReader>,
    engine_bin: &str,
) -> Result<Value> {
    if fetch_from_state {
        if let Some(reader) = state_reader {
            match reader.read_outputs(&Value::Null) {
                Ok(v) => return Ok(v),
                Err(_) => {
                    // Unknown/mismatched schema: degrade silently to the
                    // subprocess path rather than failing the run.
                }
            }
        }
    }

    run_engine_output(target, engine_bin).await
}

async fn run_engine_output(target: &Utf8Path, engine_bin: &str) -> Result<Value> {
    let output = Command::new(engine_bin)
        .arg("output")
        .arg("-json")
        .current_dir(target)
        .output()
        .await
        .map_err(|e| StratumError::BackendReadError {
            dep: target.to_string(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(StratumError::DependencyOutputUnavailable { dep: target.to_string() });
    }

    let json: serde_json::Value =
        serde_json::from_slice(&output.stdout).map_err(|e| StratumError::BackendReadError {
            dep: target.to_string(),
            reason: e.to_string(),
        })?;

    Ok(Value::from_json(&json))
}

/// In-memory `StateReader` test double.
pub struct MockStateReader {
    pub outputs: Value,
    pub fails: bool,
}

impl StateReader for MockStateReader {
    fn read_outputs(&self, _backend_config: &Value) -> std::result::Result<Value, BackendReadError> {
        if self.fails {
            Err(BackendReadError("unknown schema version".into()))
        } else {
            Ok(self.outputs.clone())
        }
    }
}

/// `StratumError` doesn't implement `Clone` (miette diagnostics carry
/// non-Clone backtraces in some variants), so waiters needing their own
/// owned error reconstruct a `DependencyOutputUnavailable` rather than
/// cloning arbitrary variants.
trait ClonePropagate {
    fn clone_for_propagation(&self) -> StratumError;
}

impl ClonePropagate for StratumError {
    fn clone_for_propagation(&self) -> StratumError {
        StratumError::DependencyOutputUnavailable { dep: self.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn dep(name: &str, target: &str) -> DependencyRef {
        DependencyRef {
            name: name.to_string(),
            target_path: Utf8PathBuf::from(target),
            mock_outputs: None,
            mock_outputs_allowed_commands: HashSet::new(),
            skip_outputs: false,
        }
    }

    #[tokio::test]
    async fn mock_outputs_used_when_action_allowed_and_engine_missing() {
        let mut d = dep("vpc", "/nonexistent/unit-for-test");
        d.mock_outputs = Some(Value::String("mocked".into()));
        d.mock_outputs_allowed_commands.insert(Action::Plan);

        let v = resolve_dependency(&d, Action::Plan, false, None, "/no/such/binary-xyz")
            .await
            .unwrap();
        assert_eq!(v.as_str(), Some("mocked"));
    }

    #[tokio::test]
    async fn skip_outputs_yields_unknown_on_failure() {
        let mut d = dep("vpc", "/nonexistent/unit-for-test-2");
        d.skip_outputs = true;

        let v = resolve_dependency(&d, Action::Plan, false, None, "/no/such/binary-xyz")
            .await
            .unwrap();
        assert!(v.is_unknown());
    }

    #[test]
    fn state_reader_double_fails_then_caller_degrades() {
        let reader = MockStateReader {
            outputs: Value::Null,
            fails: true,
        };
        assert!(reader.read_outputs(&Value::Null).is_err());
    }
}
