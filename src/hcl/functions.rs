//! Built-in function table (spec.md §4.1).
//!
//! `run_cmd`'s three cache tiers mirror Design Note §9: "never a lockless
//! global map." The global tier is a process-wide `DashMap` of `OnceCell`s
//! keyed by the full argv, so concurrent callers for the same command across
//! units still only spawn one subprocess.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::LazyLock;

use dashmap::DashMap;
use tokio::process::Command;
use tokio::sync::OnceCell;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Result, StratumError};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCmdCacheMode {
    PerEvaluation,
    Global,
    NoCache,
}

type CacheKey = u64;
type CachedOutput = Arc<str>;

/// Global run_cmd cache: one entry per unique argv, shared across the whole
/// invocation. Never accessed with a lock held across the subprocess spawn.
static GLOBAL_RUN_CMD_CACHE: LazyLock<DashMap<CacheKey, Arc<OnceCell<Result<CachedOutput>>>>> =
    LazyLock::new(DashMap::new);

fn cache_key(cwd: &str, args: &[String]) -> CacheKey {
    let mut buf = String::with_capacity(cwd.len() + args.iter().map(|a| a.len() + 1).sum::<usize>());
    buf.push_str(cwd);
    for a in args {
        buf.push('\0');
        buf.push_str(a);
    }
    xxh3_64(buf.as_bytes())
}

/// Per-evaluation cache, owned by the evaluation context for a single unit
/// (spec.md §4.1: "default: cache by (cwd, arg list) for the evaluation of
/// one unit"). Plain FxHashMap, not shared, so no synchronization needed.
#[derive(Debug, Default)]
pub struct LocalRunCmdCache(rustc_hash::FxHashMap<CacheKey, CachedOutput>);

impl LocalRunCmdCache {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Execute `argv` in `cwd`, honoring the requested cache tier. `quiet`
/// replaces the logged stdout with `[REDACTED]` but never affects the
/// returned value.
pub async fn run_cmd(
    cwd: &str,
    args: &[String],
    mode: RunCmdCacheMode,
    quiet: bool,
    local_cache: &mut LocalRunCmdCache,
) -> Result<Value> {
    let key = cache_key(cwd, args);

    let output = match mode {
        RunCmdCacheMode::NoCache => execute_run_cmd(cwd, args).await?,
        RunCmdCacheMode::PerEvaluation => {
            if let Some(cached) = local_cache.0.get(&key) {
                Arc::clone(cached)
            } else {
                let out = execute_run_cmd(cwd, args).await?;
                local_cache.0.insert(key, Arc::clone(&out));
                out
            }
        }
        RunCmdCacheMode::Global => {
            let cell = GLOBAL_RUN_CMD_CACHE
                .entry(key)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();
            let cwd = cwd.to_string();
            let args = args.to_vec();
            cell.get_or_init(|| async move { execute_run_cmd(&cwd, &args).await })
                .await
                .clone()?
        }
    };

    if !quiet {
        tracing::info!(cwd, argv = ?args, stdout = %output, "run_cmd");
    } else {
        tracing::info!(cwd, argv = ?args, stdout = "[REDACTED]", "run_cmd");
    }

    Ok(Value::String(output.to_string()))
}

async fn execute_run_cmd(cwd: &str, args: &[String]) -> Result<CachedOutput> {
    if args.is_empty() {
        return Err(StratumError::InternalError {
            reason: "run_cmd requires at least one argument".into(),
        });
    }

    let output = Command::new(&args[0])
        .args(&args[1..])
        .current_dir(cwd)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| StratumError::RunCmdFailed {
            command: args.join(" "),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(StratumError::RunCmdFailed {
            command: args.join(" "),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(Arc::from(String::from_utf8_lossy(&output.stdout).trim()))
}

/// `sops_decrypt_file(path)` — shells out to the `sops` binary rather than
/// embedding a SOPS/PGP/age format parser (Open Question decision, see
/// DESIGN.md). Concurrency contract: concurrent calls for distinct paths must
/// not corrupt each other, enforced here by using a fresh subprocess per path
/// rather than any shared decryption state.
pub async fn sops_decrypt_file(path: &str) -> Result<Value> {
    let output = Command::new("sops")
        .arg("-d")
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| StratumError::SopsDecryptFailed {
            path: path.to_string(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(StratumError::SopsDecryptFailed {
            path: path.to_string(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let text = String::from_utf8_lossy(&output.stdout).into_owned();
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(json) => Ok(Value::from_json(&json).mark("sensitive")),
        Err(_) => Ok(Value::String(text).mark("sensitive")),
    }
}

pub fn get_env(name: &str, default: Option<&str>) -> Result<Value> {
    match std::env::var(name) {
        Ok(v) => Ok(Value::String(v)),
        Err(_) => match default {
            Some(d) => Ok(Value::String(d.to_string())),
            None => Err(StratumError::UndefinedInput { name: name.to_string() }),
        },
    }
}

pub fn jsondecode(s: &str) -> Result<Value> {
    let json: serde_json::Value =
        serde_json::from_str(s).map_err(|e| StratumError::TypeMismatch {
            expr: s.to_string(),
            expected: "valid JSON".into(),
            actual: e.to_string(),
        })?;
    Ok(Value::from_json(&json))
}

/// terraform/tofu commands whose inputs depend on `-var`/`-var-file` flags;
/// used by the CLI-arg-insertion contract to decide whether to inject vars.
pub fn get_terraform_commands_that_need_vars() -> &'static [&'static str] {
    &["plan", "apply", "destroy", "refresh", "import", "console"]
}

pub fn get_platform() -> &'static str {
    std::env::consts::OS
}

pub fn timestamp() -> Value {
    Value::String(chrono::Utc::now().to_rfc3339())
}

pub fn uuid() -> Value {
    Value::String(uuid::Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_cmd_per_evaluation_cache_reuses_result() {
        let mut cache = LocalRunCmdCache::new();
        let args = vec!["echo".to_string(), "hello".to_string()];
        let a = run_cmd(".", &args, RunCmdCacheMode::PerEvaluation, false, &mut cache)
            .await
            .unwrap();
        let b = run_cmd(".", &args, RunCmdCacheMode::PerEvaluation, false, &mut cache)
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), Some("hello"));
    }

    #[test]
    fn cache_key_distinguishes_cwd() {
        let args = vec!["echo".to_string()];
        assert_ne!(cache_key("/a", &args), cache_key("/b", &args));
    }

    #[test]
    fn jsondecode_parses_object() {
        let v = jsondecode(r#"{"a": 1}"#).unwrap();
        assert_eq!(v.as_object().unwrap().get("a").unwrap(), &Value::Number(1.0));
    }

    #[test]
    fn get_terraform_commands_includes_plan_and_apply() {
        let cmds = get_terraform_commands_that_need_vars();
        assert!(cmds.contains(&"plan"));
        assert!(cmds.contains(&"apply"));
    }
}
