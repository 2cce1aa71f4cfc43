//! Subprocess driver: engine resolution, working-dir staging, hooks,
//! writer wrapping (spec.md §4.7).
//!
//! Grounded on the teacher's `execute_exec` (`runtime/executor.rs`): spawn
//! via `tokio::process::Command`, pipe stdio, wrap errors with the command
//! and a human reason rather than the raw `io::Error`.

use std::path::PathBuf;
use std::process::Stdio;

use camino::{Utf8Path, Utf8PathBuf};
use globset::{Glob, GlobSetBuilder};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::{Result, StratumError};
use crate::unit::{Action, Hook, HookPhase, IfExistsPolicy, Unit};

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Any writer wrapper that can hand back the writer it decorates. Mirrors
/// the teacher's `ParentWriter`/`extract_original_writer` recursive-unwrap
/// pattern so a terminal writer buried under several decorator layers
/// (color, prefix, buffering) is still recoverable for raw passthrough.
pub trait ParentWriter {
    fn parent_writer(&self) -> Option<&dyn ParentWriter>;
}

pub fn extract_original_writer<'a>(writer: &'a dyn ParentWriter) -> &'a dyn ParentWriter {
    match writer.parent_writer() {
        Some(parent) => extract_original_writer(parent),
        None => writer,
    }
}

/// Resolve the IaC engine binary: `--tf-path` override > explicit path in
/// config > first match on `PATH`.
pub fn resolve_engine_binary(tf_path_flag: Option<&str>, explicit_path: Option<&str>) -> Result<Utf8PathBuf> {
    if let Some(p) = tf_path_flag.or(explicit_path) {
        return Ok(Utf8PathBuf::from(p));
    }
    for candidate in ["tofu", "terraform"] {
        if which_on_path(candidate).is_some() {
            return Ok(Utf8PathBuf::from(candidate));
        }
    }
    Err(StratumError::EngineNotFound)
}

fn which_on_path(bin: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).map(|dir| dir.join(bin)).find(|p| p.is_file())
}

/// Stage a unit's source into its cache directory, applying copy filters.
/// `cache_root` defaults to `$STRATUM_CACHE_DIR` or `~/.cache/stratum`.
pub fn stage_working_dir(unit: &Unit, cache_root: &Utf8Path) -> Result<Utf8PathBuf> {
    let dest = cache_root.join(unit.path.as_str().trim_start_matches('/'));
    std::fs::create_dir_all(&dest)?;
    let (include, exclude) = unit
        .terraform
        .as_ref()
        .map(|tf| (tf.include_in_copy.as_slice(), tf.exclude_from_copy.as_slice()))
        .unwrap_or((&[], &[]));
    copy_filtered(&unit.path, &dest, include, exclude)?;
    Ok(dest)
}

pub fn default_cache_root() -> Utf8PathBuf {
    if let Ok(dir) = std::env::var("STRATUM_CACHE_DIR") {
        return Utf8PathBuf::from(dir);
    }
    let base = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
    Utf8PathBuf::from_path_buf(base.join("stratum")).unwrap_or_else(|_| Utf8PathBuf::from("./.cache/stratum"))
}

fn copy_filtered(source: &Utf8Path, dest: &Utf8Path, include: &[String], exclude: &[String]) -> Result<()> {
    let mut include_set = GlobSetBuilder::new();
    for g in include {
        include_set.add(Glob::new(g).map_err(|e| StratumError::StagingFailed {
            unit: source.to_string(),
            reason: e.to_string(),
        })?);
    }
    let include_set = include_set.build().map_err(|e| StratumError::StagingFailed {
        unit: source.to_string(),
        reason: e.to_string(),
    })?;

    let mut exclude_builder = GlobSetBuilder::new();
    for g in exclude {
        exclude_builder.add(Glob::new(g).map_err(|e| StratumError::StagingFailed {
            unit: source.to_string(),
            reason: e.to_string(),
        })?);
    }
    let exclude_set = exclude_builder.build().map_err(|e| StratumError::StagingFailed {
        unit: source.to_string(),
        reason: e.to_string(),
    })?;

    for entry in walkdir_files(source)? {
        let rel = entry.strip_prefix(source).unwrap_or(&entry);
        if exclude_set.is_match(rel) {
            continue;
        }
        if !include.is_empty() && !include_set.is_match(rel) {
            continue;
        }
        let target = dest.join(rel.as_str());
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&entry, &target)?;
    }
    Ok(())
}

fn walkdir_files(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let mut out = Vec::new();
    for entry in ignore::WalkBuilder::new(root.as_std_path()).hidden(false).build() {
        let entry = entry.map_err(|e| StratumError::StagingFailed {
            unit: root.to_string(),
            reason: e.to_string(),
        })?;
        if entry.file_type().is_some_and(|t| t.is_file()) {
            if let Ok(p) = Utf8PathBuf::try_from(entry.path().to_path_buf()) {
                out.push(p);
            }
        }
    }
    Ok(out)
}

/// Write a `generate` block's contents to disk, honoring its `if_exists` policy.
pub fn write_generate_block(
    unit_dir: &Utf8Path,
    name: &str,
    rel_path: &Utf8Path,
    contents: &str,
    if_exists: IfExistsPolicy,
) -> Result<()> {
    let target = unit_dir.join(rel_path);
    if target.exists() {
        match if_exists {
            IfExistsPolicy::Skip => return Ok(()),
            IfExistsPolicy::Error => {
                return Err(StratumError::GenerateBlockFailed {
                    unit: unit_dir.to_string(),
                    name: name.to_string(),
                    reason: format!("{target} already exists"),
                })
            }
            IfExistsPolicy::Overwrite | IfExistsPolicy::OverwriteTerragruntGenerated => {}
        }
    }
    std::fs::write(&target, contents).map_err(|e| StratumError::GenerateBlockFailed {
        unit: unit_dir.to_string(),
        name: name.to_string(),
        reason: e.to_string(),
    })
}

/// Run the engine for `action` in `cwd`: before hooks, the engine itself,
/// then after/error hooks. Cancellation sends SIGINT via the child handle
/// drop contract; the runner pool owns the grace-period/SIGKILL escalation.
#[instrument(name = "run_module", skip_all, fields(dir = %cwd, command = ?action))]
pub async fn run_unit_action(
    unit: &Unit,
    action: Action,
    engine_bin: &Utf8Path,
    argv: &[String],
    cwd: &Utf8Path,
    cancel: &CancellationToken,
) -> Result<ExecOutcome> {
    for hook in unit.hooks_for(HookPhase::Before, action) {
        run_hook(hook, cwd, cancel).await?;
    }

    match run_engine(engine_bin, argv, cwd, cancel).await {
        Ok(outcome) if outcome.success() => {
            if !cancel.is_cancelled() {
                for hook in unit.hooks_for(HookPhase::After, action) {
                    run_hook(hook, cwd, cancel).await?;
                }
            }
            Ok(outcome)
        }
        Ok(outcome) => {
            for hook in unit.hooks_for(HookPhase::Error, action) {
                if hook.run_on_error {
                    run_hook(hook, cwd, cancel).await?;
                }
            }
            Ok(outcome)
        }
        // A cancelled run never produces an ExecOutcome, but error_hooks with
        // run_on_error must still fire (spec.md §5); the cancellation token is
        // already tripped, so a select against it would resolve immediately
        // and the hook would never actually run, hence the best-effort runner.
        Err(StratumError::Cancelled) => {
            for hook in unit.hooks_for(HookPhase::Error, action) {
                if hook.run_on_error {
                    run_hook_best_effort(hook, cwd).await;
                }
            }
            Err(StratumError::Cancelled)
        }
        Err(e) => Err(e),
    }
}

#[instrument(name = "run_terraform", skip_all, fields(command = %engine_bin, args = %argv.join(" "), dir = %cwd))]
async fn run_engine(
    engine_bin: &Utf8Path,
    argv: &[String],
    cwd: &Utf8Path,
    cancel: &CancellationToken,
) -> Result<ExecOutcome> {
    let mut child = Command::new(engine_bin.as_str())
        .args(argv)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            tracing::error!(unit = %cwd, reason = %e, "failed to spawn engine process");
            StratumError::EngineExecutionFailed {
                unit: cwd.to_string(),
                exit_code: None,
            }
        })?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let mut stdout_lines = Vec::new();
    let mut stderr_lines = Vec::new();

    let mut stdout_reader = BufReader::new(stdout).lines();
    let mut stderr_reader = BufReader::new(stderr).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                tokio::select! {
                    _ = child.wait() => {}
                    _ = tokio::time::sleep(crate::util::CANCEL_GRACE_PERIOD) => {
                        let _ = child.start_kill();
                    }
                }
                return Err(StratumError::Cancelled);
            }
            line = stdout_reader.next_line() => {
                match line {
                    Ok(Some(l)) => { tracing::info!(stream = "stdout", %l); stdout_lines.push(l); }
                    _ => break,
                }
            }
            line = stderr_reader.next_line() => {
                match line {
                    Ok(Some(l)) => { tracing::info!(stream = "stderr", %l); stderr_lines.push(l); }
                    _ => break,
                }
            }
        }
    }

    // Drain whichever stream didn't hit EOF in the select loop above.
    while let Ok(Some(l)) = stdout_reader.next_line().await {
        stdout_lines.push(l);
    }
    while let Ok(Some(l)) = stderr_reader.next_line().await {
        stderr_lines.push(l);
    }

    let status = child.wait().await.map_err(|e| {
        tracing::error!(unit = %cwd, reason = %e, "failed to wait on engine process");
        StratumError::EngineExecutionFailed {
            unit: cwd.to_string(),
            exit_code: None,
        }
    })?;

    Ok(ExecOutcome {
        exit_code: status.code(),
        stdout: stdout_lines.join("\n"),
        stderr: stderr_lines.join("\n"),
    })
}

#[instrument(name = "run_bash", skip_all, fields(command = %hook.name, args = %hook.execute.join(" "), dir = %cwd))]
async fn run_hook(hook: &Hook, cwd: &Utf8Path, cancel: &CancellationToken) -> Result<()> {
    if hook.execute.is_empty() {
        return Ok(());
    }
    let mut cmd = Command::new(&hook.execute[0]);
    cmd.args(&hook.execute[1..]).current_dir(cwd);

    let run = async {
        cmd.status().await.map_err(|e| StratumError::HookFailed {
            unit: cwd.to_string(),
            hook: hook.name.clone(),
            reason: e.to_string(),
        })
    };

    let status = tokio::select! {
        _ = cancel.cancelled() => return Err(StratumError::Cancelled),
        result = run => result?,
    };

    if !status.success() && hook.if_failed_fail_run {
        return Err(StratumError::HookFailed {
            unit: cwd.to_string(),
            hook: hook.name.clone(),
            reason: format!("exited with {:?}", status.code()),
        });
    }
    Ok(())
}

/// Runs a hook without selecting against `cancel`. Used for `error_hook`s
/// under an already-cancelled token, where a `tokio::select!` against it
/// would resolve before the hook's process ever got to run. Failures are
/// swallowed: a cleanup hook failing must not mask the original cancellation.
async fn run_hook_best_effort(hook: &Hook, cwd: &Utf8Path) {
    if hook.execute.is_empty() {
        return;
    }
    let mut cmd = Command::new(&hook.execute[0]);
    cmd.args(&hook.execute[1..]).current_dir(cwd);
    let _ = cmd.status().await;
}

/// CLI-arg-insertion contract (spec.md §4.7): when prefixing/rewriting a
/// subcommand (`providers lock` → `providers mirror`), replace the existing
/// subcommand tokens rather than appending, if the new first token matches
/// the existing command and the new second token is itself a known
/// subcommand; otherwise treat unknown tokens as positional and append.
pub fn rewrite_subcommand(existing: &[String], new_tokens: &[String], known_subcommands: &[&str]) -> Vec<String> {
    if new_tokens.len() >= 2
        && existing.first() == new_tokens.first()
        && known_subcommands.contains(&new_tokens[1].as_str())
    {
        let mut out = new_tokens.to_vec();
        out.extend(existing.iter().skip(2).cloned());
        return out;
    }
    let mut out = existing.to_vec();
    out.extend(new_tokens.iter().cloned());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_subcommand_replaces_matching_prefix() {
        let existing = vec!["providers".to_string(), "lock".to_string(), "-platform=linux_amd64".to_string()];
        let new = vec!["providers".to_string(), "mirror".to_string()];
        let rewritten = rewrite_subcommand(&existing, &new, &["lock", "mirror", "schema"]);
        assert_eq!(rewritten, vec!["providers", "mirror", "-platform=linux_amd64"]);
    }

    #[test]
    fn rewrite_subcommand_appends_unknown_tokens() {
        let existing = vec!["plan".to_string()];
        let new = vec!["-out=plan.tfplan".to_string()];
        let rewritten = rewrite_subcommand(&existing, &new, &["lock", "mirror"]);
        assert_eq!(rewritten, vec!["plan", "-out=plan.tfplan"]);
    }

    #[test]
    fn resolve_engine_binary_prefers_explicit_flag() {
        let resolved = resolve_engine_binary(Some("/usr/local/bin/tofu"), Some("/other/path")).unwrap();
        assert_eq!(resolved.as_str(), "/usr/local/bin/tofu");
    }
}
