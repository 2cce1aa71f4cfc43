//! Bounded concurrent runner pool: schedules the DAG, owns per-unit state,
//! retries/ignores failures, propagates cancellation (spec.md §4.6).
//!
//! Grounded on the teacher's `Runner` (`runtime/runner.rs`): a `JoinSet`
//! spawns every currently-ready unit each pass, generalized here with a
//! `Semaphore` permit (bounded `--parallelism`) and an explicit state
//! machine per unit instead of the teacher's task-id bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use dashmap::DashMap;
use regex::Regex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::dag::{SortMode, UnitGraph};
use crate::error::{Result, StratumError};
use crate::exec::ExecOutcome;
use crate::unit::{Action, Unit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Excluded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailFastMode {
    FailFast,
    ContinueOnError,
}

pub struct RunSummary {
    pub states: DashMap<Utf8PathBuf, UnitState>,
}

impl RunSummary {
    pub fn succeeded_count(&self) -> usize {
        self.states.iter().filter(|e| *e.value() == UnitState::Succeeded).count()
    }

    pub fn failed_count(&self) -> usize {
        self.states.iter().filter(|e| *e.value() == UnitState::Failed).count()
    }
}

/// Strips control bytes (replacing with spaces) from stderr+exit-error text
/// before a retry/ignore regex sees it, while preserving hyphens, equals,
/// quotes, and path separators (spec.md §4.6) so flags like
/// `-lock-timeout=120m` never leak a false "timeout" match via corruption.
pub fn clean_error_text(stderr: &str, exit_text: &str) -> String {
    let combined = format!("{stderr}\n{exit_text}");
    combined
        .chars()
        .map(|c| {
            if c.is_control() && c != '\n' {
                ' '
            } else {
                c
            }
        })
        .collect()
}

/// Runs the pool against a pre-built graph and unit map, executing `action`
/// for each unit via `run_one`. Destroy runs in reverse DAG order; all
/// other actions run forward.
pub async fn run_all(
    graph: &UnitGraph,
    units: &DashMap<Utf8PathBuf, Unit>,
    action: Action,
    parallelism: usize,
    fail_fast: FailFastMode,
    cancel: CancellationToken,
    run_one: impl Fn(Unit, CancellationToken) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<ExecOutcome>> + Send>>
        + Send
        + Sync
        + 'static,
) -> RunSummary {
    let run_one = Arc::new(run_one);
    let states: Arc<DashMap<Utf8PathBuf, UnitState>> =
        Arc::new(units.iter().map(|e| (e.key().clone(), UnitState::Pending)).collect());
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));

    let levels = if action == Action::Destroy {
        graph.reverse_levels(SortMode::Dag)
    } else {
        graph.levels(SortMode::Dag)
    };

    let mut fail_fast_triggered = false;

    'levels: for level in levels {
        if cancel.is_cancelled() {
            for path in &level {
                states.insert(Utf8PathBuf::from(path.as_ref()), UnitState::Skipped);
            }
            continue;
        }

        let mut join_set: JoinSet<(Utf8PathBuf, Result<ExecOutcome>)> = JoinSet::new();

        for path_arc in &level {
            let path = Utf8PathBuf::from(path_arc.as_ref());

            if fail_fast_triggered && matches!(fail_fast, FailFastMode::FailFast) {
                states.insert(path, UnitState::Excluded);
                continue;
            }

            let Some(unit_entry) = units.get(&path) else {
                states.insert(path, UnitState::Excluded);
                continue;
            };
            let unit = unit_entry.value().clone();
            drop(unit_entry);

            states.insert(path.clone(), UnitState::Ready);
            let permit = Arc::clone(&semaphore);
            let child_cancel = cancel.child_token();
            let run_one = Arc::clone(&run_one);
            let states_for_task = Arc::clone(&states);

            join_set.spawn(async move {
                let _permit = permit.acquire_owned().await;
                states_for_task.insert(path.clone(), UnitState::Running);

                let retry_rules = unit.retry.rules.clone();
                let ignore_rules = unit.ignore.clone();
                let mut attempt: u32 = 0;

                let outcome = loop {
                    let result = (run_one)(unit.clone(), child_cancel.clone()).await;

                    let failed = match &result {
                        Ok(exec_outcome) => !exec_outcome.success(),
                        Err(_) => true,
                    };
                    if !failed {
                        break result;
                    }

                    let cleaned = match &result {
                        Ok(exec_outcome) => {
                            let exit_text =
                                exec_outcome.exit_code.map(|c| format!("exit status {c}")).unwrap_or_default();
                            clean_error_text(&exec_outcome.stderr, &exit_text)
                        }
                        Err(e) => clean_error_text("", &e.to_string()),
                    };

                    if let Some(ignore_rule) = matching_ignore_rule(&ignore_rules, &cleaned) {
                        tracing::warn!(
                            unit = %path,
                            pattern = %ignore_rule.pattern,
                            message = ignore_rule.message.as_deref().unwrap_or(""),
                            "failure ignored by ignore rule"
                        );
                        let stdout = result.as_ref().map(|o| o.stdout.clone()).unwrap_or_default();
                        let stderr = result.as_ref().map(|o| o.stderr.clone()).unwrap_or_default();
                        break Ok(ExecOutcome { exit_code: Some(0), stdout, stderr });
                    }

                    let retryable = match &result {
                        Ok(_) => true,
                        Err(e) => e.is_retry_eligible(),
                    };

                    if retryable {
                        if let Some(rule) = matching_retry_rule(&retry_rules, &cleaned, attempt) {
                            attempt += 1;
                            tracing::warn!(
                                unit = %path,
                                rule = %rule.name,
                                attempt,
                                "retrying after matched retry rule"
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_secs(rule.sleep_interval_sec)) => {
                                    continue;
                                }
                                _ = child_cancel.cancelled() => {
                                    break result;
                                }
                            }
                        }
                    }

                    break result;
                };

                (path, outcome)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let Ok((path, outcome)) = joined else {
                continue;
            };
            match outcome {
                Ok(exec_outcome) if exec_outcome.success() => {
                    states.insert(path, UnitState::Succeeded);
                }
                Ok(_) | Err(_) => {
                    states.insert(path, UnitState::Failed);
                    fail_fast_triggered = true;
                    if matches!(fail_fast, FailFastMode::FailFast) {
                        cancel.cancel();
                    }
                }
            }
        }

        if fail_fast_triggered && matches!(fail_fast, FailFastMode::FailFast) {
            continue 'levels;
        }
    }

    RunSummary {
        states: Arc::try_unwrap(states).unwrap_or_else(|arc| (*arc).clone()),
    }
}

/// Consults the unit's merged retry policy after a non-zero exit: for each
/// rule in order, if its pattern matches the cleaned error text and the
/// attempt count is still under `max_attempts`, the caller should sleep
/// `sleep_interval_sec` and retry.
pub fn matching_retry_rule<'a>(
    rules: &'a [crate::unit::RetryRule],
    cleaned_error: &str,
    attempt: u32,
) -> Option<&'a crate::unit::RetryRule> {
    rules.iter().find(|rule| {
        attempt < rule.max_attempts
            && Regex::new(&rule.pattern)
                .map(|re| re.is_match(cleaned_error))
                .unwrap_or(false)
    })
}

/// Ignore rules recover a failure silently (spec.md §4.6), optionally
/// emitting a warning message.
pub fn matching_ignore_rule<'a>(
    rules: &'a [crate::unit::IgnoreRule],
    cleaned_error: &str,
) -> Option<&'a crate::unit::IgnoreRule> {
    rules.iter().find(|rule| {
        Regex::new(&rule.pattern)
            .map(|re| re.is_match(cleaned_error))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_bytes_replaced_but_flag_syntax_preserved() {
        let cleaned = clean_error_text("flag provided but not defined: -abc", "exit status 1");
        assert!(cleaned.contains("-abc"));
        assert!(cleaned.contains("exit status 1"));
    }

    #[test]
    fn timeout_regex_does_not_false_positive_on_lock_timeout_flag() {
        // argv (never fed to the regex) contains -lock-timeout=120m; stderr
        // does not mention "timeout" at all.
        let cleaned = clean_error_text("flag provided but not defined: -abc", "exit status 1");
        let rule = crate::unit::RetryRule {
            name: "timeout".into(),
            pattern: "(?s).*timeout.*".into(),
            max_attempts: 3,
            sleep_interval_sec: 1,
        };
        assert!(matching_retry_rule(&[rule], &cleaned, 0).is_none());
    }

    #[test]
    fn retry_rule_matches_when_pattern_found_and_attempts_remain() {
        let rule = crate::unit::RetryRule {
            name: "throttle".into(),
            pattern: "RequestLimitExceeded".into(),
            max_attempts: 3,
            sleep_interval_sec: 1,
        };
        assert!(matching_retry_rule(&[rule], "Error: RequestLimitExceeded", 0).is_some());
    }

    #[test]
    fn retry_rule_exhausted_after_max_attempts() {
        let rule = crate::unit::RetryRule {
            name: "throttle".into(),
            pattern: "RequestLimitExceeded".into(),
            max_attempts: 2,
            sleep_interval_sec: 1,
        };
        assert!(matching_retry_rule(&[rule], "Error: RequestLimitExceeded", 2).is_none());
    }

    #[test]
    fn ignore_rule_matches_pattern() {
        let rule = crate::unit::IgnoreRule {
            pattern: "NoSuchBucket".into(),
            message: Some("bucket already gone".into()),
        };
        assert!(matching_ignore_rule(&[rule], "Error: NoSuchBucket").is_some());
    }
}
