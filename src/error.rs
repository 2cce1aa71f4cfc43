// The #[error] attribute from thiserror uses struct fields via string interpolation,
// but Rust's unused_assignments lint doesn't recognize this.
#![allow(unused_assignments)]

//! Stratum error types with stable error codes.
//!
//! Error code ranges:
//! - STRATUM-0xx: usage / config syntax errors
//! - STRATUM-1xx: config semantic errors (evaluator, functions, merge)
//! - STRATUM-2xx: dependency graph errors (cycles, missing/unavailable outputs)
//! - STRATUM-3xx: engine / subprocess / hook failures
//! - STRATUM-4xx: discovery & filter errors
//! - STRATUM-9xx: internal errors (IO, serialization, panics)

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StratumError>;

/// Trait for errors that provide a one-line fix suggestion for terminal display.
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

#[derive(Error, Debug, Diagnostic)]
#[diagnostic(url(docsrs))]
pub enum StratumError {
    // ═══════════════════════════════════════════
    // USAGE / CONFIG SYNTAX (000-019)
    // ═══════════════════════════════════════════
    #[error("[STRATUM-000] Invalid CLI usage: {reason}")]
    #[diagnostic(code(stratum::usage_error), help("Run with --help to see valid flags"))]
    UsageError { reason: String },

    #[error("[STRATUM-001] Failed to parse HCL file {path}: {details}")]
    #[diagnostic(code(stratum::hcl_parse_error), help("Check block/attribute syntax against the HCL spec"))]
    HclParseError { path: String, details: String },

    #[error("[STRATUM-002] Include target not found: {path} (included from {from})")]
    #[diagnostic(code(stratum::include_not_found), help("Check the include path is relative to the including file"))]
    IncludeNotFound { path: String, from: String },

    #[error("[STRATUM-003] Duplicate include label: {label}")]
    DuplicateIncludeLabel { label: String },

    #[error("[STRATUM-004] Unit config not found at {path}")]
    #[diagnostic(code(stratum::unit_not_found), help("Check the working directory contains a unit config file"))]
    UnitConfigNotFound { path: String },

    // ═══════════════════════════════════════════
    // CONFIG SEMANTIC (100-149)
    // ═══════════════════════════════════════════
    #[error("[STRATUM-100] Unknown function: {name}")]
    #[diagnostic(code(stratum::unknown_function), help("Check the function name against the built-in function table"))]
    UnknownFunction { name: String },

    #[error("[STRATUM-101] Type mismatch evaluating {expr}: expected {expected}, got {actual}")]
    TypeMismatch {
        expr: String,
        expected: String,
        actual: String,
    },

    #[error("[STRATUM-102] Undefined local: {name}")]
    UndefinedLocal { name: String },

    #[error("[STRATUM-103] Undefined input: {name}")]
    UndefinedInput { name: String },

    #[error("[STRATUM-104] Invalid merge strategy: {strategy}")]
    #[diagnostic(help("Use one of: no_merge, shallow, deep, deep_map_only"))]
    InvalidMergeStrategy { strategy: String },

    #[error("[STRATUM-105] run_cmd failed: {command}: {reason}")]
    RunCmdFailed { command: String, reason: String },

    #[error("[STRATUM-106] sops_decrypt_file failed for {path}: {reason}")]
    #[diagnostic(help("Check the sops binary is on PATH and the file is a valid sops-encrypted document"))]
    SopsDecryptFailed { path: String, reason: String },

    #[error("[STRATUM-107] Invalid value for feature flag {name}: {reason}")]
    InvalidFeatureFlag { name: String, reason: String },

    // ═══════════════════════════════════════════
    // DEPENDENCY GRAPH (200-249)
    // ═══════════════════════════════════════════
    #[error("[STRATUM-200] Cycle detected in unit graph: {cycle}")]
    #[diagnostic(code(stratum::cycle_detected), help("Remove the circular dependency chain shown above"))]
    CycleDetected { cycle: String },

    #[error("[STRATUM-201] Unit '{unit}' depends on unknown unit '{dep}'")]
    MissingDependency { unit: String, dep: String },

    #[error("[STRATUM-202] Dependency '{dep}' has no outputs available and no mock_outputs configured")]
    #[diagnostic(help("Run the dependency first, or set mock_outputs + mock_outputs_allowed_terraform_commands"))]
    DependencyOutputUnavailable { dep: String },

    #[error("[STRATUM-203] mock_outputs for '{dep}' not allowed for command '{command}'")]
    MockOutputNotAllowed { dep: String, command: String },

    #[error("[STRATUM-204] Failed to read remote state outputs for '{dep}': {reason}")]
    BackendReadError { dep: String, reason: String },

    // ═══════════════════════════════════════════
    // ENGINE / SUBPROCESS / HOOKS (300-349)
    // ═══════════════════════════════════════════
    #[error("[STRATUM-300] IaC engine binary not found (checked --tf-path, explicit path, PATH)")]
    #[diagnostic(help("Install OpenTofu/Terraform or pass --tf-path"))]
    EngineNotFound,

    #[error("[STRATUM-301] Unit '{unit}' failed: engine exited with {exit_code:?}")]
    EngineExecutionFailed { unit: String, exit_code: Option<i32> },

    #[error("[STRATUM-302] Hook '{hook}' failed for unit '{unit}': {reason}")]
    HookFailed {
        unit: String,
        hook: String,
        reason: String,
    },

    #[error("[STRATUM-303] generate block '{name}' failed for unit '{unit}': {reason}")]
    GenerateBlockFailed {
        unit: String,
        name: String,
        reason: String,
    },

    #[error("[STRATUM-304] Run cancelled")]
    Cancelled,

    #[error("[STRATUM-305] Working directory staging failed for '{unit}': {reason}")]
    StagingFailed { unit: String, reason: String },

    // ═══════════════════════════════════════════
    // DISCOVERY & FILTER (400-449)
    // ═══════════════════════════════════════════
    #[error("[STRATUM-400] Invalid filter expression: {expr}: {reason}")]
    #[diagnostic(help("See `stratum find --help` for filter expression grammar"))]
    FilterParseError { expr: String, reason: String },

    #[error("[STRATUM-401] Discovery aborted: exceeded max-folders-to-check ({limit})")]
    DiscoveryLimitExceeded { limit: usize },

    // ═══════════════════════════════════════════
    // INTERNAL (900-949)
    // ═══════════════════════════════════════════
    #[error("[STRATUM-900] IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("[STRATUM-901] JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("[STRATUM-902] Config error: {reason}")]
    ConfigError { reason: String },

    #[error("[STRATUM-903] Internal error: {reason}")]
    InternalError { reason: String },
}

impl StratumError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UsageError { .. } => "STRATUM-000",
            Self::HclParseError { .. } => "STRATUM-001",
            Self::IncludeNotFound { .. } => "STRATUM-002",
            Self::DuplicateIncludeLabel { .. } => "STRATUM-003",
            Self::UnitConfigNotFound { .. } => "STRATUM-004",
            Self::UnknownFunction { .. } => "STRATUM-100",
            Self::TypeMismatch { .. } => "STRATUM-101",
            Self::UndefinedLocal { .. } => "STRATUM-102",
            Self::UndefinedInput { .. } => "STRATUM-103",
            Self::InvalidMergeStrategy { .. } => "STRATUM-104",
            Self::RunCmdFailed { .. } => "STRATUM-105",
            Self::SopsDecryptFailed { .. } => "STRATUM-106",
            Self::InvalidFeatureFlag { .. } => "STRATUM-107",
            Self::CycleDetected { .. } => "STRATUM-200",
            Self::MissingDependency { .. } => "STRATUM-201",
            Self::DependencyOutputUnavailable { .. } => "STRATUM-202",
            Self::MockOutputNotAllowed { .. } => "STRATUM-203",
            Self::BackendReadError { .. } => "STRATUM-204",
            Self::EngineNotFound => "STRATUM-300",
            Self::EngineExecutionFailed { .. } => "STRATUM-301",
            Self::HookFailed { .. } => "STRATUM-302",
            Self::GenerateBlockFailed { .. } => "STRATUM-303",
            Self::Cancelled => "STRATUM-304",
            Self::StagingFailed { .. } => "STRATUM-305",
            Self::FilterParseError { .. } => "STRATUM-400",
            Self::DiscoveryLimitExceeded { .. } => "STRATUM-401",
            Self::IoError(_) => "STRATUM-900",
            Self::JsonError(_) => "STRATUM-901",
            Self::ConfigError { .. } => "STRATUM-902",
            Self::InternalError { .. } => "STRATUM-903",
        }
    }

    /// Whether a retry rule is even eligible to consider this error (engine
    /// failures only — parse/usage errors are never worth retrying).
    pub fn is_retry_eligible(&self) -> bool {
        matches!(
            self,
            Self::EngineExecutionFailed { .. } | Self::HookFailed { .. } | Self::BackendReadError { .. }
        )
    }
}

impl FixSuggestion for StratumError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            Self::UsageError { .. } => Some("Run with --help to see valid flags"),
            Self::HclParseError { .. } => Some("Check block/attribute syntax against the HCL spec"),
            Self::IncludeNotFound { .. } => {
                Some("Check the include path is relative to the including file")
            }
            Self::DuplicateIncludeLabel { .. } => Some("Use a unique label per include block"),
            Self::UnitConfigNotFound { .. } => {
                Some("Check the working directory contains a unit config file")
            }
            Self::UnknownFunction { .. } => {
                Some("Check the function name against the built-in function table")
            }
            Self::TypeMismatch { .. } => Some("Check the expression's operand types"),
            Self::UndefinedLocal { .. } => Some("Declare the local in a locals block before referencing it"),
            Self::UndefinedInput { .. } => Some("Declare the input or provide a default"),
            Self::InvalidMergeStrategy { .. } => {
                Some("Use one of: no_merge, shallow, deep, deep_map_only")
            }
            Self::RunCmdFailed { .. } => Some("Check the command runs successfully outside stratum"),
            Self::SopsDecryptFailed { .. } => {
                Some("Check the sops binary is on PATH and the file is a valid sops-encrypted document")
            }
            Self::InvalidFeatureFlag { .. } => Some("Check the feature flag type and default value"),
            Self::CycleDetected { .. } => Some("Remove the circular dependency chain shown above"),
            Self::MissingDependency { .. } => Some("Add the missing unit or fix the dependency path"),
            Self::DependencyOutputUnavailable { .. } => {
                Some("Run the dependency first, or set mock_outputs + mock_outputs_allowed_terraform_commands")
            }
            Self::MockOutputNotAllowed { .. } => {
                Some("Add the command to mock_outputs_merge_with_state or mock_outputs_allowed_terraform_commands")
            }
            Self::BackendReadError { .. } => Some("Check remote state backend credentials and reachability"),
            Self::EngineNotFound => Some("Install OpenTofu/Terraform or pass --tf-path"),
            Self::EngineExecutionFailed { .. } => Some("Check the engine's stderr output above"),
            Self::HookFailed { .. } => Some("Check the hook command and its exit code"),
            Self::GenerateBlockFailed { .. } => Some("Check the generate block's template contents"),
            Self::Cancelled => Some("Re-run once the interrupting signal source is resolved"),
            Self::StagingFailed { .. } => Some("Check source path and copy filter globs"),
            Self::FilterParseError { .. } => Some("See `stratum find --help` for filter expression grammar"),
            Self::DiscoveryLimitExceeded { .. } => Some("Pass a higher --max-folders-to-check or narrow --working-dir"),
            Self::IoError(_) => Some("Check file path and permissions"),
            Self::JsonError(_) => Some("Check JSON syntax"),
            Self::ConfigError { .. } => Some("Check ~/.config/stratum/config.toml for syntax errors"),
            Self::InternalError { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_extraction() {
        let err = StratumError::CycleDetected {
            cycle: "a -> b -> a".into(),
        };
        assert_eq!(err.code(), "STRATUM-200");
    }

    #[test]
    fn error_display_includes_code() {
        let err = StratumError::MissingDependency {
            unit: "vpc".into(),
            dep: "network".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("[STRATUM-201]"));
        assert!(msg.contains("vpc"));
    }

    #[test]
    fn retry_eligibility() {
        assert!(StratumError::EngineExecutionFailed {
            unit: "x".into(),
            exit_code: Some(1)
        }
        .is_retry_eligible());
        assert!(!StratumError::CycleDetected { cycle: "x".into() }.is_retry_eligible());
    }

    #[test]
    fn fix_suggestion_present_for_user_errors() {
        let err = StratumError::UnknownFunction { name: "frobnicate".into() };
        assert!(err.fix_suggestion().is_some());
    }
}
