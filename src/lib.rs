//! Stratum - concurrent orchestration core for IaC unit graphs.
//!
//! ## Module layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        DATA MODEL                             │
//! │  value/      Dynamic HCL value (string/number/bool/collection)│
//! │  unit/       Unit, DependencyRef, HookSet, RetryConfig, ...   │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    CONFIGURATION LAYER                       │
//! │  hcl/        Expression evaluator, config loader, functions  │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     ORCHESTRATION LAYER                      │
//! │  discover/   Unit/stack discovery, filter-query parsing      │
//! │  dag/        Dependency graph, cycle detection, levels       │
//! │  resolve/    Dependency output resolution                    │
//! │  runner/     Bounded concurrent runner pool                  │
//! │  exec/       Subprocess driver (engine + hooks)              │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    INFRASTRUCTURE LAYER                       │
//! │  log/        Placeholder-based log formatter presets         │
//! │  telemetry/  OpenTelemetry bridge, TRACEPARENT inheritance    │
//! │  config/     Persistent CLI defaults                         │
//! │  util/       Interning, shared constants                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module responsibilities
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`value`] | Dynamic value type shared by HCL evaluation and unit config |
//! | [`unit`] | The `Unit` data model: includes, dependencies, hooks, retry/ignore |
//! | [`hcl`] | Expression evaluator, config loader, built-in functions |
//! | [`discover`] | Unit/stack discovery walk, filter-query parsing |
//! | [`dag`] | Dependency graph construction, cycle detection, leveling |
//! | [`resolve`] | Dependency output resolution (mocks, remote state, engine) |
//! | [`runner`] | Bounded concurrent runner pool, retry/ignore matching |
//! | [`exec`] | Subprocess driver: engine resolution, staging, hooks |
//! | [`log`] | Placeholder/pipeline log formatter presets |
//! | [`telemetry`] | OpenTelemetry bridge, TRACEPARENT inheritance |
//! | [`config`] | Persistent, non-secret CLI defaults |
//! | [`error`] | Error types with stable codes and fix suggestions |

// ═══════════════════════════════════════════════════════════════
// DATA MODEL
// ═══════════════════════════════════════════════════════════════
pub mod unit;
pub mod value;

// ═══════════════════════════════════════════════════════════════
// CONFIGURATION LAYER - HCL evaluation and loading
// ═══════════════════════════════════════════════════════════════
pub mod hcl;

// ═══════════════════════════════════════════════════════════════
// ORCHESTRATION LAYER
// ═══════════════════════════════════════════════════════════════
pub mod dag;
pub mod discover;
pub mod exec;
pub mod resolve;
pub mod runner;

// ═══════════════════════════════════════════════════════════════
// INFRASTRUCTURE LAYER
// ═══════════════════════════════════════════════════════════════
pub mod log;
pub mod telemetry;
pub mod util;

// ═══════════════════════════════════════════════════════════════
// CROSS-CUTTING - Error handling, configuration
// ═══════════════════════════════════════════════════════════════
pub mod config;
pub mod error;

// ═══════════════════════════════════════════════════════════════
// PUBLIC API RE-EXPORTS
// ═══════════════════════════════════════════════════════════════

pub use error::{FixSuggestion, StratumError};

pub use config::StratumConfig;

pub use value::Value;

pub use unit::{
    Action, DependencyRef, FeatureFlag, Hook, HookPhase, HookSet, IfExistsPolicy, IgnoreRule,
    IncludeRef, MergeStrategy, RemoteStateConfig, RetryConfig, RetryRule, Unit,
};

pub use hcl::{eval, eval_async, load_unit, EvalContext};

pub use dag::{SortMode, UnitGraph};

pub use discover::{discover, parse_filter_query, DiscoveredEntry, DiscoveredKind, FilterToken};

pub use resolve::{resolve_dependency, MockStateReader, StateReader};

pub use runner::{run_all, FailFastMode, RunSummary, UnitState};

pub use exec::{resolve_engine_binary, run_unit_action, ExecOutcome};

pub use log::{Preset, StratumLogLayer};

pub use telemetry::TraceExporter;
