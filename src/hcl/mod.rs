//! HCL-based configuration language: loading, evaluation, built-in functions
//! (spec.md §4.1–§4.2).

pub mod eval;
pub mod functions;
pub mod loader;

pub use eval::{eval, eval_async, EvalContext};
pub use functions::{LocalRunCmdCache, RunCmdCacheMode};
pub use loader::load_unit;
