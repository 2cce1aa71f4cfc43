//! Expression evaluator with lazy/short-circuit conditionals (spec.md §4.1).
//!
//! Conditional expressions only evaluate the selected branch when the
//! condition is a known, unmarked boolean. Container expressions recurse
//! with the same lazy rule so nested conditionals short-circuit too.
//! Function-call arguments are evaluated lazily and substituted as literal
//! AST nodes before dispatch, except `try`/`can` which need the raw AST
//! (Open Question: use original AST, never re-evaluate-then-substitute).

use hcl::expr::{BinaryOperator, Conditional, Expression, FuncCall, ObjectKey, Operation, UnaryOperator};
use rustc_hash::FxHashMap;

use crate::error::{Result, StratumError};
use crate::hcl::functions::{self, LocalRunCmdCache, RunCmdCacheMode};
use crate::value::Value;

/// Functions whose arguments must be passed as raw AST rather than
/// pre-evaluated values, because they decode success/failure of evaluation
/// itself (`try`, `can`).
const CUSTOM_ARG_DECODER_FUNCTIONS: &[&str] = &["try", "can"];

/// Per-unit evaluation state: locals/inputs already resolved, plus the
/// per-evaluation `run_cmd` cache (spec.md §4.1's "per-evaluation" tier).
pub struct EvalContext<'a> {
    pub locals: &'a FxHashMap<String, Value>,
    pub inputs: &'a FxHashMap<String, Value>,
    pub run_cmd_cache: LocalRunCmdCache,
    pub run_cmd_mode: RunCmdCacheMode,
}

impl<'a> EvalContext<'a> {
    pub fn new(locals: &'a FxHashMap<String, Value>, inputs: &'a FxHashMap<String, Value>) -> Self {
        Self {
            locals,
            inputs,
            run_cmd_cache: LocalRunCmdCache::new(),
            run_cmd_mode: RunCmdCacheMode::PerEvaluation,
        }
    }

    fn lookup(&self, path: &str) -> Option<&Value> {
        self.locals.get(path).or_else(|| self.inputs.get(path))
    }
}

/// Synchronous entry point. `run_cmd`/`sops_decrypt_file` are async, so
/// async expressions are evaluated through [`eval_async`] instead; this
/// path is for locals/inputs that are statically known not to touch them
/// (e.g. `hcl validate`/`hcl format`, which never execute side effects).
pub fn eval(expr: &Expression, ctx: &EvalContext<'_>) -> Result<Value> {
    match expr {
        Expression::Null => Ok(Value::Null),
        Expression::Bool(b) => Ok(Value::Bool(*b)),
        Expression::Number(n) => Ok(Value::Number(n.as_f64())),
        Expression::String(s) => Ok(Value::String(s.clone())),

        Expression::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, ctx)?);
            }
            Ok(Value::Tuple(out))
        }

        Expression::Object(obj) => {
            let mut out = FxHashMap::default();
            for (k, v) in obj.iter() {
                let key = object_key(k, ctx)?;
                out.insert(key, eval(v, ctx)?);
            }
            Ok(Value::Object(out))
        }

        Expression::Parenthesis(inner) => eval(inner, ctx),

        Expression::TemplateExpr(tmpl) => eval_template(tmpl, ctx),

        Expression::Variable(var) => ctx.lookup(var.as_str()).cloned().ok_or_else(|| {
            StratumError::UndefinedLocal {
                name: var.as_str().to_string(),
            }
        }),

        Expression::Traversal(trav) => {
            // `local.foo`, `dependency.x.outputs.y`, etc. Only the simple
            // dotted-path case is resolved here; richer traversal (splat,
            // index) falls through to a type-mismatch error surfaced at
            // the call site with the original expression's source text.
            let mut path = String::new();
            match &trav.expr {
                Expression::Variable(v) => path.push_str(v.as_str()),
                other => {
                    return Err(StratumError::TypeMismatch {
                        expr: format!("{other:?}"),
                        expected: "variable root for traversal".into(),
                        actual: "complex expression".into(),
                    })
                }
            }
            for op in &trav.operators {
                if let hcl::expr::TraversalOperator::GetAttr(ident) = op {
                    path.push('.');
                    path.push_str(ident.as_str());
                } else {
                    return Err(StratumError::TypeMismatch {
                        expr: path,
                        expected: "attribute traversal".into(),
                        actual: "index/splat traversal".into(),
                    });
                }
            }
            ctx.lookup(&path)
                .cloned()
                .ok_or(StratumError::UndefinedLocal { name: path })
        }

        Expression::Conditional(cond) => eval_conditional(cond, ctx),

        Expression::Operation(op) => eval_operation(op, ctx),

        Expression::FuncCall(call) => eval_func_call_sync(call, ctx),

        Expression::ForExpr(_) => Err(StratumError::TypeMismatch {
            expr: "for-expression".into(),
            expected: "a value".into(),
            actual: "for-expressions require async evaluation".into(),
        }),

        Expression::Raw(raw) => Ok(Value::String(raw.to_string())),
    }
}

/// Async entry point: identical recursion, but function calls may execute
/// `run_cmd`/`sops_decrypt_file`. This is the path the config loader uses.
pub async fn eval_async(expr: &Expression, ctx: &mut EvalContext<'_>) -> Result<Value> {
    match expr {
        Expression::Conditional(cond) => {
            let cond_val = Box::pin(eval_async(&cond.cond_expr, ctx)).await?;
            if is_known_unmarked_bool(&cond_val) {
                if cond_val.is_truthy() {
                    Box::pin(eval_async(&cond.true_expr, ctx)).await
                } else {
                    Box::pin(eval_async(&cond.false_expr, ctx)).await
                }
            } else {
                // Eager fallback: both branches evaluated, condition kept
                // as-is to avoid double-evaluating its own side effects.
                let true_val = Box::pin(eval_async(&cond.true_expr, ctx)).await?;
                let false_val = Box::pin(eval_async(&cond.false_expr, ctx)).await?;
                Ok(if cond_val.is_truthy() { true_val } else { false_val })
            }
        }

        Expression::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(Box::pin(eval_async(item, ctx)).await?);
            }
            Ok(Value::Tuple(out))
        }

        Expression::Object(obj) => {
            let mut out = FxHashMap::default();
            for (k, v) in obj.iter() {
                let key = object_key(k, ctx)?;
                out.insert(key, Box::pin(eval_async(v, ctx)).await?);
            }
            Ok(Value::Object(out))
        }

        Expression::Parenthesis(inner) => Box::pin(eval_async(inner, ctx)).await,

        Expression::TemplateExpr(tmpl) => eval_template_async(tmpl, ctx).await,

        Expression::FuncCall(call) => eval_func_call_async(call, ctx).await,

        Expression::ForExpr(_) => Err(StratumError::TypeMismatch {
            expr: "for-expression".into(),
            expected: "a value".into(),
            actual: "for-expressions are not supported by this evaluator".into(),
        }),

        // Everything else has no async side effects to recurse through.
        other => eval(other, ctx),
    }
}

fn is_known_unmarked_bool(v: &Value) -> bool {
    !matches!(v, Value::Marked(..)) && !v.is_unknown() && matches!(v, Value::Bool(_))
}

fn eval_conditional(cond: &Conditional, ctx: &EvalContext<'_>) -> Result<Value> {
    let cond_val = eval(&cond.cond_expr, ctx)?;
    if is_known_unmarked_bool(&cond_val) {
        if cond_val.is_truthy() {
            eval(&cond.true_expr, ctx)
        } else {
            eval(&cond.false_expr, ctx)
        }
    } else {
        let true_val = eval(&cond.true_expr, ctx)?;
        let false_val = eval(&cond.false_expr, ctx)?;
        Ok(if cond_val.is_truthy() { true_val } else { false_val })
    }
}

fn object_key(key: &ObjectKey, ctx: &EvalContext<'_>) -> Result<String> {
    match key {
        ObjectKey::Identifier(ident) => Ok(ident.to_string()),
        ObjectKey::Expression(expr) => match eval(expr, ctx)? {
            Value::String(s) => Ok(s),
            other => Ok(other.to_string()),
        },
        _ => Err(StratumError::TypeMismatch {
            expr: "object key".into(),
            expected: "identifier or string".into(),
            actual: "unsupported key kind".into(),
        }),
    }
}

fn eval_template(tmpl: &hcl::expr::TemplateExpr, ctx: &EvalContext<'_>) -> Result<Value> {
    let template = tmpl
        .parse()
        .map_err(|e| StratumError::HclParseError {
            path: "<template>".into(),
            details: e.to_string(),
        })?;
    let mut out = String::new();
    for element in template.elements() {
        match element {
            hcl::template::Element::Literal(lit) => out.push_str(lit),
            hcl::template::Element::Interpolation(interp) => {
                out.push_str(&eval(&interp.expr, ctx)?.to_string());
            }
            hcl::template::Element::Directive(_) => {
                return Err(StratumError::TypeMismatch {
                    expr: "template directive".into(),
                    expected: "plain interpolation".into(),
                    actual: "if/for template directive".into(),
                });
            }
        }
    }
    Ok(Value::String(out))
}

async fn eval_template_async(tmpl: &hcl::expr::TemplateExpr, ctx: &mut EvalContext<'_>) -> Result<Value> {
    let template = tmpl
        .parse()
        .map_err(|e| StratumError::HclParseError {
            path: "<template>".into(),
            details: e.to_string(),
        })?;
    let mut out = String::new();
    for element in template.elements() {
        match element {
            hcl::template::Element::Literal(lit) => out.push_str(lit),
            hcl::template::Element::Interpolation(interp) => {
                let v = Box::pin(eval_async(&interp.expr, ctx)).await?;
                out.push_str(&v.to_string());
            }
            hcl::template::Element::Directive(_) => {
                return Err(StratumError::TypeMismatch {
                    expr: "template directive".into(),
                    expected: "plain interpolation".into(),
                    actual: "if/for template directive".into(),
                });
            }
        }
    }
    Ok(Value::String(out))
}

fn eval_func_call_sync(call: &FuncCall, ctx: &EvalContext<'_>) -> Result<Value> {
    let name = call.name.as_str();
    if CUSTOM_ARG_DECODER_FUNCTIONS.contains(&name) {
        return eval_custom_arg_decoder(name, call, ctx);
    }

    let mut args = Vec::with_capacity(call.args.len());
    for arg in &call.args {
        args.push(eval(arg, ctx)?);
    }
    dispatch_pure(name, &args)
}

async fn eval_func_call_async(call: &FuncCall, ctx: &mut EvalContext<'_>) -> Result<Value> {
    let name = call.name.as_str();
    if CUSTOM_ARG_DECODER_FUNCTIONS.contains(&name) {
        return eval_custom_arg_decoder_async(name, call, ctx).await;
    }

    let mut args = Vec::with_capacity(call.args.len());
    for arg in &call.args {
        args.push(Box::pin(eval_async(arg, ctx)).await?);
    }
    dispatch(name, &args, ctx).await
}

/// `try`/`can` see the raw, unevaluated argument AST (custom-arg-decoder
/// contract) so they can catch the evaluation error itself rather than
/// receiving an already-failed substitution.
fn eval_custom_arg_decoder(name: &str, call: &FuncCall, ctx: &EvalContext<'_>) -> Result<Value> {
    match name {
        "can" => {
            let Some(arg) = call.args.first() else {
                return Err(StratumError::TypeMismatch {
                    expr: "can(...)".into(),
                    expected: "one argument".into(),
                    actual: "no arguments".into(),
                });
            };
            Ok(Value::Bool(eval(arg, ctx).is_ok()))
        }
        "try" => {
            for arg in &call.args {
                if let Ok(v) = eval(arg, ctx) {
                    return Ok(v);
                }
            }
            Err(StratumError::TypeMismatch {
                expr: "try(...)".into(),
                expected: "at least one evaluable argument".into(),
                actual: "all arguments failed to evaluate".into(),
            })
        }
        _ => unreachable!("checked by CUSTOM_ARG_DECODER_FUNCTIONS"),
    }
}

async fn eval_custom_arg_decoder_async(
    name: &str,
    call: &FuncCall,
    ctx: &mut EvalContext<'_>,
) -> Result<Value> {
    match name {
        "can" => {
            let Some(arg) = call.args.first() else {
                return Err(StratumError::TypeMismatch {
                    expr: "can(...)".into(),
                    expected: "one argument".into(),
                    actual: "no arguments".into(),
                });
            };
            Ok(Value::Bool(Box::pin(eval_async(arg, ctx)).await.is_ok()))
        }
        "try" => {
            for arg in &call.args {
                if let Ok(v) = Box::pin(eval_async(arg, ctx)).await {
                    return Ok(v);
                }
            }
            Err(StratumError::TypeMismatch {
                expr: "try(...)".into(),
                expected: "at least one evaluable argument".into(),
                actual: "all arguments failed to evaluate".into(),
            })
        }
        _ => unreachable!("checked by CUSTOM_ARG_DECODER_FUNCTIONS"),
    }
}

/// Functions with no side effects, usable from the synchronous path.
fn dispatch_pure(name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "jsondecode" => {
            let s = expect_string(name, args, 0)?;
            functions::jsondecode(s)
        }
        "get_env" => {
            let name_arg = expect_string("get_env", args, 0)?;
            let default = args.get(1).and_then(Value::as_str);
            functions::get_env(name_arg, default)
        }
        "get_platform" => Ok(Value::String(functions::get_platform().to_string())),
        "timestamp" => Ok(functions::timestamp()),
        "uuid" => Ok(functions::uuid()),
        "get_terraform_commands_that_need_vars" => Ok(Value::Tuple(
            functions::get_terraform_commands_that_need_vars()
                .iter()
                .map(|s| Value::String((*s).to_string()))
                .collect(),
        )),
        _ => Err(StratumError::UnknownFunction { name: name.to_string() }),
    }
}

/// Full dispatch table, including `run_cmd`/`sops_decrypt_file` which need
/// the async runtime and the evaluation context's cache.
async fn dispatch(name: &str, args: &[Value], ctx: &mut EvalContext<'_>) -> Result<Value> {
    match name {
        "run_cmd" => {
            let argv: Vec<String> = args
                .iter()
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .collect();
            functions::run_cmd(".", &argv, ctx.run_cmd_mode, false, &mut ctx.run_cmd_cache).await
        }
        "sops_decrypt_file" => {
            let path = expect_string("sops_decrypt_file", args, 0)?;
            functions::sops_decrypt_file(path).await
        }
        _ => dispatch_pure(name, args),
    }
}

fn expect_string<'a>(fn_name: &str, args: &'a [Value], idx: usize) -> Result<&'a str> {
    args.get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| StratumError::TypeMismatch {
            expr: format!("{fn_name}(...)"),
            expected: "string".into(),
            actual: args.get(idx).map(Value::type_name).unwrap_or("missing").to_string(),
        })
}

fn eval_operation(op: &Operation, ctx: &EvalContext<'_>) -> Result<Value> {
    match op {
        Operation::Unary(u) => {
            let v = eval(&u.expr, ctx)?;
            match u.operator {
                UnaryOperator::Not => Ok(Value::Bool(!v.is_truthy())),
                UnaryOperator::Neg => match v.unwrap_marks() {
                    Value::Number(n) => Ok(Value::Number(-n)),
                    other => Err(StratumError::TypeMismatch {
                        expr: "-expr".into(),
                        expected: "number".into(),
                        actual: other.type_name().into(),
                    }),
                },
            }
        }
        Operation::Binary(b) => {
            let lhs = eval(&b.lhs_expr, ctx)?;
            // `&&`/`||` short-circuit like any other lazy conditional.
            match b.operator {
                BinaryOperator::And if !lhs.is_truthy() => return Ok(Value::Bool(false)),
                BinaryOperator::Or if lhs.is_truthy() => return Ok(Value::Bool(true)),
                _ => {}
            }
            let rhs = eval(&b.rhs_expr, ctx)?;
            binary_op(b.operator, &lhs, &rhs)
        }
    }
}

fn binary_op(op: BinaryOperator, lhs: &Value, rhs: &Value) -> Result<Value> {
    use BinaryOperator::*;
    let as_nums = || -> Result<(f64, f64)> {
        match (lhs.unwrap_marks(), rhs.unwrap_marks()) {
            (Value::Number(a), Value::Number(b)) => Ok((*a, *b)),
            _ => Err(StratumError::TypeMismatch {
                expr: "binary operation".into(),
                expected: "number".into(),
                actual: format!("{}, {}", lhs.type_name(), rhs.type_name()),
            }),
        }
    };
    match op {
        And => Ok(Value::Bool(lhs.is_truthy() && rhs.is_truthy())),
        Or => Ok(Value::Bool(lhs.is_truthy() || rhs.is_truthy())),
        Eq => Ok(Value::Bool(lhs.unwrap_marks() == rhs.unwrap_marks())),
        NotEq => Ok(Value::Bool(lhs.unwrap_marks() != rhs.unwrap_marks())),
        Plus => {
            if let (Value::String(a), Value::String(b)) = (lhs.unwrap_marks(), rhs.unwrap_marks()) {
                return Ok(Value::String(format!("{a}{b}")));
            }
            let (a, b) = as_nums()?;
            Ok(Value::Number(a + b))
        }
        Minus => Ok(Value::Number(as_nums()?.0 - as_nums()?.1)),
        Mul => Ok(Value::Number(as_nums()?.0 * as_nums()?.1)),
        Div => Ok(Value::Number(as_nums()?.0 / as_nums()?.1)),
        Mod => Ok(Value::Number(as_nums()?.0 % as_nums()?.1)),
        Less => Ok(Value::Bool(as_nums()?.0 < as_nums()?.1)),
        LessEq => Ok(Value::Bool(as_nums()?.0 <= as_nums()?.1)),
        Greater => Ok(Value::Bool(as_nums()?.0 > as_nums()?.1)),
        GreaterEq => Ok(Value::Bool(as_nums()?.0 >= as_nums()?.1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_ctx<'a>(
        locals: &'a FxHashMap<String, Value>,
        inputs: &'a FxHashMap<String, Value>,
    ) -> EvalContext<'a> {
        EvalContext::new(locals, inputs)
    }

    #[test]
    fn short_circuits_unselected_literal_branch() {
        let locals = FxHashMap::default();
        let inputs = FxHashMap::default();
        let ctx = empty_ctx(&locals, &inputs);
        let expr: Expression = "true ? 1 : 2".parse().unwrap();
        assert_eq!(eval(&expr, &ctx).unwrap(), Value::Number(1.0));
    }

    #[tokio::test]
    async fn lazy_run_cmd_never_spawns_unselected_branch() {
        let locals = FxHashMap::default();
        let inputs = FxHashMap::default();
        let mut ctx = EvalContext::new(&locals, &inputs);
        let expr: Expression = r#"true ? "A" : run_cmd("false")"#.parse().unwrap();
        let v = eval_async(&expr, &mut ctx).await.unwrap();
        assert_eq!(v.as_str(), Some("A"));
    }

    #[test]
    fn and_short_circuits_on_false() {
        let locals = FxHashMap::default();
        let inputs = FxHashMap::default();
        let ctx = empty_ctx(&locals, &inputs);
        let expr: Expression = "false && true".parse().unwrap();
        assert_eq!(eval(&expr, &ctx).unwrap(), Value::Bool(false));
    }

    #[test]
    fn variable_lookup_resolves_locals() {
        let mut locals = FxHashMap::default();
        locals.insert("region".to_string(), Value::String("us-east-1".into()));
        let inputs = FxHashMap::default();
        let ctx = empty_ctx(&locals, &inputs);
        let expr: Expression = "region".parse().unwrap();
        assert_eq!(eval(&expr, &ctx).unwrap().as_str(), Some("us-east-1"));
    }

    #[test]
    fn can_reports_evaluation_failure_without_propagating_it() {
        let locals = FxHashMap::default();
        let inputs = FxHashMap::default();
        let ctx = empty_ctx(&locals, &inputs);
        let expr: Expression = "can(undefined_local)".parse().unwrap();
        assert_eq!(eval(&expr, &ctx).unwrap(), Value::Bool(false));
    }
}
