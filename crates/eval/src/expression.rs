//! Streaming expression evaluator.
//!
//! [`evaluate`] turns an expression into a stream of values. Operands are
//! merged with `combine_latest`, so an operand that emits again (because it
//! depends on a live attribute) recomputes the enclosing expression.
//! Boolean `&&`/`||` and the conditional subscribe to their right-hand side
//! lazily; a branch that is not taken is never evaluated.
//!
//! The `is_body` flag is threaded through every call: attribute finder
//! steps are only permitted in body context. `relative` is the value `@`
//! refers to inside condition steps, filters and sub-templates.

use std::cmp::Ordering;

use futures::stream::{BoxStream, StreamExt};
use regex::Regex;
use serde_json::Value as Json;
use sieve_interchange::{BasicExpression, BasicHead, BinaryOperator, Expression, UnaryOperator};

use crate::context::EvaluationContext;
use crate::error::EvalError;
use crate::filter::{apply_filter, apply_subtemplate};
use crate::numeric;
use crate::steps::select_value;
use crate::stream::{combine_latest, distinct_until_changed, just, switch_map, ValStream};
use crate::value::{self, Val};

/// Evaluate `expr` to a stream of values.
pub fn evaluate(
    expr: &Expression,
    ctx: &EvaluationContext,
    is_body: bool,
    relative: &Val,
) -> ValStream {
    match expr {
        Expression::Basic(basic) => evaluate_basic(basic, ctx, is_body, relative),
        Expression::Binary {
            operator: op @ (BinaryOperator::And | BinaryOperator::Or),
            left,
            right,
        } => evaluate_lazy_boolean(*op, left, right, ctx, is_body, relative),
        Expression::Binary {
            operator,
            left,
            right,
        } => {
            let op = *operator;
            let operands = combine_latest(vec![
                evaluate(left, ctx, is_body, relative),
                evaluate(right, ctx, is_body, relative),
            ]);
            distinct_until_changed(
                operands
                    .map(move |values| apply_binary(op, &values[0], &values[1]))
                    .boxed(),
            )
        }
        Expression::Unary { operator, operand } => {
            let op = *operator;
            distinct_until_changed(
                evaluate(operand, ctx, is_body, relative)
                    .map(move |v| apply_unary(op, v))
                    .boxed(),
            )
        }
        Expression::Conditional {
            condition,
            then,
            otherwise,
        } => {
            let then = (**then).clone();
            let otherwise = (**otherwise).clone();
            let ctx = ctx.clone();
            let rel = relative.clone();
            switch_map(
                evaluate(condition, &ctx, is_body, relative),
                move |c| match c {
                    Val::Defined(Json::Bool(true)) => evaluate(&then, &ctx, is_body, &rel),
                    Val::Defined(Json::Bool(false)) => evaluate(&otherwise, &ctx, is_body, &rel),
                    Val::Error(_) | Val::Undefined => just(c),
                    other => just(Val::Error(EvalError::type_mismatch(format!(
                        "conditional expects a boolean condition, got {}",
                        other.kind()
                    )))),
                },
            )
        }
    }
}

/// Evaluate every expression and emit the latest values together.
pub fn evaluate_all(
    exprs: &[Expression],
    ctx: &EvaluationContext,
    is_body: bool,
    relative: &Val,
) -> BoxStream<'static, Vec<Val>> {
    combine_latest(
        exprs
            .iter()
            .map(|e| evaluate(e, ctx, is_body, relative))
            .collect(),
    )
}

// ── Basic expressions ───────────────────────────────────────────────

fn evaluate_basic(
    basic: &BasicExpression,
    ctx: &EvaluationContext,
    is_body: bool,
    relative: &Val,
) -> ValStream {
    let head = evaluate_head(&basic.head, ctx, is_body, relative);

    let selected = if basic.steps.is_empty() {
        head
    } else {
        let steps = basic.steps.clone();
        let ctx = ctx.clone();
        let rel = relative.clone();
        switch_map(head, move |v| select_value(v, &steps, &ctx, is_body, &rel))
    };

    if let Some(filter) = &basic.filter {
        let filter = filter.clone();
        let ctx = ctx.clone();
        switch_map(selected, move |v| apply_filter(v, &filter, &ctx, is_body))
    } else if let Some(template) = &basic.subtemplate {
        let template = (**template).clone();
        let ctx = ctx.clone();
        switch_map(selected, move |v| apply_subtemplate(v, &template, &ctx, is_body))
    } else {
        selected
    }
}

fn evaluate_head(
    head: &BasicHead,
    ctx: &EvaluationContext,
    is_body: bool,
    relative: &Val,
) -> ValStream {
    match head {
        BasicHead::Literal(v) => just(Val::of(v.clone())),
        BasicHead::Group(inner) => evaluate(inner, ctx, is_body, relative),
        BasicHead::Identifier(name) => just(ctx.variable(name)),
        BasicHead::Relative => just(relative.clone()),
        BasicHead::Function { name, arguments } => {
            let name = name.clone();
            let ctx_call = ctx.clone();
            distinct_until_changed(
                evaluate_all(arguments, ctx, is_body, relative)
                    .map(move |args| match first_error(&args) {
                        Some(err) => err,
                        None => ctx_call.functions().call(&name, &args),
                    })
                    .boxed(),
            )
        }
        BasicHead::Array(items) => evaluate_all(items, ctx, is_body, relative)
            .map(|values| {
                if let Some(err) = first_error(&values) {
                    return err;
                }
                Val::of(Json::Array(
                    values.into_iter().filter_map(Val::into_json).collect(),
                ))
            })
            .boxed(),
        BasicHead::Object(members) => {
            let keys: Vec<String> = members.iter().map(|(k, _)| k.clone()).collect();
            let exprs: Vec<Expression> = members.iter().map(|(_, e)| e.clone()).collect();
            evaluate_all(&exprs, ctx, is_body, relative)
                .map(move |values| {
                    if let Some(err) = first_error(&values) {
                        return err;
                    }
                    let object: serde_json::Map<String, Json> = keys
                        .iter()
                        .cloned()
                        .zip(values)
                        .filter_map(|(k, v)| v.into_json().map(|json| (k, json)))
                        .collect();
                    Val::of(Json::Object(object))
                })
                .boxed()
        }
    }
}

fn first_error(values: &[Val]) -> Option<Val> {
    values.iter().find(|v| v.is_error()).cloned()
}

// ── Operators ───────────────────────────────────────────────────────

/// `&&` and `||`: the right operand is only subscribed when the left one
/// does not decide the result.
fn evaluate_lazy_boolean(
    op: BinaryOperator,
    left: &Expression,
    right: &Expression,
    ctx: &EvaluationContext,
    is_body: bool,
    relative: &Val,
) -> ValStream {
    let right = right.clone();
    let ctx_right = ctx.clone();
    let rel = relative.clone();
    let decided = op == BinaryOperator::Or;
    let combined = switch_map(evaluate(left, ctx, is_body, relative), move |l| {
        match l {
            Val::Error(_) | Val::Undefined => just(l),
            Val::Defined(Json::Bool(b)) if b == decided => just(Val::from(b)),
            Val::Defined(Json::Bool(_)) => evaluate(&right, &ctx_right, is_body, &rel)
                .map(move |r| match r {
                    Val::Defined(Json::Bool(_)) | Val::Undefined | Val::Error(_) => r,
                    other => Val::Error(operand_mismatch(op, "boolean", &other)),
                })
                .boxed(),
            other => just(Val::Error(operand_mismatch(op, "boolean", &other))),
        }
    });
    distinct_until_changed(combined)
}

fn operand_mismatch(op: BinaryOperator, expected: &str, got: &Val) -> EvalError {
    EvalError::type_mismatch(format!(
        "'{}' expects {} operands, got {}",
        op.symbol(),
        expected,
        got.kind()
    ))
}

/// Apply a non-lazy binary operator to two evaluated operands.
pub fn apply_binary(op: BinaryOperator, left: &Val, right: &Val) -> Val {
    if matches!(op, BinaryOperator::Eq | BinaryOperator::Ne) {
        return equality(op, left, right);
    }
    let (l, r) = match (left, right) {
        (Val::Error(_), _) => return left.clone(),
        (_, Val::Error(_)) => return right.clone(),
        (Val::Undefined, _) | (_, Val::Undefined) => return Val::Undefined,
        (Val::Defined(l), Val::Defined(r)) => (l, r),
    };

    match op {
        BinaryOperator::And | BinaryOperator::Or | BinaryOperator::Xor => {
            match (l.as_bool(), r.as_bool()) {
                (Some(a), Some(b)) => Val::from(match op {
                    BinaryOperator::And => a && b,
                    BinaryOperator::Or => a || b,
                    _ => a ^ b,
                }),
                _ => Val::Error(mismatch_pair(op, l, r)),
            }
        }
        BinaryOperator::Lt | BinaryOperator::Le | BinaryOperator::Gt | BinaryOperator::Ge => {
            match compare(l, r) {
                Some(ordering) => Val::from(match op {
                    BinaryOperator::Lt => ordering == Ordering::Less,
                    BinaryOperator::Le => ordering != Ordering::Greater,
                    BinaryOperator::Gt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                }),
                None => Val::Error(mismatch_pair(op, l, r)),
            }
        }
        BinaryOperator::Regex => match (l, r) {
            (Json::String(text), Json::String(pattern)) => {
                match Regex::new(&format!("^(?:{})$", pattern)) {
                    Ok(re) => Val::from(re.is_match(text)),
                    Err(e) => Val::Error(EvalError::type_mismatch(format!(
                        "invalid regular expression '{}': {}",
                        pattern, e
                    ))),
                }
            }
            _ => Val::Error(mismatch_pair(op, l, r)),
        },
        BinaryOperator::In => match r {
            Json::Array(items) => Val::from(items.iter().any(|item| value::json_equals(l, item))),
            _ => Val::Error(EvalError::type_mismatch(format!(
                "'in' expects an array on the right, got {}",
                value::json_kind(r)
            ))),
        },
        BinaryOperator::Add => match (l, r) {
            (Json::Number(a), Json::Number(b)) => numeric_op(op, a, b),
            (Json::String(_), _) | (_, Json::String(_)) => {
                Val::of(format!("{}{}", value::render(l), value::render(r)))
            }
            _ => Val::Error(mismatch_pair(op, l, r)),
        },
        BinaryOperator::Sub | BinaryOperator::Mul | BinaryOperator::Div | BinaryOperator::Mod => {
            match (l, r) {
                (Json::Number(a), Json::Number(b)) => numeric_op(op, a, b),
                _ => Val::Error(mismatch_pair(op, l, r)),
            }
        }
        BinaryOperator::Eq | BinaryOperator::Ne => equality(op, left, right),
    }
}

/// `==` and `!=` are defined for undefined operands.
fn equality(op: BinaryOperator, left: &Val, right: &Val) -> Val {
    if op == BinaryOperator::Eq {
        value::equals(left, right)
    } else {
        value::not_equals(left, right)
    }
}

fn numeric_op(op: BinaryOperator, a: &serde_json::Number, b: &serde_json::Number) -> Val {
    let result = numeric::to_decimal(a)
        .and_then(|a| numeric::to_decimal(b).map(|b| (a, b)))
        .and_then(|(a, b)| numeric::arithmetic(op, a, b))
        .and_then(numeric::from_decimal);
    Val::from(result)
}

/// Order two defined values: numbers by decimal value, strings
/// lexicographically. Other pairs have no order.
fn compare(l: &Json, r: &Json) -> Option<Ordering> {
    match (l, r) {
        (Json::Number(a), Json::Number(b)) => {
            let a = numeric::to_decimal(a).ok()?;
            let b = numeric::to_decimal(b).ok()?;
            Some(numeric::compare(a, b))
        }
        (Json::String(a), Json::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn mismatch_pair(op: BinaryOperator, l: &Json, r: &Json) -> EvalError {
    EvalError::type_mismatch(format!(
        "'{}' cannot be applied to {} and {}",
        op.symbol(),
        value::json_kind(l),
        value::json_kind(r)
    ))
}

fn apply_unary(op: UnaryOperator, operand: Val) -> Val {
    let v = match operand {
        Val::Defined(v) => v,
        other => return other,
    };
    match (op, &v) {
        (UnaryOperator::Not, Json::Bool(b)) => Val::from(!b),
        (UnaryOperator::Neg, Json::Number(n)) => Val::from(
            numeric::to_decimal(n)
                .map(numeric::negate)
                .and_then(numeric::from_decimal),
        ),
        (UnaryOperator::Not, other) => Val::Error(EvalError::type_mismatch(format!(
            "'!' expects a boolean, got {}",
            value::json_kind(other)
        ))),
        (UnaryOperator::Neg, other) => Val::Error(EvalError::type_mismatch(format!(
            "'-' expects a number, got {}",
            value::json_kind(other)
        ))),
    }
}
