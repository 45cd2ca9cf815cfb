//! Filters (`value |- function`) and sub-templates (`value :: template`).
//!
//! A filter statement selects target nodes inside the filtered value with
//! a step chain, then replaces each target by the result of a function
//! call or removes it. Mutations go through the selection handles of a
//! private copy of the document arena; the input value is never changed.
//! Targets are processed from the last to the first in document order, so
//! removing an array element never shifts a target still to be visited,
//! and a descendant is rewritten before its ancestor reads it.
//!
//! The function name `remove` detaches the target; an empty name leaves
//! it as it is.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::StreamExt;
use serde_json::Value as Json;
use sieve_interchange::{Expression, FilterComponent, FilterStatement, REMOVE_FUNCTION};

use crate::context::EvaluationContext;
use crate::error::EvalError;
use crate::expression::{evaluate, evaluate_all};
use crate::selection::{Resolved, Selected, Selection};
use crate::steps::{resolve_steps, Resolution};
use crate::stream::{combine_latest, distinct_until_changed, just, switch_map, ValStream};
use crate::value::Val;

/// Apply `filter` to `value`.
pub fn apply_filter(
    value: Val,
    filter: &FilterComponent,
    ctx: &EvaluationContext,
    is_body: bool,
) -> ValStream {
    let statements = match filter {
        FilterComponent::Simple {
            each,
            function,
            arguments,
        } => vec![FilterStatement {
            target: Vec::new(),
            each: *each,
            function: function.clone(),
            arguments: arguments.clone(),
        }],
        FilterComponent::Extended(statements) => statements.clone(),
    };

    let mut current = just(value);
    for statement in statements {
        let ctx = ctx.clone();
        current = switch_map(current, move |v| apply_statement(v, &statement, &ctx, is_body));
    }
    distinct_until_changed(current)
}

fn apply_statement(
    value: Val,
    statement: &FilterStatement,
    ctx: &EvaluationContext,
    is_body: bool,
) -> ValStream {
    match &value {
        Val::Error(_) => return just(value),
        Val::Undefined => {
            return just(Val::Error(EvalError::filter_target(
                "cannot filter an undefined value",
            )))
        }
        Val::Defined(_) => {}
    }

    let targets = resolve_steps(value.clone(), &statement.target, ctx, is_body, &value);
    let statement = statement.clone();
    let ctx = ctx.clone();
    switch_map(targets, move |resolution: Resolution| {
        let statement = statement.clone();
        let ctx_call = ctx.clone();
        evaluate_all(&statement.arguments, &ctx, is_body, &value)
            .map(move |arguments| mutate(resolution.clone(), &statement, &arguments, &ctx_call))
            .boxed()
    })
}

/// Apply one filter statement to an already resolved target set.
fn mutate(
    resolution: Resolution,
    statement: &FilterStatement,
    arguments: &[Val],
    ctx: &EvaluationContext,
) -> Val {
    let mut resolved = match resolution {
        Ok(resolved) => resolved,
        Err(e) => return Val::Error(e),
    };
    if let Some(err) = arguments.iter().find(|a| a.is_error()) {
        return err.clone();
    }
    let targets = match select_targets(&resolved, statement.each) {
        Ok(targets) => targets,
        Err(e) => return Val::Error(e),
    };

    // Deduplicate and order last-to-first.
    let ordered: BTreeMap<usize, Selected> = targets.into_iter().map(|t| (t.node, t)).collect();
    let root = resolved.root;
    let arena = Arc::make_mut(&mut resolved.arena);
    let mut new_root = Some(root);

    for (_, target) in ordered.into_iter().rev() {
        let replacement = if statement.function == REMOVE_FUNCTION {
            None
        } else if statement.function.is_empty() {
            Some(arena.to_json(target.node))
        } else {
            let mut call_args = Vec::with_capacity(arguments.len() + 1);
            call_args.push(Val::of(arena.to_json(target.node)));
            call_args.extend(arguments.iter().cloned());
            match ctx.functions().call(&statement.function, &call_args) {
                Val::Error(e) => return Val::Error(e),
                Val::Undefined => None,
                Val::Defined(json) => Some(json),
            }
        };

        let outcome = match (&target.handle, replacement) {
            (Some(handle), Some(json)) => arena.replace(handle, &json).map(|_| ()),
            (Some(handle), None) => arena.remove(handle),
            (None, Some(json)) => {
                new_root = Some(arena.insert(&json));
                Ok(())
            }
            (None, None) => {
                new_root = if statement.function == REMOVE_FUNCTION {
                    emptied(&arena.to_json(root)).map(|json| arena.insert(&json))
                } else {
                    None
                };
                Ok(())
            }
        };
        if let Err(e) = outcome {
            return Val::Error(e);
        }
    }

    match new_root {
        Some(id) => Val::of(arena.to_json(id)),
        None => Val::Undefined,
    }
}

/// The nodes a statement operates on.
fn select_targets(resolved: &Resolved, each: bool) -> Result<Vec<Selected>, EvalError> {
    match (&resolved.selection, each) {
        (Selection::Nothing, _) => Err(EvalError::filter_target(
            "filter target selects nothing",
        )),
        (Selection::Single(s), false) => Ok(vec![s.clone()]),
        (Selection::Single(s), true) => {
            if resolved.arena.is_array(s.node) {
                Ok(resolved.arena.children(s.node))
            } else {
                Err(EvalError::filter_target(format!(
                    "'each' expects an array, got {}",
                    resolved.arena.kind(s.node)
                )))
            }
        }
        (Selection::Multiple(items), true) => Ok(items.clone()),
        (Selection::Multiple(_), false) => Err(EvalError::filter_target(
            "filter target selects several values; use 'each'",
        )),
    }
}

/// What removing a whole value leaves behind.
fn emptied(value: &Json) -> Option<Json> {
    match value {
        Json::Array(_) => Some(Json::Array(Vec::new())),
        Json::Object(_) => Some(Json::Object(serde_json::Map::new())),
        Json::String(_) => Some(Json::String(String::new())),
        _ => None,
    }
}

/// Evaluate `template` once per element of the array `value`, with `@`
/// bound to the element.
pub fn apply_subtemplate(
    value: Val,
    template: &Expression,
    ctx: &EvaluationContext,
    is_body: bool,
) -> ValStream {
    let items = match value {
        Val::Error(_) => return just(value),
        Val::Defined(Json::Array(items)) => items,
        other => {
            return just(Val::Error(EvalError::type_mismatch(format!(
                "sub-template expects an array, got {}",
                other.kind()
            ))))
        }
    };
    if items.is_empty() {
        return just(Val::of(Json::Array(items)));
    }

    let per_element = items
        .into_iter()
        .map(|item| evaluate(template, ctx, is_body, &Val::of(item)))
        .collect();
    distinct_until_changed(
        combine_latest(per_element)
            .map(|results| {
                let mut out = Vec::with_capacity(results.len());
                for result in results {
                    match result {
                        Val::Defined(json) => out.push(json),
                        Val::Error(e) => return Val::Error(e),
                        Val::Undefined => {
                            return Val::Error(EvalError::UndefinedOperand {
                                message: "sub-template produced an undefined element".to_string(),
                            })
                        }
                    }
                }
                Val::of(Json::Array(out))
            })
            .boxed(),
    )
}
