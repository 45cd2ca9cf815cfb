//! Step resolution.
//!
//! A step chain is applied left to right to a [`Resolved`] selection.
//! Purely structural steps are resolved synchronously by
//! [`apply_structural`]; steps that evaluate sub-expressions (computed
//! keys, conditions) or subscribe to attribute finders produce a stream,
//! and the chain is stitched together with `switch_map` so a new upstream
//! value cancels the work started for the previous one.
//!
//! Key-like steps fail softly (no result) on a missing key or a non-object;
//! index-like steps on a non-array are a type mismatch.

use futures::stream::{BoxStream, StreamExt};
use sieve_interchange::{Expression, Step};

use crate::context::EvaluationContext;
use crate::error::EvalError;
use crate::expression::{evaluate, evaluate_all};
use crate::selection::{normalize_index, Arena, NodeId, Resolved, Selected, Selection};
use crate::stream::{combine_latest, just, switch_map};
use crate::value::Val;

pub type Resolution = Result<Resolved, EvalError>;

/// Resolve `steps` against `base`, emitting a new resolution whenever a
/// streaming step produces a new value.
pub fn resolve_steps(
    base: Val,
    steps: &[Step],
    ctx: &EvaluationContext,
    is_body: bool,
    relative: &Val,
) -> BoxStream<'static, Resolution> {
    if let Val::Error(e) = base {
        return just(Err(e));
    }
    let mut current = just(Ok(Resolved::from_val(&base)));
    for step in steps {
        let step = step.clone();
        let ctx = ctx.clone();
        let relative = relative.clone();
        current = switch_map(current, move |resolution| match resolution {
            Ok(resolved) => apply_step(&step, resolved, &ctx, is_body, &relative),
            Err(e) => just(Err(e)),
        });
    }
    current
}

/// Resolve `steps` and collapse the selection to a value.
pub fn select_value(
    base: Val,
    steps: &[Step],
    ctx: &EvaluationContext,
    is_body: bool,
    relative: &Val,
) -> BoxStream<'static, Val> {
    resolve_steps(base, steps, ctx, is_body, relative)
        .map(|resolution| match resolution {
            Ok(resolved) => resolved.value(),
            Err(e) => Val::Error(e),
        })
        .boxed()
}

fn apply_step(
    step: &Step,
    input: Resolved,
    ctx: &EvaluationContext,
    is_body: bool,
    relative: &Val,
) -> BoxStream<'static, Resolution> {
    match step {
        Step::AttributeFinder { name, arguments } => {
            attribute_step(name, arguments, input, ctx, is_body, relative)
        }
        _ if input.selection == Selection::Nothing => just(Ok(input)),
        Step::Expression(expr) => expression_step(expr, input, ctx, is_body),
        Step::Condition(expr) => condition_step(expr, input, ctx, is_body),
        structural => just(apply_structural(structural, input)),
    }
}

// ── Structural steps ────────────────────────────────────────────────

/// Apply a step that needs no evaluation.
///
/// Expression, condition and attribute finder steps are rejected here;
/// they go through [`resolve_steps`].
pub fn apply_structural(step: &Step, input: Resolved) -> Resolution {
    let arena = input.arena.clone();
    let selection = match (&input.selection, step) {
        (Selection::Nothing, _) => Selection::Nothing,

        (Selection::Single(s), Step::Key(key)) => match arena.member(s.node, key) {
            Some(child) => Selection::Single(child),
            None => Selection::Nothing,
        },
        (Selection::Multiple(items), Step::Key(key)) => Selection::Multiple(
            items
                .iter()
                .filter_map(|s| arena.member(s.node, key))
                .collect(),
        ),

        (Selection::Single(s), Step::Index(i)) => Selection::Single(arena.element(s.node, *i)?),
        (Selection::Multiple(items), Step::Index(i)) => {
            let idx = normalize_index(*i, items.len()).ok_or(EvalError::IndexOutOfRange {
                index: *i,
                len: items.len(),
            })?;
            Selection::Single(items[idx].clone())
        }

        (Selection::Single(s), Step::Wildcard) => {
            if arena.is_array(s.node) || arena.is_object(s.node) {
                Selection::Multiple(arena.children(s.node))
            } else {
                return Err(mismatch("wildcard", &arena, s.node));
            }
        }
        (Selection::Multiple(_), Step::Wildcard) => input.selection.clone(),

        (Selection::Single(s), Step::Slice { from, to, step }) => {
            if !arena.is_array(s.node) {
                return Err(mismatch("slice", &arena, s.node));
            }
            let children = arena.children(s.node);
            Selection::Multiple(slice(&children, *from, *to, *step)?)
        }
        (Selection::Multiple(items), Step::Slice { from, to, step }) => {
            Selection::Multiple(slice(items, *from, *to, *step)?)
        }

        (Selection::Single(s), Step::KeyUnion(keys)) => {
            Selection::Multiple(key_union(&arena, s.node, keys))
        }
        (Selection::Multiple(items), Step::KeyUnion(keys)) => Selection::Multiple(
            items
                .iter()
                .flat_map(|s| key_union(&arena, s.node, keys))
                .collect(),
        ),

        (Selection::Single(s), Step::IndexUnion(indices)) => {
            if !arena.is_array(s.node) {
                return Err(mismatch("index union", &arena, s.node));
            }
            Selection::Multiple(index_union(&arena.children(s.node), indices))
        }
        (Selection::Multiple(items), Step::IndexUnion(indices)) => {
            Selection::Multiple(index_union(items, indices))
        }

        (_, Step::RecursiveKey(key)) => Selection::Multiple(
            roots(&input.selection)
                .into_iter()
                .flat_map(|root| arena.subtree(root))
                .filter_map(|node| arena.member(node, key))
                .collect(),
        ),
        (_, Step::RecursiveIndex(i)) => Selection::Multiple(
            roots(&input.selection)
                .into_iter()
                .flat_map(|root| arena.subtree(root))
                .filter(|node| arena.is_array(*node))
                .filter_map(|node| arena.element(node, *i).ok())
                .collect(),
        ),
        (_, Step::RecursiveWildcard) => Selection::Multiple(
            roots(&input.selection)
                .into_iter()
                .flat_map(|root| arena.descendants(root))
                .collect(),
        ),

        (_, Step::Expression(_) | Step::Condition(_) | Step::AttributeFinder { .. }) => {
            return Err(EvalError::type_mismatch(
                "step requires evaluation and cannot be applied structurally",
            ))
        }
    };
    Ok(input.with_selection(selection))
}

fn mismatch(step: &str, arena: &Arena, node: NodeId) -> EvalError {
    EvalError::type_mismatch(format!(
        "{} step cannot be applied to {}",
        step,
        arena.kind(node)
    ))
}

fn roots(selection: &Selection) -> Vec<NodeId> {
    match selection {
        Selection::Nothing => Vec::new(),
        Selection::Single(s) => vec![s.node],
        Selection::Multiple(items) => items.iter().map(|s| s.node).collect(),
    }
}

fn key_union(arena: &Arena, node: NodeId, keys: &[String]) -> Vec<Selected> {
    keys.iter().filter_map(|k| arena.member(node, k)).collect()
}

/// Elements at the given positions, deduplicated, in sequence order.
/// Out-of-range positions are skipped.
fn index_union(items: &[Selected], indices: &[i64]) -> Vec<Selected> {
    let mut wanted: Vec<usize> = indices
        .iter()
        .filter_map(|i| normalize_index(*i, items.len()))
        .collect();
    wanted.sort_unstable();
    wanted.dedup();
    wanted.into_iter().map(|i| items[i].clone()).collect()
}

/// Python-style slice over a sequence of selected nodes.
fn slice(
    items: &[Selected],
    from: Option<i64>,
    to: Option<i64>,
    step: Option<i64>,
) -> Result<Vec<Selected>, EvalError> {
    let len = items.len() as i64;
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(EvalError::type_mismatch("slice step must not be zero"));
    }
    let norm = |i: i64| if i < 0 { i + len } else { i };
    let mut out = Vec::new();
    if step > 0 {
        let start = from.map(norm).unwrap_or(0).clamp(0, len);
        let stop = to.map(norm).unwrap_or(len).clamp(0, len);
        let mut i = start;
        while i < stop {
            out.push(items[i as usize].clone());
            match i.checked_add(step) {
                Some(next) => i = next,
                None => break,
            }
        }
    } else {
        let start = from.map(norm).unwrap_or(len - 1).clamp(-1, len - 1);
        let stop = to.map(norm).unwrap_or(-1).clamp(-1, len - 1);
        let mut i = start;
        while i > stop {
            out.push(items[i as usize].clone());
            match i.checked_add(step) {
                Some(next) => i = next,
                None => break,
            }
        }
    }
    Ok(out)
}

// ── Evaluating steps ────────────────────────────────────────────────

/// `[(expr)]`: the expression sees the current value as `@`; a number
/// indexes, a string selects a key.
fn expression_step(
    expr: &Expression,
    input: Resolved,
    ctx: &EvaluationContext,
    is_body: bool,
) -> BoxStream<'static, Resolution> {
    let current = input.value();
    switch_map(evaluate(expr, ctx, is_body, &current), move |key| {
        let step = match key {
            Val::Error(e) => return just(Err(e)),
            Val::Undefined => return just(Ok(input.with_selection(Selection::Nothing))),
            Val::Defined(serde_json::Value::String(k)) => Step::Key(k),
            Val::Defined(serde_json::Value::Number(n)) => match n.as_i64() {
                Some(i) => Step::Index(i),
                None => {
                    return just(Err(EvalError::type_mismatch(format!(
                        "computed index {} is not an integer",
                        n
                    ))))
                }
            },
            other => {
                return just(Err(EvalError::type_mismatch(format!(
                    "computed step must be a string or integer, got {}",
                    other.kind()
                ))))
            }
        };
        just(apply_structural(&step, input.clone()))
    })
}

/// `[?(expr)]`: keeps the candidates for which the expression, evaluated
/// with the candidate as `@`, is `true`.
fn condition_step(
    expr: &Expression,
    input: Resolved,
    ctx: &EvaluationContext,
    is_body: bool,
) -> BoxStream<'static, Resolution> {
    let candidates = match &input.selection {
        Selection::Single(s) => {
            if input.arena.is_array(s.node) || input.arena.is_object(s.node) {
                input.arena.children(s.node)
            } else {
                return just(Err(mismatch("condition", &input.arena, s.node)));
            }
        }
        Selection::Multiple(items) => items.clone(),
        Selection::Nothing => return just(Ok(input)),
    };

    let checks = candidates
        .iter()
        .map(|c| {
            let element = Val::of(input.arena.to_json(c.node));
            evaluate(expr, ctx, is_body, &element)
        })
        .collect();

    combine_latest(checks)
        .map(move |results| {
            let mut kept = Vec::new();
            for (candidate, result) in candidates.iter().zip(results) {
                match result {
                    Val::Error(e) => return Err(e),
                    Val::Undefined => {}
                    Val::Defined(serde_json::Value::Bool(true)) => kept.push(candidate.clone()),
                    Val::Defined(serde_json::Value::Bool(false)) => {}
                    other => {
                        return Err(EvalError::type_mismatch(format!(
                            "condition step expects a boolean, got {}",
                            other.kind()
                        )))
                    }
                }
            }
            Ok(input.with_selection(Selection::Multiple(kept)))
        })
        .boxed()
}

/// `.<name(arguments)>`: subscribes to an attribute finder with the
/// current value as left-hand side. Only allowed in body context.
fn attribute_step(
    name: &str,
    arguments: &[Expression],
    input: Resolved,
    ctx: &EvaluationContext,
    is_body: bool,
    relative: &Val,
) -> BoxStream<'static, Resolution> {
    if !is_body {
        return just(Err(EvalError::AttributeInTarget {
            name: name.to_string(),
        }));
    }
    let left = input.value();
    let name = name.to_string();
    let ctx_inner = ctx.clone();
    switch_map(evaluate_all(arguments, ctx, is_body, relative), move |args| {
        if let Some(Val::Error(e)) = args.iter().find(|a| a.is_error()) {
            return just(Err(e.clone()));
        }
        ctx_inner
            .attributes()
            .evaluate(
                &name,
                left.clone(),
                args,
                ctx_inner.variables(),
                ctx_inner.attribute_timeout(),
            )
            .map(|value| match value {
                Val::Error(e) => Err(e),
                other => Ok(Resolved::from_val(&other)),
            })
            .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value as Json};

    fn start(value: Json) -> Resolved {
        Resolved::from_val(&Val::of(value))
    }

    fn apply_all(value: Json, steps: &[Step]) -> Resolution {
        steps
            .iter()
            .try_fold(start(value), |acc, step| apply_structural(step, acc))
    }

    fn select(value: Json, steps: &[Step]) -> Val {
        match apply_all(value, steps) {
            Ok(r) => r.value(),
            Err(e) => Val::Error(e),
        }
    }

    #[test]
    fn key_step_is_soft() {
        let doc = json!({"a": {"b": 1}, "s": "text"});
        assert_eq!(select(doc.clone(), &[Step::Key("a".into()), Step::Key("b".into())]), Val::of(1));
        assert_eq!(select(doc.clone(), &[Step::Key("zz".into())]), Val::Undefined);
        assert_eq!(select(doc.clone(), &[Step::Key("s".into()), Step::Key("x".into())]), Val::Undefined);
        assert_eq!(
            select(doc, &[Step::Key("zz".into()), Step::Index(0)]),
            Val::Undefined
        );
    }

    #[test]
    fn index_step_bounds_and_mismatch() {
        assert_eq!(select(json!([1, 2, 3]), &[Step::Index(-1)]), Val::of(3));
        assert_eq!(
            select(json!([1]), &[Step::Index(4)]),
            Val::Error(EvalError::IndexOutOfRange { index: 4, len: 1 })
        );
        assert!(matches!(
            select(json!({"a": 1}), &[Step::Index(0)]),
            Val::Error(EvalError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn wildcard_over_arrays_and_objects() {
        assert_eq!(select(json!([1, 2]), &[Step::Wildcard]), Val::of(json!([1, 2])));
        assert_eq!(select(json!({"a": 1, "b": 2}), &[Step::Wildcard]), Val::of(json!([1, 2])));
        assert!(select(json!(5), &[Step::Wildcard]).is_error());
    }

    #[test]
    fn key_on_fan_out_projects() {
        let doc = json!([{"n": 1}, {"m": 2}, {"n": 3}]);
        assert_eq!(
            select(doc, &[Step::Wildcard, Step::Key("n".into())]),
            Val::of(json!([1, 3]))
        );
    }

    #[test]
    fn index_on_fan_out_indexes_the_sequence() {
        let doc = json!({"a": 1, "b": 2, "c": 3});
        assert_eq!(select(doc, &[Step::Wildcard, Step::Index(1)]), Val::of(2));
    }

    #[test]
    fn slices() {
        let doc = json!([0, 1, 2, 3, 4, 5]);
        let s = |from, to, step| Step::Slice { from, to, step };
        assert_eq!(select(doc.clone(), &[s(Some(1), Some(4), None)]), Val::of(json!([1, 2, 3])));
        assert_eq!(select(doc.clone(), &[s(None, None, Some(2))]), Val::of(json!([0, 2, 4])));
        assert_eq!(select(doc.clone(), &[s(Some(-2), None, None)]), Val::of(json!([4, 5])));
        assert_eq!(select(doc.clone(), &[s(None, None, Some(-2))]), Val::of(json!([5, 3, 1])));
        assert_eq!(select(doc, &[s(Some(10), None, None)]), Val::of(json!([])));
        assert!(select(json!({}), &[s(None, None, None)]).is_error());
    }

    #[test]
    fn slice_with_extreme_step_stops_after_first_element() {
        let doc = json!([1, 2, 3]);
        let s = |from, step| Step::Slice { from, to: None, step: Some(step) };
        assert_eq!(select(doc.clone(), &[s(Some(1), i64::MAX)]), Val::of(json!([2])));
        assert_eq!(select(doc.clone(), &[s(None, i64::MIN)]), Val::of(json!([3])));
        assert_eq!(select(doc, &[s(Some(-1), i64::MIN + 1)]), Val::of(json!([3])));
    }

    #[test]
    fn unions() {
        let obj = json!({"a": 1, "b": 2, "c": 3});
        assert_eq!(
            select(obj, &[Step::KeyUnion(vec!["c".into(), "a".into(), "x".into()])]),
            Val::of(json!([3, 1]))
        );
        let arr = json!([10, 11, 12]);
        assert_eq!(
            select(arr, &[Step::IndexUnion(vec![2, 0, -1, 7])]),
            Val::of(json!([10, 12]))
        );
    }

    #[test]
    fn recursive_steps_visit_in_preorder() {
        let doc = json!({"k": 1, "x": [{"k": 2}, {"y": {"k": 3}}]});
        assert_eq!(
            select(doc.clone(), &[Step::RecursiveKey("k".into())]),
            Val::of(json!([1, 2, 3]))
        );
        let nested = json!([[1, 2], [3]]);
        assert_eq!(
            select(nested.clone(), &[Step::RecursiveIndex(0)]),
            Val::of(json!([[1, 2], 1, 3]))
        );
        assert_eq!(
            select(nested, &[Step::RecursiveWildcard]),
            Val::of(json!([[1, 2], 1, 2, [3], 3]))
        );
    }

    #[test]
    fn recursive_index_across_flat_array() {
        assert_eq!(
            select(json!([null, true]), &[Step::RecursiveIndex(0)]),
            Val::of(json!([null]))
        );
    }

    #[test]
    fn fan_out_keeps_parent_handles() {
        let r = apply_all(json!({"a": [1, 2]}), &[Step::Key("a".into()), Step::Wildcard]).unwrap();
        let Selection::Multiple(items) = &r.selection else {
            panic!("expected fan-out");
        };
        for (i, s) in items.iter().enumerate() {
            let handle = s.handle.as_ref().unwrap();
            assert_eq!(handle.slot, crate::selection::Slot::Index(i));
        }
    }

    /// Select through a chain, replace through the handle, re-select: the
    /// replacement is what comes back.
    #[test]
    fn replace_through_handle_round_trips() {
        let doc = json!({"a": [{"k": 1}, {"k": 2}], "b": {"c": "x"}});
        let replacement = json!("replaced");
        let chains: Vec<Vec<Step>> = vec![
            vec![Step::Key("b".into()), Step::Key("c".into())],
            vec![Step::Key("a".into()), Step::Index(1)],
            vec![Step::Key("b".into()), Step::Wildcard],
            vec![Step::Key("a".into()), Step::Slice { from: Some(0), to: Some(1), step: None }],
            vec![Step::Key("b".into()), Step::KeyUnion(vec!["c".into()])],
            vec![Step::Key("a".into()), Step::IndexUnion(vec![-1])],
            vec![Step::Key("b".into()), Step::RecursiveKey("c".into())],
            vec![Step::RecursiveIndex(1)],
            vec![Step::Key("b".into()), Step::RecursiveWildcard],
        ];
        for chain in chains {
            let resolved = apply_all(doc.clone(), &chain).unwrap();
            let selected = match &resolved.selection {
                Selection::Single(s) => s.clone(),
                Selection::Multiple(items) if items.len() == 1 => items[0].clone(),
                other => panic!("chain {:?} selected {:?}", chain, other),
            };
            let mut arena = (*resolved.arena).clone();
            arena
                .replace(selected.handle.as_ref().unwrap(), &replacement)
                .unwrap();
            let rewritten = arena.to_json(resolved.root);

            let again = apply_all(rewritten, &chain).unwrap().value();
            let expected = match resolved.selection {
                Selection::Single(_) => replacement.clone(),
                _ => json!([replacement.clone()]),
            };
            assert_eq!(again, Val::of(expected), "chain {:?}", chain);
        }
    }

    #[tokio::test]
    async fn expression_step_computes_key_or_index() {
        let ctx = EvaluationContext::default();
        let by_key = vec![Step::Expression(Box::new(Expression::literal(json!("b"))))];
        let mut s = select_value(Val::of(json!({"b": 7})), &by_key, &ctx, true, &Val::Undefined);
        assert_eq!(s.next().await, Some(Val::of(7)));

        let by_index = vec![Step::Expression(Box::new(Expression::literal(json!(1))))];
        let mut s = select_value(Val::of(json!([5, 6])), &by_index, &ctx, true, &Val::Undefined);
        assert_eq!(s.next().await, Some(Val::of(6)));

        let bad = vec![Step::Expression(Box::new(Expression::literal(json!(true))))];
        let mut s = select_value(Val::of(json!([5])), &bad, &ctx, true, &Val::Undefined);
        assert!(matches!(s.next().await, Some(Val::Error(EvalError::TypeMismatch { .. }))));
    }

    #[tokio::test]
    async fn condition_step_filters_elements() {
        use sieve_interchange::{BasicExpression, BasicHead, BinaryOperator};
        let ctx = EvaluationContext::default();
        // [?(@ > 2)]
        let at = Expression::Basic(BasicExpression::new(BasicHead::Relative));
        let cond = Expression::binary(BinaryOperator::Gt, at, Expression::literal(json!(2)));
        let steps = vec![Step::Condition(Box::new(cond))];
        let mut s = select_value(Val::of(json!([1, 3, 2, 5])), &steps, &ctx, true, &Val::Undefined);
        assert_eq!(s.next().await, Some(Val::of(json!([3, 5]))));

        let mut s = select_value(Val::of(json!(4)), &steps, &ctx, true, &Val::Undefined);
        assert!(matches!(s.next().await, Some(Val::Error(EvalError::TypeMismatch { .. }))));
    }

    #[tokio::test]
    async fn attribute_step_is_rejected_in_target_context() {
        let ctx = EvaluationContext::default();
        let steps = vec![Step::AttributeFinder {
            name: "pip.x".into(),
            arguments: vec![],
        }];
        let mut s = select_value(Val::of("alice"), &steps, &ctx, false, &Val::Undefined);
        assert_eq!(
            s.next().await,
            Some(Val::Error(EvalError::AttributeInTarget { name: "pip.x".into() }))
        );
    }

    #[tokio::test]
    async fn error_base_short_circuits() {
        let ctx = EvaluationContext::default();
        let err = Val::Error(EvalError::type_mismatch("upstream"));
        let mut s = select_value(err.clone(), &[Step::Key("a".into())], &ctx, true, &Val::Undefined);
        assert_eq!(s.next().await, Some(err));
    }
}
