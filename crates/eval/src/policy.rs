//! Policy and policy-set evaluation.
//!
//! A policy moves through target, body and constraint evaluation:
//!
//! - target `false` or undefined: NOT_APPLICABLE;
//! - a body condition `false` or undefined: NOT_APPLICABLE;
//! - all conditions `true`: the entitlement, once obligations, advice and
//!   the transformation have been evaluated;
//! - any error on the way: INDETERMINATE.
//!
//! Every stage is a stream. A stage is only subscribed while the stage
//! before it holds, so a policy whose target is false never opens the
//! attribute subscriptions of its body.

use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use serde_json::Value as Json;
use sieve_interchange::{
    Entitlement, Expression, Policy, PolicyDocument, PolicySet, Statement, VariableDefinition,
};
use tracing::debug;

use crate::combining::{combine_units, Combined};
use crate::context::EvaluationContext;
use crate::decision::{AuthorizationDecision, Decision, DocumentDecision};
use crate::error::EvalError;
use crate::expression::{evaluate, evaluate_all};
use crate::stream::{distinct_until_changed, just, switch_map};
use crate::value::Val;

/// Anything that evaluates to a stream of document decisions.
pub trait Evaluable: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, ctx: &EvaluationContext) -> BoxStream<'static, DocumentDecision>;
}

impl Evaluable for Policy {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, ctx: &EvaluationContext) -> BoxStream<'static, DocumentDecision> {
        let policy = Arc::new(self.clone());
        let body_policy = policy.clone();
        let decisions = guarded_by_target(&policy.name, policy.target.as_ref(), ctx, move |ctx| {
            evaluate_policy_body(body_policy.clone(), ctx)
        });
        logged(distinct_until_changed(decisions))
    }
}

impl Evaluable for PolicySet {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, ctx: &EvaluationContext) -> BoxStream<'static, DocumentDecision> {
        let set = Arc::new(self.clone());
        let inner = set.clone();
        let decisions = guarded_by_target(&set.name, set.target.as_ref(), ctx, move |ctx| {
            evaluate_set_body(inner.clone(), ctx)
        });
        logged(distinct_until_changed(decisions))
    }
}

impl Evaluable for PolicyDocument {
    fn name(&self) -> &str {
        PolicyDocument::name(self)
    }

    fn evaluate(&self, ctx: &EvaluationContext) -> BoxStream<'static, DocumentDecision> {
        match self {
            PolicyDocument::Policy(p) => p.evaluate(ctx),
            PolicyDocument::PolicySet(s) => s.evaluate(ctx),
        }
    }
}

/// A fixed decision, used for failures found before evaluation starts.
impl Evaluable for DocumentDecision {
    fn name(&self) -> &str {
        &self.document
    }

    fn evaluate(&self, _ctx: &EvaluationContext) -> BoxStream<'static, DocumentDecision> {
        just(self.clone())
    }
}

fn logged(decisions: BoxStream<'static, DocumentDecision>) -> BoxStream<'static, DocumentDecision> {
    decisions
        .inspect(|d| {
            if let Some(error) = &d.error {
                debug!(document = %d.document, %error, "document evaluated to INDETERMINATE");
            }
        })
        .boxed()
}

// ── Target ──────────────────────────────────────────────────────────

/// Evaluate `target` (outside body context) and switch to `matched` while
/// it holds.
fn guarded_by_target<F>(
    name: &str,
    target: Option<&Expression>,
    ctx: &EvaluationContext,
    mut matched: F,
) -> BoxStream<'static, DocumentDecision>
where
    F: FnMut(EvaluationContext) -> BoxStream<'static, DocumentDecision> + Send + 'static,
{
    let Some(target) = target else {
        return matched(ctx.clone());
    };
    let name = name.to_string();
    let ctx = ctx.clone();
    let checks = evaluate(target, &ctx, false, &Val::Undefined);
    switch_map(checks, move |v| match v {
        Val::Defined(Json::Bool(true)) => matched(ctx.clone()),
        Val::Defined(Json::Bool(false)) | Val::Undefined => {
            just(DocumentDecision::not_applicable(name.clone()))
        }
        Val::Error(e) => just(DocumentDecision::indeterminate(name.clone(), e)),
        other => just(DocumentDecision::indeterminate(
            name.clone(),
            EvalError::type_mismatch(format!("target expects a boolean, got {}", other.kind())),
        )),
    })
}

// ── Policy body ─────────────────────────────────────────────────────

/// Progress through a policy body.
#[derive(Debug, Clone)]
enum BodyOutcome {
    /// Every statement so far holds; carries the bindings made.
    Satisfied(EvaluationContext),
    NotSatisfied,
    Failed(EvalError),
}

fn evaluate_body(statements: &[Statement], ctx: EvaluationContext) -> BoxStream<'static, BodyOutcome> {
    let mut current = just(BodyOutcome::Satisfied(ctx));
    for statement in statements {
        let statement = statement.clone();
        current = switch_map(current, move |outcome| match outcome {
            BodyOutcome::Satisfied(ctx) => evaluate_statement(&statement, ctx),
            other => just(other),
        });
    }
    current
}

fn evaluate_statement(statement: &Statement, ctx: EvaluationContext) -> BoxStream<'static, BodyOutcome> {
    match statement {
        Statement::Condition(expr) => evaluate(expr, &ctx, true, &Val::Undefined)
            .map(move |v| match v {
                Val::Defined(Json::Bool(true)) => BodyOutcome::Satisfied(ctx.clone()),
                Val::Defined(Json::Bool(false)) | Val::Undefined => BodyOutcome::NotSatisfied,
                Val::Error(e) => BodyOutcome::Failed(e),
                other => BodyOutcome::Failed(EvalError::type_mismatch(format!(
                    "condition expects a boolean, got {}",
                    other.kind()
                ))),
            })
            .boxed(),
        Statement::Variable(definition) => bind_variable(definition, ctx, true)
            .map(|bound| match bound {
                Ok(ctx) => BodyOutcome::Satisfied(ctx),
                Err(e) => BodyOutcome::Failed(e),
            })
            .boxed(),
    }
}

/// Evaluate a variable definition and bind its value in a child context.
fn bind_variable(
    definition: &VariableDefinition,
    ctx: EvaluationContext,
    is_body: bool,
) -> BoxStream<'static, Result<EvaluationContext, EvalError>> {
    let name = definition.name.clone();
    evaluate(&definition.expression, &ctx, is_body, &Val::Undefined)
        .map(move |v| match v {
            Val::Error(e) => Err(e),
            v => Ok(ctx.with_variable(&name, v)),
        })
        .boxed()
}

fn evaluate_policy_body(
    policy: Arc<Policy>,
    ctx: EvaluationContext,
) -> BoxStream<'static, DocumentDecision> {
    let outcomes = evaluate_body(&policy.body, ctx);
    switch_map(outcomes, move |outcome| match outcome {
        BodyOutcome::Satisfied(ctx) => {
            let decision = match policy.entitlement {
                Entitlement::Permit => Decision::Permit,
                Entitlement::Deny => Decision::Deny,
            };
            evaluate_constraints(
                policy.name.clone(),
                decision,
                &policy.obligations,
                &policy.advice,
                policy.transformation.as_ref(),
                &ctx,
            )
        }
        BodyOutcome::NotSatisfied => just(DocumentDecision::not_applicable(policy.name.clone())),
        BodyOutcome::Failed(e) => just(DocumentDecision::indeterminate(policy.name.clone(), e)),
    })
}

// ── Constraints ─────────────────────────────────────────────────────

/// Obligations, advice and transformation evaluated for a decision.
#[derive(Debug, Clone, PartialEq)]
struct Constraints {
    obligations: Vec<Json>,
    advice: Vec<Json>,
    resource: Option<Json>,
}

/// Evaluate the constraint expressions together; `transformation` is
/// appended last when present.
fn constraints(
    obligations: &[Expression],
    advice: &[Expression],
    transformation: Option<&Expression>,
    ctx: &EvaluationContext,
) -> BoxStream<'static, Result<Constraints, EvalError>> {
    let obligation_count = obligations.len();
    let advice_count = advice.len();
    let mut exprs: Vec<Expression> = obligations.to_vec();
    exprs.extend(advice.iter().cloned());
    exprs.extend(transformation.cloned());
    let has_transformation = transformation.is_some();

    evaluate_all(&exprs, ctx, true, &Val::Undefined)
        .map(move |values| {
            let mut values = values.into_iter();
            let mut out = Constraints {
                obligations: Vec::with_capacity(obligation_count),
                advice: Vec::with_capacity(advice_count),
                resource: None,
            };
            for v in values.by_ref().take(obligation_count) {
                match v {
                    Val::Defined(json) => out.obligations.push(json),
                    Val::Error(e) => return Err(e),
                    Val::Undefined => {
                        return Err(EvalError::UndefinedOperand {
                            message: "obligation evaluated to undefined".to_string(),
                        })
                    }
                }
            }
            for v in values.by_ref().take(advice_count) {
                match v {
                    Val::Defined(json) => out.advice.push(json),
                    Val::Error(e) => return Err(e),
                    Val::Undefined => {}
                }
            }
            if has_transformation {
                match values.next() {
                    Some(Val::Defined(json)) => out.resource = Some(json),
                    Some(Val::Error(e)) => return Err(e),
                    _ => {
                        return Err(EvalError::UndefinedOperand {
                            message: "transformation evaluated to undefined".to_string(),
                        })
                    }
                }
            }
            Ok(out)
        })
        .boxed()
}

fn evaluate_constraints(
    name: String,
    decision: Decision,
    obligations: &[Expression],
    advice: &[Expression],
    transformation: Option<&Expression>,
    ctx: &EvaluationContext,
) -> BoxStream<'static, DocumentDecision> {
    constraints(obligations, advice, transformation, ctx)
        .map(move |evaluated| match evaluated {
            Ok(c) => {
                let mut authorization = AuthorizationDecision::new(decision)
                    .with_obligations(c.obligations)
                    .with_advice(c.advice);
                authorization.resource = c.resource;
                DocumentDecision::new(name.clone(), authorization)
            }
            Err(e) => DocumentDecision::indeterminate(name.clone(), e),
        })
        .boxed()
}

// ── Policy set body ─────────────────────────────────────────────────

fn evaluate_set_body(
    set: Arc<PolicySet>,
    ctx: EvaluationContext,
) -> BoxStream<'static, DocumentDecision> {
    let mut scope: BoxStream<'static, Result<EvaluationContext, EvalError>> = just(Ok(ctx));
    for definition in &set.variables {
        let definition = definition.clone();
        scope = switch_map(scope, move |bound| match bound {
            Ok(ctx) => bind_variable(&definition, ctx, false),
            Err(e) => just(Err(e)),
        });
    }

    switch_map(scope, move |bound| match bound {
        Ok(ctx) => {
            let units: Vec<Arc<dyn Evaluable>> = set
                .policies
                .iter()
                .map(|p| Arc::new(p.clone()) as Arc<dyn Evaluable>)
                .collect();
            let set = set.clone();
            let set_ctx = ctx.clone();
            switch_map(combine_units(set.algorithm, units, &ctx), move |combined| {
                with_set_constraints(&set, combined, &set_ctx)
            })
        }
        Err(e) => just(DocumentDecision::indeterminate(set.name.clone(), e)),
    })
}

/// Union the set's own obligations and advice into a combined PERMIT or
/// DENY.
fn with_set_constraints(
    set: &PolicySet,
    combined: Combined,
    ctx: &EvaluationContext,
) -> BoxStream<'static, DocumentDecision> {
    let Combined {
        authorization,
        error,
        ..
    } = combined;
    let name = set.name.clone();
    let applies = matches!(authorization.decision, Decision::Permit | Decision::Deny);
    if !applies || (set.obligations.is_empty() && set.advice.is_empty()) {
        return just(DocumentDecision {
            document: name,
            authorization,
            error,
        });
    }
    constraints(&set.obligations, &set.advice, None, ctx)
        .map(move |evaluated| match evaluated {
            Ok(c) => {
                let mut authorization = authorization.clone();
                authorization.obligations.extend(c.obligations);
                authorization.advice.extend(c.advice);
                DocumentDecision::new(name.clone(), authorization)
            }
            Err(e) => DocumentDecision::indeterminate(name.clone(), e),
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{AttributeRegistry, WatchAttributeFinder};
    use crate::functions::FunctionRegistry;
    use serde_json::json;
    use sieve_interchange::from_interchange;

    fn policy(doc: Json) -> PolicyDocument {
        from_interchange(&doc).unwrap()
    }

    async fn decide(doc: &PolicyDocument, ctx: &EvaluationContext) -> DocumentDecision {
        doc.evaluate(ctx).next().await.expect("no decision")
    }

    fn lit(v: Json) -> Json {
        json!({"kind": "literal", "value": v})
    }

    #[tokio::test]
    async fn policy_without_target_or_body_grants_entitlement() {
        let doc = policy(json!({"kind": "policy", "name": "p", "entitlement": "permit"}));
        let d = decide(&doc, &EvaluationContext::default()).await;
        assert_eq!(d.decision(), Decision::Permit);
        assert_eq!(d.document, "p");
        assert!(d.error.is_none());
    }

    #[tokio::test]
    async fn false_or_undefined_target_is_not_applicable() {
        let ctx = EvaluationContext::default();
        let doc = policy(json!({
            "kind": "policy", "name": "p", "entitlement": "deny",
            "target": {"kind": "binary", "operator": "eq", "left": lit(json!(true)), "right": lit(json!(false))}
        }));
        assert_eq!(decide(&doc, &ctx).await.decision(), Decision::NotApplicable);

        let doc = policy(json!({
            "kind": "policy", "name": "p", "entitlement": "deny",
            "target": {"kind": "identifier", "name": "subject", "steps": [{"kind": "key", "key": "missing"}]}
        }));
        assert_eq!(decide(&doc, &ctx).await.decision(), Decision::NotApplicable);
    }

    #[tokio::test]
    async fn condition_type_error_is_indeterminate() {
        let doc = policy(json!({
            "kind": "policy", "name": "p", "entitlement": "permit",
            "body": [{"kind": "condition", "expression":
                {"kind": "binary", "operator": "lt", "left": lit(json!("a")), "right": lit(json!(5))}}]
        }));
        let d = decide(&doc, &EvaluationContext::default()).await;
        assert_eq!(d.decision(), Decision::Indeterminate);
        assert!(matches!(d.error, Some(EvalError::TypeMismatch { .. })));
    }

    #[tokio::test]
    async fn body_variables_are_visible_to_later_conditions() {
        let doc = policy(json!({
            "kind": "policy", "name": "p", "entitlement": "permit",
            "body": [
                {"kind": "variable", "name": "limit", "expression": lit(json!(10))},
                {"kind": "condition", "expression": {"kind": "binary", "operator": "lt",
                    "left": lit(json!(3)), "right": {"kind": "identifier", "name": "limit"}}}
            ],
            "obligations": [{"kind": "identifier", "name": "limit"}]
        }));
        let d = decide(&doc, &EvaluationContext::default()).await;
        assert_eq!(d.decision(), Decision::Permit);
        assert_eq!(d.authorization.obligations, vec![json!(10)]);
    }

    #[tokio::test]
    async fn constraints_shape_the_decision() {
        let doc = policy(json!({
            "kind": "policy", "name": "p", "entitlement": "permit",
            "obligations": [lit(json!(["a", "b"])), lit(json!("c"))],
            "advice": [{"kind": "identifier", "name": "nothing"}, lit(json!("tip"))],
            "transformation": lit(json!({"redacted": true}))
        }));
        let d = decide(&doc, &EvaluationContext::default()).await;
        assert_eq!(d.authorization.obligations, vec![json!(["a", "b"]), json!("c")]);
        assert_eq!(d.authorization.advice, vec![json!("tip")]);
        assert_eq!(d.authorization.resource, Some(json!({"redacted": true})));
    }

    #[tokio::test]
    async fn failing_obligation_voids_the_decision() {
        let doc = policy(json!({
            "kind": "policy", "name": "p", "entitlement": "permit",
            "obligations": [{"kind": "identifier", "name": "nothing"}]
        }));
        let d = decide(&doc, &EvaluationContext::default()).await;
        assert_eq!(d.decision(), Decision::Indeterminate);
        assert!(matches!(d.error, Some(EvalError::UndefinedOperand { .. })));
    }

    #[tokio::test]
    async fn attribute_in_target_is_indeterminate() {
        let doc = policy(json!({
            "kind": "policy", "name": "p", "entitlement": "permit",
            "target": {"kind": "identifier", "name": "subject",
                       "steps": [{"kind": "attribute_finder", "name": "pip.role"}]}
        }));
        let d = decide(&doc, &EvaluationContext::default()).await;
        assert!(matches!(d.error, Some(EvalError::AttributeInTarget { .. })));
    }

    #[tokio::test]
    async fn body_follows_live_attribute() {
        let finder = Arc::new(WatchAttributeFinder::new(Val::of("guest")));
        let mut attributes = AttributeRegistry::new();
        attributes.register("pip.role", finder.clone());
        let ctx = EvaluationContext::new(Arc::new(FunctionRegistry::standard()), Arc::new(attributes));
        let doc = policy(json!({
            "kind": "policy", "name": "p", "entitlement": "permit",
            "body": [{"kind": "condition", "expression": {"kind": "binary", "operator": "eq",
                "left": {"kind": "identifier", "name": "subject",
                         "steps": [{"kind": "attribute_finder", "name": "pip.role"}]},
                "right": lit(json!("admin"))}}]
        }));
        let mut s = doc.evaluate(&ctx);
        assert_eq!(s.next().await.map(|d| d.decision()), Some(Decision::NotApplicable));
        finder.publish(Val::of("admin"));
        assert_eq!(s.next().await.map(|d| d.decision()), Some(Decision::Permit));
        drop(s);
        assert_eq!(finder.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn set_variables_and_obligations() {
        let doc = policy(json!({
            "kind": "policy_set", "name": "set", "algorithm": "deny-overrides",
            "variables": [{"name": "tenant", "expression": lit(json!("acme"))}],
            "policies": [{
                "kind": "policy", "name": "p", "entitlement": "permit",
                "body": [{"kind": "condition", "expression": {"kind": "binary", "operator": "eq",
                    "left": {"kind": "identifier", "name": "tenant"}, "right": lit(json!("acme"))}}],
                "obligations": [lit(json!("from-policy"))]
            }],
            "obligations": [lit(json!("from-set"))]
        }));
        let d = decide(&doc, &EvaluationContext::default()).await;
        assert_eq!(d.document, "set");
        assert_eq!(d.decision(), Decision::Permit);
        assert_eq!(d.authorization.obligations, vec![json!("from-policy"), json!("from-set")]);
    }

    #[tokio::test]
    async fn set_target_gates_its_policies() {
        let doc = policy(json!({
            "kind": "policy_set", "name": "set", "algorithm": "deny-unless-permit",
            "target": lit(json!(false)),
            "policies": [{"kind": "policy", "name": "p", "entitlement": "permit"}]
        }));
        let d = decide(&doc, &EvaluationContext::default()).await;
        assert_eq!(d.decision(), Decision::NotApplicable);
    }
}
