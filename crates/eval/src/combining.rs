//! Combining algorithms.
//!
//! [`combine`] is the pure strategy: an ordered list of document decisions
//! in, one decision out. [`combine_units`] is its streaming form over live
//! documents. All algorithms except first-applicable subscribe to every
//! document and recombine whenever one of them changes; first-applicable
//! subscribes left to right and only reaches a document while everything
//! before it is NOT_APPLICABLE.
//!
//! Obligations and advice come from the first decision whose kind matches
//! the combined decision. At most one of those contributors may carry a
//! transformed resource.

use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use sieve_interchange::CombiningAlgorithmId;

use crate::context::EvaluationContext;
use crate::decision::{AuthorizationDecision, Decision, DocumentDecision};
use crate::error::EvalError;
use crate::policy::Evaluable;
use crate::stream::{combine_latest, distinct_until_changed, just, switch_map};

/// The combined decision together with the decisions it was made from.
#[derive(Debug, Clone, PartialEq)]
pub struct Combined {
    pub authorization: AuthorizationDecision,
    /// Why the result is INDETERMINATE, if it is.
    pub error: Option<EvalError>,
    pub documents: Vec<DocumentDecision>,
}

impl Combined {
    fn new(authorization: AuthorizationDecision, documents: &[DocumentDecision]) -> Self {
        Combined {
            authorization,
            error: None,
            documents: documents.to_vec(),
        }
    }

    fn indeterminate(error: Option<EvalError>, documents: &[DocumentDecision]) -> Self {
        Combined {
            authorization: AuthorizationDecision::indeterminate(),
            error,
            documents: documents.to_vec(),
        }
    }

    fn passthrough(decision: &DocumentDecision, documents: &[DocumentDecision]) -> Self {
        Combined {
            authorization: decision.authorization.clone(),
            error: decision.error.clone(),
            documents: documents.to_vec(),
        }
    }
}

/// Combine `decisions` (in document order) with `algorithm`.
pub fn combine(algorithm: CombiningAlgorithmId, decisions: &[DocumentDecision]) -> Combined {
    match algorithm {
        CombiningAlgorithmId::FirstApplicable => first_applicable(decisions),
        CombiningAlgorithmId::DenyOverrides => overrides(Decision::Deny, decisions),
        CombiningAlgorithmId::PermitOverrides => overrides(Decision::Permit, decisions),
        CombiningAlgorithmId::OnlyOneApplicable => only_one_applicable(decisions),
        CombiningAlgorithmId::DenyUnlessPermit => unless(Decision::Permit, decisions),
        CombiningAlgorithmId::PermitUnlessDeny => unless(Decision::Deny, decisions),
    }
}

fn any(decisions: &[DocumentDecision], kind: Decision) -> bool {
    decisions.iter().any(|d| d.decision() == kind)
}

fn first_error(decisions: &[DocumentDecision]) -> Option<EvalError> {
    decisions
        .iter()
        .filter(|d| d.decision() == Decision::Indeterminate)
        .find_map(|d| d.error.clone())
}

/// The `kind` decision with the constraints of its first contributor.
fn contribution(
    kind: Decision,
    decisions: &[DocumentDecision],
) -> Result<AuthorizationDecision, EvalError> {
    let contributors: Vec<&DocumentDecision> =
        decisions.iter().filter(|d| d.decision() == kind).collect();
    let Some(first) = contributors.first() else {
        return Ok(AuthorizationDecision::new(kind));
    };

    let transformed: Vec<_> = contributors
        .iter()
        .filter_map(|d| d.authorization.resource.as_ref())
        .collect();
    if transformed.len() > 1 {
        return Err(EvalError::TransformationConflict {
            count: transformed.len(),
        });
    }

    Ok(AuthorizationDecision {
        decision: kind,
        resource: transformed.first().map(|r| (*r).clone()),
        obligations: first.authorization.obligations.clone(),
        advice: first.authorization.advice.clone(),
    })
}

fn other(kind: Decision) -> Decision {
    match kind {
        Decision::Permit => Decision::Deny,
        Decision::Deny => Decision::Permit,
        k => k,
    }
}

/// deny-overrides and permit-overrides; `winner` is the overriding kind.
fn overrides(winner: Decision, decisions: &[DocumentDecision]) -> Combined {
    let kind = if any(decisions, winner) {
        winner
    } else if any(decisions, Decision::Indeterminate) {
        return Combined::indeterminate(first_error(decisions), decisions);
    } else if any(decisions, other(winner)) {
        other(winner)
    } else {
        return Combined::new(AuthorizationDecision::not_applicable(), decisions);
    };
    match contribution(kind, decisions) {
        Ok(authorization) => Combined::new(authorization, decisions),
        Err(e) => Combined::indeterminate(Some(e), decisions),
    }
}

/// deny-unless-permit and permit-unless-deny; `preferred` wins when
/// present, the other kind is the default. Never INDETERMINATE or
/// NOT_APPLICABLE. An INDETERMINATE anywhere blocks a PERMIT.
fn unless(preferred: Decision, decisions: &[DocumentDecision]) -> Combined {
    let fallback = other(preferred);
    let blocked = preferred == Decision::Permit && any(decisions, Decision::Indeterminate);
    if any(decisions, preferred) && !blocked {
        if let Ok(authorization) = contribution(preferred, decisions) {
            return Combined::new(authorization, decisions);
        }
        return Combined::new(AuthorizationDecision::deny(), decisions);
    }
    match contribution(fallback, decisions) {
        Ok(authorization) => Combined::new(authorization, decisions),
        Err(_) => Combined::new(AuthorizationDecision::deny(), decisions),
    }
}

fn only_one_applicable(decisions: &[DocumentDecision]) -> Combined {
    if any(decisions, Decision::Indeterminate) {
        return Combined::indeterminate(first_error(decisions), decisions);
    }
    let applicable: Vec<&DocumentDecision> = decisions
        .iter()
        .filter(|d| d.decision() != Decision::NotApplicable)
        .collect();
    match applicable.as_slice() {
        [] => Combined::new(AuthorizationDecision::not_applicable(), decisions),
        [only] => Combined::passthrough(only, decisions),
        several => Combined::indeterminate(
            Some(EvalError::AmbiguousPolicySet {
                applicable: several.len(),
            }),
            decisions,
        ),
    }
}

fn first_applicable(decisions: &[DocumentDecision]) -> Combined {
    match decisions
        .iter()
        .position(|d| d.decision() != Decision::NotApplicable)
    {
        Some(i) => Combined::passthrough(&decisions[i], &decisions[..=i]),
        None => Combined::new(AuthorizationDecision::not_applicable(), decisions),
    }
}

// ── Streaming ───────────────────────────────────────────────────────

/// Evaluate `units` and combine their live decisions.
pub fn combine_units(
    algorithm: CombiningAlgorithmId,
    units: Vec<Arc<dyn Evaluable>>,
    ctx: &EvaluationContext,
) -> BoxStream<'static, Combined> {
    let combined = if algorithm == CombiningAlgorithmId::FirstApplicable {
        first_applicable_from(Arc::from(units), 0, ctx.clone(), Vec::new())
    } else {
        let streams = units.iter().map(|u| u.evaluate(ctx)).collect();
        combine_latest(streams)
            .map(move |decisions| combine(algorithm, &decisions))
            .boxed()
    };
    distinct_until_changed(combined)
}

/// Subscribe to `units[index]`; move on to the next unit only while it is
/// NOT_APPLICABLE.
fn first_applicable_from(
    units: Arc<[Arc<dyn Evaluable>]>,
    index: usize,
    ctx: EvaluationContext,
    seen: Vec<DocumentDecision>,
) -> BoxStream<'static, Combined> {
    let Some(unit) = units.get(index) else {
        return just(first_applicable(&seen));
    };
    let decisions = unit.evaluate(&ctx);
    switch_map(decisions, move |decision| {
        let mut seen = seen.clone();
        let applicable = decision.decision() != Decision::NotApplicable;
        seen.push(decision);
        if applicable {
            just(first_applicable(&seen))
        } else {
            first_applicable_from(units.clone(), index + 1, ctx.clone(), seen)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(name: &str, authorization: AuthorizationDecision) -> DocumentDecision {
        DocumentDecision::new(name, authorization)
    }

    fn permit(name: &str) -> DocumentDecision {
        doc(name, AuthorizationDecision::permit())
    }

    fn deny(name: &str) -> DocumentDecision {
        doc(name, AuthorizationDecision::deny())
    }

    fn na(name: &str) -> DocumentDecision {
        DocumentDecision::not_applicable(name)
    }

    fn failed(name: &str) -> DocumentDecision {
        DocumentDecision::indeterminate(name, EvalError::type_mismatch("broken"))
    }

    fn decision(algorithm: CombiningAlgorithmId, decisions: &[DocumentDecision]) -> Decision {
        combine(algorithm, decisions).authorization.decision
    }

    #[test]
    fn deny_overrides_table() {
        use CombiningAlgorithmId::DenyOverrides as A;
        assert_eq!(decision(A, &[permit("a"), deny("b")]), Decision::Deny);
        assert_eq!(decision(A, &[permit("a"), failed("b")]), Decision::Indeterminate);
        assert_eq!(decision(A, &[failed("a"), deny("b")]), Decision::Deny);
        assert_eq!(decision(A, &[na("a"), permit("b")]), Decision::Permit);
        assert_eq!(decision(A, &[na("a")]), Decision::NotApplicable);
        assert_eq!(decision(A, &[]), Decision::NotApplicable);
    }

    #[test]
    fn permit_overrides_table() {
        use CombiningAlgorithmId::PermitOverrides as A;
        assert_eq!(decision(A, &[deny("a"), permit("b")]), Decision::Permit);
        assert_eq!(decision(A, &[deny("a"), failed("b")]), Decision::Indeterminate);
        assert_eq!(decision(A, &[na("a"), deny("b")]), Decision::Deny);
    }

    #[test]
    fn unless_algorithms_never_leave_the_binary() {
        use CombiningAlgorithmId::{DenyUnlessPermit, PermitUnlessDeny};
        assert_eq!(decision(DenyUnlessPermit, &[]), Decision::Deny);
        assert_eq!(decision(DenyUnlessPermit, &[failed("a")]), Decision::Deny);
        assert_eq!(decision(DenyUnlessPermit, &[failed("a"), permit("b")]), Decision::Deny);
        assert_eq!(decision(DenyUnlessPermit, &[permit("a"), failed("b")]), Decision::Deny);
        assert_eq!(decision(DenyUnlessPermit, &[na("a"), permit("b")]), Decision::Permit);
        assert_eq!(decision(PermitUnlessDeny, &[failed("a"), permit("b")]), Decision::Permit);
        assert_eq!(decision(PermitUnlessDeny, &[na("a")]), Decision::Permit);
        assert_eq!(decision(PermitUnlessDeny, &[failed("a")]), Decision::Permit);
        assert_eq!(decision(PermitUnlessDeny, &[permit("a"), deny("b")]), Decision::Deny);
    }

    #[test]
    fn only_one_applicable_rejects_ambiguity() {
        use CombiningAlgorithmId::OnlyOneApplicable as A;
        let combined = combine(A, &[permit("a"), deny("b")]);
        assert_eq!(combined.authorization.decision, Decision::Indeterminate);
        assert_eq!(combined.error, Some(EvalError::AmbiguousPolicySet { applicable: 2 }));
        assert_eq!(decision(A, &[na("a"), deny("b")]), Decision::Deny);
        assert_eq!(decision(A, &[na("a"), na("b")]), Decision::NotApplicable);
    }

    #[test]
    fn first_applicable_stops_at_first_decision() {
        use CombiningAlgorithmId::FirstApplicable as A;
        assert_eq!(decision(A, &[na("a"), deny("b"), permit("c")]), Decision::Deny);
        let combined = combine(A, &[failed("a"), permit("b")]);
        assert_eq!(combined.authorization.decision, Decision::Indeterminate);
        assert_eq!(combined.documents.len(), 1);
    }

    #[test]
    fn obligations_come_from_first_matching_contributor() {
        let with = |name: &str, ob: &str, adv: &str| {
            doc(
                name,
                AuthorizationDecision::deny()
                    .with_obligations(vec![json!(ob)])
                    .with_advice(vec![json!(adv)]),
            )
        };
        let combined = combine(
            CombiningAlgorithmId::DenyOverrides,
            &[
                doc("p", AuthorizationDecision::permit().with_obligations(vec![json!("p")])),
                with("d1", "obligation1", "advice1"),
                with("d2", "obligation2", "advice2"),
            ],
        );
        assert_eq!(combined.authorization.decision, Decision::Deny);
        assert_eq!(combined.authorization.obligations, vec![json!("obligation1")]);
        assert_eq!(combined.authorization.advice, vec![json!("advice1")]);
    }

    #[test]
    fn conflicting_transformations() {
        let transformed = |name: &str| doc(name, AuthorizationDecision::permit().with_resource(json!(name)));
        let both = [transformed("a"), transformed("b")];

        let combined = combine(CombiningAlgorithmId::PermitOverrides, &both);
        assert_eq!(combined.authorization.decision, Decision::Indeterminate);
        assert_eq!(combined.error, Some(EvalError::TransformationConflict { count: 2 }));
        assert_eq!(decision(CombiningAlgorithmId::DenyUnlessPermit, &both), Decision::Deny);
        assert_eq!(decision(CombiningAlgorithmId::PermitUnlessDeny, &both), Decision::Deny);

        let single = combine(CombiningAlgorithmId::PermitOverrides, &[permit("a"), transformed("b")]);
        assert_eq!(single.authorization.resource, Some(json!("b")));
    }

    #[test]
    fn conflicting_deny_transformations() {
        let transformed = |name: &str| doc(name, AuthorizationDecision::deny().with_resource(json!(name)));
        let both = [transformed("a"), transformed("b")];

        for algorithm in [CombiningAlgorithmId::DenyOverrides, CombiningAlgorithmId::PermitOverrides] {
            let combined = combine(algorithm, &both);
            assert_eq!(combined.authorization.decision, Decision::Indeterminate);
            assert_eq!(combined.error, Some(EvalError::TransformationConflict { count: 2 }));
        }
        let plain = combine(CombiningAlgorithmId::PermitUnlessDeny, &both);
        assert_eq!(plain.authorization, AuthorizationDecision::deny());

        let single = combine(CombiningAlgorithmId::DenyOverrides, &[deny("a"), transformed("b")]);
        assert_eq!(single.authorization.resource, Some(json!("b")));
    }

    #[tokio::test]
    async fn first_applicable_stream_is_lazy() {
        struct Exploding;
        impl Evaluable for Exploding {
            fn name(&self) -> &str {
                "exploding"
            }
            fn evaluate(&self, _ctx: &EvaluationContext) -> BoxStream<'static, DocumentDecision> {
                panic!("must not be subscribed")
            }
        }
        let units: Vec<Arc<dyn Evaluable>> = vec![Arc::new(permit("a")), Arc::new(Exploding)];
        let mut s = combine_units(CombiningAlgorithmId::FirstApplicable, units, &EvaluationContext::default());
        let combined = s.next().await.expect("no decision");
        assert_eq!(combined.authorization.decision, Decision::Permit);
    }

    #[tokio::test]
    async fn streaming_combination_matches_pure() {
        let decisions = vec![na("a"), deny("b"), permit("c")];
        for algorithm in CombiningAlgorithmId::ALL {
            let units: Vec<Arc<dyn Evaluable>> =
                decisions.iter().cloned().map(|d| Arc::new(d) as Arc<dyn Evaluable>).collect();
            let mut s = combine_units(algorithm, units, &EvaluationContext::default());
            let streamed = s.next().await.expect("no decision");
            assert_eq!(streamed.authorization, combine(algorithm, &decisions).authorization);
        }
    }
}
