//! Decision streams through the embedded PDP.
//!
//! These tests drive the live sources (attributes, retrieval, configuration)
//! and observe what the decision stream does in response: when it emits,
//! when it stays silent and when it completes.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use sieve_eval::{
    AuthorizationDecision, AuthorizationSubscription, Decision, EmbeddedPolicyDecisionPoint,
    MultiAuthorizationSubscription, PdpConfiguration, PolicyDecisionPoint, PolicyRetrievalResult,
    StaticPolicyRetrievalPoint, Val, WatchAttributeFinder, WatchConfigurationProvider,
    WatchPolicyRetrievalPoint,
};
use sieve_interchange::{from_interchange, CombiningAlgorithmId, PolicyDocument};

// ──────────────────────────────────────────────
// Test helpers
// ──────────────────────────────────────────────

const QUIET: Duration = Duration::from_millis(50);

fn document(value: Value) -> PolicyDocument {
    from_interchange(&value).expect("valid document")
}

fn permit_all() -> PolicyDocument {
    document(json!({"kind": "policy", "name": "permit-all", "entitlement": "permit"}))
}

fn deny_all() -> PolicyDocument {
    document(json!({"kind": "policy", "name": "deny-all", "entitlement": "deny"}))
}

/// Permits while the subject's `test.level` attribute is at least 3.
fn level_policy() -> PolicyDocument {
    document(json!({
        "kind": "policy",
        "name": "level",
        "entitlement": "permit",
        "body": [{"kind": "condition", "expression": {
            "kind": "binary", "operator": "ge",
            "left": {"kind": "identifier", "name": "subject",
                     "steps": [{"kind": "attribute_finder", "name": "test.level"}]},
            "right": {"kind": "literal", "value": 3}
        }}]
    }))
}

fn subscription(action: &str) -> AuthorizationSubscription {
    AuthorizationSubscription::new(json!("alice"), json!(action), json!("doc"))
}

fn level_pdp(level: Arc<WatchAttributeFinder>) -> EmbeddedPolicyDecisionPoint {
    EmbeddedPolicyDecisionPoint::builder()
        .retrieval(Arc::new(StaticPolicyRetrievalPoint::new(vec![level_policy()])))
        .attribute_finder("test.level", level)
        .build()
}

async fn next(stream: &mut BoxStream<'static, AuthorizationDecision>) -> Decision {
    stream
        .next()
        .await
        .expect("decision stream ended early")
        .decision
}

async fn stays_quiet<T>(stream: &mut BoxStream<'static, T>) -> bool {
    tokio::time::timeout(QUIET, stream.next()).await.is_err()
}

// ──────────────────────────────────────────────
// attribute-driven updates
// ──────────────────────────────────────────────

#[tokio::test]
async fn static_inputs_yield_exactly_one_decision() {
    let pdp = EmbeddedPolicyDecisionPoint::builder()
        .retrieval(Arc::new(StaticPolicyRetrievalPoint::new(vec![permit_all()])))
        .build();
    let mut decisions = pdp.decide(subscription("read"));
    assert_eq!(next(&mut decisions).await, Decision::Permit);
    assert!(stays_quiet(&mut decisions).await);
}

#[tokio::test]
async fn attribute_change_updates_decision() {
    let level = Arc::new(WatchAttributeFinder::new(Val::of(5)));
    let mut decisions = level_pdp(level.clone()).decide(subscription("read"));
    assert_eq!(next(&mut decisions).await, Decision::Permit);

    level.publish(Val::of(1));
    assert_eq!(next(&mut decisions).await, Decision::NotApplicable);

    level.publish(Val::of(4));
    assert_eq!(next(&mut decisions).await, Decision::Permit);
}

#[tokio::test]
async fn unchanged_decision_is_not_repeated() {
    let level = Arc::new(WatchAttributeFinder::new(Val::of(5)));
    let mut decisions = level_pdp(level.clone()).decide(subscription("read"));
    assert_eq!(next(&mut decisions).await, Decision::Permit);

    level.publish(Val::of(5));
    assert!(stays_quiet(&mut decisions).await);

    // A different value with the same outcome is suppressed as well.
    level.publish(Val::of(9));
    assert!(stays_quiet(&mut decisions).await);
}

#[tokio::test]
async fn dropping_the_stream_releases_attribute_subscriptions() {
    let level = Arc::new(WatchAttributeFinder::new(Val::of(5)));
    let mut decisions = level_pdp(level.clone()).decide(subscription("read"));
    assert_eq!(next(&mut decisions).await, Decision::Permit);
    assert!(level.subscriber_count() > 0);

    drop(decisions);
    assert_eq!(level.subscriber_count(), 0);
}

#[tokio::test]
async fn attribute_errors_are_indeterminate() {
    let level = Arc::new(WatchAttributeFinder::new(Val::of("high")));
    let mut decisions = level_pdp(level.clone()).decide(subscription("read"));
    assert_eq!(next(&mut decisions).await, Decision::Indeterminate);

    level.publish(Val::of(3));
    assert_eq!(next(&mut decisions).await, Decision::Permit);
}

// ──────────────────────────────────────────────
// retrieval
// ──────────────────────────────────────────────

#[tokio::test]
async fn reload_reevaluates_and_close_completes() {
    let retrieval = Arc::new(WatchPolicyRetrievalPoint::new(PolicyRetrievalResult::new(vec![
        permit_all(),
    ])));
    let pdp = EmbeddedPolicyDecisionPoint::builder()
        .retrieval(retrieval.clone())
        .build();
    let mut decisions = pdp.decide(subscription("read"));
    assert_eq!(next(&mut decisions).await, Decision::Permit);

    assert!(retrieval.reload(PolicyRetrievalResult::new(vec![permit_all(), deny_all()])));
    assert_eq!(next(&mut decisions).await, Decision::Deny);

    assert!(retrieval.reload(PolicyRetrievalResult::new(vec![deny_all()])));
    assert!(stays_quiet(&mut decisions).await);

    retrieval.close();
    assert!(decisions.next().await.is_none());
    assert!(!retrieval.reload(PolicyRetrievalResult::default()));
}

#[tokio::test]
async fn reload_cancels_previous_attribute_subscriptions() {
    let level = Arc::new(WatchAttributeFinder::new(Val::of(5)));
    let retrieval = Arc::new(WatchPolicyRetrievalPoint::new(PolicyRetrievalResult::new(vec![
        level_policy(),
    ])));
    let pdp = EmbeddedPolicyDecisionPoint::builder()
        .retrieval(retrieval.clone())
        .attribute_finder("test.level", level.clone())
        .build();
    let mut decisions = pdp.decide(subscription("read"));
    assert_eq!(next(&mut decisions).await, Decision::Permit);
    assert!(level.subscriber_count() > 0);

    retrieval.reload(PolicyRetrievalResult::new(vec![deny_all()]));
    assert_eq!(next(&mut decisions).await, Decision::Deny);
    assert_eq!(level.subscriber_count(), 0);
}

// ──────────────────────────────────────────────
// configuration
// ──────────────────────────────────────────────

#[tokio::test]
async fn configuration_update_switches_algorithm() {
    let configuration = Arc::new(WatchConfigurationProvider::new(PdpConfiguration::default()));
    let pdp = EmbeddedPolicyDecisionPoint::builder()
        .retrieval(Arc::new(StaticPolicyRetrievalPoint::new(vec![
            permit_all(),
            deny_all(),
        ])))
        .configuration(configuration.clone())
        .build();
    let mut decisions = pdp.decide(subscription("read"));
    assert_eq!(next(&mut decisions).await, Decision::Deny);

    configuration
        .update(PdpConfiguration::default().with_algorithm(CombiningAlgorithmId::PermitOverrides))
        .unwrap();
    assert_eq!(next(&mut decisions).await, Decision::Permit);

    let rejected = PdpConfiguration::default().with_algorithm(CombiningAlgorithmId::FirstApplicable);
    assert!(configuration.update(rejected).is_err());
    assert!(stays_quiet(&mut decisions).await);
}

// ──────────────────────────────────────────────
// multi-subscriptions
// ──────────────────────────────────────────────

#[tokio::test]
async fn decide_all_tags_each_subscription() {
    let read_only = document(json!({
        "kind": "policy",
        "name": "read-only",
        "entitlement": "permit",
        "target": {"kind": "binary", "operator": "eq",
                   "left": {"kind": "identifier", "name": "action"},
                   "right": {"kind": "literal", "value": "read"}}
    }));
    let pdp = EmbeddedPolicyDecisionPoint::builder()
        .retrieval(Arc::new(StaticPolicyRetrievalPoint::new(vec![read_only])))
        .build();
    let multi = MultiAuthorizationSubscription::new()
        .with("r", subscription("read"))
        .with("w", subscription("write"));

    let mut results: Vec<(String, Decision)> = pdp
        .decide_all(multi)
        .take(2)
        .map(|d| (d.subscription_id, d.decision.decision))
        .collect()
        .await;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        results,
        vec![
            ("r".to_string(), Decision::Permit),
            ("w".to_string(), Decision::NotApplicable)
        ]
    );
}
