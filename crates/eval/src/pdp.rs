//! Policy decision point: the decision stream coordinator.
//!
//! For one subscription the embedded PDP chains:
//!
//! 1. policy retrieval (a new candidate set rebuilds everything below it;
//!    the end of retrieval ends the decision stream),
//! 2. the PDP configuration (a new configuration rebuilds everything below),
//! 3. live evaluation and combination of the candidate documents,
//! 4. decision interceptors, in ascending priority,
//! 5. suppression of consecutive identical decisions.
//!
//! Dropping the returned stream tears the whole chain down, including
//! every attribute subscription it opened.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, trace};

use crate::attributes::{AttributeFinder, AttributeRegistry};
use crate::combining::combine_units;
use crate::config::{PdpConfiguration, PdpConfigurationProvider, StaticConfigurationProvider};
use crate::context::EvaluationContext;
use crate::decision::{
    AuthorizationDecision, AuthorizationSubscription, DocumentDecision,
    IdentifiableAuthorizationDecision, MultiAuthorizationSubscription,
};
use crate::functions::FunctionRegistry;
use crate::interceptor::{DecisionInterceptor, DecisionTrace};
use crate::policy::Evaluable;
use crate::prp::{PolicyRetrievalPoint, PolicyRetrievalResult, StaticPolicyRetrievalPoint};
use crate::stream::{distinct_until_changed, just, switch_map, switch_map_bounded};

/// Name under which retrieval failures appear in decision traces.
pub const RETRIEVAL_DOCUMENT: &str = "policy retrieval";

#[async_trait]
pub trait PolicyDecisionPoint: Send + Sync {
    /// Live decisions for `subscription`. Never completes on its own while
    /// policies remain retrievable.
    fn decide(&self, subscription: AuthorizationSubscription) -> BoxStream<'static, AuthorizationDecision>;

    /// The first decision; INDETERMINATE if the stream ends without one.
    async fn decide_once(&self, subscription: AuthorizationSubscription) -> AuthorizationDecision {
        self.decide(subscription)
            .next()
            .await
            .unwrap_or_else(AuthorizationDecision::indeterminate)
    }

    /// Independent decision streams for several subscriptions, merged and
    /// tagged with their ids.
    fn decide_all(
        &self,
        subscriptions: MultiAuthorizationSubscription,
    ) -> BoxStream<'static, IdentifiableAuthorizationDecision> {
        let streams = subscriptions.subscriptions.into_iter().map(|(id, subscription)| {
            self.decide(subscription)
                .map(move |decision| IdentifiableAuthorizationDecision {
                    subscription_id: id.clone(),
                    decision,
                })
                .boxed()
        });
        stream::select_all(streams).boxed()
    }
}

/// A PDP that evaluates in process.
#[derive(Clone)]
pub struct EmbeddedPolicyDecisionPoint {
    retrieval: Arc<dyn PolicyRetrievalPoint>,
    configuration: Arc<dyn PdpConfigurationProvider>,
    functions: Arc<FunctionRegistry>,
    attributes: Arc<AttributeRegistry>,
    interceptors: Arc<[Arc<dyn DecisionInterceptor>]>,
}

impl std::fmt::Debug for EmbeddedPolicyDecisionPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedPolicyDecisionPoint")
            .field("functions", &self.functions)
            .field("attributes", &self.attributes)
            .field("interceptors", &self.interceptors.len())
            .finish_non_exhaustive()
    }
}

impl EmbeddedPolicyDecisionPoint {
    pub fn builder() -> EmbeddedPolicyDecisionPointBuilder {
        EmbeddedPolicyDecisionPointBuilder::default()
    }
}

#[async_trait]
impl PolicyDecisionPoint for EmbeddedPolicyDecisionPoint {
    fn decide(&self, subscription: AuthorizationSubscription) -> BoxStream<'static, AuthorizationDecision> {
        let pdp = self.clone();
        let retrieved = self.retrieval.retrieve(&subscription);
        let decisions = switch_map_bounded(retrieved, move |result: PolicyRetrievalResult| {
            let result = Arc::new(result);
            let pdp_inner = pdp.clone();
            let subscription = subscription.clone();
            switch_map(pdp.configuration.configurations(), move |config| {
                pdp_inner.evaluate(&result, config, &subscription)
            })
        });
        distinct_until_changed(decisions)
            .inspect(|d| trace!(decision = %d.decision, "emitting decision"))
            .boxed()
    }
}

impl EmbeddedPolicyDecisionPoint {
    /// Decisions for one candidate set under one configuration.
    fn evaluate(
        &self,
        result: &PolicyRetrievalResult,
        config: PdpConfiguration,
        subscription: &AuthorizationSubscription,
    ) -> BoxStream<'static, AuthorizationDecision> {
        if let Err(e) = config.validate() {
            debug!(error = %e, "rejecting configuration");
            return just(AuthorizationDecision::indeterminate());
        }
        let ctx = EvaluationContext::new(self.functions.clone(), self.attributes.clone())
            .with_attribute_timeout(config.attribute_timeout())
            .for_subscription(subscription, &config.variables);

        let mut units: Vec<Arc<dyn Evaluable>> = result
            .documents
            .iter()
            .map(|d| d.clone() as Arc<dyn Evaluable>)
            .collect();
        if result.errors_in_target {
            units.push(Arc::new(DocumentDecision {
                document: RETRIEVAL_DOCUMENT.to_string(),
                authorization: AuthorizationDecision::indeterminate(),
                error: None,
            }));
        }
        debug!(
            documents = units.len(),
            algorithm = %config.algorithm,
            "evaluating candidate documents"
        );

        let algorithm = config.algorithm;
        let subscription = subscription.clone();
        let interceptors = self.interceptors.clone();
        combine_units(algorithm, units, &ctx)
            .map(move |combined| {
                if interceptors.is_empty() {
                    return combined.authorization;
                }
                let trace = DecisionTrace::new(
                    subscription.clone(),
                    algorithm,
                    &combined.documents,
                    combined.error.as_ref().map(ToString::to_string),
                );
                interceptors
                    .iter()
                    .fold(combined.authorization, |decision, interceptor| {
                        interceptor.intercept(&trace, decision)
                    })
            })
            .boxed()
    }
}

#[derive(Default)]
pub struct EmbeddedPolicyDecisionPointBuilder {
    retrieval: Option<Arc<dyn PolicyRetrievalPoint>>,
    configuration: Option<Arc<dyn PdpConfigurationProvider>>,
    functions: Option<FunctionRegistry>,
    attributes: AttributeRegistry,
    interceptors: Vec<Arc<dyn DecisionInterceptor>>,
}

impl EmbeddedPolicyDecisionPointBuilder {
    pub fn retrieval(mut self, retrieval: Arc<dyn PolicyRetrievalPoint>) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    pub fn configuration(mut self, configuration: Arc<dyn PdpConfigurationProvider>) -> Self {
        self.configuration = Some(configuration);
        self
    }

    /// Shorthand for a fixed configuration.
    pub fn config(self, config: PdpConfiguration) -> Self {
        self.configuration(Arc::new(StaticConfigurationProvider::new(config)))
    }

    /// Replaces the standard function library.
    pub fn functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = Some(functions);
        self
    }

    pub fn attribute_finder(mut self, name: impl Into<String>, finder: Arc<dyn AttributeFinder>) -> Self {
        self.attributes.register(name, finder);
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn DecisionInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn build(self) -> EmbeddedPolicyDecisionPoint {
        let mut interceptors = self.interceptors;
        interceptors.sort_by_key(|i| i.priority());
        EmbeddedPolicyDecisionPoint {
            retrieval: self
                .retrieval
                .unwrap_or_else(|| Arc::new(StaticPolicyRetrievalPoint::default())),
            configuration: self
                .configuration
                .unwrap_or_else(|| Arc::new(StaticConfigurationProvider::default())),
            functions: Arc::new(self.functions.unwrap_or_else(FunctionRegistry::standard)),
            attributes: Arc::new(self.attributes),
            interceptors: Arc::from(interceptors),
        }
    }
}
