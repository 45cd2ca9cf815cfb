//! Sieve streaming policy evaluator.
//!
//! Accepts policy documents (see `sieve-interchange`) and authorization
//! subscriptions, and produces live streams of authorization decisions.
//! Every expression evaluates to a stream; when an attribute a policy
//! depends on changes, the affected expressions recompute and the decision
//! stream emits again if the decision changed.
//!
//! The entry point is [`EmbeddedPolicyDecisionPoint`]:
//!
//! ```no_run
//! # async fn run(documents: Vec<sieve_interchange::PolicyDocument>) {
//! use std::sync::Arc;
//! use sieve_eval::{
//!     AuthorizationSubscription, EmbeddedPolicyDecisionPoint, PolicyDecisionPoint,
//!     StaticPolicyRetrievalPoint,
//! };
//!
//! let pdp = EmbeddedPolicyDecisionPoint::builder()
//!     .retrieval(Arc::new(StaticPolicyRetrievalPoint::new(documents)))
//!     .build();
//! let subscription = AuthorizationSubscription::new(
//!     serde_json::json!("alice"),
//!     serde_json::json!("read"),
//!     serde_json::json!({"id": 7}),
//! );
//! let decision = pdp.decide_once(subscription).await;
//! # }
//! ```

pub mod attributes;
pub mod combining;
pub mod config;
pub mod context;
pub mod decision;
pub mod error;
pub mod expression;
pub mod filter;
pub mod functions;
pub mod interceptor;
pub mod numeric;
pub mod pdp;
pub mod policy;
pub mod prp;
pub mod selection;
pub mod steps;
pub mod stream;
pub mod value;

pub use attributes::{
    AttributeFinder, AttributeRegistry, ClockAttributeFinder, StaticAttributeFinder,
    WatchAttributeFinder,
};
pub use combining::{combine, combine_units, Combined};
pub use config::{
    ConfigError, PdpConfiguration, PdpConfigurationProvider, StaticConfigurationProvider,
    WatchConfigurationProvider,
};
pub use context::{EvaluationContext, Variables};
pub use decision::{
    AuthorizationDecision, AuthorizationSubscription, Decision, DocumentDecision,
    IdentifiableAuthorizationDecision, MultiAuthorizationSubscription,
};
pub use error::{EvalError, ReferenceKind};
pub use expression::{evaluate, evaluate_all};
pub use functions::FunctionRegistry;
pub use interceptor::{DecisionInterceptor, DecisionTrace, DocumentReport, ReportingDecisionInterceptor};
pub use pdp::{EmbeddedPolicyDecisionPoint, EmbeddedPolicyDecisionPointBuilder, PolicyDecisionPoint};
pub use policy::Evaluable;
pub use prp::{
    PolicyRetrievalPoint, PolicyRetrievalResult, StaticPolicyRetrievalPoint,
    WatchPolicyRetrievalPoint,
};
pub use stream::ValStream;
pub use value::Val;
