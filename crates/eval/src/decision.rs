//! Authorization subscriptions and decisions.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::EvalError;

/// The four-valued outcome of evaluating a policy document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Permit,
    Deny,
    Indeterminate,
    NotApplicable,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Permit => "PERMIT",
            Decision::Deny => "DENY",
            Decision::Indeterminate => "INDETERMINATE",
            Decision::NotApplicable => "NOT_APPLICABLE",
        };
        f.write_str(s)
    }
}

/// A decision together with the constraints the enforcement point must
/// honour.
///
/// `resource` is present only when a transformation replaced the
/// requested resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationDecision {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Json>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub obligations: Vec<Json>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advice: Vec<Json>,
}

impl AuthorizationDecision {
    pub fn new(decision: Decision) -> Self {
        AuthorizationDecision {
            decision,
            resource: None,
            obligations: Vec::new(),
            advice: Vec::new(),
        }
    }

    pub fn permit() -> Self {
        Self::new(Decision::Permit)
    }

    pub fn deny() -> Self {
        Self::new(Decision::Deny)
    }

    pub fn indeterminate() -> Self {
        Self::new(Decision::Indeterminate)
    }

    pub fn not_applicable() -> Self {
        Self::new(Decision::NotApplicable)
    }

    pub fn with_resource(mut self, resource: Json) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn with_obligations(mut self, obligations: Vec<Json>) -> Self {
        self.obligations = obligations;
        self
    }

    pub fn with_advice(mut self, advice: Vec<Json>) -> Self {
        self.advice = advice;
        self
    }
}

/// The four elements a decision is requested for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationSubscription {
    pub subject: Json,
    pub action: Json,
    pub resource: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Json>,
}

impl AuthorizationSubscription {
    pub fn new(subject: Json, action: Json, resource: Json) -> Self {
        AuthorizationSubscription {
            subject,
            action,
            resource,
            environment: None,
        }
    }

    pub fn with_environment(mut self, environment: Json) -> Self {
        self.environment = Some(environment);
        self
    }
}

/// Several subscriptions keyed by a caller-chosen id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiAuthorizationSubscription {
    pub subscriptions: BTreeMap<String, AuthorizationSubscription>,
}

impl MultiAuthorizationSubscription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: impl Into<String>, subscription: AuthorizationSubscription) -> Self {
        self.subscriptions.insert(id.into(), subscription);
        self
    }
}

/// A decision for one member of a [`MultiAuthorizationSubscription`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifiableAuthorizationDecision {
    pub subscription_id: String,
    pub decision: AuthorizationDecision,
}

/// The decision of one policy or policy set, with the error that made it
/// indeterminate (if any).
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentDecision {
    pub document: String,
    pub authorization: AuthorizationDecision,
    pub error: Option<EvalError>,
}

impl DocumentDecision {
    pub fn new(document: impl Into<String>, authorization: AuthorizationDecision) -> Self {
        DocumentDecision {
            document: document.into(),
            authorization,
            error: None,
        }
    }

    pub fn not_applicable(document: impl Into<String>) -> Self {
        Self::new(document, AuthorizationDecision::not_applicable())
    }

    pub fn indeterminate(document: impl Into<String>, error: EvalError) -> Self {
        DocumentDecision {
            document: document.into(),
            authorization: AuthorizationDecision::indeterminate(),
            error: Some(error),
        }
    }

    pub fn decision(&self) -> Decision {
        self.authorization.decision
    }
}
