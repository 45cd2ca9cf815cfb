//! Decision interceptors: the diagnostic side channel.
//!
//! Interceptors see every combined decision before de-duplication,
//! together with a [`DecisionTrace`] naming the documents that produced it
//! and the errors that made any of them INDETERMINATE. Error detail never
//! reaches the [`AuthorizationDecision`] itself.

use serde::Serialize;
use sieve_interchange::CombiningAlgorithmId;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;

use crate::decision::{AuthorizationDecision, AuthorizationSubscription, Decision, DocumentDecision};

/// The outcome of one document inside a combined decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentReport {
    pub name: String,
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&DocumentDecision> for DocumentReport {
    fn from(d: &DocumentDecision) -> Self {
        DocumentReport {
            name: d.document.clone(),
            decision: d.decision(),
            error: d.error.as_ref().map(ToString::to_string),
        }
    }
}

/// How a combined decision came about.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionTrace {
    pub subscription: AuthorizationSubscription,
    pub algorithm: CombiningAlgorithmId,
    pub timestamp: String,
    pub documents: Vec<DocumentReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DecisionTrace {
    pub fn new(
        subscription: AuthorizationSubscription,
        algorithm: CombiningAlgorithmId,
        documents: &[DocumentDecision],
        error: Option<String>,
    ) -> Self {
        DecisionTrace {
            subscription,
            algorithm,
            timestamp: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
            documents: documents.iter().map(DocumentReport::from).collect(),
            error,
        }
    }
}

/// Observes (and may rewrite) combined decisions.
pub trait DecisionInterceptor: Send + Sync {
    /// Lower runs first.
    fn priority(&self) -> i32 {
        0
    }

    fn intercept(&self, trace: &DecisionTrace, decision: AuthorizationDecision) -> AuthorizationDecision;
}

/// Logs every decision with its trace.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportingDecisionInterceptor {
    pretty: bool,
}

impl ReportingDecisionInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render the report as indented JSON.
    pub fn pretty(mut self) -> Self {
        self.pretty = true;
        self
    }

    /// The report logged for `decision`.
    pub fn report(&self, trace: &DecisionTrace, decision: &AuthorizationDecision) -> String {
        let report = serde_json::json!({
            "decision": decision,
            "trace": trace,
        });
        let rendered = if self.pretty {
            serde_json::to_string_pretty(&report)
        } else {
            serde_json::to_string(&report)
        };
        rendered.unwrap_or_else(|e| format!("unrenderable decision report: {}", e))
    }
}

impl DecisionInterceptor for ReportingDecisionInterceptor {
    fn priority(&self) -> i32 {
        i32::MAX
    }

    fn intercept(&self, trace: &DecisionTrace, decision: AuthorizationDecision) -> AuthorizationDecision {
        info!(
            decision = %decision.decision,
            algorithm = %trace.algorithm,
            documents = trace.documents.len(),
            report = %self.report(trace, &decision),
            "authorization decision"
        );
        decision
    }
}
