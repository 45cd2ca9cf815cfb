//! Policy retrieval.
//!
//! A policy retrieval point streams the candidate documents for a
//! subscription. A new item replaces the previous candidate set; the
//! decision pipeline rebuilds from it. A completed stream means retrieval
//! is permanently unavailable.

use std::sync::{Arc, Mutex};

use futures::stream::{BoxStream, StreamExt};
use sieve_interchange::PolicyDocument;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

use crate::decision::AuthorizationSubscription;
use crate::stream::once_then_pending;

/// Candidate documents for one subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyRetrievalResult {
    pub documents: Vec<Arc<PolicyDocument>>,
    /// Retrieval failed to evaluate some document's target; enters the
    /// combination as one INDETERMINATE decision.
    pub errors_in_target: bool,
}

impl PolicyRetrievalResult {
    pub fn new(documents: Vec<PolicyDocument>) -> Self {
        PolicyRetrievalResult {
            documents: documents.into_iter().map(Arc::new).collect(),
            errors_in_target: false,
        }
    }

    pub fn with_errors_in_target(mut self) -> Self {
        self.errors_in_target = true;
        self
    }
}

pub trait PolicyRetrievalPoint: Send + Sync {
    fn retrieve(
        &self,
        subscription: &AuthorizationSubscription,
    ) -> BoxStream<'static, PolicyRetrievalResult>;
}

/// Serves a fixed document set to every subscription.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicyRetrievalPoint {
    result: PolicyRetrievalResult,
}

impl StaticPolicyRetrievalPoint {
    pub fn new(documents: Vec<PolicyDocument>) -> Self {
        StaticPolicyRetrievalPoint {
            result: PolicyRetrievalResult::new(documents),
        }
    }

    pub fn from_result(result: PolicyRetrievalResult) -> Self {
        StaticPolicyRetrievalPoint { result }
    }
}

impl PolicyRetrievalPoint for StaticPolicyRetrievalPoint {
    fn retrieve(&self, _subscription: &AuthorizationSubscription) -> BoxStream<'static, PolicyRetrievalResult> {
        once_then_pending(self.result.clone())
    }
}

/// A document set the host can replace at runtime.
///
/// Every open decision stream sees each [`reload`](Self::reload).
/// [`close`](Self::close) ends every retrieval stream, which completes the
/// decision streams built on it.
#[derive(Debug)]
pub struct WatchPolicyRetrievalPoint {
    sender: Mutex<Option<watch::Sender<PolicyRetrievalResult>>>,
    receiver: watch::Receiver<PolicyRetrievalResult>,
}

impl WatchPolicyRetrievalPoint {
    pub fn new(initial: PolicyRetrievalResult) -> Self {
        let (sender, receiver) = watch::channel(initial);
        WatchPolicyRetrievalPoint {
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }

    /// Publish a new candidate set. Returns `false` once closed.
    pub fn reload(&self, result: PolicyRetrievalResult) -> bool {
        let guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            Some(sender) => {
                debug!(documents = result.documents.len(), "policy documents reloaded");
                sender.send_replace(result);
                true
            }
            None => false,
        }
    }

    /// Signal permanent unavailability.
    pub fn close(&self) {
        let mut guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.take().is_some() {
            debug!("policy retrieval closed");
        }
    }
}

impl PolicyRetrievalPoint for WatchPolicyRetrievalPoint {
    fn retrieve(&self, _subscription: &AuthorizationSubscription) -> BoxStream<'static, PolicyRetrievalResult> {
        WatchStream::new(self.receiver.clone()).boxed()
    }
}
