//! Attribute finders (policy information points).
//!
//! An attribute finder turns a left-hand value and parameters into a
//! *stream* of values. Finders are registered by fully-qualified name in
//! an [`AttributeRegistry`] that is built at start-up and passed through
//! the evaluation context.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio_stream::wrappers::{IntervalStream, WatchStream};

use crate::context::Variables;
use crate::error::{EvalError, ReferenceKind};
use crate::stream::{just, with_initial_timeout, ValStream};
use crate::value::Val;

/// A source of live attribute values.
///
/// Implementations may return finite or infinite streams. A finder that
/// never emits stalls the branch that depends on it; configure an
/// attribute timeout to surface that as an error instead.
pub trait AttributeFinder: Send + Sync {
    fn find(&self, left: Val, arguments: Vec<Val>, variables: &Variables) -> ValStream;
}

#[derive(Clone, Default)]
pub struct AttributeRegistry {
    finders: HashMap<String, Arc<dyn AttributeFinder>>,
}

impl AttributeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, finder: Arc<dyn AttributeFinder>) {
        self.finders.insert(name.into(), finder);
    }

    pub fn is_provided(&self, name: &str) -> bool {
        self.finders.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.finders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Subscribe to the attribute `name`.
    ///
    /// An unregistered name yields a single `UnresolvedReference` error.
    pub fn evaluate(
        &self,
        name: &str,
        left: Val,
        arguments: Vec<Val>,
        variables: &Variables,
        timeout: Option<Duration>,
    ) -> ValStream {
        let Some(finder) = self.finders.get(name) else {
            return just(Val::Error(EvalError::UnresolvedReference {
                kind: ReferenceKind::Attribute,
                name: name.to_string(),
            }));
        };
        let values = finder.find(left, arguments, variables);
        match timeout {
            Some(timeout) => with_initial_timeout(values, name.to_string(), timeout),
            None => values,
        }
    }
}

impl fmt::Debug for AttributeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeRegistry")
            .field("finders", &self.names())
            .finish()
    }
}

// ── Reference finders ───────────────────────────────────────────────

/// Replays a fixed sequence of values, then stays subscribed without
/// emitting further.
#[derive(Debug, Clone)]
pub struct StaticAttributeFinder {
    values: Vec<Val>,
}

impl StaticAttributeFinder {
    pub fn new(values: Vec<Val>) -> Self {
        Self { values }
    }

    pub fn single(value: Val) -> Self {
        Self::new(vec![value])
    }
}

impl AttributeFinder for StaticAttributeFinder {
    fn find(&self, _left: Val, _arguments: Vec<Val>, _variables: &Variables) -> ValStream {
        stream::iter(self.values.clone())
            .chain(stream::pending())
            .boxed()
    }
}

/// A live attribute whose current value is pushed by the host.
///
/// Every subscription first sees the current value, then each published
/// update. Publishing the same value again is delivered as a new item;
/// de-duplication happens downstream.
#[derive(Debug)]
pub struct WatchAttributeFinder {
    sender: watch::Sender<Val>,
}

impl WatchAttributeFinder {
    pub fn new(initial: Val) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    pub fn publish(&self, value: Val) {
        self.sender.send_replace(value);
    }

    /// Number of open subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl AttributeFinder for WatchAttributeFinder {
    fn find(&self, _left: Val, _arguments: Vec<Val>, _variables: &Variables) -> ValStream {
        WatchStream::new(self.sender.subscribe()).boxed()
    }
}

/// `time.now(intervalMillis = 1000)`: the current UTC time as RFC 3339,
/// re-emitted on every interval tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockAttributeFinder;

impl ClockAttributeFinder {
    pub const NAME: &'static str = "time.now";
    const DEFAULT_INTERVAL_MS: u64 = 1000;
}

impl AttributeFinder for ClockAttributeFinder {
    fn find(&self, _left: Val, arguments: Vec<Val>, _variables: &Variables) -> ValStream {
        let millis = match arguments.first() {
            None => Self::DEFAULT_INTERVAL_MS,
            Some(v) => match v.get().and_then(serde_json::Value::as_u64) {
                Some(ms) if ms > 0 => ms,
                _ => {
                    return just(Val::Error(EvalError::type_mismatch(format!(
                        "{} expects a positive interval in milliseconds, got {}",
                        Self::NAME,
                        v.kind()
                    ))))
                }
            },
        };
        let interval = tokio::time::interval(Duration::from_millis(millis));
        IntervalStream::new(interval).map(|_| now_rfc3339()).boxed()
    }
}

fn now_rfc3339() -> Val {
    use time::format_description::well_known::Rfc3339;
    match time::OffsetDateTime::now_utc().format(&Rfc3339) {
        Ok(ts) => Val::of(ts),
        Err(e) => Val::Error(EvalError::type_mismatch(format!(
            "clock could not format timestamp: {}",
            e
        ))),
    }
}
