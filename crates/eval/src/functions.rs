//! Function registry: synchronous, side-effect-free functions keyed by
//! fully-qualified name (`library.name`).
//!
//! The registry is built at start-up and shared read-only through the
//! evaluation context. Calling an unknown name yields
//! `EvalError::UnresolvedReference` as a value, never a panic.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value as Json;

use crate::error::{EvalError, ReferenceKind};
use crate::value::Val;

/// A registered function. Receives already-evaluated arguments.
pub type Function = Arc<dyn Fn(&[Val]) -> Val + Send + Sync>;

#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Function>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the `standard` and `filter` libraries.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register("standard.length", standard_length);
        registry.register("standard.numberToString", standard_number_to_string);
        registry.register("filter.blacken", filter_blacken);
        registry.register("filter.replace", filter_replace);
        registry
    }

    /// Register (or replace) a function under a fully-qualified name.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&[Val]) -> Val + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn is_provided(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Invoke `name` with `arguments`.
    pub fn call(&self, name: &str, arguments: &[Val]) -> Val {
        match self.functions.get(name) {
            Some(function) => function(arguments),
            None => Val::Error(EvalError::UnresolvedReference {
                kind: ReferenceKind::Function,
                name: name.to_string(),
            }),
        }
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

// ── Built-in libraries ──────────────────────────────────────────────

fn arity_error(name: &str, expected: &str, got: usize) -> Val {
    Val::Error(EvalError::type_mismatch(format!(
        "{} expects {} argument(s), got {}",
        name, expected, got
    )))
}

fn standard_length(args: &[Val]) -> Val {
    let [value] = args else {
        return arity_error("standard.length", "1", args.len());
    };
    match value {
        Val::Defined(Json::String(s)) => Val::of(s.chars().count()),
        Val::Defined(Json::Array(a)) => Val::of(a.len()),
        Val::Defined(Json::Object(o)) => Val::of(o.len()),
        other => Val::Error(EvalError::type_mismatch(format!(
            "standard.length expects a string, array or object, got {}",
            other.kind()
        ))),
    }
}

fn standard_number_to_string(args: &[Val]) -> Val {
    match args {
        [Val::Defined(Json::Number(n))] => Val::of(n.to_string()),
        [other] => Val::Error(EvalError::type_mismatch(format!(
            "standard.numberToString expects a number, got {}",
            other.kind()
        ))),
        _ => arity_error("standard.numberToString", "1", args.len()),
    }
}

/// `filter.blacken(text, discloseLeft = 0, discloseRight = 0, replacement = "X")`
///
/// Replaces every character of `text` except the disclosed prefix and
/// suffix with `replacement`.
fn filter_blacken(args: &[Val]) -> Val {
    if args.is_empty() || args.len() > 4 {
        return arity_error("filter.blacken", "1 to 4", args.len());
    }
    let Some(text) = args[0].get().and_then(Json::as_str) else {
        return Val::Error(EvalError::type_mismatch(format!(
            "filter.blacken expects a string, got {}",
            args[0].kind()
        )));
    };
    let count = |i: usize| -> Result<usize, EvalError> {
        match args.get(i) {
            None => Ok(0),
            Some(v) => v.get().and_then(Json::as_u64).map(|n| n as usize).ok_or_else(|| {
                EvalError::type_mismatch("filter.blacken disclosure counts must be non-negative integers")
            }),
        }
    };
    let (left, right) = match (count(1), count(2)) {
        (Ok(l), Ok(r)) => (l, r),
        (Err(e), _) | (_, Err(e)) => return Val::Error(e),
    };
    let replacement = match args.get(3) {
        None => "X".to_string(),
        Some(Val::Defined(Json::String(s))) => s.clone(),
        Some(other) => {
            return Val::Error(EvalError::type_mismatch(format!(
                "filter.blacken replacement must be a string, got {}",
                other.kind()
            )))
        }
    };

    let chars: Vec<char> = text.chars().collect();
    if left + right >= chars.len() {
        return Val::of(text);
    }
    let mut out: String = chars[..left].iter().collect();
    for _ in left..chars.len() - right {
        out.push_str(&replacement);
    }
    out.extend(&chars[chars.len() - right..]);
    Val::of(out)
}

/// `filter.replace(original, replacement)` returns `replacement`.
fn filter_replace(args: &[Val]) -> Val {
    match args {
        [_, replacement] => replacement.clone(),
        _ => arity_error("filter.replace", "2", args.len()),
    }
}
