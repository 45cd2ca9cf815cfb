//! The tri-state value every expression evaluates to.
//!
//! A [`Val`] is either a defined JSON node, `Undefined` (absence, e.g. a
//! missing key) or an `Error`. Operators are total over all three states:
//! absence propagates as `Undefined`, failures as `Error`.

use std::fmt;

use serde_json::Value as Json;

use crate::error::EvalError;
use crate::numeric;

#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    Defined(Json),
    Undefined,
    Error(EvalError),
}

impl Val {
    pub const TRUE: Val = Val::Defined(Json::Bool(true));
    pub const FALSE: Val = Val::Defined(Json::Bool(false));
    pub const NULL: Val = Val::Defined(Json::Null);

    pub fn of(value: impl Into<Json>) -> Val {
        Val::Defined(value.into())
    }

    pub fn error(err: EvalError) -> Val {
        Val::Error(err)
    }

    pub fn is_defined(&self) -> bool {
        matches!(self, Val::Defined(_))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Val::Undefined)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Val::Error(_))
    }

    /// The JSON payload, if defined.
    pub fn get(&self) -> Option<&Json> {
        match self {
            Val::Defined(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_json(self) -> Option<Json> {
        match self {
            Val::Defined(v) => Some(v),
            _ => None,
        }
    }

    /// `Some(b)` only for a defined boolean.
    pub fn as_bool(&self) -> Option<bool> {
        self.get().and_then(Json::as_bool)
    }

    /// Name of the value's kind, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Val::Defined(v) => json_kind(v),
            Val::Undefined => "undefined",
            Val::Error(_) => "error",
        }
    }

    /// Require a defined boolean, reporting `context` on mismatch.
    pub fn require_bool(&self, context: &str) -> Result<bool, EvalError> {
        self.as_bool().ok_or_else(|| {
            EvalError::type_mismatch(format!(
                "{} expects a boolean, got {}",
                context,
                self.kind()
            ))
        })
    }
}

impl From<Json> for Val {
    fn from(value: Json) -> Self {
        Val::Defined(value)
    }
}

impl From<bool> for Val {
    fn from(value: bool) -> Self {
        Val::Defined(Json::Bool(value))
    }
}

impl From<EvalError> for Val {
    fn from(err: EvalError) -> Self {
        Val::Error(err)
    }
}

impl From<Result<Json, EvalError>> for Val {
    fn from(result: Result<Json, EvalError>) -> Self {
        match result {
            Ok(v) => Val::Defined(v),
            Err(e) => Val::Error(e),
        }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Defined(v) => write!(f, "{}", v),
            Val::Undefined => write!(f, "undefined"),
            Val::Error(e) => write!(f, "ERROR[{}]", e),
        }
    }
}

pub fn json_kind(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

/// Text used when a value is concatenated onto a string: strings as-is,
/// everything else as JSON.
pub fn render(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Equality of two defined JSON nodes: numbers by decimal value, all other
/// kinds structurally.
pub fn json_equals(left: &Json, right: &Json) -> bool {
    match (left, right) {
        (Json::Number(l), Json::Number(r)) => match (numeric::to_decimal(l), numeric::to_decimal(r)) {
            (Ok(l), Ok(r)) => l == r,
            _ => l.as_f64() == r.as_f64(),
        },
        _ => left == right,
    }
}

/// `==` over the full tri-state domain.
///
/// Two undefined operands are equal, exactly one undefined operand is
/// unequal, and an error on either side propagates.
pub fn equals(left: &Val, right: &Val) -> Val {
    match (left, right) {
        (Val::Error(e), _) | (_, Val::Error(e)) => Val::Error(e.clone()),
        (Val::Undefined, Val::Undefined) => Val::TRUE,
        (Val::Undefined, _) | (_, Val::Undefined) => Val::FALSE,
        (Val::Defined(l), Val::Defined(r)) => Val::from(json_equals(l, r)),
    }
}

/// `!=`, the complement of [`equals`].
pub fn not_equals(left: &Val, right: &Val) -> Val {
    match equals(left, right) {
        Val::Defined(Json::Bool(b)) => Val::from(!b),
        other => other,
    }
}
