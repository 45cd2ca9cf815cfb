/// Errors raised while evaluating expressions, steps, filters and policies.
///
/// Evaluation never panics on policy or attribute data. Every failure is
/// carried as a value (`Val::Error`) and collapses to INDETERMINATE at the
/// nearest policy boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    /// An operator or step applied to a value of the wrong shape.
    #[error("type mismatch: {message}")]
    TypeMismatch { message: String },

    /// An operator that cannot produce a total result from an undefined operand.
    #[error("undefined operand: {message}")]
    UndefinedOperand { message: String },

    /// A function or attribute finder name that is not registered.
    #[error("unresolved {kind} '{name}'")]
    UnresolvedReference { kind: ReferenceKind, name: String },

    /// Each-mode misuse, a missing filter target, or a non-array each target.
    #[error("filter target error: {message}")]
    FilterTargetError { message: String },

    /// More than one contributing decision supplies a resource transformation.
    #[error("transformation conflict: {count} policies supply a transformation")]
    TransformationConflict { count: usize },

    /// only-one-applicable saw more than one applicable decision.
    #[error("ambiguous policy set: {applicable} applicable decisions")]
    AmbiguousPolicySet { applicable: usize },

    /// Index step outside the bounds of the array.
    #[error("index {index} out of range for array of length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    /// Decimal overflow, division by zero, or a result JSON cannot hold.
    #[error("arithmetic error: {message}")]
    Arithmetic { message: String },

    /// An attribute finder step in a context that forbids them (targets).
    #[error("attribute finder '{name}' is not allowed in a target expression")]
    AttributeInTarget { name: String },

    /// An attribute finder produced no value within the configured deadline.
    #[error("attribute finder '{name}' produced no value within {millis} ms")]
    AttributeTimeout { name: String, millis: u64 },
}

impl EvalError {
    pub fn type_mismatch(message: impl Into<String>) -> Self {
        EvalError::TypeMismatch {
            message: message.into(),
        }
    }

    pub fn filter_target(message: impl Into<String>) -> Self {
        EvalError::FilterTargetError {
            message: message.into(),
        }
    }

    pub fn arithmetic(message: impl Into<String>) -> Self {
        EvalError::Arithmetic {
            message: message.into(),
        }
    }
}

/// What kind of name failed to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Function,
    Attribute,
}

impl std::fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReferenceKind::Function => write!(f, "function"),
            ReferenceKind::Attribute => write!(f, "attribute"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failure() {
        let err = EvalError::UnresolvedReference {
            kind: ReferenceKind::Function,
            name: "math.nope".to_string(),
        };
        assert_eq!(err.to_string(), "unresolved function 'math.nope'");
        assert_eq!(
            EvalError::IndexOutOfRange { index: 5, len: 2 }.to_string(),
            "index 5 out of range for array of length 2"
        );
    }
}
