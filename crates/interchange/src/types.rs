//! Typed structs representing the Sieve policy interchange JSON.
//!
//! Every syntactic category is a closed enum: [`Expression`], [`Step`],
//! [`FilterComponent`], [`Statement`] and [`CombiningAlgorithmId`].
//! Literal payloads stay as `serde_json::Value` so the evaluator can hand
//! them out without conversion.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Documents ───────────────────────────────────────────────────────

/// A single policy document: either a policy or a policy set.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDocument {
    Policy(Policy),
    PolicySet(PolicySet),
}

impl PolicyDocument {
    pub fn name(&self) -> &str {
        match self {
            PolicyDocument::Policy(p) => &p.name,
            PolicyDocument::PolicySet(s) => &s.name,
        }
    }
}

/// Whether a policy grants or refuses access when it applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entitlement {
    Permit,
    Deny,
}

/// A policy: target, body, and the expressions evaluated once it applies.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub name: String,
    pub entitlement: Entitlement,
    /// Applicability pre-filter. `None` matches every subscription.
    pub target: Option<Expression>,
    /// Conditions and variable bindings, evaluated in order.
    pub body: Vec<Statement>,
    /// Each expression contributes exactly one element to the decision's
    /// obligation array; array-valued obligations are not flattened.
    pub obligations: Vec<Expression>,
    pub advice: Vec<Expression>,
    /// Produces the decision's `resource`.
    pub transformation: Option<Expression>,
}

/// A body statement of a policy.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Condition(Expression),
    Variable(VariableDefinition),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableDefinition {
    pub name: String,
    pub expression: Expression,
}

/// A named, combinable group of policies.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySet {
    pub name: String,
    pub algorithm: CombiningAlgorithmId,
    pub target: Option<Expression>,
    /// Shared variables, visible to every contained policy.
    pub variables: Vec<VariableDefinition>,
    pub policies: Vec<Policy>,
    pub obligations: Vec<Expression>,
    pub advice: Vec<Expression>,
}

// ── Combining algorithms ────────────────────────────────────────────

/// Identifier of a combining algorithm.
///
/// Documents spell these in kebab-case (`deny-overrides`); PDP configuration
/// files use SCREAMING_SNAKE_CASE (`DENY_OVERRIDES`). Both are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CombiningAlgorithmId {
    #[serde(alias = "first-applicable")]
    FirstApplicable,
    #[serde(alias = "deny-overrides")]
    DenyOverrides,
    #[serde(alias = "permit-overrides")]
    PermitOverrides,
    #[serde(alias = "only-one-applicable")]
    OnlyOneApplicable,
    #[serde(alias = "deny-unless-permit")]
    DenyUnlessPermit,
    #[serde(alias = "permit-unless-deny")]
    PermitUnlessDeny,
}

impl CombiningAlgorithmId {
    pub const ALL: [CombiningAlgorithmId; 6] = [
        CombiningAlgorithmId::FirstApplicable,
        CombiningAlgorithmId::DenyOverrides,
        CombiningAlgorithmId::PermitOverrides,
        CombiningAlgorithmId::OnlyOneApplicable,
        CombiningAlgorithmId::DenyUnlessPermit,
        CombiningAlgorithmId::PermitUnlessDeny,
    ];

    /// Kebab-case identifier as written in policy documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            CombiningAlgorithmId::FirstApplicable => "first-applicable",
            CombiningAlgorithmId::DenyOverrides => "deny-overrides",
            CombiningAlgorithmId::PermitOverrides => "permit-overrides",
            CombiningAlgorithmId::OnlyOneApplicable => "only-one-applicable",
            CombiningAlgorithmId::DenyUnlessPermit => "deny-unless-permit",
            CombiningAlgorithmId::PermitUnlessDeny => "permit-unless-deny",
        }
    }

    /// Parse either spelling of an algorithm identifier.
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|algorithm| algorithm.as_str() == normalized)
    }
}

impl fmt::Display for CombiningAlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Expressions ─────────────────────────────────────────────────────

/// An expression tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Basic(BasicExpression),
    Binary {
        operator: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Unary {
        operator: UnaryOperator,
        operand: Box<Expression>,
    },
    Conditional {
        condition: Box<Expression>,
        then: Box<Expression>,
        otherwise: Box<Expression>,
    },
}

impl Expression {
    /// A literal expression without steps.
    pub fn literal(value: serde_json::Value) -> Self {
        Expression::Basic(BasicExpression::new(BasicHead::Literal(value)))
    }

    /// An identifier reference without steps.
    pub fn identifier(name: &str) -> Self {
        Expression::Basic(BasicExpression::new(BasicHead::Identifier(name.to_string())))
    }

    pub fn binary(operator: BinaryOperator, left: Expression, right: Expression) -> Self {
        Expression::Binary {
            operator,
            left: Box::new(left),
            right: Box::new(right),
        }
    }
}

/// A value-producing head followed by optional selection steps and
/// at most one of a filter or a sub-template.
#[derive(Debug, Clone, PartialEq)]
pub struct BasicExpression {
    pub head: BasicHead,
    pub steps: Vec<Step>,
    pub filter: Option<FilterComponent>,
    pub subtemplate: Option<Box<Expression>>,
}

impl BasicExpression {
    pub fn new(head: BasicHead) -> Self {
        BasicExpression {
            head,
            steps: Vec::new(),
            filter: None,
            subtemplate: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BasicHead {
    Literal(serde_json::Value),
    Group(Box<Expression>),
    Identifier(String),
    /// `@`, the node a condition step or sub-template is evaluated against.
    Relative,
    Function {
        name: String,
        arguments: Vec<Expression>,
    },
    Array(Vec<Expression>),
    Object(Vec<(String, Expression)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Or,
    And,
    Xor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Regex,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOperator {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "or" => BinaryOperator::Or,
            "and" => BinaryOperator::And,
            "xor" => BinaryOperator::Xor,
            "eq" => BinaryOperator::Eq,
            "ne" => BinaryOperator::Ne,
            "lt" => BinaryOperator::Lt,
            "le" => BinaryOperator::Le,
            "gt" => BinaryOperator::Gt,
            "ge" => BinaryOperator::Ge,
            "regex" => BinaryOperator::Regex,
            "in" => BinaryOperator::In,
            "add" => BinaryOperator::Add,
            "sub" => BinaryOperator::Sub,
            "mul" => BinaryOperator::Mul,
            "div" => BinaryOperator::Div,
            "mod" => BinaryOperator::Mod,
            _ => return None,
        })
    }

    /// Surface syntax of the operator, used in error messages.
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOperator::Or => "||",
            BinaryOperator::And => "&&",
            BinaryOperator::Xor => "^",
            BinaryOperator::Eq => "==",
            BinaryOperator::Ne => "!=",
            BinaryOperator::Lt => "<",
            BinaryOperator::Le => "<=",
            BinaryOperator::Gt => ">",
            BinaryOperator::Ge => ">=",
            BinaryOperator::Regex => "=~",
            BinaryOperator::In => "in",
            BinaryOperator::Add => "+",
            BinaryOperator::Sub => "-",
            BinaryOperator::Mul => "*",
            BinaryOperator::Div => "/",
            BinaryOperator::Mod => "%",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Neg,
}

// ── Steps ───────────────────────────────────────────────────────────

/// A selection step applied to the value produced so far.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Key(String),
    Index(i64),
    Wildcard,
    Slice {
        from: Option<i64>,
        to: Option<i64>,
        step: Option<i64>,
    },
    /// `[(expr)]`: a computed key (string) or index (number).
    Expression(Box<Expression>),
    /// `[?(expr)]`: keeps the elements for which the expression is true.
    Condition(Box<Expression>),
    RecursiveKey(String),
    RecursiveIndex(i64),
    RecursiveWildcard,
    KeyUnion(Vec<String>),
    IndexUnion(Vec<i64>),
    /// `.<name(arguments)>`: subscribes to an attribute finder.
    AttributeFinder {
        name: String,
        arguments: Vec<Expression>,
    },
}

// ── Filters ─────────────────────────────────────────────────────────

/// The `|-` part of a basic expression.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterComponent {
    /// `|- each? function(arguments)` applied to the whole value.
    Simple {
        each: bool,
        function: String,
        arguments: Vec<Expression>,
    },
    /// `|- { statement, ... }`, statements applied in order.
    Extended(Vec<FilterStatement>),
}

/// One statement of an extended filter.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterStatement {
    /// Relative step chain selecting the nodes to rewrite. Empty targets
    /// the whole value.
    pub target: Vec<Step>,
    pub each: bool,
    /// Fully-qualified function name, `remove`, or empty for identity.
    pub function: String,
    pub arguments: Vec<Expression>,
}

/// Name of the built-in filter function that deletes its target.
pub const REMOVE_FUNCTION: &str = "remove";

/// Identifiers bound from the authorization subscription.
pub const RESERVED_IDENTIFIERS: [&str; 4] = ["subject", "action", "resource", "environment"];
