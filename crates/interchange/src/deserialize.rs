//! Deserialization from interchange JSON into typed policy documents.
//!
//! The main entry points are [`from_interchange`] for a single document and
//! [`bundle_from_interchange`] for a document or an array of documents.

use crate::types::*;
use std::collections::HashSet;
use std::fmt;

/// Errors during interchange JSON deserialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterchangeError {
    /// A construct is missing a required field.
    MissingField { kind: String, field: String },
    /// A construct is present but malformed.
    ConstructError {
        kind: String,
        name: String,
        message: String,
    },
    /// A `kind` tag that no construct of this category uses.
    UnknownKind { category: String, kind: String },
    /// The document structure is invalid.
    InvalidDocument(String),
}

impl fmt::Display for InterchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterchangeError::MissingField { kind, field } => {
                write!(f, "{} missing required field: '{}'", kind, field)
            }
            InterchangeError::ConstructError {
                kind,
                name,
                message,
            } => {
                write!(f, "{} '{}': {}", kind, name, message)
            }
            InterchangeError::UnknownKind { category, kind } => {
                write!(f, "unknown {} kind '{}'", category, kind)
            }
            InterchangeError::InvalidDocument(msg) => {
                write!(f, "invalid document: {}", msg)
            }
        }
    }
}

impl std::error::Error for InterchangeError {}

/// Deserialize one policy document (`policy` or `policy_set`).
pub fn from_interchange(doc: &serde_json::Value) -> Result<PolicyDocument, InterchangeError> {
    let kind = doc.get("kind").and_then(|k| k.as_str()).unwrap_or("");
    match kind {
        "policy" => Ok(PolicyDocument::Policy(parse_policy(doc)?)),
        "policy_set" => Ok(PolicyDocument::PolicySet(parse_policy_set(doc)?)),
        "" => Err(InterchangeError::MissingField {
            kind: "document".to_string(),
            field: "kind".to_string(),
        }),
        other => Err(InterchangeError::UnknownKind {
            category: "document".to_string(),
            kind: other.to_string(),
        }),
    }
}

/// Deserialize a bundle: either a single document or an array of them.
pub fn bundle_from_interchange(
    bundle: &serde_json::Value,
) -> Result<Vec<PolicyDocument>, InterchangeError> {
    match bundle {
        serde_json::Value::Array(docs) => docs.iter().map(from_interchange).collect(),
        serde_json::Value::Object(_) => Ok(vec![from_interchange(bundle)?]),
        _ => Err(InterchangeError::InvalidDocument(
            "expected a document object or an array of documents".to_string(),
        )),
    }
}

// ── Parsing helpers ─────────────────────────────────────────────────

fn required_str(
    obj: &serde_json::Value,
    kind: &str,
    field: &str,
) -> Result<String, InterchangeError> {
    obj.get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| InterchangeError::MissingField {
            kind: kind.to_string(),
            field: field.to_string(),
        })
}

fn required<'a>(
    obj: &'a serde_json::Value,
    kind: &str,
    field: &str,
) -> Result<&'a serde_json::Value, InterchangeError> {
    obj.get(field).ok_or_else(|| InterchangeError::MissingField {
        kind: kind.to_string(),
        field: field.to_string(),
    })
}

/// An optional array field; absent or null means empty.
fn optional_array<'a>(
    obj: &'a serde_json::Value,
    kind: &str,
    field: &str,
) -> Result<&'a [serde_json::Value], InterchangeError> {
    match obj.get(field) {
        None | Some(serde_json::Value::Null) => Ok(&[]),
        Some(serde_json::Value::Array(items)) => Ok(items),
        Some(_) => Err(InterchangeError::InvalidDocument(format!(
            "{} field '{}' must be an array",
            kind, field
        ))),
    }
}

fn optional_expression(
    obj: &serde_json::Value,
    field: &str,
) -> Result<Option<Expression>, InterchangeError> {
    match obj.get(field) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(e) => Ok(Some(parse_expression(e)?)),
    }
}

fn parse_expressions(items: &[serde_json::Value]) -> Result<Vec<Expression>, InterchangeError> {
    items.iter().map(parse_expression).collect()
}

fn check_variable_name(kind: &str, owner: &str, name: &str) -> Result<(), InterchangeError> {
    if RESERVED_IDENTIFIERS.contains(&name) {
        return Err(InterchangeError::ConstructError {
            kind: kind.to_string(),
            name: owner.to_string(),
            message: format!("variable '{}' shadows a subscription element", name),
        });
    }
    Ok(())
}

// ── Policies ────────────────────────────────────────────────────────

fn parse_policy(obj: &serde_json::Value) -> Result<Policy, InterchangeError> {
    let name = required_str(obj, "policy", "name")?;
    let entitlement = match required_str(obj, "policy", "entitlement")?.as_str() {
        "permit" => Entitlement::Permit,
        "deny" => Entitlement::Deny,
        other => {
            return Err(InterchangeError::ConstructError {
                kind: "policy".to_string(),
                name,
                message: format!("unknown entitlement '{}'", other),
            })
        }
    };

    let mut body = Vec::new();
    for stmt in optional_array(obj, "policy", "body")? {
        body.push(parse_statement(stmt, &name)?);
    }

    Ok(Policy {
        target: optional_expression(obj, "target")?,
        body,
        obligations: parse_expressions(optional_array(obj, "policy", "obligations")?)?,
        advice: parse_expressions(optional_array(obj, "policy", "advice")?)?,
        transformation: optional_expression(obj, "transformation")?,
        name,
        entitlement,
    })
}

fn parse_statement(obj: &serde_json::Value, policy: &str) -> Result<Statement, InterchangeError> {
    let kind = obj.get("kind").and_then(|k| k.as_str()).unwrap_or("");
    match kind {
        "condition" => Ok(Statement::Condition(parse_expression(required(
            obj,
            "condition",
            "expression",
        )?)?)),
        "variable" => {
            let definition = parse_variable(obj)?;
            check_variable_name("policy", policy, &definition.name)?;
            Ok(Statement::Variable(definition))
        }
        other => Err(InterchangeError::UnknownKind {
            category: "statement".to_string(),
            kind: other.to_string(),
        }),
    }
}

fn parse_variable(obj: &serde_json::Value) -> Result<VariableDefinition, InterchangeError> {
    Ok(VariableDefinition {
        name: required_str(obj, "variable", "name")?,
        expression: parse_expression(required(obj, "variable", "expression")?)?,
    })
}

fn parse_policy_set(obj: &serde_json::Value) -> Result<PolicySet, InterchangeError> {
    let name = required_str(obj, "policy_set", "name")?;
    let algorithm_str = required_str(obj, "policy_set", "algorithm")?;
    let algorithm = CombiningAlgorithmId::parse(&algorithm_str).ok_or_else(|| {
        InterchangeError::ConstructError {
            kind: "policy_set".to_string(),
            name: name.clone(),
            message: format!("unknown combining algorithm '{}'", algorithm_str),
        }
    })?;

    let mut variables = Vec::new();
    for v in optional_array(obj, "policy_set", "variables")? {
        let definition = parse_variable(v)?;
        check_variable_name("policy_set", &name, &definition.name)?;
        variables.push(definition);
    }

    let mut policies = Vec::new();
    let mut seen = HashSet::new();
    for p in optional_array(obj, "policy_set", "policies")? {
        let policy = parse_policy(p)?;
        if !seen.insert(policy.name.clone()) {
            return Err(InterchangeError::ConstructError {
                kind: "policy_set".to_string(),
                name,
                message: format!("duplicate policy name '{}'", policy.name),
            });
        }
        policies.push(policy);
    }

    Ok(PolicySet {
        target: optional_expression(obj, "target")?,
        obligations: parse_expressions(optional_array(obj, "policy_set", "obligations")?)?,
        advice: parse_expressions(optional_array(obj, "policy_set", "advice")?)?,
        name,
        algorithm,
        variables,
        policies,
    })
}

// ── Expressions ─────────────────────────────────────────────────────

/// Parse an expression node from interchange JSON.
pub fn parse_expression(obj: &serde_json::Value) -> Result<Expression, InterchangeError> {
    let kind = obj
        .get("kind")
        .and_then(|k| k.as_str())
        .ok_or_else(|| InterchangeError::MissingField {
            kind: "expression".to_string(),
            field: "kind".to_string(),
        })?;

    match kind {
        "binary" => {
            let op = required_str(obj, "binary", "operator")?;
            let operator =
                BinaryOperator::parse(&op).ok_or_else(|| InterchangeError::UnknownKind {
                    category: "binary operator".to_string(),
                    kind: op.clone(),
                })?;
            Ok(Expression::Binary {
                operator,
                left: Box::new(parse_expression(required(obj, "binary", "left")?)?),
                right: Box::new(parse_expression(required(obj, "binary", "right")?)?),
            })
        }
        "unary" => {
            let operator = match required_str(obj, "unary", "operator")?.as_str() {
                "not" => UnaryOperator::Not,
                "neg" => UnaryOperator::Neg,
                other => {
                    return Err(InterchangeError::UnknownKind {
                        category: "unary operator".to_string(),
                        kind: other.to_string(),
                    })
                }
            };
            Ok(Expression::Unary {
                operator,
                operand: Box::new(parse_expression(required(obj, "unary", "operand")?)?),
            })
        }
        "conditional" => Ok(Expression::Conditional {
            condition: Box::new(parse_expression(required(
                obj,
                "conditional",
                "condition",
            )?)?),
            then: Box::new(parse_expression(required(obj, "conditional", "then")?)?),
            otherwise: Box::new(parse_expression(required(obj, "conditional", "else")?)?),
        }),
        _ => Ok(Expression::Basic(parse_basic(obj, kind)?)),
    }
}

fn parse_basic(obj: &serde_json::Value, kind: &str) -> Result<BasicExpression, InterchangeError> {
    let head = match kind {
        "literal" => BasicHead::Literal(required(obj, kind, "value")?.clone()),
        "group" => BasicHead::Group(Box::new(parse_expression(required(
            obj,
            kind,
            "expression",
        )?)?)),
        "identifier" => BasicHead::Identifier(required_str(obj, kind, "name")?),
        "relative" => BasicHead::Relative,
        "function" => BasicHead::Function {
            name: required_str(obj, kind, "name")?,
            arguments: parse_expressions(optional_array(obj, kind, "arguments")?)?,
        },
        "array" => BasicHead::Array(parse_expressions(optional_array(obj, kind, "items")?)?),
        "object" => {
            let mut members = Vec::new();
            for m in optional_array(obj, kind, "members")? {
                members.push((
                    required_str(m, "member", "key")?,
                    parse_expression(required(m, "member", "value")?)?,
                ));
            }
            BasicHead::Object(members)
        }
        other => {
            return Err(InterchangeError::UnknownKind {
                category: "expression".to_string(),
                kind: other.to_string(),
            })
        }
    };

    let mut steps = Vec::new();
    for s in optional_array(obj, kind, "steps")? {
        steps.push(parse_step(s)?);
    }

    let filter = match obj.get("filter") {
        None | Some(serde_json::Value::Null) => None,
        Some(f) => Some(parse_filter(f)?),
    };
    let subtemplate = match obj.get("subtemplate") {
        None | Some(serde_json::Value::Null) => None,
        Some(t) => Some(Box::new(parse_expression(t)?)),
    };
    if filter.is_some() && subtemplate.is_some() {
        return Err(InterchangeError::InvalidDocument(format!(
            "{} expression declares both a filter and a sub-template",
            kind
        )));
    }

    Ok(BasicExpression {
        head,
        steps,
        filter,
        subtemplate,
    })
}

// ── Steps ───────────────────────────────────────────────────────────

fn required_i64(obj: &serde_json::Value, kind: &str, field: &str) -> Result<i64, InterchangeError> {
    required(obj, kind, field)?
        .as_i64()
        .ok_or_else(|| InterchangeError::InvalidDocument(format!("{} '{}' must be an integer", kind, field)))
}

fn optional_i64(
    obj: &serde_json::Value,
    kind: &str,
    field: &str,
) -> Result<Option<i64>, InterchangeError> {
    match obj.get(field) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or_else(|| {
            InterchangeError::InvalidDocument(format!("{} '{}' must be an integer", kind, field))
        }),
    }
}

/// Parse a selection step from interchange JSON.
pub fn parse_step(obj: &serde_json::Value) -> Result<Step, InterchangeError> {
    let kind = obj.get("kind").and_then(|k| k.as_str()).unwrap_or("");
    let step = match kind {
        "key" => Step::Key(required_str(obj, kind, "key")?),
        "index" => Step::Index(required_i64(obj, kind, "index")?),
        "wildcard" => Step::Wildcard,
        "slice" => {
            let step = optional_i64(obj, kind, "step")?;
            if step == Some(0) {
                return Err(InterchangeError::InvalidDocument(
                    "slice step must not be zero".to_string(),
                ));
            }
            Step::Slice {
                from: optional_i64(obj, kind, "from")?,
                to: optional_i64(obj, kind, "to")?,
                step,
            }
        }
        "expression" => Step::Expression(Box::new(parse_expression(required(
            obj,
            kind,
            "expression",
        )?)?)),
        "condition" => Step::Condition(Box::new(parse_expression(required(
            obj,
            kind,
            "expression",
        )?)?)),
        "recursive_key" => Step::RecursiveKey(required_str(obj, kind, "key")?),
        "recursive_index" => Step::RecursiveIndex(required_i64(obj, kind, "index")?),
        "recursive_wildcard" => Step::RecursiveWildcard,
        "key_union" => {
            let keys = optional_array(obj, kind, "keys")?
                .iter()
                .map(|k| {
                    k.as_str().map(|s| s.to_string()).ok_or_else(|| {
                        InterchangeError::InvalidDocument("key_union keys must be strings".to_string())
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Step::KeyUnion(keys)
        }
        "index_union" => {
            let indices = optional_array(obj, kind, "indices")?
                .iter()
                .map(|i| {
                    i.as_i64().ok_or_else(|| {
                        InterchangeError::InvalidDocument(
                            "index_union indices must be integers".to_string(),
                        )
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Step::IndexUnion(indices)
        }
        "attribute_finder" => Step::AttributeFinder {
            name: required_str(obj, kind, "name")?,
            arguments: parse_expressions(optional_array(obj, kind, "arguments")?)?,
        },
        other => {
            return Err(InterchangeError::UnknownKind {
                category: "step".to_string(),
                kind: other.to_string(),
            })
        }
    };
    Ok(step)
}

// ── Filters ─────────────────────────────────────────────────────────

fn parse_filter(obj: &serde_json::Value) -> Result<FilterComponent, InterchangeError> {
    let kind = obj.get("kind").and_then(|k| k.as_str()).unwrap_or("");
    match kind {
        "simple" => Ok(FilterComponent::Simple {
            each: obj.get("each").and_then(|e| e.as_bool()).unwrap_or(false),
            function: obj
                .get("function")
                .and_then(|f| f.as_str())
                .unwrap_or("")
                .to_string(),
            arguments: parse_expressions(optional_array(obj, kind, "arguments")?)?,
        }),
        "extended" => {
            let mut statements = Vec::new();
            for s in optional_array(obj, kind, "statements")? {
                let mut target = Vec::new();
                for step in optional_array(s, "filter statement", "target")? {
                    target.push(parse_step(step)?);
                }
                statements.push(FilterStatement {
                    target,
                    each: s.get("each").and_then(|e| e.as_bool()).unwrap_or(false),
                    function: s
                        .get("function")
                        .and_then(|f| f.as_str())
                        .unwrap_or("")
                        .to_string(),
                    arguments: parse_expressions(optional_array(
                        s,
                        "filter statement",
                        "arguments",
                    )?)?,
                });
            }
            Ok(FilterComponent::Extended(statements))
        }
        other => Err(InterchangeError::UnknownKind {
            category: "filter".to_string(),
            kind: other.to_string(),
        }),
    }
}
