//! Evaluation context threaded through every expression.
//!
//! Holds the function and attribute registries, the variables in scope,
//! and the attribute timeout. Cloning is cheap (shared `Arc`s); binding a
//! variable copies the variable map, so sibling evaluations never observe
//! each other's bindings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::attributes::AttributeRegistry;
use crate::decision::AuthorizationSubscription;
use crate::functions::FunctionRegistry;
use crate::value::Val;

/// Variables in scope, by name.
pub type Variables = Arc<HashMap<String, Val>>;

#[derive(Debug, Clone)]
pub struct EvaluationContext {
    functions: Arc<FunctionRegistry>,
    attributes: Arc<AttributeRegistry>,
    variables: Variables,
    attribute_timeout: Option<Duration>,
}

impl EvaluationContext {
    pub fn new(functions: Arc<FunctionRegistry>, attributes: Arc<AttributeRegistry>) -> Self {
        EvaluationContext {
            functions,
            attributes,
            variables: Arc::new(HashMap::new()),
            attribute_timeout: None,
        }
    }

    pub fn with_attribute_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attribute_timeout = timeout;
        self
    }

    /// Bind the PDP variables and the subscription elements.
    ///
    /// Subscription elements shadow PDP variables of the same name; an
    /// absent environment stays undefined.
    pub fn for_subscription(
        &self,
        subscription: &AuthorizationSubscription,
        pdp_variables: &serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let mut variables: HashMap<String, Val> = pdp_variables
            .iter()
            .map(|(k, v)| (k.clone(), Val::of(v.clone())))
            .collect();
        variables.insert("subject".to_string(), Val::of(subscription.subject.clone()));
        variables.insert("action".to_string(), Val::of(subscription.action.clone()));
        variables.insert("resource".to_string(), Val::of(subscription.resource.clone()));
        match &subscription.environment {
            Some(env) => {
                variables.insert("environment".to_string(), Val::of(env.clone()));
            }
            None => {
                variables.remove("environment");
            }
        }
        EvaluationContext {
            variables: Arc::new(variables),
            ..self.clone()
        }
    }

    /// A copy of this context with `name` bound to `value`.
    pub fn with_variable(&self, name: &str, value: Val) -> Self {
        let mut variables = (*self.variables).clone();
        variables.insert(name.to_string(), value);
        EvaluationContext {
            variables: Arc::new(variables),
            ..self.clone()
        }
    }

    /// Value of a variable, `Undefined` when not bound.
    pub fn variable(&self, name: &str) -> Val {
        self.variables.get(name).cloned().unwrap_or(Val::Undefined)
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn attributes(&self) -> &AttributeRegistry {
        &self.attributes
    }

    pub fn attribute_timeout(&self) -> Option<Duration> {
        self.attribute_timeout
    }
}

impl Default for EvaluationContext {
    fn default() -> Self {
        EvaluationContext::new(
            Arc::new(FunctionRegistry::standard()),
            Arc::new(AttributeRegistry::new()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subscription_shadows_pdp_variables() {
        let sub = AuthorizationSubscription::new(json!("alice"), json!("read"), json!({"id": 1}));
        let mut pdp = serde_json::Map::new();
        pdp.insert("subject".to_string(), json!("ignored"));
        pdp.insert("tenant".to_string(), json!("acme"));
        let ctx = EvaluationContext::default().for_subscription(&sub, &pdp);
        assert_eq!(ctx.variable("subject"), Val::of("alice"));
        assert_eq!(ctx.variable("tenant"), Val::of("acme"));
        assert_eq!(ctx.variable("environment"), Val::Undefined);
    }

    #[test]
    fn bindings_do_not_leak_into_parent() {
        let parent = EvaluationContext::default();
        let child = parent.with_variable("x", Val::of(1));
        assert_eq!(child.variable("x"), Val::of(1));
        assert_eq!(parent.variable("x"), Val::Undefined);
    }
}
