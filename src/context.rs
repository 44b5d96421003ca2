use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-request evaluation input: an optional targeting key plus an open
/// attribute map. Attribute values are arbitrary JSON and may contain nested
/// objects, which targeting rules address with dot-separated `var` paths.
///
/// ```
/// # use flagd_core::EvaluationContext;
/// let context = EvaluationContext::new()
///     .with_targeting_key("user-42")
///     .with_attribute("email", "alice@example.com")
///     .with_attribute("age", 30);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    /// Key identifying the subject of the evaluation. Used as the default
    /// bucketing key for fractional targeting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targeting_key: Option<String>,
    /// Free-form attributes consulted by targeting rules.
    #[serde(flatten)]
    pub attributes: HashMap<String, Value>,
}

impl EvaluationContext {
    /// Create an empty context.
    pub fn new() -> EvaluationContext {
        EvaluationContext::default()
    }

    /// Set the targeting key.
    pub fn with_targeting_key(mut self, key: impl Into<String>) -> EvaluationContext {
        self.targeting_key = Some(key.into());
        self
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> EvaluationContext {
        self.attributes.insert(key.into(), value.into());
        self
    }
}
