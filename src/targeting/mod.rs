//! Targeting rule language: a JSON-Logic-compatible interpreter with the
//! flagd custom operators (`fractional`, `sem_ver`, `starts_with`,
//! `ends_with`).
//!
//! Rules are compiled once, at document load, into the closed [`Expr`] tree;
//! evaluation is an exhaustive match of pure functions over (node, scope).
//! There is no string-keyed operator dispatch at evaluation time.
mod compile;
mod eval;
mod ops;

pub(crate) use compile::compile;
pub(crate) use eval::eval;

use serde_json::{Map, Value};

use crate::EvaluationContext;

/// A targeting rule compiled to an evaluation-ready expression tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetingRule {
    expr: Expr,
}

impl TargetingRule {
    /// Compile a JSON-Logic document. Unknown operators and arity errors are
    /// reported as compile errors.
    pub fn compile(rule: &Value) -> Result<TargetingRule, String> {
        Ok(TargetingRule {
            expr: compile(rule)?,
        })
    }

    /// Evaluate against a prepared scope. Returns `Value::Null` when no rule
    /// branch matched.
    pub fn evaluate(&self, scope: &Map<String, Value>) -> Value {
        eval(&self.expr, scope)
    }
}

/// Compiled expression node. One variant per supported operator, resolved at
/// parse time.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    /// Array of subexpressions, evaluated element-wise.
    Array(Vec<Expr>),
    Var {
        path: Box<Expr>,
        default: Option<Box<Expr>>,
    },
    Missing(Vec<Expr>),
    MissingSome(Box<Expr>, Box<Expr>),
    If(Vec<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    StrictEq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    StrictNe(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Truthy(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    /// 2 or 3 arguments; the 3-argument form is the between test.
    Compare(CmpOp, Vec<Expr>),
    In(Box<Expr>, Box<Expr>),
    Cat(Vec<Expr>),
    Substr(Vec<Expr>),
    Arith(ArithOp, Vec<Expr>),
    /// Custom operators validate their argument shapes at evaluation time and
    /// yield `Null` on misconfiguration instead of failing the evaluation.
    Fractional(Vec<Expr>),
    StartsWith(Vec<Expr>),
    EndsWith(Vec<Expr>),
    SemVer(Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

/// Assemble the evaluation scope for one resolution call.
///
/// Context attributes come first; `targetingKey` is filled from the context's
/// dedicated field, and `$flagd.flagKey` / `$flagd.timestamp` are injected
/// unless the context already supplies them (context wins).
pub(crate) fn build_scope(flag_key: &str, context: &EvaluationContext) -> Map<String, Value> {
    let mut scope: Map<String, Value> = context
        .attributes
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if let Some(targeting_key) = &context.targeting_key {
        scope.insert("targetingKey".to_owned(), Value::String(targeting_key.clone()));
    }

    let flagd = scope
        .entry("$flagd")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(flagd) = flagd {
        flagd
            .entry("flagKey")
            .or_insert_with(|| Value::String(flag_key.to_owned()));
        flagd
            .entry("timestamp")
            .or_insert_with(|| Value::from(chrono::Utc::now().timestamp()));
    }

    scope
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{build_scope, TargetingRule};
    use crate::EvaluationContext;

    fn evaluate(rule: Value, context: &EvaluationContext) -> Value {
        let rule = TargetingRule::compile(&rule).expect("rule should compile");
        rule.evaluate(&build_scope("test-flag", context))
    }

    #[test]
    fn targeting_key_is_injected_from_dedicated_field() {
        let context = EvaluationContext::new().with_targeting_key("vip");
        let result = evaluate(
            json!({"if": [{"==": [{"var": "targetingKey"}, "vip"]}, "on", null]}),
            &context,
        );
        assert_eq!(result, json!("on"));
    }

    #[test]
    fn flag_key_is_available_in_scope() {
        let result = evaluate(
            json!({"var": "$flagd.flagKey"}),
            &EvaluationContext::new(),
        );
        assert_eq!(result, json!("test-flag"));
    }

    #[test]
    fn context_supplied_flagd_properties_win() {
        let context =
            EvaluationContext::new().with_attribute("$flagd", json!({"flagKey": "overridden"}));
        let result = evaluate(json!({"var": "$flagd.flagKey"}), &context);
        assert_eq!(result, json!("overridden"));
    }

    #[test]
    fn timestamp_is_unix_seconds() {
        let scope = build_scope("f", &EvaluationContext::new());
        let ts = scope["$flagd"]["timestamp"].as_i64().unwrap();
        assert!(ts > 1_500_000_000, "{ts} should be a contemporary unix timestamp");
    }

    #[test]
    fn unknown_operator_is_a_compile_error() {
        let err = TargetingRule::compile(&json!({"frobnicate": [1, 2]})).unwrap_err();
        assert!(err.contains("frobnicate"), "{err}");
    }

    #[test]
    fn missing_scope_key_falls_through_to_null() {
        let result = evaluate(
            json!({"if": [{"==": [{"var": "segment"}, "beta"]}, "on", null]}),
            &EvaluationContext::new(),
        );
        assert_eq!(result, Value::Null);
    }

    #[test]
    fn nested_attributes_resolve_with_dot_paths() {
        let context =
            EvaluationContext::new().with_attribute("user", json!({"tier": "gold"}));
        let result = evaluate(json!({"var": "user.tier"}), &context);
        assert_eq!(result, json!("gold"));
    }

    #[test]
    fn empty_scope_evaluates_composite_rules() {
        let result = evaluate(
            json!({"and": [{"!": [{"var": "missing"}]}, {"==": [1, 1]}]}),
            &EvaluationContext::new(),
        );
        assert_eq!(result, json!(true));
    }

    #[test]
    fn scope_is_plain_map_of_context() {
        let context = EvaluationContext::new()
            .with_targeting_key("k")
            .with_attribute("color", "green");
        let scope = build_scope("f", &context);
        assert_eq!(scope["targetingKey"], json!("k"));
        assert_eq!(scope["color"], json!("green"));
        assert!(matches!(scope.get("$flagd"), Some(Value::Object(_))));
        let _: &Map<String, Value> = &scope;
    }
}
