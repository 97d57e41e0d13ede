//! Condition evaluation for branch selection.
//!
//! Structural operators are evaluated locally; anything else goes to the
//! semantic oracle along with the field, operator and expected value.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use flowrun_core::context::{lookup_path, value_text, ExecutionContext};
use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::SemanticOracle;
use flowrun_core::workflow::{Condition, ConditionNode, Logic, Operator, Predicate};

use crate::oracle;

pub struct ConditionEvaluator {
    oracle: Option<Arc<dyn SemanticOracle>>,
}

impl ConditionEvaluator {
    pub fn new(oracle: Option<Arc<dyn SemanticOracle>>) -> Self {
        Self { oracle }
    }

    fn oracle(&self) -> Result<&dyn SemanticOracle> {
        self.oracle
            .as_deref()
            .ok_or_else(|| FlowError::Oracle("no semantic oracle configured".into()))
    }

    /// Evaluate a condition node against the current input and context.
    pub async fn evaluate(
        &self,
        config: &ConditionNode,
        input: &Value,
        context: &ExecutionContext,
    ) -> Result<bool> {
        if !config.conditions.is_empty() {
            return self.evaluate_all(&config.conditions, input, context).await;
        }

        match &config.condition {
            Some(Predicate::SemanticDecision { prompt }) => {
                oracle::decide(self.oracle()?, prompt, input, &context.to_value()).await
            }
            Some(Predicate::Contains { value, field }) => {
                let haystack = match field {
                    Some(path) => resolve_field(path, input, context),
                    None => Some(input.clone()),
                };
                Ok(haystack.is_some_and(|h| contains_ci(&h, &Value::String(value.clone()))))
            }
            None => Ok(false),
        }
    }

    /// Evaluate structured conditions left to right with short-circuiting.
    ///
    /// Each result folds into the accumulator under its own `logic`. After a
    /// condition with AND logic leaves the accumulator false, or one with OR
    /// logic leaves it true, the remaining conditions are not evaluated.
    pub async fn evaluate_all(
        &self,
        conditions: &[Condition],
        input: &Value,
        context: &ExecutionContext,
    ) -> Result<bool> {
        let mut acc: Option<bool> = None;

        for (i, condition) in conditions.iter().enumerate() {
            let result = self.evaluate_one(condition, input, context).await?;
            let combined = match (acc, condition.logic) {
                (None, _) => result,
                (Some(prev), Logic::And) => prev && result,
                (Some(prev), Logic::Or) => prev || result,
            };
            acc = Some(combined);

            let settled = match condition.logic {
                Logic::And => !combined,
                Logic::Or => combined,
            };
            if settled && i + 1 < conditions.len() {
                debug!(
                    evaluated = i + 1,
                    skipped = conditions.len() - i - 1,
                    result = combined,
                    "Condition list short-circuited"
                );
                break;
            }
        }

        Ok(acc.unwrap_or(false))
    }

    async fn evaluate_one(
        &self,
        condition: &Condition,
        input: &Value,
        context: &ExecutionContext,
    ) -> Result<bool> {
        let actual = resolve_field(&condition.field, input, context);
        let expected = &condition.value;

        let result = match &condition.operator {
            Operator::Equals => loose_eq(actual.as_ref().unwrap_or(&Value::Null), expected),
            Operator::NotEquals => !loose_eq(actual.as_ref().unwrap_or(&Value::Null), expected),
            Operator::Contains => actual.as_ref().is_some_and(|a| contains_ci(a, expected)),
            Operator::GreaterThan => compare(actual.as_ref(), expected, |a, b| a > b),
            Operator::LessThan => compare(actual.as_ref(), expected, |a, b| a < b),
            Operator::Exists => actual.as_ref().is_some_and(|a| !a.is_null()),
            Operator::IsEmpty => is_empty(actual.as_ref()),
            Operator::Other(op) => {
                let question = format!(
                    "Field `{}` (current value: {}) {} {}",
                    condition.field,
                    actual.as_ref().map(value_text).unwrap_or_else(|| "undefined".into()),
                    op,
                    value_text(expected),
                );
                oracle::decide(self.oracle()?, &question, input, &context.to_value()).await?
            }
        };

        debug!(
            field = %condition.field,
            operator = condition.operator.as_str(),
            result,
            "Condition evaluated"
        );
        Ok(result)
    }
}

/// Resolve a dotted path against the input first, then the context.
pub fn resolve_field(path: &str, input: &Value, context: &ExecutionContext) -> Option<Value> {
    lookup_path(input, path)
        .cloned()
        .or_else(|| context.lookup(path))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn loose_eq(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            matches!((as_number(actual), as_number(expected)), (Some(a), Some(b)) if a == b)
        }
        _ => false,
    }
}

fn contains_ci(haystack: &Value, needle: &Value) -> bool {
    let needle = value_text(needle).to_lowercase();
    match haystack {
        Value::Array(items) => items.iter().any(|item| {
            let text = value_text(item).to_lowercase();
            text == needle || text.contains(&needle)
        }),
        other => value_text(other).to_lowercase().contains(&needle),
    }
}

fn compare(actual: Option<&Value>, expected: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.and_then(as_number), as_number(expected)) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

fn is_empty(actual: Option<&Value>) -> bool {
    match actual {
        None | Some(Value::Null) => true,
        Some(Value::Bool(b)) => !b,
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrun_test_utils::ScriptedOracle;
    use serde_json::json;

    fn evaluator() -> ConditionEvaluator {
        ConditionEvaluator::new(None)
    }

    fn cond(field: &str, op: &str, value: Value) -> Condition {
        Condition::new(field, Operator::from(op.to_string()), value)
    }

    #[tokio::test]
    async fn test_structural_operators() {
        let input = json!({
            "status": "Approved",
            "score": "8.5",
            "tags": ["urgent", "billing"],
            "empty": [],
            "nested": { "count": 0 }
        });
        let ctx = ExecutionContext::new();
        let ev = evaluator();

        let cases = vec![
            (cond("status", "equals", json!("Approved")), true),
            (cond("status", "not_equals", json!("Approved")), false),
            (cond("status", "contains", json!("APPROVED")), true),
            (cond("score", "greater_than", json!(8)), true),
            (cond("score", "less_than", json!(8)), false),
            (cond("score", "greater_than", json!("many")), false),
            (cond("tags", "contains", json!("Billing")), true),
            (cond("nested.count", "is_empty", Value::Null), true),
            (cond("empty", "is_empty", Value::Null), true),
            (cond("missing", "exists", Value::Null), false),
            (cond("status", "exists", Value::Null), true),
            (cond("missing", "equals", Value::Null), true),
        ];

        for (c, expected) in cases {
            let got = ev.evaluate_all(&[c.clone()], &input, &ctx).await.unwrap();
            assert_eq!(got, expected, "{} {} {:?}", c.field, c.operator.as_str(), c.value);
        }
    }

    #[tokio::test]
    async fn test_field_falls_back_to_context() {
        let ctx = ExecutionContext::new().with_output("review", json!({ "verdict": "ok" }));
        let got = evaluator()
            .evaluate_all(&[cond("review.verdict", "equals", json!("ok"))], &json!("plain"), &ctx)
            .await
            .unwrap();
        assert!(got);
    }

    #[tokio::test]
    async fn test_and_short_circuit_skips_oracle() {
        let oracle = Arc::new(ScriptedOracle::decisions(vec![true]));
        let ev = ConditionEvaluator::new(Some(oracle.clone()));

        let conditions = vec![
            cond("status", "equals", json!("open")),
            cond("status", "sounds_urgent", json!(true)),
        ];
        let got = ev
            .evaluate_all(&conditions, &json!({ "status": "closed" }), &ExecutionContext::new())
            .await
            .unwrap();

        assert!(!got);
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn test_or_short_circuit() {
        let oracle = Arc::new(ScriptedOracle::decisions(vec![false]));
        let ev = ConditionEvaluator::new(Some(oracle.clone()));

        let conditions = vec![
            cond("status", "equals", json!("open")).or(),
            cond("status", "sounds_urgent", json!(true)),
        ];
        let got = ev
            .evaluate_all(&conditions, &json!({ "status": "open" }), &ExecutionContext::new())
            .await
            .unwrap();

        assert!(got);
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn test_or_combines_with_later_true() {
        let conditions = vec![
            cond("a", "equals", json!(1)),
            cond("b", "equals", json!(2)).or(),
        ];
        // First is true under AND, so evaluation continues; second ORs in.
        let got = evaluator()
            .evaluate_all(&conditions, &json!({ "a": 1, "b": 3 }), &ExecutionContext::new())
            .await
            .unwrap();
        assert!(got);
    }

    #[tokio::test]
    async fn test_unknown_operator_asks_oracle() {
        let oracle = Arc::new(ScriptedOracle::decisions(vec![true]));
        let ev = ConditionEvaluator::new(Some(oracle.clone()));

        let got = ev
            .evaluate_all(
                &[cond("body", "is_polite", json!(true))],
                &json!({ "body": "thanks!" }),
                &ExecutionContext::new(),
            )
            .await
            .unwrap();

        assert!(got);
        assert_eq!(oracle.calls(), 1);
        let prompt = &oracle.prompts()[0];
        assert!(prompt.contains("is_polite"));
        assert!(prompt.contains("thanks!"));
    }

    #[tokio::test]
    async fn test_unknown_operator_without_oracle_fails() {
        let err = evaluator()
            .evaluate_all(&[cond("x", "vibes", json!(1))], &json!({}), &ExecutionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Oracle(_)));
    }

    #[tokio::test]
    async fn test_idempotent() {
        let conditions = vec![
            cond("score", "greater_than", json!(5)),
            cond("tags", "contains", json!("x")).or(),
        ];
        let input = json!({ "score": 3, "tags": ["x"] });
        let ctx = ExecutionContext::new();
        let ev = evaluator();

        let first = ev.evaluate_all(&conditions, &input, &ctx).await.unwrap();
        let second = ev.evaluate_all(&conditions, &input, &ctx).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_legacy_predicates() {
        let ev = ConditionEvaluator::new(Some(Arc::new(ScriptedOracle::decisions(vec![false]))));
        let ctx = ExecutionContext::new();

        let contains = ConditionNode {
            condition: Some(Predicate::Contains {
                value: "LGTM".into(),
                field: None,
            }),
            conditions: vec![],
        };
        assert!(ev.evaluate(&contains, &json!("review: lgtm"), &ctx).await.unwrap());

        let semantic = ConditionNode {
            condition: Some(Predicate::SemanticDecision {
                prompt: "Is the draft finished?".into(),
            }),
            conditions: vec![],
        };
        assert!(!ev.evaluate(&semantic, &json!("half a draft"), &ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_verdict() {
        let oracle = Arc::new(ScriptedOracle::always(json!({ "unexpected": true })));
        let ev = ConditionEvaluator::new(Some(oracle));
        let err = ev
            .evaluate_all(&[cond("x", "vibes", json!(1))], &json!({}), &ExecutionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::ConditionEvaluation(_)));
    }
}
