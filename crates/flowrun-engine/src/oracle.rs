//! Prompt builders and verdict parsing for the semantic oracle.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use flowrun_core::context::value_text;
use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::SemanticOracle;
use flowrun_core::types::OracleRequest;

/// Boolean decision verdict.
#[derive(Deserialize)]
struct DecisionResponse {
    decision: Flexible,
    #[serde(default)]
    reasoning: String,
}

/// Worker selection verdict.
#[derive(Deserialize)]
struct SelectionResponse {
    selected_agent: String,
    #[serde(default)]
    reasoning: String,
}

/// Models sometimes answer `"true"` or `"yes"` instead of a JSON boolean.
#[derive(Deserialize)]
#[serde(untagged)]
enum Flexible {
    Bool(bool),
    Text(String),
}

impl Flexible {
    fn as_bool(&self) -> Option<bool> {
        match self {
            Flexible::Bool(b) => Some(*b),
            Flexible::Text(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" => Some(true),
                "false" | "no" => Some(false),
                _ => None,
            },
        }
    }
}

fn decision_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "decision": { "type": "boolean" },
            "reasoning": { "type": "string" }
        },
        "required": ["decision"]
    })
}

fn selection_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "selected_agent": { "type": "string" },
            "reasoning": { "type": "string" }
        },
        "required": ["selected_agent"]
    })
}

/// Accept a verdict either as a JSON object or as JSON text.
fn normalize(verdict: Value) -> Value {
    match verdict {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    }
}

/// Ask the oracle a yes/no question about `data`.
pub async fn decide(
    oracle: &dyn SemanticOracle,
    question: &str,
    data: &Value,
    context: &Value,
) -> Result<bool> {
    let prompt = format!(
        "Evaluate the following condition and answer with a boolean decision.\n\n\
         Condition: {}\n\nData:\n{}\n\nContext:\n{}\n\n\
         Respond with ONLY valid JSON: {{\"decision\": true | false, \"reasoning\": \"brief explanation\"}}",
        question,
        value_text(data),
        value_text(context),
    );

    let verdict = oracle
        .evaluate(OracleRequest {
            prompt,
            schema: decision_schema(),
        })
        .await?;

    parse_decision(verdict)
}

pub(crate) fn parse_decision(verdict: Value) -> Result<bool> {
    let verdict = normalize(verdict);
    let parsed: DecisionResponse = serde_json::from_value(verdict.clone()).map_err(|e| {
        FlowError::ConditionEvaluation(format!("malformed oracle verdict {}: {}", verdict, e))
    })?;
    let decision = parsed.decision.as_bool().ok_or_else(|| {
        FlowError::ConditionEvaluation(format!("non-boolean decision in {}", verdict))
    })?;
    debug!(decision, reasoning = %parsed.reasoning, "Oracle decision");
    Ok(decision)
}

/// Ask the oracle to pick one worker out of a described roster.
pub async fn choose(oracle: &dyn SemanticOracle, task: &str, roster: &str) -> Result<String> {
    let prompt = format!(
        "Select the single best agent for the task below.\n\n\
         Task: {}\n\nAvailable agents:\n{}\n\n\
         Respond with ONLY valid JSON: {{\"selected_agent\": \"<agent name>\", \"reasoning\": \"brief explanation\"}}",
        task, roster,
    );

    let verdict = oracle
        .evaluate(OracleRequest {
            prompt,
            schema: selection_schema(),
        })
        .await?;

    let verdict = normalize(verdict);
    let parsed: SelectionResponse = serde_json::from_value(verdict.clone())
        .map_err(|e| FlowError::Oracle(format!("malformed selection verdict {}: {}", verdict, e)))?;
    debug!(agent = %parsed.selected_agent, reasoning = %parsed.reasoning, "Oracle selection");
    Ok(parsed.selected_agent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decision_bool() {
        assert!(parse_decision(json!({ "decision": true })).unwrap());
        assert!(!parse_decision(json!({ "decision": false, "reasoning": "nope" })).unwrap());
    }

    #[test]
    fn test_parse_decision_text_forms() {
        assert!(parse_decision(json!({ "decision": "yes" })).unwrap());
        assert!(!parse_decision(json!({ "decision": "False" })).unwrap());
        assert!(parse_decision(json!(r#"{"decision": true}"#)).unwrap());
    }

    #[test]
    fn test_parse_decision_malformed() {
        let err = parse_decision(json!({ "answer": 42 })).unwrap_err();
        assert!(matches!(err, FlowError::ConditionEvaluation(_)));

        let err = parse_decision(json!({ "decision": "maybe" })).unwrap_err();
        assert!(matches!(err, FlowError::ConditionEvaluation(_)));
    }
}
