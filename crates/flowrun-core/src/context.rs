use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::VariableMap;

/// Reserved key for the current loop index.
pub const LOOP_INDEX_KEY: &str = "loop_index";
/// Reserved key for the current loop element.
pub const LOOP_ITEM_KEY: &str = "loop_item";
/// Reserved key for an error captured by the `continue` policy.
pub const LAST_ERROR_KEY: &str = "last_error";

/// Loop-scope overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopScope {
    pub node_id: String,
    pub index: usize,
    #[serde(default)]
    pub item: Option<Value>,
}

/// Layered environment threaded alongside the primary value.
///
/// Layers, highest precedence first: error overlay, loop overlay, node
/// outputs, base variables. Every `with_*` call returns an extended copy,
/// so an extension is only visible below the call that introduced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    variables: VariableMap,
    outputs: BTreeMap<String, Value>,
    #[serde(default)]
    loop_scope: Option<LoopScope>,
    #[serde(default)]
    last_error: Option<String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a context from workflow variables.
    pub fn from_variables(variables: VariableMap) -> Self {
        Self {
            variables,
            ..Self::default()
        }
    }

    /// Bind a node's output.
    pub fn with_output(&self, node_id: impl Into<String>, output: Value) -> Self {
        let mut next = self.clone();
        next.outputs.insert(node_id.into(), output);
        next
    }

    /// Enter a loop iteration.
    pub fn with_loop(&self, node_id: impl Into<String>, index: usize, item: Option<Value>) -> Self {
        let mut next = self.clone();
        next.loop_scope = Some(LoopScope {
            node_id: node_id.into(),
            index,
            item,
        });
        next
    }

    /// Record an error message captured by the `continue` policy.
    pub fn with_error(&self, message: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.last_error = Some(message.into());
        next
    }

    pub fn variables(&self) -> &VariableMap {
        &self.variables
    }

    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.outputs.get(node_id)
    }

    pub fn loop_scope(&self) -> Option<&LoopScope> {
        self.loop_scope.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Look up a top-level binding.
    pub fn get(&self, key: &str) -> Option<Value> {
        match key {
            LAST_ERROR_KEY => {
                if let Some(ref err) = self.last_error {
                    return Some(Value::String(err.clone()));
                }
            }
            LOOP_INDEX_KEY => {
                if let Some(ref scope) = self.loop_scope {
                    return Some(Value::from(scope.index));
                }
            }
            LOOP_ITEM_KEY => {
                if let Some(item) = self.loop_scope.as_ref().and_then(|s| s.item.clone()) {
                    return Some(item);
                }
            }
            _ => {}
        }
        self.outputs
            .get(key)
            .or_else(|| self.variables.get(key))
            .cloned()
    }

    /// Resolve a dotted path (`node.field.0`) against the context.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let head = segments.next()?;
        let root = self.get(head)?;
        let rest: Vec<&str> = segments.collect();
        if rest.is_empty() {
            return Some(root);
        }
        lookup_path(&root, &rest.join(".")).cloned()
    }

    /// Flatten every layer into one JSON object, overlays winning.
    pub fn to_value(&self) -> Value {
        let mut flat = self.variables.clone();
        for (k, v) in &self.outputs {
            flat.insert(k.clone(), v.clone());
        }
        if let Some(ref scope) = self.loop_scope {
            flat.insert(LOOP_INDEX_KEY.into(), Value::from(scope.index));
            if let Some(ref item) = scope.item {
                flat.insert(LOOP_ITEM_KEY.into(), item.clone());
            }
        }
        if let Some(ref err) = self.last_error {
            flat.insert(LAST_ERROR_KEY.into(), Value::String(err.clone()));
        }
        Value::Object(flat)
    }
}

/// Walk a dotted path through objects and arrays. Numeric segments index
/// arrays.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Render a value as prompt text: strings verbatim, everything else as JSON.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
