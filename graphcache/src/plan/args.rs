//! Argument builders as data.
//!
//! Field arguments are compiled once into a small spec tree and evaluated
//! against variables at call time. The tree serializes cleanly, which keeps
//! plans value-typed and cacheable.

use serde_json::Map as JsonMap;
use serde_json::Value;

/// The variables of one operation call.
pub type Variables = JsonMap<String, Value>;

/// A compiled argument value: a variable slot, a literal, or a composite of
/// the two.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgSpec {
    Var(String),
    Const(Value),
    Array(Vec<ArgSpec>),
    Object(Vec<(String, ArgSpec)>),
}

impl ArgSpec {
    /// Evaluates against the call's variables. `None` means the value is
    /// undefined (an unbound variable) and the argument is elided.
    pub fn evaluate(&self, vars: &Variables) -> Option<Value> {
        match self {
            Self::Var(name) => vars.get(name).cloned(),
            Self::Const(value) => Some(value.clone()),
            Self::Array(items) => Some(Value::Array(
                items
                    .iter()
                    .map(|item| item.evaluate(vars).unwrap_or(Value::Null))
                    .collect(),
            )),
            Self::Object(entries) => {
                let mut map = JsonMap::new();
                for (key, spec) in entries {
                    if let Some(value) = spec.evaluate(vars) {
                        map.insert(key.clone(), value);
                    }
                }
                Some(Value::Object(map))
            }
        }
    }
}

/// Evaluates a declared argument list to a JSON object, eliding undefined
/// arguments, in declared order.
pub fn evaluate_args(args: &[(String, ArgSpec)], vars: &Variables) -> Variables {
    let mut map = JsonMap::new();
    for (name, spec) in args {
        if let Some(value) = spec.evaluate(vars) {
            map.insert(name.clone(), value);
        }
    }
    map
}

/// Emits JSON with object keys sorted ascending at every depth, so that
/// structurally equal values produce byte-equal text.
pub fn stable_json(value: &Value) -> String {
    let mut out = String::new();
    write_stable_json(value, &mut out);
    out
}

pub fn stable_object_json(map: &Variables) -> String {
    let mut out = String::new();
    write_stable_object(map, &mut out);
    out
}

fn write_stable_json(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(_) => {
            // serde_json handles escaping; scalar serialization cannot fail.
            out.push_str(&serde_json::to_string(value).unwrap_or_default())
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_stable_json(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => write_stable_object(map, out),
    }
}

fn write_stable_object(map: &Variables, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort_unstable();
    out.push('{');
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&serde_json::to_string(key.as_str()).unwrap_or_default());
        out.push(':');
        write_stable_json(&map[key.as_str()], out);
    }
    out.push('}');
}
