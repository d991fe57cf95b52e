//! Tool name and JSON-schema sanitization for the `tools[]` → `functionDeclarations[]`
//! translation (§4.4.1).

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{Map, Value};

const MAX_SCHEMA_DEPTH: usize = 12;
const ALLOWED_KEYS: &[&str] = &["type", "properties", "required", "items", "enum", "description"];
const GEMINI_STRIPPED_KEYS: &[&str] = &["$schema", "additionalProperties"];
const FORBIDDEN_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Keep `[A-Za-z0-9_-]`, truncated to 64 characters.
pub fn sanitize_tool_name(name: &str) -> String {
    let filtered: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    filtered.chars().take(64).collect()
}

/// Sanitizes a tool's `input_schema` for the Gemini surface: allowlisted keys
/// only, depth-capped, prototype-pollution keys always dropped.
pub fn sanitize_schema_for_gemini(schema: &Value) -> Value {
    sanitize_value(schema, 0, true)
}

/// Sanitizes for the Claude surface, which tolerates a slightly larger key
/// set (no Gemini-specific stripping beyond the shared allowlist/proto guard).
pub fn sanitize_schema_for_claude(schema: &Value) -> Value {
    sanitize_value(schema, 0, false)
}

fn sanitize_value(value: &Value, depth: usize, gemini: bool) -> Value {
    if depth >= MAX_SCHEMA_DEPTH {
        return too_deep();
    }
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, v) in map {
                if FORBIDDEN_KEYS.contains(&key.as_str()) {
                    continue;
                }
                if !ALLOWED_KEYS.contains(&key.as_str()) {
                    continue;
                }
                if gemini && GEMINI_STRIPPED_KEYS.contains(&key.as_str()) {
                    continue;
                }
                let sanitized = match key.as_str() {
                    "properties" => sanitize_properties(v, depth, gemini),
                    "items" => sanitize_value(v, depth + 1, gemini),
                    _ => v.clone(),
                };
                out.insert(key.clone(), sanitized);
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn sanitize_properties(value: &Value, depth: usize, gemini: bool) -> Value {
    let Value::Object(map) = value else {
        return Value::Object(Map::new());
    };
    let mut out = Map::new();
    for (key, v) in map {
        out.insert(key.clone(), sanitize_value(v, depth + 1, gemini));
    }
    Value::Object(out)
}

fn too_deep() -> Value {
    let mut out = Map::new();
    out.insert("description".to_string(), Value::String("[schema too deep]".to_string()));
    Value::Object(out)
}

/// Structural key for memoization: the schema's own JSON text, independent
/// of insertion order concerns since `serde_json::Value::Object` preserves
/// source order and tool schemas are re-sent identically across requests.
fn structural_key(schema: &Value, gemini: bool) -> String {
    format!("{}:{}", gemini, schema)
}

/// Memoizes sanitized schemas by structural key so repeated tool
/// declarations across requests in the same process skip re-walking.
pub struct SchemaSanitizer {
    cache: Mutex<HashMap<String, Value>>,
}

impl SchemaSanitizer {
    pub fn new() -> Self {
        Self { cache: Mutex::new(HashMap::new()) }
    }

    pub fn sanitize(&self, schema: &Value, gemini: bool) -> Value {
        let key = structural_key(schema, gemini);
        if let Some(cached) = self.cache.lock().unwrap().get(&key) {
            return cached.clone();
        }
        let sanitized = if gemini {
            sanitize_schema_for_gemini(schema)
        } else {
            sanitize_schema_for_claude(schema)
        };
        self.cache.lock().unwrap().insert(key, sanitized.clone());
        sanitized
    }
}

impl Default for SchemaSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_name_sanitization_keeps_allowed_chars_and_truncates() {
        let long = "a".repeat(100);
        assert_eq!(sanitize_tool_name(&long).len(), 64);
        assert_eq!(sanitize_tool_name("get weather! (v2)"), "getweatherv2");
    }

    #[test]
    fn schema_drops_unknown_and_proto_pollution_keys() {
        let schema = json!({
            "type": "object",
            "__proto__": {"polluted": true},
            "constructor": "x",
            "format": "date-time",
            "properties": {"city": {"type": "string", "unknownKey": 1}},
            "required": ["city"],
        });
        let sanitized = sanitize_schema_for_gemini(&schema);
        let obj = sanitized.as_object().unwrap();
        assert!(!obj.contains_key("__proto__"));
        assert!(!obj.contains_key("constructor"));
        assert!(!obj.contains_key("format"));
        let city = &obj["properties"]["city"];
        assert!(!city.as_object().unwrap().contains_key("unknownKey"));
    }

    #[test]
    fn schema_too_deep_is_replaced() {
        let mut value = json!({"type": "string"});
        for _ in 0..20 {
            value = json!({"type": "object", "properties": {"nested": value}});
        }
        let sanitized = sanitize_schema_for_gemini(&value);
        // Walk down until we hit the truncation marker.
        let mut current = &sanitized;
        let mut saw_too_deep = false;
        for _ in 0..20 {
            if let Some(desc) = current.get("description").and_then(|d| d.as_str()) {
                if desc == "[schema too deep]" {
                    saw_too_deep = true;
                    break;
                }
            }
            match current.get("properties").and_then(|p| p.get("nested")) {
                Some(next) => current = next,
                None => break,
            }
        }
        assert!(saw_too_deep);
    }

    #[test]
    fn gemini_strips_additional_properties_and_schema_keyword() {
        let schema = json!({"type": "object", "additionalProperties": false, "$schema": "x"});
        let sanitized = sanitize_schema_for_gemini(&schema);
        let obj = sanitized.as_object().unwrap();
        assert!(!obj.contains_key("additionalProperties"));
        assert!(!obj.contains_key("$schema"));
    }
}
