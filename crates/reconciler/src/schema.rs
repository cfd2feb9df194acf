//! JSON Schema helpers shared by plugin input and service parameter checks.

use jsonschema::Validator;
use serde_json::Value;

/// Compile a schema document.
pub fn compile(schema: &Value) -> Result<Validator, String> {
    jsonschema::validator_for(schema).map_err(|e| e.to_string())
}

/// Human-readable description of every violated constraint, prefixed with
/// the dotted path of the offending field.
pub fn violations(validator: &Validator, instance: &Value) -> Vec<String> {
    validator
        .iter_errors(instance)
        .map(|e| match dotted(e.instance_path().as_str()) {
            path if path.is_empty() => e.to_string(),
            path => format!("{path}: {e}"),
        })
        .collect()
}

/// `/spec/ports/0` as `spec.ports.0`.
fn dotted(pointer: &str) -> String {
    pointer
        .split('/')
        .skip(1)
        .map(|segment| segment.replace("~1", "/").replace("~0", "~"))
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn test_violations_lists_each_failure() {
        let validator = compile(&json!({
            "type": "object",
            "properties": {
                "enabled": {"type": "boolean"},
                "size": {"type": "integer", "minimum": 1}
            },
            "required": ["enabled"]
        }))
        .unwrap();

        assert!(violations(&validator, &json!({"enabled": true, "size": 2})).is_empty());
        let found = violations(&validator, &json!({"enabled": "yes", "size": 0}));
        assert_eq!(found.len(), 2);
        assert!(found.iter().any(|v| v.starts_with("enabled: ")));
        assert!(found.iter().any(|v| v.starts_with("size: ")));
    }

    #[test]
    fn test_root_violation_has_no_path_prefix() {
        let validator = compile(&json!({"type": "object", "required": ["enabled"]})).unwrap();
        let found = violations(&validator, &json!({}));
        assert_eq!(found.len(), 1);
        assert!(found[0].contains("enabled"));
        assert!(!found[0].starts_with(": "));
    }

    #[test]
    fn test_pointer_becomes_dotted_path() {
        assert_eq!(dotted(""), "");
        assert_eq!(dotted("/spec/ports/0"), "spec.ports.0");
        assert_eq!(dotted("/a~1b"), "a/b");
    }

    #[test]
    fn test_compile_rejects_malformed_schema() {
        assert!(compile(&json!({"type": 12})).is_err());
    }
}
