use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde_json::Value as Json;

use super::{Attrs, Evaluator, Lambda, Value};

const LAMBDA_KEY: &str = "__lambda";
const INPUT_KEY: &str = "__input";
const SOURCE_INFO_KEY: &str = "__sourceInfo";

/// Evaluator for manifests written as JSON (`flake.json`).
///
/// Plain JSON maps onto values directly. Three object forms are special:
///
/// * `{"__lambda": {"formals": [..] | null, "body": ..}}` is a function; calling
///   it yields `body`.
/// * `{"__input": "<name>"}` inside a body refers to an input of the flake.
/// * `{"__sourceInfo": "<field>"}` inside a body refers to a source-info field.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEvaluator;

impl JsonEvaluator {
    pub fn new() -> Self {
        JsonEvaluator
    }

    fn convert(&self, json: &Json, scope: Option<(&Value, &Value)>) -> Result<Value> {
        Ok(match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => Value::Int(
                n.as_i64()
                    .with_context(|| format!("unsupported number {}", n))?,
            ),
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::List(
                items
                    .iter()
                    .map(|item| self.convert(item, scope))
                    .collect::<Result<_>>()?,
            ),
            Json::Object(map) if map.len() == 1 => {
                let (key, inner) = map.iter().next().context("empty object")?;
                match (key.as_str(), scope) {
                    (LAMBDA_KEY, _) => Value::Lambda(parse_lambda(inner)?),
                    (INPUT_KEY, Some((inputs, _))) => lookup(inputs, inner, "input")?,
                    (SOURCE_INFO_KEY, Some((_, source_info))) => {
                        lookup(source_info, inner, "source-info field")?
                    }
                    _ => {
                        let mut attrs = Attrs::new();
                        attrs.insert(key.clone(), self.convert(inner, scope)?);
                        Value::Attrs(attrs)
                    }
                }
            }
            Json::Object(map) => Value::Attrs(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), self.convert(v, scope)?)))
                    .collect::<Result<_>>()?,
            ),
        })
    }
}

fn parse_lambda(json: &Json) -> Result<Lambda> {
    let formals = match json.get("formals") {
        None | Some(Json::Null) => None,
        Some(Json::Array(names)) => Some(
            names
                .iter()
                .map(|n| {
                    n.as_str()
                        .map(str::to_string)
                        .context("function formals must be strings")
                })
                .collect::<Result<Vec<_>>>()?,
        ),
        Some(other) => anyhow::bail!("function formals must be a list, got {}", other),
    };
    let body = json.get("body").cloned().unwrap_or(Json::Null);
    Ok(Lambda::new(formals, body))
}

fn lookup(scope: &Value, name: &Json, what: &str) -> Result<Value> {
    let name = name
        .as_str()
        .with_context(|| format!("{} reference must be a string", what))?;
    scope
        .get(name)
        .cloned()
        .with_context(|| format!("undefined {} '{}'", what, name))
}

impl Evaluator for JsonEvaluator {
    fn manifest_file_name(&self) -> &str {
        "flake.json"
    }

    fn evaluate_manifest(&self, path: &Path) -> Result<Value> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {:?}", path))?;
        let json: Json = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest {:?}", path))?;
        self.convert(&json, None)
            .with_context(|| format!("Failed to evaluate manifest {:?}", path))
    }

    fn invoke_outputs(&self, outputs: &Lambda, inputs: &Value, source_info: &Value) -> Result<Value> {
        let body = outputs
            .body::<Json>()
            .context("function was not produced by the JSON evaluator")?;
        self.convert(body, Some((inputs, source_info)))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_evaluate_manifest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flake.json");
        fs::write(
            &path,
            r#"{
                "edition": 201909,
                "description": "test",
                "outputs": {"__lambda": {"formals": ["self", "nixpkgs"], "body": {"x": 1}}}
            }"#,
        )
        .unwrap();

        let value = JsonEvaluator::new().evaluate_manifest(&path).unwrap();
        assert_eq!(value.get("edition"), Some(&Value::Int(201909)));
        match value.get("outputs") {
            Some(Value::Lambda(lambda)) => {
                assert_eq!(
                    lambda.formals(),
                    Some(&["self".to_string(), "nixpkgs".to_string()][..])
                );
            }
            other => panic!("expected a function, got {:?}", other),
        }
    }

    #[test]
    fn test_invoke_substitutes_inputs() {
        let evaluator = JsonEvaluator::new();
        let lambda = parse_lambda(&serde_json::json!({
            "formals": null,
            "body": {"dep": {"__input": "dep"}, "rev": {"__sourceInfo": "outPath"}, "n": 3}
        }))
        .unwrap();

        let mut inputs = Attrs::new();
        inputs.insert("dep".to_string(), Value::from("dep-value"));
        let mut source_info = Attrs::new();
        source_info.insert("outPath".to_string(), Value::from("/store/x-source"));

        let result = evaluator
            .invoke_outputs(&lambda, &Value::Attrs(inputs), &Value::Attrs(source_info))
            .unwrap();
        assert_eq!(result.get("dep"), Some(&Value::from("dep-value")));
        assert_eq!(result.get("rev"), Some(&Value::from("/store/x-source")));
        assert_eq!(result.get("n"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_undefined_input_is_an_error() {
        let lambda = parse_lambda(&serde_json::json!({"body": {"__input": "nope"}})).unwrap();
        let result = JsonEvaluator::new().invoke_outputs(
            &lambda,
            &Value::Attrs(Attrs::new()),
            &Value::Attrs(Attrs::new()),
        );
        assert!(result.is_err());
    }
}
