use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use weavecore::{Node, NodeContext, NodeDefinition, NodeError, NodeKind, PortDefinition};

#[derive(Debug, Deserialize)]
pub struct JsonParseInput {
    pub json: String,
}

#[derive(Debug, Serialize)]
pub struct JsonParseOutput {
    pub parsed: Value,
}

/// Parse JSON string to Value
pub struct JsonParseNode;

#[async_trait]
impl Node for JsonParseNode {
    type Input = JsonParseInput;
    type Output = JsonParseOutput;

    fn definition(&self) -> NodeDefinition {
        NodeDefinition::new("json.parse", NodeKind::Tool)
            .describe("transform", "Parse JSON string")
            .input(PortDefinition::required("json", "JSON text"))
            .output(PortDefinition::required("parsed", "Parsed value"))
    }

    async fn execute(&self, input: JsonParseInput, _ctx: &NodeContext) -> Result<JsonParseOutput, NodeError> {
        let parsed = serde_json::from_str(&input.json)
            .map_err(|e| NodeError::failed("PARSE_ERROR", format!("JSON parse error: {e}")))?;
        Ok(JsonParseOutput { parsed })
    }
}

#[derive(Debug, Deserialize)]
pub struct JsonStringifyInput {
    pub value: Value,
    #[serde(default)]
    pub pretty: bool,
}

#[derive(Debug, Serialize)]
pub struct JsonStringifyOutput {
    pub json: String,
}

/// Stringify Value to JSON
pub struct JsonStringifyNode;

#[async_trait]
impl Node for JsonStringifyNode {
    type Input = JsonStringifyInput;
    type Output = JsonStringifyOutput;

    fn definition(&self) -> NodeDefinition {
        NodeDefinition::new("json.stringify", NodeKind::Tool)
            .describe("transform", "Convert value to JSON string")
            .input(PortDefinition::required("value", "Any JSON value"))
            .input(PortDefinition::optional("pretty", "Indent the output"))
            .output(PortDefinition::required("json", "JSON text"))
    }

    async fn execute(&self, input: JsonStringifyInput, _ctx: &NodeContext) -> Result<JsonStringifyOutput, NodeError> {
        let json = if input.pretty {
            serde_json::to_string_pretty(&input.value)
        } else {
            serde_json::to_string(&input.value)
        }
        .map_err(|e| NodeError::InvalidOutput(format!("JSON stringify error: {e}")))?;
        Ok(JsonStringifyOutput { json })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Parse the `$`, `$.a.b`, `$[0]`, `$.a[1].b` subset of JSONPath.
fn parse_path(path: &str) -> Result<Vec<Segment>, String> {
    let rest = path
        .strip_prefix('$')
        .ok_or_else(|| "Path must start with '$'".to_string())?;
    let mut segments = Vec::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                let mut key = String::new();
                while let Some(&next) = chars.peek() {
                    if next == '.' || next == '[' {
                        break;
                    }
                    key.push(next);
                    chars.next();
                }
                if key.is_empty() {
                    return Err(format!("empty key in path '{path}'"));
                }
                segments.push(Segment::Key(key));
            }
            '[' => {
                let mut digits = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(d) => digits.push(d),
                        None => return Err(format!("unclosed '[' in path '{path}'")),
                    }
                }
                let index = digits
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid index '{digits}' in path '{path}'"))?;
                segments.push(Segment::Index(index));
            }
            other => return Err(format!("unexpected '{other}' in path '{path}'")),
        }
    }
    Ok(segments)
}

/// Walk `data` along `path`. A path that does not resolve yields `(Null, false)`.
pub fn extract(data: &Value, path: &str) -> Result<(Value, bool), String> {
    let mut current = data;
    for segment in parse_path(path)? {
        let next = match (&segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key),
            (Segment::Index(i), Value::Array(items)) => items.get(*i),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Ok((Value::Null, false)),
        }
    }
    Ok((current.clone(), true))
}

#[derive(Debug, Deserialize)]
pub struct JsonExtractInput {
    pub data: Value,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct JsonExtractOutput {
    pub result: Value,
    pub matched: bool,
}

/// Pull one value out of a JSON document by path
pub struct JsonExtractNode;

#[async_trait]
impl Node for JsonExtractNode {
    type Input = JsonExtractInput;
    type Output = JsonExtractOutput;

    fn definition(&self) -> NodeDefinition {
        NodeDefinition::new("json.extract", NodeKind::Tool)
            .describe("transform", "Extract a value with a JSONPath-like expression")
            .input(PortDefinition::required("data", "Object or array to search"))
            .input(PortDefinition::required("path", "e.g. $.items[0].name"))
            .output(PortDefinition::required("result", "Matched value or null"))
            .output(PortDefinition::required("matched", "Whether the path resolved"))
    }

    async fn execute(&self, input: JsonExtractInput, _ctx: &NodeContext) -> Result<JsonExtractOutput, NodeError> {
        let (result, matched) =
            extract(&input.data, &input.path).map_err(|msg| NodeError::validation("path", msg))?;
        Ok(JsonExtractOutput { result, matched })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn walks_keys_and_indices() {
        let data = json!({"items": [{"name": "a"}, {"name": "b"}], "count": 2});
        assert_eq!(extract(&data, "$").unwrap(), (data.clone(), true));
        assert_eq!(extract(&data, "$.count").unwrap(), (json!(2), true));
        assert_eq!(extract(&data, "$.items[1].name").unwrap(), (json!("b"), true));
        assert_eq!(extract(&data, "$.items[5]").unwrap(), (Value::Null, false));
        assert_eq!(extract(&data, "$.count.deeper").unwrap(), (Value::Null, false));
    }

    #[test]
    fn rejects_malformed_paths() {
        let data = json!({});
        assert!(extract(&data, "items").is_err());
        assert!(extract(&data, "$.items[").is_err());
        assert!(extract(&data, "$.items[x]").is_err());
        assert!(extract(&data, "$..a").is_err());
    }
}
