use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use weavecore::{Node, NodeContext, NodeDefinition, NodeError, NodeKind, PortDefinition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextOperation {
    Uppercase,
    Lowercase,
    Trim,
    Reverse,
    Capitalize,
    Title,
}

impl TextOperation {
    pub fn apply(self, text: &str) -> String {
        match self {
            TextOperation::Uppercase => text.to_uppercase(),
            TextOperation::Lowercase => text.to_lowercase(),
            TextOperation::Trim => text.trim().to_string(),
            TextOperation::Reverse => text.chars().rev().collect(),
            TextOperation::Capitalize => {
                let mut chars = text.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                    None => String::new(),
                }
            }
            TextOperation::Title => title_case(text),
        }
    }
}

/// Uppercase the first letter of every alphabetic run, lowercase the rest.
fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_word = false;
    for c in text.chars() {
        if c.is_alphabetic() {
            if in_word {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(c);
            in_word = false;
        }
    }
    out
}

#[derive(Debug, Deserialize)]
pub struct TextInput {
    pub text: String,
    pub operation: TextOperation,
}

#[derive(Debug, Serialize)]
pub struct TextOutput {
    pub result: String,
    pub original_length: usize,
    pub result_length: usize,
}

pub struct TextProcessNode;

#[async_trait]
impl Node for TextProcessNode {
    type Input = TextInput;
    type Output = TextOutput;

    fn definition(&self) -> NodeDefinition {
        NodeDefinition::new("text.process", NodeKind::Tool)
            .describe("text", "Transform text with various operations")
            .input(PortDefinition::required("text", "Input text to process"))
            .input(PortDefinition::required(
                "operation",
                "One of uppercase, lowercase, trim, reverse, capitalize, title",
            ))
            .output(PortDefinition::required("result", "Processed text"))
            .output(PortDefinition::required("original_length", "Characters in the input"))
            .output(PortDefinition::required("result_length", "Characters in the result"))
    }

    async fn execute(&self, input: TextInput, _ctx: &NodeContext) -> Result<TextOutput, NodeError> {
        let result = input.operation.apply(&input.text);
        Ok(TextOutput {
            original_length: input.text.chars().count(),
            result_length: result.chars().count(),
            result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations() {
        assert_eq!(TextOperation::Uppercase.apply("héllo"), "HÉLLO");
        assert_eq!(TextOperation::Trim.apply("  x \n"), "x");
        assert_eq!(TextOperation::Reverse.apply("abc"), "cba");
        assert_eq!(TextOperation::Capitalize.apply("hELLO world"), "Hello world");
        assert_eq!(TextOperation::Title.apply("hello wORLD-wide"), "Hello World-Wide");
        assert_eq!(TextOperation::Capitalize.apply(""), "");
    }
}
