use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use weavecore::{Node, NodeContext, NodeDefinition, NodeError, NodeKind, PortDefinition};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalcError {
    #[error("Invalid expression syntax: {0}")]
    Syntax(String),
    #[error("Division by zero")]
    DivisionByZero,
    #[error("{0}")]
    Evaluation(String),
}

impl From<CalcError> for NodeError {
    fn from(err: CalcError) -> Self {
        let code = match err {
            CalcError::Syntax(_) => "SYNTAX_ERROR",
            CalcError::DivisionByZero => "DIVISION_BY_ZERO",
            CalcError::Evaluation(_) => "EVALUATION_ERROR",
        };
        NodeError::failed(code, err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Num(f64),
    Plus,
    Minus,
    Star,
    Slash,
    DoubleSlash,
    Percent,
    Power,
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>, CalcError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        let (token, width) = match c {
            ' ' | '\t' | '\n' => {
                i += 1;
                continue;
            }
            '+' => (Token::Plus, 1),
            '-' => (Token::Minus, 1),
            '*' if next == Some('*') => (Token::Power, 2),
            '*' => (Token::Star, 1),
            '/' if next == Some('/') => (Token::DoubleSlash, 2),
            '/' => (Token::Slash, 1),
            '%' => (Token::Percent, 1),
            '(' => (Token::LParen, 1),
            ')' => (Token::RParen, 1),
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| CalcError::Syntax(format!("bad number '{literal}'")))?;
                tokens.push(Token::Num(value));
                continue;
            }
            other => return Err(CalcError::Syntax(format!("unexpected character '{other}'"))),
        };
        tokens.push(token);
        i += width;
    }
    Ok(tokens)
}

const MAX_DEPTH: usize = 256;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.peek();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<f64, CalcError> {
        let mut value = self.term()?;
        while let Some(op @ (Token::Plus | Token::Minus)) = self.peek() {
            self.bump();
            let rhs = self.term()?;
            value = if op == Token::Plus { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, CalcError> {
        let mut value = self.unary()?;
        while let Some(op @ (Token::Star | Token::Slash | Token::DoubleSlash | Token::Percent)) = self.peek() {
            self.bump();
            let rhs = self.unary()?;
            if op != Token::Star && rhs == 0.0 {
                return Err(CalcError::DivisionByZero);
            }
            value = match op {
                Token::Star => value * rhs,
                Token::Slash => value / rhs,
                Token::DoubleSlash => (value / rhs).floor(),
                // Floored modulo: the result takes the divisor's sign.
                _ => value - rhs * (value / rhs).floor(),
            };
        }
        Ok(value)
    }

    // Every recursive path (sign chains, exponents, parentheses) passes
    // through here, so this bounds the parser's stack use.
    fn unary(&mut self) -> Result<f64, CalcError> {
        if self.depth >= MAX_DEPTH {
            return Err(CalcError::Syntax("expression nested too deeply".to_string()));
        }
        self.depth += 1;
        let value = self.signed();
        self.depth -= 1;
        value
    }

    fn signed(&mut self) -> Result<f64, CalcError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.bump();
                Ok(-self.unary()?)
            }
            Some(Token::Plus) => {
                self.bump();
                self.unary()
            }
            _ => self.power(),
        }
    }

    // `**` binds tighter than a unary sign on its left and is right-associative.
    fn power(&mut self) -> Result<f64, CalcError> {
        let base = self.atom()?;
        if self.peek() == Some(Token::Power) {
            self.bump();
            let exponent = self.unary()?;
            if base == 0.0 && exponent < 0.0 {
                return Err(CalcError::DivisionByZero);
            }
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<f64, CalcError> {
        match self.bump() {
            Some(Token::Num(n)) => Ok(n),
            Some(Token::LParen) => {
                let value = self.expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(CalcError::Syntax("missing ')'".to_string())),
                }
            }
            Some(other) => Err(CalcError::Syntax(format!("unexpected {other:?}"))),
            None => Err(CalcError::Syntax("unexpected end of expression".to_string())),
        }
    }
}

/// Evaluate an arithmetic expression.
pub fn evaluate(expression: &str) -> Result<f64, CalcError> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(CalcError::Syntax("empty expression".to_string()));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;
    if parser.pos < parser.tokens.len() {
        return Err(CalcError::Syntax(format!(
            "unexpected {:?} after expression",
            parser.tokens[parser.pos]
        )));
    }
    if !value.is_finite() {
        return Err(CalcError::Evaluation(format!("result is not finite: {value}")));
    }
    Ok(value)
}

#[derive(Debug, Deserialize)]
pub struct CalculateInput {
    pub expression: String,
}

#[derive(Debug, Serialize)]
pub struct CalculateOutput {
    pub result: f64,
}

pub struct CalculateNode;

#[async_trait]
impl Node for CalculateNode {
    type Input = CalculateInput;
    type Output = CalculateOutput;

    fn definition(&self) -> NodeDefinition {
        NodeDefinition::new("math.calculate", NodeKind::Tool)
            .describe("math", "Perform arithmetic on an expression")
            .input(PortDefinition::required("expression", "e.g. (1 + 2) * 3"))
            .output(PortDefinition::required("result", "Calculation result"))
    }

    fn validate_input(&self, raw: weavecore::JsonMap) -> Result<CalculateInput, NodeError> {
        let input: CalculateInput = serde_json::from_value(serde_json::Value::Object(raw))
            .map_err(|e| NodeError::validation("expression", e.to_string()))?;
        if input.expression.trim().is_empty() {
            return Err(NodeError::validation("expression", "Expression is required"));
        }
        Ok(input)
    }

    async fn execute(&self, input: CalculateInput, _ctx: &NodeContext) -> Result<CalculateOutput, NodeError> {
        Ok(CalculateOutput {
            result: evaluate(&input.expression)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_and_grouping() {
        assert_eq!(evaluate("(1 + 2) * 3"), Ok(9.0));
        assert_eq!(evaluate("1 + 2 * 3"), Ok(7.0));
        assert_eq!(evaluate("2 ** 3 ** 2"), Ok(512.0));
        assert_eq!(evaluate("-2 ** 2"), Ok(-4.0));
        assert_eq!(evaluate("2 ** -1"), Ok(0.5));
        assert_eq!(evaluate("7 // 2"), Ok(3.0));
        assert_eq!(evaluate("-7 // 2"), Ok(-4.0));
        assert_eq!(evaluate("-7 % 3"), Ok(2.0));
        assert_eq!(evaluate("1.5 * 4"), Ok(6.0));
    }

    #[test]
    fn errors() {
        assert_eq!(evaluate("1 / 0"), Err(CalcError::DivisionByZero));
        assert_eq!(evaluate("5 % 0"), Err(CalcError::DivisionByZero));
        assert!(matches!(evaluate("(1 + 2"), Err(CalcError::Syntax(_))));
        assert!(matches!(evaluate("1 +"), Err(CalcError::Syntax(_))));
        assert!(matches!(evaluate("2 3"), Err(CalcError::Syntax(_))));
        assert!(matches!(evaluate("__import__('os')"), Err(CalcError::Syntax(_))));
        assert!(matches!(evaluate("10 ** 400"), Err(CalcError::Evaluation(_))));
    }

    #[test]
    fn deep_nesting_is_a_syntax_error() {
        let nested = format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000));
        assert_eq!(
            evaluate(&nested),
            Err(CalcError::Syntax("expression nested too deeply".to_string()))
        );
        let signs = format!("{}1", "-".repeat(200_000));
        assert!(matches!(evaluate(&signs), Err(CalcError::Syntax(_))));
        let tower = vec!["1"; 100_000].join(" ** ");
        assert!(matches!(evaluate(&tower), Err(CalcError::Syntax(_))));

        let fine = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(evaluate(&fine), Ok(1.0));
    }
}
