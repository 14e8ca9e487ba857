//! Expression tree, parser and evaluator.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::lexer::{tokenize, Token, TokenKind};
use super::{ConditionError, ParameterResolver};

/// Comparison operator.
///
/// All comparisons are ordinal string comparisons; numeric values must be
/// written fixed-width to compare as numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Ne,
    Ge,
    Le,
    Eq,
    Gt,
    Lt,
}

/// Recognized operator spellings, in matching preference order.
/// `=>` is a tolerated transposition of `>=`.
const OPERATORS: [(&str, Operator); 7] = [
    ("!=", Operator::Ne),
    (">=", Operator::Ge),
    ("<=", Operator::Le),
    ("==", Operator::Eq),
    (">", Operator::Gt),
    ("<", Operator::Lt),
    ("=>", Operator::Ge),
];

impl Operator {
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        OPERATORS
            .iter()
            .find(|(spelling, _)| *spelling == symbol)
            .map(|(_, op)| *op)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Ne => "!=",
            Operator::Ge => ">=",
            Operator::Le => "<=",
            Operator::Eq => "==",
            Operator::Gt => ">",
            Operator::Lt => "<",
        }
    }

    pub fn compare(&self, left: &str, right: &str) -> bool {
        match self {
            Operator::Eq => left == right,
            Operator::Ne => left != right,
            Operator::Gt => left > right,
            Operator::Lt => left < right,
            Operator::Ge => left >= right,
            Operator::Le => left <= right,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical connective between two comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Keyword {
    And,
    Or,
}

impl Keyword {
    pub fn from_word(word: &str) -> Option<Self> {
        match word {
            "AND" | "and" => Some(Keyword::And),
            "OR" | "or" => Some(Keyword::Or),
            _ => None,
        }
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Keyword::And => f.write_str("AND"),
            Keyword::Or => f.write_str("OR"),
        }
    }
}

/// One side of a comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Literal(String),
    /// Placeholder body, e.g. `context.executions.task1.status`.
    Placeholder(String),
}

impl Operand {
    fn substitute<R>(&self, resolver: &R) -> Result<String, ConditionError>
    where
        R: ParameterResolver + ?Sized,
    {
        match self {
            Operand::Literal(value) => Ok(value.clone()),
            Operand::Placeholder(reference) => resolver
                .resolve(reference)
                .ok_or_else(|| ConditionError::UnresolvedReference(reference.clone())),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Literal(value) => write!(f, "'{}'", value),
            Operand::Placeholder(reference) => write!(f, "{{{{{}}}}}", reference),
        }
    }
}

/// `left OPERATOR right`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub left: Operand,
    pub operator: Operator,
    pub right: Operand,
}

impl Comparison {
    pub fn evaluate<R>(&self, resolver: &R) -> Result<bool, ConditionError>
    where
        R: ParameterResolver + ?Sized,
    {
        let left = self.left.substitute(resolver)?;
        let right = self.right.substitute(resolver)?;
        Ok(self.operator.compare(&left, &right))
    }
}

/// Parsed condition.
///
/// `a OR b AND c` parses as `Group(Group(a, OR, b), AND, c)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Comparison(Comparison),
    Group {
        left: Box<Expression>,
        keyword: Keyword,
        right: Box<Expression>,
    },
}

impl Expression {
    pub fn parse(input: &str) -> Result<Self, ConditionError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ConditionError::malformed(0, "Empty expression"));
        }

        let tokens = tokenize(trimmed)?;
        let mut parser = Parser {
            tokens: tokens.into_iter(),
            end: trimmed.chars().count(),
        };

        let mut expression = Expression::Comparison(parser.comparison()?);
        while let Some(token) = parser.tokens.next() {
            let keyword = match token.kind {
                TokenKind::Keyword(keyword) => keyword,
                _ => {
                    return Err(ConditionError::malformed(
                        token.index,
                        format!("Expected AND or OR at index: {}", token.index),
                    ))
                }
            };
            let right = parser.comparison()?;
            expression = Expression::Group {
                left: Box::new(expression),
                keyword,
                right: Box::new(Expression::Comparison(right)),
            };
        }

        Ok(expression)
    }

    /// Evaluate left to right, skipping the right side (and its
    /// placeholders) once the left side decides the result.
    pub fn evaluate<R>(&self, resolver: &R) -> Result<bool, ConditionError>
    where
        R: ParameterResolver + ?Sized,
    {
        match self {
            Expression::Comparison(comparison) => comparison.evaluate(resolver),
            Expression::Group {
                left,
                keyword,
                right,
            } => match (keyword, left.evaluate(resolver)?) {
                (Keyword::And, false) => Ok(false),
                (Keyword::Or, true) => Ok(true),
                _ => right.evaluate(resolver),
            },
        }
    }

    /// Comparisons in source order.
    pub fn comparisons(&self) -> Vec<&Comparison> {
        match self {
            Expression::Comparison(comparison) => vec![comparison],
            Expression::Group { left, right, .. } => {
                let mut all = left.comparisons();
                all.extend(right.comparisons());
                all
            }
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Comparison(c) => write!(f, "{} {} {}", c.left, c.operator, c.right),
            Expression::Group {
                left,
                keyword,
                right,
            } => write!(f, "{} {} {}", left, keyword, right),
        }
    }
}

struct Parser {
    tokens: std::vec::IntoIter<Token>,
    /// Index reported when input ends early.
    end: usize,
}

impl Parser {
    fn comparison(&mut self) -> Result<Comparison, ConditionError> {
        let left = match self.tokens.next() {
            Some(token) => match token.kind {
                TokenKind::Literal(value) => Operand::Literal(value),
                TokenKind::Placeholder(reference) => Operand::Placeholder(reference),
                TokenKind::Word(word) => {
                    return Err(ConditionError::malformed(
                        token.index,
                        format!("Unexpected token '{}' at index: {}", word, token.index),
                    ))
                }
                _ => return Err(no_left_hand(token.index)),
            },
            None => return Err(no_left_hand(self.end)),
        };

        let operator = match self.tokens.next() {
            Some(token) => match token.kind {
                TokenKind::Operator(op) => op,
                TokenKind::Symbol(symbol) | TokenKind::Word(symbol) => {
                    return Err(ConditionError::UnsupportedOperator(symbol))
                }
                _ => return Err(no_operator(token.index)),
            },
            None => return Err(no_operator(self.end)),
        };

        let right = match self.tokens.next() {
            Some(token) => match token.kind {
                TokenKind::Literal(value) => Operand::Literal(value),
                TokenKind::Placeholder(reference) => Operand::Placeholder(reference),
                _ => return Err(no_right_hand(token.index)),
            },
            None => return Err(no_right_hand(self.end)),
        };

        Ok(Comparison {
            left,
            operator,
            right,
        })
    }
}

fn no_left_hand(index: usize) -> ConditionError {
    ConditionError::malformed(index, format!("No left-hand parameter at index: {}", index))
}

fn no_operator(index: usize) -> ConditionError {
    ConditionError::malformed(index, format!("No operator at index: {}", index))
}

fn no_right_hand(index: usize) -> ConditionError {
    ConditionError::malformed(index, format!("No right-hand parameter at index: {}", index))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn empty() -> HashMap<String, String> {
        HashMap::new()
    }

    fn eval(input: &str) -> bool {
        Expression::parse(input).unwrap().evaluate(&empty()).unwrap()
    }

    #[test]
    fn test_equality() {
        assert!(eval("'5' == '5'"));
        assert!(!eval("'5' != '5'"));
        assert!(!eval("'5' > '1' AND 'Donkey' == 'donkey'"));
        assert!(eval("'5' > '1' AND 'Donkey' != 'donkey'"));
    }

    #[test]
    fn test_and_short_circuits_on_false_left() {
        assert!(!eval("'a' == 'b' AND 'a' == 'a'"));
        // The right side would fail to resolve if it were evaluated.
        assert!(!eval("'a' == 'b' AND {{context.missing}} == 'a'"));
    }

    #[test]
    fn test_or_short_circuits_on_true_left() {
        assert!(eval("'a' == 'a' OR 'x' == 'y'"));
        assert!(eval(
            "'F' == 'F' OR {{context.executions.body_part_identifier.result.body_part}} == 'leg'"
        ));
    }

    #[test]
    fn test_left_associative_without_precedence() {
        // (T OR F) AND F, where standard precedence would give T OR (F AND F).
        assert!(!eval("'F' == 'F' OR 'F' == 'leg' AND 'F' == 'leg'"));
        // (F AND T) OR T
        assert!(eval("'F' == 'leg' AND 'F' == 'F' OR 'F' == 'F'"));

        let expression = Expression::parse("'a' == 'a' OR 'b' == 'b' AND 'c' == 'c'").unwrap();
        match expression {
            Expression::Group { left, keyword, .. } => {
                assert_eq!(keyword, Keyword::And);
                assert!(matches!(
                    *left,
                    Expression::Group {
                        keyword: Keyword::Or,
                        ..
                    }
                ));
            }
            _ => panic!("expected a group"),
        }
    }

    #[test]
    fn test_lowercase_keywords() {
        assert!(eval("'F' == 'F' or 'F' == 'leg'"));
        assert!(!eval("'F' == 'F' and 'F' == 'leg'"));
    }

    #[test]
    fn test_keyword_literals_are_not_keywords() {
        assert!(eval("'AND' == 'AND' OR 'F' == 'leg'"));
        let expression = Expression::parse("'OR' == 'F' OR 'F' == 'leg'").unwrap();
        assert_eq!(expression.comparisons().len(), 2);
    }

    #[test]
    fn test_ordinal_comparison() {
        assert!(eval("'5' > '1'"));
        assert!(!eval("'5' < '1'"));
        // Ordinal, not numeric.
        assert!(!eval("'10' > '9'"));
        assert!(eval("'10' > '09'"));
        assert!(eval("'b' >= 'a'"));
        assert!(eval("'a' <= 'a'"));
    }

    #[test]
    fn test_transposed_greater_or_equal_alias() {
        assert!(eval("'5' => '5' AND 'Donkey' != 'donkey'"));
        assert!(eval("'5' >= '5' AND 'Donkey' != 'donkey'"));
    }

    #[test]
    fn test_placeholder_substitution() {
        let mut context = HashMap::new();
        context.insert(
            "context.dicom.tags[('0010','0040')]".to_string(),
            "F".to_string(),
        );
        context.insert(
            "context.executions.body_part_identifier.result.body_part".to_string(),
            "leg".to_string(),
        );

        let expression = Expression::parse(
            "{{context.dicom.tags[('0010','0040')]}} == 'F' AND {{context.executions.body_part_identifier.result.body_part}} == 'leg'",
        )
        .unwrap();
        assert!(expression.evaluate(&context).unwrap());

        let comparisons = expression.comparisons();
        assert_eq!(
            comparisons[0].left,
            Operand::Placeholder("context.dicom.tags[('0010','0040')]".to_string())
        );
        assert_eq!(comparisons[0].right, Operand::Literal("F".to_string()));
        assert_eq!(comparisons[1].right, Operand::Literal("leg".to_string()));
    }

    #[test]
    fn test_placeholder_on_right_side() {
        let mut context = HashMap::new();
        context.insert("context.input.bucket".to_string(), "bucket1".to_string());
        assert!(Expression::parse("'bucket1' == {{ context.input.bucket }}")
            .unwrap()
            .evaluate(&context)
            .unwrap());
    }

    #[test]
    fn test_unresolved_reference() {
        let err = Expression::parse("{{context.executions.t1.status}} == 'Succeeded'")
            .unwrap()
            .evaluate(&empty())
            .unwrap_err();
        assert_eq!(
            err,
            ConditionError::UnresolvedReference("context.executions.t1.status".to_string())
        );
    }

    #[test]
    fn test_missing_left_hand_parameter() {
        for input in [
            "AND 'a' == 'b'",
            " AND {{context.dicom.tags[('0010','0040')]}} == 'F'",
            "OR 'a' == 'b'",
            " OR {{context.dicom.tags[('0010','0040')]}} == 'F'",
        ] {
            let err = Expression::parse(input).unwrap_err();
            assert_eq!(
                err,
                ConditionError::MalformedExpression {
                    index: 0,
                    message: "No left-hand parameter at index: 0".to_string(),
                },
                "input: {input}"
            );
        }
    }

    #[test]
    fn test_dangling_keyword() {
        let err = Expression::parse("'a' == 'a' AND").unwrap_err();
        assert_eq!(
            err,
            ConditionError::MalformedExpression {
                index: 14,
                message: "No left-hand parameter at index: 14".to_string(),
            }
        );
    }

    #[test]
    fn test_missing_operator_and_right_hand() {
        assert!(matches!(
            Expression::parse("'a' 'b'").unwrap_err(),
            ConditionError::MalformedExpression { index: 4, .. }
        ));
        assert!(matches!(
            Expression::parse("'a' ==").unwrap_err(),
            ConditionError::MalformedExpression { index: 6, .. }
        ));
        assert!(matches!(
            Expression::parse("'a' == 'b' 'c'").unwrap_err(),
            ConditionError::MalformedExpression { index: 11, .. }
        ));
    }

    #[test]
    fn test_unsupported_operator() {
        assert_eq!(
            Expression::parse("'a' = 'b'").unwrap_err(),
            ConditionError::UnsupportedOperator("=".to_string())
        );
        assert_eq!(
            Expression::parse("'a' eq 'b'").unwrap_err(),
            ConditionError::UnsupportedOperator("eq".to_string())
        );
    }

    #[test]
    fn test_empty_expression() {
        assert!(matches!(
            Expression::parse("   ").unwrap_err(),
            ConditionError::MalformedExpression { index: 0, .. }
        ));
    }

    #[test]
    fn test_display_round_trips_structure() {
        let expression = Expression::parse("{{ context.a }} == 'x' or 'y' != 'z'").unwrap();
        assert_eq!(expression.to_string(), "{{context.a}} == 'x' OR 'y' != 'z'");
    }
}
