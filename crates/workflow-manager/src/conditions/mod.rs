//! Conditional expression engine for destination routing.
//!
//! Conditions are chains of comparisons joined by `AND` / `OR`:
//!
//! ```text
//! {{context.executions.body_part.result.part}} == 'leg' AND '5' > '1'
//! ```
//!
//! Operands are single-quoted literals or `{{...}}` placeholders that are
//! substituted through a [`ParameterResolver`] at evaluation time. Chains
//! fold strictly left to right; `AND` and `OR` share one precedence level.

use std::collections::HashMap;

use thiserror::Error;

pub mod expression;
mod lexer;

pub use expression::{Comparison, Expression, Keyword, Operand, Operator};

/// Errors raised while parsing or evaluating a condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    /// The expression does not follow the `left OP right (AND|OR ...)*` shape.
    #[error("{message}")]
    MalformedExpression { index: usize, message: String },

    /// A token in operator position is not a recognized comparison.
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),

    /// A placeholder had no value in the evaluation context.
    #[error("Unresolved reference: {0}")]
    UnresolvedReference(String),
}

impl ConditionError {
    pub(crate) fn malformed(index: usize, message: impl Into<String>) -> Self {
        ConditionError::MalformedExpression {
            index,
            message: message.into(),
        }
    }
}

/// Supplies values for `{{...}}` placeholders.
///
/// The reference passed in is the placeholder body with surrounding
/// whitespace removed, e.g. `context.executions.task1.status`.
pub trait ParameterResolver {
    fn resolve(&self, reference: &str) -> Option<String>;
}

impl ParameterResolver for HashMap<String, String> {
    fn resolve(&self, reference: &str) -> Option<String> {
        self.get(reference).cloned()
    }
}

/// Parse and evaluate a condition in one step.
pub fn evaluate<R>(condition: &str, resolver: &R) -> Result<bool, ConditionError>
where
    R: ParameterResolver + ?Sized,
{
    Expression::parse(condition)?.evaluate(resolver)
}
