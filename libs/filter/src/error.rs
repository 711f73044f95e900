//! Error types for filter parsing.

use thiserror::Error;

/// Errors that can occur when parsing a filter expression.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// The filter string contains no tokens.
    #[error("filter cannot be empty")]
    Empty,

    /// A condition is missing its operator or value.
    #[error("incomplete condition starting at token {position}: expected '<field> <operator> <value>'")]
    Incomplete { position: usize },

    /// The operator is not one of the supported operators.
    #[error("unknown operator '{0}': expected 'eq' or 'neq'")]
    UnknownOperator(String),

    /// The token between two conditions is not a logical connective.
    #[error("unknown logical connective '{0}': expected 'and' or 'or'")]
    UnknownConnective(String),
}

impl FilterError {
    /// Returns true if this error was caused by a truncated condition.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, FilterError::Incomplete { .. })
    }
}
