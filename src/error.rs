//! Error types for moldear
//!
//! This module defines all error types used throughout the library.
//! Errors surface at the compile boundary: once a grammar is compiled,
//! mask lookup and parsing never fail.

use thiserror::Error;

/// Result type alias for moldear operations
pub type Result<T> = std::result::Result<T, MoldearError>;

/// Error type for all moldear operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MoldearError {
    /// Input is not parseable as JSON
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    /// JSON is well-formed but violates the structural-tag DSL's shape
    /// or one of the analyzer rules
    #[error("Invalid structural tag: {0}")]
    InvalidStructuralTag(String),

    /// JSON-schema shape violation
    #[error("Invalid JSON schema: {0}")]
    InvalidSchema(String),

    /// Schema is well-formed but its language is empty
    /// (`false` schema, empty enum, minimum > maximum, ...)
    #[error("Unsatisfiable JSON schema: {0}")]
    UnsatisfiableSchema(String),

    /// FSM construction or intersection overflowed its size bound
    #[error("Grammar build failure: {0}")]
    GrammarBuildFailure(String),

    /// EBNF or regex text could not be parsed
    #[error("Invalid grammar: {0}")]
    InvalidGrammar(String),

    /// Builder misuse or invalid compiler options
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MoldearError::UnsatisfiableSchema("minimum 5 > maximum 3".to_string());
        assert!(err.to_string().contains("Unsatisfiable"));
        assert!(err.to_string().contains("minimum 5 > maximum 3"));
    }

    #[test]
    fn test_error_equality() {
        let err1 = MoldearError::InvalidGrammar("unexpected token".to_string());
        let err2 = MoldearError::InvalidGrammar("unexpected token".to_string());
        assert_eq!(err1, err2);
    }
}
