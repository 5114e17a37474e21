//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The requested tool is not part of the supported set
    #[error("Unknown tool: {name} (expected one of: {expected})")]
    UnknownTool { name: String, expected: String },

    /// Invalid field value
    #[error("Invalid {field}: {value} (expected {expected})")]
    InvalidFieldValue {
        field: String,
        value: String,
        expected: String,
    },

    /// Parse error for incoming data
    #[error("Failed to parse {field}: {reason}")]
    ParseError { field: String, reason: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_tool_display() {
        let err = DomainError::UnknownTool {
            name: "vim".to_string(),
            expected: "claude, codex".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Unknown tool: vim (expected one of: claude, codex)"
        );
    }

    #[test]
    fn test_invalid_field_display() {
        let err = DomainError::InvalidFieldValue {
            field: "principal".to_string(),
            value: "a b".to_string(),
            expected: "[A-Za-z0-9._-]".to_string(),
        };
        assert!(err.to_string().contains("principal"));
        assert!(err.to_string().contains("a b"));
    }
}
