// This module defines the error types for the flapc backend using the thiserror crate.
// CompileError is the single error enum that every phase propagates: source-level errors
// (undefined variables, updates of immutable bindings, operator/type mismatches and
// operations a target cannot encode) carry a SourceLocation, internal consistency errors
// (unbound labels, relocations outside the text buffer, header size mismatches, stack
// misalignment) indicate a compiler bug, and resource exhaustion covers the case where
// neither registers nor frame space remain. CompileResult<T> is the convenience alias.

//! Error types for the flapc compiler.

use std::fmt;
use thiserror::Error;

/// Position in the source program an error refers to.
///
/// The front end is external, so locations are whatever it attached to the
/// AST node; `SourceLocation::UNKNOWN` is used for synthesized nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub const UNKNOWN: SourceLocation = SourceLocation { line: 0, column: 0 };

    pub const fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line == 0 {
            write!(f, "<unknown>")
        } else {
            write!(f, "{}:{}", self.line, self.column)
        }
    }
}

/// Broad classification used by the driver to pick diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Source,
    Internal,
    Resource,
}

/// Main error type for compilation.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("{location}: undefined variable '{name}'")]
    UndefinedVariable {
        name: String,
        location: SourceLocation,
    },

    #[error("{location}: cannot update immutable variable '{name}'")]
    ImmutableUpdate {
        name: String,
        location: SourceLocation,
    },

    #[error("{location}: variable '{name}' is already defined in this scope")]
    Redefinition {
        name: String,
        location: SourceLocation,
    },

    #[error("{location}: type mismatch: {reason}")]
    TypeMismatch {
        reason: String,
        location: SourceLocation,
    },

    #[error("{location}: unsupported operation on {arch}: {operation}")]
    UnsupportedOperation {
        operation: String,
        arch: &'static str,
        location: SourceLocation,
    },

    #[error("{location}: invalid jump: {reason}")]
    InvalidJump {
        reason: String,
        location: SourceLocation,
    },

    #[error("internal compiler error: {reason}")]
    Internal { reason: String },

    #[error("resource exhausted: {reason}")]
    ResourceExhausted { reason: String },

    #[error("failed to write executable: {0}")]
    Io(#[from] std::io::Error),
}

impl CompileError {
    pub fn internal(reason: impl Into<String>) -> Self {
        CompileError::Internal {
            reason: reason.into(),
        }
    }

    pub fn unsupported(operation: impl Into<String>, arch: &'static str) -> Self {
        CompileError::UnsupportedOperation {
            operation: operation.into(),
            arch,
            location: SourceLocation::UNKNOWN,
        }
    }

    /// Attach a source location to a source-level error that was raised
    /// below the AST walk (e.g. by an encoder) without one.
    pub fn at(mut self, loc: SourceLocation) -> Self {
        match &mut self {
            CompileError::UndefinedVariable { location, .. }
            | CompileError::ImmutableUpdate { location, .. }
            | CompileError::Redefinition { location, .. }
            | CompileError::TypeMismatch { location, .. }
            | CompileError::UnsupportedOperation { location, .. }
            | CompileError::InvalidJump { location, .. } => {
                if *location == SourceLocation::UNKNOWN {
                    *location = loc;
                }
            }
            _ => {}
        }
        self
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            CompileError::Internal { .. } => ErrorCategory::Internal,
            CompileError::ResourceExhausted { .. } | CompileError::Io(_) => {
                ErrorCategory::Resource
            }
            _ => ErrorCategory::Source,
        }
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_is_attached_once() {
        let err = CompileError::unsupported("rotate", "riscv64").at(SourceLocation::new(3, 7));
        assert_eq!(
            err.to_string(),
            "3:7: unsupported operation on riscv64: rotate"
        );

        let err = err.at(SourceLocation::new(9, 9));
        assert!(err.to_string().starts_with("3:7:"));
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            CompileError::internal("x").category(),
            ErrorCategory::Internal
        );
        assert_eq!(
            CompileError::ResourceExhausted { reason: "x".into() }.category(),
            ErrorCategory::Resource
        );
        let undefined = CompileError::UndefinedVariable {
            name: "y".into(),
            location: SourceLocation::UNKNOWN,
        };
        assert_eq!(undefined.category(), ErrorCategory::Source);
        assert_eq!(undefined.to_string(), "<unknown>: undefined variable 'y'");
    }
}
