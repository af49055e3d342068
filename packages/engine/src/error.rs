//! Error types for the engine.

use thiserror::Error;

/// Errors raised by the engine.
///
/// Variable-level failures (`Path`, `NotWriteable`, `NotReadable`, `Refresh`,
/// `Program`) are captured per-variable during a refresh pass and do not
/// abort the pass. `Protocol` failures cause the offending block to be
/// skipped with a warning. `Closed` is returned for any submission to a
/// connection that has been shut down.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A path walk or traversal step failed.
    #[error("path error on '{var}': {message}")]
    Path { var: String, message: String },

    /// Attempt to set a non-writeable variable.
    #[error("variable '{name}' is not writeable")]
    NotWriteable { name: String },

    /// Attempt to read a non-readable variable.
    #[error("variable '{name}' is not readable")]
    NotReadable { name: String },

    /// A variable failed to refresh.
    #[error("refresh of '{var}' failed: {message}")]
    Refresh { var: String, message: String },

    /// A callable path element raised.
    #[error("callable '{name}' failed: {message}")]
    Program { name: String, message: String },

    /// Malformed block or illegal grammar.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The transport reported a failure.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Submission to a connection whose command queues are closed.
    #[error("connection '{name}' is shut down")]
    Closed { name: String },
}

impl EngineError {
    /// Build a `Path` error with human context.
    pub fn path(var: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Path {
            var: var.into(),
            message: message.into(),
        }
    }

    /// Build a `Protocol` error.
    pub fn protocol(message: impl Into<String>) -> Self {
        EngineError::Protocol {
            message: message.into(),
        }
    }

    /// Build a `Program` error for a failed callable.
    pub fn program(name: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Program {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Build a `Transport` error.
    pub fn transport(message: impl Into<String>) -> Self {
        EngineError::Transport {
            message: message.into(),
        }
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let e = EngineError::path("person.name", "no such field");
        assert!(format!("{}", e).contains("person.name"));
        assert!(format!("{}", e).contains("no such field"));

        let e = EngineError::NotWriteable {
            name: "counter".to_string(),
        };
        assert!(format!("{}", e).contains("not writeable"));
    }
}
