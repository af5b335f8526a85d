//! Error taxonomy for the engine.
//!
//! Every failure that crosses a component boundary is converted into one of
//! six tagged kinds, each carrying a message, the component that produced it,
//! and a flat string-map context. Transport to the outside (CLI/RPC) is the
//! caller's concern.

use std::collections::BTreeMap;
use thiserror::Error;

/// Flat key/value context attached to an error at the point of failure.
pub type ErrorContext = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("[{component}] storage: {message}")]
    Storage { message: String, component: String, context: ErrorContext },

    #[error("[{component}] search: {message}")]
    Search { message: String, component: String, context: ErrorContext },

    #[error("[{component}] validation: {message}")]
    Validation { message: String, component: String, context: ErrorContext },

    #[error("[{component}] configuration: {message}")]
    Configuration { message: String, component: String, context: ErrorContext },

    #[error("[{component}] indexing: {message}")]
    Indexing { message: String, component: String, context: ErrorContext },

    #[error("[{component}] queue: {message}")]
    Queue { message: String, component: String, context: ErrorContext },
}

pub type EngineResult<T> = Result<T, EngineError>;

macro_rules! ctor {
    ($name:ident, $variant:ident) => {
        pub fn $name(component: impl Into<String>, message: impl Into<String>) -> Self {
            EngineError::$variant {
                message: message.into(),
                component: component.into(),
                context: ErrorContext::new(),
            }
        }
    };
}

impl EngineError {
    ctor!(storage, Storage);
    ctor!(search, Search);
    ctor!(validation, Validation);
    ctor!(configuration, Configuration);
    ctor!(indexing, Indexing);
    ctor!(queue, Queue);

    /// Attach a context entry, consuming and returning the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context_mut().insert(key.into(), value.into());
        self
    }

    pub fn message(&self) -> &str {
        match self {
            EngineError::Storage { message, .. }
            | EngineError::Search { message, .. }
            | EngineError::Validation { message, .. }
            | EngineError::Configuration { message, .. }
            | EngineError::Indexing { message, .. }
            | EngineError::Queue { message, .. } => message,
        }
    }

    pub fn component(&self) -> &str {
        match self {
            EngineError::Storage { component, .. }
            | EngineError::Search { component, .. }
            | EngineError::Validation { component, .. }
            | EngineError::Configuration { component, .. }
            | EngineError::Indexing { component, .. }
            | EngineError::Queue { component, .. } => component,
        }
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            EngineError::Storage { context, .. }
            | EngineError::Search { context, .. }
            | EngineError::Validation { context, .. }
            | EngineError::Configuration { context, .. }
            | EngineError::Indexing { context, .. }
            | EngineError::Queue { context, .. } => context,
        }
    }

    fn context_mut(&mut self) -> &mut ErrorContext {
        match self {
            EngineError::Storage { context, .. }
            | EngineError::Search { context, .. }
            | EngineError::Validation { context, .. }
            | EngineError::Configuration { context, .. }
            | EngineError::Indexing { context, .. }
            | EngineError::Queue { context, .. } => context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_round_trips() {
        let err = EngineError::storage("meta", "disk full").with_context("path", "/tmp/x");
        assert_eq!(err.component(), "meta");
        assert_eq!(err.message(), "disk full");
        assert_eq!(err.context().get("path").map(String::as_str), Some("/tmp/x"));
    }

    #[test]
    fn display_includes_component_and_kind() {
        let err = EngineError::validation("queue", "bad path");
        let s = err.to_string();
        assert!(s.contains("queue"), "missing component: {s}");
        assert!(s.contains("validation"), "missing kind: {s}");
    }
}
