//! Error types for the engine and the expression evaluator.

use crate::Key;

/// Failure while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("syntax error in expression '{expression}': {reason}")]
    Syntax { expression: String, reason: String },

    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("division by zero")]
    DivisionByZero,
}

/// All failure modes surfaced by the engine's public operations.
#[derive(Debug, thiserror::Error)]
pub enum BpmnError {
    /// The BPMN source could not be turned into a process model.
    #[error("failed to parse BPMN definition: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no process definition with key={0}")]
    ProcessNotFound(Key),

    #[error("no process definition with id='{0}'")]
    ProcessIdNotFound(String),

    #[error("no process instance with key={0}")]
    InstanceNotFound(Key),

    #[error("element '{0}' not found in process definition")]
    ElementNotFound(String),

    #[error("invalid timer duration '{duration}' on element id='{element_id}': {reason}")]
    InvalidTimer {
        element_id: String,
        duration: String,
        reason: String,
    },

    #[error("link throw event id='{element_id}' has no matching catch event for link '{link}'")]
    MissingLink { element_id: String, link: String },

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Expression evaluation failed; fatal to the owning instance.
    #[error("cannot evaluate expression in element id='{element_id}' name='{element_name}'")]
    Expression {
        element_id: String,
        element_name: String,
        #[source]
        source: ExpressionError,
    },

    #[error("restore failed: {0}")]
    Restore(String),

    #[error("snapshot failed: {0}")]
    Snapshot(String),
}

impl BpmnError {
    /// Convenience constructor tagging an expression error with its element.
    pub fn expression(element_id: &str, element_name: &str, source: ExpressionError) -> Self {
        Self::Expression {
            element_id: element_id.to_string(),
            element_name: element_name.to_string(),
            source,
        }
    }

    /// Whether this error came from expression evaluation.
    pub fn is_expression(&self) -> bool {
        matches!(self, Self::Expression { .. })
    }
}
