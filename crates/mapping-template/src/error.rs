use std::fmt;

use serde_json::Value;

/// Error raised while turning template text into a [`crate::Template`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}:{line}:{column}: {message}")]
pub struct ParseError {
    pub name: String,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RenderError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("{0}")]
    Evaluation(String),
    #[error("no method `{method}` on {type_name}")]
    UnsupportedMethod { type_name: &'static str, method: String },
    /// Thrown by `$util.error`, `$util.unauthorized` and `$util.validate`. The same error
    /// has already been appended to the error list of the utilities namespace.
    #[error("{0}")]
    Raised(ResolverError),
}

impl RenderError {
    pub(crate) fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation(message.into())
    }

    pub(crate) fn unsupported(type_name: &'static str, method: &str) -> Self {
        Self::UnsupportedMethod {
            type_name,
            method: method.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Reported,
    Validation,
    Unauthorized,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Reported => "Reported",
            ErrorKind::Validation => "Validation",
            ErrorKind::Unauthorized => "Unauthorized",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error explicitly reported by a template through `$util`.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolverError {
    pub message: String,
    pub kind: ErrorKind,
    /// The free-form `errorType` argument given by the template author.
    pub error_type: Option<String>,
    pub data: Value,
    pub error_info: Value,
}

impl ResolverError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ResolverError {
            message: message.into(),
            kind,
            error_type: None,
            data: Value::Null,
            error_info: Value::Null,
        }
    }

    pub fn unauthorized() -> Self {
        ResolverError {
            error_type: Some("Unauthorized".to_string()),
            ..Self::new(ErrorKind::Unauthorized, "Unauthorized")
        }
    }

    #[must_use]
    pub fn with_error_type(mut self, error_type: Option<String>) -> Self {
        self.error_type = error_type;
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    #[must_use]
    pub fn with_error_info(mut self, error_info: Value) -> Self {
        self.error_info = error_info;
        self
    }

    /// The shape returned to templates by `$util.getErrors()`.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "message": self.message,
            "type": self.kind.as_str(),
            "errorType": self.error_type,
            "data": self.data,
            "errorInfo": self.error_info,
        })
    }
}

impl fmt::Display for ResolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.message.fmt(f)
    }
}

impl std::error::Error for ResolverError {}
