use std::{fmt, path::PathBuf};

use mapping_template::{ParseError, RenderError, ResolverError};
use serde_json::Value;

/// One step of a response path.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

impl From<&str> for PathSegment {
    fn from(name: &str) -> Self {
        PathSegment::Field(name.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(name: String) -> Self {
        PathSegment::Field(name)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

/// Field error as it appears in the `errors` list of a GraphQL response.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphqlError {
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<PathSegment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_info: Option<Value>,
}

impl GraphqlError {
    pub fn new(message: impl Into<String>) -> Self {
        GraphqlError {
            message: message.into(),
            path: Vec::new(),
            error_type: None,
            data: None,
            error_info: None,
        }
    }

    /// Converts an error collected through `$util`.
    pub fn from_resolver_error(error: ResolverError, path: Vec<PathSegment>) -> Self {
        GraphqlError {
            message: error.message,
            path,
            error_type: error.error_type,
            data: Some(error.data).filter(|data| !data.is_null()),
            error_info: Some(error.error_info).filter(|info| !info.is_null()),
        }
    }

    #[must_use]
    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        self.path = path;
        self
    }
}

impl fmt::Display for GraphqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.message.fmt(f)
    }
}

impl std::error::Error for GraphqlError {}

/// Failure reported by a data source adapter. Never translated by the pipeline.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct DispatchError {
    pub message: String,
    /// Distinguishes failures callers may want to branch on, e.g. `ConditionalCheckFailedException`.
    pub code: Option<String>,
    pub data: Option<Value>,
}

impl DispatchError {
    pub fn new(message: impl Into<String>) -> Self {
        DispatchError {
            message: message.into(),
            code: None,
            data: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum BatchError {
    #[error("batched dispatch for {field_path} returned {actual} results for {expected} requests")]
    Shape {
        field_path: String,
        expected: usize,
        actual: usize,
    },
    #[error("batched dispatch for {0} did not return a list")]
    NotAList(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("batch for {0} was dropped before it completed")]
    Dropped(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateLoadError {
    #[error("could not read mapping template {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Parse(#[from] ParseError),
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The template failed without reporting anything through `$util`.
    #[error(transparent)]
    Render(#[from] RenderError),
    /// First error the templates reported. The whole list sits on the request context.
    #[error(transparent)]
    Field(GraphqlError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// The batch could not be answered. Failures of the data source itself surface as
    /// [`ResolveError::Dispatch`].
    #[error(transparent)]
    Batch(BatchError),
    #[error("{template} did not render valid JSON: {source}")]
    InvalidOutput {
        template: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Template(#[from] TemplateLoadError),
}

impl From<BatchError> for ResolveError {
    fn from(error: BatchError) -> Self {
        match error {
            BatchError::Dispatch(error) => ResolveError::Dispatch(error),
            other => ResolveError::Batch(other),
        }
    }
}

impl ResolveError {
    /// The error as the transport presents it, located at `path`.
    pub fn to_graphql_error(&self, path: &[PathSegment]) -> GraphqlError {
        match self {
            ResolveError::Field(error) => error.clone(),
            ResolveError::Dispatch(DispatchError { message, code, data }) => GraphqlError {
                message: message.clone(),
                path: path.to_vec(),
                error_type: code.clone(),
                data: data.clone(),
                error_info: None,
            },
            other => GraphqlError::new(other.to_string()).with_path(path.to_vec()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("mapping template for {coordinate} refers to an unknown data source `{data_source}`")]
    UnknownDataSource { coordinate: String, data_source: String },
    #[error("subscription field {0} is not bound to any mutation")]
    UnboundSubscription(String),
    #[error("no adapter is registered for {kind} data sources, used by `{data_source}`")]
    MissingAdapter {
        kind: emulator_config::DataSourceKind,
        data_source: String,
    },
    #[error(transparent)]
    Template(#[from] TemplateLoadError),
}

#[cfg(test)]
mod tests {
    use insta::assert_json_snapshot;
    use mapping_template::ErrorKind;
    use serde_json::json;

    use super::*;

    #[test]
    fn resolver_errors_become_field_errors() {
        let error = ResolverError::new(ErrorKind::Reported, "boom")
            .with_error_type(Some("PriceError".to_string()))
            .with_data(json!({ "id": 1 }));
        let error = GraphqlError::from_resolver_error(error, vec!["getPrice".into(), 0.into(), "id".into()]);

        assert_json_snapshot!(error, @r###"
        {
          "message": "boom",
          "path": [
            "getPrice",
            0,
            "id"
          ],
          "errorType": "PriceError",
          "data": {
            "id": 1
          }
        }
        "###);
    }

    #[test]
    fn dispatch_failures_keep_their_code() {
        let error = ResolveError::from(DispatchError::new("conditional check failed").with_code("ConditionalCheckFailed"));
        let error = error.to_graphql_error(&["addPrice".into()]);

        assert_eq!(error.error_type.as_deref(), Some("ConditionalCheckFailed"));
        assert_eq!(error.path, vec![PathSegment::from("addPrice")]);
    }

    #[test]
    fn batched_dispatch_failures_keep_their_code() {
        let error = ResolveError::from(BatchError::Dispatch(DispatchError::new("lambda failed").with_code("Unhandled")));
        let error = error.to_graphql_error(&["owner".into()]);

        assert_eq!(error.message, "lambda failed");
        assert_eq!(error.error_type.as_deref(), Some("Unhandled"));

        let shape = BatchError::Shape {
            field_path: "Price.owner".to_string(),
            expected: 2,
            actual: 1,
        };
        assert!(matches!(ResolveError::from(shape), ResolveError::Batch(BatchError::Shape { .. })));
    }
}
