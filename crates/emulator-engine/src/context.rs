use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use serde_json::{json, Map, Value};

use crate::{GraphqlError, PathSegment};

/// Per-request state shared by every field resolution of one GraphQL operation.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    claims: Map<String, Value>,
    headers: BTreeMap<String, String>,
    errors: Arc<Mutex<Vec<GraphqlError>>>,
}

impl RequestContext {
    /// Builds a context from the (already decoded) JWT claims of the caller.
    pub fn new(claims: Map<String, Value>) -> Self {
        RequestContext {
            claims,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    /// The `sub` claim, which also identifies the subscription client.
    pub fn subject(&self) -> Option<&str> {
        self.claims.get("sub").and_then(Value::as_str)
    }

    /// `$ctx.identity`
    pub fn identity(&self) -> Value {
        json!({
            "sub": self.claims.get("sub"),
            "issuer": self.claims.get("iss"),
            "username": self.claims.get("cognito:username"),
            "sourceIp": ["0.0.0.0"],
            "defaultAuthStrategy": "ALLOW",
            "claims": self.claims,
        })
    }

    /// `$ctx.request`
    pub fn request(&self) -> Value {
        json!({ "headers": self.headers })
    }

    /// Field errors are only ever appended, so one failing field never hides a sibling's.
    pub fn push_errors(&self, errors: impl IntoIterator<Item = GraphqlError>) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(errors);
    }

    pub fn errors(&self) -> Vec<GraphqlError> {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn take_errors(&self) -> Vec<GraphqlError> {
        std::mem::take(&mut *self.errors.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// What the executor knows about the field being resolved.
#[derive(Clone, Debug, Default)]
pub struct FieldInfo {
    pub parent_type: String,
    pub field_name: String,
    pub path: Vec<PathSegment>,
    pub variables: Map<String, Value>,
}

impl FieldInfo {
    pub fn new(parent_type: impl Into<String>, field_name: impl Into<String>) -> Self {
        let field_name = field_name.into();

        FieldInfo {
            parent_type: parent_type.into(),
            path: vec![PathSegment::Field(field_name.clone())],
            field_name,
            variables: Map::new(),
        }
    }

    #[must_use]
    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        self.path = path;
        self
    }

    #[must_use]
    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    /// `$ctx.info`
    pub fn to_json(&self) -> Value {
        json!({
            "fieldName": self.field_name,
            "parentTypeName": self.parent_type,
            "variables": self.variables,
        })
    }
}
