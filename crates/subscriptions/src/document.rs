use std::{collections::HashSet, sync::Arc};

use async_graphql_parser::types::{DocumentOperations, ExecutableDocument, OperationType, SelectionSet};
use emulator_engine::RequestContext;
use serde_json::{Map, Value};

use crate::RegisterError;

/// A subscription operation as received from the transport layer.
#[derive(Clone, Debug)]
pub struct SubscriptionRequest {
    pub document: Arc<ExecutableDocument>,
    pub variables: Map<String, Value>,
    pub context: RequestContext,
}

impl SubscriptionRequest {
    pub fn new(document: ExecutableDocument, variables: Map<String, Value>, context: RequestContext) -> Self {
        SubscriptionRequest {
            document: Arc::new(document),
            variables,
            context,
        }
    }

    pub fn parse(query: &str, variables: Map<String, Value>, context: RequestContext) -> Result<Self, RegisterError> {
        let document = async_graphql_parser::parse_query(query)?;
        Ok(Self::new(document, variables, context))
    }

    /// The one root field the operation selects.
    pub fn root_field(&self) -> Result<RootField, RegisterError> {
        root_field(&self.document)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootField {
    pub name: String,
    /// Alias if there is one, otherwise the name.
    pub response_key: String,
}

fn root_field(document: &ExecutableDocument) -> Result<RootField, RegisterError> {
    let operation = match &document.operations {
        DocumentOperations::Single(operation) => &operation.node,
        DocumentOperations::Multiple(operations) => {
            let mut subscriptions = operations
                .values()
                .filter(|operation| operation.node.ty == OperationType::Subscription);

            match (subscriptions.next(), subscriptions.next()) {
                (Some(operation), None) => &operation.node,
                (None, _) => return Err(RegisterError::NotASubscription),
                (Some(_), Some(_)) => return Err(RegisterError::AmbiguousOperation),
            }
        }
    };

    if operation.ty != OperationType::Subscription {
        return Err(RegisterError::NotASubscription);
    }

    let mut fields = Vec::new();
    collect_fields(document, &operation.selection_set.node, &mut HashSet::new(), &mut fields);

    match <[RootField; 1]>::try_from(fields) {
        Ok([field]) => Ok(field),
        Err(fields) => Err(RegisterError::MultipleRootFields(
            fields.into_iter().map(|field| field.response_key).collect(),
        )),
    }
}

fn collect_fields<'a>(
    document: &'a ExecutableDocument,
    selection_set: &'a SelectionSet,
    visited: &mut HashSet<&'a str>,
    fields: &mut Vec<RootField>,
) {
    use async_graphql_parser::types::Selection;

    for selection in &selection_set.items {
        match &selection.node {
            Selection::Field(field) => {
                let field = &field.node;
                let name = field.name.node.to_string();
                let response_key = field
                    .alias
                    .as_ref()
                    .map(|alias| alias.node.to_string())
                    .unwrap_or_else(|| name.clone());

                fields.push(RootField { name, response_key });
            }
            Selection::InlineFragment(fragment) => {
                collect_fields(document, &fragment.node.selection_set.node, visited, fields);
            }
            Selection::FragmentSpread(spread) => {
                let name = &spread.node.fragment_name.node;
                if !visited.insert(name.as_str()) {
                    continue;
                }

                if let Some(fragment) = document.fragments.get(name) {
                    collect_fields(document, &fragment.node.selection_set.node, visited, fields);
                }
            }
        }
    }
}
