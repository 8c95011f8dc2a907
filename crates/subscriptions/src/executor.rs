use async_trait::async_trait;
use emulator_engine::{FieldInfo, GraphqlError, PathSegment, ResolverMap};
use futures_util::{stream::BoxStream, StreamExt};
use serde_json::{json, Value};

use crate::SubscriptionRequest;

/// Starts the event stream of a subscription operation.
///
/// Every item is a complete GraphQL response (`{"data": ..., "errors": [...]}`) for one published
/// event. An `Err` means the subscription could not start at all.
#[async_trait]
pub trait SubscriptionExecutor: Send + Sync {
    async fn execute(&self, request: &SubscriptionRequest) -> Result<BoxStream<'static, Value>, Vec<GraphqlError>>;
}

/// Where subscription payloads go once they passed the variable filter.
pub trait Transport: Send + Sync {
    fn publish(&self, topic: &str, payload: String);
}

/// Runs subscriptions against the resolvers built from the configuration.
#[derive(Clone, Debug)]
pub struct ResolverExecutor {
    resolvers: ResolverMap,
    subscription_type: String,
}

impl ResolverExecutor {
    pub fn new(resolvers: ResolverMap, subscription_type: impl Into<String>) -> Self {
        ResolverExecutor {
            resolvers,
            subscription_type: subscription_type.into(),
        }
    }
}

#[async_trait]
impl SubscriptionExecutor for ResolverExecutor {
    async fn execute(&self, request: &SubscriptionRequest) -> Result<BoxStream<'static, Value>, Vec<GraphqlError>> {
        let field = request
            .root_field()
            .map_err(|error| vec![GraphqlError::new(error.to_string())])?;

        let Some(resolver) = self.resolvers.subscription(&self.subscription_type, &field.name) else {
            let message = format!(
                "Cannot query field \"{}\" on type \"{}\".",
                field.name, self.subscription_type
            );
            return Err(vec![GraphqlError::new(message)]);
        };

        let path = vec![PathSegment::Field(field.response_key.clone())];
        let info = FieldInfo::new(self.subscription_type.clone(), field.name.clone())
            .with_path(path.clone())
            .with_variables(request.variables.clone());

        tracing::debug!(field = %field.name, mutations = ?resolver.mutations(), "subscription started");

        let resolver = resolver.clone();
        let context = request.context.clone();
        let key = field.response_key;

        let stream = resolver.subscribe().then(move |event| {
            let resolver = resolver.clone();
            let context = context.clone();
            let info = info.clone();
            let path = path.clone();
            let key = key.clone();

            async move {
                let result = resolver.resolve(event, &context, &info).await;
                let mut errors = context.take_errors();

                match result {
                    Ok(value) if errors.is_empty() => json!({ "data": { key: value } }),
                    Ok(value) => json!({ "data": { key: value }, "errors": errors }),
                    Err(error) => {
                        if errors.is_empty() {
                            errors.push(error.to_graphql_error(&path));
                        }

                        json!({ "data": { key: Value::Null }, "errors": errors })
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}
