use std::{collections::HashMap, sync::Arc};

use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::{BuildError, FieldBinding, FieldInfo, RequestContext, ResolveError, ResolverPipeline};

/// Resolver of a query or mutation field.
#[derive(Clone)]
pub struct FieldResolver {
    pipeline: Arc<ResolverPipeline>,
    binding: Arc<FieldBinding>,
}

impl FieldResolver {
    pub fn binding(&self) -> &FieldBinding {
        &self.binding
    }

    pub async fn resolve(
        &self,
        root: Value,
        arguments: Value,
        context: &RequestContext,
        info: &FieldInfo,
    ) -> Result<Value, ResolveError> {
        self.pipeline.resolve(&self.binding, root, arguments, context, info).await
    }
}

/// Resolver of a subscription field: `subscribe` yields the published results of the bound
/// mutations, `resolve` turns each of them into the field value.
#[derive(Clone)]
pub struct SubscriptionResolver {
    pipeline: Arc<ResolverPipeline>,
    binding: Arc<FieldBinding>,
    mutations: Arc<[String]>,
}

impl SubscriptionResolver {
    pub fn binding(&self) -> &FieldBinding {
        &self.binding
    }

    pub fn mutations(&self) -> &[String] {
        &self.mutations
    }

    pub fn subscribe(&self) -> BoxStream<'static, Value> {
        self.pipeline.pubsub().subscribe(&self.mutations)
    }

    pub async fn resolve(&self, event: Value, context: &RequestContext, info: &FieldInfo) -> Result<Value, ResolveError> {
        self.pipeline.resolve_event(&self.binding, event, context, info).await
    }
}

#[derive(Clone)]
pub enum Resolver {
    Field(FieldResolver),
    Subscription(SubscriptionResolver),
}

/// Resolvers by parent type and field name.
#[derive(Clone, Default)]
pub struct ResolverMap {
    types: HashMap<String, HashMap<String, Resolver>>,
}

impl ResolverMap {
    pub fn get(&self, type_name: &str, field: &str) -> Option<&Resolver> {
        self.types.get(type_name)?.get(field)
    }

    pub fn field(&self, type_name: &str, field: &str) -> Option<&FieldResolver> {
        match self.get(type_name, field)? {
            Resolver::Field(resolver) => Some(resolver),
            Resolver::Subscription(_) => None,
        }
    }

    pub fn subscription(&self, type_name: &str, field: &str) -> Option<&SubscriptionResolver> {
        match self.get(type_name, field)? {
            Resolver::Subscription(resolver) => Some(resolver),
            Resolver::Field(_) => None,
        }
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.types.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ResolverMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut coordinates: Vec<_> = self
            .types
            .iter()
            .flat_map(|(type_name, fields)| fields.keys().map(move |field| format!("{type_name}.{field}")))
            .collect();
        coordinates.sort();

        f.debug_struct("ResolverMap").field("fields", &coordinates).finish()
    }
}

/// Builds a resolver for every mapping template of the pipeline configuration.
///
/// Templates are loaded up front, so a missing or broken file fails here instead of on the
/// first request.
pub async fn build_resolvers(pipeline: Arc<ResolverPipeline>) -> Result<ResolverMap, BuildError> {
    let config = pipeline.config();
    let mut resolvers = ResolverMap::default();

    for mapping in &config.mapping_templates {
        let coordinate = mapping.coordinate();

        let Some(data_source) = config.data_source(&mapping.data_source) else {
            return Err(BuildError::UnknownDataSource {
                coordinate,
                data_source: mapping.data_source.clone(),
            });
        };

        if !pipeline.dispatchers().supports(data_source.kind) {
            return Err(BuildError::MissingAdapter {
                kind: data_source.kind,
                data_source: data_source.name.clone(),
            });
        }

        let binding = Arc::new(FieldBinding {
            mapping: mapping.clone(),
            data_source: data_source.clone(),
        });

        pipeline.preload(&binding).await?;

        let resolver = if mapping.type_name == config.subscription_type {
            let mutations = config.subscriptions.mutations_for(&mapping.field);
            if mutations.is_empty() {
                return Err(BuildError::UnboundSubscription(coordinate));
            }

            Resolver::Subscription(SubscriptionResolver {
                pipeline: pipeline.clone(),
                binding,
                mutations: mutations.into(),
            })
        } else {
            Resolver::Field(FieldResolver {
                pipeline: pipeline.clone(),
                binding,
            })
        };

        tracing::debug!(%coordinate, data_source = %data_source.name, "built resolver");

        resolvers
            .types
            .entry(mapping.type_name.clone())
            .or_default()
            .insert(mapping.field.clone(), resolver);
    }

    Ok(resolvers)
}

#[cfg(test)]
mod tests {
    use emulator_config::Config;
    use futures_util::StreamExt;
    use indoc::indoc;
    use serde_json::json;

    use super::*;
    use crate::{Dispatchers, InMemoryPubSub};

    const CONFIG: &str = indoc! {r#"
        [[data_sources]]
        name = "Passthrough"
        type = "NONE"

        [[mapping_templates]]
        data_source = "Passthrough"
        type = "Mutation"
        field = "addPrice"
        request = "passthrough.request.vtl"
        response = "passthrough.response.vtl"

        [[mapping_templates]]
        data_source = "Passthrough"
        type = "Subscription"
        field = "onPrice"
        request = "passthrough.request.vtl"
        response = "passthrough.response.vtl"

        [subscriptions.fields]
        onPrice = ["addPrice"]
    "#};

    const REQUEST: &str = r#"{ "version": "2017-02-28", "payload": $util.toJson($ctx.args) }"#;
    const RESPONSE: &str = "$util.toJson($ctx.result)";

    fn setup(config: &str) -> (tempfile::TempDir, Arc<ResolverPipeline>) {
        let dir = tempfile::tempdir().unwrap();
        let templates = dir.path().join("mapping-templates");
        std::fs::create_dir_all(&templates).unwrap();
        std::fs::write(templates.join("passthrough.request.vtl"), REQUEST).unwrap();
        std::fs::write(templates.join("passthrough.response.vtl"), RESPONSE).unwrap();

        let config = Config::from_toml(config).unwrap().with_base_dir(dir.path());
        let pipeline = ResolverPipeline::new(Arc::new(config), Dispatchers::new(), Arc::new(InMemoryPubSub::new()));

        (dir, Arc::new(pipeline))
    }

    #[tokio::test]
    async fn mutation_results_reach_subscriptions() {
        let (_dir, pipeline) = setup(CONFIG);
        let resolvers = build_resolvers(pipeline).await.unwrap();
        assert_eq!(resolvers.len(), 2);

        let subscription = resolvers.subscription("Subscription", "onPrice").unwrap();
        assert_eq!(subscription.mutations(), ["addPrice"]);
        let mut events = subscription.subscribe();

        let mutation = resolvers.field("Mutation", "addPrice").unwrap();
        let context = RequestContext::default();
        let added = mutation
            .resolve(
                Value::Null,
                json!({ "commodity": "foo", "amount": 1 }),
                &context,
                &FieldInfo::new("Mutation", "addPrice"),
            )
            .await
            .unwrap();
        assert_eq!(added, json!({ "commodity": "foo", "amount": 1 }));

        let event = events.next().await.unwrap();
        let delivered = subscription
            .resolve(event, &context, &FieldInfo::new("Subscription", "onPrice"))
            .await
            .unwrap();
        assert_eq!(delivered, added);
    }

    #[tokio::test]
    async fn unbound_subscription() {
        let config = CONFIG.replace(r#"onPrice = ["addPrice"]"#, "");
        let (_dir, pipeline) = setup(&config);

        let error = build_resolvers(pipeline).await.unwrap_err();
        assert_eq!(error.to_string(), "subscription field Subscription.onPrice is not bound to any mutation");
    }

    #[tokio::test]
    async fn missing_adapter() {
        let config = CONFIG.replace(r#"type = "NONE""#, r#"type = "HTTP""#);
        let (_dir, pipeline) = setup(&config);

        let error = build_resolvers(pipeline).await.unwrap_err();
        assert!(matches!(error, BuildError::MissingAdapter { .. }), "{error}");
    }

    #[tokio::test]
    async fn missing_template_fails_the_build() {
        let (dir, pipeline) = setup(CONFIG);
        std::fs::remove_file(dir.path().join("mapping-templates").join("passthrough.response.vtl")).unwrap();

        let error = build_resolvers(pipeline).await.unwrap_err();
        assert!(matches!(error, BuildError::Template(_)), "{error}");
    }
}
