use std::sync::Arc;

use chrono::{DateTime, Utc};
use emulator_config::{Config, DataSource, MappingTemplate};
use mapping_template::{adapt, render_reporting, Context, Macros, Template, Util};
use serde_json::{json, Map, Value};

use crate::{
    BatchCoordinator, Dispatchers, FieldInfo, GraphqlError, PubSub, RequestContext, ResolveError, TemplateCache,
    TemplateLoadError,
};

/// Operation tag of request templates asking to be coalesced with their siblings.
pub const BATCH_INVOKE: &str = "BatchInvoke";

/// A mapping template together with the data source it names.
#[derive(Clone, Debug)]
pub struct FieldBinding {
    pub mapping: MappingTemplate,
    pub data_source: DataSource,
}

impl FieldBinding {
    pub fn coordinate(&self) -> String {
        self.mapping.coordinate()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Field,
    /// Delivering a published mutation result to a subscriber.
    Subscription,
}

struct Scope<'a> {
    source: Value,
    arguments: Value,
    context: &'a RequestContext,
    info: &'a FieldInfo,
}

/// Runs one field resolution: request template, dispatch, response template.
///
/// Errors reported through `$util` abort the field. All of them are appended to the request
/// context and the first one is returned. A failed render with nothing reported surfaces as
/// [`ResolveError::Render`], dispatch failures are passed through untouched.
pub struct ResolverPipeline {
    config: Arc<Config>,
    dispatchers: Dispatchers,
    batches: BatchCoordinator,
    pubsub: Arc<dyn PubSub>,
    templates: TemplateCache,
    macros: Macros,
}

impl ResolverPipeline {
    pub fn new(config: Arc<Config>, dispatchers: Dispatchers, pubsub: Arc<dyn PubSub>) -> Self {
        ResolverPipeline {
            batches: BatchCoordinator::new(config.batching.delay()),
            config,
            dispatchers,
            pubsub,
            templates: TemplateCache::new(),
            macros: Macros::with_defaults(),
        }
    }

    #[must_use]
    pub fn with_macros(mut self, macros: Macros) -> Self {
        self.macros = macros;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dispatchers(&self) -> &Dispatchers {
        &self.dispatchers
    }

    pub fn pubsub(&self) -> &Arc<dyn PubSub> {
        &self.pubsub
    }

    pub fn templates(&self) -> &TemplateCache {
        &self.templates
    }

    /// Loads both templates of `binding` so broken files fail before the first request.
    pub async fn preload(&self, binding: &FieldBinding) -> Result<(), TemplateLoadError> {
        self.load(binding).await.map(|_| ())
    }

    pub async fn resolve(
        &self,
        binding: &FieldBinding,
        source: Value,
        arguments: Value,
        context: &RequestContext,
        info: &FieldInfo,
    ) -> Result<Value, ResolveError> {
        let scope = Scope {
            source,
            arguments,
            context,
            info,
        };

        self.run(binding, scope, Mode::Field).await
    }

    /// Resolves a subscription field for one published `event`, which serves as both the
    /// source and the arguments of the field.
    pub async fn resolve_event(
        &self,
        binding: &FieldBinding,
        event: Value,
        context: &RequestContext,
        info: &FieldInfo,
    ) -> Result<Value, ResolveError> {
        let scope = Scope {
            source: event.clone(),
            arguments: event,
            context,
            info,
        };

        self.run(binding, scope, Mode::Subscription).await
    }

    async fn load(&self, binding: &FieldBinding) -> Result<(Arc<Template>, Arc<Template>), TemplateLoadError> {
        let request = self
            .templates
            .get_or_load(&self.config.template_path(&binding.mapping.request))
            .await?;

        let response = self
            .templates
            .get_or_load(&self.config.template_path(&binding.mapping.response))
            .await?;

        Ok((request, response))
    }

    async fn run(&self, binding: &FieldBinding, scope: Scope<'_>, mode: Mode) -> Result<Value, ResolveError> {
        let coordinate = binding.coordinate();
        tracing::info!(%coordinate, path = ?scope.info.path, "resolving field");

        let result = self.execute(binding, &coordinate, &scope, mode).await;

        if let Err(error) = &result {
            tracing::error!(%coordinate, %error, "field resolution failed");
        }

        result
    }

    async fn execute(
        &self,
        binding: &FieldBinding,
        coordinate: &str,
        scope: &Scope<'_>,
        mode: Mode,
    ) -> Result<Value, ResolveError> {
        let (request_template, response_template) = self.load(binding).await?;

        // Both renders of one resolution see the same time.
        let now = Utc::now();

        let (request, stash) = self.render(&request_template, scope, Value::Null, Value::Object(Map::new()), now)?;

        let result = if request.get("operation").and_then(Value::as_str) == Some(BATCH_INVOKE) {
            let dispatchers = self.dispatchers.clone();
            let data_source = binding.data_source.clone();

            self.batches
                .load(coordinate, request, move |combined| async move {
                    dispatchers.dispatch(&data_source, combined).await
                })
                .await?
        } else {
            self.dispatchers.dispatch(&binding.data_source, request).await?
        };

        let result = match (mode, result) {
            (Mode::Subscription, Value::Null) => Value::Object(Map::new()),
            (_, result) => result,
        };

        let (response, _) = self.render(&response_template, scope, result, stash, now)?;

        if mode == Mode::Field && binding.mapping.type_name == self.config.mutation_type {
            tracing::debug!(topic = %binding.mapping.field, "publishing mutation result");
            self.pubsub.publish(&binding.mapping.field, response.clone());
        }

        Ok(response)
    }

    /// Renders `template` and parses its output as JSON. Returns the output and the stash as the
    /// template left it.
    fn render(
        &self,
        template: &Template,
        scope: &Scope<'_>,
        result: Value,
        stash: Value,
        now: DateTime<Utc>,
    ) -> Result<(Value, Value), ResolveError> {
        let source = match &scope.source {
            Value::Null => Value::Object(Map::new()),
            source => source.clone(),
        };

        let ctx = adapt(json!({
            "identity": scope.context.identity(),
            "request": scope.context.request(),
            "info": scope.info.to_json(),
            "source": source,
            "result": result,
            "stash": stash,
        }));

        // `args` and `arguments` are one and the same map.
        let arguments = adapt(&scope.arguments);
        if let Some(fields) = ctx.as_map() {
            fields.insert("arguments", arguments.clone());
            fields.insert("args", arguments);
        }

        let util = Util::new(now);
        let mut context = Context::new().with("ctx", ctx.clone()).with("context", ctx.clone());
        util.install(&mut context);

        let rendered = render_reporting(template, &context, &self.macros, &util);

        let reported = util.errors();
        if let Some(first) = reported.first() {
            let first = GraphqlError::from_resolver_error(first.clone(), scope.info.path.clone());
            let errors = reported
                .into_iter()
                .map(|error| GraphqlError::from_resolver_error(error, scope.info.path.clone()));

            tracing::warn!(template = template.name(), error = %first, "template reported errors");
            scope.context.push_errors(errors);

            return Err(ResolveError::Field(first));
        }

        let output = rendered?.unwrap_or_default();
        let stash = ctx.as_map().map(|ctx| ctx.get("stash").to_json()).unwrap_or_default();

        let output = serde_json::from_str(&output).map_err(|source| {
            tracing::error!(template = template.name(), %output, "template output is not JSON");
            ResolveError::InvalidOutput {
                template: template.name().to_string(),
                source,
            }
        })?;

        Ok((output, stash))
    }
}

impl std::fmt::Debug for ResolverPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverPipeline")
            .field("dispatchers", &self.dispatchers)
            .field("batches", &self.batches)
            .field("templates", &self.templates.len())
            .finish_non_exhaustive()
    }
}
