#![allow(clippy::panic)]

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use emulator_config::{Config, DataSource};
use emulator_engine::{
    build_resolvers, DataSourceAdapter, DispatchError, Dispatchers, FieldInfo, InMemoryPubSub, RequestContext,
    ResolveError, ResolverMap, ResolverPipeline,
};
use emulator_subscriptions::{ResolverExecutor, SubscriptionRouter, Transport};
use serde_json::{json, Value};
use tokio::sync::mpsc;

#[ctor::ctor]
fn setup_logging() {
    let filter = tracing_subscriber::filter::EnvFilter::builder()
        .parse(std::env::var("RUST_LOG").unwrap_or("emulator_engine=debug".to_string()))
        .unwrap();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .without_time()
        .with_test_writer()
        .init();
}

/// Configuration, mapping templates and resolvers living in a temporary directory.
pub struct Emulator {
    _dir: tempfile::TempDir,
    pub pipeline: Arc<ResolverPipeline>,
    pub resolvers: ResolverMap,
}

impl Emulator {
    pub async fn start(config: &str, templates: &[(&str, &str)], dispatchers: Dispatchers) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("emulator.toml");
        std::fs::write(&config_path, config).unwrap();

        let config = Config::load(&config_path).unwrap();
        let template_dir = config.template_path("");
        std::fs::create_dir_all(&template_dir).unwrap();

        for (name, source) in templates {
            std::fs::write(template_dir.join(name), source).unwrap();
        }

        let pipeline = Arc::new(ResolverPipeline::new(
            Arc::new(config),
            dispatchers,
            Arc::new(InMemoryPubSub::new()),
        ));
        let resolvers = build_resolvers(pipeline.clone()).await.unwrap();

        Emulator {
            _dir: dir,
            pipeline,
            resolvers,
        }
    }

    /// Resolves a root field the way an executor would, with no parent value.
    pub async fn resolve(
        &self,
        type_name: &str,
        field: &str,
        arguments: Value,
        context: &RequestContext,
    ) -> Result<Value, ResolveError> {
        let Some(resolver) = self.resolvers.field(type_name, field) else {
            panic!("no resolver for {type_name}.{field}");
        };

        resolver
            .resolve(Value::Null, arguments, context, &FieldInfo::new(type_name, field))
            .await
    }

    /// A subscription router delivering through the returned channel.
    pub fn router(&self) -> (SubscriptionRouter, mpsc::UnboundedReceiver<(String, Value)>) {
        let (sender, published) = mpsc::unbounded_channel();
        let config = self.pipeline.config();
        let executor = ResolverExecutor::new(self.resolvers.clone(), config.subscription_type.clone());
        let router = SubscriptionRouter::new(
            Arc::new(executor),
            Arc::new(ChannelTransport(sender)),
            config.subscriptions.clone(),
        );

        (router, published)
    }
}

struct ChannelTransport(mpsc::UnboundedSender<(String, Value)>);

impl Transport for ChannelTransport {
    fn publish(&self, topic: &str, payload: String) {
        let payload = serde_json::from_str(&payload).unwrap();
        self.0.send((topic.to_string(), payload)).ok();
    }
}

/// Function data source answering every invocation with `respond(request)`.
#[derive(Clone)]
pub struct Lambda {
    invocations: Arc<Mutex<Vec<Value>>>,
    respond: Arc<dyn Fn(&Value) -> Result<Value, DispatchError> + Send + Sync>,
}

impl Lambda {
    pub fn new(respond: impl Fn(&Value) -> Result<Value, DispatchError> + Send + Sync + 'static) -> Self {
        Lambda {
            invocations: Arc::default(),
            respond: Arc::new(respond),
        }
    }

    /// Answers with the request payload.
    pub fn echo() -> Self {
        Self::new(|request| Ok(request["payload"].clone()))
    }

    pub fn invocations(&self) -> Vec<Value> {
        self.invocations.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl DataSourceAdapter for Lambda {
    async fn dispatch(&self, data_source: &DataSource, request: Value) -> Result<Value, DispatchError> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(json!({ "dataSource": data_source.name, "request": request }));

        (self.respond)(&request)
    }
}

/// A request context for the given subject.
pub fn caller(sub: &str) -> RequestContext {
    RequestContext::new(json!({ "sub": sub, "cognito:username": sub }).as_object().cloned().unwrap_or_default())
}
