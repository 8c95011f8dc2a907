use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use emulator_config::SubscriptionsConfig;
use emulator_engine::GraphqlError;
use futures_util::{stream::BoxStream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{should_publish, RegisterError, SubscribeError, SubscriptionExecutor, SubscriptionRequest, Transport};

/// Answer to a subscription operation.
///
/// On success it carries the handshake telling the client which topic to listen on, with both
/// `data` and `errors` null. On failure only `errors` is set.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RegisterResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<HandshakeExtensions>,
    pub data: Value,
    pub errors: Option<Vec<GraphqlError>>,
}

impl RegisterResponse {
    fn failed(errors: Vec<GraphqlError>) -> Self {
        RegisterResponse {
            extensions: None,
            data: Value::Null,
            errors: Some(errors),
        }
    }

    /// The topic created by this registration.
    pub fn topic(&self) -> Option<&str> {
        let subscription = &self.extensions.as_ref()?.subscription;
        subscription.new_subscriptions.keys().next().map(String::as_str)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HandshakeExtensions {
    pub subscription: Handshake,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub mqtt_connections: Vec<Connection>,
    pub new_subscriptions: BTreeMap<String, NewSubscription>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Connection {
    pub url: String,
    /// Every topic the client holds, the new one included.
    pub topics: Vec<String>,
    pub client: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubscription {
    pub topic: String,
    /// Milliseconds since the epoch.
    pub expire_time: i64,
}

struct Registration {
    topic: String,
    request: SubscriptionRequest,
    /// Started but not consumed yet.
    stream: Option<BoxStream<'static, Value>>,
    /// Set while a consume loop forwards events to the transport.
    consumer: Option<CancellationToken>,
    connect_timeout: CancellationToken,
}

impl Registration {
    fn stop(&mut self) {
        self.connect_timeout.cancel();
        self.stream = None;

        if let Some(consumer) = self.consumer.take() {
            consumer.cancel();
        }
    }
}

type Registrations = Arc<Mutex<HashMap<String, Vec<Registration>>>>;

/// Keeps track of the subscriptions of every client and streams their events to the transport.
///
/// A registration outlives its stream: unsubscribing stops the stream, subscribing again on the
/// same topic starts a new one without a new handshake.
#[derive(Clone)]
pub struct SubscriptionRouter {
    executor: Arc<dyn SubscriptionExecutor>,
    transport: Arc<dyn Transport>,
    config: SubscriptionsConfig,
    registrations: Registrations,
}

impl SubscriptionRouter {
    pub fn new(
        executor: Arc<dyn SubscriptionExecutor>,
        transport: Arc<dyn Transport>,
        config: SubscriptionsConfig,
    ) -> Self {
        SubscriptionRouter {
            executor,
            transport,
            config,
            registrations: Arc::default(),
        }
    }

    /// Starts the subscription and hands out a fresh topic for it.
    ///
    /// The client must acknowledge the topic within the connect timeout, otherwise the started
    /// stream is dropped.
    pub async fn register(&self, request: SubscriptionRequest) -> RegisterResponse {
        let client = match client_of(&request) {
            Ok(client) => client,
            Err(error) => {
                tracing::warn!(%error, "subscription rejected");
                return RegisterResponse::failed(vec![GraphqlError::new(error.to_string())]);
            }
        };

        let topic = uuid::Uuid::new_v4().to_string();
        tracing::info!(%client, %topic, "register");

        let stream = match self.executor.execute(&request).await {
            Ok(stream) => stream,
            Err(errors) => {
                let reported = request.context.take_errors();
                let errors = if reported.is_empty() { errors } else { reported };
                tracing::warn!(%client, errors = errors.len(), "subscription failed to start");

                return RegisterResponse::failed(errors);
            }
        };

        let connect_timeout = CancellationToken::new();
        let topics = {
            let mut registrations = self.lock();
            let client_registrations = registrations.entry(client.clone()).or_default();

            client_registrations.push(Registration {
                topic: topic.clone(),
                request,
                stream: Some(stream),
                consumer: None,
                connect_timeout: connect_timeout.clone(),
            });

            client_registrations
                .iter()
                .map(|registration| registration.topic.clone())
                .collect()
        };

        self.arm_connect_timeout(&client, &topic, connect_timeout);

        let url = self.config.endpoint().to_string();
        tracing::info!(%client, %url, %topic, "subscription handshake sent");

        let expire_time = chrono::Utc::now().timestamp_millis() + millis(self.config.topic_expiry());
        let new_subscriptions = BTreeMap::from([(
            topic.clone(),
            NewSubscription {
                topic,
                expire_time,
            },
        )]);

        RegisterResponse {
            extensions: Some(HandshakeExtensions {
                subscription: Handshake {
                    mqtt_connections: vec![Connection { url, topics, client }],
                    new_subscriptions,
                },
            }),
            data: Value::Null,
            errors: None,
        }
    }

    /// The client connected to the transport: none of its subscriptions time out anymore.
    pub fn connect(&self, client: &str) {
        tracing::info!(%client, "client connected");

        if let Some(registrations) = self.lock().get(client) {
            for registration in registrations {
                registration.connect_timeout.cancel();
            }
        }
    }

    /// The client listens on `topic`: forward the events of its subscription.
    ///
    /// A subscription stopped by an earlier unsubscribe (or by the connect timeout) is started
    /// again. Subscribing to a topic that already streams does nothing.
    pub async fn subscribe(&self, client: &str, topic: &str) -> Result<(), SubscribeError> {
        tracing::info!(%client, %topic, "client subscribed");

        let pending = self.with_registration(client, topic, |registration| {
            registration.connect_timeout.cancel();

            if registration.consumer.is_some() {
                return None;
            }

            Some((registration.stream.take(), registration.request.clone()))
        })?;

        let Some((stream, request)) = pending else {
            return Ok(());
        };

        let stream = match stream {
            Some(stream) => stream,
            None => self.executor.execute(&request).await.map_err(|errors| {
                tracing::error!(%client, %topic, errors = errors.len(), "could not restart the subscription");
                SubscribeError::Execution(errors)
            })?,
        };

        let token = CancellationToken::new();
        let started = self.with_registration(client, topic, |registration| {
            if registration.consumer.is_some() {
                return false;
            }

            registration.consumer = Some(token.clone());
            true
        })?;

        if !started {
            return Ok(());
        }

        tokio::spawn(consume(
            stream,
            token,
            request,
            client.to_string(),
            topic.to_string(),
            self.transport.clone(),
            self.registrations.clone(),
        ));

        Ok(())
    }

    /// Stops the stream of `topic` but keeps the registration, so the client can subscribe again.
    pub fn unsubscribe(&self, client: &str, topic: &str) -> Result<(), SubscribeError> {
        tracing::info!(%client, %topic, "client unsubscribed");
        self.with_registration(client, topic, Registration::stop)
    }

    /// Forgets everything about the client.
    pub fn disconnect(&self, client: &str) {
        tracing::info!(%client, "client disconnected");

        match self.lock().remove(client) {
            Some(registrations) => {
                for mut registration in registrations {
                    registration.stop();
                }
            }
            None => tracing::warn!(%client, "disconnecting client with unknown id"),
        }
    }

    /// Topics registered by the client, oldest first.
    pub fn topics(&self, client: &str) -> Vec<String> {
        self.lock()
            .get(client)
            .map(|registrations| registrations.iter().map(|r| r.topic.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether events of `topic` are currently forwarded to the transport.
    pub fn is_streaming(&self, client: &str, topic: &str) -> bool {
        self.with_registration(client, topic, |registration| registration.consumer.is_some())
            .unwrap_or(false)
    }

    fn arm_connect_timeout(&self, client: &str, topic: &str, token: CancellationToken) {
        let timeout = self.config.connect_timeout();
        let registrations = self.registrations.clone();
        let client = client.to_string();
        let topic = topic.to_string();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    update(&registrations, &client, &topic, |registration| {
                        if registration.consumer.is_none() {
                            tracing::warn!(%client, %topic, "client did not connect in time, subscription stopped");
                            registration.stream = None;
                        }
                    });
                }
            }
        });
    }

    fn with_registration<T>(
        &self,
        client: &str,
        topic: &str,
        f: impl FnOnce(&mut Registration) -> T,
    ) -> Result<T, SubscribeError> {
        let mut registrations = self.lock();

        let Some(client_registrations) = registrations.get_mut(client) else {
            tracing::warn!(%client, %topic, "no registration for client");
            return Err(SubscribeError::UnknownClient(client.to_string()));
        };

        let Some(registration) = client_registrations.iter_mut().find(|r| r.topic == topic) else {
            tracing::warn!(%client, %topic, "client is not registered on topic");
            return Err(SubscribeError::UnknownTopic {
                client: client.to_string(),
                topic: topic.to_string(),
            });
        };

        Ok(f(registration))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Registration>>> {
        self.registrations.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SubscriptionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let clients = self.lock().len();
        f.debug_struct("SubscriptionRouter")
            .field("config", &self.config)
            .field("clients", &clients)
            .finish_non_exhaustive()
    }
}

fn client_of(request: &SubscriptionRequest) -> Result<String, RegisterError> {
    request.root_field()?;

    request
        .context
        .subject()
        .map(str::to_string)
        .ok_or(RegisterError::MissingClientId)
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

async fn consume(
    mut stream: BoxStream<'static, Value>,
    token: CancellationToken,
    request: SubscriptionRequest,
    client: String,
    topic: String,
    transport: Arc<dyn Transport>,
    registrations: Registrations,
) {
    loop {
        let payload = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            payload = stream.next() => payload,
        };

        let Some(payload) = payload else {
            break;
        };

        if !should_publish(&payload, &request.variables) {
            tracing::debug!(%client, %topic, "payload filtered out");
            continue;
        }

        tracing::info!(%client, %topic, "publish");
        transport.publish(&topic, payload.to_string());
    }

    tracing::info!(%client, %topic, "subscription stream ended");

    // Only a cancelled loop can have been replaced by a newer one.
    if !token.is_cancelled() {
        update(&registrations, &client, &topic, |registration| registration.consumer = None);
    }
}

fn update(registrations: &Registrations, client: &str, topic: &str, f: impl FnOnce(&mut Registration)) {
    let mut registrations = registrations.lock().unwrap_or_else(PoisonError::into_inner);
    let registration = registrations
        .get_mut(client)
        .and_then(|registrations| registrations.iter_mut().find(|r| r.topic == topic));

    if let Some(registration) = registration {
        f(registration);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use emulator_engine::{InMemoryPubSub, PubSub, RequestContext};
    use insta::assert_json_snapshot;
    use serde_json::{json, Map};
    use tokio::sync::mpsc;

    use super::*;

    /// Wraps every published `addPrice` value as the `onPrice` field.
    #[derive(Default)]
    struct BusExecutor {
        bus: InMemoryPubSub,
        executions: AtomicUsize,
    }

    #[async_trait]
    impl SubscriptionExecutor for BusExecutor {
        async fn execute(&self, request: &SubscriptionRequest) -> Result<BoxStream<'static, Value>, Vec<GraphqlError>> {
            let field = request.root_field().map_err(|error| vec![GraphqlError::new(error.to_string())])?;
            if field.name != "onPrice" {
                request.context.push_errors([GraphqlError::new("not allowed to subscribe")]);
                return Err(vec![GraphqlError::new(format!("unknown field {}", field.name))]);
            }

            self.executions.fetch_add(1, Ordering::SeqCst);
            let key = field.response_key;
            let events = self.bus.subscribe(&["addPrice".to_string()]);

            Ok(events.map(move |event| serde_json::json!({ "data": { key.clone(): event } })).boxed())
        }
    }

    struct Recorder(mpsc::UnboundedSender<(String, String)>);

    impl Transport for Recorder {
        fn publish(&self, topic: &str, payload: String) {
            self.0.send((topic.to_string(), payload)).ok();
        }
    }

    struct Harness {
        router: SubscriptionRouter,
        executor: Arc<BusExecutor>,
        published: mpsc::UnboundedReceiver<(String, String)>,
    }

    impl Harness {
        fn new() -> Self {
            let executor = Arc::new(BusExecutor::default());
            let (sender, published) = mpsc::unbounded_channel();
            let router = SubscriptionRouter::new(
                executor.clone(),
                Arc::new(Recorder(sender)),
                SubscriptionsConfig::default(),
            );

            Harness {
                router,
                executor,
                published,
            }
        }

        async fn register(&self, query: &str, variables: Value) -> RegisterResponse {
            let claims = json!({ "sub": "user-1" }).as_object().cloned().unwrap();
            let variables = variables.as_object().cloned().unwrap_or_default();
            let request = SubscriptionRequest::parse(query, variables, RequestContext::new(claims)).unwrap();

            self.router.register(request).await
        }

        fn publish(&self, commodity: &str) {
            self.executor
                .bus
                .publish("addPrice", json!({ "commodity": commodity, "amount": 1 }));
        }

        async fn next(&mut self) -> (String, Value) {
            let (topic, payload) = self.published.recv().await.unwrap();
            (topic, serde_json::from_str(&payload).unwrap())
        }

        fn executions(&self) -> usize {
            self.executor.executions.load(Ordering::SeqCst)
        }
    }

    const ON_PRICE: &str = "subscription OnPrice($commodity: String) { onPrice(commodity: $commodity) { commodity amount } }";

    #[tokio::test]
    async fn events_are_filtered_by_variables() {
        let mut harness = Harness::new();
        let response = harness.register(ON_PRICE, json!({ "commodity": "foo" })).await;
        let topic = response.topic().unwrap().to_string();

        harness.router.subscribe("user-1", &topic).await.unwrap();
        harness.publish("bar");
        harness.publish("foo");

        let (published_on, payload) = harness.next().await;
        assert_eq!(published_on, topic);
        assert_eq!(payload, json!({ "data": { "onPrice": { "commodity": "foo", "amount": 1 } } }));
    }

    #[tokio::test]
    async fn without_variables_every_event_is_delivered() {
        let mut harness = Harness::new();
        let response = harness.register(ON_PRICE, Value::Null).await;
        let topic = response.topic().unwrap().to_string();

        harness.router.subscribe("user-1", &topic).await.unwrap();
        harness.publish("bar");
        harness.publish("foo");

        assert_eq!(harness.next().await.1["data"]["onPrice"]["commodity"], "bar");
        assert_eq!(harness.next().await.1["data"]["onPrice"]["commodity"], "foo");
    }

    #[tokio::test]
    async fn resubscribing_resumes_delivery() {
        let mut harness = Harness::new();
        let response = harness.register(ON_PRICE, Value::Null).await;
        let topic = response.topic().unwrap().to_string();

        harness.router.subscribe("user-1", &topic).await.unwrap();
        assert!(harness.router.is_streaming("user-1", &topic));
        harness.publish("first");
        assert_eq!(harness.next().await.1["data"]["onPrice"]["commodity"], "first");

        harness.router.unsubscribe("user-1", &topic).unwrap();
        assert!(!harness.router.is_streaming("user-1", &topic));
        assert_eq!(harness.router.topics("user-1"), [topic.clone()]);

        harness.router.subscribe("user-1", &topic).await.unwrap();
        assert_eq!(harness.executions(), 2);
        harness.publish("second");
        assert_eq!(harness.next().await.1["data"]["onPrice"]["commodity"], "second");
    }

    #[tokio::test]
    async fn subscribing_twice_keeps_one_stream() {
        let mut harness = Harness::new();
        let response = harness.register(ON_PRICE, Value::Null).await;
        let topic = response.topic().unwrap().to_string();

        harness.router.subscribe("user-1", &topic).await.unwrap();
        harness.router.subscribe("user-1", &topic).await.unwrap();
        assert_eq!(harness.executions(), 1);

        harness.publish("once");
        harness.publish("twice");
        assert_eq!(harness.next().await.1["data"]["onPrice"]["commodity"], "once");
        assert_eq!(harness.next().await.1["data"]["onPrice"]["commodity"], "twice");
    }

    #[tokio::test]
    async fn disconnect_forgets_the_client() {
        let harness = Harness::new();
        let response = harness.register(ON_PRICE, Value::Null).await;
        let topic = response.topic().unwrap().to_string();
        harness.router.subscribe("user-1", &topic).await.unwrap();

        harness.router.disconnect("user-1");

        assert!(harness.router.topics("user-1").is_empty());
        let error = harness.router.subscribe("user-1", &topic).await.unwrap_err();
        assert!(matches!(error, SubscribeError::UnknownClient(_)), "{error}");
    }

    #[tokio::test]
    async fn unknown_topic() {
        let harness = Harness::new();
        harness.register(ON_PRICE, Value::Null).await;

        let error = harness.router.subscribe("user-1", "nope").await.unwrap_err();
        assert_eq!(error.to_string(), "client user-1 has no subscription on topic nope");
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_stops_the_stream() {
        let harness = Harness::new();
        let late = harness.register(ON_PRICE, Value::Null).await;
        let late = late.topic().unwrap().to_string();

        tokio::time::sleep(Duration::from_secs(121)).await;

        harness.router.subscribe("user-1", &late).await.unwrap();
        assert_eq!(harness.executions(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn connecting_clears_the_timeout() {
        let harness = Harness::new();
        let response = harness.register(ON_PRICE, Value::Null).await;
        let topic = response.topic().unwrap().to_string();

        harness.router.connect("user-1");
        tokio::time::sleep(Duration::from_secs(121)).await;

        harness.router.subscribe("user-1", &topic).await.unwrap();
        assert_eq!(harness.executions(), 1);
    }

    #[tokio::test]
    async fn handshake_lists_every_topic_of_the_client() {
        let harness = Harness::new();
        let first = harness.register(ON_PRICE, Value::Null).await;
        let second = harness.register(ON_PRICE, Value::Null).await;

        let first = first.topic().unwrap().to_string();
        let topic = second.topic().unwrap().to_string();
        let extensions = second.extensions.as_ref().unwrap();
        let connection = &extensions.subscription.mqtt_connections[0];

        assert_eq!(connection.url, "ws://localhost:20002/");
        assert_eq!(connection.client, "user-1");
        assert_eq!(connection.topics, [first, topic.clone()]);

        let subscription = &extensions.subscription.new_subscriptions[&topic];
        assert_eq!(subscription.topic, topic);
        assert!(subscription.expire_time > chrono::Utc::now().timestamp_millis() + 99 * 60 * 1000);

        let response = serde_json::to_value(&second).unwrap();
        assert_eq!(response["data"], Value::Null);
        assert_eq!(response["errors"], Value::Null);
        assert!(response["extensions"]["subscription"]["newSubscriptions"][&topic]["expireTime"].is_i64());
    }

    #[tokio::test]
    async fn several_root_fields_are_rejected() {
        let harness = Harness::new();
        let response = harness
            .register("subscription { onPrice { amount } other: onPrice { amount } }", Value::Null)
            .await;

        assert_json_snapshot!(response, @r###"
        {
          "data": null,
          "errors": [
            {
              "message": "subscriptions selecting several root fields are not supported: onPrice, other"
            }
          ]
        }
        "###);
        assert!(harness.router.topics("user-1").is_empty());
    }

    #[tokio::test]
    async fn client_must_be_identified() {
        let harness = Harness::new();
        let request = SubscriptionRequest::parse(ON_PRICE, Map::new(), RequestContext::default()).unwrap();

        let response = harness.router.register(request).await;
        let errors = response.errors.unwrap();
        assert_eq!(errors[0].message, "the request carries no `sub` claim to identify the client");
    }

    #[tokio::test]
    async fn reported_errors_take_precedence() {
        let harness = Harness::new();
        let response = harness.register("subscription { onOther { amount } }", Value::Null).await;

        let messages: Vec<_> = response.errors.unwrap().into_iter().map(|error| error.message).collect();
        assert_eq!(messages, ["not allowed to subscribe"]);
        assert!(response.extensions.is_none());
    }
}
