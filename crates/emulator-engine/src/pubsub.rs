use dashmap::DashMap;
use futures_util::{
    stream::{self, BoxStream},
    StreamExt,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

const CHANNEL_CAPACITY: usize = 1000;

/// The bus mutation results travel on before subscriptions pick them up.
pub trait PubSub: Send + Sync {
    /// Fire and forget. Nobody listening is not an error.
    fn publish(&self, topic: &str, payload: Value);

    /// Events of all `topics`, each topic in publish order.
    fn subscribe(&self, topics: &[String]) -> BoxStream<'static, Value>;
}

/// Single process bus on top of broadcast channels, one per topic.
#[derive(Debug, Default)]
pub struct InMemoryPubSub {
    channels: DashMap<String, broadcast::Sender<Value>>,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Value> {
        self.channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl PubSub for InMemoryPubSub {
    fn publish(&self, topic: &str, payload: Value) {
        let Some(sender) = self.channels.get(topic) else {
            tracing::debug!(topic, "no subscribers for topic");
            return;
        };

        match sender.send(payload) {
            Ok(receivers) => tracing::debug!(topic, receivers, "published"),
            Err(_) => tracing::debug!(topic, "all subscribers are gone"),
        }
    }

    fn subscribe(&self, topics: &[String]) -> BoxStream<'static, Value> {
        let streams = topics.iter().map(|topic| {
            let topic = topic.clone();

            BroadcastStream::new(self.sender(&topic).subscribe())
                .filter_map(move |event| {
                    let event = match event {
                        Ok(event) => Some(event),
                        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                            tracing::warn!(topic = %topic, skipped, "subscriber lagging behind, events dropped");
                            None
                        }
                    };
                    std::future::ready(event)
                })
                .boxed()
        });

        stream::select_all(streams).boxed()
    }
}
