use std::{future::Future, sync::Arc, time::Duration};

use dashmap::{mapref::entry::Entry, DashMap};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::{BatchError, DispatchError};

type Reply = oneshot::Sender<Result<Value, BatchError>>;

#[derive(Default)]
struct Pending {
    requests: Vec<Value>,
    replies: Vec<Reply>,
}

/// Coalesces `BatchInvoke` requests issued for the same field path within one window into a
/// single dispatch.
///
/// The combined request is the first pending request with its `payload` replaced by the list
/// of every pending payload, in issue order. The data source must answer with a list of the
/// same length; caller `n` receives element `n`. Nothing is cached: a window that has been
/// flushed is forgotten, the next request opens a new one.
pub struct BatchCoordinator {
    delay: Duration,
    open: Arc<DashMap<String, Pending>>,
}

impl BatchCoordinator {
    /// With a zero `delay` a window closes as soon as the runtime gets to run the flush task. On a
    /// multi-thread runtime, siblings polled by other workers can then miss the window and go out
    /// in a batch of their own, so only a non-zero delay groups requests issued from several tasks.
    pub fn new(delay: Duration) -> Self {
        BatchCoordinator {
            delay,
            open: Default::default(),
        }
    }

    /// Queues `request` on the window of `field_path`, opening one if needed. `dispatch` is only
    /// called by the request opening the window.
    pub async fn load<F, Fut>(&self, field_path: &str, request: Value, dispatch: F) -> Result<Value, BatchError>
    where
        F: FnOnce(Value) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, DispatchError>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let opened = match self.open.entry(field_path.to_string()) {
            Entry::Occupied(mut pending) => {
                let pending = pending.get_mut();
                pending.requests.push(request);
                pending.replies.push(sender);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(Pending {
                    requests: vec![request],
                    replies: vec![sender],
                });
                true
            }
        };

        if opened {
            let open = self.open.clone();
            let delay = self.delay;
            let field_path = field_path.to_string();

            tokio::spawn(async move {
                if delay.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(delay).await;
                }

                if let Some((field_path, pending)) = open.remove(&field_path) {
                    flush(field_path, pending, dispatch).await;
                }
            });
        }

        receiver
            .await
            .map_err(|_| BatchError::Dropped(field_path.to_string()))?
    }
}

impl std::fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("delay", &self.delay)
            .field("open", &self.open.len())
            .finish()
    }
}

async fn flush<F, Fut>(field_path: String, pending: Pending, dispatch: F)
where
    F: FnOnce(Value) -> Fut,
    Fut: Future<Output = Result<Value, DispatchError>>,
{
    let Pending { requests, replies } = pending;
    let expected = requests.len();

    let mut payloads = Vec::with_capacity(expected);
    let mut combined = None;
    for mut request in requests {
        payloads.push(request.get_mut("payload").map(Value::take).unwrap_or(Value::Null));
        combined.get_or_insert(request);
    }

    let mut combined = combined.unwrap_or_default();
    if let Value::Object(fields) = &mut combined {
        fields.insert("payload".to_string(), Value::Array(payloads));
    }

    tracing::info!(field_path = %field_path, requests = expected, "dispatching batch");

    let results = match dispatch(combined).await {
        Ok(Value::Array(results)) if results.len() == expected => results.into_iter().map(Ok).collect(),
        Ok(Value::Array(results)) => {
            let error = BatchError::Shape {
                field_path: field_path.clone(),
                expected,
                actual: results.len(),
            };
            tracing::error!(%error, "malformed batch result");
            vec![Err(error); expected]
        }
        Ok(_) => vec![Err(BatchError::NotAList(field_path.clone())); expected],
        Err(error) => vec![Err(BatchError::Dispatch(error)); expected],
    };

    for (reply, result) in replies.into_iter().zip(results) {
        // The caller went away, nothing to deliver to.
        let _ = reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::future::join_all;
    use serde_json::json;

    use super::*;
    use crate::ResolveError;

    fn invoke(payload: Value) -> Value {
        json!({ "version": "2017-02-28", "operation": "BatchInvoke", "payload": payload })
    }

    #[tokio::test]
    async fn one_dispatch_per_window() {
        let coordinator = BatchCoordinator::new(Duration::ZERO);
        let calls = Arc::new(Mutex::new(Vec::new()));

        let loads = ["p1", "p2", "p3"].map(|payload| {
            let calls = calls.clone();
            coordinator.load("Price.owner", invoke(json!(payload)), move |combined| async move {
                let payloads = combined["payload"].as_array().cloned().unwrap_or_default();
                calls.lock().unwrap().push(combined);
                Ok::<_, DispatchError>(Value::Array(payloads.iter().map(|p| json!({ "for": p })).collect()))
            })
        });

        let results = join_all(loads).await;

        assert_eq!(
            results,
            [
                Ok(json!({ "for": "p1" })),
                Ok(json!({ "for": "p2" })),
                Ok(json!({ "for": "p3" }))
            ]
        );

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], invoke(json!(["p1", "p2", "p3"])));
    }

    #[tokio::test]
    async fn field_paths_batch_separately() {
        let coordinator = BatchCoordinator::new(Duration::ZERO);

        let dispatch = |combined: Value| async move { Ok::<_, DispatchError>(combined["payload"].clone()) };

        let (a, b) = tokio::join!(
            coordinator.load("A.x", invoke(json!(1)), dispatch),
            coordinator.load("B.x", invoke(json!(2)), dispatch),
        );

        assert_eq!(a, Ok(json!(1)));
        assert_eq!(b, Ok(json!(2)));
    }

    #[tokio::test]
    async fn windows_are_not_cached() {
        let coordinator = BatchCoordinator::new(Duration::ZERO);
        let dispatch = |combined: Value| async move { Ok::<_, DispatchError>(combined["payload"].clone()) };

        let first = coordinator.load("A.x", invoke(json!("first")), dispatch).await;
        let second = coordinator.load("A.x", invoke(json!("second")), dispatch).await;

        assert_eq!(first, Ok(json!("first")));
        assert_eq!(second, Ok(json!("second")));
    }

    #[tokio::test]
    async fn length_mismatch_fails_every_caller() {
        let coordinator = BatchCoordinator::new(Duration::ZERO);
        let dispatch = |_: Value| async move { Ok::<_, DispatchError>(json!([1])) };

        let (a, b) = tokio::join!(
            coordinator.load("A.x", invoke(json!(1)), dispatch),
            coordinator.load("A.x", invoke(json!(2)), dispatch),
        );

        let expected = BatchError::Shape {
            field_path: "A.x".to_string(),
            expected: 2,
            actual: 1,
        };
        assert_eq!(a, Err(expected.clone()));
        assert_eq!(b, Err(expected));
    }

    #[tokio::test]
    async fn dispatch_failures_fan_out() {
        let coordinator = BatchCoordinator::new(Duration::from_millis(5));
        let dispatch =
            |_: Value| async move { Err::<Value, _>(DispatchError::new("lambda failed").with_code("Unhandled")) };

        let (a, b) = tokio::join!(
            coordinator.load("A.x", invoke(json!(1)), dispatch),
            coordinator.load("A.x", invoke(json!(2)), dispatch),
        );

        for result in [a, b] {
            let error = ResolveError::from(result.unwrap_err());
            let ResolveError::Dispatch(error) = error else {
                unreachable!("expected the data source failure, got {error:?}");
            };
            assert_eq!(error, DispatchError::new("lambda failed").with_code("Unhandled"));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn default_window_on_a_multi_thread_runtime() {
        let coordinator = BatchCoordinator::new(Duration::from_millis(1));
        let calls = Arc::new(Mutex::new(0));

        let loads = (0..4).map(|n| {
            let calls = calls.clone();
            coordinator.load("A.x", invoke(json!(n)), move |combined| async move {
                *calls.lock().unwrap() += 1;
                Ok::<_, DispatchError>(combined["payload"].clone())
            })
        });

        let results = join_all(loads).await;

        assert_eq!(results, (0..4).map(|n| Ok(json!(n))).collect::<Vec<_>>());
        assert_eq!(*calls.lock().unwrap(), 1);
    }
}
