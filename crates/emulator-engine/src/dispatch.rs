use std::{collections::HashMap, sync::Arc};

use emulator_config::{DataSource, DataSourceKind};
use serde_json::Value;

use crate::DispatchError;

/// Executes rendered requests against one kind of backend.
#[async_trait::async_trait]
pub trait DataSourceAdapter: Send + Sync {
    async fn dispatch(&self, data_source: &DataSource, request: Value) -> Result<Value, DispatchError>;
}

/// The `NONE` data source hands the request `payload` straight back.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughAdapter;

#[async_trait::async_trait]
impl DataSourceAdapter for PassthroughAdapter {
    async fn dispatch(&self, _: &DataSource, mut request: Value) -> Result<Value, DispatchError> {
        Ok(request.get_mut("payload").map(Value::take).unwrap_or(Value::Null))
    }
}

/// Adapters by data source kind. `NONE` is always served.
#[derive(Clone)]
pub struct Dispatchers {
    adapters: Arc<HashMap<DataSourceKind, Arc<dyn DataSourceAdapter>>>,
}

impl Default for Dispatchers {
    fn default() -> Self {
        let mut adapters: HashMap<DataSourceKind, Arc<dyn DataSourceAdapter>> = HashMap::new();
        adapters.insert(DataSourceKind::None, Arc::new(PassthroughAdapter));

        Dispatchers {
            adapters: Arc::new(adapters),
        }
    }
}

impl Dispatchers {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_adapter(self, kind: DataSourceKind, adapter: impl DataSourceAdapter + 'static) -> Self {
        let mut adapters = Arc::unwrap_or_clone(self.adapters);
        adapters.insert(kind, Arc::new(adapter));

        Dispatchers {
            adapters: Arc::new(adapters),
        }
    }

    pub fn supports(&self, kind: DataSourceKind) -> bool {
        self.adapters.contains_key(&kind)
    }

    pub async fn dispatch(&self, data_source: &DataSource, request: Value) -> Result<Value, DispatchError> {
        let Some(adapter) = self.adapters.get(&data_source.kind) else {
            return Err(DispatchError::new(format!("cannot handle data source type {}", data_source.kind))
                .with_code("UnsupportedDataSource"));
        };

        tracing::info!(data_source = %data_source.name, kind = %data_source.kind, "dispatching to data source");
        tracing::debug!(%request, "rendered request");

        adapter.dispatch(data_source, request).await
    }
}

impl std::fmt::Debug for Dispatchers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatchers")
            .field("kinds", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn data_source(kind: DataSourceKind) -> DataSource {
        DataSource {
            name: "Source".to_string(),
            kind,
            config: Value::Null,
        }
    }

    struct Echo;

    #[async_trait::async_trait]
    impl DataSourceAdapter for Echo {
        async fn dispatch(&self, data_source: &DataSource, request: Value) -> Result<Value, DispatchError> {
            Ok(json!({ "source": data_source.name, "request": request }))
        }
    }

    #[tokio::test]
    async fn none_returns_the_payload() {
        let dispatchers = Dispatchers::new();
        let request = json!({ "version": "2017-02-28", "payload": { "id": 1 } });

        let result = dispatchers.dispatch(&data_source(DataSourceKind::None), request).await;
        assert_eq!(result, Ok(json!({ "id": 1 })));

        let result = dispatchers.dispatch(&data_source(DataSourceKind::None), json!({})).await;
        assert_eq!(result, Ok(Value::Null));
    }

    #[tokio::test]
    async fn registered_adapters() {
        let dispatchers = Dispatchers::new().with_adapter(DataSourceKind::AwsLambda, Echo);
        assert!(dispatchers.supports(DataSourceKind::AwsLambda));

        let result = dispatchers
            .dispatch(&data_source(DataSourceKind::AwsLambda), json!({ "operation": "Invoke" }))
            .await
            .unwrap();

        assert_eq!(result, json!({ "source": "Source", "request": { "operation": "Invoke" } }));
    }

    #[tokio::test]
    async fn unsupported_kind() {
        let error = Dispatchers::new()
            .dispatch(&data_source(DataSourceKind::Http), json!({}))
            .await
            .unwrap_err();

        assert_eq!(error.code.as_deref(), Some("UnsupportedDataSource"));
        assert_eq!(error.to_string(), "cannot handle data source type HTTP");
    }
}
