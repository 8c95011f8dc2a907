use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

/// How long a client may take to subscribe to a freshly registered topic.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2 * 60);
/// Expiry advertised for topics in the registration handshake.
pub const DEFAULT_TOPIC_EXPIRY: Duration = Duration::from_secs(100 * 60);
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(1);
pub const DEFAULT_SUBSCRIPTION_ENDPOINT: &str = "ws://localhost:20002/";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("mapping template for {coordinate} refers to an unknown data source `{data_source}`")]
    UnknownDataSource { coordinate: String, data_source: String },
    #[error("{0} has more than one mapping template")]
    DuplicateField(String),
    #[error("data source `{0}` is declared more than once")]
    DuplicateDataSource(String),
}

/// Emulator configuration, usually read from `emulator.toml`.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory holding the template files, relative to the configuration file
    pub mapping_templates_location: PathBuf,
    /// Name of the mutation root type. Resolved mutations are published to subscribers.
    pub mutation_type: String,
    /// Name of the subscription root type
    pub subscription_type: String,
    pub mapping_templates: Vec<MappingTemplate>,
    pub data_sources: Vec<DataSource>,
    pub subscriptions: SubscriptionsConfig,
    pub batching: BatchingConfig,
    #[serde(skip)]
    base_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mapping_templates_location: PathBuf::from("mapping-templates"),
            mutation_type: "Mutation".to_string(),
            subscription_type: "Subscription".to_string(),
            mapping_templates: Default::default(),
            data_sources: Default::default(),
            subscriptions: Default::default(),
            batching: Default::default(),
            base_dir: PathBuf::from("."),
        }
    }
}

impl Config {
    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the configuration file at `path`. Template paths resolve against its directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_toml(&input)?;
        if let Some(parent) = path.parent() {
            config.base_dir = parent.to_path_buf();
        }

        tracing::debug!(
            path = %path.display(),
            mapping_templates = config.mapping_templates.len(),
            data_sources = config.data_sources.len(),
            "loaded configuration"
        );

        Ok(config)
    }

    #[must_use]
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    /// Every mapping template must name a declared data source, and a field may only be
    /// mapped once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for data_source in &self.data_sources {
            if !names.insert(data_source.name.as_str()) {
                return Err(ConfigError::DuplicateDataSource(data_source.name.clone()));
            }
        }

        let mut coordinates = HashSet::new();
        for template in &self.mapping_templates {
            let coordinate = template.coordinate();

            if !names.contains(template.data_source.as_str()) {
                return Err(ConfigError::UnknownDataSource {
                    coordinate,
                    data_source: template.data_source.clone(),
                });
            }

            if !coordinates.insert(coordinate.clone()) {
                return Err(ConfigError::DuplicateField(coordinate));
            }
        }

        Ok(())
    }

    pub fn template_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.base_dir.join(&self.mapping_templates_location).join(relative)
    }

    pub fn data_source(&self, name: &str) -> Option<&DataSource> {
        self.data_sources.iter().find(|data_source| data_source.name == name)
    }
}

/// Binds one field to a data source through a pair of templates.
#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingTemplate {
    pub data_source: String,
    /// Parent type of the field
    #[serde(rename = "type")]
    pub type_name: String,
    pub field: String,
    /// Request template file, relative to `mapping_templates_location`
    pub request: PathBuf,
    /// Response template file, relative to `mapping_templates_location`
    pub response: PathBuf,
}

impl MappingTemplate {
    /// `Parent.field`, the key batches and resolvers are registered under.
    pub fn coordinate(&self) -> String {
        format!("{}.{}", self.type_name, self.field)
    }
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataSource {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DataSourceKind,
    /// Passed untouched to the adapter serving this kind of data source.
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSourceKind {
    #[serde(alias = "KEY_VALUE_STORE")]
    AmazonDynamodb,
    #[serde(alias = "FUNCTION")]
    AwsLambda,
    #[serde(alias = "SEARCH")]
    AmazonElasticsearch,
    Http,
    None,
}

impl DataSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSourceKind::AmazonDynamodb => "AMAZON_DYNAMODB",
            DataSourceKind::AwsLambda => "AWS_LAMBDA",
            DataSourceKind::AmazonElasticsearch => "AMAZON_ELASTICSEARCH",
            DataSourceKind::Http => "HTTP",
            DataSourceKind::None => "NONE",
        }
    }
}

impl fmt::Display for DataSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SubscriptionsConfig {
    /// Time a client has to subscribe to a registered topic. Default: 2 minutes.
    #[serde(deserialize_with = "duration_str::deserialize_option_duration")]
    pub connect_timeout: Option<Duration>,
    /// Topic expiry advertised to clients. Default: 100 minutes.
    #[serde(deserialize_with = "duration_str::deserialize_option_duration")]
    pub topic_expiry: Option<Duration>,
    /// URL clients connect to for receiving topic messages
    pub endpoint: Option<String>,
    /// Subscription field name to the mutation fields it listens to.
    pub fields: BTreeMap<String, Vec<String>>,
}

impl SubscriptionsConfig {
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn topic_expiry(&self) -> Duration {
        self.topic_expiry.unwrap_or(DEFAULT_TOPIC_EXPIRY)
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_deref().unwrap_or(DEFAULT_SUBSCRIPTION_ENDPOINT)
    }

    /// Mutation fields whose results are delivered to `subscription_field`.
    pub fn mutations_for(&self, subscription_field: &str) -> &[String] {
        self.fields.get(subscription_field).map(Vec::as_slice).unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchingConfig {
    /// How long a batch waits for more requests before dispatching. Default: 1ms. A zero
    /// delay flushes as soon as the runtime yields back to the scheduler.
    #[serde(deserialize_with = "duration_str::deserialize_option_duration")]
    pub delay: Option<Duration>,
}

impl BatchingConfig {
    pub fn delay(&self) -> Duration {
        self.delay.unwrap_or(DEFAULT_BATCH_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use insta::assert_snapshot;

    use super::*;

    const PRICES: &str = indoc! {r#"
        [[data_sources]]
        name = "Prices"
        type = "AMAZON_DYNAMODB"
        config = { table_name = "prices" }

        [[data_sources]]
        name = "Passthrough"
        type = "NONE"

        [[mapping_templates]]
        data_source = "Prices"
        type = "Mutation"
        field = "addPrice"
        request = "Mutation.addPrice.request.vtl"
        response = "Mutation.addPrice.response.vtl"
    "#};

    #[test]
    fn defaults() {
        let config = Config::from_toml("").unwrap();

        assert_eq!(config.mutation_type, "Mutation");
        assert_eq!(config.subscription_type, "Subscription");
        assert_eq!(config.subscriptions.connect_timeout(), Duration::from_secs(120));
        assert_eq!(config.subscriptions.topic_expiry(), Duration::from_secs(6000));
        assert_eq!(config.subscriptions.endpoint(), "ws://localhost:20002/");
        assert_eq!(config.batching.delay(), Duration::from_millis(1));
        assert_eq!(
            config.template_path("Query.a.request.vtl"),
            Path::new("./mapping-templates/Query.a.request.vtl")
        );
    }

    #[test]
    fn data_sources_and_templates() {
        let config = Config::from_toml(PRICES).unwrap();

        let prices = config.data_source("Prices").unwrap();
        assert_eq!(prices.kind, DataSourceKind::AmazonDynamodb);
        assert_eq!(prices.config, serde_json::json!({ "table_name": "prices" }));

        let passthrough = config.data_source("Passthrough").unwrap();
        assert_eq!(passthrough.kind, DataSourceKind::None);
        assert_eq!(passthrough.config, serde_json::Value::Null);

        assert_eq!(config.mapping_templates[0].coordinate(), "Mutation.addPrice");
    }

    #[test]
    fn generic_kind_names() {
        let input = indoc! {r#"
            [[data_sources]]
            name = "Fn"
            type = "FUNCTION"
        "#};

        let config = Config::from_toml(input).unwrap();
        assert_eq!(config.data_sources[0].kind, DataSourceKind::AwsLambda);
    }

    #[test]
    fn subscriptions() {
        let input = indoc! {r#"
            [subscriptions]
            connect_timeout = "5s"
            topic_expiry = "1h"
            endpoint = "ws://127.0.0.1:9000/"

            [subscriptions.fields]
            onPrice = ["addPrice", "updatePrice"]

            [batching]
            delay = "5ms"
        "#};

        let config = Config::from_toml(input).unwrap();

        assert_eq!(config.subscriptions.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.subscriptions.topic_expiry(), Duration::from_secs(3600));
        assert_eq!(config.subscriptions.endpoint(), "ws://127.0.0.1:9000/");
        assert_eq!(config.subscriptions.mutations_for("onPrice"), ["addPrice", "updatePrice"]);
        assert!(config.subscriptions.mutations_for("onOther").is_empty());
        assert_eq!(config.batching.delay(), Duration::from_millis(5));
    }

    #[test]
    fn unknown_data_source() {
        let input = indoc! {r#"
            [[mapping_templates]]
            data_source = "Missing"
            type = "Query"
            field = "user"
            request = "Query.user.request.vtl"
            response = "Query.user.response.vtl"
        "#};

        let error = Config::from_toml(input).unwrap_err();
        assert_snapshot!(error, @"mapping template for Query.user refers to an unknown data source `Missing`");
    }

    #[test]
    fn duplicate_field() {
        let input = format!(
            "{PRICES}\n{}",
            indoc! {r#"
                [[mapping_templates]]
                data_source = "Passthrough"
                type = "Mutation"
                field = "addPrice"
                request = "a.vtl"
                response = "b.vtl"
            "#}
        );

        let error = Config::from_toml(&input).unwrap_err();
        assert_snapshot!(error, @"Mutation.addPrice has more than one mapping template");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let error = Config::from_toml("unknown = true").unwrap_err();
        assert!(matches!(error, ConfigError::Toml(_)));
    }

    #[test]
    fn load_resolves_templates_next_to_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emulator.toml");
        std::fs::write(&path, PRICES).unwrap();

        let config = Config::load(&path).unwrap();

        assert_eq!(
            config.template_path("Mutation.addPrice.request.vtl"),
            dir.path().join("mapping-templates").join("Mutation.addPrice.request.vtl")
        );
    }

    #[test]
    fn load_missing_file() {
        let error = Config::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(error, ConfigError::Io { .. }));
    }
}
