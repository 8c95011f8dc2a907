use emulator_engine::GraphqlError;

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("could not parse the subscription: {0}")]
    Parse(#[from] async_graphql_parser::Error),
    #[error("the document has no subscription operation")]
    NotASubscription,
    #[error("the document has several subscription operations")]
    AmbiguousOperation,
    #[error("subscriptions selecting several root fields are not supported: {}", .0.join(", "))]
    MultipleRootFields(Vec<String>),
    #[error("the request carries no `sub` claim to identify the client")]
    MissingClientId,
}

#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("unknown client {0}")]
    UnknownClient(String),
    #[error("client {client} has no subscription on topic {topic}")]
    UnknownTopic { client: String, topic: String },
    #[error("subscription failed: {}", first_message(.0))]
    Execution(Vec<GraphqlError>),
}

fn first_message(errors: &[GraphqlError]) -> &str {
    errors.first().map(|error| error.message.as_str()).unwrap_or("no error reported")
}
