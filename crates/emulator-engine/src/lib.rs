//! Resolves GraphQL fields through mapping templates.
//!
//! Every field goes through the same steps: render the request template, send the request to
//! the data source (or coalesce it with its siblings when it asks for `BatchInvoke`), render
//! the response template, and publish the result when the field is a mutation.

mod batch;
mod context;
mod dispatch;
mod error;
mod pipeline;
mod pubsub;
mod resolvers;
mod template_cache;

pub use batch::BatchCoordinator;
pub use context::{FieldInfo, RequestContext};
pub use dispatch::{DataSourceAdapter, Dispatchers, PassthroughAdapter};
pub use error::{BatchError, BuildError, DispatchError, GraphqlError, PathSegment, ResolveError, TemplateLoadError};
pub use pipeline::{FieldBinding, ResolverPipeline, BATCH_INVOKE};
pub use pubsub::{InMemoryPubSub, PubSub};
pub use resolvers::{build_resolvers, FieldResolver, Resolver, ResolverMap, SubscriptionResolver};
pub use template_cache::TemplateCache;
