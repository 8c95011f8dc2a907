//! Delivery of subscription events to transport clients.
//!
//! A client registers a subscription document and receives a topic. Once it subscribes to that
//! topic, every event of the subscription that matches the registered variables is published on
//! it through the [`Transport`].

mod document;
mod error;
mod executor;
mod filter;
mod router;

pub use document::{RootField, SubscriptionRequest};
pub use error::{RegisterError, SubscribeError};
pub use executor::{ResolverExecutor, SubscriptionExecutor, Transport};
pub use filter::should_publish;
pub use router::{Connection, Handshake, HandshakeExtensions, NewSubscription, RegisterResponse, SubscriptionRouter};
