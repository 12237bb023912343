pub mod config;
pub mod handlers;
pub mod observability;
pub mod resource_store;
pub mod server;
pub mod subscriptions;

pub use config::{AppConfig, LoggingConfig, ServerConfig, SubscriptionsConfig};
pub use observability::init_tracing;
pub use resource_store::{ResourceStore, StoredResource};
pub use server::{AppState, OctofhirServer, ServerBuilder, build_app};
pub use subscriptions::SubscriptionState;
