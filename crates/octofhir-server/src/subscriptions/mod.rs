//! Criteria-based FHIR subscriptions with WebSocket delivery.
//!
//! ## Architecture
//!
//! ```text
//! FHIR Write (POST/PUT)
//!        ↓
//! HookRegistry → SubscriptionHook
//!        ↓
//! DispatchCoordinator
//!        ↓
//! SubscriptionManager (active subscriptions for the resource type)
//!        ↓
//! EventMatcher (criteria against search parameter values)
//!        ↓
//! ChannelManager (one channel per subscription)
//!        ↓
//! WebSocket connection task
//! ```
//!
//! Clients register a `Subscription` resource with `criteria` such as
//! `Observation?subject=Patient/123`, then connect to
//! `/fhir/Subscription/{id}/$events`, or to `/websocket` and send
//! `bind {id}`. Each matching write produces one frame: the subscription id
//! when the subscription has no payload, otherwise the encoded resource.
//!
//! ## Configuration
//!
//! ```toml
//! [subscriptions]
//! enabled = true
//! max_delivery_failures = 3
//! supported_channels = ["websocket"]
//!
//! [subscriptions.store]
//! kind = "file"
//! path = "./data/subscriptions"
//!
//! [subscriptions.websocket]
//! heartbeat_secs = 30
//! send_timeout_ms = 5000
//! outbound_buffer = 64
//! ```

pub mod criteria;
pub mod delivery;
pub mod error;
pub mod event_matcher;
pub mod handlers;
pub mod hook;
pub mod payload;
pub mod storage;
pub mod subscription_manager;
pub mod types;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use octofhir_core::{IdGenerator, SearchParamCatalog};

use crate::config::{StoreKind, SubscriptionsConfig, WebSocketConfig};

pub use criteria::{Criteria, CriteriaBuilder, CriteriaError};
pub use delivery::{ChannelManager, ChannelState, NotificationTransport, WebSocketTransport};
pub use error::{ChannelError, DeliveryError, SubscriptionError, SubscriptionResult, TransportError};
pub use event_matcher::EventMatcher;
pub use hook::{DeliveryOutcome, DispatchCoordinator, DispatchSummary, SubscriptionHook};
pub use payload::{JsonResourceCodec, Notification, NotificationFrame, ResourceCodec};
pub use storage::{FileSubscriptionStore, InMemorySubscriptionStore, SubscriptionStore};
pub use subscription_manager::{SubscriptionManager, SubscriptionStatusListener};
pub use types::{
    ChannelType, PayloadEncoding, Subscription, SubscriptionRequest, SubscriptionStatus,
};

/// Everything the subscription endpoints and the write hook share.
#[derive(Clone)]
pub struct SubscriptionState {
    pub registry: Arc<SubscriptionManager>,
    pub channels: Arc<ChannelManager>,
    pub coordinator: Arc<DispatchCoordinator>,
    pub websocket: WebSocketConfig,
}

impl SubscriptionState {
    /// Build the engine from configuration and load persisted subscriptions.
    ///
    /// `ids` is shared with the resource write path so subscription ids and
    /// resource ids come from one sequence.
    pub async fn from_config(
        config: &SubscriptionsConfig,
        ids: Arc<IdGenerator>,
        base_url: Option<String>,
    ) -> SubscriptionResult<Self> {
        let store: Arc<dyn SubscriptionStore> = match config.store.kind {
            StoreKind::Memory => Arc::new(InMemorySubscriptionStore::new()),
            StoreKind::File => {
                let path = config.store.path.as_ref().ok_or_else(|| {
                    SubscriptionError::Internal("subscriptions.store.path is required".into())
                })?;
                Arc::new(FileSubscriptionStore::open(path.clone()).await?)
            }
        };

        let supported_channels = config
            .supported_channels
            .iter()
            .map(|c| c.parse::<ChannelType>())
            .collect::<Result<Vec<_>, _>>()?;

        let registry = Arc::new(SubscriptionManager::new(
            store,
            ids,
            Arc::new(JsonResourceCodec),
            supported_channels,
        ));
        let loaded = registry.reload().await?;

        let channels = ChannelManager::new(registry.clone(), config.websocket.send_timeout());
        let coordinator = DispatchCoordinator::new(
            registry.clone(),
            channels.clone(),
            Arc::new(SearchParamCatalog::with_defaults()),
            base_url,
            config.max_delivery_failures,
        );

        tracing::info!(
            store = ?config.store.kind,
            loaded,
            channels = ?config.supported_channels,
            "Subscription engine initialized"
        );

        Ok(Self {
            registry,
            channels,
            coordinator,
            websocket: config.websocket.clone(),
        })
    }

    /// Resource hook that feeds writes into the dispatcher.
    pub fn hook(&self) -> SubscriptionHook {
        SubscriptionHook::new(self.coordinator.clone())
    }

    pub fn router<S>(self) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        Router::new()
            .route(
                "/fhir/Subscription",
                post(handlers::create_subscription).get(handlers::list_subscriptions),
            )
            .route(
                "/fhir/Subscription/{id}",
                get(handlers::read_subscription)
                    .put(handlers::update_subscription)
                    .delete(handlers::delete_subscription),
            )
            .route(
                "/fhir/Subscription/{id}/$status",
                get(handlers::subscription_status),
            )
            .route(
                "/fhir/Subscription/{id}/$events",
                get(handlers::subscription_events_handler),
            )
            .route("/websocket", get(handlers::websocket_bind_handler))
            .route(
                "/websocket/{version}",
                get(handlers::websocket_bind_versioned_handler),
            )
            .with_state(self)
    }
}
