//! In-process transports for exercising delivery without sockets.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use octofhir_core::IdGenerator;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::channel_manager::{DeliveryAck, DeliveryReceipt, NotificationTransport};
use crate::subscriptions::error::TransportError;
use crate::subscriptions::payload::{JsonResourceCodec, NotificationFrame};
use crate::subscriptions::storage::InMemorySubscriptionStore;
use crate::subscriptions::subscription_manager::SubscriptionManager;
use crate::subscriptions::types::ChannelType;

pub(crate) fn test_registry() -> Arc<SubscriptionManager> {
    Arc::new(SubscriptionManager::new(
        Arc::new(InMemorySubscriptionStore::new()),
        Arc::new(IdGenerator::default()),
        Arc::new(JsonResourceCodec),
        vec![ChannelType::WebSocket],
    ))
}

/// Records every frame it is given.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    frames: Mutex<Vec<NotificationFrame>>,
    fail_with: Mutex<Option<TransportError>>,
    handshake_fails: bool,
    stall: bool,
    unacked: Mutex<Vec<oneshot::Sender<DeliveryAck>>>,
    closed: AtomicBool,
}

impl RecordingTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn failing_handshake() -> Arc<Self> {
        Arc::new(Self {
            handshake_fails: true,
            ..Self::default()
        })
    }

    /// Accepts frames but never acknowledges them.
    pub(crate) fn stalled() -> Arc<Self> {
        Arc::new(Self {
            stall: true,
            ..Self::default()
        })
    }

    pub(crate) fn fail_sends(&self, error: TransportError) {
        *self.fail_with.lock() = Some(error);
    }

    pub(crate) fn bodies(&self) -> Vec<String> {
        self.frames.lock().iter().map(|f| f.body.clone()).collect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    fn channel_type(&self) -> ChannelType {
        ChannelType::WebSocket
    }

    async fn open(&self) -> Result<(), TransportError> {
        if self.handshake_fails {
            return Err(TransportError::Io("handshake refused".into()));
        }
        Ok(())
    }

    fn send(&self, frame: NotificationFrame) -> Result<DeliveryReceipt, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if let Some(e) = self.fail_with.lock().clone() {
            return Err(e);
        }
        self.frames.lock().push(frame);
        if self.stall {
            let (tx, receipt) = DeliveryReceipt::pending();
            self.unacked.lock().push(tx);
            return Ok(receipt);
        }
        Ok(DeliveryReceipt::delivered())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
