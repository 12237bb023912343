//! Notification channels: one live transport per subscription.
//!
//! A channel moves `Disconnected → Connecting → Open → Closing → Closed`.
//! Pushing is split in two so the dispatcher can queue frames for many
//! subscriptions in write order and only then wait for client I/O:
//! [`ChannelManager::enqueue`] hands a complete frame to the transport
//! without blocking, [`ChannelManager::await_delivery`] waits for the write
//! to be acknowledged.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::subscriptions::error::{ChannelError, DeliveryError, TransportError};
use crate::subscriptions::payload::{Notification, NotificationFrame, ResourceCodec};
use crate::subscriptions::subscription_manager::{SubscriptionManager, SubscriptionStatusListener};
use crate::subscriptions::types::{ChannelType, PayloadEncoding, SubscriptionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of writing one frame.
pub type DeliveryAck = Result<(), TransportError>;

/// Resolves once the transport has written (or failed to write) a frame.
#[derive(Debug)]
pub struct DeliveryReceipt {
    rx: oneshot::Receiver<DeliveryAck>,
}

impl DeliveryReceipt {
    /// A receipt and the sender the transport acknowledges through.
    pub fn pending() -> (oneshot::Sender<DeliveryAck>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A receipt that is already acknowledged.
    pub fn delivered() -> Self {
        let (tx, receipt) = Self::pending();
        let _ = tx.send(Ok(()));
        receipt
    }

    /// Wait for the acknowledgement. A dropped sender means the transport
    /// closed before writing the frame.
    pub async fn wait(self, timeout: Duration) -> DeliveryAck {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
        }
    }
}

/// A long-lived connection that carries notification frames to a client.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    fn channel_type(&self) -> ChannelType;

    /// Complete the handshake with the client.
    async fn open(&self) -> Result<(), TransportError>;

    /// Queue one complete frame without blocking.
    fn send(&self, frame: NotificationFrame) -> Result<DeliveryReceipt, TransportError>;

    /// Ask the transport to shut down. Frames not yet written fail with
    /// [`TransportError::Closed`].
    fn close(&self);
}

struct Channel {
    subscription_id: String,
    attachment_id: u64,
    encoding: PayloadEncoding,
    state: Mutex<ChannelState>,
    transport: Arc<dyn NotificationTransport>,
}

impl Channel {
    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    fn shut_down(&self) {
        self.set_state(ChannelState::Closing);
        self.transport.close();
        self.set_state(ChannelState::Closed);
    }
}

/// Identifies one attachment of a transport to a subscription.
#[derive(Clone)]
pub struct ChannelHandle {
    channel: Arc<Channel>,
}

impl ChannelHandle {
    pub fn subscription_id(&self) -> &str {
        &self.channel.subscription_id
    }

    pub fn attachment_id(&self) -> u64 {
        self.channel.attachment_id
    }

    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("subscription_id", &self.channel.subscription_id)
            .field("attachment_id", &self.channel.attachment_id)
            .field("state", &self.channel.state())
            .finish()
    }
}

/// A frame handed to a transport, waiting for its acknowledgement.
pub struct PendingDelivery {
    channel: Arc<Channel>,
    receipt: DeliveryReceipt,
}

impl PendingDelivery {
    pub fn subscription_id(&self) -> &str {
        &self.channel.subscription_id
    }
}

pub struct ChannelManager {
    registry: Arc<SubscriptionManager>,
    codec: Arc<dyn ResourceCodec>,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
    send_timeout: Duration,
    next_attachment: AtomicU64,
}

impl ChannelManager {
    /// Create the manager and subscribe it to registry status changes.
    pub fn new(registry: Arc<SubscriptionManager>, send_timeout: Duration) -> Arc<Self> {
        let manager = Arc::new(Self {
            codec: registry.codec(),
            registry: registry.clone(),
            channels: Mutex::new(HashMap::new()),
            send_timeout,
            next_attachment: AtomicU64::new(1),
        });
        let listener: Weak<ChannelManager> = Arc::downgrade(&manager);
        registry.add_listener(listener);
        manager
    }

    /// Bind `transport` to an active subscription and open it.
    pub async fn attach(
        &self,
        subscription_id: &str,
        transport: Arc<dyn NotificationTransport>,
    ) -> Result<ChannelHandle, ChannelError> {
        let subscription = self
            .registry
            .get(subscription_id)
            .map_err(|_| ChannelError::SubscriptionNotFound(subscription_id.to_string()))?;
        if transport.channel_type() != subscription.channel_type {
            return Err(ChannelError::ChannelTypeMismatch {
                expected: subscription.channel_type.to_string(),
                transport: transport.channel_type().to_string(),
            });
        }

        let channel = {
            let mut channels = self.channels.lock();
            // Checked under the channel lock: a deactivation either happens
            // before this check or finds the channel and closes it.
            let current = self
                .registry
                .get(subscription_id)
                .map_err(|_| ChannelError::SubscriptionNotFound(subscription_id.to_string()))?;
            if current.status != SubscriptionStatus::Active {
                return Err(ChannelError::SubscriptionNotActive {
                    id: subscription_id.to_string(),
                    status: current.status.to_string(),
                });
            }
            if channels.contains_key(subscription_id) {
                return Err(ChannelError::AlreadyAttached(subscription_id.to_string()));
            }
            let channel = Arc::new(Channel {
                subscription_id: subscription_id.to_string(),
                attachment_id: self.next_attachment.fetch_add(1, Ordering::Relaxed),
                encoding: current.payload,
                state: Mutex::new(ChannelState::Connecting),
                transport,
            });
            channels.insert(subscription_id.to_string(), channel.clone());
            channel
        };

        if let Err(e) = channel.transport.open().await {
            self.remove_if_current(&channel);
            channel.shut_down();
            return Err(ChannelError::Handshake(e.to_string()));
        }

        {
            let mut state = channel.state.lock();
            if *state != ChannelState::Connecting {
                return Err(ChannelError::Handshake(
                    "channel closed during handshake".into(),
                ));
            }
            *state = ChannelState::Open;
        }

        tracing::info!(
            subscription_id = %subscription_id,
            attachment_id = channel.attachment_id,
            "Notification channel open"
        );
        Ok(ChannelHandle { channel })
    }

    /// Render and queue a notification on the subscription's channel.
    pub fn enqueue(
        &self,
        subscription_id: &str,
        notification: &Notification,
    ) -> Result<PendingDelivery, DeliveryError> {
        let channel = self
            .channels
            .lock()
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| DeliveryError::NotAttached(subscription_id.to_string()))?;
        if channel.state() != ChannelState::Open {
            return Err(DeliveryError::ChannelNotOpen(subscription_id.to_string()));
        }

        let frame = NotificationFrame::render(notification, channel.encoding, self.codec.as_ref())
            .map_err(DeliveryError::Encoding)?;

        match channel.transport.send(frame) {
            Ok(receipt) => Ok(PendingDelivery { channel, receipt }),
            Err(e) => {
                self.fail(&channel, &e);
                Err(DeliveryError::Transport(e))
            }
        }
    }

    /// Wait for a queued frame to be written.
    pub async fn await_delivery(&self, pending: PendingDelivery) -> Result<(), DeliveryError> {
        let PendingDelivery { channel, receipt } = pending;
        match receipt.wait(self.send_timeout).await {
            Ok(()) => {
                tracing::debug!(subscription_id = %channel.subscription_id, "Notification delivered");
                Ok(())
            }
            Err(e) => {
                self.fail(&channel, &e);
                Err(DeliveryError::Transport(e))
            }
        }
    }

    /// Deliver one notification and wait for the write.
    pub async fn push(
        &self,
        subscription_id: &str,
        notification: &Notification,
    ) -> Result<(), DeliveryError> {
        let pending = self.enqueue(subscription_id, notification)?;
        self.await_delivery(pending).await
    }

    /// Close whatever channel the subscription has. Returns whether one was open.
    pub fn detach(&self, subscription_id: &str) -> bool {
        let removed = self.channels.lock().remove(subscription_id);
        match removed {
            Some(channel) => {
                channel.shut_down();
                tracing::info!(subscription_id = %subscription_id, "Notification channel closed");
                true
            }
            None => false,
        }
    }

    /// Close the attachment `handle` names, leaving any newer one alone.
    pub fn detach_attachment(&self, handle: &ChannelHandle) {
        self.remove_if_current(&handle.channel);
        if handle.channel.state() != ChannelState::Closed {
            handle.channel.shut_down();
            tracing::debug!(
                subscription_id = %handle.channel.subscription_id,
                attachment_id = handle.channel.attachment_id,
                "Notification channel detached"
            );
        }
    }

    pub fn channel_state(&self, subscription_id: &str) -> ChannelState {
        self.channels
            .lock()
            .get(subscription_id)
            .map(|c| c.state())
            .unwrap_or(ChannelState::Disconnected)
    }

    /// Subscription ids with an open channel.
    pub fn open_channels(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .channels
            .lock()
            .values()
            .filter(|c| c.state() == ChannelState::Open)
            .map(|c| c.subscription_id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn fail(&self, channel: &Arc<Channel>, error: &TransportError) {
        tracing::warn!(
            subscription_id = %channel.subscription_id,
            error = %error,
            "Notification delivery failed, closing channel"
        );
        self.remove_if_current(channel);
        channel.shut_down();
    }

    fn remove_if_current(&self, channel: &Arc<Channel>) {
        let mut channels = self.channels.lock();
        if channels
            .get(&channel.subscription_id)
            .is_some_and(|c| c.attachment_id == channel.attachment_id)
        {
            channels.remove(&channel.subscription_id);
        }
    }
}

impl SubscriptionStatusListener for ChannelManager {
    fn on_status_changed(&self, subscription_id: &str, status: SubscriptionStatus) {
        if status != SubscriptionStatus::Active {
            self.detach(subscription_id);
        }
    }
}
