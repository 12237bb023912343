//! Notification delivery: the channel manager and the WebSocket transport.

pub mod channel_manager;
pub mod websocket;

#[cfg(test)]
pub(crate) mod testing;

pub use channel_manager::{
    ChannelHandle, ChannelManager, ChannelState, DeliveryAck, DeliveryReceipt,
    NotificationTransport, PendingDelivery,
};
pub use websocket::{WebSocketMessage, WebSocketTransport, handle_bind_websocket, handle_subscription_websocket};
