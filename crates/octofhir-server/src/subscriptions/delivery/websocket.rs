//! WebSocket notification transport.
//!
//! Two endpoints share one connection loop:
//! - `/fhir/Subscription/{id}/$events` binds to the subscription in the path.
//! - `/websocket` waits for the client to send `bind <id>` and answers
//!   `bound <id>` or `error <message>`.
//!
//! The connection task owns the socket. Frames arrive through a bounded
//! queue, are written in order, and each write is acknowledged back to the
//! pusher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, interval_at};
use tokio_util::sync::CancellationToken;

use super::channel_manager::{ChannelHandle, ChannelManager, DeliveryAck, DeliveryReceipt, NotificationTransport};
use crate::config::WebSocketConfig;
use crate::subscriptions::error::TransportError;
use crate::subscriptions::payload::NotificationFrame;
use crate::subscriptions::types::ChannelType;

/// Message queued for a connected WebSocket client.
#[derive(Debug)]
pub enum WebSocketMessage {
    /// Notification text and where to report the write result
    Frame {
        text: String,
        ack: oneshot::Sender<DeliveryAck>,
    },
    Close,
}

/// Handle the channel manager uses to reach one WebSocket connection.
#[derive(Debug)]
pub struct WebSocketTransport {
    sender: mpsc::Sender<WebSocketMessage>,
    cancel: CancellationToken,
}

impl WebSocketTransport {
    /// Create a transport and the queue its connection task drains.
    pub fn new(buffer: usize) -> (Arc<Self>, mpsc::Receiver<WebSocketMessage>, CancellationToken) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let cancel = CancellationToken::new();
        let transport = Arc::new(Self {
            sender,
            cancel: cancel.clone(),
        });
        (transport, receiver, cancel)
    }
}

#[async_trait]
impl NotificationTransport for WebSocketTransport {
    fn channel_type(&self) -> ChannelType {
        ChannelType::WebSocket
    }

    async fn open(&self) -> Result<(), TransportError> {
        // The HTTP upgrade is the handshake; it has already completed.
        if self.cancel.is_cancelled() || self.sender.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn send(&self, frame: NotificationFrame) -> Result<DeliveryReceipt, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let (ack, receipt) = DeliveryReceipt::pending();
        self.sender
            .try_send(WebSocketMessage::Frame {
                text: frame.body,
                ack,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
            })?;
        Ok(receipt)
    }

    fn close(&self) {
        let _ = self.sender.try_send(WebSocketMessage::Close);
        self.cancel.cancel();
    }
}

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Serve `/fhir/Subscription/{id}/$events`.
pub async fn handle_subscription_websocket(
    socket: WebSocket,
    subscription_id: String,
    channels: Arc<ChannelManager>,
    config: WebSocketConfig,
) {
    let (mut sink, stream) = socket.split();
    let (transport, queue, cancel) = WebSocketTransport::new(config.outbound_buffer);

    let handle = match channels.attach(&subscription_id, transport).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::info!(subscription_id = %subscription_id, error = %e, "WebSocket attach rejected");
            let _ = sink.send(Message::Text(format!("error {e}").into())).await;
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };

    if sink
        .send(Message::Text(format!("bound {subscription_id}").into()))
        .await
        .is_err()
    {
        channels.detach_attachment(&handle);
        return;
    }

    run_connection(sink, stream, queue, cancel, config.heartbeat(), &handle).await;
    channels.detach_attachment(&handle);
}

/// Serve `/websocket`: wait for `bind <id>`, then deliver.
pub async fn handle_bind_websocket(
    socket: WebSocket,
    channels: Arc<ChannelManager>,
    config: WebSocketConfig,
) {
    let (mut sink, mut stream) = socket.split();

    let (handle, queue, cancel) = loop {
        let text = match stream.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Ping(data))) => {
                if sink.send(Message::Pong(data)).await.is_err() {
                    return;
                }
                continue;
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => continue,
        };

        let Some(subscription_id) = parse_bind(text.as_str()) else {
            if sink
                .send(Message::Text("error Invalid bind request".into()))
                .await
                .is_err()
            {
                return;
            }
            continue;
        };

        let (transport, queue, cancel) = WebSocketTransport::new(config.outbound_buffer);
        match channels.attach(subscription_id, transport).await {
            Ok(handle) => {
                if sink
                    .send(Message::Text(format!("bound {subscription_id}").into()))
                    .await
                    .is_err()
                {
                    channels.detach_attachment(&handle);
                    return;
                }
                break (handle, queue, cancel);
            }
            Err(e) => {
                tracing::info!(subscription_id = %subscription_id, error = %e, "WebSocket bind rejected");
                if sink.send(Message::Text(format!("error {e}").into())).await.is_err() {
                    return;
                }
            }
        }
    };

    run_connection(sink, stream, queue, cancel, config.heartbeat(), &handle).await;
    channels.detach_attachment(&handle);
}

/// `bind <id>` with a non-empty id.
fn parse_bind(text: &str) -> Option<&str> {
    let id = text.trim().strip_prefix("bind ")?.trim();
    (!id.is_empty() && !id.contains(char::is_whitespace)).then_some(id)
}

async fn run_connection(
    mut sink: WsSink,
    mut stream: WsStream,
    mut queue: mpsc::Receiver<WebSocketMessage>,
    cancel: CancellationToken,
    heartbeat: Option<Duration>,
    handle: &ChannelHandle,
) {
    let subscription_id = handle.subscription_id();
    let mut heartbeat: Option<Interval> = heartbeat.map(|p| interval_at(Instant::now() + p, p));

    tracing::info!(
        subscription_id = %subscription_id,
        attachment_id = handle.attachment_id(),
        "WebSocket connection established for subscription"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }

            // Outgoing notifications, in queue order
            msg = queue.recv() => {
                match msg {
                    Some(WebSocketMessage::Frame { text, ack }) => {
                        let result = sink
                            .send(Message::Text(text.into()))
                            .await
                            .map_err(|e| TransportError::Io(e.to_string()));
                        let failed = result.is_err();
                        let _ = ack.send(result);
                        if failed {
                            tracing::debug!(subscription_id = %subscription_id, "Failed to write notification");
                            break;
                        }
                    }
                    Some(WebSocketMessage::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            // Incoming messages from the client
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!(subscription_id = %subscription_id, "Client closed WebSocket");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {
                        // Nothing else is expected once bound
                    }
                    Some(Err(e)) => {
                        tracing::debug!(subscription_id = %subscription_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }

            _ = tick(&mut heartbeat) => {
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    tracing::debug!(subscription_id = %subscription_id, "Failed to send heartbeat");
                    break;
                }
            }
        }
    }

    // Stop accepting frames; queued ones fail with `Closed` when dropped.
    cancel.cancel();
    queue.close();

    tracing::info!(
        subscription_id = %subscription_id,
        "WebSocket connection closed for subscription"
    );
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(body: &str) -> NotificationFrame {
        NotificationFrame {
            subscription_id: "1".into(),
            content_type: None,
            body: body.into(),
        }
    }

    #[test]
    fn bind_parsing() {
        assert_eq!(parse_bind("bind 5"), Some("5"));
        assert_eq!(parse_bind("  bind abc-1 \n"), Some("abc-1"));
        assert_eq!(parse_bind("bind "), None);
        assert_eq!(parse_bind("bind a b"), None);
        assert_eq!(parse_bind("subscribe 5"), None);
    }

    #[tokio::test]
    async fn frames_queue_in_order_and_ack() {
        let (transport, mut queue, _cancel) = WebSocketTransport::new(4);
        transport.open().await.unwrap();

        let first = transport.send(frame("a")).unwrap();
        let second = transport.send(frame("b")).unwrap();

        for expected in ["a", "b"] {
            match queue.recv().await.unwrap() {
                WebSocketMessage::Frame { text, ack } => {
                    assert_eq!(text, expected);
                    ack.send(Ok(())).unwrap();
                }
                WebSocketMessage::Close => panic!("unexpected close"),
            }
        }
        assert!(first.wait(Duration::from_secs(1)).await.is_ok());
        assert!(second.wait(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn full_queue_is_backpressure() {
        let (transport, _queue, _cancel) = WebSocketTransport::new(1);
        transport.send(frame("a")).unwrap();
        assert_eq!(
            transport.send(frame("b")).unwrap_err(),
            TransportError::Backpressure
        );
    }

    #[tokio::test]
    async fn close_fails_pending_frames() {
        let (transport, queue, cancel) = WebSocketTransport::new(4);
        let receipt = transport.send(frame("a")).unwrap();
        transport.close();
        assert!(cancel.is_cancelled());
        assert_eq!(transport.send(frame("b")).unwrap_err(), TransportError::Closed);
        assert!(transport.open().await.is_err());

        drop(queue);
        assert_eq!(
            receipt.wait(Duration::from_secs(1)).await,
            Err(TransportError::Closed)
        );
    }
}
