//! Subscription handle returned by transports.
//!
//! Each subscription gets its own copy of every matching message (broadcast
//! semantics). Delivery is at-least-once; consumers must be idempotent.

use tokio::sync::mpsc;

/// A subscription to a message stream.
///
/// ## Usage Pattern
///
/// ```ignore
/// let mut subscription = transport.subscribe_tenant(&tenant_id);
/// while let Some(message) = subscription.recv().await {
///     process(message).await?;
/// }
/// // `None`: the transport was dropped
/// ```
///
/// Subscriptions are meant for a single consumer task.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: mpsc::UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: mpsc::UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message. `None` once the sending side is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Take a message if one is ready, without waiting.
    pub fn try_recv(&mut self) -> Option<M> {
        self.receiver.try_recv().ok()
    }
}
