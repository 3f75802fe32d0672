use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ChannelError;
use crate::event::{AgentEvent, ClientEvent, EventName, LinkEvent};

/// Channel namespaces combine this prefix with the plugin identifier.
pub const NAMESPACE_PREFIX: &str = "plugins/custom-plugins";

/// Stable address of the linking channel for one plugin instance.
pub fn namespace(plugin_id: &str) -> String {
    format!("{NAMESPACE_PREFIX}/{plugin_id}")
}

/// Sending half of a channel endpoint.
///
/// Sends are fire-and-forget: `Ok` only means the event was handed to the
/// transport, never that the peer acknowledged it.
#[derive(Debug, Clone)]
pub struct EventSender {
    namespace: String,
    tx: Option<mpsc::Sender<LinkEvent>>,
}

impl EventSender {
    pub async fn send(&self, event: LinkEvent) -> Result<(), ChannelError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| ChannelError::Closed(self.namespace.clone()))?;
        debug!(namespace = %self.namespace, name = %event.name, "sending event");
        tx.send(event)
            .await
            .map_err(|_| ChannelError::Disconnected(self.namespace.clone()))
    }

    pub async fn send_client(&self, event: ClientEvent) -> Result<(), ChannelError> {
        self.send(event.into_event()?).await
    }

    pub async fn send_agent(&self, event: AgentEvent) -> Result<(), ChannelError> {
        self.send(event.into_event()?).await
    }

    /// Idempotent. Further sends fail with [`ChannelError::Closed`].
    pub fn close(&mut self) {
        self.tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

/// Receiving half of a channel endpoint.
///
/// Events of the same name arrive in send order. When the peer drops the
/// transport the receiver yields exactly one synthetic `disconnect` event
/// and then `None` forever. After a local [`close`](Self::close) it yields
/// `None` immediately and never a synthetic disconnect.
#[derive(Debug)]
pub struct EventReceiver {
    namespace: String,
    rx: Option<mpsc::Receiver<LinkEvent>>,
    disconnect_notified: bool,
}

impl EventReceiver {
    pub async fn next(&mut self) -> Option<LinkEvent> {
        let rx = self.rx.as_mut()?;
        match rx.recv().await {
            Some(event) => Some(event),
            None => {
                // peer dropped the transport
                self.rx = None;
                if self.disconnect_notified {
                    None
                } else {
                    self.disconnect_notified = true;
                    debug!(namespace = %self.namespace, "transport dropped, delivering synthetic disconnect");
                    Some(LinkEvent::bare(EventName::Disconnect))
                }
            }
        }
    }

    /// Idempotent. No events are delivered after this returns.
    pub fn close(&mut self) {
        self.rx = None;
        self.disconnect_notified = true;
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

/// One side of a bidirectional linking channel.
#[derive(Debug)]
pub struct ChannelEndpoint {
    sender: EventSender,
    receiver: EventReceiver,
}

impl ChannelEndpoint {
    pub fn split(self) -> (EventSender, EventReceiver) {
        (self.sender, self.receiver)
    }

    pub fn namespace(&self) -> &str {
        self.sender.namespace()
    }
}

/// Build both ends of a linking channel addressed by `namespace`.
///
/// The first endpoint is conventionally the client side and the second the
/// backend agent side; the two are symmetric.
pub fn duplex(namespace: &str, capacity: usize) -> (ChannelEndpoint, ChannelEndpoint) {
    let (client_tx, agent_rx) = mpsc::channel(capacity);
    let (agent_tx, client_rx) = mpsc::channel(capacity);

    let client = ChannelEndpoint {
        sender: EventSender {
            namespace: namespace.to_string(),
            tx: Some(client_tx),
        },
        receiver: EventReceiver {
            namespace: namespace.to_string(),
            rx: Some(client_rx),
            disconnect_notified: false,
        },
    };
    let agent = ChannelEndpoint {
        sender: EventSender {
            namespace: namespace.to_string(),
            tx: Some(agent_tx),
        },
        receiver: EventReceiver {
            namespace: namespace.to_string(),
            rx: Some(agent_rx),
            disconnect_notified: false,
        },
    };
    (client, agent)
}
