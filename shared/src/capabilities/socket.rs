use crux_core::capability::{Capability, CapabilityContext, Operation};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::model::ConnectionId;

/// Websocket endpoint including the access token query parameter.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTarget {
    url: Url,
}

impl StreamTarget {
    #[must_use]
    pub fn new(base: &Url, token: &str) -> Self {
        let mut url = base.clone();
        url.query_pairs_mut().append_pair("token", token);
        Self { url }
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl fmt::Debug for StreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut shown = self.url.clone();
        shown.set_query(Some("token=[REDACTED]"));
        f.debug_tuple("StreamTarget").field(&shown.as_str()).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocketOperation {
    /// Open a connection. The shell resolves this request once per
    /// [`SocketEvent`] until the connection ends.
    Connect {
        connection: ConnectionId,
        target: StreamTarget,
    },
    Send {
        connection: ConnectionId,
        text: String,
    },
    Close {
        connection: ConnectionId,
    },
}

impl SocketOperation {
    #[must_use]
    pub const fn connection(&self) -> ConnectionId {
        match self {
            Self::Connect { connection, .. }
            | Self::Send { connection, .. }
            | Self::Close { connection } => *connection,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocketEvent {
    Opened,
    Message { text: String },
    Closed { reason: Option<String> },
    Failed { error: String },
}

impl SocketEvent {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed { .. } | Self::Failed { .. })
    }
}

impl Operation for SocketOperation {
    type Output = SocketEvent;
}

pub struct Socket<Ev> {
    context: CapabilityContext<SocketOperation, Ev>,
}

impl<Ev> Clone for Socket<Ev> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
        }
    }
}

impl<Ev> Capability<Ev> for Socket<Ev> {
    type Operation = SocketOperation;
    type MappedSelf<MappedEv> = Socket<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Socket::new(self.context.map_event(f))
    }
}

impl<Ev> Socket<Ev>
where
    Ev: 'static,
{
    pub fn new(context: CapabilityContext<SocketOperation, Ev>) -> Self {
        Self { context }
    }

    /// Connect and turn everything the connection reports into events,
    /// ending after it closes or fails.
    pub fn connect<F>(&self, connection: ConnectionId, target: StreamTarget, make_event: F)
    where
        F: Fn(ConnectionId, SocketEvent) -> Ev + Send + Sync + 'static,
    {
        let context = self.context.clone();
        self.context.spawn(async move {
            let mut events =
                context.stream_from_shell(SocketOperation::Connect { connection, target });
            while let Some(event) = events.next().await {
                let last = event.is_terminal();
                context.update_app(make_event(connection, event));
                if last {
                    break;
                }
            }
        });
    }

    pub fn send(&self, connection: ConnectionId, text: String) {
        let context = self.context.clone();
        self.context.spawn(async move {
            context
                .notify_shell(SocketOperation::Send { connection, text })
                .await;
        });
    }

    pub fn close(&self, connection: ConnectionId) {
        let context = self.context.clone();
        self.context.spawn(async move {
            context
                .notify_shell(SocketOperation::Close { connection })
                .await;
        });
    }
}
