use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{SocketEvent, StreamTarget};
use crate::model::ConnectionId;

use super::Inbound;

/// Outbound half of a live websocket. Dropping it closes the connection.
#[derive(Debug)]
pub struct SocketHandle {
    outgoing: UnboundedSender<Message>,
}

impl SocketHandle {
    pub fn open(connection: ConnectionId, target: &StreamTarget, inbound: UnboundedSender<Inbound>) -> Self {
        let (outgoing, queue) = mpsc::unbounded_channel();
        let url = target.as_str().to_string();
        tokio::spawn(run(connection, url, queue, inbound));
        Self { outgoing }
    }

    pub fn send(&self, text: String) -> bool {
        self.outgoing.send(Message::Text(text)).is_ok()
    }
}

fn report(inbound: &UnboundedSender<Inbound>, connection: ConnectionId, event: SocketEvent) {
    if inbound.send(Inbound::Socket { connection, event }).is_err() {
        debug!("core gone, dropping socket event");
    }
}

#[instrument(skip_all, fields(%connection))]
async fn run(
    connection: ConnectionId,
    url: String,
    mut queue: UnboundedReceiver<Message>,
    inbound: UnboundedSender<Inbound>,
) {
    let ws = match connect_async(url).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!(error = %e, "websocket connect failed");
            report(&inbound, connection, SocketEvent::Failed { error: e.to_string() });
            return;
        }
    };
    info!("websocket connected");
    report(&inbound, connection, SocketEvent::Opened);

    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            outgoing = queue.recv() => match outgoing {
                Some(message) => {
                    if let Err(e) = write.send(message).await {
                        warn!(error = %e, "websocket send failed");
                        report(&inbound, connection, SocketEvent::Failed { error: e.to_string() });
                        return;
                    }
                }
                None => {
                    // Closed by the core; it already knows.
                    if let Err(e) = write.send(Message::Close(None)).await {
                        debug!(error = %e, "close frame not delivered");
                    }
                    info!("websocket closed locally");
                    return;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    report(&inbound, connection, SocketEvent::Message { text });
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                    info!(reason = ?reason, "websocket closed by server");
                    report(&inbound, connection, SocketEvent::Closed { reason });
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "websocket read failed");
                    report(&inbound, connection, SocketEvent::Failed { error: e.to_string() });
                    return;
                }
                None => {
                    report(&inbound, connection, SocketEvent::Closed { reason: None });
                    return;
                }
            },
        }
    }
}
