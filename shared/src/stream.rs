//! Realtime location stream for online drivers.
//!
//! `CLOSED -> CONNECTING -> OPEN -> CLOSED`. At most one connection exists;
//! events tagged with any other connection id are ignored. The heartbeat
//! timer lives exactly as long as the connection is open.

use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::capabilities::{Capabilities, StreamTarget};
use crate::event::Event;
use crate::model::{ConnectionId, GeoPosition, IdGen, SocketState, TimerId};
use crate::{AppError, ErrorKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("Sign in again to go online")]
    MissingCredential,
    #[error("Waiting for your location before going online")]
    PositionUnavailable,
    #[error("Going online is not available right now")]
    NotConfigured,
}

impl From<StreamError> for AppError {
    fn from(e: StreamError) -> Self {
        let kind = match e {
            StreamError::MissingCredential => ErrorKind::Authentication,
            StreamError::PositionUnavailable => ErrorKind::Location,
            StreamError::NotConfigured => ErrorKind::Stream,
        };
        AppError::new(kind, e.to_string())
    }
}

#[derive(Debug)]
pub struct LocationStream {
    endpoint: Option<Url>,
    heartbeat_ms: u64,
    socket: SocketState,
    connection: Option<ConnectionId>,
    heartbeat: Option<TimerId>,
    sent: u64,
}

impl LocationStream {
    #[must_use]
    pub fn new(endpoint: Option<Url>, heartbeat_ms: u64) -> Self {
        Self {
            endpoint,
            heartbeat_ms,
            socket: SocketState::Closed,
            connection: None,
            heartbeat: None,
            sent: 0,
        }
    }

    /// Applies to the next connection; a live one keeps its settings.
    pub fn reconfigure(&mut self, endpoint: Url, heartbeat_ms: u64) {
        self.endpoint = Some(endpoint);
        self.heartbeat_ms = heartbeat_ms;
    }

    #[must_use]
    pub const fn socket(&self) -> SocketState {
        self.socket
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        !matches!(self.socket, SocketState::Closed)
    }

    #[must_use]
    pub const fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    #[must_use]
    pub const fn heartbeat_timer(&self) -> Option<TimerId> {
        self.heartbeat
    }

    #[must_use]
    pub const fn messages_sent(&self) -> u64 {
        self.sent
    }

    pub fn start(
        &mut self,
        token: Option<&str>,
        position: Option<&GeoPosition>,
        ids: &mut IdGen,
        caps: &Capabilities,
    ) -> Result<(), StreamError> {
        if self.is_active() {
            debug!("stream already running");
            return Ok(());
        }
        let token = token.ok_or(StreamError::MissingCredential)?;
        position.ok_or(StreamError::PositionUnavailable)?;
        let endpoint = self.endpoint.as_ref().ok_or(StreamError::NotConfigured)?;

        let connection: ConnectionId = ids.next();
        let target = StreamTarget::new(endpoint, token);
        info!(%connection, "opening location stream");
        self.connection = Some(connection);
        self.socket = SocketState::Connecting;
        caps.socket.connect(connection, target, Event::from_socket);
        Ok(())
    }

    /// Returns whether the event was for the live connection.
    pub fn opened(
        &mut self,
        connection: ConnectionId,
        position: Option<&GeoPosition>,
        ids: &mut IdGen,
        caps: &Capabilities,
    ) -> bool {
        if self.connection != Some(connection) || self.socket != SocketState::Connecting {
            debug!(%connection, "open event for stale connection ignored");
            return false;
        }

        info!(%connection, "location stream open");
        self.socket = SocketState::Open;
        if let Some(position) = position {
            self.send(position, caps);
        }

        let timer: TimerId = ids.next();
        self.heartbeat = Some(timer);
        caps.timer.every(timer, self.heartbeat_ms, Event::TimerFired);
        true
    }

    pub fn position_changed(&mut self, position: &GeoPosition, caps: &Capabilities) {
        self.send(position, caps);
    }

    /// Returns false when the timer is not the heartbeat.
    pub fn heartbeat_fired(
        &mut self,
        timer: TimerId,
        position: Option<&GeoPosition>,
        caps: &Capabilities,
    ) -> bool {
        if self.heartbeat != Some(timer) {
            return false;
        }
        if let Some(position) = position {
            self.send(position, caps);
        }
        true
    }

    /// Close the connection if there is one. Safe to call repeatedly.
    pub fn stop(&mut self, caps: &Capabilities) -> bool {
        if !self.is_active() {
            return false;
        }
        if let Some(connection) = self.connection.take() {
            info!(%connection, sent = self.sent, "closing location stream");
            caps.socket.close(connection);
        }
        self.teardown(caps);
        true
    }

    /// The transport closed or failed underneath us. Returns whether it was
    /// the live connection.
    pub fn dropped(
        &mut self,
        connection: ConnectionId,
        reason: &str,
        caps: &Capabilities,
    ) -> bool {
        if self.connection != Some(connection) {
            debug!(%connection, "close event for stale connection ignored");
            return false;
        }
        warn!(%connection, reason, "location stream dropped");
        self.connection = None;
        self.teardown(caps);
        true
    }

    fn teardown(&mut self, caps: &Capabilities) {
        if let Some(id) = self.heartbeat.take() {
            caps.timer.cancel(id);
        }
        self.socket = SocketState::Closed;
    }

    fn send(&mut self, position: &GeoPosition, caps: &Capabilities) {
        let (SocketState::Open, Some(connection)) = (self.socket, self.connection) else {
            return;
        };
        match serde_json::to_string(&position.coords) {
            Ok(text) => {
                self.sent += 1;
                debug!(%connection, "position sent");
                caps.socket.send(connection, text);
            }
            Err(e) => warn!(error = %e, "failed to encode position"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::{socket_ops, take_sockets, take_timers, timer_ops, Harness};
    use crate::capabilities::{SocketEvent, SocketOperation, TimerOperation};
    use crate::model::Role;

    fn here() -> GeoPosition {
        GeoPosition::new(-23.561, -46.656, 1).unwrap()
    }

    fn sends(ops: &[&SocketOperation]) -> usize {
        ops.iter()
            .filter(|op| matches!(op, SocketOperation::Send { .. }))
            .count()
    }

    fn stream(h: &Harness) -> &LocationStream {
        h.model.driver.stream()
    }

    /// A signed-in driver with a known position who just asked to go online.
    fn connecting() -> (Harness, crux_core::Request<SocketOperation>) {
        let mut h = Harness::signed_in(Role::Driver);
        h.send(Event::PositionUpdated(here()));
        let mut effects = h.send(Event::DriverOnlineToggled(true));
        let connect = take_sockets(&mut effects).remove(0);
        (h, connect)
    }

    #[test]
    fn test_start_requires_token_and_position() {
        let mut h = Harness::signed_in(Role::Driver);
        let effects = h.send(Event::DriverOnlineToggled(true));
        assert!(socket_ops(&effects).is_empty());
        assert_eq!(stream(&h).socket(), SocketState::Closed);

        let mut s = LocationStream::new(None, 10_000);
        let mut ids = IdGen::default();
        let caps: &Capabilities = h.app.as_ref();
        assert_eq!(
            s.start(None, Some(&here()), &mut ids, caps),
            Err(StreamError::MissingCredential)
        );
        assert_eq!(
            s.start(Some("at"), None, &mut ids, caps),
            Err(StreamError::PositionUnavailable)
        );
        assert_eq!(
            s.start(Some("at"), Some(&here()), &mut ids, caps),
            Err(StreamError::NotConfigured)
        );
        assert!(!s.is_active());
    }

    #[test]
    fn test_connect_carries_token() {
        let (h, connect) = connecting();
        match &connect.operation {
            SocketOperation::Connect { connection, target } => {
                assert_eq!(Some(*connection), stream(&h).connection());
                assert!(target.as_str().ends_with("/driver/stream?token=at"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(stream(&h).socket(), SocketState::Connecting);
    }

    #[test]
    fn test_open_sends_immediately_then_heartbeats() {
        let (mut h, mut connect) = connecting();
        let effects = h.send(Event::PositionUpdated(here()));
        assert_eq!(sends(&socket_ops(&effects)), 0, "nothing is sent while connecting");

        let mut effects = h.resolve(&mut connect, SocketEvent::Opened);
        assert_eq!(stream(&h).socket(), SocketState::Open);
        assert_eq!(sends(&socket_ops(&effects)), 1);
        let heartbeat = stream(&h).heartbeat_timer().unwrap();
        let mut timer = take_timers(&mut effects).remove(0);
        assert_eq!(timer.operation, TimerOperation::every(heartbeat, 10_000));

        let first = h.fire(&mut timer);
        let second = h.fire(&mut timer);
        assert_eq!(sends(&socket_ops(&first)) + sends(&socket_ops(&second)), 2);
        assert_eq!(stream(&h).messages_sent(), 3);
    }

    #[test]
    fn test_outbound_payload_shape() {
        let (mut h, mut connect) = connecting();
        let effects = h.resolve(&mut connect, SocketEvent::Opened);
        let text = socket_ops(&effects)
            .into_iter()
            .find_map(|op| match op {
                SocketOperation::Send { text, .. } => Some(text.clone()),
                _ => None,
            })
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"latitude": -23.561, "longitude": -46.656})
        );
    }

    #[test]
    fn test_stop_twice_closes_once() {
        let (mut h, mut connect) = connecting();
        h.resolve(&mut connect, SocketEvent::Opened);

        let mut effects = h.send(Event::DriverOnlineToggled(false));
        effects.extend(h.send(Event::DriverOnlineToggled(false)));

        let closes = socket_ops(&effects)
            .into_iter()
            .filter(|op| matches!(op, SocketOperation::Close { .. }))
            .count();
        assert_eq!(closes, 1);
        assert!(timer_ops(&effects)
            .into_iter()
            .any(|op| matches!(op, TimerOperation::Cancel { .. })));
        assert!(stream(&h).heartbeat_timer().is_none());
        assert_eq!(stream(&h).socket(), SocketState::Closed);
    }

    #[test]
    fn test_remote_close_stops_sending() {
        let (mut h, mut connect) = connecting();
        let mut effects = h.resolve(&mut connect, SocketEvent::Opened);
        let heartbeat = stream(&h).heartbeat_timer().unwrap();
        let mut timer = take_timers(&mut effects).remove(0);

        let effects = h.resolve(
            &mut connect,
            SocketEvent::Closed {
                reason: Some("server going away".into()),
            },
        );
        assert_eq!(
            timer_ops(&effects),
            vec![&TimerOperation::Cancel { id: heartbeat }]
        );
        assert!(socket_ops(&effects).is_empty(), "no close for a dropped socket");

        let mut effects = h.send(Event::PositionUpdated(here()));
        effects.extend(h.fire(&mut timer));
        assert_eq!(sends(&socket_ops(&effects)), 0);
        assert_eq!(stream(&h).socket(), SocketState::Closed);
    }

    #[test]
    fn test_stale_connection_events_ignored() {
        let (mut h, mut old) = connecting();
        h.send(Event::DriverOnlineToggled(false));
        let mut effects = h.send(Event::DriverOnlineToggled(true));
        let current = take_sockets(&mut effects).remove(0);
        assert_ne!(old.operation.connection(), current.operation.connection());

        h.resolve(&mut old, SocketEvent::Opened);
        assert_eq!(stream(&h).socket(), SocketState::Connecting);
        h.resolve(&mut old, SocketEvent::Failed { error: "late".into() });
        assert_eq!(stream(&h).socket(), SocketState::Connecting);
        assert!(h.model.driver.is_online());
    }

    #[test]
    fn test_second_start_is_noop() {
        let (mut h, _connect) = connecting();
        let effects = h.send(Event::DriverOnlineToggled(true));
        assert!(socket_ops(&effects).is_empty());
    }
}
