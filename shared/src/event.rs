use secrecy::SecretString;
use serde::Deserialize;
use tracing::debug;

use crate::capabilities::{HttpOutcome, KvError, KvKey, SocketEvent, StorageSnapshot};
use crate::config::ClientConfig;
use crate::model::{
    ConnectionId, FareId, GeoPosition, LocationResult, RequestId, Role, TimerId, Trip, TripRequest,
};
use crate::search::SearchField;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: SecretString::new(password.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub name: String,
    pub email: String,
    pub password: SecretString,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub enum Event {
    // --- Lifecycle ---
    /// Sent by the shell before anything else when it has its own settings.
    Configure(ClientConfig),
    AppStarted,
    StorageLoaded(StorageSnapshot),

    // --- Auth ---
    LoginRequested(Credentials),
    RegisterRequested(Registration),
    LogoutRequested,
    ShowLogin,
    ShowRegister,
    DismissToast,

    // --- Device ---
    PositionUpdated(GeoPosition),
    PositionFailed { reason: String },

    // --- Passenger ---
    OpenLocationSearch,
    CloseLocationSearch,
    SearchFieldFocused(SearchField),
    SearchQueryChanged(String),
    SearchResultChosen(usize),
    /// Confirm the pickup/destination chosen in the search sheet.
    LocationsConfirmed,
    DestinationConfirmed {
        pickup: LocationResult,
        destination: LocationResult,
    },
    FareSelected(FareId),
    RideConfirmed,
    BackToSearch,
    CancelSearching,
    DriverFound(Option<Trip>),
    TripFinished,

    // --- Driver ---
    DriverOnlineToggled(bool),
    TripRequestDismissed,

    // --- Backend push (passenger channel or driver stream) ---
    Backend(BackendEvent),

    // --- Shell callbacks ---
    HttpResponse {
        id: RequestId,
        result: Box<HttpOutcome>,
    },
    StorageWritten {
        key: KvKey,
        result: Result<(), KvError>,
    },
    TimerFired(TimerId),
    SocketOpened(ConnectionId),
    SocketMessage {
        connection: ConnectionId,
        text: String,
    },
    SocketClosed {
        connection: ConnectionId,
        reason: Option<String>,
    },
    SocketFailed {
        connection: ConnectionId,
        error: String,
    },
}

impl Event {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Event::Configure(_) => "configure",
            Event::AppStarted => "app_started",
            Event::StorageLoaded(_) => "storage_loaded",
            Event::LoginRequested(_) => "login_requested",
            Event::RegisterRequested(_) => "register_requested",
            Event::LogoutRequested => "logout_requested",
            Event::ShowLogin => "show_login",
            Event::ShowRegister => "show_register",
            Event::DismissToast => "dismiss_toast",
            Event::PositionUpdated(_) => "position_updated",
            Event::PositionFailed { .. } => "position_failed",
            Event::OpenLocationSearch => "open_location_search",
            Event::CloseLocationSearch => "close_location_search",
            Event::SearchFieldFocused(_) => "search_field_focused",
            Event::SearchQueryChanged(_) => "search_query_changed",
            Event::SearchResultChosen(_) => "search_result_chosen",
            Event::LocationsConfirmed => "locations_confirmed",
            Event::DestinationConfirmed { .. } => "destination_confirmed",
            Event::FareSelected(_) => "fare_selected",
            Event::RideConfirmed => "ride_confirmed",
            Event::BackToSearch => "back_to_search",
            Event::CancelSearching => "cancel_searching",
            Event::DriverFound(_) => "driver_found",
            Event::TripFinished => "trip_finished",
            Event::DriverOnlineToggled(_) => "driver_online_toggled",
            Event::TripRequestDismissed => "trip_request_dismissed",
            Event::Backend(_) => "backend",
            Event::HttpResponse { .. } => "http_response",
            Event::StorageWritten { .. } => "storage_written",
            Event::TimerFired(_) => "timer_fired",
            Event::SocketOpened(_) => "socket_opened",
            Event::SocketMessage { .. } => "socket_message",
            Event::SocketClosed { .. } => "socket_closed",
            Event::SocketFailed { .. } => "socket_failed",
        }
    }

    /// Lift a stream notification for `connection` into an app event.
    #[must_use]
    pub fn from_socket(connection: ConnectionId, event: SocketEvent) -> Self {
        match event {
            SocketEvent::Opened => Event::SocketOpened(connection),
            SocketEvent::Message { text } => Event::SocketMessage { connection, text },
            SocketEvent::Closed { reason } => Event::SocketClosed { connection, reason },
            SocketEvent::Failed { error } => Event::SocketFailed { connection, error },
        }
    }

    #[must_use]
    pub const fn is_user_initiated(&self) -> bool {
        matches!(
            self,
            Event::LoginRequested(_)
                | Event::RegisterRequested(_)
                | Event::LogoutRequested
                | Event::ShowLogin
                | Event::ShowRegister
                | Event::DismissToast
                | Event::OpenLocationSearch
                | Event::CloseLocationSearch
                | Event::SearchFieldFocused(_)
                | Event::SearchQueryChanged(_)
                | Event::SearchResultChosen(_)
                | Event::LocationsConfirmed
                | Event::DestinationConfirmed { .. }
                | Event::FareSelected(_)
                | Event::RideConfirmed
                | Event::BackToSearch
                | Event::CancelSearching
                | Event::DriverOnlineToggled(_)
                | Event::TripRequestDismissed
        )
    }
}

/// Messages pushed by the backend, `{"type": ..., "data": ...}` on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    DriverAssigned { trip: Option<Trip> },
    TripCompleted { trip: Option<Trip> },
    TripUpdated { trip: Trip },
    TripRequested(TripRequest),
    Unknown { kind: String },
}

#[derive(Deserialize)]
struct RawBackendMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct TripPayload {
    #[serde(default)]
    trip: Option<Trip>,
}

impl BackendEvent {
    pub const DRIVER_ASSIGNED: &'static str = "trip.event.driver_assigned";
    pub const TRIP_COMPLETED: &'static str = "trip.event.completed";
    pub const TRIP_UPDATED: &'static str = "trip.event.updated";
    pub const TRIP_REQUEST: &'static str = "driver.cmd.trip_request";

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let raw: RawBackendMessage = serde_json::from_str(text)?;
        let event = match raw.kind.as_str() {
            Self::DRIVER_ASSIGNED => Self::DriverAssigned {
                trip: Self::trip_of(raw.data)?,
            },
            Self::TRIP_COMPLETED => Self::TripCompleted {
                trip: Self::trip_of(raw.data)?,
            },
            Self::TRIP_UPDATED => {
                let payload: TripPayload = serde_json::from_value(raw.data)?;
                match payload.trip {
                    Some(trip) => Self::TripUpdated { trip },
                    None => {
                        debug!(kind = %raw.kind, "trip update without trip");
                        Self::Unknown {
                            kind: raw.kind.clone(),
                        }
                    }
                }
            }
            Self::TRIP_REQUEST => Self::TripRequested(serde_json::from_value(raw.data)?),
            _ => Self::Unknown {
                kind: raw.kind.clone(),
            },
        };
        Ok(event)
    }

    fn trip_of(data: serde_json::Value) -> Result<Option<Trip>, serde_json::Error> {
        if data.is_null() {
            return Ok(None);
        }
        let payload: TripPayload = serde_json::from_value(data)?;
        Ok(payload.trip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TripStatus;

    #[test]
    fn test_decode_driver_assigned() {
        let event = BackendEvent::decode(
            r#"{"type":"trip.event.driver_assigned","data":{"trip":{"id":"t1","status":"ACCEPTED"}}}"#,
        )
        .unwrap();
        match event {
            BackendEvent::DriverAssigned { trip: Some(trip) } => {
                assert_eq!(trip.id.as_str(), "t1");
                assert_eq!(trip.status, TripStatus::Accepted);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_completed_without_data() {
        let event = BackendEvent::decode(r#"{"type":"trip.event.completed"}"#).unwrap();
        assert_eq!(event, BackendEvent::TripCompleted { trip: None });
    }

    #[test]
    fn test_decode_trip_request() {
        let event = BackendEvent::decode(
            r#"{"type":"driver.cmd.trip_request","data":{
                "trip":{"id":"t9"},
                "pickup":{"latitude":-23.561,"longitude":-46.656}
            }}"#,
        )
        .unwrap();
        match event {
            BackendEvent::TripRequested(request) => {
                assert_eq!(request.trip.id.as_str(), "t9");
                assert!(request.pickup.is_some());
                assert!(request.fare.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_type() {
        let event = BackendEvent::decode(r#"{"type":"payment.event.settled","data":{}}"#).unwrap();
        assert_eq!(
            event,
            BackendEvent::Unknown {
                kind: "payment.event.settled".into()
            }
        );
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(BackendEvent::decode("not json").is_err());
        assert!(BackendEvent::decode(r#"{"data":{}}"#).is_err());
    }

    #[test]
    fn test_user_initiated_classification() {
        assert!(Event::RideConfirmed.is_user_initiated());
        assert!(!Event::TimerFired(TimerId(1)).is_user_initiated());
        assert_eq!(Event::TripFinished.name(), "trip_finished");
        assert!(!Event::Configure(ClientConfig::default()).is_user_initiated());
    }

    #[test]
    fn test_socket_notifications_keep_their_connection() {
        let connection = ConnectionId(4);
        assert!(matches!(
            Event::from_socket(connection, SocketEvent::Opened),
            Event::SocketOpened(ConnectionId(4))
        ));
        match Event::from_socket(connection, SocketEvent::Closed { reason: None }) {
            Event::SocketClosed { connection, reason } => {
                assert_eq!(connection, ConnectionId(4));
                assert!(reason.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::new("ana@example.com", "hunter2");
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
