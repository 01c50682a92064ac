use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::CoordinateError;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(UserId);
typed_id!(TripId);
typed_id!(FareId);

// Handles the core hands to the shell. They are allocated from one counter
// so a stale completion can never alias a newer one.
macro_rules! sequence_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            #[must_use]
            pub const fn value(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

sequence_id!(RequestId);
sequence_id!(TimerId);
sequence_id!(ConnectionId);

#[derive(Debug, Clone, Default)]
pub struct IdGen {
    last: u64,
}

impl IdGen {
    pub fn next<T: From<u64>>(&mut self) -> T {
        self.last += 1;
        T::from(self.last)
    }
}

// --- Coordinates: validated, NaN-safe ---

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct LatLon {
    #[serde(rename = "latitude", alias = "lat")]
    lat: f64,
    #[serde(rename = "longitude", alias = "lon", alias = "lng")]
    lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Result<Self, CoordinateError> {
        if !lat.is_finite() || !lon.is_finite() {
            return Err(CoordinateError::NonFinite);
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(CoordinateError::LatitudeOutOfRange(lat));
        }
        if !(-180.0..=180.0).contains(&lon) {
            return Err(CoordinateError::LongitudeOutOfRange(lon));
        }
        Ok(Self { lat, lon })
    }

    #[must_use]
    pub const fn lat(&self) -> f64 {
        self.lat
    }

    #[must_use]
    pub const fn lon(&self) -> f64 {
        self.lon
    }

    pub fn validate(&self) -> Result<(), CoordinateError> {
        Self::new(self.lat, self.lon).map(|_| ())
    }
}

/// Last known device fix. Only the most recent value is kept.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct GeoPosition {
    pub coords: LatLon,
    pub timestamp_ms: u64,
}

impl GeoPosition {
    pub fn new(lat: f64, lon: f64, timestamp_ms: u64) -> Result<Self, CoordinateError> {
        Ok(Self {
            coords: LatLon::new(lat, lon)?,
            timestamp_ms,
        })
    }
}

// --- Users ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    #[serde(alias = "passenger")]
    Passenger,
    #[serde(alias = "driver")]
    Driver,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passenger => "PASSENGER",
            Self::Driver => "DRIVER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(rename = "type", alias = "role")]
    pub role: Role,
}

// --- Places ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationResult {
    pub name: String,
    pub address: String,
    pub lat: f64,
    pub lon: f64,
}

impl LocationResult {
    pub const CURRENT_LOCATION: &'static str = "Current location";

    pub fn coords(&self) -> Result<LatLon, CoordinateError> {
        LatLon::new(self.lat, self.lon)
    }

    #[must_use]
    pub fn current_location(position: &GeoPosition) -> Self {
        Self {
            name: Self::CURRENT_LOCATION.to_string(),
            address: format!(
                "{:.5}, {:.5}",
                position.coords.lat(),
                position.coords.lon()
            ),
            lat: position.coords.lat(),
            lon: position.coords.lon(),
        }
    }
}

// --- Fares and routes ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleClass {
    #[serde(rename = "UBERX")]
    Standard,
    Black,
    #[default]
    Unknown,
}

impl VehicleClass {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Standard => "UberX",
            Self::Black => "Black",
            Self::Unknown => "Ride",
        }
    }
}

// The pricing service has sent this both as a slug and as a proto enum number.
impl<'de> Deserialize<'de> for VehicleClass {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(match value {
            serde_json::Value::String(slug) => match slug.to_ascii_uppercase().as_str() {
                "UBERX" | "STANDARD" => Self::Standard,
                "BLACK" | "PREMIUM" => Self::Black,
                _ => Self::Unknown,
            },
            serde_json::Value::Number(n) => match n.as_u64() {
                Some(1) => Self::Standard,
                Some(2) => Self::Black,
                _ => Self::Unknown,
            },
            _ => Self::Unknown,
        })
    }
}

fn cents<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || value < 0.0 {
        return Err(serde::de::Error::custom(format!(
            "invalid price in cents: {value}"
        )));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(value.round() as u64)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fare {
    pub id: FareId,
    #[serde(rename = "vehicleClass", alias = "packageSlug", default)]
    pub vehicle_class: VehicleClass,
    #[serde(rename = "totalPriceInCents", deserialize_with = "cents")]
    pub total_price_in_cents: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RouteGeometry {
    #[serde(default)]
    pub coordinates: Vec<LatLon>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub distance: f64,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub geometry: Vec<RouteGeometry>,
}

impl Route {
    /// Flattened polyline, invalid points dropped.
    #[must_use]
    pub fn polyline(&self) -> Vec<LatLon> {
        self.geometry
            .iter()
            .flat_map(|g| g.coordinates.iter().copied())
            .filter(|p| p.validate().is_ok())
            .collect()
    }

    /// GeoJSON `LineString` in (lon, lat) order for map renderers.
    #[must_use]
    pub fn to_geojson(&self) -> geojson::Geometry {
        let line = self
            .polyline()
            .into_iter()
            .map(|p| vec![p.lon(), p.lat()])
            .collect();
        geojson::Geometry::new(geojson::Value::LineString(line))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RidePreview {
    #[serde(default)]
    pub route: Route,
    #[serde(rename = "fareOptions", alias = "rideFares", default)]
    pub fare_options: Vec<Fare>,
}

impl RidePreview {
    #[must_use]
    pub fn fare(&self, id: &FareId) -> Option<&Fare> {
        self.fare_options.iter().find(|f| &f.id == id)
    }
}

// --- Trips ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripStatus {
    #[default]
    Requested,
    Accepted,
    InProgress,
    Completed,
    #[serde(alias = "CANCELLED")]
    Canceled,
}

impl TripStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Canceled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trip {
    pub id: TripId,
    #[serde(rename = "fareId", alias = "fare_id", alias = "rideFareId", default)]
    pub fare_id: Option<FareId>,
    #[serde(rename = "passengerId", alias = "passenger_id", alias = "userId", default)]
    pub passenger_id: Option<UserId>,
    #[serde(default)]
    pub status: TripStatus,
}

/// A trip offered to an online driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripRequest {
    pub trip: Trip,
    #[serde(default)]
    pub fare: Option<Fare>,
    #[serde(default)]
    pub pickup: Option<LatLon>,
    #[serde(default)]
    pub destination: Option<LatLon>,
}

// --- Flow steps ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideStep {
    #[default]
    Search,
    Selecting,
    Searching,
    Trip,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "request", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverStep {
    #[default]
    Offline,
    Online,
    RequestShown(TripRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SocketState {
    #[default]
    Closed,
    Connecting,
    Open,
}

/// What the map currently shows on behalf of the ride flow.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MapOverlay {
    pub pickup: Option<LatLon>,
    pub destination: Option<LatLon>,
    pub route: Vec<LatLon>,
}

impl MapOverlay {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pickup.is_none() && self.destination.is_none() && self.route.is_empty()
    }
}

#[must_use]
pub fn format_price(cents: u64) -> String {
    format!("R$ {},{:02}", cents / 100, cents % 100)
}
