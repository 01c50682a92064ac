//! Debounced address search.
//!
//! Keystrokes restart a one-shot timer; only the query standing when it
//! fires is geocoded. Every lookup and every invalidation advances a
//! sequence number and a response is applied only if it still carries the
//! latest one, so completion order never matters.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::api::{ApiClient, ApiError, ApiPurpose};
use crate::capabilities::Capabilities;
use crate::event::Event;
use crate::model::{GeoPosition, IdGen, LocationResult, TimerId};
use crate::PreconditionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchField {
    Pickup,
    #[default]
    Destination,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchSettings {
    pub geocoder_url: String,
    pub debounce_ms: u64,
    pub min_query_chars: usize,
    pub result_limit: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            geocoder_url: crate::DEFAULT_GEOCODER_URL.to_string(),
            debounce_ms: u64::try_from(crate::DEFAULT_SEARCH_DEBOUNCE.as_millis())
                .unwrap_or(500),
            min_query_chars: crate::MIN_QUERY_CHARS,
            result_limit: crate::GEOCODE_RESULT_LIMIT,
        }
    }
}

impl SearchSettings {
    pub fn lookup_url(&self, query: &str) -> Result<Url, url::ParseError> {
        Url::parse_with_params(
            &self.geocoder_url,
            &[
                ("q", query),
                ("format", "json"),
                ("limit", &self.result_limit.to_string()),
            ],
        )
    }

    #[must_use]
    pub fn is_searchable(&self, query: &str) -> bool {
        query.trim().chars().count() >= self.min_query_chars
    }
}

#[derive(Debug, Default)]
pub struct SearchPipeline {
    active: SearchField,
    query: String,
    results: Vec<LocationResult>,
    error: Option<String>,
    debounce: Option<TimerId>,
    seq: u64,
    in_flight: Option<u64>,
}

impl SearchPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn active_field(&self) -> SearchField {
        self.active
    }

    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }

    #[must_use]
    pub fn results(&self) -> &[LocationResult] {
        &self.results
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    #[must_use]
    pub const fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    #[must_use]
    pub const fn pending_timer(&self) -> Option<TimerId> {
        self.debounce
    }

    pub fn query_changed(
        &mut self,
        query: String,
        settings: &SearchSettings,
        ids: &mut IdGen,
        caps: &Capabilities,
    ) {
        self.cancel_timer(caps);
        self.query = query;

        if !settings.is_searchable(&self.query) {
            self.results.clear();
            self.error = None;
            self.invalidate();
            return;
        }

        let id: TimerId = ids.next();
        self.debounce = Some(id);
        caps.timer.once(id, settings.debounce_ms, Event::TimerFired);
    }

    /// Returns false when the timer is not ours, so the caller can route it
    /// elsewhere.
    pub fn timer_fired(
        &mut self,
        id: TimerId,
        settings: &SearchSettings,
        api: &mut ApiClient,
        ids: &mut IdGen,
        caps: &Capabilities,
    ) -> bool {
        if self.debounce != Some(id) {
            return false;
        }
        self.debounce = None;

        let query = self.query.trim().to_string();
        if !settings.is_searchable(&query) {
            return true;
        }

        let url = match settings.lookup_url(&query) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "geocoder URL is invalid");
                self.fail(e.to_string());
                return true;
            }
        };

        self.seq += 1;
        let purpose = ApiPurpose::Geocode {
            field: self.active,
            seq: self.seq,
        };
        match api.request_external(url.as_str(), purpose, ids, caps) {
            Ok(_) => {
                debug!(seq = self.seq, "geocode lookup issued");
                self.in_flight = Some(self.seq);
            }
            Err(e) => {
                warn!(error = %e, "geocode lookup could not be issued");
                self.fail(e.message());
            }
        }
        true
    }

    /// Apply a lookup outcome. Returns whether it was current.
    pub fn apply_results(
        &mut self,
        field: SearchField,
        seq: u64,
        result: Result<Value, ApiError>,
    ) -> bool {
        if seq != self.seq || field != self.active {
            debug!(seq, latest = self.seq, "stale geocode result discarded");
            return false;
        }
        self.in_flight = None;

        match result.and_then(|v| parse_geocode(v).map_err(|e| ApiError::InvalidResponse(e.to_string()))) {
            Ok(results) => {
                self.results = results;
                self.error = None;
            }
            Err(e) => {
                warn!(error = %e, "geocode lookup failed");
                self.fail(e.message());
            }
        }
        true
    }

    pub fn switch_field(&mut self, field: SearchField, caps: &Capabilities) {
        if field == self.active {
            return;
        }
        self.active = field;
        self.clear(caps);
    }

    /// Drop the query, results and anything pending.
    pub fn clear(&mut self, caps: &Capabilities) {
        self.cancel_timer(caps);
        self.query.clear();
        self.results.clear();
        self.error = None;
        self.invalidate();
    }

    fn fail(&mut self, message: String) {
        self.results.clear();
        self.error = Some(message);
        self.in_flight = None;
    }

    fn invalidate(&mut self) {
        self.seq += 1;
        self.in_flight = None;
    }

    fn cancel_timer(&mut self, caps: &Capabilities) {
        if let Some(id) = self.debounce.take() {
            caps.timer.cancel(id);
        }
    }
}

fn coordinate<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("coordinate out of range")),
        Value::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!(
            "expected coordinate, found {other}"
        ))),
    }
}

#[derive(Deserialize)]
struct GeocodeHit {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(deserialize_with = "coordinate")]
    lat: f64,
    #[serde(deserialize_with = "coordinate")]
    lon: f64,
}

/// Map a geocoder response to results. Hits with unusable coordinates are
/// dropped instead of failing the whole lookup.
pub fn parse_geocode(value: Value) -> Result<Vec<LocationResult>, serde_json::Error> {
    let hits: Vec<Value> = serde_json::from_value(value)?;
    Ok(hits
        .into_iter()
        .filter_map(|hit| serde_json::from_value::<GeocodeHit>(hit).ok())
        .filter_map(|hit| {
            let address = hit.display_name.unwrap_or_default();
            let name = hit
                .name
                .filter(|n| !n.trim().is_empty())
                .or_else(|| address.split(',').next().map(|s| s.trim().to_string()))
                .unwrap_or_default();
            let result = LocationResult {
                name,
                address,
                lat: hit.lat,
                lon: hit.lon,
            };
            result.coords().ok().map(|_| result)
        })
        .collect())
}

/// The pickup/destination sheet: one search pipeline plus the values
/// confirmed so far.
#[derive(Debug, Default)]
pub struct LocationSelection {
    open: bool,
    pickup: Option<LocationResult>,
    destination: Option<LocationResult>,
    search: SearchPipeline,
}

impl LocationSelection {
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open
    }

    #[must_use]
    pub const fn pickup(&self) -> Option<&LocationResult> {
        self.pickup.as_ref()
    }

    #[must_use]
    pub const fn destination(&self) -> Option<&LocationResult> {
        self.destination.as_ref()
    }

    #[must_use]
    pub const fn search(&self) -> &SearchPipeline {
        &self.search
    }

    pub fn search_mut(&mut self) -> &mut SearchPipeline {
        &mut self.search
    }

    pub fn open(&mut self, position: Option<&GeoPosition>, caps: &Capabilities) {
        self.open = true;
        if self.pickup.is_none() {
            self.pickup = position.map(LocationResult::current_location);
        }
        self.search.clear(caps);
        self.search.switch_field(SearchField::Destination, caps);
    }

    pub fn close(&mut self, caps: &Capabilities) {
        self.open = false;
        self.search.clear(caps);
    }

    /// Forget everything, including confirmed values.
    pub fn reset(&mut self, caps: &Capabilities) {
        self.close(caps);
        self.pickup = None;
        self.destination = None;
    }

    pub fn choose(&mut self, index: usize, caps: &Capabilities) -> Result<(), PreconditionError> {
        let chosen = self
            .search
            .results()
            .get(index)
            .cloned()
            .ok_or(PreconditionError::UnknownResult(index))?;
        chosen.coords()?;

        match self.search.active_field() {
            SearchField::Pickup => {
                self.pickup = Some(chosen);
                self.search.switch_field(SearchField::Destination, caps);
            }
            SearchField::Destination => {
                self.destination = Some(chosen);
                self.search.clear(caps);
            }
        }
        Ok(())
    }

    pub fn confirmed_pair(&self) -> Result<(LocationResult, LocationResult), PreconditionError> {
        let pickup = self.pickup.clone().ok_or(PreconditionError::MissingPickup)?;
        let destination = self
            .destination
            .clone()
            .ok_or(PreconditionError::MissingDestination)?;
        Ok((pickup, destination))
    }
}
