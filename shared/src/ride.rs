//! Ride lifecycle state machines.
//!
//! Passenger: `SEARCH -> SELECTING -> SEARCHING -> TRIP -> SEARCH`.
//! Driver: `OFFLINE <-> ONLINE -> REQUEST_SHOWN`.
//!
//! Every passenger step change advances an epoch. Responses carry the epoch
//! they were issued under and are dropped if the user has moved on.

use serde_json::{json, Value};
use tracing::{debug, info, warn};
use url::Url;

use crate::api::{endpoints, ApiCall, ApiClient, ApiError, ApiPurpose};
use crate::auth::AuthContext;
use crate::capabilities::{Capabilities, KvKey, MapCommand, Toast};
use crate::model::{
    ConnectionId, DriverStep, FareId, GeoPosition, IdGen, LatLon, LocationResult, MapOverlay,
    RidePreview, RideStep, TimerId, Trip, TripRequest, TripStatus,
};
use crate::search::LocationSelection;
use crate::stream::{LocationStream, StreamError};
use crate::{AppError, ErrorKind, PreconditionError, FINISHED_TRIP_ZOOM};

/// What a passenger transition may touch besides the flow itself.
pub struct RideContext<'a> {
    pub api: &'a mut ApiClient,
    pub auth: &'a AuthContext,
    pub ids: &'a mut IdGen,
    pub caps: &'a Capabilities,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Preview,
    TripCreation,
}

impl RideStep {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            RideStep::Search => "choosing a destination",
            RideStep::Selecting => "choosing a ride",
            RideStep::Searching => "looking for a driver",
            RideStep::Trip => "on a trip",
        }
    }
}

#[derive(Debug, Default)]
pub struct PassengerFlow {
    step: RideStep,
    epoch: u64,
    awaiting: Option<Awaiting>,
    selection: LocationSelection,
    route_ends: Option<(LocationResult, LocationResult)>,
    preview: Option<RidePreview>,
    selected_fare: Option<FareId>,
    trip: Option<Trip>,
    overlay: MapOverlay,
}

impl PassengerFlow {
    #[must_use]
    pub const fn step(&self) -> RideStep {
        self.step
    }

    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    #[must_use]
    pub const fn selection(&self) -> &LocationSelection {
        &self.selection
    }

    pub fn selection_mut(&mut self) -> &mut LocationSelection {
        &mut self.selection
    }

    #[must_use]
    pub const fn preview(&self) -> Option<&RidePreview> {
        self.preview.as_ref()
    }

    #[must_use]
    pub const fn selected_fare(&self) -> Option<&FareId> {
        self.selected_fare.as_ref()
    }

    #[must_use]
    pub const fn trip(&self) -> Option<&Trip> {
        self.trip.as_ref()
    }

    #[must_use]
    pub const fn overlay(&self) -> &MapOverlay {
        &self.overlay
    }

    #[must_use]
    pub const fn route_ends(&self) -> Option<&(LocationResult, LocationResult)> {
        self.route_ends.as_ref()
    }

    #[must_use]
    pub const fn is_busy(&self) -> bool {
        self.awaiting.is_some()
    }

    fn require(&self, step: RideStep) -> Result<(), PreconditionError> {
        if self.step == step {
            Ok(())
        } else {
            Err(PreconditionError::WrongStep(self.step.label()))
        }
    }

    fn enter(&mut self, step: RideStep) {
        debug!(from = ?self.step, to = ?step, "ride step");
        self.epoch += 1;
        self.awaiting = None;
        self.step = step;
    }

    pub fn open_selection(
        &mut self,
        position: Option<&GeoPosition>,
        caps: &Capabilities,
    ) -> Result<(), PreconditionError> {
        self.require(RideStep::Search)?;
        self.selection.open(position, caps);
        Ok(())
    }

    pub fn close_selection(&mut self, caps: &Capabilities) {
        self.selection.close(caps);
    }

    /// Ask for fares between two places. Must be in `SEARCH`.
    pub fn confirm_locations(
        &mut self,
        pickup: LocationResult,
        destination: LocationResult,
        ctx: &mut RideContext<'_>,
    ) -> Result<(), PreconditionError> {
        self.require(RideStep::Search)?;
        let passenger = ctx.auth.user().ok_or(PreconditionError::NotSignedIn)?;
        let origin = pickup.coords()?;
        let target = destination.coords()?;

        let body = json!({
            "passenger_id": passenger.id,
            "origin": origin,
            "destination": target,
        });

        // A newer confirmation supersedes one still in flight.
        self.epoch += 1;
        ctx.api
            .request(
                ApiCall::post(endpoints::TRIP_PREVIEW, body),
                ApiPurpose::TripPreview { epoch: self.epoch },
                ctx.auth,
                ctx.ids,
                ctx.caps,
            )
            .map_err(|e| {
                warn!(error = %e, "trip preview request could not be built");
                PreconditionError::RequestNotSent(e.message())
            })?;

        info!(pickup = %pickup.name, destination = %destination.name, "requesting trip preview");
        self.awaiting = Some(Awaiting::Preview);
        self.route_ends = Some((pickup, destination));
        Ok(())
    }

    /// Apply a fare preview. Returns a toast when the user has to be told
    /// why nothing changed.
    pub fn preview_resolved(
        &mut self,
        epoch: u64,
        result: Result<Value, ApiError>,
        caps: &Capabilities,
    ) -> Option<Toast> {
        if epoch != self.epoch
            || self.step != RideStep::Search
            || self.awaiting != Some(Awaiting::Preview)
        {
            debug!(epoch, current = self.epoch, "stale trip preview ignored");
            return None;
        }
        self.awaiting = None;

        let preview = result.and_then(|data| {
            serde_json::from_value::<RidePreview>(data)
                .map_err(|e| ApiError::InvalidResponse(e.to_string()))
        });

        let preview = match preview {
            Ok(preview) if preview.fare_options.is_empty() => {
                info!("no rides available for this route");
                return Some(Toast::warning("No rides available for this route right now"));
            }
            Ok(preview) => preview,
            Err(e) => {
                warn!(error = %e, "trip preview failed");
                return Some(Toast::from(&AppError::from(&e)));
            }
        };

        let Some((pickup, destination)) = self.route_ends.as_ref() else {
            return None;
        };
        let (Ok(pickup), Ok(destination)) = (pickup.coords(), destination.coords()) else {
            return None;
        };

        self.clear_overlays(caps);
        let points = preview.route.polyline();
        self.overlay = MapOverlay {
            pickup: Some(pickup),
            destination: Some(destination),
            route: points.clone(),
        };
        caps.ui.map(MapCommand::ShowPickup { at: pickup });
        caps.ui.map(MapCommand::ShowDestination { at: destination });
        if !points.is_empty() {
            caps.ui.map(MapCommand::DrawRoute {
                points: points.clone(),
            });
        }
        let bounds = if points.is_empty() {
            vec![pickup, destination]
        } else {
            points
        };
        caps.ui.map(MapCommand::FitToRoute { points: bounds });

        self.selected_fare = preview.fare_options.first().map(|f| f.id.clone());
        info!(fares = preview.fare_options.len(), "trip preview ready");
        self.preview = Some(preview);
        self.selection.close(caps);
        self.enter(RideStep::Selecting);
        None
    }

    pub fn select_fare(&mut self, fare: FareId) -> Result<(), PreconditionError> {
        self.require(RideStep::Selecting)?;
        let known = self
            .preview
            .as_ref()
            .is_some_and(|p| p.fare(&fare).is_some());
        if !known {
            return Err(PreconditionError::UnknownFare);
        }
        self.selected_fare = Some(fare);
        Ok(())
    }

    pub fn confirm_fare(&mut self, ctx: &mut RideContext<'_>) -> Result<(), PreconditionError> {
        self.require(RideStep::Selecting)?;
        if self.awaiting.is_some() {
            return Err(PreconditionError::RequestInFlight);
        }
        let fare = self
            .selected_fare
            .clone()
            .ok_or(PreconditionError::NoFareSelected)?;
        let passenger = ctx.auth.user().ok_or(PreconditionError::NotSignedIn)?;

        let body = json!({ "ride_fare_id": fare, "user_id": passenger.id });
        ctx.api
            .request(
                ApiCall::post(endpoints::TRIP, body),
                ApiPurpose::CreateTrip { epoch: self.epoch },
                ctx.auth,
                ctx.ids,
                ctx.caps,
            )
            .map_err(|e| {
                warn!(error = %e, "trip request could not be built");
                PreconditionError::RequestNotSent(e.message())
            })?;

        info!(fare = %fare, "requesting trip");
        self.awaiting = Some(Awaiting::TripCreation);
        Ok(())
    }

    pub fn trip_created(&mut self, epoch: u64, result: Result<Value, ApiError>) -> Option<Toast> {
        if epoch != self.epoch
            || self.step != RideStep::Selecting
            || self.awaiting != Some(Awaiting::TripCreation)
        {
            debug!(epoch, current = self.epoch, "stale trip creation ignored");
            return None;
        }
        self.awaiting = None;

        match result {
            Ok(data) => {
                let trip = serde_json::from_value::<Trip>(data.get("trip").cloned().unwrap_or(data))
                    .ok();
                info!(trip = ?trip.as_ref().map(|t| t.id.as_str()), "trip requested, searching for driver");
                self.trip = trip;
                self.enter(RideStep::Searching);
                None
            }
            Err(e) => {
                warn!(error = %e, "trip request failed");
                Some(Toast::from(&AppError::from(&e)))
            }
        }
    }

    pub fn back_to_search(&mut self, caps: &Capabilities) -> Result<(), PreconditionError> {
        self.require(RideStep::Selecting)?;
        self.clear_overlays(caps);
        self.preview = None;
        self.selected_fare = None;
        self.route_ends = None;
        self.enter(RideStep::Search);
        Ok(())
    }

    pub fn cancel_searching(&mut self) -> Result<(), PreconditionError> {
        self.require(RideStep::Searching)?;
        info!("driver search cancelled");
        self.trip = None;
        self.enter(RideStep::Selecting);
        Ok(())
    }

    /// `None` when no driver search was running.
    pub fn driver_found(&mut self, trip: Option<Trip>) -> Option<Toast> {
        if self.step != RideStep::Searching {
            debug!(step = ?self.step, "driver found outside of search ignored");
            return None;
        }
        if let Some(trip) = trip {
            self.trip = Some(trip);
        }
        info!("driver found");
        self.enter(RideStep::Trip);
        Some(Toast::success("Driver found! They are on the way."))
    }

    /// `None` when there was no trip to finish.
    pub fn finish_trip(&mut self, position: Option<&GeoPosition>, caps: &Capabilities) -> Option<Toast> {
        if self.step != RideStep::Trip {
            debug!(step = ?self.step, "trip finished outside of a trip ignored");
            return None;
        }
        self.clear_overlays(caps);
        if let Some(position) = position {
            caps.ui.map(MapCommand::Recenter {
                center: position.coords,
                zoom: FINISHED_TRIP_ZOOM,
            });
        }
        info!("trip finished");
        self.return_to_start(caps);
        Some(Toast::success("Trip finished"))
    }

    pub fn trip_updated(
        &mut self,
        trip: Trip,
        position: Option<&GeoPosition>,
        caps: &Capabilities,
    ) -> Option<Toast> {
        let ours = self.trip.as_ref().map_or(true, |t| t.id == trip.id);
        if !ours || !matches!(self.step, RideStep::Searching | RideStep::Trip) {
            debug!(trip = %trip.id, "update for a trip we are not tracking");
            return None;
        }

        match trip.status {
            TripStatus::Accepted | TripStatus::InProgress if self.step == RideStep::Searching => {
                self.driver_found(Some(trip))
            }
            TripStatus::Completed => {
                self.trip = Some(trip);
                if self.step == RideStep::Trip {
                    self.finish_trip(position, caps)
                } else {
                    None
                }
            }
            TripStatus::Canceled => {
                info!(trip = %trip.id, "trip canceled by the backend");
                self.clear_overlays(caps);
                self.return_to_start(caps);
                Some(Toast::warning("Your trip was canceled"))
            }
            _ => {
                self.trip = Some(trip);
                None
            }
        }
    }

    /// Back to an empty `SEARCH`, e.g. on logout.
    pub fn reset(&mut self, caps: &Capabilities) {
        self.clear_overlays(caps);
        self.return_to_start(caps);
    }

    fn return_to_start(&mut self, caps: &Capabilities) {
        self.selection.reset(caps);
        self.preview = None;
        self.selected_fare = None;
        self.route_ends = None;
        self.trip = None;
        self.enter(RideStep::Search);
    }

    fn clear_overlays(&mut self, caps: &Capabilities) {
        if !self.overlay.is_empty() {
            caps.ui.map(MapCommand::ClearOverlays);
            self.overlay = MapOverlay::default();
        }
    }
}

#[derive(Debug)]
pub struct DriverConsole {
    step: DriverStep,
    stream: LocationStream,
    resume_pending: bool,
}

impl DriverConsole {
    #[must_use]
    pub fn new(endpoint: Option<Url>, heartbeat_ms: u64) -> Self {
        Self {
            step: DriverStep::Offline,
            stream: LocationStream::new(endpoint, heartbeat_ms),
            resume_pending: false,
        }
    }

    pub fn reconfigure(&mut self, endpoint: Url, heartbeat_ms: u64) {
        self.stream.reconfigure(endpoint, heartbeat_ms);
    }

    #[must_use]
    pub const fn step(&self) -> &DriverStep {
        &self.step
    }

    #[must_use]
    pub const fn is_online(&self) -> bool {
        !matches!(self.step, DriverStep::Offline)
    }

    #[must_use]
    pub const fn stream(&self) -> &LocationStream {
        &self.stream
    }

    #[must_use]
    pub const fn resume_pending(&self) -> bool {
        self.resume_pending
    }

    /// The online flag and the stream only ever change together.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.is_online() == self.stream.is_active()
    }

    pub fn go_online(
        &mut self,
        token: Option<&str>,
        position: Option<&GeoPosition>,
        ids: &mut IdGen,
        caps: &Capabilities,
    ) -> Result<(), StreamError> {
        if self.is_online() {
            return Ok(());
        }
        self.stream.start(token, position, ids, caps)?;
        info!("driver online");
        self.step = DriverStep::Online;
        self.resume_pending = false;
        Self::persist(true, caps);
        Ok(())
    }

    pub fn go_offline(&mut self, caps: &Capabilities) {
        let was_online = self.is_online();
        self.stream.stop(caps);
        self.step = DriverStep::Offline;
        self.resume_pending = false;
        if was_online {
            info!("driver offline");
            Self::persist(false, caps);
        }
    }

    pub fn socket_opened(
        &mut self,
        connection: ConnectionId,
        position: Option<&GeoPosition>,
        ids: &mut IdGen,
        caps: &Capabilities,
    ) -> bool {
        self.stream.opened(connection, position, ids, caps)
    }

    /// `None` when the event was for a connection we no longer track.
    pub fn socket_dropped(
        &mut self,
        connection: ConnectionId,
        reason: &str,
        caps: &Capabilities,
    ) -> Option<Toast> {
        if !self.stream.dropped(connection, reason, caps) {
            return None;
        }
        self.step = DriverStep::Offline;
        Self::persist(false, caps);
        let err = AppError::new(ErrorKind::Stream, "Connection lost. You are offline now.")
            .with_internal(reason.to_string());
        Some(Toast::from(&err))
    }

    pub fn position_changed(&mut self, position: &GeoPosition, caps: &Capabilities) {
        self.stream.position_changed(position, caps);
    }

    pub fn heartbeat_fired(
        &mut self,
        timer: TimerId,
        position: Option<&GeoPosition>,
        caps: &Capabilities,
    ) -> bool {
        self.stream.heartbeat_fired(timer, position, caps)
    }

    pub fn trip_requested(&mut self, request: TripRequest) -> Option<Toast> {
        if !self.is_online() {
            debug!(trip = %request.trip.id, "trip request while offline ignored");
            return None;
        }
        info!(trip = %request.trip.id, "trip request received");
        self.step = DriverStep::RequestShown(request);
        Some(Toast::info("New trip request"))
    }

    pub fn dismiss_request(&mut self) -> bool {
        if matches!(self.step, DriverStep::RequestShown(_)) {
            self.step = DriverStep::Online;
            true
        } else {
            false
        }
    }

    /// Remember a stored online preference until it can be re-validated.
    pub fn restore_intent(&mut self) {
        self.resume_pending = true;
    }

    /// Re-establish a stored online preference once a position is known.
    /// `None` means there is nothing to do yet.
    pub fn try_resume(
        &mut self,
        token: Option<&str>,
        position: Option<&GeoPosition>,
        ids: &mut IdGen,
        caps: &Capabilities,
    ) -> Option<Result<(), StreamError>> {
        if !self.resume_pending || position.is_none() {
            return None;
        }
        self.resume_pending = false;
        let result = self.go_online(token, position, ids, caps);
        if result.is_err() {
            Self::persist(false, caps);
        }
        Some(result)
    }

    /// Drop a stored online preference that can no longer be honoured.
    pub fn abandon_resume(&mut self, caps: &Capabilities) -> bool {
        if !self.resume_pending {
            return false;
        }
        self.resume_pending = false;
        Self::persist(false, caps);
        true
    }

    /// Stop everything without touching storage, e.g. on logout.
    pub fn reset(&mut self, caps: &Capabilities) {
        self.stream.stop(caps);
        self.step = DriverStep::Offline;
        self.resume_pending = false;
    }

    fn persist(online: bool, caps: &Capabilities) {
        KvKey::DriverOnline.set(if online { "true" } else { "false" }, &caps.kv);
    }
}

/// Marker positions the driver sees for a pending request.
#[must_use]
pub fn request_markers(request: &TripRequest) -> Vec<LatLon> {
    request
        .pickup
        .into_iter()
        .chain(request.destination)
        .filter(|p| p.validate().is_ok())
        .collect()
}
