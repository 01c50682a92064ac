use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::api::{endpoints, ApiCall, ApiClient, ApiCompletion, ApiError, ApiPurpose};
use crate::auth::{AuthContext, LoginResponse};
use crate::capabilities::{read_snapshot, Capabilities, KvKey, Screen, Toast};
use crate::config::{ClientConfig, ConfigError};
use crate::event::{BackendEvent, Credentials, Event, Registration};
use crate::model::{
    format_price, DriverStep, FareId, GeoPosition, IdGen, LatLon, LocationResult, MapOverlay,
    RideStep, Role, SocketState, Trip, User,
};
use crate::ride::{request_markers, DriverConsole, PassengerFlow, RideContext};
use crate::search::{SearchField, SearchSettings};
use crate::{AppError, ErrorKind, PreconditionError};

pub struct Model {
    pub screen: Screen,
    pub auth: AuthContext,
    pub api: ApiClient,
    pub ids: IdGen,
    pub settings: SearchSettings,
    pub position: Option<GeoPosition>,
    pub geolocation_error: Option<String>,
    pub passenger: PassengerFlow,
    pub driver: DriverConsole,
    pub toast: Option<Toast>,
    /// A login or registration call is in flight.
    pub auth_pending: bool,
}

impl Default for Model {
    fn default() -> Self {
        let config = ClientConfig::default();
        Self {
            screen: Screen::Login,
            auth: AuthContext::new(),
            api: ApiClient::new(&config.api_base_url),
            ids: IdGen::default(),
            settings: config.search_settings(),
            position: None,
            geolocation_error: None,
            passenger: PassengerFlow::default(),
            driver: DriverConsole::new(config.stream_endpoint().ok(), config.heartbeat_ms()),
            toast: None,
            auth_pending: false,
        }
    }
}

impl Model {
    /// Swap in the shell's settings. Nothing changes if they do not validate.
    pub fn configure(&mut self, config: &ClientConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let endpoint = config.stream_endpoint()?;
        self.api.set_base_url(&config.api_base_url);
        self.settings = config.search_settings();
        self.driver.reconfigure(endpoint, config.heartbeat_ms());
        Ok(())
    }

    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.auth.user().map(|u| u.role)
    }
}

// --- View ---

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct UserView {
    pub name: String,
    pub email: String,
    pub role: Role,
}

impl From<&User> for UserView {
    fn from(u: &User) -> Self {
        Self {
            name: u.name.clone(),
            email: u.email.clone(),
            role: u.role,
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct FareView {
    pub id: FareId,
    pub label: &'static str,
    pub price: String,
    pub selected: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SearchView {
    pub open: bool,
    pub active_field: SearchField,
    pub query: String,
    pub results: Vec<LocationResult>,
    pub is_loading: bool,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct PassengerView {
    pub step: RideStep,
    pub search: SearchView,
    pub pickup: Option<LocationResult>,
    pub destination: Option<LocationResult>,
    pub fares: Vec<FareView>,
    pub trip: Option<Trip>,
    pub overlay: MapOverlay,
    pub route: Option<geojson::Geometry>,
    pub is_busy: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct DriverView {
    pub online: bool,
    pub step: DriverStep,
    pub socket: SocketState,
    pub request_markers: Vec<LatLon>,
    pub resume_pending: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewState {
    Login { busy: bool },
    Register { busy: bool },
    Passenger(PassengerView),
    Driver(DriverView),
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ViewModel {
    pub state: ViewState,
    pub user: Option<UserView>,
    pub toast: Option<Toast>,
    pub position: Option<LatLon>,
    pub geolocation_error: Option<String>,
}

#[derive(Default)]
pub struct App;

impl crux_core::App for App {
    type Event = Event;
    type Model = Model;
    type ViewModel = ViewModel;
    type Capabilities = Capabilities;

    fn update(&self, event: Event, model: &mut Model, caps: &Capabilities) {
        let event_name = event.name();
        if event.is_user_initiated() {
            info!(event = event_name, "user action");
        } else {
            debug!(event = event_name, "event");
        }

        match event {
            Event::Configure(config) => {
                if let Err(e) = model.configure(&config) {
                    warn!(error = %e, "shell configuration rejected");
                    let err = AppError::new(ErrorKind::Validation, "The app settings are invalid")
                        .with_internal(e.to_string());
                    notify(model, caps, Toast::from(&err));
                }
            }

            Event::AppStarted => {
                let kv = caps.kv.clone();
                caps.compose.spawn(|ctx| async move {
                    let snapshot = read_snapshot(kv).await;
                    ctx.update_app(Event::StorageLoaded(snapshot));
                });
            }

            Event::StorageLoaded(snapshot) => {
                if model.auth.restore(&snapshot) {
                    navigate(model, caps, Screen::Dashboard);
                    if model.role() == Some(Role::Driver) && snapshot.flag(KvKey::DriverOnline) {
                        info!("restoring driver online preference");
                        model.driver.restore_intent();
                        Self::resume_driver(model, caps);
                    }
                } else {
                    navigate(model, caps, Screen::Login);
                }
            }

            Event::StorageWritten { key, result } => {
                if let Err(e) = result {
                    if key.is_secret() {
                        warn!(%key, "could not persist credential");
                    } else {
                        warn!(%key, error = %e, "could not persist value");
                    }
                }
            }

            Event::LoginRequested(credentials) => Self::login(&credentials, model, caps),

            Event::RegisterRequested(registration) => Self::register(&registration, model, caps),

            Event::LogoutRequested => Self::logout(model, caps),

            Event::ShowLogin => navigate(model, caps, Screen::Login),

            Event::ShowRegister => navigate(model, caps, Screen::Register),

            Event::DismissToast => model.toast = None,

            Event::PositionUpdated(position) => {
                model.position = Some(position);
                model.geolocation_error = None;
                model.driver.position_changed(&position, caps);
                Self::resume_driver(model, caps);
            }

            Event::PositionFailed { reason } => {
                warn!(reason = %reason, "geolocation failed");
                if model.driver.abandon_resume(caps) {
                    notify(
                        model,
                        caps,
                        Toast::warning("We could not get your location, so you are still offline"),
                    );
                }
                model.geolocation_error = Some(reason);
            }

            Event::OpenLocationSearch => {
                let result = model
                    .passenger
                    .open_selection(model.position.as_ref(), caps);
                Self::reject(result, model, caps);
            }

            Event::CloseLocationSearch => model.passenger.close_selection(caps),

            Event::SearchFieldFocused(field) => {
                model
                    .passenger
                    .selection_mut()
                    .search_mut()
                    .switch_field(field, caps);
            }

            Event::SearchQueryChanged(query) => {
                model.passenger.selection_mut().search_mut().query_changed(
                    query,
                    &model.settings,
                    &mut model.ids,
                    caps,
                );
            }

            Event::SearchResultChosen(index) => {
                let result = model.passenger.selection_mut().choose(index, caps);
                Self::reject(result, model, caps);
            }

            Event::LocationsConfirmed => {
                let result = match model.passenger.selection().confirmed_pair() {
                    Ok((pickup, destination)) => {
                        Self::confirm_locations(pickup, destination, model, caps)
                    }
                    Err(e) => Err(e),
                };
                Self::reject(result, model, caps);
            }

            Event::DestinationConfirmed {
                pickup,
                destination,
            } => {
                let result = Self::confirm_locations(pickup, destination, model, caps);
                Self::reject(result, model, caps);
            }

            Event::FareSelected(fare) => {
                let result = model.passenger.select_fare(fare);
                Self::reject(result, model, caps);
            }

            Event::RideConfirmed => {
                let mut ctx = RideContext {
                    api: &mut model.api,
                    auth: &model.auth,
                    ids: &mut model.ids,
                    caps,
                };
                let result = model.passenger.confirm_fare(&mut ctx);
                Self::reject(result, model, caps);
            }

            Event::BackToSearch => {
                let result = model.passenger.back_to_search(caps);
                Self::reject(result, model, caps);
            }

            Event::CancelSearching => {
                let result = model.passenger.cancel_searching();
                Self::reject(result, model, caps);
            }

            Event::DriverFound(trip) => {
                let toast = model.passenger.driver_found(trip);
                notify_some(model, caps, toast);
            }

            Event::TripFinished => {
                let toast = model.passenger.finish_trip(model.position.as_ref(), caps);
                notify_some(model, caps, toast);
            }

            Event::DriverOnlineToggled(true) => match model.role() {
                None => Self::reject(Err(PreconditionError::NotSignedIn), model, caps),
                Some(Role::Passenger) => Self::reject(
                    Err(PreconditionError::WrongStep("signed in as a passenger")),
                    model,
                    caps,
                ),
                Some(Role::Driver) => {
                    if let Err(e) = model.driver.go_online(
                        model.auth.access_token(),
                        model.position.as_ref(),
                        &mut model.ids,
                        caps,
                    ) {
                        warn!(error = %e, "cannot go online");
                        notify(model, caps, Toast::from(&AppError::from(e)));
                    }
                }
            },

            Event::DriverOnlineToggled(false) => model.driver.go_offline(caps),

            Event::TripRequestDismissed => {
                model.driver.dismiss_request();
            }

            Event::Backend(backend) => Self::backend_event(backend, model, caps),

            Event::HttpResponse { id, result } => {
                let resolution =
                    model
                        .api
                        .handle_response(id, *result, &mut model.auth, &mut model.ids, caps);
                if resolution.session_ended {
                    info!("session ended, resetting flows");
                    model.driver.reset(caps);
                    model.passenger.reset(caps);
                    model.auth_pending = false;
                    navigate(model, caps, Screen::Login);
                    notify(
                        model,
                        caps,
                        Toast::warning("Your session has expired. Please sign in again."),
                    );
                }
                for completion in resolution.completions {
                    Self::complete(completion, model, caps);
                }
            }

            Event::TimerFired(id) => {
                let search_timer = model.passenger.selection_mut().search_mut().timer_fired(
                    id,
                    &model.settings,
                    &mut model.api,
                    &mut model.ids,
                    caps,
                );
                if !search_timer
                    && !model
                        .driver
                        .heartbeat_fired(id, model.position.as_ref(), caps)
                {
                    debug!(timer = %id, "stale timer ignored");
                }
            }

            Event::SocketOpened(connection) => {
                model.driver.socket_opened(
                    connection,
                    model.position.as_ref(),
                    &mut model.ids,
                    caps,
                );
            }

            Event::SocketMessage { connection, text } => {
                if model.driver.stream().connection() != Some(connection) {
                    debug!(%connection, "message on stale connection ignored");
                } else {
                    match BackendEvent::decode(&text) {
                        Ok(backend) => Self::backend_event(backend, model, caps),
                        Err(e) => warn!(error = %e, "undecodable stream message"),
                    }
                }
            }

            Event::SocketClosed { connection, reason } => {
                let toast = model.driver.socket_dropped(
                    connection,
                    reason.as_deref().unwrap_or("closed by server"),
                    caps,
                );
                notify_some(model, caps, toast);
            }

            Event::SocketFailed { connection, error } => {
                let toast = model.driver.socket_dropped(connection, &error, caps);
                notify_some(model, caps, toast);
            }
        }

        caps.render.render();
    }

    fn view(&self, model: &Model) -> ViewModel {
        let user = model.auth.user();

        let state = match (model.screen, user) {
            (Screen::Register, _) => ViewState::Register {
                busy: model.auth_pending,
            },
            (Screen::Dashboard, Some(user)) if user.role == Role::Driver => {
                ViewState::Driver(Self::driver_view(&model.driver))
            }
            (Screen::Dashboard, Some(_)) => ViewState::Passenger(Self::passenger_view(&model.passenger)),
            _ => ViewState::Login {
                busy: model.auth_pending,
            },
        };

        ViewModel {
            state,
            user: user.map(UserView::from),
            toast: model.toast.clone(),
            position: model.position.map(|p| p.coords),
            geolocation_error: model.geolocation_error.clone(),
        }
    }
}

/// Screen changes go through here so the model always knows where the UI is.
fn navigate(model: &mut Model, caps: &Capabilities, screen: Screen) {
    model.screen = screen;
    caps.ui.navigate(screen);
}

fn notify(model: &mut Model, caps: &Capabilities, toast: Toast) {
    model.toast = Some(toast.clone());
    caps.ui.notify(toast);
}

fn notify_some(model: &mut Model, caps: &Capabilities, toast: Option<Toast>) {
    if let Some(toast) = toast {
        notify(model, caps, toast);
    }
}

impl App {
    fn reject(result: Result<(), PreconditionError>, model: &mut Model, caps: &Capabilities) {
        if let Err(e) = result {
            debug!(error = %e, "precondition not met");
            notify(model, caps, Toast::from(&AppError::from(e)));
        }
    }

    fn confirm_locations(
        pickup: LocationResult,
        destination: LocationResult,
        model: &mut Model,
        caps: &Capabilities,
    ) -> Result<(), PreconditionError> {
        let mut ctx = RideContext {
            api: &mut model.api,
            auth: &model.auth,
            ids: &mut model.ids,
            caps,
        };
        model
            .passenger
            .confirm_locations(pickup, destination, &mut ctx)
    }

    fn resume_driver(model: &mut Model, caps: &Capabilities) {
        let resumed = model.driver.try_resume(
            model.auth.access_token(),
            model.position.as_ref(),
            &mut model.ids,
            caps,
        );
        if let Some(Err(e)) = resumed {
            warn!(error = %e, "stored online preference dropped");
            notify(model, caps, Toast::from(&AppError::from(e)));
        }
    }

    fn login(credentials: &Credentials, model: &mut Model, caps: &Capabilities) {
        if model.auth_pending {
            debug!("login already in flight");
            return;
        }
        let email = credentials.email.trim();
        if email.is_empty() || credentials.password.expose_secret().is_empty() {
            notify(model, caps, Toast::error("Email and password are required"));
            return;
        }

        let body = json!({
            "email": email,
            "password": credentials.password.expose_secret(),
        });
        Self::issue(ApiCall::post(endpoints::LOGIN, body), ApiPurpose::Login, model, caps);
    }

    fn register(registration: &Registration, model: &mut Model, caps: &Capabilities) {
        if model.auth_pending {
            debug!("registration already in flight");
            return;
        }
        if registration.name.trim().is_empty()
            || registration.email.trim().is_empty()
            || registration.password.expose_secret().is_empty()
        {
            notify(model, caps, Toast::error("Name, email and password are required"));
            return;
        }

        let body = json!({
            "name": registration.name.trim(),
            "email": registration.email.trim(),
            "password": registration.password.expose_secret(),
            "user_type": registration.role.as_str(),
        });
        Self::issue(
            ApiCall::post(endpoints::REGISTER, body),
            ApiPurpose::Register,
            model,
            caps,
        );
    }

    fn issue(call: ApiCall, purpose: ApiPurpose, model: &mut Model, caps: &Capabilities) {
        match model
            .api
            .request(call, purpose, &model.auth, &mut model.ids, caps)
        {
            Ok(_) => model.auth_pending = true,
            Err(e) => notify(model, caps, Toast::from(&AppError::from(&e))),
        }
    }

    fn logout(model: &mut Model, caps: &Capabilities) {
        model.driver.reset(caps);
        model.passenger.reset(caps);
        model.api.abandon_all();
        model.auth_pending = false;

        if model.auth.is_authenticated() {
            // Best effort; the outcome is ignored.
            if let Err(e) = model.api.request(
                ApiCall::post(endpoints::LOGOUT, json!({})),
                ApiPurpose::Logout,
                &model.auth,
                &mut model.ids,
                caps,
            ) {
                debug!(error = %e, "logout call not sent");
            }
        }

        model.auth.clear(caps);
        navigate(model, caps, Screen::Login);
    }

    fn complete(completion: ApiCompletion, model: &mut Model, caps: &Capabilities) {
        let ApiCompletion { purpose, result } = completion;
        match purpose {
            ApiPurpose::Login => {
                model.auth_pending = false;
                let session = result.and_then(|data| {
                    serde_json::from_value::<LoginResponse>(data)
                        .map_err(|e| ApiError::InvalidResponse(e.to_string()))
                });
                match session {
                    Ok(response) => {
                        model.auth.set(response.into_session(), caps);
                        navigate(model, caps, Screen::Dashboard);
                    }
                    Err(e) => {
                        warn!(error = %e, "login failed");
                        notify(model, caps, Toast::from(&AppError::from(&e)));
                    }
                }
            }

            ApiPurpose::Register => {
                model.auth_pending = false;
                match result {
                    Ok(_) => {
                        info!("account created");
                        navigate(model, caps, Screen::Login);
                        notify(model, caps, Toast::success("Account created. Please sign in."));
                    }
                    Err(e) => {
                        warn!(error = %e, "registration failed");
                        notify(model, caps, Toast::from(&AppError::from(&e)));
                    }
                }
            }

            ApiPurpose::Logout => {
                if let Err(e) = result {
                    debug!(error = %e, "logout call failed");
                }
            }

            ApiPurpose::TripPreview { epoch } => {
                let toast = model.passenger.preview_resolved(epoch, result, caps);
                notify_some(model, caps, toast);
            }

            ApiPurpose::CreateTrip { epoch } => {
                let toast = model.passenger.trip_created(epoch, result);
                notify_some(model, caps, toast);
            }

            ApiPurpose::Geocode { field, seq } => {
                model
                    .passenger
                    .selection_mut()
                    .search_mut()
                    .apply_results(field, seq, result);
            }
        }
    }

    fn backend_event(event: BackendEvent, model: &mut Model, caps: &Capabilities) {
        let toast = match event {
            BackendEvent::DriverAssigned { trip } => model.passenger.driver_found(trip),
            BackendEvent::TripCompleted { .. } => {
                model.passenger.finish_trip(model.position.as_ref(), caps)
            }
            BackendEvent::TripUpdated { trip } => {
                model
                    .passenger
                    .trip_updated(trip, model.position.as_ref(), caps)
            }
            BackendEvent::TripRequested(request) => model.driver.trip_requested(request),
            BackendEvent::Unknown { kind } => {
                debug!(kind = %kind, "unhandled backend event");
                None
            }
        };
        notify_some(model, caps, toast);
    }

    fn passenger_view(flow: &PassengerFlow) -> PassengerView {
        let selection = flow.selection();
        let search = selection.search();

        let fares = flow
            .preview()
            .map(|preview| {
                preview
                    .fare_options
                    .iter()
                    .map(|fare| FareView {
                        id: fare.id.clone(),
                        label: fare.vehicle_class.label(),
                        price: format_price(fare.total_price_in_cents),
                        selected: flow.selected_fare() == Some(&fare.id),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let route = flow
            .preview()
            .filter(|_| !flow.overlay().route.is_empty())
            .map(|p| p.route.to_geojson());

        PassengerView {
            step: flow.step(),
            search: SearchView {
                open: selection.is_open(),
                active_field: search.active_field(),
                query: search.query().to_string(),
                results: search.results().to_vec(),
                is_loading: search.is_loading(),
                error: search.error().map(str::to_string),
            },
            pickup: selection.pickup().cloned(),
            destination: selection.destination().cloned(),
            fares,
            trip: flow.trip().cloned(),
            overlay: flow.overlay().clone(),
            route,
            is_busy: flow.is_busy(),
        }
    }

    fn driver_view(driver: &DriverConsole) -> DriverView {
        let request_markers = match driver.step() {
            DriverStep::RequestShown(request) => request_markers(request),
            _ => Vec::new(),
        };
        DriverView {
            online: driver.is_online(),
            step: driver.step().clone(),
            socket: driver.stream().socket(),
            request_markers,
            resume_pending: driver.resume_pending(),
        }
    }
}

/// The core a shell drives.
pub type Core = crux_core::Core<crate::capabilities::Effect, App>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::{
        header, json_body, kv_deleted, socket_ops, take_http, take_kv, ui_ops, Harness,
    };
    use crate::capabilities::{
        Effect, KvError, SocketOperation, StorageSnapshot, ToastKind, UiOperation,
    };
    use crate::model::UserId;
    use crux_core::Request;
    use crux_http::protocol::HttpRequest;
    use crux_kv::value::Value as KvValue;
    use crux_kv::{KeyValueOperation, KeyValueResponse, KeyValueResult};

    fn login_request(h: &mut Harness, email: &str, password: &str) -> Request<HttpRequest> {
        let mut effects = h.send(Event::LoginRequested(Credentials::new(email, password)));
        take_http(&mut effects).remove(0)
    }

    fn login_as(h: &mut Harness, role: &str) {
        let mut login = login_request(h, "ana@example.com", "hunter22");
        h.respond(
            &mut login,
            200,
            json!({"data": {
                "id": "u1", "name": "Ana", "email": "ana@example.com", "type": role,
                "access_token": "at", "refresh_token": "rt"
            }}),
        );
    }

    fn navigated(effects: &[Effect], screen: Screen) -> bool {
        ui_ops(effects).contains(&&UiOperation::Navigate(screen))
    }

    fn stored(value: Option<&str>) -> KeyValueResult {
        let value = value.map_or(KvValue::None, |v| KvValue::Bytes(v.as_bytes().to_vec()));
        KeyValueResult::Ok {
            response: KeyValueResponse::Get { value },
        }
    }


    #[test]
    fn test_app_started_reads_every_stored_key() {
        let mut h = Harness::new();
        let mut effects = h.send(Event::AppStarted);
        assert!(effects.iter().any(Effect::is_render));

        let mut reads = take_kv(&mut effects);
        assert_eq!(reads.len(), KvKey::ALL.len());

        let user = User {
            id: UserId::new("u1"),
            name: "Ana".into(),
            email: "ana@example.com".into(),
            role: Role::Passenger,
        };
        let user = serde_json::to_string(&user).unwrap();
        let mut last = Vec::new();
        for read in &mut reads {
            let KeyValueOperation::Get { key } = &read.operation else {
                panic!("expected a read, got {:?}", read.operation);
            };
            let value = match KvKey::parse(key) {
                Some(KvKey::UserData) => Some(user.as_str()),
                Some(KvKey::AccessToken) => Some("at"),
                _ => None,
            };
            last = h.resolve(read, stored(value));
        }

        assert!(navigated(&last, Screen::Dashboard));
        assert!(h.model.auth.is_authenticated());
        assert!(matches!(h.view().state, ViewState::Passenger(_)));
    }

    #[test]
    fn test_empty_storage_goes_to_login() {
        let mut h = Harness::new();
        let effects = h.send(Event::StorageLoaded(StorageSnapshot::new()));
        assert!(navigated(&effects, Screen::Login));
        assert!(matches!(h.view().state, ViewState::Login { busy: false }));
    }

    #[test]
    fn test_login_success_opens_dashboard() {
        let mut h = Harness::new();
        login_as(&mut h, "PASSENGER");
        assert_eq!(h.model.screen, Screen::Dashboard);
        assert!(matches!(h.view().state, ViewState::Passenger(_)));
        assert_eq!(h.view().user.map(|u| u.name), Some("Ana".to_string()));
    }

    #[test]
    fn test_login_body_and_no_bearer() {
        let mut h = Harness::new();
        let login = login_request(&mut h, " ana@example.com ", "hunter22");
        assert_eq!(login.operation.url, "http://localhost:8081/api/v1/login");
        assert_eq!(
            json_body(&login.operation),
            Some(json!({"email": "ana@example.com", "password": "hunter22"}))
        );
        assert!(header(&login.operation, "Authorization").is_none());
        assert!(matches!(h.view().state, ViewState::Login { busy: true }));
    }

    #[test]
    fn test_login_failure_shows_server_message() {
        let mut h = Harness::new();
        let mut login = login_request(&mut h, "ana@example.com", "wrong");
        h.respond(&mut login, 400, json!({"error": {"message": "invalid credentials"}}));
        assert_eq!(
            h.view().toast.map(|t| t.message),
            Some("invalid credentials".to_string())
        );
        assert!(!h.model.auth.is_authenticated());
        assert!(!h.model.auth_pending);
    }

    #[test]
    fn test_register_sends_user_type() {
        let mut h = Harness::new();
        let mut effects = h.send(Event::RegisterRequested(Registration {
            name: "Bia".into(),
            email: "bia@example.com".into(),
            password: secrecy::SecretString::new("pw123456".into()),
            role: Role::Driver,
        }));
        let mut request = take_http(&mut effects).remove(0);
        assert_eq!(request.operation.url, "http://localhost:8081/api/v1/user");
        assert_eq!(json_body(&request.operation).unwrap()["user_type"], "DRIVER");

        let effects = h.respond(&mut request, 201, json!({"data": {"id": "u9"}}));
        assert!(navigated(&effects, Screen::Login));
        assert_eq!(h.view().toast.map(|t| t.kind), Some(ToastKind::Success));
    }

    #[test]
    fn test_restore_session_from_storage() {
        let h = Harness::signed_in(Role::Passenger);
        assert_eq!(h.model.screen, Screen::Dashboard);
        assert!(h.model.auth.is_authenticated());
    }

    #[test]
    fn test_logout_clears_everything() {
        let mut h = Harness::signed_in(Role::Driver);
        h.send(Event::PositionUpdated(GeoPosition::new(-23.561, -46.656, 1).unwrap()));
        h.send(Event::DriverOnlineToggled(true));
        assert!(h.model.driver.is_online());

        let mut effects = h.send(Event::LogoutRequested);
        assert!(socket_ops(&effects)
            .iter()
            .any(|op| matches!(op, SocketOperation::Close { .. })));
        for key in KvKey::ALL {
            assert!(kv_deleted(&effects, key), "{key} left behind");
        }
        assert!(navigated(&effects, Screen::Login));
        let logout = take_http(&mut effects).remove(0);
        assert_eq!(logout.operation.url, "http://localhost:8081/api/v1/logout");
        assert_eq!(header(&logout.operation, "Authorization"), Some("Bearer at"));
        assert!(!h.model.driver.is_online());
        assert!(!h.model.auth.is_authenticated());
    }

    #[test]
    fn test_passenger_cannot_go_online() {
        let mut h = Harness::signed_in(Role::Passenger);
        h.send(Event::PositionUpdated(GeoPosition::new(-23.561, -46.656, 1).unwrap()));
        let effects = h.send(Event::DriverOnlineToggled(true));
        assert!(socket_ops(&effects).is_empty());
        assert_eq!(
            h.view().toast.map(|t| t.message),
            Some("Not available while signed in as a passenger".to_string())
        );
    }

    #[test]
    fn test_going_online_signed_out_asks_to_sign_in() {
        let mut h = Harness::new();
        h.send(Event::PositionUpdated(GeoPosition::new(-23.561, -46.656, 1).unwrap()));
        let effects = h.send(Event::DriverOnlineToggled(true));
        assert!(socket_ops(&effects).is_empty());
        assert!(!h.model.driver.is_online());

        let expected = Toast::from(&AppError::from(PreconditionError::NotSignedIn));
        assert_eq!(expected.message, "Please sign in first");
        assert_eq!(h.view().toast, Some(expected));
    }

    #[test]
    fn test_precondition_becomes_toast() {
        let mut h = Harness::signed_in(Role::Passenger);
        let mut effects = h.send(Event::LocationsConfirmed);
        assert!(take_http(&mut effects).is_empty());
        assert_eq!(
            h.view().toast.map(|t| t.message),
            Some("Choose a pickup location".to_string())
        );
    }

    #[test]
    fn test_dismiss_toast() {
        let mut h = Harness::new();
        h.send(Event::LoginRequested(Credentials::new("", "")));
        assert!(h.view().toast.is_some());
        h.send(Event::DismissToast);
        assert!(h.view().toast.is_none());
    }

    #[test]
    fn test_configure_moves_api_base() {
        let mut h = Harness::new();
        let config = ClientConfig {
            api_base_url: "https://rides.example.com/api/v2".into(),
            ..ClientConfig::default()
        };
        h.send(Event::Configure(config));
        assert!(h.view().toast.is_none());

        let login = login_request(&mut h, "ana@example.com", "hunter22");
        assert_eq!(login.operation.url, "https://rides.example.com/api/v2/login");
    }

    #[test]
    fn test_invalid_configuration_is_rejected_whole() {
        let mut h = Harness::new();
        let config = ClientConfig {
            api_base_url: "https://rides.example.com/api/v2".into(),
            stream_url: "http://rides.example.com/stream".into(),
            ..ClientConfig::default()
        };
        h.send(Event::Configure(config));
        assert_eq!(h.view().toast.map(|t| t.kind), Some(ToastKind::Error));
        assert_eq!(h.model.api.base_url(), "http://localhost:8081/api/v1");
    }

    #[test]
    fn test_failed_write_is_logged_not_shown() {
        let mut h = Harness::new();
        h.send(Event::StorageWritten {
            key: KvKey::AccessToken,
            result: Err(KvError::Unavailable {
                message: "disk full".into(),
            }),
        });
        assert!(h.view().toast.is_none());
    }

    #[test]
    fn test_rejected_refresh_ends_session() {
        let mut h = Harness::signed_in(Role::Passenger);
        let mut effects = h.send(Event::DestinationConfirmed {
            pickup: LocationResult {
                name: "A".into(),
                address: "A".into(),
                lat: -23.561,
                lon: -46.656,
            },
            destination: LocationResult {
                name: "B".into(),
                address: "B".into(),
                lat: -23.55,
                lon: -46.63,
            },
        });
        let mut preview = take_http(&mut effects).remove(0);

        let mut effects = h.respond(&mut preview, 401, json!({"error": {"message": "expired"}}));
        let mut refresh = take_http(&mut effects).remove(0);
        assert_eq!(refresh.operation.url, "http://localhost:8081/api/v1/refresh");

        let effects = h.respond(&mut refresh, 401, json!({"error": {"message": "revoked"}}));
        assert!(navigated(&effects, Screen::Login));
        assert!(!h.model.auth.is_authenticated());
        assert_eq!(
            h.view().toast.map(|t| t.message),
            Some("Your session has expired. Please sign in again.".to_string())
        );
        assert!(matches!(h.view().state, ViewState::Login { busy: false }));
    }

    #[test]
    fn test_fares_formatted_in_view() {
        let mut h = Harness::signed_in(Role::Passenger);
        let mut effects = h.send(Event::DestinationConfirmed {
            pickup: LocationResult {
                name: "A".into(),
                address: "A".into(),
                lat: -23.561,
                lon: -46.656,
            },
            destination: LocationResult {
                name: "B".into(),
                address: "B".into(),
                lat: -23.55,
                lon: -46.63,
            },
        });
        let mut preview = take_http(&mut effects).remove(0);
        h.respond(
            &mut preview,
            200,
            json!({"data": {
                "route": {"geometry": [{"coordinates": [
                    {"latitude": -23.561, "longitude": -46.656},
                    {"latitude": -23.55, "longitude": -46.63}
                ]}]},
                "rideFares": [{"id": "f1", "packageSlug": "UBERX", "totalPriceInCents": 1990}]
            }}),
        );

        let ViewState::Passenger(view) = h.view().state else {
            panic!("expected passenger view");
        };
        assert_eq!(view.step, RideStep::Selecting);
        assert_eq!(view.fares[0].price, "R$ 19,90");
        assert!(view.fares[0].selected);
        assert!(view.route.is_some());
    }
}
