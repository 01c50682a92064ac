#![allow(dead_code)]

use crux_core::testing::AppTester;
use crux_core::Request;
use crux_http::protocol::{HttpRequest, HttpResponse, HttpResult};
use crux_kv::KeyValueOperation;
use ride_core::capabilities::{
    MapCommand, SocketEvent, SocketOperation, TimerOperation, TimerOutput, Toast, UiOperation,
};
use ride_core::event::Credentials;
use ride_core::model::GeoPosition;
use ride_core::{App, Effect, Event, Model, ViewModel};
use serde_json::{json, Value};

/// A core driven in-process, with the model in reach for assertions.
pub struct Client {
    pub app: AppTester<App, Effect>,
    pub model: Model,
}

impl Client {
    pub fn new() -> Self {
        Self {
            app: AppTester::default(),
            model: Model::default(),
        }
    }

    /// Run an event and whatever it dispatches; returns every effect.
    pub fn send(&mut self, event: Event) -> Vec<Effect> {
        let update = self.app.update(event, &mut self.model);
        self.follow(update.effects, update.events)
    }

    pub fn resolve<Op: crux_core::capability::Operation>(
        &mut self,
        request: &mut Request<Op>,
        output: Op::Output,
    ) -> Vec<Effect> {
        let update = self.app.resolve(request, output).expect("request resolves");
        self.follow(update.effects, update.events)
    }

    pub fn respond(&mut self, request: &mut Request<HttpRequest>, status: u16, body: Value) -> Vec<Effect> {
        let response = HttpResponse::status(status).json(body).build();
        self.resolve(request, HttpResult::Ok(response))
    }

    pub fn fail(&mut self, request: &mut Request<HttpRequest>, error: crux_http::Error) -> Vec<Effect> {
        self.resolve(request, HttpResult::Err(error))
    }

    pub fn fire(&mut self, timer: &mut Request<TimerOperation>) -> Vec<Effect> {
        self.resolve(timer, TimerOutput::Fired)
    }

    pub fn socket(&mut self, socket: &mut Request<SocketOperation>, event: SocketEvent) -> Vec<Effect> {
        self.resolve(socket, event)
    }

    pub fn view(&self) -> ViewModel {
        self.app.view(&self.model)
    }

    fn follow(&mut self, mut effects: Vec<Effect>, mut events: Vec<Event>) -> Vec<Effect> {
        while !events.is_empty() {
            for event in std::mem::take(&mut events) {
                let update = self.app.update(event, &mut self.model);
                effects.extend(update.effects);
                events.extend(update.events);
            }
        }
        effects
    }
}

pub fn position(lat: f64, lon: f64) -> GeoPosition {
    GeoPosition::new(lat, lon, 1_700_000_000_000).unwrap()
}

pub fn take_http(effects: &mut Vec<Effect>) -> Vec<Request<HttpRequest>> {
    let (taken, rest): (Vec<_>, Vec<_>) = std::mem::take(effects).into_iter().partition(Effect::is_http);
    *effects = rest;
    taken.into_iter().filter_map(Effect::into_http).collect()
}

pub fn take_timers(effects: &mut Vec<Effect>) -> Vec<Request<TimerOperation>> {
    let (taken, rest): (Vec<_>, Vec<_>) = std::mem::take(effects).into_iter().partition(Effect::is_timer);
    *effects = rest;
    taken.into_iter().filter_map(Effect::into_timer).collect()
}

pub fn take_sockets(effects: &mut Vec<Effect>) -> Vec<Request<SocketOperation>> {
    let (taken, rest): (Vec<_>, Vec<_>) = std::mem::take(effects).into_iter().partition(Effect::is_socket);
    *effects = rest;
    taken.into_iter().filter_map(Effect::into_socket).collect()
}

/// The first HTTP request among `effects`.
pub fn first_http(mut effects: Vec<Effect>) -> Request<HttpRequest> {
    take_http(&mut effects).remove(0)
}

pub fn requests(effects: &[Effect]) -> Vec<HttpRequest> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::Http(r) => Some(r.operation.clone()),
            _ => None,
        })
        .collect()
}

pub fn timer_ops(effects: &[Effect]) -> Vec<TimerOperation> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::Timer(r) => Some(r.operation),
            _ => None,
        })
        .collect()
}

pub fn socket_ops(effects: &[Effect]) -> Vec<SocketOperation> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::Socket(r) => Some(r.operation.clone()),
            _ => None,
        })
        .collect()
}

pub fn kv_ops(effects: &[Effect]) -> Vec<KeyValueOperation> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::KeyValue(r) => Some(r.operation.clone()),
            _ => None,
        })
        .collect()
}

/// Every `(key, value)` written, in order.
pub fn kv_writes(effects: &[Effect]) -> Vec<(String, String)> {
    kv_ops(effects)
        .into_iter()
        .filter_map(|op| match op {
            KeyValueOperation::Set { key, value } => {
                Some((key, String::from_utf8_lossy(&value).into_owned()))
            }
            _ => None,
        })
        .collect()
}

pub fn kv_deletes(effects: &[Effect]) -> Vec<String> {
    kv_ops(effects)
        .into_iter()
        .filter_map(|op| match op {
            KeyValueOperation::Delete { key } => Some(key),
            _ => None,
        })
        .collect()
}

fn ui_ops(effects: &[Effect]) -> impl Iterator<Item = &UiOperation> {
    effects.iter().filter_map(|e| match e {
        Effect::Ui(r) => Some(&r.operation),
        _ => None,
    })
}

pub fn map_commands(effects: &[Effect]) -> Vec<MapCommand> {
    ui_ops(effects)
        .filter_map(|op| match op {
            UiOperation::Map(c) => Some(c.clone()),
            _ => None,
        })
        .collect()
}

pub fn toasts(effects: &[Effect]) -> Vec<Toast> {
    ui_ops(effects)
        .filter_map(|op| match op {
            UiOperation::Notify(t) => Some(t.clone()),
            _ => None,
        })
        .collect()
}

pub fn screens(effects: &[Effect]) -> Vec<ride_core::capabilities::Screen> {
    ui_ops(effects)
        .filter_map(|op| match op {
            UiOperation::Navigate(s) => Some(*s),
            _ => None,
        })
        .collect()
}

pub fn sends(effects: &[Effect]) -> Vec<String> {
    socket_ops(effects)
        .into_iter()
        .filter_map(|op| match op {
            SocketOperation::Send { text, .. } => Some(text),
            _ => None,
        })
        .collect()
}

/// Header lookup ignoring case; shells may normalise names.
pub fn header<'a>(request: &'a Request<HttpRequest>, name: &str) -> Option<&'a str> {
    request
        .operation
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

pub fn bearer(request: &Request<HttpRequest>) -> Option<&str> {
    header(request, "Authorization")
}

pub fn url(request: &Request<HttpRequest>) -> &str {
    &request.operation.url
}

pub fn body(request: &Request<HttpRequest>) -> Option<Value> {
    serde_json::from_slice(&request.operation.body).ok()
}

pub fn login_as(client: &mut Client, role: &str) {
    let mut login = first_http(client.send(Event::LoginRequested(Credentials::new(
        "ana@example.com",
        "hunter22",
    ))));
    client.respond(
        &mut login,
        200,
        json!({"data": {
            "id": "u1", "name": "Ana", "email": "ana@example.com", "type": role,
            "access_token": "at-1", "refresh_token": "rt-1"
        }}),
    );
}
