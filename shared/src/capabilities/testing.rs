//! Helpers for driving the app through `AppTester` in unit tests.

use crux_core::testing::AppTester;
use crux_core::Request;
use crux_http::protocol::{HttpRequest, HttpResponse, HttpResult};
use crux_kv::KeyValueOperation;
use serde_json::Value;

use super::{Capabilities, Effect, KvKey, SocketOperation, StorageSnapshot, TimerOperation, TimerOutput, UiOperation};
use crate::app::{App, Model, ViewModel};
use crate::event::Event;
use crate::model::{Role, User, UserId};

pub struct Harness {
    pub app: AppTester<App, Effect>,
    pub model: Model,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            app: AppTester::default(),
            model: Model::default(),
        }
    }

    /// A core with a restored session for Ana in `role`.
    pub fn signed_in(role: Role) -> Self {
        let mut h = Self::new();
        let user = User {
            id: UserId::new("u1"),
            name: "Ana".into(),
            email: "ana@example.com".into(),
            role,
        };
        let snapshot = StorageSnapshot::new()
            .with(KvKey::UserData, serde_json::to_string(&user).unwrap())
            .with(KvKey::AccessToken, "at")
            .with(KvKey::RefreshToken, "rt");
        h.send(Event::StorageLoaded(snapshot));
        h
    }

    /// Run an event and everything it dispatches; returns every effect.
    pub fn send(&mut self, event: Event) -> Vec<Effect> {
        let update = self.app.update(event, &mut self.model);
        self.follow(update.effects, update.events)
    }

    pub fn resolve<Op: crux_core::capability::Operation>(
        &mut self,
        request: &mut Request<Op>,
        output: Op::Output,
    ) -> Vec<Effect> {
        let update = self.app.resolve(request, output).unwrap();
        self.follow(update.effects, update.events)
    }

    pub fn respond(&mut self, request: &mut Request<HttpRequest>, status: u16, body: Value) -> Vec<Effect> {
        let response = HttpResponse::status(status).json(body).build();
        self.resolve(request, HttpResult::Ok(response))
    }

    pub fn fire(&mut self, timer: &mut Request<TimerOperation>) -> Vec<Effect> {
        self.resolve(timer, TimerOutput::Fired)
    }

    pub fn caps(&self) -> &Capabilities {
        self.app.as_ref()
    }

    /// Effects requested directly through [`Self::caps`] are queued until
    /// the executor runs again; run it against a throwaway model.
    pub fn flush(&mut self) -> Vec<Effect> {
        let update = self.app.update(Event::DismissToast, &mut Model::default());
        let effects = update.effects.into_iter().filter(|e| !e.is_render()).collect();
        self.follow(effects, update.events)
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

pub fn take_http(effects: &mut Vec<Effect>) -> Vec<Request<HttpRequest>> {
    let (taken, rest): (Vec<_>, Vec<_>) = std::mem::take(effects).into_iter().partition(Effect::is_http);
    *effects = rest;
    taken.into_iter().filter_map(|e| e.into_http()).collect()
}

pub fn take_timers(effects: &mut Vec<Effect>) -> Vec<Request<TimerOperation>> {
    let (taken, rest): (Vec<_>, Vec<_>) = std::mem::take(effects).into_iter().partition(Effect::is_timer);
    *effects = rest;
    taken.into_iter().filter_map(|e| e.into_timer()).collect()
}

pub fn take_sockets(effects: &mut Vec<Effect>) -> Vec<Request<SocketOperation>> {
    let (taken, rest): (Vec<_>, Vec<_>) = std::mem::take(effects).into_iter().partition(Effect::is_socket);
    *effects = rest;
    taken.into_iter().filter_map(|e| e.into_socket()).collect()
}

pub fn take_kv(effects: &mut Vec<Effect>) -> Vec<Request<KeyValueOperation>> {
    let (taken, rest): (Vec<_>, Vec<_>) = std::mem::take(effects).into_iter().partition(Effect::is_kv);
    *effects = rest;
    taken.into_iter().filter_map(|e| e.into_kv()).collect()
}

pub fn ui_ops(effects: &[Effect]) -> Vec<&UiOperation> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::Ui(request) => Some(&request.operation),
            _ => None,
        })
        .collect()
}

pub fn timer_ops(effects: &[Effect]) -> Vec<&TimerOperation> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::Timer(request) => Some(&request.operation),
            _ => None,
        })
        .collect()
}

pub fn socket_ops(effects: &[Effect]) -> Vec<&SocketOperation> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::Socket(request) => Some(&request.operation),
            _ => None,
        })
        .collect()
}

pub fn kv_ops(effects: &[Effect]) -> Vec<&KeyValueOperation> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::KeyValue(request) => Some(&request.operation),
            _ => None,
        })
        .collect()
}

/// The value written to `key`, if any write to it was requested.
pub fn kv_written(effects: &[Effect], key: KvKey) -> Option<String> {
    kv_ops(effects).into_iter().rev().find_map(|op| match op {
        KeyValueOperation::Set { key: k, value } if k == key.as_str() => {
            Some(String::from_utf8_lossy(value).into_owned())
        }
        _ => None,
    })
}

pub fn kv_deleted(effects: &[Effect], key: KvKey) -> bool {
    kv_ops(effects)
        .into_iter()
        .any(|op| matches!(op, KeyValueOperation::Delete { key: k } if k == key.as_str()))
}

pub fn header<'a>(request: &'a HttpRequest, name: &str) -> Option<&'a str> {
    request
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

pub fn json_body(request: &HttpRequest) -> Option<Value> {
    serde_json::from_slice(&request.body).ok()
}
