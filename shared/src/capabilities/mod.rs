//! Effects the core asks the shell to perform.
//!
//! HTTP, storage and rendering come from the Crux crates. The websocket
//! stream, timers and UI commands are small capabilities of our own, each
//! with a serializable operation so any shell can execute them.

mod http;
mod kv;
mod socket;
mod timer;
mod ui;

#[cfg(test)]
pub mod testing;

pub use crux_core::compose::Compose;
pub use crux_core::render::Render;
pub use crux_http::Http;
pub use crux_kv::KeyValue;

pub use self::http::{
    settle, HttpError, HttpHeaders, HttpMethod, HttpOutcome, HttpReply, OutboundRequest,
};
pub use self::kv::{read_snapshot, KvError, KvKey, StorageSnapshot};
pub use self::socket::{Socket, SocketEvent, SocketOperation, StreamTarget};
pub use self::timer::{Timer, TimerOperation, TimerOutput};
pub use self::ui::{MapCommand, Screen, Toast, ToastKind, Ui, UiOperation};

use crate::app::App;
use crate::event::Event;

#[derive(crux_core::macros::Effect)]
pub struct Capabilities {
    pub http: Http<Event>,
    pub kv: KeyValue<Event>,
    pub render: Render<Event>,
    pub socket: Socket<Event>,
    pub timer: Timer<Event>,
    pub ui: Ui<Event>,
    #[effect(skip)]
    pub compose: Compose<Event>,
}

impl Effect {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Effect::Http(_) => "http",
            Effect::KeyValue(_) => "key_value",
            Effect::Render(_) => "render",
            Effect::Socket(_) => "socket",
            Effect::Timer(_) => "timer",
            Effect::Ui(_) => "ui",
        }
    }
}
