//! Tokio shell: owns a [`Core`], executes its effects and resolves their
//! requests with the outcomes.
//!
//! One task owns the core. Every event is processed to completion and its
//! effects are executed in emission order before the next message is read.
//! Storage operations are awaited inline, so a token written during a
//! refresh is durable before the replayed request goes out.

mod http;
mod socket;
mod timers;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crux_core::Request;
use crux_http::protocol::{HttpRequest, HttpResult};
use crux_kv::KeyValueOperation;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{
    Capabilities, KvError, SocketEvent, SocketOperation, TimerOperation, TimerOutput, UiOperation,
};
use crate::model::{ConnectionId, TimerId};
use crate::storage::{DurableStore, MemoryStore, SqliteStore};
use crate::{ClientConfig, ConfigError, Core, Effect, Event, ViewModel};

use self::http::HttpExecutor;
use self::socket::SocketHandle;
use self::timers::TimerRegistry;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] KvError),

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("shell has stopped")]
    Stopped,
}

/// Everything the loop reacts to: events from the host, and outcomes of
/// effects running in their own tasks.
pub(crate) enum Inbound {
    Event(Event),
    Http {
        request: Request<HttpRequest>,
        result: HttpResult,
    },
    Timer(TimerId),
    Socket {
        connection: ConnectionId,
        event: SocketEvent,
    },
}

/// Pick the durable store described by the config.
pub fn open_store(config: &ClientConfig) -> Result<Arc<dyn DurableStore>, ShellError> {
    match config.storage_path.as_deref() {
        Some(path) => {
            info!(path, "using SQLite storage");
            Ok(Arc::new(SqliteStore::open(path)?))
        }
        None => {
            info!("using in-memory storage");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

pub struct ShellHandle {
    inbound: mpsc::UnboundedSender<Inbound>,
    view: watch::Receiver<ViewModel>,
    task: JoinHandle<()>,
}

impl ShellHandle {
    pub fn dispatch(&self, event: Event) -> Result<(), ShellError> {
        self.inbound
            .send(Inbound::Event(event))
            .map_err(|_| ShellError::Stopped)
    }

    #[must_use]
    pub fn view(&self) -> ViewModel {
        self.view.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ViewModel> {
        self.view.clone()
    }

    pub async fn shutdown(self) {
        self.task.abort();
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!(error = %e, "shell task ended abnormally");
            }
        }
    }
}

/// Start the shell on the current tokio runtime. The core is configured
/// from `config` before any other event reaches it. UI operations come out
/// of the returned receiver.
pub fn start(
    config: &ClientConfig,
    store: Arc<dyn DurableStore>,
) -> Result<(ShellHandle, mpsc::UnboundedReceiver<UiOperation>), ShellError> {
    config.validate()?;
    let core = Core::new::<Capabilities>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (ui_tx, ui_rx) = mpsc::unbounded_channel();
    let (view_tx, view_rx) = watch::channel(core.view());

    let executor = Executor {
        http: HttpExecutor::new(config.request_timeout_ms, inbound_tx.clone())?,
        inbound: inbound_tx.clone(),
        store,
        sockets: HashMap::new(),
        timers: HashMap::new(),
        timer_tasks: TimerRegistry::default(),
        view: view_tx,
        ui: ui_tx,
    };

    inbound_tx
        .send(Inbound::Event(Event::Configure(config.clone())))
        .map_err(|_| ShellError::Stopped)?;
    let task = tokio::spawn(run(core, inbound_rx, executor));
    info!("shell started");

    Ok((
        ShellHandle {
            inbound: inbound_tx,
            view: view_rx,
            task,
        },
        ui_rx,
    ))
}

async fn run(core: Core, mut inbound: mpsc::UnboundedReceiver<Inbound>, mut executor: Executor) {
    while let Some(message) = inbound.recv().await {
        let effects = executor.receive(message, &core);
        executor.drain(effects, &core).await;
    }
    debug!("inbound channel closed, shell stopping");
}

struct Executor {
    http: HttpExecutor,
    inbound: mpsc::UnboundedSender<Inbound>,
    store: Arc<dyn DurableStore>,
    sockets: HashMap<ConnectionId, (SocketHandle, Request<SocketOperation>)>,
    timers: HashMap<TimerId, Request<TimerOperation>>,
    timer_tasks: TimerRegistry,
    view: watch::Sender<ViewModel>,
    ui: mpsc::UnboundedSender<UiOperation>,
}

impl Executor {
    /// Turn one inbound message into the effects the core asks for next.
    /// Outcomes for requests the core has already let go of are dropped.
    fn receive(&mut self, message: Inbound, core: &Core) -> Vec<Effect> {
        match message {
            Inbound::Event(event) => core.process_event(event),
            Inbound::Http {
                mut request,
                result,
            } => core.resolve(&mut request, result),
            Inbound::Timer(id) => {
                let Some(request) = self.timers.get_mut(&id) else {
                    debug!(timer = %id, "fired after cancel, ignored");
                    return Vec::new();
                };
                let repeat = matches!(request.operation, TimerOperation::Start { repeat: true, .. });
                let effects = core.resolve(request, TimerOutput::Fired);
                if !repeat {
                    self.timers.remove(&id);
                }
                effects
            }
            Inbound::Socket { connection, event } => {
                let Some((_, request)) = self.sockets.get_mut(&connection) else {
                    debug!(%connection, "event for a released socket ignored");
                    return Vec::new();
                };
                let last = event.is_terminal();
                let effects = core.resolve(request, event);
                if last {
                    self.sockets.remove(&connection);
                }
                effects
            }
        }
    }

    async fn drain(&mut self, effects: Vec<Effect>, core: &Core) {
        let mut queue = VecDeque::from(effects);
        while let Some(effect) = queue.pop_front() {
            queue.extend(self.execute(effect, core).await);
        }
    }

    async fn execute(&mut self, effect: Effect, core: &Core) -> Vec<Effect> {
        match effect {
            Effect::Render(_) => {
                self.view.send_replace(core.view());
                Vec::new()
            }
            Effect::Http(request) => {
                self.http.spawn(request);
                Vec::new()
            }
            Effect::KeyValue(mut request) => {
                let result = Self::key_value(&self.store, &request.operation).await;
                core.resolve(&mut request, result)
            }
            Effect::Socket(request) => {
                self.socket(request);
                Vec::new()
            }
            Effect::Timer(request) => {
                self.timer(request);
                Vec::new()
            }
            Effect::Ui(request) => {
                if self.ui.send(request.operation).is_err() {
                    debug!("no UI listener");
                }
                Vec::new()
            }
        }
    }

    #[instrument(skip_all, fields(op = kv_label(op)))]
    async fn key_value(
        store: &Arc<dyn DurableStore>,
        op: &KeyValueOperation,
    ) -> crux_kv::KeyValueResult {
        store.apply(op).await
    }

    fn socket(&mut self, request: Request<SocketOperation>) {
        match &request.operation {
            SocketOperation::Connect { connection, target } => {
                let connection = *connection;
                debug!(?target, "connecting");
                let socket = SocketHandle::open(connection, target, self.inbound.clone());
                self.sockets.insert(connection, (socket, request));
            }
            SocketOperation::Send { connection, text } => {
                let sent = self
                    .sockets
                    .get(connection)
                    .is_some_and(|(socket, _)| socket.send(text.clone()));
                if !sent {
                    debug!(%connection, "send on a closed socket dropped");
                }
            }
            SocketOperation::Close { connection } => {
                if self.sockets.remove(connection).is_some() {
                    debug!(%connection, "socket released");
                }
            }
        }
    }

    fn timer(&mut self, request: Request<TimerOperation>) {
        match request.operation {
            TimerOperation::Start {
                id,
                after_ms,
                repeat,
            } => {
                self.timer_tasks
                    .start(id, after_ms, repeat, self.inbound.clone());
                self.timers.insert(id, request);
            }
            TimerOperation::Cancel { id } => {
                self.timer_tasks.cancel(id);
                self.timers.remove(&id);
            }
        }
    }
}

fn kv_label(op: &KeyValueOperation) -> &str {
    match op {
        KeyValueOperation::Get { key }
        | KeyValueOperation::Set { key, .. }
        | KeyValueOperation::Delete { key }
        | KeyValueOperation::Exists { key } => key,
        KeyValueOperation::ListKeys { prefix, .. } => prefix,
    }
}
