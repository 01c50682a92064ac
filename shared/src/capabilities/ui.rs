use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};

use crate::model::LatLon;

/// Commands for whatever draws the map. The core never renders tiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MapCommand {
    ShowPickup { at: LatLon },
    ShowDestination { at: LatLon },
    DrawRoute { points: Vec<LatLon> },
    FitToRoute { points: Vec<LatLon> },
    ClearOverlays,
    Recenter { center: LatLon, zoom: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Screen {
    #[default]
    Login,
    Register,
    Dashboard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToastKind {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toast {
    pub kind: ToastKind,
    pub message: String,
}

impl Toast {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            kind: ToastKind::Info,
            message: message.into(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            kind: ToastKind::Success,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            kind: ToastKind::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: ToastKind::Error,
            message: message.into(),
        }
    }
}

impl From<&crate::AppError> for Toast {
    fn from(err: &crate::AppError) -> Self {
        let message = err.user_facing_message();
        match err.severity {
            crate::ErrorSeverity::Transient => Self::warning(message),
            crate::ErrorSeverity::Permanent | crate::ErrorSeverity::Fatal => Self::error(message),
        }
    }
}

/// Fire-and-forget requests to the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UiOperation {
    Map(MapCommand),
    Navigate(Screen),
    Notify(Toast),
}

impl Operation for UiOperation {
    type Output = ();
}

pub struct Ui<Ev> {
    context: CapabilityContext<UiOperation, Ev>,
}

impl<Ev> Clone for Ui<Ev> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
        }
    }
}

impl<Ev> Capability<Ev> for Ui<Ev> {
    type Operation = UiOperation;
    type MappedSelf<MappedEv> = Ui<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Ui::new(self.context.map_event(f))
    }
}

impl<Ev> Ui<Ev>
where
    Ev: 'static,
{
    pub fn new(context: CapabilityContext<UiOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn map(&self, command: MapCommand) {
        self.notify_shell(UiOperation::Map(command));
    }

    pub fn navigate(&self, screen: Screen) {
        self.notify_shell(UiOperation::Navigate(screen));
    }

    pub fn notify(&self, toast: Toast) {
        self.notify_shell(UiOperation::Notify(toast));
    }

    fn notify_shell(&self, operation: UiOperation) {
        let context = self.context.clone();
        self.context.spawn(async move {
            context.notify_shell(operation).await;
        });
    }
}
