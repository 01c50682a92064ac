use crux_core::capability::{Capability, CapabilityContext, Operation};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::model::TimerId;

/// Timers are owned by the core and identified by id. A `Start` request is
/// resolved with [`TimerOutput::Fired`] on every expiry until the timer is
/// cancelled; a one-shot timer needs a single resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerOperation {
    Start {
        id: TimerId,
        after_ms: u64,
        repeat: bool,
    },
    Cancel {
        id: TimerId,
    },
}

impl TimerOperation {
    #[must_use]
    pub const fn once(id: TimerId, after_ms: u64) -> Self {
        Self::Start {
            id,
            after_ms,
            repeat: false,
        }
    }

    #[must_use]
    pub const fn every(id: TimerId, after_ms: u64) -> Self {
        Self::Start {
            id,
            after_ms,
            repeat: true,
        }
    }

    #[must_use]
    pub const fn id(&self) -> TimerId {
        match self {
            Self::Start { id, .. } | Self::Cancel { id } => *id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerOutput {
    Fired,
}

impl Operation for TimerOperation {
    type Output = TimerOutput;
}

pub struct Timer<Ev> {
    context: CapabilityContext<TimerOperation, Ev>,
}

impl<Ev> Clone for Timer<Ev> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
        }
    }
}

impl<Ev> Capability<Ev> for Timer<Ev> {
    type Operation = TimerOperation;
    type MappedSelf<MappedEv> = Timer<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Timer::new(self.context.map_event(f))
    }
}

impl<Ev> Timer<Ev>
where
    Ev: 'static,
{
    pub fn new(context: CapabilityContext<TimerOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn once<F>(&self, id: TimerId, after_ms: u64, make_event: F)
    where
        F: Fn(TimerId) -> Ev + Send + Sync + 'static,
    {
        self.start(TimerOperation::once(id, after_ms), make_event);
    }

    pub fn every<F>(&self, id: TimerId, period_ms: u64, make_event: F)
    where
        F: Fn(TimerId) -> Ev + Send + Sync + 'static,
    {
        self.start(TimerOperation::every(id, period_ms), make_event);
    }

    pub fn cancel(&self, id: TimerId) {
        let context = self.context.clone();
        self.context.spawn(async move {
            context.notify_shell(TimerOperation::Cancel { id }).await;
        });
    }

    fn start<F>(&self, operation: TimerOperation, make_event: F)
    where
        F: Fn(TimerId) -> Ev + Send + Sync + 'static,
    {
        let context = self.context.clone();
        let (id, repeat) = match operation {
            TimerOperation::Start { id, repeat, .. } => (id, repeat),
            TimerOperation::Cancel { id } => (id, false),
        };
        self.context.spawn(async move {
            let mut ticks = context.stream_from_shell(operation);
            while let Some(TimerOutput::Fired) = ticks.next().await {
                context.update_app(make_event(id));
                if !repeat {
                    break;
                }
            }
        });
    }
}
