use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::debug;

use crate::model::TimerId;

use super::Inbound;

/// Tokio tasks behind the live timers. Cancelling aborts the task so a
/// cancelled timer can never fire.
#[derive(Debug, Default)]
pub struct TimerRegistry {
    timers: HashMap<TimerId, JoinHandle<()>>,
}

impl TimerRegistry {
    pub fn start(&mut self, id: TimerId, after_ms: u64, repeat: bool, inbound: UnboundedSender<Inbound>) {
        self.timers.retain(|_, handle| !handle.is_finished());
        let period = Duration::from_millis(after_ms);

        let handle = tokio::spawn(async move {
            if repeat {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if inbound.send(Inbound::Timer(id)).is_err() {
                        break;
                    }
                }
            } else {
                sleep(period).await;
                let _ = inbound.send(Inbound::Timer(id));
            }
        });

        if let Some(old) = self.timers.insert(id, handle) {
            old.abort();
        }
        debug!(timer = %id, after_ms, repeat, active = self.active(), "timer started");
    }

    pub fn cancel(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            debug!(timer = %id, "timer cancelled");
            handle.abort();
        }
    }

    pub fn active(&self) -> usize {
        self.timers.values().filter(|h| !h.is_finished()).count()
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}
