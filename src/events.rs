//! The manager-wide event bus (spec.md §9 design notes: "the event bus is a
//! field on [the manager], not a module global").
//!
//! Cross-component notifications — process state changes, reload
//! start/end, log data, token metrics — flow through this single
//! broadcast channel rather than components holding references to each
//! other.

use tokio::sync::broadcast;

use crate::process::ProcessState;

/// Default capacity of the broadcast channel's internal ring; lagging
/// subscribers drop the oldest un-consumed events first (tokio::broadcast
/// semantics), consistent with the log fan-out's "slow subscribers drop"
/// rule (spec.md §4.3).
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// One notification published on the event bus.
#[derive(Debug, Clone)]
pub enum Event {
    /// A process completed a state transition (spec.md §4.4.1).
    ProcessStateChanged {
        model_id: String,
        from: ProcessState,
        to: ProcessState,
    },
    /// Config reload has begun (spec.md §4.8 step 1).
    ReloadingStart,
    /// Config reload has concluded, successfully or not (spec.md §4.8 step 6).
    ReloadingEnd { success: bool },
    /// A chunk of text was appended to the shared upstream log.
    LogData(Vec<u8>),
    /// A request's token-usage metric was recorded (spec.md §4.10).
    /// `metric_id` is the monotonically-assigned ID shared with any
    /// capture stored under it (spec.md §3.2).
    TokenMetrics {
        metric_id: u64,
        model_id: String,
        input_tokens: i64,
        output_tokens: i64,
    },
    /// A model finished its cold-start and became ready to serve.
    ModelPreloaded { model_id: String },
}

/// A thin wrapper over `tokio::sync::broadcast` so the manager can hand out
/// subscriptions without exposing the channel's sender half.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        // No subscribers is not an error: events are fire-and-forget.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
