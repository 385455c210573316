//! Timer service
//!
//! SA lifetimes, retransmissions and exchange timeouts are driven by an
//! external timer. The databases only schedule and cancel events; the
//! owner of the timer feeds fired events back through
//! [`IpsecDb::handle_timer`](super::spd::IpsecDb::handle_timer) or
//! [`IkeContext::handle_timer`](super::ike::engine::IkeContext::handle_timer).
//!
//! Two implementations are provided:
//!
//! - [`ManualTimer`] keeps a virtual clock that tests advance explicitly
//! - [`TokioTimer`] sleeps on the tokio runtime and delivers fired events
//!   through an mpsc channel

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::policy::IpsecProtocol;

/// Identifier of a scheduled event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// Events scheduled by the IPsec and IKE databases
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// Soft lifetime of an inbound SA (and its pair) reached
    SaSoftExpiry {
        /// Owning group
        group: String,
        /// Inbound SPI
        spi: u32,
        /// AH or ESP
        protocol: IpsecProtocol,
    },

    /// Hard lifetime of an inbound SA (and its pair) reached
    SaHardExpiry {
        /// Owning group
        group: String,
        /// Inbound SPI
        spi: u32,
        /// AH or ESP
        protocol: IpsecProtocol,
    },

    /// Resend the last message of an exchange
    IkeResend {
        /// Initiator cookie of the ISAKMP SA
        cookie: [u8; 8],
        /// Message id, zero for phase 1
        msg_id: u32,
    },

    /// Abort an exchange that did not complete in time
    IkeExchangeTimeout {
        /// Initiator cookie of the ISAKMP SA
        cookie: [u8; 8],
        /// Message id, zero for phase 1
        msg_id: u32,
    },

    /// Lifetime of an ISAKMP SA reached
    IkeSaExpiry {
        /// Initiator cookie of the ISAKMP SA
        cookie: [u8; 8],
    },
}

/// Timer collaborator
pub trait TimerService: Send + Sync {
    /// Schedule `event` to fire after `delay`
    fn schedule(&self, delay: Duration, event: TimerEvent) -> TimerId;

    /// Cancel a scheduled event; unknown or fired ids are ignored
    fn cancel(&self, id: TimerId);
}

#[derive(Debug)]
struct ManualEntry {
    id: TimerId,
    deadline: Duration,
    event: TimerEvent,
}

#[derive(Debug, Default)]
struct ManualState {
    now: Duration,
    next_id: u64,
    entries: Vec<ManualEntry>,
}

/// Virtual clock timer
///
/// Nothing fires on its own: [`advance`](Self::advance) moves the clock and
/// returns the events that became due, in deadline order.
#[derive(Debug, Default)]
pub struct ManualTimer {
    state: Mutex<ManualState>,
}

impl ManualTimer {
    /// Create a timer at virtual time zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward and collect due events
    pub fn advance(&self, by: Duration) -> Vec<TimerEvent> {
        let mut state = self.state.lock();
        state.now += by;
        let now = state.now;

        let mut due: Vec<ManualEntry> = Vec::new();
        let mut i = 0;
        while i < state.entries.len() {
            if state.entries[i].deadline <= now {
                due.push(state.entries.remove(i));
            } else {
                i += 1;
            }
        }
        due.sort_by_key(|e| (e.deadline, e.id.0));
        due.into_iter().map(|e| e.event).collect()
    }

    /// Events still scheduled, in deadline order
    pub fn pending(&self) -> Vec<TimerEvent> {
        let state = self.state.lock();
        let mut entries: Vec<&ManualEntry> = state.entries.iter().collect();
        entries.sort_by_key(|e| (e.deadline, e.id.0));
        entries.into_iter().map(|e| e.event.clone()).collect()
    }

    /// Virtual time elapsed so far
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }
}

impl TimerService for ManualTimer {
    fn schedule(&self, delay: Duration, event: TimerEvent) -> TimerId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = TimerId(state.next_id);
        let deadline = state.now + delay;
        state.entries.push(ManualEntry {
            id,
            deadline,
            event,
        });
        id
    }

    fn cancel(&self, id: TimerId) {
        self.state.lock().entries.retain(|e| e.id != id);
    }
}

/// Timer backed by the tokio runtime
///
/// Each scheduled event is a sleeping task; fired events are sent on the
/// channel returned by [`TokioTimer::new`]. Must be used from within a
/// runtime.
#[derive(Debug)]
pub struct TokioTimer {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<TimerId, JoinHandle<()>>>,
    sender: mpsc::UnboundedSender<TimerEvent>,
}

impl TokioTimer {
    /// Create the timer and the receiver of fired events
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let timer = TokioTimer {
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
            sender,
        };
        (timer, receiver)
    }
}

impl TimerService for TokioTimer {
    fn schedule(&self, delay: Duration, event: TimerEvent) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let sender = self.sender.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // receiver gone means the daemon is shutting down
            let _ = sender.send(event);
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(id, handle);
        id
    }

    fn cancel(&self, id: TimerId) {
        if let Some(task) = self.tasks.lock().remove(&id) {
            task.abort();
        }
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        for (_, task) in self.tasks.lock().drain() {
            task.abort();
        }
    }
}
