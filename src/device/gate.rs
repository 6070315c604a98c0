//! Cross-thread result handoff
//!
//! The driver delivers terminal statuses from its own thread. A `ResultGate`
//! holds one outcome slot per operation: the callback writes into it and
//! signals, the coordinator (async) or a plain thread waits on it.
//!
//! The slot only moves forward: `Pending -> Completed | Failed -> Taken`.
//! The first terminal write wins; later writes are ignored and logged.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tokio::sync::Notify;

use crate::error::{Error, Result};

enum Slot<T> {
    Pending,
    Completed(T),
    Failed(Error),
    Taken,
}

struct GateInner<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
    notify: Notify,
}

/// One-shot outcome cell shared between the driver callback and the waiter
pub struct ResultGate<T> {
    inner: Arc<GateInner<T>>,
}

impl<T> Clone for ResultGate<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for ResultGate<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResultGate<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GateInner {
                slot: Mutex::new(Slot::Pending),
                cond: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        // A panicking writer cannot leave the slot half-written
        self.inner.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn settle(&self, next: Slot<T>) -> bool {
        {
            let mut slot = self.lock();
            if !matches!(*slot, Slot::Pending) {
                return false;
            }
            *slot = next;
        }
        self.inner.cond.notify_all();
        // notify_one keeps a permit if the waiter has not parked yet
        self.inner.notify.notify_one();
        true
    }

    /// Store the terminal outcome. Returns false if the gate was already settled.
    pub fn publish(&self, value: T) -> bool {
        let stored = self.settle(Slot::Completed(value));
        if !stored {
            log::debug!("Ignoring late result, gate already settled");
        }
        stored
    }

    /// Store a failure. Returns false if the gate was already settled.
    pub fn fail(&self, error: Error) -> bool {
        let stored = self.settle(Slot::Failed(error));
        if !stored {
            log::debug!("Ignoring late failure: {}", slot_name(&self.lock()));
        }
        stored
    }

    /// Settle a still-pending gate with `MissingResult`
    pub fn close(&self, operation: &'static str) -> bool {
        let closed = self.settle(Slot::Failed(Error::MissingResult(operation)));
        if closed {
            log::warn!("{} returned without a terminal status", operation);
        }
        closed
    }

    pub fn is_settled(&self) -> bool {
        !matches!(*self.lock(), Slot::Pending)
    }

    fn try_take(&self) -> Option<Result<T>> {
        let mut slot = self.lock();
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Pending => {
                *slot = Slot::Pending;
                None
            }
            Slot::Completed(value) => Some(Ok(value)),
            Slot::Failed(error) => Some(Err(error)),
            Slot::Taken => Some(Err(Error::Driver("operation result already consumed".into()))),
        }
    }

    /// Suspend until the outcome is set, then take it. One waiter per gate.
    pub async fn wait(&self) -> Result<T> {
        loop {
            if let Some(outcome) = self.try_take() {
                return outcome;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Blocking variant for plain threads
    pub fn wait_blocking(&self) -> Result<T> {
        let mut slot = self.lock();
        while matches!(*slot, Slot::Pending) {
            slot = self
                .inner
                .cond
                .wait(slot)
                .unwrap_or_else(|e| e.into_inner());
        }
        drop(slot);
        self.try_take()
            .unwrap_or_else(|| Err(Error::MissingResult("wait")))
    }
}

fn slot_name<T>(slot: &Slot<T>) -> &'static str {
    match slot {
        Slot::Pending => "pending",
        Slot::Completed(_) => "completed",
        Slot::Failed(_) => "failed",
        Slot::Taken => "taken",
    }
}
