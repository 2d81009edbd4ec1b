//! Single-slot registry behind the "stop" control.
//!
//! Only one cancel handle is held at a time. Registering a new handle
//! replaces the previous one, and the operation that owned it can no longer
//! be cancelled from the UI even though it keeps running. The replacement is
//! logged at `warn` so orphaned operations are visible in traces.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

pub type CancelFn = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

/// Event that triggered a cancel (usually a click on the stop control).
pub trait UiEvent {
    fn prevent_default(&mut self);
}

/// Event for callers that have no DOM event to hand over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyntheticEvent {
    pub default_prevented: bool,
}

impl UiEvent for SyntheticEvent {
    fn prevent_default(&mut self) {
        self.default_prevented = true;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelInvocation {
    Cancelled,
    NotYetArmed { remaining: Duration },
    Empty,
}

struct CancelHandle {
    id: HandleId,
    cancel: CancelFn,
    armed_at: Instant,
}

#[derive(Default)]
pub struct CancellableRequestRegistry {
    slot: Mutex<Option<CancelHandle>>,
    next_id: AtomicU64,
}

impl CancellableRequestRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `cancel`, replacing any handle already registered. With an
    /// `arm_delay` the handle stays inert until that much time has passed.
    pub fn register<F>(&self, cancel: F, arm_delay: Option<Duration>) -> HandleId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = CancelHandle {
            id,
            cancel: Box::new(cancel),
            armed_at: Instant::now() + arm_delay.unwrap_or(Duration::ZERO),
        };

        let previous = self.lock_slot().replace(handle);
        if let Some(previous) = previous {
            warn!(
                replaced = previous.id.0,
                handle = id.0,
                "cancel handle replaced; previous operation is no longer cancellable"
            );
        } else {
            debug!(
                handle = id.0,
                arm_delay_ms = ?arm_delay.map(|delay| delay.as_millis()),
                "cancel handle registered"
            );
        }
        id
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.lock_slot().is_some()
    }

    /// Whether the arm delay of the current handle has elapsed.
    #[must_use]
    pub fn is_cancel_available(&self) -> bool {
        self.lock_slot()
            .as_ref()
            .is_some_and(|handle| Instant::now() >= handle.armed_at)
    }

    #[must_use]
    pub fn current(&self) -> Option<HandleId> {
        self.lock_slot().as_ref().map(|handle| handle.id)
    }

    /// Suppresses the event's default action and runs the registered cancel
    /// function once its arm delay has elapsed. The handle is consumed.
    pub fn invoke(&self, event: &mut dyn UiEvent) -> CancelInvocation {
        event.prevent_default();

        let handle = {
            let mut slot = self.lock_slot();
            let Some((id, armed_at)) = slot.as_ref().map(|handle| (handle.id, handle.armed_at))
            else {
                return CancelInvocation::Empty;
            };
            let now = Instant::now();
            if now < armed_at {
                let remaining = armed_at - now;
                debug!(handle = id.0, ?remaining, "cancel ignored before arm delay");
                return CancelInvocation::NotYetArmed { remaining };
            }
            slot.take()
        };

        // The cancel function may call back into the registry.
        if let Some(handle) = handle {
            info!(handle = handle.id.0, "cancel invoked");
            (handle.cancel)();
        }
        CancelInvocation::Cancelled
    }

    /// Runs the current handle without waiting out its arm delay, for
    /// teardown paths such as logout. Returns whether a handle ran.
    pub fn cancel_current(&self) -> bool {
        let Some(handle) = self.lock_slot().take() else {
            return false;
        };
        info!(
            handle = handle.id.0,
            armed = Instant::now() >= handle.armed_at,
            "cancel forced"
        );
        (handle.cancel)();
        true
    }

    /// Drops the current handle without running it.
    pub fn clear(&self) {
        if let Some(handle) = self.lock_slot().take() {
            debug!(handle = handle.id.0, "cancel handle cleared");
        }
    }

    /// Drops the current handle only if it is still the one `id` names.
    pub fn clear_if_owned(&self, id: HandleId) -> bool {
        let mut slot = self.lock_slot();
        if slot.as_ref().is_some_and(|handle| handle.id == id) {
            *slot = None;
            debug!(handle = id.0, "cancel handle released by owner");
            true
        } else {
            false
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<CancelHandle>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
