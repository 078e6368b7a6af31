//! One-shot continuation sets backing `wait_until_start` / `wait_until_close`.
//!
//! Every continuation registered here is invoked exactly once: either by [`WaiterSet::fire`]
//! or, when the set already fired, immediately at registration. A set can also be
//! abandoned (the awaited state will never come); pending continuations are then dropped
//! without being invoked and async waiters observe an error.

use parking_lot::Mutex;
use tokio::sync::oneshot;

type Continuation = Box<dyn FnOnce() + Send>;

enum WaiterState {
    Pending(Vec<Continuation>),
    Fired,
    Abandoned,
}

/// Set of continuations waiting for one state transition.
pub(crate) struct WaiterSet {
    state: Mutex<WaiterState>,
}

/// Why a wait finished without the awaited transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitAborted {
    /// The set was abandoned, or dropped before firing
    Abandoned,
}

impl WaiterSet {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(WaiterState::Pending(Vec::new())),
        }
    }

    /// Register a continuation. Runs it right away if the set already fired.
    ///
    /// Returns `false` if the set was abandoned; the continuation is dropped uninvoked.
    pub(crate) fn register(&self, continuation: impl FnOnce() + Send + 'static) -> bool {
        let mut state = self.state.lock();
        if let WaiterState::Pending(pending) = &mut *state {
            pending.push(Box::new(continuation));
            return true;
        }

        let fired = matches!(*state, WaiterState::Fired);
        drop(state);
        if fired {
            continuation();
        }
        fired
    }

    /// Invoke every pending continuation once and clear the set.
    ///
    /// Later registrations run immediately. Firing twice, or after abandoning, does nothing.
    pub(crate) fn fire(&self) -> usize {
        let pending = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, WaiterState::Fired) {
                WaiterState::Pending(pending) => pending,
                other => {
                    *state = other;
                    return 0;
                }
            }
        };

        let count = pending.len();
        for continuation in pending {
            continuation();
        }
        count
    }

    /// Drop every pending continuation without invoking it.
    pub(crate) fn abandon(&self) {
        let mut state = self.state.lock();
        if matches!(*state, WaiterState::Pending(_)) {
            *state = WaiterState::Abandoned;
        }
    }

    /// Await the transition this set stands for.
    pub(crate) async fn wait(&self) -> Result<(), WaitAborted> {
        let (tx, rx) = oneshot::channel::<()>();
        if !self.register(move || {
            let _ = tx.send(());
        }) {
            return Err(WaitAborted::Abandoned);
        }
        rx.await.map_err(|_| WaitAborted::Abandoned)
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        match &*self.state.lock() {
            WaiterState::Pending(pending) => pending.len(),
            _ => 0,
        }
    }
}
