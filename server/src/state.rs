//! Server lifecycle state and its synchronised holder

use log::debug;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Lifecycle of a [`Server`](crate::Server)
///
/// Transitions only move forward:
/// `Initializing -> Running -> (Failure | Terminating)`,
/// `Initializing -> Failure` and `Failure -> Terminating`.
/// `Terminating` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Initializing,
    Running,
    Failure,
    Terminating,
}

impl State {
    /// Returns true when moving from `self` to `next` is a forward step
    pub fn can_transition_to(self, next: State) -> bool {
        use State::*;
        matches!(
            (self, next),
            (Initializing, Running)
                | (Initializing, Failure)
                | (Running, Failure)
                | (Running, Terminating)
                | (Failure, Terminating)
        )
    }
}

/// State value guarded by a mutex, with a condvar for waiters
pub struct SyncState {
    value: Mutex<State>,
    changed: Condvar,
}

impl SyncState {
    pub fn new(initial: State) -> Self {
        Self {
            value: Mutex::new(initial),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> State {
        *self.value.lock()
    }

    pub fn is(&self, state: State) -> bool {
        self.get() == state
    }

    /// Moves from `expected` to `next`; fails if the current value differs
    /// or the step is not a forward transition
    pub fn exchange(&self, expected: State, next: State) -> Result<(), State> {
        let mut value = self.value.lock();
        if *value != expected || !expected.can_transition_to(next) {
            return Err(*value);
        }
        debug!("Server state {:?} -> {:?}", *value, next);
        *value = next;
        self.changed.notify_all();
        Ok(())
    }

    /// Moves to `next` if that is a forward step and returns the previous
    /// value either way
    pub fn set_and_return_old(&self, next: State) -> State {
        let mut value = self.value.lock();
        let old = *value;
        if old.can_transition_to(next) {
            debug!("Server state {:?} -> {:?}", old, next);
            *value = next;
            self.changed.notify_all();
        }
        old
    }

    /// Blocks until the state is one of `states` or the timeout elapses
    pub fn wait_for(&self, states: &[State], timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut value = self.value.lock();
        while !states.contains(&*value) {
            if self.changed.wait_until(&mut value, deadline).timed_out() {
                return states.contains(&*value);
            }
        }
        true
    }
}
