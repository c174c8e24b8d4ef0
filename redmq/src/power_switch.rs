//! Power switch of producers and consumers
//!
//! A tri-state switch guarding start and stop. A transition is announced
//! with [`PowerSwitch::going_up`] or [`PowerSwitch::going_down`] and settled
//! with [`PowerSwitch::commit`] or [`PowerSwitch::rollback`].

use std::sync::Mutex;

/// Position of the switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Stopped
    Down,
    /// Transition towards `Up` (`true`) or `Down` (`false`) in progress
    Pending(bool),
    /// Running
    Up,
}

/// Start/stop guard
#[derive(Debug)]
pub struct PowerSwitch {
    state: Mutex<PowerState>,
}

impl Default for PowerSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerSwitch {
    /// A switch in the `Down` position
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PowerState::Down),
        }
    }

    /// Current position
    pub fn state(&self) -> PowerState {
        *self.lock()
    }

    /// Whether the switch is up
    pub fn is_up(&self) -> bool {
        self.state() == PowerState::Up
    }

    /// Whether the switch is down
    pub fn is_down(&self) -> bool {
        self.state() == PowerState::Down
    }

    /// Whether a transition is in progress
    pub fn is_pending(&self) -> bool {
        matches!(self.state(), PowerState::Pending(_))
    }

    /// Whether a transition towards `Up` is in progress
    pub fn is_going_up(&self) -> bool {
        self.state() == PowerState::Pending(true)
    }

    /// Whether a transition towards `Down` is in progress
    pub fn is_going_down(&self) -> bool {
        self.state() == PowerState::Pending(false)
    }

    /// Start a transition to `Up`
    ///
    /// Returns `false` when a transition is pending or the switch is up.
    pub fn going_up(&self) -> bool {
        self.begin(true)
    }

    /// Start a transition to `Down`
    ///
    /// Returns `false` when a transition is pending or the switch is down.
    pub fn going_down(&self) -> bool {
        self.begin(false)
    }

    /// Complete the pending transition
    ///
    /// Returns `false` when nothing was pending.
    pub fn commit(&self) -> bool {
        let mut state = self.lock();
        match *state {
            PowerState::Pending(up) => {
                *state = if up { PowerState::Up } else { PowerState::Down };
                true
            }
            _ => false,
        }
    }

    /// Abandon the pending transition
    ///
    /// Returns `false` when nothing was pending.
    pub fn rollback(&self) -> bool {
        let mut state = self.lock();
        match *state {
            PowerState::Pending(up) => {
                *state = if up { PowerState::Down } else { PowerState::Up };
                true
            }
            _ => false,
        }
    }

    fn begin(&self, up: bool) -> bool {
        let mut state = self.lock();
        let from = if up { PowerState::Down } else { PowerState::Up };
        if *state != from {
            return false;
        }
        *state = PowerState::Pending(up);
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PowerState> {
        // a poisoned guard still holds a valid state
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
