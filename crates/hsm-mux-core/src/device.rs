//! Per-device load tracking: the device state machine plus the busy counter
//! the load balancer reads.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

/// Weight reported for a device that must not be picked automatically.
pub const UNUSABLE_WEIGHT: u64 = 1 << 31;

/// Added to the busy count while a device reports `KeyGen`.
pub const KEYGEN_STATE_BONUS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceState {
    Locked,
    Ready,
    KeyGen,
    Busy,
    NotReady,
    Failed,
    Tamper,
    TamperReset,
}

impl DeviceState {
    pub fn is_usable(self) -> bool {
        !matches!(
            self,
            DeviceState::Locked | DeviceState::NotReady | DeviceState::Failed | DeviceState::Tamper
        )
    }

    /// Operator-facing text reported by the state query.
    pub fn description(self) -> &'static str {
        match self {
            DeviceState::Locked => "The HSM must be unlocked. Please login using the setup console.",
            DeviceState::Ready => "Active - Ready",
            DeviceState::KeyGen => "Active - Generating a key",
            DeviceState::Busy => "Active - Busy",
            DeviceState::NotReady => "Device not ready",
            DeviceState::Failed => "Device failure. Try restarting the HSM.",
            DeviceState::Tamper => "ERROR - Tamper detected",
            DeviceState::TamperReset => {
                "WARNING - A tamper event has stopped. Please check the HSM and restart it."
            }
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[derive(Debug)]
pub struct DeviceLoad {
    index: usize,
    state: Mutex<DeviceState>,
    busy: AtomicU64,
}

impl DeviceLoad {
    pub fn new(index: usize) -> Self {
        Self::with_state(index, DeviceState::Ready)
    }

    pub fn with_state(index: usize, state: DeviceState) -> Self {
        Self {
            index,
            state: Mutex::new(state),
            busy: AtomicU64::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    /// Moves to `next` unless the device is in `Tamper`. Returns whether the
    /// state changed.
    pub fn change_state(&self, next: DeviceState) -> bool {
        let mut state = self.state.lock();
        if *state == DeviceState::Tamper {
            if next != DeviceState::Tamper {
                warn!(device = self.index, requested = ?next, "ignoring state change while tampered");
            }
            return false;
        }
        if *state != next {
            debug!(device = self.index, from = ?*state, to = ?next, "device state change");
        }
        *state = next;
        true
    }

    pub fn unlock(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            DeviceState::Locked | DeviceState::TamperReset => {
                *state = DeviceState::Ready;
                true
            }
            _ => false,
        }
    }

    /// The only way out of `Tamper`.
    pub fn clear_tamper(&self, next: DeviceState) -> bool {
        let mut state = self.state.lock();
        if *state != DeviceState::Tamper {
            return false;
        }
        debug!(device = self.index, to = ?next, "tamper cleared");
        *state = next;
        true
    }

    pub fn busy_count(&self) -> u64 {
        self.busy.load(Ordering::Acquire)
    }

    pub fn increment(&self, amount: u64) {
        let _ = self
            .busy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(amount))
            });
    }

    /// Saturates at zero.
    pub fn decrement(&self, amount: u64) {
        let _ = self
            .busy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(amount))
            });
    }

    /// `-1` when unusable, else the busy count plus the keygen bonus.
    pub fn busy_factor(&self) -> i64 {
        let state = self.state();
        if !state.is_usable() {
            return -1;
        }
        let mut factor = self.busy_count();
        if state == DeviceState::KeyGen {
            factor = factor.saturating_add(KEYGEN_STATE_BONUS);
        }
        i64::try_from(factor).unwrap_or(i64::MAX)
    }

    /// Scheduling weight; unusable devices report [`UNUSABLE_WEIGHT`].
    pub fn weight(&self) -> u64 {
        match u64::try_from(self.busy_factor()) {
            Ok(factor) => factor.min(UNUSABLE_WEIGHT - 1),
            Err(_) => UNUSABLE_WEIGHT,
        }
    }
}
