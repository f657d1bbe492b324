//! Camera arbiter
//!
//! Single exclusive-access token for the camera. The live preview, the scan
//! worker and the calibration command all acquire it without blocking; whoever
//! loses gets "busy".

use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Who may hold the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Holder {
    Stream,
    Scan,
    Calibration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbiterState {
    Free,
    HeldByStream,
    HeldByScan,
    HeldByCalibration,
}

impl ArbiterState {
    fn held_by(holder: Holder) -> Self {
        match holder {
            Holder::Stream => ArbiterState::HeldByStream,
            Holder::Scan => ArbiterState::HeldByScan,
            Holder::Calibration => ArbiterState::HeldByCalibration,
        }
    }

    pub fn holder(&self) -> Option<Holder> {
        match self {
            ArbiterState::Free => None,
            ArbiterState::HeldByStream => Some(Holder::Stream),
            ArbiterState::HeldByScan => Some(Holder::Scan),
            ArbiterState::HeldByCalibration => Some(Holder::Calibration),
        }
    }
}

impl fmt::Display for ArbiterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArbiterState::Free => "free",
            ArbiterState::HeldByStream => "held by live preview",
            ArbiterState::HeldByScan => "held by scan",
            ArbiterState::HeldByCalibration => "held by calibration",
        };
        f.write_str(s)
    }
}

/// Shared handle to the camera token. Clones refer to the same token.
#[derive(Debug, Clone)]
pub struct CameraArbiter {
    state: Arc<Mutex<ArbiterState>>,
}

impl Default for CameraArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraArbiter {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(ArbiterState::Free)) }
    }

    fn lock(&self) -> MutexGuard<'_, ArbiterState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Take the camera for `holder` if it is free. Never blocks.
    ///
    /// On failure returns the state that blocked the attempt.
    pub fn try_acquire(&self, holder: Holder) -> Result<(), ArbiterState> {
        let mut state = self.lock();
        if *state != ArbiterState::Free {
            debug!(target: "arbiter", "{:?} refused, camera {}", holder, *state);
            return Err(*state);
        }
        *state = ArbiterState::held_by(holder);
        info!(target: "arbiter", "Camera acquired by {:?}", holder);
        Ok(())
    }

    /// Like `try_acquire`, returning a guard that releases on drop.
    pub fn try_lease(&self, holder: Holder) -> Result<ArbiterLease, ArbiterState> {
        self.try_acquire(holder)?;
        Ok(ArbiterLease { arbiter: self.clone(), holder, released: false })
    }

    /// Release the camera if `holder` holds it; otherwise a no-op.
    ///
    /// Returns whether a hold was actually released.
    pub fn release(&self, holder: Holder) -> bool {
        let mut state = self.lock();
        if state.holder() == Some(holder) {
            *state = ArbiterState::Free;
            info!(target: "arbiter", "Camera released by {:?}", holder);
            true
        } else {
            debug!(target: "arbiter", "Release by {:?} ignored, camera {}", holder, *state);
            false
        }
    }

    /// Free the camera whoever holds it. Safe in any state.
    pub fn force_release(&self) -> ArbiterState {
        let mut state = self.lock();
        let previous = *state;
        *state = ArbiterState::Free;
        if previous == ArbiterState::Free {
            info!(target: "arbiter", "Force release requested, camera already free");
        } else {
            warn!(target: "arbiter", "Camera force-released (was {})", previous);
        }
        previous
    }

    pub fn state(&self) -> ArbiterState {
        *self.lock()
    }

    pub fn is_free(&self) -> bool {
        self.state() == ArbiterState::Free
    }
}

/// Scoped hold on the camera.
#[derive(Debug)]
pub struct ArbiterLease {
    arbiter: CameraArbiter,
    holder: Holder,
    released: bool,
}

impl ArbiterLease {
    pub fn holder(&self) -> Holder {
        self.holder
    }

    /// Release now instead of at drop.
    pub fn release(mut self) -> bool {
        self.released = true;
        self.arbiter.release(self.holder)
    }
}

impl Drop for ArbiterLease {
    fn drop(&mut self) {
        if !self.released {
            self.arbiter.release(self.holder);
        }
    }
}
