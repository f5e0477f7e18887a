//! The cancellation signal a launch can be raced against.

use std::time::Duration;

use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::Threading::SetEvent;

use crate::error::{Error, LaunchPhase, Result};
use crate::handles::{create_manual_reset_event, SharedHandle};

/// A manual-reset event the monitor thread waits on alongside the job's
/// completion port. Once signaled it stays signaled, so a launch attached
/// after the fact observes the cancellation immediately.
///
/// Clones share the same underlying event; the handle is released when the
/// last clone and the monitor thread holding it are gone.
#[derive(Debug, Clone)]
pub struct CancellationEvent {
    event: SharedHandle,
}

impl CancellationEvent {
    pub fn new() -> Result<Self> {
        let event = create_manual_reset_event()
            .map_err(|e| Error::launch(LaunchPhase::AcquireResources, e))?;
        Ok(Self { event: SharedHandle::new(event) })
    }

    /// Signals cancellation. Idempotent.
    pub fn cancel(&self) -> Result<()> {
        unsafe {
            SetEvent(self.event.raw()).map_err(|e| Error::launch(LaunchPhase::Monitor, e))
        }
    }

    /// Signals cancellation after the given delay, from a detached timer
    /// thread. The usual way to express a launch timeout.
    pub fn cancel_after(&self, delay: Duration) {
        let this = self.clone();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            let _ = this.cancel();
        });
    }

    pub(crate) fn raw(&self) -> HANDLE {
        self.event.raw()
    }

    pub(crate) fn share(&self) -> SharedHandle {
        self.event.clone()
    }
}
