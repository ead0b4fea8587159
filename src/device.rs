//! Exclusive access to the single microphone/speaker.
//!
//! Capture and playback share one physical device. Every worker that touches
//! it first takes a [`DeviceLease`]; only one lease exists at a time and it is
//! returned when the lease is dropped, whatever path the worker exits by.

use crate::backends::{AudioBackend, InputStream, OutputSink};
use crate::{Error, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// What the lease holder is doing with the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseMode {
    Capture,
    Playback,
}

#[derive(Default)]
struct Slot {
    holder: Option<(u64, LeaseMode)>,
    next_id: u64,
}

struct Inner {
    slot: Mutex<Slot>,
    freed: Condvar,
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        // A panic while holding the slot mutex cannot leave the holder half
        // written, so a poisoned lock is still usable.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The process-wide lock over the audio device. Cheap to clone.
#[derive(Clone)]
pub struct DeviceGuard {
    inner: Arc<Inner>,
}

impl Default for DeviceGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceGuard {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot::default()),
                freed: Condvar::new(),
            }),
        }
    }

    /// Block until the device is free, then take it.
    pub fn acquire(&self, mode: LeaseMode) -> DeviceLease {
        let mut slot = self.inner.slot();
        while slot.holder.is_some() {
            slot = self
                .inner
                .freed
                .wait(slot)
                .unwrap_or_else(|e| e.into_inner());
        }
        self.grant(&mut slot, mode)
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    pub fn acquire_timeout(&self, mode: LeaseMode, timeout: Duration) -> Option<DeviceLease> {
        let slot = self.inner.slot();
        let (mut slot, _) = self
            .inner
            .freed
            .wait_timeout_while(slot, timeout, |s| s.holder.is_some())
            .unwrap_or_else(|e| e.into_inner());
        if slot.holder.is_some() {
            return None;
        }
        Some(self.grant(&mut slot, mode))
    }

    /// Take the device only if nobody holds it right now.
    pub fn try_acquire(&self, mode: LeaseMode) -> Option<DeviceLease> {
        let mut slot = self.inner.slot();
        if slot.holder.is_some() {
            return None;
        }
        Some(self.grant(&mut slot, mode))
    }

    /// Current holder, if any.
    pub fn holder(&self) -> Option<LeaseMode> {
        self.inner.slot().holder.map(|(_, mode)| mode)
    }

    pub fn is_free(&self) -> bool {
        self.holder().is_none()
    }

    fn grant(&self, slot: &mut Slot, mode: LeaseMode) -> DeviceLease {
        slot.next_id += 1;
        let id = slot.next_id;
        slot.holder = Some((id, mode));
        tracing::trace!(lease = id, ?mode, "audio device leased");
        DeviceLease {
            inner: Some(self.inner.clone()),
            id,
            mode,
        }
    }
}

/// Exclusive ownership of the audio device. Released on drop.
pub struct DeviceLease {
    inner: Option<Arc<Inner>>,
    id: u64,
    mode: LeaseMode,
}

impl DeviceLease {
    pub fn mode(&self) -> LeaseMode {
        self.mode
    }

    pub fn is_held(&self) -> bool {
        self.inner.is_some()
    }

    /// Give the device back. Calling this more than once is a no-op.
    pub fn release(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let mut slot = inner.slot();
        // Only clear the slot if it is still ours.
        if matches!(slot.holder, Some((id, _)) if id == self.id) {
            slot.holder = None;
            tracing::trace!(lease = self.id, mode = ?self.mode, "audio device released");
        }
        drop(slot);
        inner.freed.notify_all();
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for DeviceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLease")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("held", &self.is_held())
            .finish()
    }
}

/// The guard paired with the hardware it protects.
///
/// Opening a stream happens while the lease is held; if the backend cannot
/// open the device the lease is dropped before the error is returned.
#[derive(Clone)]
pub struct AudioDevice {
    guard: DeviceGuard,
    backend: Arc<dyn AudioBackend>,
}

impl AudioDevice {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            guard: DeviceGuard::new(),
            backend,
        }
    }

    pub fn guard(&self) -> &DeviceGuard {
        &self.guard
    }

    /// Lease the device and open the microphone at `sample_rate`.
    pub fn open_capture(
        &self,
        sample_rate: u32,
    ) -> Result<(DeviceLease, Box<dyn InputStream>)> {
        let lease = self.guard.acquire(LeaseMode::Capture);
        match self.backend.open_input(sample_rate) {
            Ok(stream) => Ok((lease, stream)),
            Err(e) => {
                drop(lease);
                Err(into_unavailable(e))
            }
        }
    }

    /// Lease the device and open the speaker.
    pub fn open_playback(&self) -> Result<(DeviceLease, Box<dyn OutputSink>)> {
        let lease = self.guard.acquire(LeaseMode::Playback);
        match self.backend.open_output() {
            Ok(sink) => Ok((lease, sink)),
            Err(e) => {
                drop(lease);
                Err(into_unavailable(e))
            }
        }
    }
}

fn into_unavailable(err: Error) -> Error {
    match err {
        Error::DeviceUnavailable(_) => err,
        other => Error::DeviceUnavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_second_acquire_waits_for_release() {
        let guard = DeviceGuard::new();
        let lease = guard.acquire(LeaseMode::Capture);
        assert!(guard.try_acquire(LeaseMode::Playback).is_none());
        assert_eq!(guard.holder(), Some(LeaseMode::Capture));

        let g = guard.clone();
        let waiter = thread::spawn(move || g.acquire(LeaseMode::Playback).mode());
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        drop(lease);
        assert_eq!(waiter.join().unwrap(), LeaseMode::Playback);
        assert!(guard.is_free());
    }

    #[test]
    fn test_release_is_idempotent() {
        let guard = DeviceGuard::new();
        let mut first = guard.acquire(LeaseMode::Capture);
        first.release();
        assert!(!first.is_held());

        let second = guard.acquire(LeaseMode::Playback);
        // Releasing the stale lease again must not free the new holder.
        first.release();
        drop(first);
        assert_eq!(guard.holder(), Some(LeaseMode::Playback));
        drop(second);
        assert!(guard.is_free());
    }

    #[test]
    fn test_lease_released_on_panic() {
        let guard = DeviceGuard::new();
        let g = guard.clone();
        let result = thread::spawn(move || {
            let _lease = g.acquire(LeaseMode::Playback);
            panic!("playback exploded");
        })
        .join();
        assert!(result.is_err());
        assert!(guard.is_free());
    }

    #[test]
    fn test_acquire_timeout() {
        let guard = DeviceGuard::new();
        let _held = guard.acquire(LeaseMode::Capture);
        let start = std::time::Instant::now();
        assert!(guard
            .acquire_timeout(LeaseMode::Playback, Duration::from_millis(30))
            .is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_concurrent_holders_never_overlap() {
        let guard = DeviceGuard::new();
        let active = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let guard = guard.clone();
                let active = active.clone();
                thread::spawn(move || {
                    for _ in 0..20 {
                        let mode = if i % 2 == 0 {
                            LeaseMode::Capture
                        } else {
                            LeaseMode::Playback
                        };
                        let _lease = guard.acquire(mode);
                        assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                        thread::yield_now();
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(guard.is_free());
    }
}
