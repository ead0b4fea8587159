//! Background wake word listening.

use crate::backends::{ModelProvider, WakeEngine};
use crate::device::AudioDevice;
use crate::{worker, Error, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Longest a single frame read may wait before the stop flag is checked
const FRAME_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum WakeEvent {
    Detected,
    /// The worker stopped on its own
    Failed(Error),
}

struct Running {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Listens for the wake word on a dedicated thread.
///
/// While running, the worker holds the capture lease for the whole session.
pub struct WakeWordListener {
    device: AudioDevice,
    models: Arc<dyn ModelProvider>,
    running: Mutex<Option<Running>>,
}

impl WakeWordListener {
    pub fn new(device: AudioDevice, models: Arc<dyn ModelProvider>) -> Self {
        Self {
            device,
            models,
            running: Mutex::new(None),
        }
    }

    /// Start listening. Does nothing if a session is already running.
    ///
    /// The detector is built before any thread is spawned, so a missing or
    /// broken wake word model is reported here and nothing is left running.
    pub fn start<F>(&self, sensitivity: f32, on_event: F) -> Result<()>
    where
        F: Fn(WakeEvent) + Send + 'static,
    {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            tracing::debug!("wake listener already running");
            return Ok(());
        }

        if !(0.0..=1.0).contains(&sensitivity) {
            return Err(Error::InitializationFailed(format!(
                "wake sensitivity {} outside [0, 1]",
                sensitivity
            )));
        }
        let engine = self.models.load_wake(sensitivity)?;

        let stop = Arc::new(AtomicBool::new(false));
        let device = self.device.clone();
        let flag = stop.clone();
        let handle = worker::spawn("wake-listener", move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                listen(&device, engine, &flag, &on_event)
            }));
            match outcome {
                Ok(Ok(())) => tracing::debug!("wake listener stopped"),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "wake listener failed");
                    on_event(WakeEvent::Failed(e));
                }
                Err(_) => {
                    tracing::error!("wake listener panicked");
                    on_event(WakeEvent::Failed(Error::DeviceUnavailable(
                        "wake listener panicked".to_string(),
                    )));
                }
            }
        })?;

        *running = Some(Running { stop, handle });
        tracing::info!(sensitivity, "wake word listening started");
        Ok(())
    }

    /// Ask the worker to exit at its next frame boundary. Idempotent and
    /// never waits for the worker.
    pub fn stop(&self) {
        let taken = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(running) = taken {
            running.stop.store(true, Ordering::SeqCst);
            tracing::debug!("wake listener stop requested");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

impl Drop for WakeWordListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen<F>(
    device: &AudioDevice,
    mut engine: Box<dyn WakeEngine>,
    stop: &AtomicBool,
    on_event: &F,
) -> Result<()>
where
    F: Fn(WakeEvent),
{
    let (_lease, mut input) = device.open_capture(engine.sample_rate())?;
    let mut frame = vec![0i16; engine.frame_length().max(1)];

    while !stop.load(Ordering::SeqCst) {
        if !input.read_frame(&mut frame, FRAME_WAIT)? {
            continue;
        }
        // A frame that completes after stop was requested is discarded
        if stop.load(Ordering::SeqCst) {
            break;
        }
        if engine.process(&frame) {
            tracing::info!("wake word detected");
            on_event(WakeEvent::Detected);
        }
    }
    Ok(())
}
