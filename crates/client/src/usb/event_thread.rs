//! Background USB event thread
//!
//! libusb only delivers transfer completions and hotplug callbacks from
//! inside `handle_events`, which blocks. A dedicated thread pumps it while
//! anybody is listening: a redirected device or a hotplug subscription.
//!
//! Listening is reference counted. The thread starts with the first
//! listener and is told to stop (run flag cleared, not joined) when the
//! last one goes away. A restart never waits for the previous thread: each
//! thread has its own run flag, so the old one finishes its last
//! `handle_events` call and exits on its own.

use crate::usb::backend::UsbBackend;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Upper bound for one `handle_events` call so a cleared run flag is noticed
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Default)]
struct ListenerState {
    listeners: usize,
    run: Option<Arc<AtomicBool>>,
    handle: Option<JoinHandle<()>>,
}

/// Reference-counted owner of the event thread
pub struct EventThread {
    backend: Arc<dyn UsbBackend>,
    state: Mutex<ListenerState>,
}

impl EventThread {
    pub fn new(backend: Arc<dyn UsbBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(ListenerState::default()),
        }
    }

    /// Add a listener, starting the thread if this is the first one
    pub fn start_listening(&self) -> std::io::Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.listeners += 1;
        if state.listeners > 1 {
            return Ok(());
        }

        // Detached; it may still be inside its last handle_events call
        if state.handle.take().is_some_and(|previous| !previous.is_finished()) {
            debug!("Previous USB event thread still finishing");
        }

        let run = Arc::new(AtomicBool::new(true));
        let backend = Arc::clone(&self.backend);
        let thread_run = Arc::clone(&run);

        let spawned = std::thread::Builder::new()
            .name("usb-events".to_string())
            .spawn(move || run_event_loop(backend, thread_run));

        match spawned {
            Ok(handle) => {
                state.run = Some(run);
                state.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                state.listeners -= 1;
                error!("Failed to spawn USB event thread: {}", e);
                Err(e)
            }
        }
    }

    /// Drop a listener, signalling the thread to stop when none remain
    pub fn stop_listening(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.listeners == 0 {
            warn!("stop_listening called without a matching start");
            return;
        }

        state.listeners -= 1;
        if state.listeners == 0
            && let Some(run) = state.run.take()
        {
            run.store(false, Ordering::SeqCst);
            debug!("USB event thread asked to stop");
        }
    }

    pub fn listeners(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .listeners
    }

    /// Whether a thread has been started and has not yet exited
    pub fn is_running(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for EventThread {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(run) = state.run.take() {
            run.store(false, Ordering::SeqCst);
        }
    }
}

fn run_event_loop(backend: Arc<dyn UsbBackend>, run: Arc<AtomicBool>) {
    info!("USB event thread started");

    while run.load(Ordering::SeqCst) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            backend.handle_events(EVENT_TIMEOUT)
        }));

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Error handling USB events: {}", e);
                // Transient errors are retried; back off so a persistent one
                // does not spin
                std::thread::sleep(EVENT_TIMEOUT);
            }
            Err(_) => {
                error!("Panic while handling USB events");
                std::thread::sleep(EVENT_TIMEOUT);
            }
        }
    }

    info!("USB event thread stopped");
}
