//! Signal-backed trigger: fires whenever the process receives a given Unix
//! signal (e.g. `SIGWINCH` for terminal resize). Built on `signal-hook`,
//! which chains onto any pre-existing handler for the same signal rather
//! than replacing it.

use std::sync::Mutex;
use std::thread::JoinHandle;

use signal_hook::iterator::{Handle, Signals};

use super::Trigger;

struct Armed {
    handle: Handle,
    join: JoinHandle<()>,
}

/// Watches a single signal number.
pub struct SignalListener {
    signal: i32,
    armed: Mutex<Option<Armed>>,
}

impl SignalListener {
    /// Creates a listener for `signal` (e.g. `libc::SIGWINCH`).
    pub fn new(signal: i32) -> Self {
        SignalListener {
            signal,
            armed: Mutex::new(None),
        }
    }
}

impl Trigger for SignalListener {
    fn arm(&self, callback: std::sync::Arc<dyn Fn() + Send + Sync>) {
        let mut guard = self.armed.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let mut signals = match Signals::new([self.signal]) {
            Ok(signals) => signals,
            Err(error) => {
                tracing::warn!(signal = self.signal, %error, "failed to register signal listener");
                return;
            }
        };
        let handle = signals.handle();
        let join = std::thread::spawn(move || {
            for _ in signals.forever() {
                callback();
            }
        });
        *guard = Some(Armed { handle, join });
    }

    fn disarm(&self) {
        let armed = self.armed.lock().unwrap().take();
        if let Some(Armed { handle, join }) = armed {
            handle.close();
            let _ = join.join();
        }
    }
}
