/*!
Process lifecycle: termination signals and safe teardown.

Teardown runs in two phases across every registered component: first every
enable line is driven off, then every power rail. Only after both phases is
the GPIO handle released.
*/

use crate::hardware::{lock, SharedGpio};
use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

/// A component that holds hardware in a state that must be unwound at exit
pub trait Teardown: Send {
    /// Drive every enable line this component owns to its off state
    fn disable_outputs(&mut self);

    /// Switch off every power rail this component owns. Only called after
    /// `disable_outputs` has run on every registered component.
    fn power_down(&mut self) {}

    /// Both phases for this component alone
    fn teardown(&mut self) {
        self.disable_outputs();
        self.power_down();
    }
}

/// Termination request raised by SIGINT/SIGTERM/SIGHUP or by [`ShutdownSignal::trigger`]
#[derive(Clone)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        let (tx, rx) = bounded(1);
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            tx,
            rx,
        }
    }
}

impl ShutdownSignal {
    /// A signal that only fires when triggered programmatically
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the process signal handler. Can be called once per process.
    pub fn install() -> Result<Self> {
        let signal = Self::new();
        let handler = signal.clone();
        ctrlc::set_handler(move || {
            info!("Termination signal received, shutting down");
            handler.trigger();
        })
        .context("Failed to install termination signal handler")?;
        Ok(signal)
    }

    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        // A full channel means a wakeup is already pending
        let _ = self.tx.try_send(());
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Sleep for up to `timeout`. Returns true if shutdown was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_requested() {
            return true;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => self.is_requested(),
        }
    }

    /// Block until shutdown is requested
    pub fn wait(&self) {
        while !self.wait_timeout(Duration::from_secs(3600)) {}
    }
}

type Component = Arc<Mutex<dyn Teardown>>;

/// Guard that unwinds the hardware exactly once, on `finish()` or on drop
pub struct SafeShutdown {
    components: Vec<(String, Component)>,
    gpio: SharedGpio,
    done: bool,
}

impl SafeShutdown {
    pub fn new(gpio: SharedGpio) -> Self {
        Self {
            components: Vec::new(),
            gpio,
            done: false,
        }
    }

    /// Add a component; teardown visits components in registration order
    pub fn register(&mut self, name: impl Into<String>, component: Component) {
        self.components.push((name.into(), component));
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Run the teardown sequence now
    pub fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;

        info!("Safe shutdown: disabling outputs");
        for (_, component) in &self.components {
            lock(component).disable_outputs();
        }

        info!("Safe shutdown: powering down");
        for (_, component) in &self.components {
            lock(component).power_down();
        }

        if let Err(e) = lock(&self.gpio).release() {
            error!("Failed to release GPIO: {}", e);
        } else {
            info!(
                "Safe shutdown complete ({} component(s))",
                self.components.len()
            );
        }
    }
}

impl Drop for SafeShutdown {
    fn drop(&mut self) {
        if !self.done {
            warn!("Safe shutdown guard dropped without finish(), tearing down now");
            self.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{HardwareOp, SimulatedHardware};

    struct Recorder {
        name: &'static str,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Teardown for Recorder {
        fn disable_outputs(&mut self) {
            self.events.lock().unwrap().push(format!("{}:disable", self.name));
        }

        fn power_down(&mut self) {
            self.events.lock().unwrap().push(format!("{}:power", self.name));
        }
    }

    #[test]
    fn test_all_disables_before_any_power_down() {
        let bench = SimulatedHardware::new().into_bench();
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut guard = SafeShutdown::new(bench.context.gpio.clone());
        for name in ["a", "b"] {
            guard.register(
                name,
                Arc::new(Mutex::new(Recorder {
                    name,
                    events: events.clone(),
                })),
            );
        }

        guard.finish();
        guard.finish();
        drop(guard);

        assert_eq!(
            *events.lock().unwrap(),
            vec!["a:disable", "b:disable", "a:power", "b:power"]
        );
        assert_eq!(bench.log().entries(), vec![HardwareOp::Release]);
        assert!(bench.with(|sim| sim.is_released()));
    }

    #[test]
    fn test_drop_runs_teardown() {
        let bench = SimulatedHardware::new().into_bench();
        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let mut guard = SafeShutdown::new(bench.context.gpio.clone());
            guard.register(
                "only",
                Arc::new(Mutex::new(Recorder {
                    name: "only",
                    events: events.clone(),
                })),
            );
        }
        assert_eq!(events.lock().unwrap().len(), 2);
        assert!(bench.with(|sim| sim.is_released()));
    }

    #[test]
    fn test_shutdown_signal_wakes_waiter() {
        let signal = ShutdownSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(1)));

        let remote = signal.clone();
        let handle = std::thread::spawn(move || remote.trigger());
        assert!(signal.wait_timeout(Duration::from_secs(5)));
        handle.join().unwrap();

        assert!(signal.is_requested());
        assert!(signal.wait_timeout(Duration::from_millis(1)));
    }
}
