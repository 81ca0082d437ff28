/*!
Hardware capability interfaces.

Every component talks to the board through three small traits so that the
control logic can run against real Linux devices or the simulator:

- [`DigitalIo`] - single-bit GPIO read/write by logical pin number
- [`I2cBus`] - block read/write at a 7-bit device address
- [`Delay`] - blocking waits (bit timing and settle delays)

Handles are shared as `Arc<Mutex<dyn ...>>`; holding the mutex is what makes
a pin sequence or an I2C transaction atomic with respect to other callers.
Never hold the GPIO lock while taking the I2C lock (the simulator backs both
with the same mutex).
*/

use bf_shared::HardwareError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub mod sim;

#[cfg(feature = "linux")]
pub mod linux;

/// Logical pin identifier (physical header pin number on the controller)
pub type Pin = u32;

/// Single-bit digital I/O
pub trait DigitalIo: Send {
    /// Drive an output pin high (`true`) or low
    fn write(&mut self, pin: Pin, high: bool) -> Result<(), HardwareError>;

    /// Sample a pin. Output pins report their actual electrical level.
    fn read(&mut self, pin: Pin) -> Result<bool, HardwareError>;

    /// Release all lines back to the OS. Called once, last, during teardown.
    fn release(&mut self) -> Result<(), HardwareError> {
        Ok(())
    }
}

/// Block-oriented I2C access
pub trait I2cBus: Send {
    /// Read `buf.len()` bytes starting at `register`
    fn read_block(&mut self, address: u8, register: u8, buf: &mut [u8]) -> Result<(), HardwareError>;

    /// Write `data` starting at `register`
    fn write_block(&mut self, address: u8, register: u8, data: &[u8]) -> Result<(), HardwareError>;
}

/// Blocking delay provider
pub trait Delay: Send + Sync {
    fn delay(&self, duration: Duration);
}

pub type SharedGpio = Arc<Mutex<dyn DigitalIo>>;
pub type SharedI2c = Arc<Mutex<dyn I2cBus>>;
pub type SharedDelay = Arc<dyn Delay>;

/// Lock a hardware mutex, recovering the guard if a previous holder panicked.
/// Teardown must still be able to reach the pins after a panic elsewhere.
pub fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything a component needs to reach the hardware
#[derive(Clone)]
pub struct HardwareContext {
    pub gpio: SharedGpio,
    pub i2c: SharedI2c,
    pub delay: SharedDelay,
}

impl HardwareContext {
    pub fn new(gpio: SharedGpio, i2c: SharedI2c, delay: SharedDelay) -> Self {
        Self { gpio, i2c, delay }
    }
}

/// Delays below this are busy-waited; thread::sleep overshoots by far more
const SPIN_THRESHOLD: Duration = Duration::from_micros(100);

/// Wall-clock delay for real hardware
#[derive(Debug, Default, Clone, Copy)]
pub struct StdDelay;

impl Delay for StdDelay {
    fn delay(&self, duration: Duration) {
        if duration < SPIN_THRESHOLD {
            let start = Instant::now();
            while start.elapsed() < duration {
                std::hint::spin_loop();
            }
        } else {
            std::thread::sleep(duration);
        }
    }
}
