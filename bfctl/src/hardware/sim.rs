/*!
Simulated board hardware.

[`SimulatedHardware`] stands in for both the GPIO header and the I2C bus. It
keeps pin levels, per-address register blocks and an emulated beamformer on
each attached link. Every access is appended to a shared [`OpLog`] so tests
can assert ordering (including delays, via [`SimDelay`]) without sleeping.
*/

use super::{lock, Delay, DigitalIo, HardwareContext, I2cBus, Pin, SharedDelay, SharedGpio, SharedI2c, StdDelay};
use crate::transport::LinkPins;
use bf_shared::bitstream::verify_frame_bits;
use bf_shared::protocol::{DATA_WORDS, FRAME_BITS, TELEMETRY_BITS, TELEMETRY_OK_FLAGS};
use bf_shared::{HardwareError, TelemetryFrame};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One recorded hardware access
#[derive(Debug, Clone, PartialEq)]
pub enum HardwareOp {
    Write { pin: Pin, high: bool },
    Read { pin: Pin },
    I2cRead { address: u8, register: u8, len: usize },
    I2cWrite { address: u8, register: u8, data: Vec<u8> },
    Delay(Duration),
    Release,
}

#[derive(Debug, Default)]
struct LogInner {
    enabled: bool,
    entries: Vec<HardwareOp>,
}

/// Shared, cloneable operation log
#[derive(Debug, Clone)]
pub struct OpLog {
    inner: Arc<Mutex<LogInner>>,
}

impl Default for OpLog {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogInner {
                enabled: true,
                entries: Vec::new(),
            })),
        }
    }
}

impl OpLog {
    pub fn push(&self, op: HardwareOp) {
        let mut inner = lock(&self.inner);
        if inner.enabled {
            inner.entries.push(op);
        }
    }

    /// Stop or resume recording. Long-running simulated sessions turn it off.
    pub fn set_enabled(&self, enabled: bool) {
        lock(&self.inner).enabled = enabled;
    }

    pub fn entries(&self) -> Vec<HardwareOp> {
        lock(&self.inner).entries.clone()
    }

    pub fn clear(&self) {
        lock(&self.inner).entries.clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Levels written to one pin, in order
    pub fn writes_to(&self, pin: Pin) -> Vec<bool> {
        lock(&self.inner)
            .entries
            .iter()
            .filter_map(|op| match op {
                HardwareOp::Write { pin: p, high } if *p == pin => Some(*high),
                _ => None,
            })
            .collect()
    }

    /// Index of the first entry matching `op`
    pub fn position(&self, op: &HardwareOp) -> Option<usize> {
        lock(&self.inner).entries.iter().position(|e| e == op)
    }

    /// Index of the last entry matching `op`
    pub fn last_position(&self, op: &HardwareOp) -> Option<usize> {
        lock(&self.inner).entries.iter().rposition(|e| e == op)
    }

    /// Sum of every recorded delay
    pub fn total_delay(&self) -> Duration {
        lock(&self.inner)
            .entries
            .iter()
            .filter_map(|op| match op {
                HardwareOp::Delay(d) => Some(*d),
                _ => None,
            })
            .sum()
    }

    pub fn i2c_count(&self) -> usize {
        lock(&self.inner)
            .entries
            .iter()
            .filter(|op| matches!(op, HardwareOp::I2cRead { .. } | HardwareOp::I2cWrite { .. }))
            .count()
    }
}

/// Delay that records into an [`OpLog`] instead of sleeping
#[derive(Debug, Clone)]
pub struct SimDelay {
    log: OpLog,
}

impl SimDelay {
    pub fn new(log: OpLog) -> Self {
        Self { log }
    }
}

impl Delay for SimDelay {
    fn delay(&self, duration: Duration) {
        self.log.push(HardwareOp::Delay(duration));
    }
}

#[derive(Debug, Default)]
struct SimI2cDevice {
    registers: HashMap<u8, Vec<u8>>,
    failing: bool,
}

/// Emulated beamformer receiver on one link
#[derive(Debug)]
struct SimBeamformer {
    link: LinkPins,
    enable_pin: Option<Pin>,
    raw_temperature: u32,
    clock: bool,
    received: Vec<bool>,
    reply: Option<TelemetryFrame>,
    reply_index: usize,
    output: bool,
    frames: Vec<Option<[u16; DATA_WORDS]>>,
}

impl SimBeamformer {
    fn new(link: LinkPins, enable_pin: Option<Pin>, raw_temperature: u32) -> Self {
        Self {
            link,
            enable_pin,
            raw_temperature,
            clock: false,
            received: Vec::with_capacity(FRAME_BITS),
            reply: None,
            reply_index: 0,
            output: false,
            frames: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.received.clear();
        self.reply = None;
        self.reply_index = 0;
        self.output = false;
    }

    /// Clock line changed. Data is sampled, and reply bits presented, on rising edges.
    fn on_clock(&mut self, high: bool, data: bool, powered: bool) {
        let rising = high && !self.clock;
        self.clock = high;
        if !rising {
            return;
        }
        if !powered {
            self.reset();
            return;
        }

        if let Some(reply) = self.reply {
            self.output = reply.bits()[self.reply_index];
            self.reply_index += 1;
            if self.reply_index == TELEMETRY_BITS {
                self.reply = None;
                self.reply_index = 0;
            }
            return;
        }

        self.output = false;
        self.received.push(data);
        if self.received.len() == FRAME_BITS {
            let words = verify_frame_bits(&self.received);
            let flags = if words.is_some() { TELEMETRY_OK_FLAGS } else { 0x00 };
            self.frames.push(words);
            self.reply = Some(TelemetryFrame::from_parts(self.raw_temperature, flags));
            self.received.clear();
        }
    }
}

fn level_of(levels: &HashMap<Pin, bool>, stuck: &HashMap<Pin, bool>, pin: Pin) -> bool {
    stuck
        .get(&pin)
        .or_else(|| levels.get(&pin))
        .copied()
        .unwrap_or(false)
}

/// In-memory GPIO header and I2C bus
#[derive(Debug, Default)]
pub struct SimulatedHardware {
    log: OpLog,
    levels: HashMap<Pin, bool>,
    stuck: HashMap<Pin, bool>,
    devices: HashMap<u8, SimI2cDevice>,
    beamformers: Vec<SimBeamformer>,
    released: bool,
}

impl SimulatedHardware {
    pub fn new() -> Self {
        Self::default()
    }

    /// The log this instance records into
    pub fn log(&self) -> OpLog {
        self.log.clone()
    }

    /// Current electrical level of a pin (stuck value wins over driven value)
    pub fn level(&self, pin: Pin) -> bool {
        level_of(&self.levels, &self.stuck, pin)
    }

    /// Drive an input from outside (alarm lines, jumpers)
    pub fn set_input(&mut self, pin: Pin, high: bool) {
        self.levels.insert(pin, high);
    }

    /// Force a pin to read a fixed level regardless of writes
    pub fn stick_pin(&mut self, pin: Pin, high: bool) {
        self.stuck.insert(pin, high);
    }

    pub fn unstick_pin(&mut self, pin: Pin) {
        self.stuck.remove(&pin);
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Register an I2C device (with no registers yet) at `address`
    pub fn add_i2c_device(&mut self, address: u8) {
        self.devices.entry(address).or_default();
    }

    /// Set register contents, creating the device if needed
    pub fn set_register(&mut self, address: u8, register: u8, data: &[u8]) {
        self.devices
            .entry(address)
            .or_default()
            .registers
            .insert(register, data.to_vec());
    }

    pub fn register(&self, address: u8, register: u8) -> Option<&[u8]> {
        self.devices
            .get(&address)
            .and_then(|d| d.registers.get(&register))
            .map(Vec::as_slice)
    }

    /// Make every access to `address` fail (or succeed again)
    pub fn set_i2c_failure(&mut self, address: u8, failing: bool) {
        self.devices.entry(address).or_default().failing = failing;
    }

    /// Attach an emulated beamformer to a link. If `enable_pin` is given the
    /// beamformer only responds while that pin is high.
    pub fn attach_beamformer(&mut self, link: LinkPins, enable_pin: Option<Pin>, raw_temperature: u32) {
        self.beamformers
            .push(SimBeamformer::new(link, enable_pin, raw_temperature));
    }

    /// Frames received on the link whose data pin is `tx_data`; `None` entries
    /// failed header, marker or checksum verification
    pub fn received_frames(&self, tx_data: Pin) -> Vec<Option<[u16; DATA_WORDS]>> {
        self.beamformers
            .iter()
            .filter(|bf| bf.link.tx_data == tx_data)
            .flat_map(|bf| bf.frames.iter().copied())
            .collect()
    }

    /// Wrap into a shared handle and a context whose delays are only recorded
    pub fn into_bench(self) -> SimBench {
        let delay: SharedDelay = Arc::new(SimDelay::new(self.log.clone()));
        SimBench::new(self, delay)
    }

    /// Wrap into a shared handle and a context whose delays really elapse
    pub fn into_realtime_bench(self) -> SimBench {
        SimBench::new(self, Arc::new(StdDelay))
    }

    fn check_released(&self) -> Result<(), HardwareError> {
        if self.released {
            Err(HardwareError::Released)
        } else {
            Ok(())
        }
    }
}

impl DigitalIo for SimulatedHardware {
    fn write(&mut self, pin: Pin, high: bool) -> Result<(), HardwareError> {
        self.check_released()?;
        self.log.push(HardwareOp::Write { pin, high });
        self.levels.insert(pin, high);

        let levels = &self.levels;
        let stuck = &self.stuck;
        for bf in self.beamformers.iter_mut().filter(|bf| bf.link.tx_clock == pin) {
            let data = level_of(levels, stuck, bf.link.tx_data);
            let powered = bf.enable_pin.map_or(true, |p| level_of(levels, stuck, p));
            bf.on_clock(level_of(levels, stuck, pin), data, powered);
        }
        Ok(())
    }

    fn read(&mut self, pin: Pin) -> Result<bool, HardwareError> {
        self.check_released()?;
        self.log.push(HardwareOp::Read { pin });
        if let Some(&level) = self.stuck.get(&pin) {
            return Ok(level);
        }
        if let Some(bf) = self.beamformers.iter().find(|bf| bf.link.rx_data == pin) {
            return Ok(bf.output);
        }
        Ok(self.level(pin))
    }

    fn release(&mut self) -> Result<(), HardwareError> {
        self.log.push(HardwareOp::Release);
        self.released = true;
        Ok(())
    }
}

impl I2cBus for SimulatedHardware {
    fn read_block(&mut self, address: u8, register: u8, buf: &mut [u8]) -> Result<(), HardwareError> {
        self.log.push(HardwareOp::I2cRead {
            address,
            register,
            len: buf.len(),
        });
        let device = self
            .devices
            .get(&address)
            .ok_or_else(|| HardwareError::i2c(address, "no device at address"))?;
        if device.failing {
            return Err(HardwareError::i2c(address, "no acknowledge"));
        }

        buf.fill(0);
        if let Some(data) = device.registers.get(&register) {
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
        }
        Ok(())
    }

    fn write_block(&mut self, address: u8, register: u8, data: &[u8]) -> Result<(), HardwareError> {
        self.log.push(HardwareOp::I2cWrite {
            address,
            register,
            data: data.to_vec(),
        });
        let device = self
            .devices
            .get_mut(&address)
            .ok_or_else(|| HardwareError::i2c(address, "no device at address"))?;
        if device.failing {
            return Err(HardwareError::i2c(address, "no acknowledge"));
        }
        device.registers.insert(register, data.to_vec());
        Ok(())
    }
}

/// A simulator together with the context handed to components
#[derive(Clone)]
pub struct SimBench {
    pub hardware: Arc<Mutex<SimulatedHardware>>,
    pub context: HardwareContext,
    log: OpLog,
}

impl SimBench {
    fn new(hardware: SimulatedHardware, delay: SharedDelay) -> Self {
        let log = hardware.log();
        let hardware = Arc::new(Mutex::new(hardware));
        let gpio: SharedGpio = hardware.clone();
        let i2c: SharedI2c = hardware.clone();
        Self {
            context: HardwareContext::new(gpio, i2c, delay),
            hardware,
            log,
        }
    }

    pub fn log(&self) -> &OpLog {
        &self.log
    }

    /// Run a closure against the simulator (set inputs, inspect state)
    pub fn with<R>(&self, f: impl FnOnce(&mut SimulatedHardware) -> R) -> R {
        f(&mut lock(&self.hardware))
    }
}

/// Register block an LTC4151 returns for the given current and voltage
pub fn ltc4151_block(current_a: f64, voltage_v: f64) -> [u8; 4] {
    // 20 uV/LSB across a 20 mOhm shunt is 1 mA/LSB; 25 mV/LSB for VIN
    let current_raw = (current_a * 1000.0).round().clamp(0.0, 4095.0) as u16;
    let voltage_raw = (voltage_v / 0.025).round().clamp(0.0, 4095.0) as u16;
    [
        (current_raw >> 4) as u8,
        ((current_raw & 0x0F) << 4) as u8,
        (voltage_raw >> 4) as u8,
        ((voltage_raw & 0x0F) << 4) as u8,
    ]
}

/// Temperature register bytes a DS75 returns (two's complement, 1/256 degC)
pub fn ds75_block(temperature: f64) -> [u8; 2] {
    let whole = temperature.floor();
    let fraction = ((temperature - whole) * 256.0).round().min(255.0) as u8;
    [(whole as i8) as u8, fraction]
}

/// Raw 17-bit readback value a beamformer sends for `temperature`
pub fn beamformer_raw_temperature(temperature: f64) -> u32 {
    if temperature < 0.0 {
        (((temperature + 256.0) / 0.0625).round() as u32 & 0xFFF) | 0x1000
    } else {
        ((temperature / 0.0625).round() as u32) & 0xFFF
    }
}
