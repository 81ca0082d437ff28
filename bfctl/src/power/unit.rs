/*!
One beamformer interface card: DoC rail power, beamformer enable and the
card's I2C sensors.

Every mutator writes a pin, reads it back and reports whether the observed
level matches the request. The cached state always follows what was read,
never what was asked for.
*/

use crate::hardware::{lock, HardwareContext, Pin, SharedDelay, SharedGpio, SharedI2c};
use crate::lifecycle::Teardown;
use bf_shared::{BfError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Wait between dropping the enable line and switching the rail
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// DS75 configuration register and the 12-bit resolution setting
const DS75_CONFIG_REGISTER: u8 = 1;
const DS75_CONFIG_12BIT: u8 = 0x60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerUnitConfig {
    /// Card position, 1..=8
    pub slot: u8,
    pub enable_pin: Pin,
    pub power_pin: Pin,
    /// LTC4151 voltage/current monitor
    pub sensor_address: u8,
    /// DS75 temperature sensor, present on the single-tile board only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_address: Option<u8>,
    /// Value reported for readings that failed
    #[serde(default)]
    pub sensor_failure_value: f64,
}

/// Flat status snapshot for monitoring
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PowerUnitStatus {
    pub slot: u8,
    pub power: bool,
    pub enabled: bool,
    pub voltage: f64,
    pub current: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

pub struct PowerUnit {
    config: PowerUnitConfig,
    gpio: SharedGpio,
    i2c: SharedI2c,
    delay: SharedDelay,
    power: bool,
    enabled: bool,
    voltage: f64,
    current: f64,
    temperature: Option<f64>,
}

impl PowerUnit {
    /// Attach to a card. Reads the current pin state; does not change it.
    pub fn new(config: PowerUnitConfig, context: &HardwareContext) -> Self {
        let mut unit = Self {
            temperature: config.temperature_address.map(|_| config.sensor_failure_value),
            voltage: config.sensor_failure_value,
            current: config.sensor_failure_value,
            config,
            gpio: context.gpio.clone(),
            i2c: context.i2c.clone(),
            delay: context.delay.clone(),
            power: false,
            enabled: false,
        };
        unit.read_pins();
        unit
    }

    pub fn slot(&self) -> u8 {
        self.config.slot
    }

    pub fn config(&self) -> &PowerUnitConfig {
        &self.config
    }

    pub fn is_powered(&self) -> bool {
        self.power
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn voltage(&self) -> f64 {
        self.voltage
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn temperature(&self) -> Option<f64> {
        self.temperature
    }

    /// Put the DS75 into 12-bit mode. Returns false (with a warning) on failure
    /// or if the card has no temperature sensor.
    pub fn configure_temperature_sensor(&mut self) -> bool {
        let Some(address) = self.config.temperature_address else {
            return false;
        };
        match lock(&self.i2c).write_block(address, DS75_CONFIG_REGISTER, &[DS75_CONFIG_12BIT]) {
            Ok(()) => true,
            Err(e) => {
                warn!("Slot {}: failed to configure DS75: {}", self.slot(), e);
                false
            }
        }
    }

    /// Write a pin and return the level read back, or None if either access failed
    fn drive(&self, pin: Pin, high: bool) -> Option<bool> {
        let mut gpio = lock(&self.gpio);
        if let Err(e) = gpio.write(pin, high) {
            warn!("Slot {}: write to pin {} failed: {}", self.slot(), pin, e);
        }
        match gpio.read(pin) {
            Ok(level) => {
                if level != high {
                    warn!(
                        "Slot {}: pin {} reads {} after writing {}",
                        self.slot(),
                        pin,
                        level as u8,
                        high as u8
                    );
                }
                Some(level)
            }
            Err(e) => {
                warn!("Slot {}: read-back of pin {} failed: {}", self.slot(), pin, e);
                None
            }
        }
    }

    /// Turn on the beamformer enable line. The rail must already be powered.
    pub fn enable_bf(&mut self) -> Result<bool> {
        if !self.power {
            error!(
                "Slot {}: refusing to enable beamformer while DoC power is off",
                self.slot()
            );
            return Err(BfError::prerequisite(format!(
                "slot {}: DoC power must be on before enabling the beamformer",
                self.slot()
            )));
        }
        debug!("Slot {}: enabling beamformer", self.slot());
        match self.drive(self.config.enable_pin, true) {
            Some(level) => {
                self.enabled = level;
                Ok(level)
            }
            None => Ok(false),
        }
    }

    /// Turn off the beamformer enable line
    pub fn disable_bf(&mut self) -> bool {
        debug!("Slot {}: disabling beamformer", self.slot());
        match self.drive(self.config.enable_pin, false) {
            Some(level) => {
                self.enabled = level;
                !level
            }
            None => false,
        }
    }

    pub fn turnon_doc(&mut self) -> bool {
        self.set_power(true)
    }

    pub fn turnoff_doc(&mut self) -> bool {
        self.set_power(false)
    }

    fn set_power(&mut self, on: bool) -> bool {
        if self.enabled {
            if !self.disable_bf() {
                error!(
                    "Slot {}: enable line did not turn off, leaving DoC power {}",
                    self.slot(),
                    if self.power { "on" } else { "off" }
                );
                return false;
            }
            self.delay.delay(SETTLE_DELAY);
        }

        debug!(
            "Slot {}: turning DoC power {}",
            self.slot(),
            if on { "on" } else { "off" }
        );
        match self.drive(self.config.power_pin, on) {
            Some(level) => {
                self.power = level;
                level == on
            }
            None => false,
        }
    }

    fn read_pins(&mut self) {
        let mut gpio = lock(&self.gpio);
        match gpio.read(self.config.enable_pin) {
            Ok(level) => self.enabled = level,
            Err(e) => warn!("Slot {}: failed to read enable pin: {}", self.config.slot, e),
        }
        match gpio.read(self.config.power_pin) {
            Ok(level) => self.power = level,
            Err(e) => warn!("Slot {}: failed to read power pin: {}", self.config.slot, e),
        }
    }

    /// Refresh pin state and sensor readings. Returns false if any sensor read failed.
    pub fn check(&mut self) -> bool {
        self.read_pins();
        let failure = self.config.sensor_failure_value;
        let mut ok = true;

        let mut block = [0u8; 4];
        let result = lock(&self.i2c).read_block(self.config.sensor_address, 0, &mut block);
        match result {
            Ok(()) => {
                let (current, voltage) = decode_ltc4151(&block);
                self.current = current;
                self.voltage = voltage;
            }
            Err(e) => {
                error!("Slot {}: voltage/current read failed: {}", self.slot(), e);
                self.current = failure;
                self.voltage = failure;
                ok = false;
            }
        }

        if let Some(address) = self.config.temperature_address {
            let mut block = [0u8; 2];
            let result = lock(&self.i2c).read_block(address, 0, &mut block);
            match result {
                Ok(()) => self.temperature = Some(decode_ds75(&block)),
                Err(e) => {
                    error!("Slot {}: temperature read failed: {}", self.slot(), e);
                    self.temperature = Some(failure);
                    ok = false;
                }
            }
        }

        ok
    }

    pub fn status(&self) -> PowerUnitStatus {
        PowerUnitStatus {
            slot: self.slot(),
            power: self.power,
            enabled: self.enabled,
            voltage: self.voltage,
            current: self.current,
            temperature: self.temperature,
        }
    }
}

/// Current (A) and voltage (V) from an LTC4151 register block.
/// Sense LSB is 20 uV across a 0.02 Ohm shunt; VIN LSB is 25 mV.
pub fn decode_ltc4151(block: &[u8; 4]) -> (f64, f64) {
    let [b0, b1, b2, b3] = block.map(f64::from);
    let current = ((b0 * 16.0 + b1 / 16.0) * 20e-6) / 0.02;
    let voltage = (b2 * 16.0 + b3 / 16.0) * 0.025;
    (current, voltage)
}

/// Temperature (degC) from the DS75 temperature register
pub fn decode_ds75(block: &[u8; 2]) -> f64 {
    f64::from(block[0] as i8) + f64::from(block[1]) / 256.0
}

impl fmt::Display for PowerUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let on_off = |b: bool| if b { "ON" } else { "OFF" };
        write!(
            f,
            "BF#{}: power={:>3}, enable={:>3}, voltage={:6.2} V, current={:4.0} mA",
            self.slot(),
            on_off(self.power),
            on_off(self.enabled),
            self.voltage,
            self.current * 1000.0
        )?;
        if let Some(t) = self.temperature {
            write!(f, ", temperature={:6.2} C", t)?;
        }
        Ok(())
    }
}

impl Teardown for PowerUnit {
    fn disable_outputs(&mut self) {
        if !self.disable_bf() {
            error!("Slot {}: failed to disable beamformer during teardown", self.slot());
        }
    }

    fn power_down(&mut self) {
        if !self.turnoff_doc() {
            error!("Slot {}: failed to turn off DoC power during teardown", self.slot());
        }
    }
}
