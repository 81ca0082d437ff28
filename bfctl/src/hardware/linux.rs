//! Linux hardware backends for the Raspberry Pi controller.
//!
//! GPIO goes through the gpiod character device. Pins are addressed by BOARD
//! number (physical header pin) and mapped to BCM line offsets on the chip.
//! Lines are requested lazily: a write requests an output, a read of a line
//! never written requests an input.
//!
//! I2C uses `/dev/i2c-N` with SMBus block transfers, one device handle per
//! 7-bit address.

use super::{DigitalIo, I2cBus, Pin};
use bf_shared::HardwareError;
use gpiod::{Chip, Input, Lines, Options, Output};
use i2cdev::core::I2CDevice;
use i2cdev::linux::LinuxI2CDevice;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

const CONSUMER: &str = "bfctl";

/// Maps Raspberry Pi BOARD pin numbers to BCM GPIO line offsets.
///
/// Only header pins that carry a GPIO are listed; power and ground pins
/// return `None`.
pub fn board_pin_to_line(pin: Pin) -> Option<u32> {
    const PIN_MAP: [(Pin, u32); 26] = [
        (3, 2),
        (5, 3),
        (7, 4),
        (8, 14),
        (10, 15),
        (11, 17),
        (12, 18),
        (13, 27),
        (15, 22),
        (16, 23),
        (18, 24),
        (19, 10),
        (21, 9),
        (22, 25),
        (23, 11),
        (24, 8),
        (26, 7),
        (29, 5),
        (31, 6),
        (32, 12),
        (33, 13),
        (35, 19),
        (36, 16),
        (37, 26),
        (38, 20),
        (40, 21),
    ];

    PIN_MAP
        .iter()
        .find(|(board, _)| *board == pin)
        .map(|(_, line)| *line)
}

enum Line {
    Output(Lines<Output>),
    Input(Lines<Input>),
}

pub struct GpiodBackend {
    chip: Chip,
    lines: HashMap<Pin, Line>,
    released: bool,
}

impl GpiodBackend {
    pub fn open(chip_name: &str) -> std::io::Result<Self> {
        let chip = Chip::new(chip_name)?;
        debug!("Opened GPIO chip {}", chip_name);
        Ok(Self {
            chip,
            lines: HashMap::new(),
            released: false,
        })
    }

    fn offset(pin: Pin) -> Result<u32, HardwareError> {
        board_pin_to_line(pin).ok_or_else(|| HardwareError::gpio(pin, "not a GPIO header pin"))
    }

    fn check_released(&self) -> Result<(), HardwareError> {
        if self.released {
            Err(HardwareError::Released)
        } else {
            Ok(())
        }
    }
}

impl DigitalIo for GpiodBackend {
    fn write(&mut self, pin: Pin, high: bool) -> Result<(), HardwareError> {
        self.check_released()?;
        if let Some(Line::Output(lines)) = self.lines.get(&pin) {
            return lines
                .set_values([high])
                .map_err(|e| HardwareError::gpio(pin, e.to_string()));
        }

        // Drop any input request before re-requesting the line as an output
        self.lines.remove(&pin);
        let offset = Self::offset(pin)?;
        let options = Options::output([offset]).values([high]).consumer(CONSUMER);
        let lines = self
            .chip
            .request_lines(options)
            .map_err(|e| HardwareError::gpio(pin, format!("request as output: {}", e)))?;
        self.lines.insert(pin, Line::Output(lines));
        Ok(())
    }

    fn read(&mut self, pin: Pin) -> Result<bool, HardwareError> {
        self.check_released()?;
        let values = match self.lines.get(&pin) {
            Some(Line::Output(lines)) => lines.get_values([false; 1]),
            Some(Line::Input(lines)) => lines.get_values([false; 1]),
            None => {
                let offset = Self::offset(pin)?;
                let options = Options::input([offset]).consumer(CONSUMER);
                let lines = self
                    .chip
                    .request_lines(options)
                    .map_err(|e| HardwareError::gpio(pin, format!("request as input: {}", e)))?;
                let values = lines.get_values([false; 1]);
                self.lines.insert(pin, Line::Input(lines));
                values
            }
        };
        values
            .map(|[level]| level)
            .map_err(|e| HardwareError::gpio(pin, e.to_string()))
    }

    fn release(&mut self) -> Result<(), HardwareError> {
        debug!("Releasing {} GPIO line(s)", self.lines.len());
        self.lines.clear();
        self.released = true;
        Ok(())
    }
}

pub struct LinuxI2cBus {
    path: PathBuf,
    devices: HashMap<u8, LinuxI2CDevice>,
}

impl LinuxI2cBus {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            devices: HashMap::new(),
        }
    }

    fn device(&mut self, address: u8) -> Result<&mut LinuxI2CDevice, HardwareError> {
        if !self.devices.contains_key(&address) {
            let device = LinuxI2CDevice::new(&self.path, u16::from(address)).map_err(|e| {
                HardwareError::i2c(address, format!("open {}: {}", self.path.display(), e))
            })?;
            self.devices.insert(address, device);
        }
        self.devices
            .get_mut(&address)
            .ok_or_else(|| HardwareError::i2c(address, "device handle missing"))
    }
}

impl I2cBus for LinuxI2cBus {
    fn read_block(&mut self, address: u8, register: u8, buf: &mut [u8]) -> Result<(), HardwareError> {
        let len = u8::try_from(buf.len())
            .map_err(|_| HardwareError::i2c(address, "block read longer than 255 bytes"))?;
        let data = self
            .device(address)?
            .smbus_read_i2c_block_data(register, len)
            .map_err(|e| HardwareError::i2c(address, e.to_string()))?;
        if data.len() != buf.len() {
            return Err(HardwareError::i2c(
                address,
                format!("short read: {} of {} bytes", data.len(), buf.len()),
            ));
        }
        buf.copy_from_slice(&data);
        Ok(())
    }

    fn write_block(&mut self, address: u8, register: u8, data: &[u8]) -> Result<(), HardwareError> {
        self.device(address)?
            .smbus_write_i2c_block_data(register, data)
            .map_err(|e| HardwareError::i2c(address, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_board_pin_map() {
        assert_eq!(board_pin_to_line(12), Some(18));
        assert_eq!(board_pin_to_line(19), Some(10));
        assert_eq!(board_pin_to_line(40), Some(21));
        assert_eq!(board_pin_to_line(1), None);
        assert_eq!(board_pin_to_line(6), None);
    }
}
