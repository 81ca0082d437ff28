/*!
Configuration management for the beamformer controller.

The pin and address tables of each deployment live here as data. Presets
reproduce the two hardware variants: the eight-card EDA box (whose power and
pointing links are wired to separate controllers) and the single-tile
interface board.
*/

use crate::hardware::Pin;
use crate::power::{AuxPins, BusPins, PowerUnitConfig};
use crate::transport::LinkPins;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub hardware: HardwareConfig,
    pub link: LinkConfig,
    pub monitor: MonitorConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pointing: Vec<PointingLinkConfig>,
    pub power: PowerConfig,
}

impl AppConfig {
    /// Create a new configuration with default values (single-tile board)
    pub fn new() -> Self {
        Self::single_tile()
    }

    /// Single-tile interface board: one link, one DoC card with a DS75
    pub fn single_tile() -> Self {
        Self {
            hardware: HardwareConfig::default(),
            link: LinkConfig::default(),
            monitor: MonitorConfig::default(),
            pointing: vec![PointingLinkConfig {
                slot: 1,
                tx_data: 13,
                tx_clock: 12,
                rx_data: 15,
            }],
            power: PowerConfig {
                variant: BoardVariant::Bfif,
                units: vec![PowerUnitConfig {
                    slot: 1,
                    enable_pin: 19,
                    power_pin: 18,
                    sensor_address: 0x68,
                    temperature_address: Some(0x48),
                    sensor_failure_value: -999.0,
                }],
                bus: None,
                aux: Some(AuxPins {
                    rfof_off: 21,
                    aux_off: 22,
                    serial_mode: 23,
                    serial_enable: 24,
                    opmode: 16,
                }),
            },
        }
    }

    /// Eight-card EDA power controller
    pub fn eda_box() -> Self {
        // slot: (enable, power)
        const UNIT_PINS: [(u8, Pin, Pin); 8] = [
            (1, 29, 16),
            (2, 26, 15),
            (3, 24, 13),
            (4, 23, 12),
            (5, 22, 11),
            (6, 21, 10),
            (7, 19, 8),
            (8, 18, 7),
        ];

        Self {
            hardware: HardwareConfig::default(),
            link: LinkConfig::default(),
            monitor: MonitorConfig::default(),
            pointing: Vec::new(),
            power: PowerConfig {
                variant: BoardVariant::Eda,
                units: UNIT_PINS
                    .iter()
                    .map(|&(slot, enable_pin, power_pin)| PowerUnitConfig {
                        slot,
                        enable_pin,
                        power_pin,
                        sensor_address: 0x67 + slot,
                        temperature_address: None,
                        sensor_failure_value: 0.0,
                    })
                    .collect(),
                bus: Some(BusPins {
                    power48: 32,
                    alarm_power: 36,
                    alarm48: 38,
                    power_led: 33,
                    enable_led: 35,
                }),
                aux: None,
            },
        }
    }

    /// Eight-link EDA pointing controller
    pub fn eda_comms() -> Self {
        // slot: (tx data, tx clock, rx data)
        const LINK_PINS: [(u8, Pin, Pin, Pin); 8] = [
            (1, 29, 16, 40),
            (2, 26, 15, 38),
            (3, 24, 13, 37),
            (4, 23, 12, 36),
            (5, 22, 11, 35),
            (6, 21, 10, 33),
            (7, 19, 8, 32),
            (8, 18, 7, 31),
        ];

        Self {
            hardware: HardwareConfig::default(),
            link: LinkConfig::default(),
            monitor: MonitorConfig::default(),
            pointing: LINK_PINS
                .iter()
                .map(|&(slot, tx_data, tx_clock, rx_data)| PointingLinkConfig {
                    slot,
                    tx_data,
                    tx_clock,
                    rx_data,
                })
                .collect(),
            power: PowerConfig {
                variant: BoardVariant::Eda,
                units: Vec::new(),
                bus: None,
                aux: None,
            },
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse config file as TOML")?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.as_ref().display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Check slot ranges, addresses, pin conflicts and variant requirements
    pub fn validate(&self) -> Result<()> {
        if self.link.bit_period_us == 0 {
            bail!("link.bit_period_us must be greater than zero");
        }

        let units = &self.power.units;
        if units.len() > 8 {
            bail!("{} power units configured, at most 8 supported", units.len());
        }
        check_slots("power unit", units.iter().map(|u| u.slot))?;
        check_slots("pointing link", self.pointing.iter().map(|l| l.slot))?;

        for unit in units {
            let addresses = std::iter::once(unit.sensor_address).chain(unit.temperature_address);
            for address in addresses {
                if address > 0x7f {
                    bail!("slot {}: I2C address {:#04x} is not a 7-bit address", unit.slot, address);
                }
            }
        }

        match self.power.variant {
            BoardVariant::Bfif => {
                if units.len() != 1 {
                    bail!("the bfif board has exactly one power unit, {} configured", units.len());
                }
                if self.power.aux.is_none() {
                    bail!("the bfif board needs [power.aux] pins");
                }
            }
            BoardVariant::Eda => {
                if !units.is_empty() && self.power.bus.is_none() {
                    bail!("eda power units need [power.bus] pins");
                }
            }
        }

        let mut used: HashMap<Pin, String> = HashMap::new();
        for (pin, role) in self.pin_roles() {
            if let Some(previous) = used.insert(pin, role.clone()) {
                bail!("pin {} is assigned to both {} and {}", pin, previous, role);
            }
        }
        Ok(())
    }

    fn pin_roles(&self) -> Vec<(Pin, String)> {
        let mut roles = Vec::new();
        for link in &self.pointing {
            roles.push((link.tx_data, format!("link {} tx_data", link.slot)));
            roles.push((link.tx_clock, format!("link {} tx_clock", link.slot)));
            roles.push((link.rx_data, format!("link {} rx_data", link.slot)));
        }
        for unit in &self.power.units {
            roles.push((unit.enable_pin, format!("unit {} enable", unit.slot)));
            roles.push((unit.power_pin, format!("unit {} power", unit.slot)));
        }
        if let Some(bus) = &self.power.bus {
            roles.push((bus.power48, "48V enable".to_string()));
            roles.push((bus.alarm_power, "power alarm".to_string()));
            roles.push((bus.alarm48, "48V alarm".to_string()));
            roles.push((bus.power_led, "power LED".to_string()));
            roles.push((bus.enable_led, "enable LED".to_string()));
        }
        if let Some(aux) = &self.power.aux {
            roles.push((aux.rfof_off, "RFoF off".to_string()));
            roles.push((aux.aux_off, "aux off".to_string()));
            roles.push((aux.serial_mode, "serial mode".to_string()));
            roles.push((aux.serial_enable, "serial enable".to_string()));
            roles.push((aux.opmode, "opmode".to_string()));
        }
        roles
    }

    /// The power unit sharing a slot with a pointing link, if any
    pub fn unit_for_slot(&self, slot: u8) -> Option<&PowerUnitConfig> {
        self.power.units.iter().find(|u| u.slot == slot)
    }
}

fn check_slots(what: &str, slots: impl Iterator<Item = u8>) -> Result<()> {
    let mut seen = HashSet::new();
    for slot in slots {
        if !(1..=8).contains(&slot) {
            bail!("{} slot {} is outside 1..=8", what, slot);
        }
        if !seen.insert(slot) {
            bail!("{} slot {} configured twice", what, slot);
        }
    }
    Ok(())
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-memory simulator with emulated beamformers
    Simulated,
    /// gpiod + /dev/i2c-N (requires the `linux` feature)
    Linux,
}

/// Hardware access configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfig {
    pub backend: Backend,

    /// GPIO character device chip name
    pub gpio_chip: String,

    /// I2C bus device path
    pub i2c_bus: String,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Linux,
            gpio_chip: "gpiochip0".to_string(),
            i2c_bus: "/dev/i2c-1".to_string(),
        }
    }
}

/// Bit-serial link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Duration of one transmitted bit
    pub bit_period_us: u64,
}

impl LinkConfig {
    pub fn bit_period(&self) -> Duration {
        Duration::from_micros(self.bit_period_us)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            bit_period_us: bf_shared::protocol::DEFAULT_BIT_PERIOD_US,
        }
    }
}

/// One beamformer link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointingLinkConfig {
    pub slot: u8,
    pub tx_data: Pin,
    pub tx_clock: Pin,
    pub rx_data: Pin,
}

impl PointingLinkConfig {
    pub fn pins(&self) -> LinkPins {
        LinkPins {
            tx_data: self.tx_data,
            tx_clock: self.tx_clock,
            rx_data: self.rx_data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardVariant {
    /// Eight-card box with a shared 48V supply
    Eda,
    /// Single-tile interface board
    Bfif,
}

/// Power hardware configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerConfig {
    pub variant: BoardVariant,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub units: Vec<PowerUnitConfig>,

    /// Required for `eda` with units
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus: Option<BusPins>,

    /// Required for `bfif`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux: Option<AuxPins>,
}

/// Run loop timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Interval between power status checks
    pub poll_interval_seconds: u64,

    /// Interval between repeated pointings
    pub pointing_interval_seconds: u64,
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn pointing_interval(&self) -> Duration {
        Duration::from_secs(self.pointing_interval_seconds)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 10,
            pointing_interval_seconds: 10,
        }
    }
}
