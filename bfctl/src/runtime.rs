/*!
Hardware construction from configuration.
*/

use crate::config::{AppConfig, Backend};
use crate::hardware::sim::{beamformer_raw_temperature, ds75_block, ltc4151_block, SimulatedHardware};
use crate::hardware::{HardwareContext, SharedGpio};
use crate::pointing::PointingController;
use crate::transport::BitBangTransport;
use anyhow::{bail, Result};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Readings the simulated sensors and beamformers report
const SIM_CURRENT_A: f64 = 0.12;
const SIM_VOLTAGE_V: f64 = 48.0;
const SIM_BOARD_TEMPERATURE_C: f64 = 25.5;
const SIM_BEAMFORMER_TEMPERATURE_C: f64 = 31.25;

/// The opened hardware, and the simulator when running simulated
pub struct Hardware {
    pub context: HardwareContext,
    pub simulator: Option<Arc<Mutex<SimulatedHardware>>>,
}

impl Hardware {
    pub fn gpio(&self) -> SharedGpio {
        self.context.gpio.clone()
    }

    /// The backend actually opened; `--simulate` overrides the config
    pub fn backend(&self) -> Backend {
        if self.simulator.is_some() {
            Backend::Simulated
        } else {
            Backend::Linux
        }
    }
}

/// Open the backend named by the config (or the simulator if `simulate` is set)
pub fn open_hardware(config: &AppConfig, simulate: bool) -> Result<Hardware> {
    if simulate || config.hardware.backend == Backend::Simulated {
        info!("Using simulated hardware");
        return Ok(open_simulated(config));
    }
    open_linux(config)
}

/// Build a simulator populated with every device the config names
pub fn simulator_for(config: &AppConfig) -> SimulatedHardware {
    let mut sim = SimulatedHardware::new();
    for unit in &config.power.units {
        sim.set_register(
            unit.sensor_address,
            0,
            &ltc4151_block(SIM_CURRENT_A, SIM_VOLTAGE_V),
        );
        if let Some(address) = unit.temperature_address {
            sim.set_register(address, 0, &ds75_block(SIM_BOARD_TEMPERATURE_C));
        }
    }
    for link in &config.pointing {
        let enable_pin = config.unit_for_slot(link.slot).map(|u| u.enable_pin);
        sim.attach_beamformer(
            link.pins(),
            enable_pin,
            beamformer_raw_temperature(SIM_BEAMFORMER_TEMPERATURE_C),
        );
    }
    sim
}

fn open_simulated(config: &AppConfig) -> Hardware {
    let bench = simulator_for(config).into_realtime_bench();
    // Real-time sessions run indefinitely; keep memory flat
    bench.log().set_enabled(false);
    Hardware {
        context: bench.context.clone(),
        simulator: Some(bench.hardware.clone()),
    }
}

#[cfg(feature = "linux")]
fn open_linux(config: &AppConfig) -> Result<Hardware> {
    use crate::hardware::linux::{GpiodBackend, LinuxI2cBus};
    use crate::hardware::{SharedI2c, StdDelay};
    use anyhow::Context;

    let gpio: SharedGpio = Arc::new(Mutex::new(
        GpiodBackend::open(&config.hardware.gpio_chip)
            .with_context(|| format!("Failed to open GPIO chip '{}'", config.hardware.gpio_chip))?,
    ));
    let i2c: SharedI2c = Arc::new(Mutex::new(LinuxI2cBus::new(&config.hardware.i2c_bus)));
    info!(
        "Using GPIO chip {} and I2C bus {}",
        config.hardware.gpio_chip, config.hardware.i2c_bus
    );
    Ok(Hardware {
        context: HardwareContext::new(gpio, i2c, Arc::new(StdDelay)),
        simulator: None,
    })
}

#[cfg(not(feature = "linux"))]
fn open_linux(_config: &AppConfig) -> Result<Hardware> {
    bail!("bfctl was built without the `linux` feature; rebuild with --features linux or pass --simulate")
}

/// One pointing controller per configured link
pub fn pointing_controllers(config: &AppConfig, context: &HardwareContext) -> Result<Vec<PointingController>> {
    if config.pointing.is_empty() {
        bail!("No [[pointing]] links configured");
    }
    Ok(config
        .pointing
        .iter()
        .map(|link| {
            let transport = BitBangTransport::new(context.gpio.clone(), context.delay.clone(), link.pins())
                .with_bit_period(config.link.bit_period());
            PointingController::new(link.slot, transport)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power::InterfaceBoard;

    #[test]
    fn test_simulated_single_tile_points() {
        let config = AppConfig::single_tile();
        let bench = simulator_for(&config).into_bench();
        let mut controllers = pointing_controllers(&config, &bench.context).unwrap();
        let controller = &mut controllers[0];

        // Beamformer is dark until its card is powered and enabled
        let telemetry = controller.point_azel(0.0, 90.0).unwrap();
        assert!(!telemetry.is_ok());

        let unit = config.power.units[0].clone();
        let aux = config.power.aux.unwrap();
        let mut board = InterfaceBoard::new(unit, aux, &bench.context);
        assert!(board.unit_mut().turnon_doc());
        assert!(board.unit_mut().enable_bf().unwrap());

        let telemetry = controller.point_azel(0.0, 90.0).unwrap();
        assert!(telemetry.is_ok());
        assert_eq!(telemetry.temperature, SIM_BEAMFORMER_TEMPERATURE_C);
        assert!(board.check());
        assert_eq!(board.unit().temperature(), Some(SIM_BOARD_TEMPERATURE_C));
    }

    #[test]
    fn test_open_hardware_simulated() {
        let config = AppConfig::eda_comms();
        assert_eq!(config.hardware.backend, Backend::Linux);
        let hardware = open_hardware(&config, true).unwrap();
        assert_eq!(hardware.backend(), Backend::Simulated);
        let controllers = pointing_controllers(&AppConfig::eda_comms(), &hardware.context).unwrap();
        assert_eq!(controllers.len(), 8);
        assert!(pointing_controllers(&AppConfig::eda_box(), &hardware.context).is_err());
    }
}
