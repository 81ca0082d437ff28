/*!
Eight-card power controller.

Owns every [`PowerUnit`] in the box plus the shared 48V supply, its two alarm
inputs and the two front panel LEDs. The 48V rail is never switched while any
card has its rail or enable line on.
*/

use super::unit::{PowerUnit, PowerUnitConfig, PowerUnitStatus};
use crate::hardware::{lock, HardwareContext, Pin, SharedDelay, SharedGpio};
use crate::lifecycle::Teardown;
use bf_shared::{BfError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const MAX_UNITS: usize = 8;

const BUS_SETTLE: Duration = Duration::from_millis(200);
const STEP_DELAY: Duration = Duration::from_millis(100);
const POWER_UP_SETTLE: Duration = Duration::from_millis(500);

/// Bus-level pins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusPins {
    pub power48: Pin,
    pub alarm_power: Pin,
    pub alarm48: Pin,
    /// LED 1: all cards powered
    pub power_led: Pin,
    /// LED 2: all cards enabled
    pub enable_led: Pin,
}

/// Flat status snapshot for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControllerStatus {
    pub power48: bool,
    pub alarm_power: bool,
    pub alarm48: bool,
    pub all_powered: bool,
    pub all_enabled: bool,
    pub units: usize,
}

pub struct PowerController {
    units: BTreeMap<u8, PowerUnit>,
    pins: BusPins,
    gpio: SharedGpio,
    delay: SharedDelay,
    power48: bool,
    alarm_power: bool,
    alarm48: bool,
    all_powered: bool,
    all_enabled: bool,
}

impl PowerController {
    /// Attach to the box and take an initial reading.
    ///
    /// Fails if more than eight units are given, a slot is outside 1..=8 or
    /// a slot appears twice.
    pub fn new(pins: BusPins, units: Vec<PowerUnitConfig>, context: &HardwareContext) -> Result<Self> {
        if units.len() > MAX_UNITS {
            return Err(BfError::config(format!(
                "{} power units configured, at most {} supported",
                units.len(),
                MAX_UNITS
            )));
        }

        let mut map = BTreeMap::new();
        for config in units {
            let slot = config.slot;
            if !(1..=MAX_UNITS as u8).contains(&slot) {
                return Err(BfError::config(format!("slot {} is outside 1..={}", slot, MAX_UNITS)));
            }
            if map.insert(slot, PowerUnit::new(config, context)).is_some() {
                return Err(BfError::config(format!("slot {} configured twice", slot)));
            }
        }

        let mut controller = Self {
            units: map,
            pins,
            gpio: context.gpio.clone(),
            delay: context.delay.clone(),
            power48: false,
            alarm_power: false,
            alarm48: false,
            all_powered: false,
            all_enabled: false,
        };
        controller.check();
        Ok(controller)
    }

    pub fn units(&self) -> impl Iterator<Item = &PowerUnit> {
        self.units.values()
    }

    pub fn unit(&self, slot: u8) -> Option<&PowerUnit> {
        self.units.get(&slot)
    }

    pub fn unit_mut(&mut self, slot: u8) -> Option<&mut PowerUnit> {
        self.units.get_mut(&slot)
    }

    pub fn is_48v_on(&self) -> bool {
        self.power48
    }

    fn read_pin(&self, pin: Pin) -> Option<bool> {
        match lock(&self.gpio).read(pin) {
            Ok(level) => Some(level),
            Err(e) => {
                warn!("Failed to read pin {}: {}", pin, e);
                None
            }
        }
    }

    fn write_pin(&self, pin: Pin, high: bool) {
        if let Err(e) = lock(&self.gpio).write(pin, high) {
            warn!("Failed to write pin {}: {}", pin, e);
        }
    }

    fn set_leds(&self, power_ok: bool, enable_ok: bool) {
        self.write_pin(self.pins.power_led, power_ok);
        self.write_pin(self.pins.enable_led, enable_ok);
    }

    /// Enable off on every card, then rail off on every card
    fn force_units_off(&mut self) {
        for unit in self.units.values_mut() {
            if !unit.disable_bf() {
                warn!("Slot {}: disable failed before 48V change", unit.slot());
            }
        }
        for unit in self.units.values_mut() {
            if !unit.turnoff_doc() {
                warn!("Slot {}: DoC power off failed before 48V change", unit.slot());
            }
        }
    }

    fn switch_48v(&mut self, on: bool) -> bool {
        debug!("Turning 48V {}", if on { "on" } else { "off" });
        self.write_pin(self.pins.power48, on);
        self.delay.delay(STEP_DELAY);
        match self.read_pin(self.pins.power48) {
            Some(level) => {
                self.power48 = level;
                level == on
            }
            None => false,
        }
    }

    pub fn turn_on_48(&mut self) -> bool {
        self.force_units_off();
        self.delay.delay(BUS_SETTLE);
        let ok = self.switch_48v(true);
        if !ok {
            error!("48V supply did not turn on");
        }
        ok
    }

    pub fn turn_off_48(&mut self) -> bool {
        self.force_units_off();
        let ok = self.switch_48v(false);
        if !ok {
            error!("48V supply did not turn off");
        }
        ok
    }

    /// Bring up the 48V supply, then each card's rail and enable
    pub fn turn_on_all(&mut self) -> bool {
        info!("Powering up {} beamformer(s)", self.units.len());
        if !self.turn_on_48() {
            self.set_leds(false, false);
            return false;
        }
        self.delay.delay(POWER_UP_SETTLE);

        let mut power_ok = true;
        let mut enable_ok = true;
        for unit in self.units.values_mut() {
            let powered = unit.turnon_doc();
            self.delay.delay(STEP_DELAY);
            let enabled = if powered {
                unit.enable_bf().unwrap_or(false)
            } else {
                warn!("Slot {}: not enabling, DoC power failed", unit.slot());
                false
            };
            power_ok &= powered;
            enable_ok &= enabled;
        }

        self.set_leds(power_ok, enable_ok);
        info!("Power up complete: powered={} enabled={}", power_ok, enable_ok);
        power_ok && enable_ok
    }

    /// Disable and power off each card, then drop the 48V supply
    pub fn turn_off_all(&mut self) -> bool {
        info!("Powering down {} beamformer(s)", self.units.len());
        let mut disable_ok = true;
        let mut power_ok = true;
        for unit in self.units.values_mut() {
            disable_ok &= unit.disable_bf();
            self.delay.delay(STEP_DELAY);
            power_ok &= unit.turnoff_doc();
        }

        let bus_ok = self.turn_off_48();
        self.set_leds(!power_ok, !disable_ok);
        info!(
            "Power down complete: disabled={} unpowered={} 48V off={}",
            disable_ok, power_ok, bus_ok
        );
        disable_ok && power_ok && bus_ok
    }

    /// Refresh alarms, the 48V read-back and every card, and update the LEDs
    pub fn check(&mut self) -> ControllerStatus {
        if let Some(level) = self.read_pin(self.pins.alarm_power) {
            self.alarm_power = level;
        }
        if let Some(level) = self.read_pin(self.pins.alarm48) {
            self.alarm48 = level;
        }
        if let Some(level) = self.read_pin(self.pins.power48) {
            self.power48 = level;
        }
        if self.alarm_power || self.alarm48 {
            warn!(
                "Alarm active: power={} 48V={}",
                self.alarm_power, self.alarm48
            );
        }

        for unit in self.units.values_mut() {
            if !unit.check() {
                warn!("Slot {}: sensor read failed", unit.slot());
            }
        }
        self.all_powered = self.units.values().all(PowerUnit::is_powered);
        self.all_enabled = self.units.values().all(PowerUnit::is_enabled);
        self.set_leds(self.all_powered, self.all_enabled);
        self.status()
    }

    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            power48: self.power48,
            alarm_power: self.alarm_power,
            alarm48: self.alarm48,
            all_powered: self.all_powered,
            all_enabled: self.all_enabled,
            units: self.units.len(),
        }
    }

    pub fn unit_statuses(&self) -> Vec<PowerUnitStatus> {
        self.units.values().map(PowerUnit::status).collect()
    }

    /// Every enable off, every rail off, 48V off, LEDs off
    pub fn shutdown(&mut self) {
        self.disable_outputs();
        self.power_down();
    }
}

impl Teardown for PowerController {
    fn disable_outputs(&mut self) {
        for unit in self.units.values_mut() {
            unit.disable_outputs();
        }
    }

    fn power_down(&mut self) {
        for unit in self.units.values_mut() {
            unit.power_down();
        }
        self.write_pin(self.pins.power48, false);
        if let Some(level) = self.read_pin(self.pins.power48) {
            self.power48 = level;
        }
        if self.power48 {
            error!("48V supply still on after shutdown");
        }
        self.set_leds(false, false);
    }
}

impl fmt::Display for PowerController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "48V={} alarm_power={} alarm48={}",
            if self.power48 { "ON" } else { "OFF" },
            self.alarm_power,
            self.alarm48
        )?;
        for unit in self.units.values() {
            writeln!(f, "  {}", unit)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{ltc4151_block, HardwareOp, SimBench, SimulatedHardware};
    use crate::hardware::DigitalIo;

    const PINS: BusPins = BusPins {
        power48: 32,
        alarm_power: 36,
        alarm48: 38,
        power_led: 33,
        enable_led: 35,
    };

    const UNIT_PINS: [(u8, Pin, Pin); 3] = [(1, 29, 16), (2, 26, 15), (3, 24, 13)];

    fn configs() -> Vec<PowerUnitConfig> {
        UNIT_PINS
            .iter()
            .map(|&(slot, enable_pin, power_pin)| PowerUnitConfig {
                slot,
                enable_pin,
                power_pin,
                sensor_address: 0x67 + slot,
                temperature_address: None,
                sensor_failure_value: 0.0,
            })
            .collect()
    }

    fn controller() -> (SimBench, PowerController) {
        let mut sim = SimulatedHardware::new();
        for &(slot, _, _) in &UNIT_PINS {
            sim.set_register(0x67 + slot, 0, &ltc4151_block(0.1, 48.0));
        }
        let bench = sim.into_bench();
        let controller = PowerController::new(PINS, configs(), &bench.context).unwrap();
        bench.log().clear();
        (bench, controller)
    }

    fn write_index(bench: &SimBench, pin: Pin, high: bool) -> usize {
        bench
            .log()
            .last_position(&HardwareOp::Write { pin, high })
            .unwrap()
    }

    #[test]
    fn test_rejects_bad_unit_tables() {
        let bench = SimulatedHardware::new().into_bench();
        let mut too_many = Vec::new();
        for slot in 1..=9 {
            too_many.push(PowerUnitConfig {
                slot: (slot - 1) % 8 + 1,
                enable_pin: slot as Pin,
                power_pin: 100 + slot as Pin,
                sensor_address: 0x68,
                temperature_address: None,
                sensor_failure_value: 0.0,
            });
        }
        assert!(PowerController::new(PINS, too_many, &bench.context).is_err());

        let mut duplicate = configs();
        duplicate[1].slot = 1;
        assert!(PowerController::new(PINS, duplicate, &bench.context).is_err());

        let mut zero = configs();
        zero[0].slot = 0;
        assert!(PowerController::new(PINS, zero, &bench.context).is_err());
    }

    #[test]
    fn test_48v_change_forces_units_off_first() {
        let (bench, mut ctl) = controller();
        assert!(ctl.turn_on_all());
        bench.log().clear();

        assert!(ctl.turn_off_48());
        let bus = write_index(&bench, 32, false);
        let mut last_disable = 0;
        for &(_, enable, power) in &UNIT_PINS {
            let disable = write_index(&bench, enable, false);
            let power_off = write_index(&bench, power, false);
            assert!(disable < bus && power_off < bus);
            last_disable = last_disable.max(disable);
        }
        // all enables drop before any rail
        for &(_, _, power) in &UNIT_PINS {
            assert!(last_disable < write_index(&bench, power, false));
        }
        assert!(ctl.units().all(|u| !u.is_powered() && !u.is_enabled()));
        assert!(!ctl.is_48v_on());
    }

    #[test]
    fn test_turn_on_48_waits_and_confirms() {
        let (bench, mut ctl) = controller();
        assert!(ctl.turn_on_48());
        assert!(ctl.is_48v_on());
        let entries = bench.log().entries();
        let bus = write_index(&bench, 32, true);
        assert_eq!(entries[bus - 1], HardwareOp::Delay(BUS_SETTLE));
        assert_eq!(entries[bus + 1], HardwareOp::Delay(STEP_DELAY));
        assert_eq!(entries[bus + 2], HardwareOp::Read { pin: 32 });

        bench.with(|sim| sim.stick_pin(32, false));
        assert!(!ctl.turn_on_48());
    }

    #[test]
    fn test_48v_unconfirmed_without_gpio() {
        let (bench, mut ctl) = controller();
        assert!(ctl.turn_on_48());
        bench.with(|sim| sim.release()).unwrap();

        assert!(!ctl.turn_on_48());
        assert!(!ctl.turn_off_48());
        assert!(!ctl.turn_on_all());
        assert!(ctl.is_48v_on());
    }

    #[test]
    fn test_turn_on_all_sequences_each_unit() {
        let (bench, mut ctl) = controller();
        assert!(ctl.turn_on_all());
        assert!(ctl.units().all(|u| u.is_powered() && u.is_enabled()));
        for &(_, enable, power) in &UNIT_PINS {
            assert!(write_index(&bench, power, true) < write_index(&bench, enable, true));
            assert!(write_index(&bench, 32, true) < write_index(&bench, power, true));
        }
        assert_eq!(bench.log().writes_to(33).last(), Some(&true));
        assert_eq!(bench.log().writes_to(35).last(), Some(&true));

        let status = ctl.check();
        assert!(status.power48 && status.all_powered && status.all_enabled);
        assert_eq!(status.units, 3);
    }

    #[test]
    fn test_turn_on_all_reports_failed_unit() {
        let (bench, mut ctl) = controller();
        bench.with(|sim| sim.stick_pin(15, false));
        assert!(!ctl.turn_on_all());
        assert!(!ctl.unit(2).unwrap().is_enabled());
        assert!(ctl.unit(1).unwrap().is_enabled());
        assert_eq!(bench.log().writes_to(33).last(), Some(&false));
        assert!(!bench.log().writes_to(26).contains(&true));
    }

    #[test]
    fn test_turn_off_all_and_leds() {
        let (bench, mut ctl) = controller();
        ctl.turn_on_all();
        bench.log().clear();
        assert!(ctl.turn_off_all());
        assert!(!ctl.is_48v_on());
        // NOT ok: all power-off and disable succeeded, so both LEDs go dark
        assert_eq!(bench.log().writes_to(33), vec![false]);
        assert_eq!(bench.log().writes_to(35), vec![false]);
    }

    #[test]
    fn test_check_reads_alarms() {
        let (bench, mut ctl) = controller();
        bench.with(|sim| sim.set_input(38, true));
        let status = ctl.check();
        assert!(status.alarm48);
        assert!(!status.alarm_power);
        assert!(!status.all_powered);
        assert_eq!(ctl.unit_statuses().len(), 3);
        assert!((ctl.unit(1).unwrap().voltage() - 48.0).abs() < 1e-9);
    }

    #[test]
    fn test_shutdown_order() {
        let (bench, mut ctl) = controller();
        ctl.turn_on_all();
        bench.log().clear();

        ctl.shutdown();
        let last_disable = UNIT_PINS
            .iter()
            .map(|&(_, enable, _)| write_index(&bench, enable, false))
            .max()
            .unwrap();
        let first_power = UNIT_PINS
            .iter()
            .map(|&(_, _, power)| write_index(&bench, power, false))
            .min()
            .unwrap();
        assert!(last_disable < first_power);
        assert!(first_power < write_index(&bench, 32, false));
        assert!(write_index(&bench, 32, false) < write_index(&bench, 33, false));
        assert!(!ctl.is_48v_on());
    }
}
