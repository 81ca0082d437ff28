/*!
Single-tile beamformer interface board.

Wraps the board's one [`PowerUnit`] (LTC4151 plus a DS75 temperature sensor)
and the auxiliary lines: RFoF and auxiliary supply (both active-low "off"
lines), serial transceiver power and mode, and the opmode jumper.
*/

use super::unit::{PowerUnit, PowerUnitConfig};
use crate::hardware::{lock, HardwareContext, Pin, SharedDelay, SharedGpio};
use crate::lifecycle::Teardown;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

const STARTUP_DELAY: Duration = Duration::from_millis(100);
const SELF_TEST_STEP_DELAY: Duration = Duration::from_secs(1);

type SelfTestStepFn = fn(&mut InterfaceBoard) -> bool;

/// Lab test order: everything on, read the sensors, everything off in reverse
const SELF_TEST_STEPS: &[(&str, SelfTestStepFn)] = &[
    ("AUX power on", |b| b.turnon_aux()),
    ("Serial power on", |b| b.turnon_serial()),
    ("RxDoC power on", |b| b.unit.turnon_doc()),
    ("RxDoC enable beamformer", |b| b.unit.enable_bf().unwrap_or(false)),
    ("RFoF power on", |b| b.turnon_rfof()),
    ("I2C sensors", |b| b.check_and_log()),
    ("RFoF power off", |b| b.turnoff_rfof()),
    ("RxDoC disable beamformer", |b| b.unit.disable_bf()),
    ("RxDoC power off", |b| b.unit.turnoff_doc()),
    ("Serial power off", |b| b.turnoff_serial()),
    ("AUX power off", |b| b.turnoff_aux()),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxPins {
    /// High switches the RFoF modules off
    pub rfof_off: Pin,
    /// High switches the auxiliary 9V supply off
    pub aux_off: Pin,
    /// Low selects RS232, high RS485
    pub serial_mode: Pin,
    pub serial_enable: Pin,
    /// Jumper input
    pub opmode: Pin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialMode {
    Rs232,
    Rs485,
}

impl SerialMode {
    fn from_level(high: bool) -> Self {
        if high {
            Self::Rs485
        } else {
            Self::Rs232
        }
    }

    fn level(self) -> bool {
        self == Self::Rs485
    }
}

/// Flat status snapshot for monitoring
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterfaceBoardStatus {
    pub current: f64,
    pub voltage: f64,
    pub temperature: f64,
    pub docpower: bool,
    pub bfpower: bool,
    pub opmode: bool,
    pub rfof: bool,
    pub auxpower: bool,
    pub serialpower: bool,
    pub serialmode: Option<SerialMode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelfTestStep {
    pub name: &'static str,
    pub passed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SelfTestReport {
    pub steps: Vec<SelfTestStep>,
    /// Stopped before the last step
    pub interrupted: bool,
}

impl SelfTestReport {
    pub fn passed(&self) -> bool {
        !self.interrupted && self.steps.iter().all(|s| s.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &SelfTestStep> {
        self.steps.iter().filter(|s| !s.passed)
    }
}

pub struct InterfaceBoard {
    unit: PowerUnit,
    pins: AuxPins,
    gpio: SharedGpio,
    delay: SharedDelay,
    rfof: bool,
    auxpower: bool,
    serialpower: bool,
    serialmode: Option<SerialMode>,
    opmode: bool,
}

impl InterfaceBoard {
    /// Attach to the board, configure the DS75 and leave the board in the
    /// safe state: beamformer disabled, DoC power off, RFoF off.
    pub fn new(unit: PowerUnitConfig, pins: AuxPins, context: &HardwareContext) -> Self {
        let mut board = Self::attach(unit, pins, context);

        board.unit.configure_temperature_sensor();
        board.delay.delay(STARTUP_DELAY);

        if !board.unit.disable_bf() {
            error!("Interface board: failed to disable beamformer at startup");
        }
        if !board.unit.turnoff_doc() {
            error!("Interface board: failed to turn off DoC power at startup");
        }
        if !board.turnoff_rfof() {
            error!("Interface board: failed to turn off RFoF at startup");
        }
        board.check();
        board
    }

    /// Attach without changing any output: reads the current pin state only
    pub fn attach(unit: PowerUnitConfig, pins: AuxPins, context: &HardwareContext) -> Self {
        let mut board = Self {
            unit: PowerUnit::new(unit, context),
            pins,
            gpio: context.gpio.clone(),
            delay: context.delay.clone(),
            rfof: false,
            auxpower: false,
            serialpower: false,
            serialmode: None,
            opmode: false,
        };
        board.read_aux_pins();
        board
    }

    pub fn unit(&self) -> &PowerUnit {
        &self.unit
    }

    pub fn unit_mut(&mut self) -> &mut PowerUnit {
        &mut self.unit
    }

    pub fn rfof(&self) -> bool {
        self.rfof
    }

    pub fn auxpower(&self) -> bool {
        self.auxpower
    }

    pub fn serialpower(&self) -> bool {
        self.serialpower
    }

    pub fn serialmode(&self) -> Option<SerialMode> {
        self.serialmode
    }

    pub fn opmode(&self) -> bool {
        self.opmode
    }

    fn read(&self, pin: Pin) -> Option<bool> {
        match lock(&self.gpio).read(pin) {
            Ok(level) => Some(level),
            Err(e) => {
                warn!("Interface board: failed to read pin {}: {}", pin, e);
                None
            }
        }
    }

    /// Write then read back; None if the read-back failed
    fn drive(&self, pin: Pin, high: bool) -> Option<bool> {
        let mut gpio = lock(&self.gpio);
        if let Err(e) = gpio.write(pin, high) {
            warn!("Interface board: write to pin {} failed: {}", pin, e);
        }
        match gpio.read(pin) {
            Ok(level) => Some(level),
            Err(e) => {
                warn!("Interface board: read-back of pin {} failed: {}", pin, e);
                None
            }
        }
    }

    fn read_aux_pins(&mut self) {
        if let Some(level) = self.read(self.pins.rfof_off) {
            self.rfof = !level;
        }
        if let Some(level) = self.read(self.pins.aux_off) {
            self.auxpower = !level;
        }
        if let Some(level) = self.read(self.pins.serial_enable) {
            self.serialpower = level;
        }
        if let Some(level) = self.read(self.pins.serial_mode) {
            self.serialmode = Some(SerialMode::from_level(level));
        }
        if let Some(level) = self.read(self.pins.opmode) {
            self.opmode = level;
        }
    }

    fn set_rfof(&mut self, on: bool) -> bool {
        match self.drive(self.pins.rfof_off, !on) {
            Some(level) => {
                self.rfof = !level;
                self.rfof == on
            }
            None => false,
        }
    }

    fn set_aux(&mut self, on: bool) -> bool {
        match self.drive(self.pins.aux_off, !on) {
            Some(level) => {
                self.auxpower = !level;
                self.auxpower == on
            }
            None => false,
        }
    }

    fn set_serial(&mut self, on: bool) -> bool {
        match self.drive(self.pins.serial_enable, on) {
            Some(level) => {
                self.serialpower = level;
                self.serialpower == on
            }
            None => false,
        }
    }

    pub fn turnon_rfof(&mut self) -> bool {
        self.set_rfof(true)
    }

    pub fn turnoff_rfof(&mut self) -> bool {
        self.set_rfof(false)
    }

    /// Auxiliary supply for the fibre media converter
    pub fn turnon_aux(&mut self) -> bool {
        self.set_aux(true)
    }

    pub fn turnoff_aux(&mut self) -> bool {
        self.set_aux(false)
    }

    pub fn turnon_serial(&mut self) -> bool {
        self.set_serial(true)
    }

    pub fn turnoff_serial(&mut self) -> bool {
        self.set_serial(false)
    }

    pub fn set_serial_mode(&mut self, mode: SerialMode) -> bool {
        match self.drive(self.pins.serial_mode, mode.level()) {
            Some(level) => {
                self.serialmode = Some(SerialMode::from_level(level));
                self.serialmode == Some(mode)
            }
            None => {
                self.serialmode = None;
                false
            }
        }
    }

    /// Refresh the opmode jumper and the sensor readings
    pub fn check(&mut self) -> bool {
        if let Some(level) = self.read(self.pins.opmode) {
            self.opmode = level;
        }
        self.unit.check()
    }

    /// One pass of the bare-board lab test. Does not need a beamformer attached.
    pub fn self_test(&mut self) -> SelfTestReport {
        self.self_test_until(|| false)
    }

    /// Run the lab test, checking `stop` after every step. When it returns
    /// true the remaining steps are skipped and the board is left as is for
    /// the caller's teardown.
    pub fn self_test_until(&mut self, mut stop: impl FnMut() -> bool) -> SelfTestReport {
        let mut report = SelfTestReport::default();
        for &(name, run) in SELF_TEST_STEPS {
            let passed = run(self);
            if passed {
                info!("{} PASSED", name);
            } else {
                error!("{} FAILED", name);
            }
            report.steps.push(SelfTestStep { name, passed });
            self.delay.delay(SELF_TEST_STEP_DELAY);

            if stop() {
                warn!("Self test interrupted after '{}'", name);
                report.interrupted = true;
                break;
            }
        }
        report
    }

    fn check_and_log(&mut self) -> bool {
        let ok = self.check();
        if ok {
            info!(
                "I2C readings: voltage={:5.2} V, current={:4.0} mA, temp={:4.1} C, opmode={}",
                self.unit.voltage(),
                self.unit.current() * 1000.0,
                self.unit.temperature().unwrap_or(f64::NAN),
                self.opmode
            );
        }
        ok
    }

    /// Beamformer off, DoC off, RFoF off. The auxiliary supply stays on; it
    /// feeds the network media converter.
    pub fn cleanup(&mut self) {
        self.disable_outputs();
        self.power_down();
    }

    pub fn status(&self) -> InterfaceBoardStatus {
        InterfaceBoardStatus {
            current: self.unit.current(),
            voltage: self.unit.voltage(),
            temperature: self
                .unit
                .temperature()
                .unwrap_or(self.unit.config().sensor_failure_value),
            docpower: self.unit.is_powered(),
            bfpower: self.unit.is_enabled(),
            opmode: self.opmode,
            rfof: self.rfof,
            auxpower: self.auxpower,
            serialpower: self.serialpower,
            serialmode: self.serialmode,
        }
    }
}

impl Teardown for InterfaceBoard {
    fn disable_outputs(&mut self) {
        info!("Interface board: turning off beamformer");
        if !self.unit.disable_bf() {
            error!("Interface board: error turning off beamformer");
        }
    }

    fn power_down(&mut self) {
        info!("Interface board: turning off DoC and RFoF");
        if !self.unit.turnoff_doc() {
            error!("Interface board: error turning off DoC card");
        }
        if !self.turnoff_rfof() {
            error!("Interface board: error turning off RFoF power");
        }
    }
}

impl fmt::Display for InterfaceBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let on_off = |b: bool| if b { "ON" } else { "OFF" };
        writeln!(
            f,
            "docpower={:>3}, bfpower={:>3}, RFoF={:>3}, Aux={:>3}, SerialPower={:>3}, SerialMode={:?}, OpMode={}",
            on_off(self.unit.is_powered()),
            on_off(self.unit.is_enabled()),
            on_off(self.rfof),
            on_off(self.auxpower),
            on_off(self.serialpower),
            self.serialmode,
            self.opmode
        )?;
        write!(
            f,
            "voltage={:5.2} V, current={:4.0} mA, temp={:4.1} C",
            self.unit.voltage(),
            self.unit.current() * 1000.0,
            self.unit.temperature().unwrap_or(f64::NAN)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{ds75_block, ltc4151_block, HardwareOp, SimBench, SimulatedHardware};
    use crate::hardware::DigitalIo;
    use crate::lifecycle::{SafeShutdown, ShutdownSignal};
    use std::sync::{Arc, Mutex};

    const PINS: AuxPins = AuxPins {
        rfof_off: 21,
        aux_off: 22,
        serial_mode: 23,
        serial_enable: 24,
        opmode: 16,
    };

    fn unit_config() -> PowerUnitConfig {
        PowerUnitConfig {
            slot: 1,
            enable_pin: 19,
            power_pin: 18,
            sensor_address: 0x68,
            temperature_address: Some(0x48),
            sensor_failure_value: -999.0,
        }
    }

    fn board(setup: impl FnOnce(&mut SimulatedHardware)) -> (SimBench, InterfaceBoard) {
        let mut sim = SimulatedHardware::new();
        sim.set_register(0x68, 0, &ltc4151_block(0.3, 47.5));
        sim.set_register(0x48, 0, &ds75_block(28.25));
        setup(&mut sim);
        let bench = sim.into_bench();
        let board = InterfaceBoard::new(unit_config(), PINS, &bench.context);
        (bench, board)
    }

    #[test]
    fn test_startup_configures_sensor_and_safes_board() {
        let (bench, board) = board(|sim| {
            sim.set_input(19, true);
            sim.set_input(18, true);
        });
        let log = bench.log();

        let config = log
            .position(&HardwareOp::I2cWrite {
                address: 0x48,
                register: 1,
                data: vec![0x60],
            })
            .unwrap();
        let disable = log.position(&HardwareOp::Write { pin: 19, high: false }).unwrap();
        let doc_off = log.position(&HardwareOp::Write { pin: 18, high: false }).unwrap();
        assert!(config < disable && disable < doc_off);

        assert!(!board.unit().is_enabled());
        assert!(!board.unit().is_powered());
        assert!(!board.rfof());
        assert_eq!(log.writes_to(21), vec![true]);
        assert_eq!(board.unit().temperature(), Some(28.25));
    }

    #[test]
    fn test_attach_leaves_outputs_alone() {
        let mut sim = SimulatedHardware::new();
        sim.set_input(18, true);
        sim.set_input(19, true);
        sim.set_input(21, false);
        let bench = sim.into_bench();
        let board = InterfaceBoard::attach(unit_config(), PINS, &bench.context);
        assert!(board.unit().is_powered());
        assert!(board.unit().is_enabled());
        assert!(board.rfof());
        assert!(board.auxpower());
        assert!(bench
            .log()
            .entries()
            .iter()
            .all(|op| matches!(op, HardwareOp::Read { .. })));
    }

    #[test]
    fn test_startup_tolerates_missing_ds75() {
        let (_bench, board) = board(|sim| sim.set_i2c_failure(0x48, true));
        assert_eq!(board.status().temperature, -999.0);
        assert!((board.status().voltage - 47.5).abs() < 1e-9);
    }

    #[test]
    fn test_active_low_lines() {
        let (bench, mut board) = board(|_| {});
        assert!(board.turnon_rfof());
        assert!(board.rfof());
        assert!(board.turnon_aux());
        assert!(board.auxpower());
        assert_eq!(bench.log().writes_to(22), vec![false]);

        assert!(board.turnoff_aux());
        assert!(!board.auxpower());

        bench.with(|sim| sim.stick_pin(21, false));
        assert!(!board.turnoff_rfof());
        assert!(board.rfof());
    }

    #[test]
    fn test_aux_lines_fail_without_gpio() {
        let (bench, mut board) = board(|_| {});
        assert!(board.turnon_rfof());
        assert!(board.turnon_aux());
        assert!(board.turnon_serial());

        bench.with(|sim| sim.release()).unwrap();
        assert!(!board.turnon_rfof());
        assert!(!board.turnon_aux());
        assert!(!board.turnon_serial());
        assert!(!board.turnoff_rfof());
        assert!(!board.set_serial_mode(SerialMode::Rs485));
        assert!(board.rfof() && board.auxpower() && board.serialpower());
    }

    #[test]
    fn test_serial_controls() {
        let (_bench, mut board) = board(|_| {});
        assert!(board.turnon_serial());
        assert!(board.serialpower());
        assert!(board.set_serial_mode(SerialMode::Rs485));
        assert_eq!(board.serialmode(), Some(SerialMode::Rs485));
        assert!(board.set_serial_mode(SerialMode::Rs232));
        assert_eq!(board.status().serialmode, Some(SerialMode::Rs232));
        assert!(board.turnoff_serial());
    }

    #[test]
    fn test_check_reads_opmode() {
        let (bench, mut board) = board(|_| {});
        assert!(!board.opmode());
        bench.with(|sim| sim.set_input(16, true));
        assert!(board.check());
        assert!(board.opmode());
    }

    #[test]
    fn test_self_test_passes_on_healthy_board() {
        let (bench, mut board) = board(|_| {});
        bench.log().clear();
        let report = board.self_test();
        assert_eq!(report.steps.len(), 11);
        assert!(report.passed(), "{:?}", report.failures().collect::<Vec<_>>());
        assert_eq!(bench.log().total_delay(), SELF_TEST_STEP_DELAY * 11);
        assert!(!board.unit().is_powered());
        assert!(!board.auxpower());
    }

    #[test]
    fn test_self_test_reports_failures() {
        let (bench, mut board) = board(|_| {});
        bench.with(|sim| {
            sim.stick_pin(18, false);
            sim.set_i2c_failure(0x68, true);
        });
        let report = board.self_test();
        assert!(!report.passed());
        let failed: Vec<_> = report.failures().map(|s| s.name).collect();
        assert_eq!(failed, vec!["RxDoC power on", "RxDoC enable beamformer", "I2C sensors"]);
    }

    #[test]
    fn test_self_test_stops_on_signal_and_tears_down() {
        let (bench, board) = board(|_| {});
        let board = Arc::new(Mutex::new(board));
        let mut guard = SafeShutdown::new(bench.context.gpio.clone());
        guard.register("interface board", board.clone());
        let signal = ShutdownSignal::new();
        bench.log().clear();

        // Signal arrives while the beamformer is enabled
        let mut steps = 0;
        let report = board.lock().unwrap().self_test_until(|| {
            steps += 1;
            if steps == 4 {
                signal.trigger();
            }
            signal.is_requested()
        });
        assert!(report.interrupted);
        assert!(!report.passed());
        assert_eq!(report.steps.len(), 4);
        assert!(board.lock().unwrap().unit().is_enabled());
        assert!(bench.log().writes_to(21).is_empty());

        bench.log().clear();
        guard.finish();
        let log = bench.log();
        let disable = log.position(&HardwareOp::Write { pin: 19, high: false }).unwrap();
        let doc_off = log.position(&HardwareOp::Write { pin: 18, high: false }).unwrap();
        let rfof_off = log.position(&HardwareOp::Write { pin: 21, high: true }).unwrap();
        assert!(disable < doc_off && doc_off < rfof_off);
        assert_eq!(log.entries().last(), Some(&HardwareOp::Release));

        let board = board.lock().unwrap();
        assert!(!board.unit().is_enabled());
        assert!(!board.unit().is_powered());
    }

    #[test]
    fn test_cleanup_order_leaves_aux_on() {
        let (bench, mut board) = board(|_| {});
        board.turnon_aux();
        board.unit_mut().turnon_doc();
        board.unit_mut().enable_bf().unwrap();
        board.turnon_rfof();
        bench.log().clear();

        board.cleanup();
        let disable = bench.log().position(&HardwareOp::Write { pin: 19, high: false }).unwrap();
        let doc_off = bench.log().position(&HardwareOp::Write { pin: 18, high: false }).unwrap();
        let rfof_off = bench.log().position(&HardwareOp::Write { pin: 21, high: true }).unwrap();
        assert!(disable < doc_off && doc_off < rfof_off);
        assert!(board.auxpower());
        assert!(bench.log().writes_to(22).is_empty());
    }
}
