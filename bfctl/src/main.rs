/*!
# Beamformer Controller

Command-line front end for tile beamformer pointing and power sequencing.

## Usage

### Compute delays (no hardware)
```bash
bfctl delays --az 45 --el 60
```

### Power up a single tile and point it
```bash
bfctl --config bfif.toml point --az 45 --el 60 --hold
```

### Eight-card power controller
```bash
bfctl --config eda-power.toml power
```

### Try anything against the simulator
```bash
bfctl --simulate bftest dipole delay --delaytime 0.5
```
*/

use anyhow::{bail, Context, Result};
use bf_shared::{compute_delays, estimate_pointing, DelayVector, PointingFrame, Telemetry};
use bfctl::config::{AppConfig, Backend, BoardVariant};
use bfctl::hardware::HardwareContext;
use bfctl::lifecycle::{SafeShutdown, ShutdownSignal};
use bfctl::pointing::PointingController;
use bfctl::power::{InterfaceBoard, InterfaceBoardStatus, PowerController, PowerUnitStatus};
use bfctl::power::ControllerStatus;
use bfctl::runtime::{open_hardware, pointing_controllers};
use bfctl::testmode::{parse_modes, run_patterns};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "bfctl")]
#[command(about = "Tile beamformer pointing and power sequencing")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to the single-tile board)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run against simulated hardware
    #[arg(long, global = true)]
    simulate: bool,

    /// Debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the delays for a pointing direction
    Delays {
        /// Azimuth in degrees, clockwise from north
        #[arg(long, allow_hyphen_values = true)]
        az: f64,

        /// Elevation in degrees above the horizon
        #[arg(long, allow_hyphen_values = true)]
        el: f64,

        /// Also print the encoded pointing frame
        #[arg(long)]
        frame: bool,
    },

    /// Power up the tile, point it once and report the telemetry
    Point {
        #[arg(long, requires = "el", conflicts_with = "xdelays", allow_hyphen_values = true)]
        az: Option<f64>,

        #[arg(long, requires = "az", allow_hyphen_values = true)]
        el: Option<f64>,

        /// 16 comma-separated X delays
        #[arg(long, value_delimiter = ',', requires = "ydelays")]
        xdelays: Option<Vec<i64>>,

        /// 16 comma-separated Y delays
        #[arg(long, value_delimiter = ',', requires = "xdelays")]
        ydelays: Option<Vec<i64>>,

        /// Keep the tile powered until a termination signal
        #[arg(long)]
        hold: bool,
    },

    /// Power up every card and monitor until a termination signal
    Power,

    /// Point every configured link repeatedly until a termination signal
    Comms {
        /// 16 comma-separated X delays (default: zenith)
        #[arg(long, value_delimiter = ',', requires = "ydelays")]
        xdelays: Option<Vec<i64>>,

        /// 16 comma-separated Y delays (default: zenith)
        #[arg(long, value_delimiter = ',', requires = "xdelays")]
        ydelays: Option<Vec<i64>>,
    },

    /// Run beamformer test patterns (dipole[A-P...], delay[0-7...])
    Bftest {
        /// Test modes
        modes: Vec<String>,

        /// Passes over all patterns, 0 to loop until interrupted
        #[arg(short, long, default_value = "1")]
        maxloops: u32,

        /// Seconds between pointings, 0 to wait for ENTER
        #[arg(short, long, default_value = "0.0")]
        delaytime: f64,
    },

    /// Run one pass of the interface board self test
    Selftest,

    /// Print one status snapshot as JSON
    Status,

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "bfctl.toml")]
        output: PathBuf,

        /// Hardware preset
        #[arg(long, value_enum, default_value = "bfif")]
        preset: Preset,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    /// Single-tile interface board
    Bfif,
    /// Eight-card EDA power controller
    EdaPower,
    /// Eight-link EDA pointing controller
    EdaComms,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::WARN
    } else {
        Level::INFO
    };
    // Logging goes to stderr so stdout stays clean for JSON status output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();

    let config = || load_config(cli.config.as_ref());
    match cli.command {
        Commands::Delays { az, el, frame } => run_delays(az, el, frame),
        Commands::Point {
            az,
            el,
            xdelays,
            ydelays,
            hold,
        } => {
            let target = match (az.zip(el), xdelays.zip(ydelays)) {
                (Some((az, el)), _) => Target::Sky(az, el),
                (None, Some((x, y))) => Target::Delays(DelayVector::from_slice(&x)?, DelayVector::from_slice(&y)?),
                (None, None) => Target::Sky(0.0, 90.0),
            };
            run_point(&config()?, cli.simulate, target, hold)
        }
        Commands::Power => run_power(&config()?, cli.simulate),
        Commands::Comms { xdelays, ydelays } => {
            let (x, y) = match xdelays.zip(ydelays) {
                Some((x, y)) => (DelayVector::from_slice(&x)?, DelayVector::from_slice(&y)?),
                None => (DelayVector::ZENITH, DelayVector::ZENITH),
            };
            run_comms(&config()?, cli.simulate, x, y)
        }
        Commands::Bftest {
            modes,
            maxloops,
            delaytime,
        } => run_bftest(&config()?, cli.simulate, &modes, maxloops, delaytime),
        Commands::Selftest => run_selftest(&config()?, cli.simulate),
        Commands::Status => run_status(&config()?, cli.simulate),
        Commands::Config { output, preset } => generate_config_file(output, preset),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load_from_file(path),
        None => {
            info!("No config file given, using single-tile defaults");
            Ok(AppConfig::new())
        }
    }
}

enum Target {
    Sky(f64, f64),
    Delays(DelayVector, DelayVector),
}

/// Compute and print delays for a direction, with the inverse estimate
fn run_delays(az: f64, el: f64, frame: bool) -> Result<()> {
    let delays = compute_delays(az, el).with_context(|| format!("Cannot point at az={} el={}", az, el))?;
    let estimate = estimate_pointing(&delays);

    println!("🎯 az={:.1} el={:.1}", az, el);
    for row in delays.values().chunks(4) {
        println!("   {:>3} {:>3} {:>3} {:>3}", row[0], row[1], row[2], row[3]);
    }
    println!(
        "🔁 Estimated back from delays: az={:.1} el={:.1}",
        estimate.azimuth, estimate.elevation
    );
    if frame {
        let frame = PointingFrame::new(&delays, &delays);
        println!("📦 Frame ({} bits): {}", frame.len(), frame.to_hex());
        println!("   checksum={:#06x}", frame.checksum());
    }
    Ok(())
}

fn interface_board(config: &AppConfig, context: &HardwareContext) -> Result<InterfaceBoard> {
    if config.power.variant != BoardVariant::Bfif {
        bail!("This command needs the single-tile (bfif) power configuration");
    }
    let unit = config
        .power
        .units
        .first()
        .cloned()
        .context("No power unit configured")?;
    let aux = config.power.aux.context("No [power.aux] pins configured")?;
    Ok(InterfaceBoard::new(unit, aux, context))
}

/// DoC on, wait, enable, wait, check. Returns false if any step failed.
fn power_up_tile(board: &Arc<Mutex<InterfaceBoard>>, context: &HardwareContext) -> bool {
    let mut board = board.lock().unwrap_or_else(|e| e.into_inner());
    let doc = board.unit_mut().turnon_doc();
    context.delay.delay(Duration::from_millis(500));
    let enabled = match board.unit_mut().enable_bf() {
        Ok(enabled) => enabled,
        Err(e) => {
            warn!("{}", e);
            false
        }
    };
    context.delay.delay(Duration::from_secs(2));
    let sensors = board.check();
    info!("Tile powered: doc={} enabled={} sensors={}", doc, enabled, sensors);
    doc && enabled
}

fn report_telemetry(slot: u8, telemetry: &Telemetry) {
    let status = if telemetry.is_ok() { "✅" } else { "❌" };
    println!(
        "{} BF#{}: temperature={:.2} C flags={:#04x}",
        status, slot, telemetry.temperature, telemetry.flags
    );
}

/// Single-tile flow: power up, point once, optionally hold, tear down
fn run_point(config: &AppConfig, simulate: bool, target: Target, hold: bool) -> Result<()> {
    let signal = ShutdownSignal::install()?;
    let hardware = open_hardware(config, simulate)?;
    let context = &hardware.context;

    let mut guard = SafeShutdown::new(hardware.gpio());
    let mut controllers = pointing_controllers(config, context)?;
    let controller = Arc::new(Mutex::new(controllers.remove(0)));
    guard.register("pointing", controller.clone());
    let board = Arc::new(Mutex::new(interface_board(config, context)?));
    guard.register("interface board", board.clone());

    if !power_up_tile(&board, context) {
        warn!("Tile did not power up cleanly, pointing anyway");
    }

    let mut controller = controller.lock().unwrap_or_else(|e| e.into_inner());
    let telemetry = match target {
        Target::Sky(az, el) => controller.point_azel(az, el),
        Target::Delays(x, y) => controller.point(&x, &y),
    };
    let slot = controller.slot();
    drop(controller);

    let result = match telemetry {
        Ok(telemetry) => {
            report_telemetry(slot, &telemetry);
            if hold {
                println!("⏸️  Holding pointing, press Ctrl+C to power down");
                signal.wait();
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    };

    guard.finish();
    println!("✅ Tile powered down");
    result
}

/// Eight-card flow: power everything, then monitor until interrupted
fn run_power(config: &AppConfig, simulate: bool) -> Result<()> {
    let bus = config
        .power
        .bus
        .context("The power command needs [power.bus] pins (eda preset)")?;
    let signal = ShutdownSignal::install()?;
    let hardware = open_hardware(config, simulate)?;

    let mut guard = SafeShutdown::new(hardware.gpio());
    let controller = Arc::new(Mutex::new(PowerController::new(
        bus,
        config.power.units.clone(),
        &hardware.context,
    )?));
    guard.register("power controller", controller.clone());

    println!("🚀 Powering up {} card(s)", config.power.units.len());
    let ok = controller.lock().unwrap_or_else(|e| e.into_inner()).turn_on_all();
    if !ok {
        warn!("Not every card powered up cleanly");
    }

    let interval = config.monitor.poll_interval();
    while !signal.wait_timeout(interval) {
        let mut controller = controller.lock().unwrap_or_else(|e| e.into_inner());
        let status = controller.check();
        info!(
            "48V={} alarms(power={}, 48V={}) all_powered={} all_enabled={}",
            status.power48, status.alarm_power, status.alarm48, status.all_powered, status.all_enabled
        );
        for unit in controller.units() {
            info!("{}", unit);
        }
    }

    guard.finish();
    println!("✅ All cards powered down");
    Ok(())
}

/// Point every link at the same delays every pointing interval
fn run_comms(config: &AppConfig, simulate: bool, xdelays: DelayVector, ydelays: DelayVector) -> Result<()> {
    let signal = ShutdownSignal::install()?;
    let hardware = open_hardware(config, simulate)?;

    let mut guard = SafeShutdown::new(hardware.gpio());
    let controllers: Vec<Arc<Mutex<PointingController>>> = pointing_controllers(config, &hardware.context)?
        .into_iter()
        .map(|c| Arc::new(Mutex::new(c)))
        .collect();
    for controller in &controllers {
        guard.register("pointing", controller.clone());
    }

    println!("📡 Pointing {} beamformer(s) to x={} y={}", controllers.len(), xdelays, ydelays);
    loop {
        for controller in &controllers {
            let mut controller = controller.lock().unwrap_or_else(|e| e.into_inner());
            match controller.point(&xdelays, &ydelays) {
                Ok(telemetry) => info!(
                    "BF#{} frame sent, flags={:#04x}, temp={:4.1}",
                    controller.slot(),
                    telemetry.flags,
                    telemetry.temperature
                ),
                Err(e) => warn!("BF#{}: {}", controller.slot(), e),
            }
        }
        if signal.wait_timeout(config.monitor.pointing_interval()) {
            break;
        }
    }

    guard.finish();
    Ok(())
}

/// Single-tile test pattern run
fn run_bftest(config: &AppConfig, simulate: bool, modes: &[String], maxloops: u32, delaytime: f64) -> Result<()> {
    let patterns = parse_modes(modes)?;
    if !(delaytime.is_finite() && delaytime >= 0.0) {
        bail!("--delaytime must be a non-negative number of seconds");
    }
    let signal = ShutdownSignal::install()?;
    let hardware = open_hardware(config, simulate)?;
    let context = &hardware.context;

    let mut guard = SafeShutdown::new(hardware.gpio());
    let mut controllers = pointing_controllers(config, context)?;
    let controller = Arc::new(Mutex::new(controllers.remove(0)));
    guard.register("pointing", controller.clone());
    let board = Arc::new(Mutex::new(interface_board(config, context)?));
    guard.register("interface board", board.clone());

    if !power_up_tile(&board, context) {
        warn!("Tile did not power up cleanly, testing anyway");
    }

    let stdin = std::io::stdin();
    let pause = || {
        if signal.is_requested() {
            return false;
        }
        if delaytime == 0.0 {
            eprint!("Press ENTER to continue: ");
            let mut line = String::new();
            matches!(stdin.lock().read_line(&mut line), Ok(n) if n > 0) && !signal.is_requested()
        } else {
            !signal.wait_timeout(Duration::from_secs_f64(delaytime))
        }
    };

    let tally = {
        let mut controller = controller.lock().unwrap_or_else(|e| e.into_inner());
        run_patterns(&mut controller, &patterns, maxloops, pause)
    };

    guard.finish();
    let tally = tally?;
    println!("📊 {}", tally);
    Ok(())
}

fn run_selftest(config: &AppConfig, simulate: bool) -> Result<()> {
    let signal = ShutdownSignal::install()?;
    let hardware = open_hardware(config, simulate)?;
    let mut guard = SafeShutdown::new(hardware.gpio());
    let board = Arc::new(Mutex::new(interface_board(config, &hardware.context)?));
    guard.register("interface board", board.clone());

    println!("🧪 Running interface board self test");
    let report = board
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .self_test_until(|| signal.is_requested());
    for step in &report.steps {
        println!("   {} {}", if step.passed { "✅" } else { "❌" }, step.name);
    }

    guard.finish();
    if report.interrupted {
        bail!("Self test interrupted after {} step(s)", report.steps.len());
    }
    if !report.passed() {
        bail!("{} self test step(s) failed", report.failures().count());
    }
    println!("✅ Self test passed");
    Ok(())
}

#[derive(Serialize)]
struct StatusReport {
    backend: Backend,
    #[serde(skip_serializing_if = "Option::is_none")]
    controller: Option<ControllerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    board: Option<InterfaceBoardStatus>,
    units: Vec<PowerUnitStatus>,
}

/// Read the power hardware once and print it; no output is changed except the LEDs
fn run_status(config: &AppConfig, simulate: bool) -> Result<()> {
    let hardware = open_hardware(config, simulate)?;
    let context = &hardware.context;

    let report = match config.power.variant {
        BoardVariant::Bfif => {
            let unit = config.power.units.first().cloned().context("No power unit configured")?;
            let aux = config.power.aux.context("No [power.aux] pins configured")?;
            let mut board = InterfaceBoard::attach(unit, aux, context);
            if !board.check() {
                warn!("Sensor read failed");
            }
            StatusReport {
                backend: hardware.backend(),
                controller: None,
                units: vec![board.unit().status()],
                board: Some(board.status()),
            }
        }
        BoardVariant::Eda => {
            let bus = config.power.bus.context("No [power.bus] pins configured")?;
            let mut controller = PowerController::new(bus, config.power.units.clone(), context)?;
            let status = controller.check();
            StatusReport {
                backend: hardware.backend(),
                controller: Some(status),
                board: None,
                units: controller.unit_statuses(),
            }
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf, preset: Preset) -> Result<()> {
    let config = match preset {
        Preset::Bfif => AppConfig::single_tile(),
        Preset::EdaPower => AppConfig::eda_box(),
        Preset::EdaComms => AppConfig::eda_comms(),
    };
    config.save_to_file(&output_path)?;

    println!("✅ Generated configuration file: {}", output_path.display());
    println!("📝 Edit the file to customize settings, then run:");
    println!("   bfctl --config {} status", output_path.display());

    Ok(())
}
