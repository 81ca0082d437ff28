/*!
Beamformer test patterns.

Modes are given on the command line as `dipole[A-P...]` (one dipole at zero
delay, every other dipole switched fully off) or `delay[0-7...]` (the same
delay on every dipole). A bare mode name expands to its default set.
*/

use crate::pointing::PointingController;
use anyhow::{bail, Result};
use bf_shared::DelayVector;
use regex::Regex;
use std::fmt;
use tracing::{info, warn};

const ALL_DIPOLES: &str = "ABCDEFGHIJKLMNOP";
const DEFAULT_DELAYS: &str = "0123456";

/// Delay that switches a dipole fully off
const OFF_DELAY: u8 = 32;

/// Uniform delay for each `delay` mode digit
const DELAY_TABLE: [(char, &str, u8); 8] = [
    ('0', "None", 0),
    ('1', "Del1", 1),
    ('2', "Del2", 2),
    ('3', "Del3", 4),
    ('4', "Del4", 8),
    ('5', "Del5", 16),
    ('6', "All", 31),
    ('7', "Off", 32),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    /// Only this dipole (A-P) is on
    Dipole(char),
    /// Uniform delay selected by digit 0-7
    Delay(char),
}

impl TestPattern {
    pub fn name(&self) -> String {
        match *self {
            Self::Dipole(c) => format!("Dip{}", c),
            Self::Delay(d) => DELAY_TABLE
                .iter()
                .find(|(digit, _, _)| *digit == d)
                .map(|(_, name, _)| name.to_string())
                .unwrap_or_default(),
        }
    }

    pub fn delays(&self) -> DelayVector {
        let mut values = [0u8; 16];
        match *self {
            Self::Dipole(c) => {
                let index = (c as u8 - b'A') as usize;
                for (i, v) in values.iter_mut().enumerate() {
                    *v = if i == index { 0 } else { OFF_DELAY };
                }
            }
            Self::Delay(d) => {
                let value = DELAY_TABLE
                    .iter()
                    .find(|(digit, _, _)| *digit == d)
                    .map_or(0, |(_, _, v)| *v);
                values = [value; 16];
            }
        }
        // Pattern values never exceed 32
        DelayVector::new(values).unwrap_or_default()
    }
}

impl fmt::Display for TestPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dipole(_) => write!(f, "Dipole {}", self.name()),
            Self::Delay(_) => write!(f, "Delay {}", self.name()),
        }
    }
}

/// Expand mode arguments into the ordered list of patterns to run
pub fn parse_modes<S: AsRef<str>>(modes: &[S]) -> Result<Vec<TestPattern>> {
    let pattern = Regex::new(r"^(DIPOLE|DELAY)([A-Z0-9]*)$")?;
    let mut patterns = Vec::new();

    for mode in modes {
        let upper = mode.as_ref().trim().to_uppercase();
        let Some(caps) = pattern.captures(&upper) else {
            bail!("Unknown test mode '{}': expected dipole[A-P...] or delay[0-7...]", mode.as_ref());
        };
        let selection = caps.get(2).map_or("", |m| m.as_str());

        match &caps[1] {
            "DIPOLE" => {
                let list = if selection.is_empty() { ALL_DIPOLES } else { selection };
                for c in list.chars() {
                    if !ALL_DIPOLES.contains(c) {
                        bail!("Unknown dipole '{}' in mode '{}'", c, mode.as_ref());
                    }
                    patterns.push(TestPattern::Dipole(c));
                }
            }
            _ => {
                let list = if selection.is_empty() { DEFAULT_DELAYS } else { selection };
                for d in list.chars() {
                    if !('0'..='7').contains(&d) {
                        bail!("Unknown delay '{}' in mode '{}'", d, mode.as_ref());
                    }
                    patterns.push(TestPattern::Delay(d));
                }
            }
        }
    }

    if patterns.is_empty() {
        patterns.extend(ALL_DIPOLES.chars().map(TestPattern::Dipole));
    }
    Ok(patterns)
}

/// Running count of test pointings and failed ones
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestTally {
    pub tests: u32,
    pub failed: u32,
}

impl fmt::Display for TestTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Total of {} tests, of which {:04} were bad", self.tests, self.failed)
    }
}

/// Point at each pattern in turn, `maxloops` times (0 = until `pause` says stop).
///
/// `pause` runs after every pointing and returns false to stop early.
pub fn run_patterns(
    controller: &mut PointingController,
    patterns: &[TestPattern],
    maxloops: u32,
    mut pause: impl FnMut() -> bool,
) -> bf_shared::Result<TestTally> {
    let mut tally = TestTally::default();
    let mut loops = 0;

    while maxloops == 0 || loops < maxloops {
        for pattern in patterns {
            let delays = pattern.delays();
            let telemetry = controller.point(&delays, &delays)?;
            tally.tests += 1;
            if telemetry.is_ok() {
                info!(
                    "{}: Temp={:4.1} Flags={:02x}",
                    pattern, telemetry.temperature, telemetry.flags
                );
            } else {
                tally.failed += 1;
                warn!(
                    "{}: Temp={:4.1} Flags={:02x} ** BAD **",
                    pattern, telemetry.temperature, telemetry.flags
                );
            }

            if tally.tests % 100 == 0 {
                info!("Test {:04}, of which {:04} were bad", tally.tests, tally.failed);
            }
            if !pause() {
                return Ok(tally);
            }
        }
        loops += 1;
    }
    Ok(tally)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::SimulatedHardware;
    use crate::transport::{BitBangTransport, LinkPins};

    #[test]
    fn test_parse_modes() {
        let patterns = parse_modes(&["dipoleAP", "Delay07"]).unwrap();
        assert_eq!(
            patterns,
            vec![
                TestPattern::Dipole('A'),
                TestPattern::Dipole('P'),
                TestPattern::Delay('0'),
                TestPattern::Delay('7'),
            ]
        );

        assert_eq!(parse_modes(&["dipole"]).unwrap().len(), 16);
        assert_eq!(parse_modes(&["delay"]).unwrap().len(), 7);
        assert_eq!(parse_modes::<&str>(&[]).unwrap().len(), 16);

        assert!(parse_modes(&["dipoleQ"]).is_err());
        assert!(parse_modes(&["delay8"]).is_err());
        assert!(parse_modes(&["zenith"]).is_err());
    }

    #[test]
    fn test_pattern_delays() {
        let dipole = TestPattern::Dipole('C').delays();
        assert_eq!(dipole.get(2), Some(0));
        assert_eq!(dipole.iter().filter(|&v| v == 32).count(), 15);
        assert_eq!(TestPattern::Dipole('C').name(), "DipC");

        assert_eq!(TestPattern::Delay('3').delays(), DelayVector::uniform(4).unwrap());
        assert_eq!(TestPattern::Delay('6').delays(), DelayVector::uniform(31).unwrap());
        assert_eq!(TestPattern::Delay('7').to_string(), "Delay Off");
    }

    #[test]
    fn test_run_patterns_counts_failures() {
        let pins = LinkPins {
            tx_data: 13,
            tx_clock: 12,
            rx_data: 15,
        };
        let mut sim = SimulatedHardware::new();
        sim.attach_beamformer(pins, Some(19), 400);
        sim.set_input(19, true);
        let bench = sim.into_bench();
        bench.log().set_enabled(false);
        let transport = BitBangTransport::new(bench.context.gpio.clone(), bench.context.delay.clone(), pins);
        let mut controller = PointingController::new(1, transport);

        let patterns = parse_modes(&["delay01"]).unwrap();
        let tally = run_patterns(&mut controller, &patterns, 2, || true).unwrap();
        assert_eq!(tally, TestTally { tests: 4, failed: 0 });

        // Beamformer loses its enable: every pointing fails
        bench.with(|s| s.set_input(19, false));
        let tally = run_patterns(&mut controller, &patterns, 1, || true).unwrap();
        assert_eq!(tally, TestTally { tests: 2, failed: 2 });

        let mut calls = 0;
        let tally = run_patterns(&mut controller, &patterns, 0, || {
            calls += 1;
            calls < 5
        })
        .unwrap();
        assert_eq!(tally.tests, 5);
        assert!(tally.to_string().starts_with("Total of 5 tests"));
    }
}
