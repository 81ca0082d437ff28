/*!
Pointing controller for one beamformer.

Combines the geometry, the frame codec and the bit-banged link into a single
"point" transaction. In standby the controller answers with the standby
sentinel and never touches the link.
*/

use crate::lifecycle::Teardown;
use crate::transport::BitBangTransport;
use bf_shared::{compute_delays, DelayVector, PointingFrame, Result, Telemetry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointingMode {
    #[default]
    Active,
    Standby,
}

/// The delay pair most recently sent, and when
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastPointing {
    pub timestamp: DateTime<Utc>,
    pub xdelays: DelayVector,
    pub ydelays: DelayVector,
}

/// Flat status snapshot for monitoring
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointingStatus {
    pub slot: u8,
    pub temperature: f64,
    pub flags: u16,
    pub standby_mode: bool,
    pub last_pointing_time: Option<DateTime<Utc>>,
    pub last_xdelays: Option<String>,
    pub last_ydelays: Option<String>,
}

pub struct PointingController {
    slot: u8,
    transport: BitBangTransport,
    mode: PointingMode,
    telemetry: Telemetry,
    last_pointing: Option<LastPointing>,
}

impl PointingController {
    pub fn new(slot: u8, transport: BitBangTransport) -> Self {
        Self {
            slot,
            transport,
            mode: PointingMode::Active,
            telemetry: Telemetry::UNKNOWN,
            last_pointing: None,
        }
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    pub fn mode(&self) -> PointingMode {
        self.mode
    }

    /// Takes effect on the next `point` call
    pub fn set_mode(&mut self, mode: PointingMode) {
        if mode != self.mode {
            info!("BF#{}: pointing mode {:?} -> {:?}", self.slot, self.mode, mode);
        }
        self.mode = mode;
    }

    pub fn is_standby(&self) -> bool {
        self.mode == PointingMode::Standby
    }

    /// Telemetry from the most recent transaction
    pub fn telemetry(&self) -> Telemetry {
        self.telemetry
    }

    pub fn last_pointing(&self) -> Option<&LastPointing> {
        self.last_pointing.as_ref()
    }

    /// Send one delay pair and return the beamformer's telemetry.
    ///
    /// Flags other than `0x80` are reported in the returned value, not as an
    /// error; retrying is up to the caller.
    pub fn point(&mut self, xdelays: &DelayVector, ydelays: &DelayVector) -> Result<Telemetry> {
        if self.is_standby() {
            debug!("BF#{}: standby, not pointing", self.slot);
            return Ok(Telemetry::STANDBY);
        }

        let frame = PointingFrame::new(xdelays, ydelays);
        let telemetry = self.transport.transmit_and_receive(&frame)?.decode();

        if telemetry.is_ok() {
            debug!(
                "BF#{}: pointed, temperature {:.2} C",
                self.slot, telemetry.temperature
            );
        } else {
            warn!(
                "BF#{}: communication error, flags {:#04x}",
                self.slot, telemetry.flags
            );
        }

        self.telemetry = telemetry;
        self.last_pointing = Some(LastPointing {
            timestamp: Utc::now(),
            xdelays: *xdelays,
            ydelays: *ydelays,
        });
        Ok(telemetry)
    }

    /// Validate raw delay lists, then point. Standby short-circuits before validation.
    pub fn point_raw(&mut self, xdelays: &[i64], ydelays: &[i64]) -> Result<Telemetry> {
        if self.is_standby() {
            return Ok(Telemetry::STANDBY);
        }
        let x = DelayVector::from_slice(xdelays)?;
        let y = DelayVector::from_slice(ydelays)?;
        self.point(&x, &y)
    }

    /// Point both polarisations at a sky position
    pub fn point_azel(&mut self, azimuth: f64, elevation: f64) -> Result<Telemetry> {
        if self.is_standby() {
            return Ok(Telemetry::STANDBY);
        }
        let delays = compute_delays(azimuth, elevation)?;
        info!(
            "BF#{}: pointing az={:.1} el={:.1} delays={}",
            self.slot, azimuth, elevation, delays
        );
        self.point(&delays, &delays)
    }

    pub fn status(&self) -> PointingStatus {
        PointingStatus {
            slot: self.slot,
            temperature: self.telemetry.temperature,
            flags: self.telemetry.flags,
            standby_mode: self.is_standby(),
            last_pointing_time: self.last_pointing.as_ref().map(|p| p.timestamp),
            last_xdelays: self.last_pointing.as_ref().map(|p| p.xdelays.to_string()),
            last_ydelays: self.last_pointing.as_ref().map(|p| p.ydelays.to_string()),
        }
    }
}

impl fmt::Display for PointingController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BF#{}: temp={:.2} C flags={:#04x}",
            self.slot, self.telemetry.temperature, self.telemetry.flags
        )?;
        if self.is_standby() {
            write!(f, " [standby]")?;
        }
        if let Some(last) = &self.last_pointing {
            write!(f, " last={}", last.timestamp.format("%Y-%m-%d %H:%M:%S"))?;
        }
        Ok(())
    }
}

impl Teardown for PointingController {
    fn disable_outputs(&mut self) {
        if let Err(e) = self.transport.idle() {
            warn!("BF#{}: failed to idle link lines: {}", self.slot, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{beamformer_raw_temperature, SimBench, SimulatedHardware};
    use crate::transport::LinkPins;
    use bf_shared::ErrorKind;

    const PINS: LinkPins = LinkPins {
        tx_data: 13,
        tx_clock: 12,
        rx_data: 15,
    };

    fn controller(sim: SimulatedHardware) -> (SimBench, PointingController) {
        let bench = sim.into_bench();
        let transport = BitBangTransport::new(bench.context.gpio.clone(), bench.context.delay.clone(), PINS);
        (bench, PointingController::new(1, transport))
    }

    #[test]
    fn test_standby_does_not_touch_hardware() {
        let (bench, mut ctl) = controller(SimulatedHardware::new());
        ctl.set_mode(PointingMode::Standby);

        let result = ctl.point(&DelayVector::ZENITH, &DelayVector::ZENITH).unwrap();
        assert_eq!(result.temperature, -999.0);
        assert_eq!(result.flags, 999);
        assert_eq!(ctl.point_raw(&[99; 3], &[0; 16]).unwrap(), Telemetry::STANDBY);
        assert_eq!(ctl.point_azel(0.0, -10.0).unwrap(), Telemetry::STANDBY);

        assert!(bench.log().is_empty());
        assert!(ctl.last_pointing().is_none());
        assert!(ctl.status().standby_mode);
    }

    #[test]
    fn test_point_end_to_end() {
        let mut sim = SimulatedHardware::new();
        sim.attach_beamformer(PINS, None, beamformer_raw_temperature(31.5));
        let (bench, mut ctl) = controller(sim);

        let x = DelayVector::from_slice(&(0..16).collect::<Vec<i64>>()).unwrap();
        let y = DelayVector::uniform(7).unwrap();
        let telemetry = ctl.point(&x, &y).unwrap();

        assert_eq!(telemetry.flags, 0x80);
        assert_eq!(telemetry.temperature, 31.5);
        let last = ctl.last_pointing().unwrap();
        assert_eq!(last.xdelays, x);
        assert_eq!(last.ydelays, y);
        assert_eq!(bench.with(|s| s.received_frames(13)).len(), 1);

        let status = ctl.status();
        assert_eq!(status.flags, 0x80);
        assert!(status.last_xdelays.unwrap().starts_with("[0, 1, 2"));
        assert!(ctl.to_string().contains("flags=0x80"));
    }

    #[test]
    fn test_communication_error_is_not_an_exception() {
        let (_bench, mut ctl) = controller(SimulatedHardware::new());
        let telemetry = ctl.point(&DelayVector::ZENITH, &DelayVector::ZENITH).unwrap();
        assert_eq!(telemetry.flags, 0);
        assert!(!telemetry.is_ok());
        assert!(ctl.last_pointing().is_some());
    }

    #[test]
    fn test_validation_and_steering_errors() {
        let (bench, mut ctl) = controller(SimulatedHardware::new());
        let err = ctl.point_raw(&[0; 15], &[0; 16]).unwrap_err();
        assert!(err.is_validation());
        let err = ctl.point_azel(45.0, 10.0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SteeringOutOfRange);
        assert!(bench.log().is_empty());
        assert!(ctl.last_pointing().is_none());
    }

    #[test]
    fn test_point_azel_and_resume_from_standby() {
        let mut sim = SimulatedHardware::new();
        sim.attach_beamformer(PINS, None, 0);
        let (bench, mut ctl) = controller(sim);

        ctl.set_mode(PointingMode::Standby);
        ctl.point_azel(45.0, 60.0).unwrap();
        ctl.set_mode(PointingMode::Active);
        assert!(ctl.point_azel(45.0, 60.0).unwrap().is_ok());

        let expected = compute_delays(45.0, 60.0).unwrap();
        let frames = bench.with(|s| s.received_frames(13));
        assert_eq!(frames, vec![Some(*PointingFrame::new(&expected, &expected).words())]);
    }

    #[test]
    fn test_teardown_idles_link() {
        let (bench, mut ctl) = controller(SimulatedHardware::new());
        ctl.teardown();
        assert_eq!(bench.log().writes_to(13), vec![false]);
        assert_eq!(bench.log().writes_to(12), vec![false]);
    }
}
