/*!
Tile pointing geometry.

Dipole layout, viewed from above (north up). Offsets are measured from the
tile centre, `x` positive to the east and `y` positive to the north:

```text
            N
      0   1   2   3
      4   5   6   7
  W   8   9   10  11   E
      12  13  14  15
            S
```

[`compute_delays`] turns an azimuth/elevation into quantized delay-line
settings; [`estimate_pointing`] goes the other way for diagnostics.
*/

use crate::delays::DelayVector;
use crate::error::{BfError, Result};
use crate::protocol::DIPOLES_PER_TILE;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Dipole separation in metres
pub const DIPOLE_SEPARATION_M: f64 = 1.10;

/// Delay line increment in picoseconds
pub const DELAY_STEP_PS: f64 = 435.0;

/// Largest usable delay, in delay steps
pub const MAX_DELAY_STEPS: i64 = 31;

/// Speed of light in metres per picosecond
pub const SPEED_OF_LIGHT_M_PER_PS: f64 = 0.000299798;

/// Quantization phase search covers +/- this fraction of a step
const OFFSET_SEARCH_LIMIT: f64 = 0.45;

/// Quantization phase search increment, as a fraction of a step
const OFFSET_SEARCH_INCREMENT: f64 = 1.0 / 20.0;

/// Dipole triples used to back out a pointing from delays
const TRIANGULATION_TRIPLES: [(usize, usize, usize); 4] =
    [(0, 15, 12), (0, 15, 3), (3, 12, 15), (0, 3, 12)];

/// Collinearity threshold for a triangulation triple
const DEGENERATE_EPSILON: f64 = 1e-15;

/// A direction on the sky, in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyDirection {
    /// Azimuth, 0 = north, increasing clockwise (east = 90)
    pub azimuth: f64,
    /// Elevation above the horizon
    pub elevation: f64,
}

impl SkyDirection {
    /// Straight up
    pub const ZENITH: SkyDirection = SkyDirection {
        azimuth: 0.0,
        elevation: 90.0,
    };

    /// Zenith angle (90 - elevation)
    pub fn zenith_angle(&self) -> f64 {
        90.0 - self.elevation
    }
}

impl From<SkyDirection> for (f64, f64) {
    fn from(dir: SkyDirection) -> Self {
        (dir.azimuth, dir.elevation)
    }
}

/// East/north offset of a dipole from the tile centre, in metres
pub fn dipole_offset(dipole: usize) -> (f64, f64) {
    let column = (dipole % 4) as f64;
    let row = (dipole / 4) as f64;
    (
        (-1.5 + column) * DIPOLE_SEPARATION_M,
        (1.5 - row) * DIPOLE_SEPARATION_M,
    )
}

/// Exact geometric delays in picoseconds, shifted so the smallest is zero
pub fn geometric_delays(azimuth: f64, elevation: f64) -> Result<[f64; DIPOLES_PER_TILE]> {
    let za = 90.0 - elevation;
    if !za.is_finite() || za.abs() > 90.0 {
        return Err(BfError::out_of_range(format!(
            "elevation {} gives zenith angle {} (limit 90)",
            elevation, za
        )));
    }
    if !azimuth.is_finite() {
        return Err(BfError::out_of_range(format!("azimuth {} is not finite", azimuth)));
    }

    let (sin_az, cos_az) = azimuth.to_radians().sin_cos();
    let sin_za = za.to_radians().sin();

    let mut delays = [0.0; DIPOLES_PER_TILE];
    for (i, delay) in delays.iter_mut().enumerate() {
        let (x, y) = dipole_offset(i);
        *delay = (x * sin_az + y * cos_az) * sin_za / SPEED_OF_LIGHT_M_PER_PS;
    }

    let min = delays.iter().copied().fold(f64::INFINITY, f64::min);
    for delay in delays.iter_mut() {
        *delay -= min;
    }

    Ok(delays)
}

/// Round a delay (ps) to whole steps, ties to even
fn to_steps(delay_ps: f64) -> i64 {
    (delay_ps / DELAY_STEP_PS).round_ties_even() as i64
}

/// Mean squared quantization error for a uniform phase offset
fn mean_square_deviation(delays: &[f64; DIPOLES_PER_TILE], offset: f64) -> f64 {
    let total: f64 = delays
        .iter()
        .map(|&d| {
            let shifted = d + offset;
            let steps = to_steps(shifted).min(MAX_DELAY_STEPS);
            (steps as f64 * DELAY_STEP_PS - shifted).powi(2)
        })
        .sum();
    total / DIPOLES_PER_TILE as f64
}

/// Offset (ps) in [-0.45, +0.45] steps minimising the mean squared quantization error.
/// The first minimum found wins.
fn best_quantization_offset(delays: &[f64; DIPOLES_PER_TILE]) -> f64 {
    let start = -OFFSET_SEARCH_LIMIT * DELAY_STEP_PS;
    let increment = OFFSET_SEARCH_INCREMENT * DELAY_STEP_PS;
    let count = (2.0 * OFFSET_SEARCH_LIMIT / OFFSET_SEARCH_INCREMENT).round() as usize;

    let mut best_offset = start;
    let mut min_deviation = mean_square_deviation(delays, start);

    for k in 1..=count {
        let offset = start + k as f64 * increment;
        let deviation = mean_square_deviation(delays, offset);
        if deviation < min_deviation {
            min_deviation = deviation;
            best_offset = offset;
        }
    }

    best_offset
}

/// Compute the delay-line settings that point the tile at (azimuth, elevation).
///
/// Azimuth is measured from north through east; elevation from the horizon.
/// Fails with [`BfError::OutOfRange`] for a zenith angle beyond 90 degrees, and
/// with [`BfError::SteeringOutOfRange`] when any dipole would need more than
/// one step beyond the delay-line maximum. Exactly one step over is clamped.
pub fn compute_delays(azimuth: f64, elevation: f64) -> Result<DelayVector> {
    let delays = geometric_delays(azimuth, elevation)?;
    let offset = best_quantization_offset(&delays);

    let mut settings = [0u8; DIPOLES_PER_TILE];
    for (i, &delay) in delays.iter().enumerate() {
        let mut steps = to_steps(delay + offset).max(0);
        if steps > MAX_DELAY_STEPS {
            if steps > MAX_DELAY_STEPS + 1 {
                return Err(BfError::SteeringOutOfRange {
                    dipole: i,
                    steps,
                    max: MAX_DELAY_STEPS,
                });
            }
            steps = MAX_DELAY_STEPS;
        }
        settings[i] = steps as u8;
    }

    debug!(
        "Delays for az={:.2} el={:.2}: offset {:.1} ps -> {:?}",
        azimuth, elevation, offset, settings
    );

    DelayVector::new(settings)
}

/// Estimate (azimuth, zenith angle) in degrees from three dipoles.
/// Returns `None` for equal delays, collinear triples or an unphysical result.
fn triangulate(d: [f64; 3], ox: [f64; 3], oy: [f64; 3]) -> Option<(f64, f64)> {
    if d[0] == d[1] && d[0] == d[2] {
        return None;
    }

    let az = f64::atan2(
        (d[2] - d[0]) * (oy[1] - oy[0]) - (d[1] - d[0]) * (oy[2] - oy[0]),
        (d[1] - d[0]) * (ox[2] - ox[0]) - (d[2] - d[0]) * (ox[1] - ox[0]),
    );
    let (sin_az, cos_az) = az.sin_cos();

    let baseline_23 = (ox[1] - ox[2]) * sin_az + (oy[1] - oy[2]) * cos_az;
    let baseline_13 = (ox[0] - ox[2]) * sin_az + (oy[0] - oy[2]) * cos_az;

    let za = if baseline_23.abs() > DEGENERATE_EPSILON {
        ((d[1] - d[2]) * SPEED_OF_LIGHT_M_PER_PS / baseline_23).asin()
    } else if baseline_13.abs() > DEGENERATE_EPSILON {
        ((d[0] - d[2]) * SPEED_OF_LIGHT_M_PER_PS / baseline_13).asin()
    } else {
        return None;
    };

    if !za.is_finite() {
        return None;
    }

    let mut azd = az.to_degrees();
    let mut zad = za.to_degrees();
    if zad < 0.0 {
        zad = -zad;
        azd += 180.0;
    }
    Some((azd.rem_euclid(360.0), zad))
}

/// Estimate the pointing direction that produced a set of delays.
///
/// Averages the triangulated estimate of four fixed dipole triples, skipping
/// degenerate ones. Falls back to the zenith if no triple is usable. Results
/// are rounded to 0.1 degree. For cross-checking only.
pub fn estimate_pointing(delays: &DelayVector) -> SkyDirection {
    let mut azimuths = Vec::with_capacity(TRIANGULATION_TRIPLES.len());
    let mut zenith_angles = Vec::with_capacity(TRIANGULATION_TRIPLES.len());

    for (i, j, k) in TRIANGULATION_TRIPLES {
        let idx = [i, j, k];
        let d = idx.map(|n| DELAY_STEP_PS * f64::from(delays.values()[n]));
        let ox = idx.map(|n| dipole_offset(n).0);
        let oy = idx.map(|n| dipole_offset(n).1);

        match triangulate(d, ox, oy) {
            Some((az, za)) => {
                azimuths.push(az);
                zenith_angles.push(za);
            }
            None => debug!("Skipping degenerate dipole triple ({}, {}, {})", i, j, k),
        }
    }

    if azimuths.is_empty() {
        return SkyDirection::ZENITH;
    }

    let n = azimuths.len() as f64;
    let az = azimuths.iter().sum::<f64>() / n;
    let za = zenith_angles.iter().sum::<f64>() / n;

    SkyDirection {
        azimuth: round_tenth(az),
        elevation: round_tenth(90.0 - za),
    }
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
