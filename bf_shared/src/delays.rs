/*!
Dipole delay vectors.

A [`DelayVector`] holds one delay-line setting per dipole for one polarisation.
Values are validated on construction; out-of-range input is an error, never
clamped.
*/

use crate::error::{BfError, Result};
use crate::protocol::{DIPOLES_PER_TILE, MAX_DELAY_VALUE};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sixteen dipole delays, each in 0..=63
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<i64>")]
pub struct DelayVector([u8; DIPOLES_PER_TILE]);

impl DelayVector {
    /// All delays zero: the tile is pointed at the zenith
    pub const ZENITH: DelayVector = DelayVector([0; DIPOLES_PER_TILE]);

    /// Create a delay vector from 16 values, rejecting any value above 63
    pub fn new(values: [u8; DIPOLES_PER_TILE]) -> Result<Self> {
        if let Some((index, value)) = values
            .iter()
            .enumerate()
            .find(|(_, &v)| v > MAX_DELAY_VALUE)
        {
            return Err(BfError::invalid_delay(format!(
                "dipole {} delay {} is outside 0..={}",
                index, value, MAX_DELAY_VALUE
            )));
        }
        Ok(Self(values))
    }

    /// Create a delay vector from an arbitrary integer slice
    pub fn from_slice(values: &[i64]) -> Result<Self> {
        if values.len() != DIPOLES_PER_TILE {
            return Err(BfError::invalid_delay(format!(
                "expected {} delay values, got {}",
                DIPOLES_PER_TILE,
                values.len()
            )));
        }

        let mut delays = [0u8; DIPOLES_PER_TILE];
        for (i, &value) in values.iter().enumerate() {
            if !(0..=MAX_DELAY_VALUE as i64).contains(&value) {
                return Err(BfError::invalid_delay(format!(
                    "dipole {} delay {} is outside 0..={}",
                    i, value, MAX_DELAY_VALUE
                )));
            }
            delays[i] = value as u8;
        }
        Ok(Self(delays))
    }

    /// Same delay on every dipole
    pub fn uniform(value: u8) -> Result<Self> {
        Self::new([value; DIPOLES_PER_TILE])
    }

    /// Get the raw delay values
    pub fn values(&self) -> &[u8; DIPOLES_PER_TILE] {
        &self.0
    }

    /// Get the delay for one dipole (0-15, row-major from north-west)
    pub fn get(&self, dipole: usize) -> Option<u8> {
        self.0.get(dipole).copied()
    }

    /// Iterate over the delay values in dipole order
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.iter().copied()
    }

    /// Largest delay in the vector
    pub fn max(&self) -> u8 {
        self.0.iter().copied().max().unwrap_or(0)
    }
}

impl Default for DelayVector {
    fn default() -> Self {
        Self::ZENITH
    }
}

impl TryFrom<&[i64]> for DelayVector {
    type Error = BfError;

    fn try_from(values: &[i64]) -> Result<Self> {
        Self::from_slice(values)
    }
}

impl TryFrom<Vec<i64>> for DelayVector {
    type Error = BfError;

    fn try_from(values: Vec<i64>) -> Result<Self> {
        Self::from_slice(&values)
    }
}

impl fmt::Display for DelayVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, "]")
    }
}
