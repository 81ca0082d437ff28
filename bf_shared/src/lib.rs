/*!
# Shared Types and Algorithms

This crate contains the hardware-independent parts of the tile beamformer
control system: the pointing geometry, the pointing bitstream codec and the
data types that flow between them.

## Core Types

- [`DelayVector`] - 16 validated 6-bit dipole delays
- [`PointingFrame`] - 253-bit pointing command frame
- [`TelemetryFrame`] - 25-bit readback frame (temperature + flags)
- [`Telemetry`] - decoded readback values

## Modules

- [`geometry`] - delay computation and the inverse pointing estimate
- [`bitstream`] - frame encoding and telemetry decoding
- [`delays`] - delay vector type
- [`error`] - Common error types
*/

pub mod bitstream;
pub mod delays;
pub mod error;
pub mod geometry;

// Re-export commonly used types
pub use bitstream::{decode_telemetry, encode, PointingFrame, Telemetry, TelemetryFrame};
pub use delays::DelayVector;
pub use error::{BfError, ErrorKind, HardwareError, Result};
pub use geometry::{compute_delays, estimate_pointing, SkyDirection};

/// Version information for the shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol constants
pub mod protocol {
    /// Number of dipoles (and delay values per polarisation) in a tile
    pub const DIPOLES_PER_TILE: usize = 16;

    /// Width of one delay value on the wire
    pub const DELAY_FIELD_BITS: usize = 6;

    /// Largest value a 6-bit delay field can carry
    pub const MAX_DELAY_VALUE: u8 = 63;

    /// Header: 8 zero bits, 4 one bits, 20 zero bits
    pub const HEADER_BITS: usize = 32;

    /// Number of packed 16-bit delay words (32 delays x 6 bits / 16)
    pub const DATA_WORDS: usize = 12;

    /// Width of a packed word and of the checksum
    pub const WORD_BITS: usize = 16;

    /// Total pointing frame length in bits
    pub const FRAME_BITS: usize = 253;

    /// Readback length: 24 data bits plus one flush clock
    pub const TELEMETRY_BITS: usize = 25;

    /// Number of leading readback bits holding the raw temperature
    pub const TELEMETRY_TEMPERATURE_BITS: usize = 17;

    /// Flag byte reported by a beamformer that received a good frame
    pub const TELEMETRY_OK_FLAGS: u8 = 0x80;

    /// Default duration of one transmitted bit, in microseconds
    pub const DEFAULT_BIT_PERIOD_US: u64 = 20;
}
