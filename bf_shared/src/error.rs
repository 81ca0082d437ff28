/*!
Common error types for the beamformer control components.
*/

use thiserror::Error;

/// Common result type used throughout the shared library
pub type Result<T> = std::result::Result<T, BfError>;

/// Failure reported by a GPIO or I2C capability implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HardwareError {
    /// A digital line could not be driven or sampled
    #[error("GPIO pin {pin}: {message}")]
    Gpio { pin: u32, message: String },

    /// An I2C transaction failed (NACK, bus timeout, missing device)
    #[error("I2C device 0x{address:02x}: {message}")]
    I2c { address: u8, message: String },

    /// The hardware handle has already been released during teardown
    #[error("hardware interface has been released")]
    Released,
}

impl HardwareError {
    /// Create a GPIO error for the given pin
    pub fn gpio(pin: u32, msg: impl Into<String>) -> Self {
        Self::Gpio { pin, message: msg.into() }
    }

    /// Create an I2C error for the given 7-bit device address
    pub fn i2c(address: u8, msg: impl Into<String>) -> Self {
        Self::I2c { address, message: msg.into() }
    }
}

/// Coarse classification of a [`BfError`], used by callers to pick a retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed caller input; fix the input, never retry as-is
    Validation,
    /// A write's read-back did not match the intended state
    HardwareMismatch,
    /// I/O failure on the bus or link, or a bad telemetry flag byte
    Communication,
    /// An operation was requested before its precondition held
    PrerequisiteNotMet,
    /// The requested pointing cannot be realised by the delay lines
    SteeringOutOfRange,
    /// Configuration, filesystem or serialization problems outside the control loop
    Environment,
}

/// Comprehensive error type for all shared operations
#[derive(Error, Debug)]
pub enum BfError {
    /// Delay vector has the wrong length or a value outside 0..=63
    #[error("Invalid delay: {0}")]
    InvalidDelay(String),

    /// Azimuth/elevation outside the physically meaningful range
    #[error("Pointing out of range: {0}")]
    OutOfRange(String),

    /// A bit frame did not have the length the protocol requires
    #[error("Invalid frame length: expected {expected} bits, got {actual}")]
    InvalidFrameLength { expected: usize, actual: usize },

    /// Geometry needs more delay than the delay lines can provide
    #[error("Steering out of range: dipole {dipole} needs {steps} delay steps (max {max})")]
    SteeringOutOfRange { dipole: usize, steps: i64, max: i64 },

    /// e.g. enabling a beamformer before its rail is powered
    #[error("Prerequisite not met: {0}")]
    PrerequisiteNotMet(String),

    /// Hardware read-back disagreed with the requested state
    #[error("Hardware mismatch: {0}")]
    HardwareMismatch(String),

    /// GPIO/I2C capability failure
    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    /// Link-level communication problem
    #[error("Communication error: {0}")]
    Communication(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl BfError {
    /// Create a new invalid delay error
    pub fn invalid_delay(msg: impl Into<String>) -> Self {
        Self::InvalidDelay(msg.into())
    }

    /// Create a new out-of-range pointing error
    pub fn out_of_range(msg: impl Into<String>) -> Self {
        Self::OutOfRange(msg.into())
    }

    /// Create a new prerequisite error
    pub fn prerequisite(msg: impl Into<String>) -> Self {
        Self::PrerequisiteNotMet(msg.into())
    }

    /// Create a new communication error
    pub fn communication(msg: impl Into<String>) -> Self {
        Self::Communication(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidDelay(_) | Self::OutOfRange(_) | Self::InvalidFrameLength { .. } => {
                ErrorKind::Validation
            }
            Self::SteeringOutOfRange { .. } => ErrorKind::SteeringOutOfRange,
            Self::PrerequisiteNotMet(_) => ErrorKind::PrerequisiteNotMet,
            Self::HardwareMismatch(_) => ErrorKind::HardwareMismatch,
            Self::Hardware(_) | Self::Communication(_) => ErrorKind::Communication,
            Self::Config(_) | Self::Io(_) | Self::Serde(_) => ErrorKind::Environment,
        }
    }

    /// True for errors the caller can fix by changing its input
    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }
}
