/*!
# Beamformer Controller

Pointing and power sequencing for tile beamformers.

## Components

- [`transport::BitBangTransport`] - clocks pointing frames out and telemetry in
- [`pointing::PointingController`] - one beamformer's point transaction and standby gating
- [`power::PowerUnit`] - one interface card's DoC rail, enable line and sensors
- [`power::PowerController`] - the eight-card box with its shared 48V supply
- [`power::InterfaceBoard`] - the single-tile interface board

Components reach the hardware only through the capability traits in
[`hardware`], so everything here runs unchanged against the simulator.
*/

pub mod config;
pub mod hardware;
pub mod lifecycle;
pub mod pointing;
pub mod power;
pub mod runtime;
pub mod testmode;
pub mod transport;

pub use config::AppConfig;
pub use hardware::{DigitalIo, HardwareContext, I2cBus};
pub use lifecycle::{SafeShutdown, ShutdownSignal, Teardown};
pub use pointing::{PointingController, PointingMode};
pub use power::{InterfaceBoard, PowerController, PowerUnit};
pub use transport::{BitBangTransport, LinkPins};
