/*!
Power and enable sequencing.

- [`unit`] - one interface card (DoC rail, beamformer enable, sensors)
- [`controller`] - the eight-card box with its shared 48V supply
- [`board`] - the single-tile interface board and its auxiliary lines
*/

pub mod board;
pub mod controller;
pub mod unit;

pub use board::{AuxPins, InterfaceBoard, InterfaceBoardStatus, SelfTestReport, SerialMode};
pub use controller::{BusPins, ControllerStatus, PowerController};
pub use unit::{PowerUnit, PowerUnitConfig, PowerUnitStatus};
