/*!
Bit-banged serial link to a beamformer.

A pointing transaction shifts the 253-bit frame out on the data line, then
clocks 25 more times with the data line low to shift the telemetry frame in.
Data is held stable across both clock edges so the receiver may sample on
either. The whole transaction runs with the GPIO lock held and cannot be
interrupted part way.
*/

use crate::hardware::{lock, Pin, SharedDelay, SharedGpio};
use bf_shared::protocol::{DEFAULT_BIT_PERIOD_US, TELEMETRY_BITS};
use bf_shared::{PointingFrame, Result, TelemetryFrame};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

/// The three lines of one beamformer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPins {
    pub tx_data: Pin,
    pub tx_clock: Pin,
    pub rx_data: Pin,
}

pub const DEFAULT_BIT_PERIOD: Duration = Duration::from_micros(DEFAULT_BIT_PERIOD_US);

pub struct BitBangTransport {
    gpio: SharedGpio,
    delay: SharedDelay,
    pins: LinkPins,
    bit_period: Duration,
}

impl BitBangTransport {
    pub fn new(gpio: SharedGpio, delay: SharedDelay, pins: LinkPins) -> Self {
        Self {
            gpio,
            delay,
            pins,
            bit_period: DEFAULT_BIT_PERIOD,
        }
    }

    pub fn with_bit_period(mut self, bit_period: Duration) -> Self {
        self.bit_period = bit_period;
        self
    }

    pub fn pins(&self) -> LinkPins {
        self.pins
    }

    pub fn bit_period(&self) -> Duration {
        self.bit_period
    }

    /// Send a frame and read the telemetry reply at the configured bit period
    pub fn transmit_and_receive(&self, frame: &PointingFrame) -> Result<TelemetryFrame> {
        self.transmit_and_receive_with(frame, self.bit_period)
    }

    /// Send a frame and read the telemetry reply at an explicit bit period
    /// (used for link margin testing)
    pub fn transmit_and_receive_with(&self, frame: &PointingFrame, bit_period: Duration) -> Result<TelemetryFrame> {
        let quarter = bit_period / 4;
        let half = bit_period / 2;
        let LinkPins {
            tx_data,
            tx_clock,
            rx_data,
        } = self.pins;

        debug!(
            "Sending {} bit frame on data={} clock={} ({:?}/bit): {}",
            frame.len(),
            tx_data,
            tx_clock,
            bit_period,
            frame.to_hex()
        );

        let mut gpio = lock(&self.gpio);

        for &bit in frame.bits() {
            gpio.write(tx_data, bit)?;
            self.delay.delay(quarter);
            gpio.write(tx_clock, true)?;
            self.delay.delay(half);
            gpio.write(tx_clock, false)?;
            self.delay.delay(quarter);
        }

        gpio.write(tx_data, false)?;

        // One clock beyond the 24 data bits flushes the remote shift register
        let mut reply = [false; TELEMETRY_BITS];
        for bit in reply.iter_mut() {
            self.delay.delay(quarter);
            gpio.write(tx_clock, true)?;
            self.delay.delay(quarter);
            *bit = gpio.read(rx_data)?;
            self.delay.delay(quarter);
            gpio.write(tx_clock, false)?;
            self.delay.delay(quarter);
        }
        drop(gpio);

        let telemetry = TelemetryFrame::from_bits(&reply)?;
        trace!(
            "Readback raw={:#07x} flags={:#04x}",
            telemetry.raw_temperature(),
            telemetry.flags()
        );
        Ok(telemetry)
    }

    /// Drive the data and clock lines low
    pub fn idle(&self) -> Result<()> {
        let mut gpio = lock(&self.gpio);
        gpio.write(self.pins.tx_data, false)?;
        gpio.write(self.pins.tx_clock, false)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{HardwareOp, SimulatedHardware};
    use crate::hardware::DigitalIo;
    use bf_shared::protocol::FRAME_BITS;
    use bf_shared::DelayVector;

    const PINS: LinkPins = LinkPins {
        tx_data: 13,
        tx_clock: 12,
        rx_data: 15,
    };

    #[test]
    fn test_transaction_with_emulated_beamformer() {
        let mut sim = SimulatedHardware::new();
        sim.attach_beamformer(PINS, None, 400);
        let bench = sim.into_bench();
        let transport = BitBangTransport::new(bench.context.gpio.clone(), bench.context.delay.clone(), PINS);

        let x = DelayVector::uniform(5).unwrap();
        let frame = PointingFrame::new(&x, &DelayVector::ZENITH);
        let reply = transport.transmit_and_receive(&frame).unwrap();

        assert_eq!(reply.flags(), 0x80);
        assert_eq!(reply.temperature(), 25.0);
        let received = bench.with(|sim| sim.received_frames(13));
        assert_eq!(received, vec![Some(*frame.words())]);
    }

    #[test]
    fn test_clock_and_timing_sequence() {
        let bench = SimulatedHardware::new().into_bench();
        let transport = BitBangTransport::new(bench.context.gpio.clone(), bench.context.delay.clone(), PINS);
        let frame = PointingFrame::new(&DelayVector::ZENITH, &DelayVector::ZENITH);
        transport.transmit_and_receive(&frame).unwrap();

        let clocks = bench.log().writes_to(12);
        assert_eq!(clocks.len(), 2 * (FRAME_BITS + TELEMETRY_BITS));
        assert!(clocks.chunks(2).all(|pair| pair == [true, false]));

        let data = bench.log().writes_to(13);
        assert_eq!(data.len(), FRAME_BITS + 1);
        assert_eq!(&data[..FRAME_BITS], frame.bits());
        assert!(!data[FRAME_BITS]);

        // 4 quarter-bit waits per frame bit and per readback bit
        assert_eq!(bench.log().total_delay(), DEFAULT_BIT_PERIOD * (FRAME_BITS + TELEMETRY_BITS) as u32);

        // First bit: data, T/4, clock high, T/2, clock low, T/4
        let entries = bench.log().entries();
        assert_eq!(
            &entries[..6],
            &[
                HardwareOp::Write { pin: 13, high: false },
                HardwareOp::Delay(Duration::from_micros(5)),
                HardwareOp::Write { pin: 12, high: true },
                HardwareOp::Delay(Duration::from_micros(10)),
                HardwareOp::Write { pin: 12, high: false },
                HardwareOp::Delay(Duration::from_micros(5)),
            ]
        );

        // Readback: data held low, then each pulse samples between clock high and clock low
        let quarter = HardwareOp::Delay(Duration::from_micros(5));
        let pulse = [
            quarter.clone(),
            HardwareOp::Write { pin: 12, high: true },
            quarter.clone(),
            HardwareOp::Read { pin: 15 },
            quarter.clone(),
            HardwareOp::Write { pin: 12, high: false },
            quarter,
        ];
        let readback = &entries[entries.len() - pulse.len() * TELEMETRY_BITS..];
        assert_eq!(
            entries[entries.len() - readback.len() - 1],
            HardwareOp::Write { pin: 13, high: false }
        );
        assert!(readback.chunks(pulse.len()).all(|chunk| chunk == pulse));
    }

    #[test]
    fn test_silent_link_reads_zero_flags() {
        let bench = SimulatedHardware::new().into_bench();
        let transport = BitBangTransport::new(bench.context.gpio.clone(), bench.context.delay.clone(), PINS)
            .with_bit_period(Duration::from_micros(40));
        let frame = PointingFrame::new(&DelayVector::ZENITH, &DelayVector::ZENITH);
        let reply = transport.transmit_and_receive(&frame).unwrap();
        assert_eq!(reply.flags(), 0);
        assert_eq!(bench.log().total_delay(), Duration::from_micros(40) * (FRAME_BITS + TELEMETRY_BITS) as u32);
    }

    #[test]
    fn test_gpio_failure_aborts_transaction() {
        let bench = SimulatedHardware::new().into_bench();
        bench.with(|sim| sim.release()).unwrap();
        let transport = BitBangTransport::new(bench.context.gpio.clone(), bench.context.delay.clone(), PINS);
        let frame = PointingFrame::new(&DelayVector::ZENITH, &DelayVector::ZENITH);
        assert!(transport.transmit_and_receive(&frame).is_err());
    }
}
