/*!
Pointing bitstream encoding and telemetry decoding.

A pointing transaction clocks a fixed 253-bit frame out to the beamformer:

| Bits    | Content                                              |
|---------|------------------------------------------------------|
| 0-31    | header: 8 zeros, 4 ones, 20 zeros                    |
| 32-235  | 12 x (16-bit packed delay word + `1` marker bit)     |
| 236-251 | checksum: XOR of the 12 packed words                 |
| 252     | `1` end marker                                       |

The 32 delays (16 X then 16 Y) are concatenated as 6-bit fields, MSB first,
and the resulting 192-bit stream is cut into 16-bit words with no regard for
field boundaries.

The beamformer answers with 25 bits, MSB first: 17 bits whose low 13 bits are
a sign-magnitude temperature in 1/16 degC, then an 8-bit flag byte.
*/

use crate::delays::DelayVector;
use crate::error::{BfError, Result};
use crate::protocol::{
    DATA_WORDS, DELAY_FIELD_BITS, FRAME_BITS, HEADER_BITS, TELEMETRY_BITS,
    TELEMETRY_OK_FLAGS, TELEMETRY_TEMPERATURE_BITS, WORD_BITS,
};
use serde::{Deserialize, Serialize};

/// Header pattern widths: zeros, ones, zeros
const HEADER_PATTERN: [(bool, usize); 3] = [(false, 8), (true, 4), (false, 20)];

/// Temperature resolution of the beamformer sensor, degC per LSB
const TEMPERATURE_LSB_C: f64 = 0.0625;

/// Sign bit inside the raw temperature value
const TEMPERATURE_SIGN_BIT: u32 = 0x1000;

/// Magnitude bits inside the raw temperature value
const TEMPERATURE_MAGNITUDE_MASK: u32 = 0xFFF;

/// A complete, immutable pointing command frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointingFrame {
    bits: [bool; FRAME_BITS],
    words: [u16; DATA_WORDS],
    checksum: u16,
}

impl PointingFrame {
    /// Build the frame for a validated pair of delay vectors
    pub fn new(xdelays: &DelayVector, ydelays: &DelayVector) -> Self {
        let words = pack_delay_words(xdelays, ydelays);
        let checksum = words.iter().fold(0u16, |acc, w| acc ^ w);

        let mut bits = [false; FRAME_BITS];
        let mut pos = 0;

        for (level, count) in HEADER_PATTERN {
            for _ in 0..count {
                bits[pos] = level;
                pos += 1;
            }
        }

        for word in words {
            push_word(&mut bits, &mut pos, word);
            bits[pos] = true; // word marker
            pos += 1;
        }

        push_word(&mut bits, &mut pos, checksum);
        bits[pos] = true; // end marker
        pos += 1;

        debug_assert_eq!(pos, FRAME_BITS);

        Self { bits, words, checksum }
    }

    /// The frame bits in transmission order
    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    /// The 12 packed delay words
    pub fn words(&self) -> &[u16; DATA_WORDS] {
        &self.words
    }

    /// XOR of the packed delay words
    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    /// Number of bits in the frame (always 253)
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Frames are never empty; provided for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Render the frame as a string of '0' and '1' characters
    pub fn to_bit_string(&self) -> String {
        self.bits.iter().map(|&b| if b { '1' } else { '0' }).collect()
    }

    /// Pack the frame MSB-first into bytes (last byte zero-padded) and hex-encode it
    pub fn to_hex(&self) -> String {
        let mut bytes = vec![0u8; FRAME_BITS.div_ceil(8)];
        for (i, &bit) in self.bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 0x80 >> (i % 8);
            }
        }
        hex::encode(bytes)
    }
}

/// Validate two delay lists and build the pointing frame
pub fn encode(xdelays: &[i64], ydelays: &[i64]) -> Result<PointingFrame> {
    let x = DelayVector::from_slice(xdelays)
        .map_err(|e| BfError::invalid_delay(format!("X delays: {}", e)))?;
    let y = DelayVector::from_slice(ydelays)
        .map_err(|e| BfError::invalid_delay(format!("Y delays: {}", e)))?;
    Ok(PointingFrame::new(&x, &y))
}

/// Concatenate X then Y delays as 6-bit fields and cut the stream into 16-bit words
pub fn pack_delay_words(xdelays: &DelayVector, ydelays: &DelayVector) -> [u16; DATA_WORDS] {
    let mut words = [0u16; DATA_WORDS];
    let mut bit_index = 0;

    for value in xdelays.iter().chain(ydelays.iter()) {
        for shift in (0..DELAY_FIELD_BITS).rev() {
            let bit = u16::from((value >> shift) & 1);
            let word = bit_index / WORD_BITS;
            words[word] = (words[word] << 1) | bit;
            bit_index += 1;
        }
    }

    words
}

fn push_word(bits: &mut [bool], pos: &mut usize, word: u16) {
    for shift in (0..WORD_BITS).rev() {
        bits[*pos] = (word >> shift) & 1 == 1;
        *pos += 1;
    }
}

/// Decoded readback from a pointing transaction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Beamformer temperature in degC
    pub temperature: f64,
    /// Flag byte; `0x80` means no communication error. Wider than a byte so
    /// the standby sentinel (999) can be represented.
    pub flags: u16,
}

impl Telemetry {
    /// Returned by a controller in standby instead of touching hardware
    pub const STANDBY: Telemetry = Telemetry {
        temperature: -999.0,
        flags: 999,
    };

    /// Value held by a controller that has not completed a transaction yet
    pub const UNKNOWN: Telemetry = Telemetry {
        temperature: 0.0,
        flags: 999,
    };

    /// True if the beamformer reported a clean transaction
    pub fn is_ok(&self) -> bool {
        self.flags == TELEMETRY_OK_FLAGS as u16
    }
}

/// The 25-bit readback frame, as sampled from the data-in line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryFrame {
    bits: [bool; TELEMETRY_BITS],
}

impl TelemetryFrame {
    /// Build from sampled bits; the length must be exactly 25
    pub fn from_bits(bits: &[bool]) -> Result<Self> {
        let bits: [bool; TELEMETRY_BITS] =
            bits.try_into().map_err(|_| BfError::InvalidFrameLength {
                expected: TELEMETRY_BITS,
                actual: bits.len(),
            })?;
        Ok(Self { bits })
    }

    /// Build the bit sequence a beamformer would send for the given values.
    /// Only the low 17 bits of `raw_temperature` are used.
    pub fn from_parts(raw_temperature: u32, flags: u8) -> Self {
        let mut bits = [false; TELEMETRY_BITS];
        for (i, bit) in bits.iter_mut().take(TELEMETRY_TEMPERATURE_BITS).enumerate() {
            let shift = TELEMETRY_TEMPERATURE_BITS - 1 - i;
            *bit = (raw_temperature >> shift) & 1 == 1;
        }
        for i in 0..8 {
            bits[TELEMETRY_TEMPERATURE_BITS + i] = (flags >> (7 - i)) & 1 == 1;
        }
        Self { bits }
    }

    /// The sampled bits in arrival order
    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    /// First 17 bits as an unsigned integer, MSB first
    pub fn raw_temperature(&self) -> u32 {
        self.bits[..TELEMETRY_TEMPERATURE_BITS]
            .iter()
            .fold(0u32, |acc, &b| (acc << 1) | u32::from(b))
    }

    /// Last 8 bits as the flag byte
    pub fn flags(&self) -> u8 {
        self.bits[TELEMETRY_TEMPERATURE_BITS..]
            .iter()
            .fold(0u8, |acc, &b| (acc << 1) | u8::from(b))
    }

    /// Temperature in degC from the sign-magnitude raw value
    pub fn temperature(&self) -> f64 {
        let raw = self.raw_temperature();
        let mut temperature = TEMPERATURE_LSB_C * f64::from(raw & TEMPERATURE_MAGNITUDE_MASK);
        if raw & TEMPERATURE_SIGN_BIT != 0 {
            temperature -= 256.0;
        }
        temperature
    }

    /// Decode into a [`Telemetry`] value
    pub fn decode(&self) -> Telemetry {
        Telemetry {
            temperature: self.temperature(),
            flags: u16::from(self.flags()),
        }
    }
}

/// Decode a 25-bit readback into (temperature degC, flags)
pub fn decode_telemetry(bits: &[bool]) -> Result<(f64, u8)> {
    let frame = TelemetryFrame::from_bits(bits)?;
    Ok((frame.temperature(), frame.flags()))
}

/// Check a received bit sequence against the frame layout.
/// Returns the packed words if header, markers and checksum are all correct.
pub fn verify_frame_bits(bits: &[bool]) -> Option<[u16; DATA_WORDS]> {
    if bits.len() != FRAME_BITS {
        return None;
    }

    let mut pos = 0;
    for (level, count) in HEADER_PATTERN {
        if bits[pos..pos + count].iter().any(|&b| b != level) {
            return None;
        }
        pos += count;
    }
    debug_assert_eq!(pos, HEADER_BITS);

    let read_word = |start: usize| -> u16 {
        bits[start..start + WORD_BITS]
            .iter()
            .fold(0u16, |acc, &b| (acc << 1) | u16::from(b))
    };

    let mut words = [0u16; DATA_WORDS];
    for word in words.iter_mut() {
        *word = read_word(pos);
        pos += WORD_BITS;
        if !bits[pos] {
            return None;
        }
        pos += 1;
    }

    let checksum = read_word(pos);
    pos += WORD_BITS;
    if !bits[pos] || checksum != words.iter().fold(0u16, |acc, w| acc ^ w) {
        return None;
    }

    Some(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> Vec<i64> {
        (0..16).collect()
    }

    #[test]
    fn test_frame_length_and_checksum() {
        let x: Vec<i64> = (0..16).map(|i| (i * 7) % 64).collect();
        let y: Vec<i64> = (0..16).map(|i| 63 - i * 3).collect();
        let frame = encode(&x, &y).unwrap();

        assert_eq!(frame.bits().len(), FRAME_BITS);
        let xor = frame.words().iter().fold(0, |acc, w| acc ^ w);
        assert_eq!(frame.checksum(), xor);

        // Checksum field sits between the last word marker and the end marker
        let field: String = frame.to_bit_string()[236..252].to_string();
        assert_eq!(field, format!("{:016b}", xor));
        assert_eq!(verify_frame_bits(frame.bits()), Some(*frame.words()));
    }

    #[test]
    fn test_zero_delays_frame_layout() {
        let frame = encode(&[0; 16], &[0; 16]).unwrap();
        let s = frame.to_bit_string();

        assert_eq!(&s[..32], "00000000111100000000000000000000");
        for w in 0..12 {
            let start = 32 + w * 17;
            assert_eq!(&s[start..start + 17], "00000000000000001");
        }
        assert_eq!(&s[236..252], "0000000000000000");
        assert_eq!(&s[252..], "1");
    }

    #[test]
    fn test_word_packing_crosses_field_boundaries() {
        // Delay 63 in the first X slot fills the top six bits of word 0
        let mut x = [0i64; 16];
        x[0] = 63;
        x[2] = 1; // bits 12..18 of the stream: last bit of field 2 is stream bit 17
        let frame = encode(&x, &[0; 16]).unwrap();
        assert_eq!(frame.words()[0], 0b1111_1100_0000_0000);
        assert_eq!(frame.words()[1], 0b0100_0000_0000_0000);
    }

    #[test]
    fn test_ramp_packing() {
        let frame = encode(&ramp(), &ramp()).unwrap();
        // 000000 000001 000010 000011 ... first word = 0000000000010000
        assert_eq!(frame.words()[0], 0b0000_0000_0001_0000);
        // X and Y halves are identical streams
        assert_eq!(frame.words()[..6], frame.words()[6..]);
    }

    #[test]
    fn test_encode_validation() {
        assert!(encode(&[0; 15], &[0; 16]).unwrap_err().is_validation());
        assert!(encode(&[0; 16], &[0; 17]).unwrap_err().is_validation());

        let mut bad = [0i64; 16];
        bad[4] = 64;
        assert!(matches!(encode(&bad, &[0; 16]), Err(BfError::InvalidDelay(_))));
        bad[4] = -3;
        assert!(matches!(encode(&[0; 16], &bad), Err(BfError::InvalidDelay(_))));
    }

    #[test]
    fn test_telemetry_positive_temperature() {
        let raw = 0x190; // 400 * 0.0625 = 25.0
        let frame = TelemetryFrame::from_parts(raw, 0x80);
        let (temp, flags) = decode_telemetry(frame.bits()).unwrap();
        assert_eq!(temp, 25.0);
        assert_eq!(flags, 0x80);
        assert!(frame.decode().is_ok());
    }

    #[test]
    fn test_telemetry_negative_temperature() {
        let raw = 0x1000 | 0xF00;
        let frame = TelemetryFrame::from_parts(raw, 0x42);
        let (temp, flags) = decode_telemetry(frame.bits()).unwrap();
        assert_eq!(temp, 0.0625 * 0xF00 as f64 - 256.0);
        assert_eq!(flags, 0x42);
        assert!(!frame.decode().is_ok());
    }

    #[test]
    fn test_telemetry_ignores_upper_raw_bits() {
        // Bits above the sign bit are carried in the 17-bit field but not used
        let frame = TelemetryFrame::from_parts(0x1_0000 | 0x010, 0x80);
        assert_eq!(frame.raw_temperature(), 0x1_0010);
        assert_eq!(frame.temperature(), 1.0);
    }

    #[test]
    fn test_telemetry_wrong_length() {
        let err = decode_telemetry(&[false; 24]).unwrap_err();
        assert!(matches!(err, BfError::InvalidFrameLength { expected: 25, actual: 24 }));
    }

    #[test]
    fn test_verify_rejects_corrupt_frames() {
        let frame = encode(&ramp(), &[5; 16]).unwrap();
        let mut bits = frame.bits().to_vec();
        bits[40] = !bits[40];
        assert_eq!(verify_frame_bits(&bits), None);

        let mut bits = frame.bits().to_vec();
        bits[48] = false; // first word marker
        assert_eq!(verify_frame_bits(&bits), None);

        assert_eq!(verify_frame_bits(&frame.bits()[..252]), None);
    }

    #[test]
    fn test_hex_dump() {
        let frame = encode(&[0; 16], &[0; 16]).unwrap();
        let hex = frame.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.starts_with("00f00000"));
    }
}
