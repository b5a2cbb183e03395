//! ST3215 instruction set, control table and register-level request builders.

use std::fmt;

use crate::frame::{encode, CodecError};

/// Largest encoder position (12-bit, one revolution).
pub const POSITION_MAX: u16 = 4095;
/// Largest goal speed in steps/s.
pub const SPEED_MAX: u16 = 3400;
/// Largest acceleration value (units of 100 steps/s²).
pub const ACCEL_MAX: u8 = 254;
/// Position correction range, sign-magnitude on bit 11.
pub const OFFSET_LIMIT: i32 = 2047;

/// Contiguous block read by a status poll: registers 56..=70.
pub const STATUS_BLOCK_LEN: u8 = 15;

/// Current unit of the present-current register, in mA.
const CURRENT_MA_PER_UNIT: f32 = 6.5;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
}

impl TryFrom<u8> for Instruction {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0x01 => Self::Ping,
            0x02 => Self::Read,
            0x03 => Self::Write,
            other => return Err(other),
        })
    }
}

/// ST3215 control table addresses.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    // EEPROM (writes require Lock = 0)
    ModelNumber = 3,
    Id = 5,
    BaudRate = 6,
    MinAngleLimit = 9,
    MaxAngleLimit = 11,
    PositionOffset = 31,
    OperatingMode = 33,

    // RAM
    TorqueEnable = 40,
    Acceleration = 41,
    GoalPosition = 42,
    GoalTime = 44,
    GoalSpeed = 46,
    Lock = 55,
    PresentPosition = 56,
    PresentSpeed = 58,
    PresentLoad = 60,
    PresentVoltage = 62,
    PresentTemperature = 63,
    Moving = 66,
    PresentCurrent = 69,
}

/// Error-status bits carried in the code byte of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServoFault(pub u8);

impl ServoFault {
    pub const VOLTAGE: u8 = 0x01;
    pub const SENSOR: u8 = 0x02;
    pub const OVERHEAT: u8 = 0x04;
    pub const OVERCURRENT: u8 = 0x08;
    pub const OVERLOAD: u8 = 0x20;

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

impl fmt::Display for ServoFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u8, &str); 5] = [
            (ServoFault::VOLTAGE, "voltage"),
            (ServoFault::SENSOR, "sensor"),
            (ServoFault::OVERHEAT, "overheat"),
            (ServoFault::OVERCURRENT, "overcurrent"),
            (ServoFault::OVERLOAD, "overload"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "status 0x{:02X}", self.0)
        } else {
            write!(f, "{} (0x{:02X})", names.join("+"), self.0)
        }
    }
}

/// Feetech signed values keep the sign in a dedicated bit instead of
/// two's complement.
pub fn encode_sign_magnitude(value: i32, sign_bit: u8) -> u16 {
    let magnitude = (value.unsigned_abs() as u16) & ((1u16 << sign_bit) - 1);
    if value < 0 {
        magnitude | (1 << sign_bit)
    } else {
        magnitude
    }
}

pub fn decode_sign_magnitude(raw: u16, sign_bit: u8) -> i32 {
    let magnitude = (raw & ((1u16 << sign_bit) - 1)) as i32;
    if raw & (1 << sign_bit) != 0 {
        -magnitude
    } else {
        magnitude
    }
}

pub mod request {
    use super::*;

    pub fn ping(id: u8) -> Result<Vec<u8>, CodecError> {
        encode(id, Instruction::Ping, &[])
    }

    pub fn read(id: u8, register: Register, len: u8) -> Result<Vec<u8>, CodecError> {
        encode(id, Instruction::Read, &[register as u8, len])
    }

    pub fn write(id: u8, register: Register, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut params = Vec::with_capacity(data.len() + 1);
        params.push(register as u8);
        params.extend_from_slice(data);
        encode(id, Instruction::Write, &params)
    }

    pub fn torque(id: u8, enable: bool) -> Result<Vec<u8>, CodecError> {
        write(id, Register::TorqueEnable, &[enable as u8])
    }

    /// Acceleration, goal position, goal time (unused) and goal speed in one
    /// write starting at register 41.
    pub fn move_to(id: u8, position: u16, speed: u16, accel: u8) -> Result<Vec<u8>, CodecError> {
        let [pos_lo, pos_hi] = position.to_le_bytes();
        let [spd_lo, spd_hi] = speed.to_le_bytes();
        write(id, Register::Acceleration, &[accel, pos_lo, pos_hi, 0, 0, spd_lo, spd_hi])
    }

    pub fn status_block(id: u8) -> Result<Vec<u8>, CodecError> {
        read(id, Register::PresentPosition, STATUS_BLOCK_LEN)
    }
}

/// One decoded status poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Telemetry {
    pub position: i32,
    pub speed: i32,
    pub voltage: f32,
    pub temperature: f32,
    pub moving: bool,
    pub current: f32,
}

impl Telemetry {
    /// Parses the reply to [`request::status_block`].
    pub fn parse(block: &[u8]) -> Result<Self, CodecError> {
        if block.len() < STATUS_BLOCK_LEN as usize {
            return Err(CodecError::Framing("status block too short"));
        }
        let word = |at: usize| u16::from_le_bytes([block[at], block[at + 1]]);
        let base = Register::PresentPosition as usize;
        let at = |reg: Register| reg as usize - base;

        Ok(Self {
            position: decode_sign_magnitude(word(at(Register::PresentPosition)), 15),
            speed: decode_sign_magnitude(word(at(Register::PresentSpeed)), 15),
            voltage: block[at(Register::PresentVoltage)] as f32 / 10.0,
            temperature: block[at(Register::PresentTemperature)] as f32,
            moving: block[at(Register::Moving)] != 0,
            current: decode_sign_magnitude(word(at(Register::PresentCurrent)), 15) as f32
                * CURRENT_MA_PER_UNIT,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode;

    #[test]
    fn sign_magnitude_matches_feetech_encoding() {
        assert_eq!(encode_sign_magnitude(100, 15), 100);
        assert_eq!(encode_sign_magnitude(-100, 15), 0x8064);
        assert_eq!(encode_sign_magnitude(-5, 11), 0x0805);
        assert_eq!(decode_sign_magnitude(0x8064, 15), -100);
        assert_eq!(decode_sign_magnitude(0x0805, 11), -5);
        assert_eq!(decode_sign_magnitude(2047, 11), 2047);
    }

    #[test]
    fn move_request_layout() {
        let frame = request::move_to(1, 3000, 1500, 50).unwrap();
        let packet = decode(&frame).unwrap();
        assert_eq!(packet.code, Instruction::Write as u8);
        assert_eq!(packet.params, vec![41, 50, 0xB8, 0x0B, 0, 0, 0xDC, 0x05]);
    }

    #[test]
    fn telemetry_parses_status_block() {
        let mut block = [0u8; STATUS_BLOCK_LEN as usize];
        block[0..2].copy_from_slice(&2048u16.to_le_bytes());
        block[6] = 121; // 12.1 V
        block[7] = 42;
        block[10] = 1;
        block[13..15].copy_from_slice(&10u16.to_le_bytes());

        let t = Telemetry::parse(&block).unwrap();
        assert_eq!(t.position, 2048);
        assert!((t.voltage - 12.1).abs() < 1e-4);
        assert_eq!(t.temperature, 42.0);
        assert!(t.moving);
        assert!((t.current - 65.0).abs() < 1e-4);

        assert!(Telemetry::parse(&block[..10]).is_err());
    }

    #[test]
    fn fault_display_names_bits() {
        let fault = ServoFault(ServoFault::OVERHEAT | ServoFault::OVERLOAD);
        assert_eq!(fault.to_string(), "overheat+overload (0x24)");
        assert!(ServoFault(0).is_empty());
        assert_eq!(Instruction::try_from(0x02), Ok(Instruction::Read));
        assert_eq!(Instruction::try_from(0x99), Err(0x99));
    }
}
