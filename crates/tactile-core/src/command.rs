//! Device commands
//!
//! A command is a caller-owned, self-describing buffer: a type code plus a
//! payload the device reads and writes in place. The runtime never keeps a
//! command past the call that carries it.

use std::fmt;

use crate::{FourCC, TactileError, TactileResult};

/// Size of the command header (type + size)
pub const COMMAND_HEADER_SIZE: usize = 8;

/// Result code of a device command
///
/// Negative values are failures, non-negative values successes. Beyond the
/// sign, the meaning belongs to the device and command.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandResult(pub i64);

impl CommandResult {
    pub const SUCCESS: CommandResult = CommandResult(1);
    pub const FAILURE: CommandResult = CommandResult(-1);
    /// The device does not understand the command type
    pub const UNSUPPORTED: CommandResult = CommandResult(-2);

    #[inline]
    pub fn new(code: i64) -> Self {
        CommandResult(code)
    }

    #[inline]
    pub fn is_success(self) -> bool {
        self.0 >= 0
    }

    #[inline]
    pub fn is_failure(self) -> bool {
        self.0 < 0
    }

    #[inline]
    pub fn code(self) -> i64 {
        self.0
    }
}

impl fmt::Debug for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            write!(f, "Ok({})", self.0)
        } else {
            write!(f, "Failed({})", self.0)
        }
    }
}

/// Command buffer passed by reference to a device
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceCommand {
    command_type: FourCC,
    payload: Vec<u8>,
}

impl DeviceCommand {
    /// Create a command with a zeroed payload of `payload_size` bytes
    pub fn new(command_type: FourCC, payload_size: usize) -> Self {
        DeviceCommand {
            command_type,
            payload: vec![0; payload_size],
        }
    }

    pub fn with_payload(command_type: FourCC, payload: Vec<u8>) -> Self {
        DeviceCommand {
            command_type,
            payload,
        }
    }

    /// Build a buffer from a typed command
    pub fn from_typed<C: CommandInfo>(command: &C) -> Self {
        let mut buffer = DeviceCommand::new(C::TYPE, C::PAYLOAD_SIZE);
        command.encode(&mut buffer.payload);
        buffer
    }

    #[inline]
    pub fn command_type(&self) -> FourCC {
        self.command_type
    }

    /// Total size including the header
    #[inline]
    pub fn size(&self) -> usize {
        COMMAND_HEADER_SIZE + self.payload.len()
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    /// Validate the type code before interpreting the payload
    pub fn expect_type(&self, expected: FourCC) -> TactileResult<()> {
        if self.command_type == expected {
            Ok(())
        } else {
            Err(TactileError::CommandTypeMismatch {
                expected,
                actual: self.command_type,
            })
        }
    }

    /// Interpret the payload as a typed command
    pub fn read_typed<C: CommandInfo>(&self) -> TactileResult<C> {
        self.expect_type(C::TYPE)?;
        if self.payload.len() < C::PAYLOAD_SIZE {
            return Err(TactileError::CommandPayloadTooShort {
                expected: C::PAYLOAD_SIZE,
                actual: self.payload.len(),
            });
        }
        Ok(C::decode(&self.payload[..C::PAYLOAD_SIZE]))
    }

    /// Replace the payload with a typed command of the same type
    pub fn write_typed<C: CommandInfo>(&mut self, command: &C) -> TactileResult<()> {
        self.expect_type(C::TYPE)?;
        if self.payload.len() < C::PAYLOAD_SIZE {
            return Err(TactileError::CommandPayloadTooShort {
                expected: C::PAYLOAD_SIZE,
                actual: self.payload.len(),
            });
        }
        command.encode(&mut self.payload[..C::PAYLOAD_SIZE]);
        Ok(())
    }
}

impl fmt::Debug for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCommand")
            .field("type", &self.command_type)
            .field("size", &self.size())
            .finish()
    }
}

/// A typed command with a fixed payload layout
pub trait CommandInfo: Sized {
    const TYPE: FourCC;
    const PAYLOAD_SIZE: usize;

    /// Write into a payload of exactly `PAYLOAD_SIZE` bytes
    fn encode(&self, payload: &mut [u8]);

    /// Read from a payload of exactly `PAYLOAD_SIZE` bytes
    fn decode(payload: &[u8]) -> Self;
}

/// Dual motor rumble
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SetRumble {
    pub low_frequency: f32,
    pub high_frequency: f32,
}

impl CommandInfo for SetRumble {
    const TYPE: FourCC = FourCC::new(b"RMBL");
    const PAYLOAD_SIZE: usize = 8;

    fn encode(&self, payload: &mut [u8]) {
        payload[0..4].copy_from_slice(&self.low_frequency.to_le_bytes());
        payload[4..8].copy_from_slice(&self.high_frequency.to_le_bytes());
    }

    fn decode(payload: &[u8]) -> Self {
        SetRumble {
            low_frequency: f32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
            high_frequency: f32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]),
        }
    }
}

/// Query whether the device is enabled; the device writes the answer back
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryEnabled {
    pub enabled: bool,
}

impl CommandInfo for QueryEnabled {
    const TYPE: FourCC = FourCC::new(b"QENB");
    const PAYLOAD_SIZE: usize = 1;

    fn encode(&self, payload: &mut [u8]) {
        payload[0] = self.enabled as u8;
    }

    fn decode(payload: &[u8]) -> Self {
        QueryEnabled {
            enabled: payload[0] != 0,
        }
    }
}

/// Query the current sampling frequency of a polled device, in Hz
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct QuerySamplingFrequency {
    pub frequency: f32,
}

impl CommandInfo for QuerySamplingFrequency {
    const TYPE: FourCC = FourCC::new(b"SMPL");
    const PAYLOAD_SIZE: usize = 4;

    fn encode(&self, payload: &mut [u8]) {
        payload[0..4].copy_from_slice(&self.frequency.to_le_bytes());
    }

    fn decode(payload: &[u8]) -> Self {
        QuerySamplingFrequency {
            frequency: f32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
        }
    }
}

/// Ask the device to reset to its default state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestReset;

impl CommandInfo for RequestReset {
    const TYPE: FourCC = FourCC::new(b"RSET");
    const PAYLOAD_SIZE: usize = 0;

    fn encode(&self, _payload: &mut [u8]) {}

    fn decode(_payload: &[u8]) -> Self {
        RequestReset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_roundtrip() {
        let rumble = SetRumble {
            low_frequency: 0.25,
            high_frequency: 0.75,
        };
        let buffer = DeviceCommand::from_typed(&rumble);

        assert_eq!(buffer.command_type(), SetRumble::TYPE);
        assert_eq!(buffer.size(), COMMAND_HEADER_SIZE + 8);
        assert_eq!(buffer.read_typed::<SetRumble>().unwrap(), rumble);
    }

    #[test]
    fn test_type_mismatch_is_rejected() {
        let buffer = DeviceCommand::from_typed(&QueryEnabled { enabled: true });
        match buffer.read_typed::<SetRumble>() {
            Err(TactileError::CommandTypeMismatch { expected, actual }) => {
                assert_eq!(expected, SetRumble::TYPE);
                assert_eq!(actual, QueryEnabled::TYPE);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_short_payload_is_rejected() {
        let buffer = DeviceCommand::new(SetRumble::TYPE, 4);
        assert!(matches!(
            buffer.read_typed::<SetRumble>(),
            Err(TactileError::CommandPayloadTooShort { expected: 8, actual: 4 })
        ));
    }

    #[test]
    fn test_write_back_in_place() {
        let mut buffer = DeviceCommand::from_typed(&QueryEnabled::default());
        buffer
            .write_typed(&QueryEnabled { enabled: true })
            .unwrap();
        assert!(buffer.read_typed::<QueryEnabled>().unwrap().enabled);
    }

    #[test]
    fn test_result_sign() {
        assert!(CommandResult::SUCCESS.is_success());
        assert!(CommandResult::new(0).is_success());
        assert!(CommandResult::FAILURE.is_failure());
        assert!(CommandResult::UNSUPPORTED.is_failure());
    }
}
