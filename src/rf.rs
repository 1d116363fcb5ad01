//! Radio-frequency frame decoding.
//!
//! The USB controller forwards over-the-air X10 traffic as `0x5D` frames:
//! six bytes for standard module commands, eight for security devices.
//! Both carry redundancy bytes that must validate before a frame is
//! trusted.

use std::fmt;

use crate::code::{HouseCode, UnitCode};
use crate::command::Command;
use crate::error::{Error, Result};
use crate::frame::reverse_byte;

/// RF prefix byte for standard module commands.
pub const PREFIX_STANDARD: u8 = 0x20;
/// RF prefix byte for security events.
pub const PREFIX_SECURITY: u8 = 0x29;

/// A decoded standard RF command.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StandardCommand {
    pub house: HouseCode,
    pub command: Command,
    /// Present for unit-targeted on/off; mass and dim commands carry none.
    pub unit: Option<UnitCode>,
}

/// Decodes a six-byte standard RF frame.
///
/// Each payload pair is redundant: the second byte must equal the first's
/// complemented mask. Frames failing that check are not trusted.
pub fn decode_standard(data: &[u8]) -> Result<StandardCommand> {
    if data.len() != 6 || data[0] != crate::frame::RF || data[1] != PREFIX_STANDARD {
        return Err(Error::Parse("not a standard rf frame"));
    }
    let (b2, b3, b4, b5) = (data[2], data[3], data[4], data[5]);
    if b3 & !b2 != b3 || b5 & !b4 != b5 {
        return Err(Error::Parse("rf redundancy check failed"));
    }
    let house = HouseCode::try_from(reverse_byte(b2 >> 4) >> 4)
        .ok_or(Error::Parse("invalid rf house nibble"))?;
    let command = match b4 {
        0x98 => Command::Dim,
        0x88 => Command::Bright,
        0x90 => Command::AllLightsOn,
        0x80 => Command::AllUnitsOff,
        _ => {
            let index = (b2 >> 2 & 1)
                | (b4 >> 6 & 1) << 1
                | (b4 >> 3 & 1) << 2
                | (b4 >> 4 & 1) << 3;
            let unit =
                UnitCode::new(index + 1).ok_or(Error::Parse("rf unit number out of range"))?;
            let command = if b4 & 0x20 == 0 {
                Command::On
            } else {
                Command::Off
            };
            return Ok(StandardCommand {
                house,
                command,
                unit: Some(unit),
            });
        }
    };
    Ok(StandardCommand {
        house,
        command,
        unit: None,
    })
}

/// An event reported by an RF security device.
///
/// The byte values are the controller's own identifiers; they are matched
/// verbatim rather than interpreted.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SecurityEvent {
    MotionAlert,
    MotionNormal,
    MotionBatteryLow,
    MotionBatteryOk,
    DoorSensor1Alert,
    DoorSensor1Normal,
    DoorSensor1AlertTamper,
    DoorSensor1NormalTamper,
    DoorSensor1BatteryLow,
    DoorSensor1BatteryOk,
    DoorSensor2Alert,
    DoorSensor2Normal,
    DoorSensor2AlertTamper,
    DoorSensor2NormalTamper,
    DoorSensor2BatteryLow,
    DoorSensor2BatteryOk,
    RemoteArmAway,
    RemoteArmHome,
    RemoteDisarm,
    RemoteLightOn,
    RemoteLightOff,
    RemotePanic,
    RemotePanic15,
}

impl SecurityEvent {
    /// Attempts to match an event byte against the controller's table.
    pub fn try_from<T: Into<u8>>(byte: T) -> Option<Self> {
        use self::SecurityEvent::*;
        match byte.into() {
            0x0C => Some(MotionAlert),
            0x8C => Some(MotionNormal),
            0x0D => Some(MotionBatteryLow),
            0x8D => Some(MotionBatteryOk),
            0x04 => Some(DoorSensor1Alert),
            0x84 => Some(DoorSensor1Normal),
            0x44 => Some(DoorSensor1AlertTamper),
            0xC4 => Some(DoorSensor1NormalTamper),
            0x01 => Some(DoorSensor1BatteryLow),
            0x81 => Some(DoorSensor1BatteryOk),
            0x00 => Some(DoorSensor2Alert),
            0x80 => Some(DoorSensor2Normal),
            0x40 => Some(DoorSensor2AlertTamper),
            0xC0 => Some(DoorSensor2NormalTamper),
            0x05 => Some(DoorSensor2BatteryLow),
            0x85 => Some(DoorSensor2BatteryOk),
            0x06 => Some(RemoteArmAway),
            0x0E => Some(RemoteArmHome),
            0x86 => Some(RemoteDisarm),
            0x46 => Some(RemoteLightOn),
            0xC6 => Some(RemoteLightOff),
            0x26 => Some(RemotePanic),
            0x03 => Some(RemotePanic15),
            _ => None,
        }
    }
}

impl fmt::Display for SecurityEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A decoded RF security frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SecurityNotification {
    pub event: SecurityEvent,
    /// 24-bit device address.
    pub address: u32,
}

/// Decodes an eight-byte RF security frame.
///
/// The payload carries two redundancy pairs (`b3 = b2 ^ 0x0F`,
/// `b5 = !b4`); a trailing byte of `0x80` is normalized to zero before it
/// joins the device address.
pub fn decode_security(data: &[u8]) -> Result<SecurityNotification> {
    if data.len() != 8 || data[0] != crate::frame::RF || data[1] != PREFIX_SECURITY {
        return Err(Error::Parse("not a security rf frame"));
    }
    let (b2, b3, b4, b5, b6, b7) = (data[2], data[3], data[4], data[5], data[6], data[7]);
    if b3 ^ b2 != 0x0F || b5 ^ b4 != 0xFF {
        return Err(Error::Parse("security redundancy check failed"));
    }
    let b7 = if b7 == 0x80 { 0x00 } else { b7 };
    let event = SecurityEvent::try_from(b4).ok_or(Error::Parse("unknown security event code"))?;
    let address = u32::from(b2) << 16 | u32::from(b6) << 8 | u32::from(b7);
    Ok(SecurityNotification { event, address })
}
