//! The X10 function table.

use std::fmt;

/// An X10 function, carried in the low nibble of a function frame.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Command {
    AllUnitsOff,
    AllLightsOn,
    On,
    Off,
    Dim,
    Bright,
    AllLightsOff,
    Extended,
    HailRequest,
    HailAcknowledge,
    PresetDim1,
    PresetDim2,
    ExtendedDataTransfer,
    StatusOn,
    StatusOff,
    StatusRequest,
}

impl Command {
    /// Attempts to convert a function nibble to a command.
    pub fn try_from<T: Into<u8>>(byte: T) -> Option<Self> {
        use self::Command::*;
        match byte.into() {
            0x0 => Some(AllUnitsOff),
            0x1 => Some(AllLightsOn),
            0x2 => Some(On),
            0x3 => Some(Off),
            0x4 => Some(Dim),
            0x5 => Some(Bright),
            0x6 => Some(AllLightsOff),
            0x7 => Some(Extended),
            0x8 => Some(HailRequest),
            0x9 => Some(HailAcknowledge),
            0xA => Some(PresetDim1),
            0xB => Some(PresetDim2),
            0xC => Some(ExtendedDataTransfer),
            0xD => Some(StatusOn),
            0xE => Some(StatusOff),
            0xF => Some(StatusRequest),
            _ => None,
        }
    }

    /// The function nibble for this command.
    pub fn nibble(self) -> u8 {
        use self::Command::*;
        match self {
            AllUnitsOff => 0x0,
            AllLightsOn => 0x1,
            On => 0x2,
            Off => 0x3,
            Dim => 0x4,
            Bright => 0x5,
            AllLightsOff => 0x6,
            Extended => 0x7,
            HailRequest => 0x8,
            HailAcknowledge => 0x9,
            PresetDim1 => 0xA,
            PresetDim2 => 0xB,
            ExtendedDataTransfer => 0xC,
            StatusOn => 0xD,
            StatusOff => 0xE,
            StatusRequest => 0xF,
        }
    }
}

impl Into<u8> for Command {
    fn into(self) -> u8 {
        self.nibble()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Command::*;
        write!(
            f,
            "{}",
            match self {
                AllUnitsOff => "All Units Off",
                AllLightsOn => "All Lights On",
                On => "On",
                Off => "Off",
                Dim => "Dim",
                Bright => "Bright",
                AllLightsOff => "All Lights Off",
                Extended => "Extended Code",
                HailRequest => "Hail Request",
                HailAcknowledge => "Hail Acknowledge",
                PresetDim1 => "Preset Dim 1",
                PresetDim2 => "Preset Dim 2",
                ExtendedDataTransfer => "Extended Data Transfer",
                StatusOn => "Status = On",
                StatusOff => "Status = Off",
                StatusRequest => "Status Request",
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nibbles_round_trip() {
        for nibble in 0x0..=0xFu8 {
            let command = Command::try_from(nibble).unwrap();
            assert_eq!(command.nibble(), nibble);
        }
    }

    #[test]
    fn known_nibbles() {
        assert_eq!(Command::On.nibble(), 0x2);
        assert_eq!(Command::Off.nibble(), 0x3);
        assert_eq!(Command::Dim.nibble(), 0x4);
        assert_eq!(Command::Bright.nibble(), 0x5);
        assert_eq!(Command::AllLightsOn.nibble(), 0x1);
        assert_eq!(Command::AllUnitsOff.nibble(), 0x0);
        assert_eq!(Command::StatusRequest.nibble(), 0xF);
    }
}
