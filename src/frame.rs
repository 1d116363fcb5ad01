//! Frame construction and power-line decoding.
//!
//! Outbound frames are two-byte address/function pairs, plus the longer
//! time-set and monitored-codes frames the controllers expect at
//! initialization. Inbound extended polls are decoded here into address
//! and function elements for the protocol engine to apply.

use chrono::{Datelike, NaiveDateTime, Timelike};

use crate::code::{HouseCode, UnitCode};
use crate::command::Command;

/// Leading byte of an outbound address frame.
pub const ADDRESS: u8 = 0x04;
/// Leading byte of an outbound function frame.
pub const FUNCTION: u8 = 0x06;
/// Interface acknowledgement of the last command.
pub const PLC_READY: u8 = 0x55;
/// Interface poll announcing buffered power-line data.
pub const PLC_POLL: u8 = 0x5A;
/// Interface poll after a transmission failed its filter.
pub const PLC_FILTER_FAIL_POLL: u8 = 0xF3;
/// Macro trigger notification.
pub const MACRO: u8 = 0x5B;
/// Radio-frequency frame (USB controller only).
pub const RF: u8 = 0x5D;
/// Interface request for a clock update.
pub const PLC_TIME_REQUEST: u8 = 0xA5;
/// Host reply granting a poll.
pub const PLC_REPLY_TO_POLL: u8 = 0xC3;
/// Host status request, written right after the port opens.
pub const STATUS_REQUEST: u8 = 0x8B;
/// Leading byte of the clock-set frame.
pub const TIME_SET: u8 = 0x9B;
/// Leading byte of the monitored-house-codes frame (USB controller only).
pub const MONITORED_CODES: u8 = 0xBB;

/// Encodes an address frame selecting one module.
pub fn address(house: HouseCode, unit: UnitCode) -> [u8; 2] {
    [ADDRESS, house.nibble() << 4 | unit.nibble()]
}

/// Encodes a house-only address frame, used ahead of mass commands.
pub fn house_address(house: HouseCode) -> [u8; 2] {
    [ADDRESS, house.nibble() << 4]
}

/// Encodes a plain function frame.
pub fn function(house: HouseCode, command: Command) -> [u8; 2] {
    [FUNCTION, house.nibble() << 4 | command.nibble()]
}

/// Encodes a dim or bright function frame for the USB controller, which
/// takes the magnitude as a trailing byte in 0–210.
pub fn dim_function_usb(house: HouseCode, command: Command, percent: u8) -> [u8; 3] {
    [
        FUNCTION,
        house.nibble() << 4 | command.nibble(),
        dim_magnitude(percent),
    ]
}

/// Encodes a dim or bright function frame for the serial controller, which
/// packs the dim code into the header byte.
pub fn dim_function_serial(house: HouseCode, command: Command, percent: u8) -> [u8; 2] {
    [
        FUNCTION | dim_value(percent) | 0x04,
        house.nibble() << 4 | command.nibble(),
    ]
}

/// Converts a percentage to the serial dim code (22 steps, shifted into
/// the header-byte position). Percentages above 100 are clamped.
pub fn dim_value(percent: u8) -> u8 {
    let percent = percent.min(100);
    ((f64::from(percent) / 100.0 * 22.0) as u8) << 3
}

/// The inverse of [`dim_value`]: maps a dim code back to a level in
/// [0.0, 1.0], rounded to two decimals.
pub fn percentage_value(code: u8) -> f64 {
    round_level(f64::from(code >> 3) / 22.0)
}

/// Converts a percentage to the USB dim magnitude in 0–210. Percentages
/// above 100 are clamped.
pub fn dim_magnitude(percent: u8) -> u8 {
    let percent = percent.min(100);
    (f64::from(percent) / 100.0 * 210.0) as u8
}

/// Rounds a module level to two decimals.
pub fn round_level(level: f64) -> f64 {
    (level * 100.0).round() / 100.0
}

/// Reverses the bit order of a byte.
pub fn reverse_byte(byte: u8) -> u8 {
    let mut input = byte;
    let mut output = 0;
    for _ in 0..8 {
        output = output << 1 | (input & 1);
        input >>= 1;
    }
    output
}

/// Encodes the clock-set frame.
///
/// Minutes run 0–119, absorbing the parity of the hour; the hour field is
/// halved. The sixth data byte packs bit 8 of the year day into its top
/// bit over a Sunday-first day-of-week bitmap. The control byte carries
/// the monitored house nibble and the update flags (`0x07` also clears
/// the battery timer). The USB controller expects a trailing `0x02`.
pub fn time_set(house: HouseCode, clear_battery: bool, usb: bool, now: &NaiveDateTime) -> Vec<u8> {
    let minutes = (now.minute() + 60 * (now.hour() % 2)) as u8;
    let day = now.ordinal();
    let weekday = 1u8 << now.weekday().num_days_from_sunday();
    let flags: u8 = if clear_battery { 0x07 } else { 0x03 };
    let mut frame = vec![
        TIME_SET,
        now.second() as u8,
        minutes,
        (now.hour() / 2) as u8,
        (day & 0xFF) as u8,
        ((day >> 8) as u8) << 7 | weekday,
        house.nibble() << 4 | flags,
    ];
    if usb {
        frame.push(0x02);
    }
    frame
}

/// The monitored-codes bitmap position for a house letter.
///
/// The permutation is fixed by the USB controller and unrelated to the
/// power-line nibble encoding.
fn monitored_bit(house: HouseCode) -> u16 {
    use crate::code::HouseCode::*;
    match house {
        A => 14,
        B => 6,
        C => 10,
        D => 2,
        E => 9,
        F => 1,
        G => 13,
        H => 5,
        I => 15,
        J => 7,
        K => 11,
        L => 3,
        M => 8,
        N => 0,
        O => 12,
        P => 4,
    }
}

/// Encodes the monitored-house-codes frame for the USB controller.
pub fn monitored_codes(houses: &[HouseCode]) -> [u8; 10] {
    let mut bits = 0u16;
    for house in houses {
        bits |= 1 << monitored_bit(*house);
    }
    [
        MONITORED_CODES,
        (bits >> 8) as u8,
        bits as u8,
        0x05,
        0x00,
        0x14,
        0x20,
        0x28,
        0x24,
        0x29,
    ]
}

/// One decoded element of an extended power-line poll.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PlcItem {
    /// A module was addressed.
    Address { house: HouseCode, unit: UnitCode },
    /// A function applies to the currently addressed modules. Dim and
    /// bright carry their magnitude (0–210) from the following data byte.
    Function {
        house: HouseCode,
        command: Command,
        magnitude: Option<u8>,
    },
}

/// Decodes an extended power-line poll (`0x5A` leading, length > 3).
///
/// The second byte counts the bitmap and data bytes; bit `i` of the
/// bitmap marks data byte `i` as a function rather than an address. The
/// USB controller delivers both reversed end to end.
pub fn decode_poll(data: &[u8], reversed: bool) -> Vec<PlcItem> {
    if data.len() < 4 {
        return Vec::new();
    }
    let count = (data[1] as usize).saturating_sub(1);
    let bitmap = data[2];
    let n = count.min(data.len() - 3);
    let mut bytes: Vec<u8> = data[3..3 + n].to_vec();
    let mut functions: Vec<bool> = (0..n).map(|i| bitmap >> i & 1 == 1).collect();
    if reversed {
        bytes.reverse();
        functions.reverse();
    }

    let mut items = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let byte = bytes[i];
        let house = match HouseCode::try_from(byte >> 4) {
            Some(house) => house,
            None => {
                i += 1;
                continue;
            }
        };
        if functions[i] {
            if let Some(command) = Command::try_from(byte & 0x0F) {
                let magnitude = match command {
                    Command::Dim | Command::Bright if i + 1 < bytes.len() => {
                        i += 1;
                        Some(bytes[i])
                    }
                    _ => None,
                };
                items.push(PlcItem::Function {
                    house,
                    command,
                    magnitude,
                });
            }
        } else if let Some(unit) = UnitCode::try_from(byte & 0x0F) {
            items.push(PlcItem::Address { house, unit });
        }
        i += 1;
    }
    items
}
