//! Driver configuration.

use std::time::Duration;

use crate::code::HouseCode;

/// Name a manager resolves to the USB backend.
pub const USB_PORT: &str = "USB";

/// Configuration for a manager.
#[derive(Clone, Debug)]
pub struct Settings {
    /// The literal `"USB"` selects the USB controller; anything else is
    /// treated as a serial device path.
    pub port_name: String,
    /// Houses the driver mirrors; each listed house populates the
    /// registry with units 1–16.
    pub house_codes: Vec<HouseCode>,
    /// When set, require the checksum echo to match before acknowledging.
    /// Off by default: the controllers are acknowledged regardless, which
    /// is what the hardware tolerates best.
    pub strict_checksum: bool,
    /// Consecutive zero bytes tolerated before the link is declared dead.
    /// `None` disables the heuristic; it matters on platforms where a
    /// dropped serial line reads as a stream of zeroes.
    pub zero_checksum_limit: Option<u32>,
    /// Window within which an identical RF frame is dropped as a repeat.
    pub rf_duplicate_window: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            port_name: USB_PORT.into(),
            house_codes: vec![HouseCode::A],
            strict_checksum: false,
            zero_checksum_limit: Some(10),
            rf_duplicate_window: Duration::from_millis(500),
        }
    }
}

impl Settings {
    /// Parses a comma-separated house-code list, e.g. `"A,C"`.
    ///
    /// Entries must be single uppercase letters; anything else (including
    /// surrounding whitespace) is rejected.
    pub fn parse_house_codes(list: &str) -> Vec<HouseCode> {
        let mut houses = Vec::new();
        for entry in list.split(',') {
            let mut chars = entry.chars();
            let house = match (chars.next(), chars.next()) {
                (Some(letter), None) => HouseCode::from_letter(letter),
                _ => None,
            };
            match house {
                Some(house) if !houses.contains(&house) => houses.push(house),
                Some(_) => {}
                None => log::warn!("ignoring invalid house code entry {:?}", entry),
            }
        }
        houses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list() {
        assert_eq!(
            Settings::parse_house_codes("A,C"),
            vec![HouseCode::A, HouseCode::C]
        );
    }

    #[test]
    fn parse_rejects_noise() {
        assert_eq!(Settings::parse_house_codes("a, C,Q"), Vec::new());
        assert_eq!(Settings::parse_house_codes("A,A"), vec![HouseCode::A]);
    }
}
