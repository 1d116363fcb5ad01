//! Addressable modules and the registry mirroring their state.

use std::collections::HashMap;
use std::fmt;

use crate::code::{HouseCode, UnitCode};
use crate::frame::round_level;

/// Builds the registry key for an address, e.g. `"C7"`.
pub fn module_code(house: HouseCode, unit: UnitCode) -> String {
    let letter: char = house.into();
    format!("{}{}", letter, unit.number())
}

/// One addressable X10 module and its last known state.
///
/// The level is the only observable attribute; it is always clamped to
/// [0.0, 1.0]. Mutation happens in the protocol engine, either from
/// decoded inbound frames or as the local mirror of an issued command.
#[derive(Clone, Debug)]
pub struct Module {
    house: HouseCode,
    unit: UnitCode,
    level: f64,
    description: String,
}

impl Module {
    pub fn new(house: HouseCode, unit: UnitCode) -> Self {
        Module {
            house,
            unit,
            level: 0.0,
            description: String::new(),
        }
    }

    pub fn house(&self) -> HouseCode {
        self.house
    }

    pub fn unit(&self) -> UnitCode {
        self.unit
    }

    /// The registry key for this module, e.g. `"C7"`.
    pub fn code(&self) -> String {
        module_code(self.house, self.unit)
    }

    /// The last known level in [0.0, 1.0].
    pub fn level(&self) -> f64 {
        self.level
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn set_description<S: Into<String>>(&mut self, description: S) {
        self.description = description.into();
    }

    /// Sets the level, clamped to [0.0, 1.0]. Returns whether the stored
    /// value changed.
    pub(crate) fn set_level(&mut self, level: f64) -> bool {
        let level = round_level(level.max(0.0).min(1.0));
        if (level - self.level).abs() < f64::EPSILON {
            return false;
        }
        self.level = level;
        true
    }

    /// Adds a delta to the level, clamped. Returns whether it changed.
    pub(crate) fn adjust_level(&mut self, delta: f64) -> bool {
        let level = self.level + delta;
        self.set_level(level)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({:.2})", self.code(), self.level)
    }
}

/// The set of known modules, keyed by `"<House><Unit>"` codes.
#[derive(Debug, Default)]
pub struct Registry {
    modules: HashMap<String, Module>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            modules: HashMap::new(),
        }
    }

    /// Clears the map and repopulates it with units 1–16 for each listed
    /// house.
    pub(crate) fn rebuild(&mut self, houses: &[HouseCode]) {
        self.modules.clear();
        for house in houses {
            for number in 1..=16 {
                let unit = UnitCode(number);
                self.modules
                    .insert(module_code(*house, unit), Module::new(*house, unit));
            }
        }
    }

    pub fn get(&self, code: &str) -> Option<&Module> {
        self.modules.get(code)
    }

    pub(crate) fn get_mut(&mut self, code: &str) -> Option<&mut Module> {
        self.modules.get_mut(code)
    }

    /// Looks up a module, creating it at level 0.0 when a decoded address
    /// references one that was never configured.
    pub(crate) fn get_or_insert(&mut self, house: HouseCode, unit: UnitCode) -> &mut Module {
        self.modules
            .entry(module_code(house, unit))
            .or_insert_with(|| Module::new(house, unit))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Mutable iteration over every module of one house, the hook mass
    /// commands go through.
    pub(crate) fn house_modules_mut(
        &mut self,
        house: HouseCode,
    ) -> impl Iterator<Item = &mut Module> {
        self.modules
            .values_mut()
            .filter(move |module| module.house() == house)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebuild_single_house() {
        let mut registry = Registry::new();
        registry.rebuild(&[HouseCode::A]);
        assert_eq!(registry.len(), 16);
        for number in 1..=16 {
            let module = registry.get(&format!("A{}", number)).unwrap();
            assert_eq!(module.level(), 0.0);
        }
        assert!(registry.get("B1").is_none());
    }

    #[test]
    fn rebuild_replaces() {
        let mut registry = Registry::new();
        registry.rebuild(&[HouseCode::A, HouseCode::C]);
        assert_eq!(registry.len(), 32);
        registry.rebuild(&[HouseCode::B]);
        assert_eq!(registry.len(), 16);
        assert!(registry.get("A1").is_none());
    }

    #[test]
    fn level_clamped() {
        let mut module = Module::new(HouseCode::A, UnitCode(1));
        assert!(module.set_level(1.5));
        assert_eq!(module.level(), 1.0);
        assert!(module.set_level(-0.2));
        assert_eq!(module.level(), 0.0);
    }

    #[test]
    fn level_change_detection() {
        let mut module = Module::new(HouseCode::A, UnitCode(1));
        assert!(!module.set_level(0.0));
        assert!(module.set_level(0.5));
        assert!(!module.set_level(0.5));
        assert!(!module.adjust_level(-1.0));
        assert!(module.adjust_level(0.07));
        assert_eq!(module.level(), 0.07);
    }

    #[test]
    fn description_round_trip() {
        let mut module = Module::new(HouseCode::A, UnitCode(4));
        assert_eq!(module.description(), "");
        module.set_description("porch light");
        assert_eq!(module.description(), "porch light");
    }

    #[test]
    fn auto_create() {
        let mut registry = Registry::new();
        let module = registry.get_or_insert(HouseCode::C, UnitCode(7));
        assert_eq!(module.level(), 0.0);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("C7").is_some());
    }

    #[test]
    fn codes() {
        assert_eq!(module_code(HouseCode::C, UnitCode(7)), "C7");
        assert_eq!(module_code(HouseCode::P, UnitCode(16)), "P16");
    }
}
