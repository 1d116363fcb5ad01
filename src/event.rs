//! Event fan-out to subscribers.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use crate::code::{HouseCode, UnitCode};
use crate::command::Command;
use crate::module::Module;
use crate::rf::SecurityEvent;

/// Callbacks for driver notifications.
///
/// Handlers run on the reader thread and must not block. A panicking
/// handler is logged and swallowed; it never disturbs the protocol
/// engine. All methods default to no-ops so implementors subscribe only
/// to what they need.
pub trait Listener: Send + Sync {
    /// The link came up or went down.
    fn connection_status(&self, _connected: bool) {}
    /// A module property changed; the only observable property is
    /// `"Level"`.
    fn module_changed(&self, _module: &Module, _property: &str) {}
    /// A power-line address frame selected a module.
    fn plc_address(&self, _house: HouseCode, _unit: UnitCode) {}
    /// A power-line function frame was applied.
    fn plc_function(&self, _command: Command, _house: HouseCode) {}
    /// A raw RF frame arrived (after duplicate suppression).
    fn rf_data(&self, _data: &[u8]) {}
    /// A standard RF module command was decoded.
    fn rf_command(&self, _command: Command, _house: HouseCode, _unit: Option<UnitCode>) {}
    /// An RF security event was decoded.
    fn rf_security(&self, _event: SecurityEvent, _address: u32) {}
}

/// A queued notification, held until the engine drops its locks.
#[derive(Clone, Debug)]
pub(crate) enum Event {
    ConnectionStatus(bool),
    ModuleChanged(Module),
    PlcAddress(HouseCode, UnitCode),
    PlcFunction(Command, HouseCode),
    RfData(Vec<u8>),
    RfCommand(Command, HouseCode, Option<UnitCode>),
    RfSecurity(SecurityEvent, u32),
}

/// Subscriber list with panic-isolated delivery.
#[derive(Default)]
pub(crate) struct Dispatcher {
    listeners: RwLock<Vec<Arc<dyn Listener>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn Listener>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    pub fn emit(&self, event: &Event) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for listener in listeners.iter() {
            let delivery = panic::catch_unwind(AssertUnwindSafe(|| match event {
                Event::ConnectionStatus(connected) => listener.connection_status(*connected),
                Event::ModuleChanged(module) => listener.module_changed(module, "Level"),
                Event::PlcAddress(house, unit) => listener.plc_address(*house, *unit),
                Event::PlcFunction(command, house) => listener.plc_function(*command, *house),
                Event::RfData(data) => listener.rf_data(data),
                Event::RfCommand(command, house, unit) => {
                    listener.rf_command(*command, *house, *unit)
                }
                Event::RfSecurity(event, address) => listener.rf_security(*event, *address),
            }));
            if delivery.is_err() {
                log::warn!("event subscriber panicked; continuing");
            }
        }
    }

    pub fn emit_all(&self, events: &[Event]) {
        for event in events {
            self.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        seen: AtomicUsize,
    }

    impl Listener for Counter {
        fn connection_status(&self, _connected: bool) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicker;

    impl Listener for Panicker {
        fn connection_status(&self, _connected: bool) {
            panic!("subscriber bug");
        }
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        let dispatcher = Dispatcher::new();
        let counter = Arc::new(Counter::default());
        dispatcher.subscribe(Arc::new(Panicker));
        dispatcher.subscribe(counter.clone());
        dispatcher.emit(&Event::ConnectionStatus(true));
        assert_eq!(counter.seen.load(Ordering::SeqCst), 1);
    }
}
