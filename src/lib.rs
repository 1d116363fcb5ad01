//! Driver library for the X10 home-automation system.
//!
//! Two controllers are supported: the CM11, spoken to over a 4800-baud
//! serial line with a checksum/acknowledge exchange, and the CM15 on USB
//! bulk endpoints, which additionally forwards standard and security RF
//! traffic. [`X10Manager`] is the entry point: it owns the transport,
//! runs the protocol engine, mirrors module levels in a registry, and
//! re-establishes the link after I/O errors.

pub mod code;
pub mod command;
mod engine;
pub mod error;
pub mod event;
pub mod frame;
mod manager;
pub mod module;
pub mod rf;
pub mod serial;
pub mod settings;
pub mod transport;
pub mod usb;

pub use self::code::{HouseCode, UnitCode};
pub use self::command::Command;
pub use self::error::{Error, Result};
pub use self::event::Listener;
pub use self::manager::X10Manager;
pub use self::module::{Module, Registry};
pub use self::rf::SecurityEvent;
pub use self::settings::Settings;
pub use self::transport::{ControllerKind, Transport};
