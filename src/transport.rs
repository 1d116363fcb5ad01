//! Byte-level transport abstraction.

use crate::error::Result;

/// Which controller backend a session speaks to.
///
/// The serial controller acknowledges through a checksum exchange and
/// packs dim codes into the function header; the USB controller
/// acknowledges directly and takes dim magnitudes as a trailing byte.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControllerKind {
    Serial,
    Usb,
}

/// Capability set for a controller link.
///
/// `read` and `write` take `&self` so the reader thread can block in
/// `read` while command issuers write concurrently; implementations keep
/// their handles behind interior mutability. `read` returns an empty
/// buffer on a transient timeout and an error only when the link is
/// genuinely broken.
pub trait Transport: Send + Sync {
    /// Opens the device and performs the initial status request.
    fn open(&self) -> Result<()>;
    /// Releases the device. Safe to call when already closed.
    fn close(&self);
    /// Reads one inbound chunk, blocking up to the backend's timeout.
    fn read(&self) -> Result<Vec<u8>>;
    /// Writes one outbound frame in full.
    fn write(&self, data: &[u8]) -> Result<()>;
}
