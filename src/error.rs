//! Error kinds reported by the driver.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by transports and the protocol engine.
///
/// Transient conditions (read timeouts, reconnectable device loss) are
/// recovered internally; only the lowest layer that cannot continue
/// reports one of these.
#[derive(Debug, Error)]
pub enum Error {
    /// The device is not connected or has disappeared.
    #[error("device not available")]
    DeviceUnavailable,
    /// A serial read or write failed for a reason other than a timeout.
    #[error("serial transport failed")]
    Serial(#[from] serialport::Error),
    /// A USB transfer failed for a reason other than a timeout.
    #[error("usb transport failed")]
    Usb(#[from] rusb::Error),
    /// A raw I/O failure on the underlying port.
    #[error("transport i/o failed")]
    Io(#[from] std::io::Error),
    /// No acknowledgement arrived within the ACK window, including the
    /// resend attempt. The protocol state has been forced back to ready.
    #[error("no acknowledgement within {0:?}")]
    ProtocolTimeout(Duration),
    /// An inbound frame failed its validity constraints.
    #[error("malformed frame: {0}")]
    Parse(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
