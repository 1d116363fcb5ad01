//! USB (CM15) transport.

use std::sync::RwLock;
use std::time::Duration;

use rusb::{DeviceHandle, GlobalContext};

use crate::error::{Error, Result};
use crate::frame;
use crate::transport::Transport;

/// Vendor id of the USB controller.
pub const VENDOR_ID: u16 = 0x0BC7;
/// Product id of the USB controller.
pub const PRODUCT_ID: u16 = 0x0001;

const ENDPOINT_IN: u8 = 0x81;
const ENDPOINT_OUT: u8 = 0x02;
const INTERFACE: u8 = 0;
const CONFIGURATION: u8 = 1;
const TRANSFER_CHUNK: usize = 8;
const MAX_PACKET: usize = 16;
const IO_TIMEOUT: Duration = Duration::from_secs(1);
// Continuation reads only drain bytes already queued by the device.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(50);

/// The USB controller link: bulk IN 0x81, bulk OUT 0x02.
pub struct UsbTransport {
    handle: RwLock<Option<DeviceHandle<GlobalContext>>>,
}

impl UsbTransport {
    pub fn new() -> Self {
        UsbTransport {
            handle: RwLock::new(None),
        }
    }
}

impl Default for UsbTransport {
    fn default() -> Self {
        UsbTransport::new()
    }
}

impl Transport for UsbTransport {
    fn open(&self) -> Result<()> {
        let mut handle = rusb::open_device_with_vid_pid(VENDOR_ID, PRODUCT_ID)
            .ok_or(Error::DeviceUnavailable)?;
        if handle.kernel_driver_active(INTERFACE).unwrap_or(false) {
            handle.detach_kernel_driver(INTERFACE).ok();
        }
        handle.set_active_configuration(CONFIGURATION)?;
        handle.claim_interface(INTERFACE)?;
        *self.handle.write().unwrap() = Some(handle);
        self.write(&[frame::STATUS_REQUEST])?;
        Ok(())
    }

    fn close(&self) {
        if let Some(mut handle) = self.handle.write().unwrap().take() {
            handle.release_interface(INTERFACE).ok();
        }
    }

    fn read(&self) -> Result<Vec<u8>> {
        let guard = self.handle.read().unwrap();
        let handle = guard.as_ref().ok_or(Error::DeviceUnavailable)?;

        let mut buffer = [0u8; MAX_PACKET];
        let mut length = match handle.read_bulk(ENDPOINT_IN, &mut buffer[..TRANSFER_CHUNK], IO_TIMEOUT)
        {
            Ok(n) => n,
            Err(rusb::Error::Timeout) => return Ok(Vec::new()),
            Err(rusb::Error::NoDevice) => return Err(Error::DeviceUnavailable),
            Err(e) => return Err(Error::Usb(e)),
        };
        // A full first chunk may be the head of a longer frame; drain the
        // remainder into the rest of the packet buffer.
        if length == TRANSFER_CHUNK {
            match handle.read_bulk(ENDPOINT_IN, &mut buffer[TRANSFER_CHUNK..], DRAIN_TIMEOUT) {
                Ok(n) => length += n,
                Err(rusb::Error::Timeout) => {}
                Err(rusb::Error::NoDevice) => return Err(Error::DeviceUnavailable),
                Err(e) => return Err(Error::Usb(e)),
            }
        }
        Ok(buffer[..length].to_vec())
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        let guard = self.handle.read().unwrap();
        let handle = guard.as_ref().ok_or(Error::DeviceUnavailable)?;
        match handle.write_bulk(ENDPOINT_OUT, data, IO_TIMEOUT) {
            Ok(_) => Ok(()),
            Err(rusb::Error::NoDevice) => Err(Error::DeviceUnavailable),
            Err(e) => Err(Error::Usb(e)),
        }
    }
}
