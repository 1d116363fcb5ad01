//! Serial (CM11) transport.

use std::io::{self, Read, Write};
use std::sync::Mutex;
use std::time::Duration;

use serialport::SerialPort;

use crate::error::{Error, Result};
use crate::frame;
use crate::transport::Transport;

const BAUD_RATE: u32 = 4800;
const IO_TIMEOUT: Duration = Duration::from_millis(150);
const READ_BUFFER: usize = 32;

/// The serial controller link: 4800 8N1, no flow control.
///
/// Two cloned handles back the link so the reader thread can sit in a
/// blocking read while commands are written.
pub struct SerialTransport {
    path: String,
    reader: Mutex<Option<Box<dyn SerialPort>>>,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
}

impl SerialTransport {
    pub fn new<S: Into<String>>(path: S) -> Self {
        SerialTransport {
            path: path.into(),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Transport for SerialTransport {
    fn open(&self) -> Result<()> {
        #[cfg(not(windows))]
        {
            if !std::path::Path::new(&self.path).exists() {
                return Err(Error::DeviceUnavailable);
            }
        }
        let reader = serialport::new(&self.path, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(IO_TIMEOUT)
            .open()?;
        let writer = reader.try_clone()?;
        *self.reader.lock().unwrap() = Some(reader);
        *self.writer.lock().unwrap() = Some(writer);
        self.write(&[frame::STATUS_REQUEST])?;
        Ok(())
    }

    fn close(&self) {
        self.reader.lock().unwrap().take();
        self.writer.lock().unwrap().take();
    }

    fn read(&self) -> Result<Vec<u8>> {
        let mut guard = self.reader.lock().unwrap();
        let port = guard.as_mut().ok_or(Error::DeviceUnavailable)?;

        let mut buffer = [0u8; READ_BUFFER];
        let mut length = 0;
        loop {
            match port.read(&mut buffer[length..]) {
                Ok(0) => break,
                Ok(n) => {
                    length += n;
                    // A length-prefixed poll response is complete once
                    // more bytes than its count have accumulated.
                    if (buffer[0] as usize) < length {
                        break;
                    }
                    if buffer[0] > 0x10 && port.bytes_to_read().unwrap_or(0) == 0 {
                        break;
                    }
                    if length == buffer.len() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        if length == 0 {
            return Ok(Vec::new());
        }

        let mut data = Vec::with_capacity(length + 1);
        // Poll responses arrive without their announcing byte; restore it
        // so the engine sees the framing it expects.
        if (2..=12).contains(&buffer[0]) {
            data.push(frame::PLC_POLL);
        }
        data.extend_from_slice(&buffer[..length]);
        Ok(data)
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().unwrap();
        let port = guard.as_mut().ok_or(Error::DeviceUnavailable)?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }
}
