//! The public driver surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::code::{HouseCode, UnitCode};
use crate::engine::Engine;
use crate::error::Result;
use crate::event::Listener;
use crate::module::Module;
use crate::serial::SerialTransport;
use crate::settings::{Settings, USB_PORT};
use crate::transport::{ControllerKind, Transport};
use crate::usb::UsbTransport;

const SUPERVISOR_TICK: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);
const JOIN_DEADLINE: Duration = Duration::from_secs(5);

/// Driver facade for one X10 controller.
///
/// Owns the module registry, the protocol engine, and the reader and
/// supervisor threads of the active connection. Commands may be issued
/// from any thread; events arrive on the reader thread.
pub struct X10Manager {
    engine: Arc<Engine>,
    running: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl X10Manager {
    pub fn new(settings: Settings) -> Self {
        X10Manager {
            engine: Engine::new(settings),
            running: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
            supervisor: Mutex::new(None),
        }
    }

    /// Registers an event subscriber.
    pub fn subscribe(&self, listener: Arc<dyn Listener>) {
        self.engine.subscribe(listener);
    }

    /// A snapshot of the current configuration.
    pub fn settings(&self) -> Settings {
        self.engine.settings()
    }

    /// Selects the controller for the next connection attempt: the
    /// literal `"USB"` or a serial device path.
    pub fn set_port_name<S: Into<String>>(&self, name: S) {
        self.engine.set_port_name(name.into());
    }

    /// Replaces the monitored houses from a comma-separated list such as
    /// `"A,C"` and rebuilds the registry with units 1–16 per house.
    pub fn set_house_codes(&self, list: &str) {
        self.engine.set_house_codes(Settings::parse_house_codes(list));
    }

    /// Snapshot of every known module.
    pub fn modules(&self) -> Vec<Module> {
        self.engine.modules()
    }

    /// Snapshot of one module by its `"C7"`-style code.
    pub fn module(&self, code: &str) -> Option<Module> {
        self.engine.module(code)
    }

    /// Attaches a description to a module. Returns false for unknown
    /// codes.
    pub fn set_module_description(&self, code: &str, description: &str) -> bool {
        self.engine.set_module_description(code, description)
    }

    pub fn is_connected(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.engine.is_connected()
    }

    /// Opens the configured controller and starts the reader and
    /// supervisor threads. Idempotent: an existing session is torn down
    /// first. Returns whether the device opened; when it did not, the
    /// supervisor keeps retrying until [`disconnect`](Self::disconnect).
    pub fn connect(&self) -> bool {
        self.disconnect();

        let port_name = self.engine.settings().port_name;
        let (transport, kind): (Arc<dyn Transport>, ControllerKind) = if port_name == USB_PORT {
            (Arc::new(UsbTransport::new()), ControllerKind::Usb)
        } else {
            (
                Arc::new(SerialTransport::new(port_name)),
                ControllerKind::Serial,
            )
        };

        let opened = match transport.open() {
            Ok(()) => true,
            Err(e) => {
                log::warn!("controller open failed: {}", e);
                false
            }
        };
        self.engine.attach(transport, kind);
        self.engine.clear_io_error();
        if !opened {
            self.engine.mark_io_error();
        }

        self.running.store(true, Ordering::SeqCst);
        {
            let engine = Arc::clone(&self.engine);
            let running = Arc::clone(&self.running);
            *self.reader.lock().unwrap() =
                Some(thread::spawn(move || reader_loop(engine, running)));
        }
        {
            let engine = Arc::clone(&self.engine);
            let running = Arc::clone(&self.running);
            *self.supervisor.lock().unwrap() =
                Some(thread::spawn(move || supervisor_loop(engine, running)));
        }

        if opened && kind == ControllerKind::Usb {
            if let Err(e) = self.engine.cm15_init() {
                log::warn!("controller initialization failed: {}", e);
            }
        }
        opened
    }

    /// Stops both worker threads, closes the transport, and reports the
    /// connection as down.
    pub fn disconnect(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().unwrap().take() {
            join_with_deadline(handle, "reader");
        }
        if let Some(handle) = self.supervisor.lock().unwrap().take() {
            join_with_deadline(handle, "supervisor");
        }
        self.engine.detach();
        self.engine.clear_io_error();
        if was_running {
            self.engine.notify_connection(false);
        }
    }

    // Commands -----------------------------------------------------------

    /// Turns one unit on and mirrors its level to 1.0.
    pub fn unit_on(&self, house: HouseCode, unit: UnitCode) -> Result<()> {
        self.engine.unit_on(house, unit)
    }

    /// Turns one unit off and mirrors its level to 0.0.
    pub fn unit_off(&self, house: HouseCode, unit: UnitCode) -> Result<()> {
        self.engine.unit_off(house, unit)
    }

    /// Dims a unit by a percentage of full scale.
    pub fn dim(&self, house: HouseCode, unit: UnitCode, percent: u8) -> Result<()> {
        self.engine.dim(house, unit, percent)
    }

    /// Brightens a unit by a percentage of full scale.
    pub fn bright(&self, house: HouseCode, unit: UnitCode, percent: u8) -> Result<()> {
        self.engine.bright(house, unit, percent)
    }

    /// Turns every module of a house on.
    pub fn all_lights_on(&self, house: HouseCode) -> Result<()> {
        self.engine.all_lights_on(house)
    }

    /// Turns every module of a house off.
    pub fn all_units_off(&self, house: HouseCode) -> Result<()> {
        self.engine.all_units_off(house)
    }

    /// Asks a module to report its status.
    pub fn status_request(&self, house: HouseCode, unit: UnitCode) -> Result<()> {
        self.engine.status_request(house, unit)
    }

    /// Pushes the host clock to the controller, optionally clearing its
    /// battery timer.
    pub fn sync_clock(&self, clear_battery: bool) -> Result<()> {
        self.engine.send_time(clear_battery)
    }
}

impl Drop for X10Manager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Blocks on the transport and feeds chunks through the engine. Read
/// timeouts keep the cancellation check frequent.
fn reader_loop(engine: Arc<Engine>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        if engine.has_io_error() {
            thread::sleep(Duration::from_millis(100));
            continue;
        }
        match engine.read_chunk() {
            Ok(data) => {
                if !data.is_empty() {
                    engine.process(&data);
                }
            }
            Err(e) => {
                log::warn!("read failed: {}", e);
                engine.mark_io_error();
            }
        }
    }
}

/// Watches the error flag and rebuilds the link: close, back off, reopen,
/// and rerun controller initialization.
fn supervisor_loop(engine: Arc<Engine>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        sleep_while_running(&running, SUPERVISOR_TICK);
        if !running.load(Ordering::SeqCst) {
            break;
        }
        if !engine.has_io_error() {
            continue;
        }

        engine.link_down();
        if let Some(transport) = engine.transport() {
            transport.close();
        }
        sleep_while_running(&running, RECONNECT_BACKOFF);
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let transport = match engine.transport() {
            Some(transport) => transport,
            None => continue,
        };
        match transport.open() {
            Ok(()) => {
                log::info!("controller reopened");
                engine.clear_io_error();
                if engine.kind() == Some(ControllerKind::Usb) {
                    if let Err(e) = engine.cm15_init() {
                        log::warn!("controller initialization failed: {}", e);
                    }
                }
            }
            Err(e) => {
                log::debug!("reopen failed, will retry: {}", e);
            }
        }
    }
}

fn sleep_while_running(running: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
}

fn join_with_deadline(handle: JoinHandle<()>, name: &str) {
    let deadline = Instant::now() + JOIN_DEADLINE;
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    if handle.is_finished() {
        let _ = handle.join();
    } else {
        // Abandon rather than block forever; the thread exits on its next
        // cancellation check.
        log::warn!("{} thread did not stop within {:?}", name, JOIN_DEADLINE);
    }
}
