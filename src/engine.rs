//! The protocol engine: transmit path with acknowledgement tracking,
//! inbound dispatch, and effect application to the module registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;

use crate::code::{HouseCode, UnitCode};
use crate::command::Command;
use crate::error::{Error, Result};
use crate::event::{Dispatcher, Event, Listener};
use crate::frame::{self, PlcItem};
use crate::module::{module_code, Module, Registry};
use crate::rf;
use crate::settings::Settings;
use crate::transport::{ControllerKind, Transport};

/// How long to wait for the controller to acknowledge a frame.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);
/// Required quiet time after inbound traffic before transmitting.
const SEND_GAP: Duration = Duration::from_millis(500);
/// Additional transmissions of an unacknowledged frame.
const RESEND_MAX: u32 = 1;
/// Magnitude of one RF dim or bright step, on the 0–210 scale.
const RF_DIM_STEP: u8 = 0x0F;

/// Where the engine stands in the send/acknowledge exchange.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ProtocolState {
    Ready,
    WaitingChecksum,
    WaitingAck,
    WaitingPollReply,
}

/// Mutable state of one connection attempt.
struct Session {
    state: ProtocolState,
    last_sent: Vec<u8>,
    expected_checksum: u8,
    wait_start: Instant,
    last_receive: Option<Instant>,
    last_rf: Vec<u8>,
    last_rf_at: Option<Instant>,
    /// Modules the next function frames apply to.
    addressed: Vec<String>,
    /// Set after a function byte; the next address starts a fresh set.
    new_address_data: bool,
    zero_count: u32,
    ready_seen: bool,
}

impl Session {
    fn new() -> Self {
        Session {
            state: ProtocolState::Ready,
            last_sent: Vec::new(),
            expected_checksum: 0,
            wait_start: Instant::now(),
            last_receive: None,
            last_rf: Vec::new(),
            last_rf_at: None,
            addressed: Vec::new(),
            new_address_data: false,
            zero_count: 0,
            ready_seen: false,
        }
    }
}

struct Active {
    transport: Arc<dyn Transport>,
    kind: ControllerKind,
}

/// The bidirectional protocol engine shared by the manager, the reader
/// thread, and the supervisor.
pub(crate) struct Engine {
    /// Back-reference handed to worker threads spawned from the receive
    /// path.
    me: Weak<Engine>,
    settings: Mutex<Settings>,
    active: RwLock<Option<Active>>,
    session: Mutex<Session>,
    ack: Condvar,
    /// Serializes callers so an address frame and its function frame are
    /// delivered as one unit.
    command_lock: Mutex<()>,
    registry: Mutex<Registry>,
    dispatcher: Dispatcher,
    io_error: AtomicBool,
    down_reported: AtomicBool,
}

impl Engine {
    pub fn new(settings: Settings) -> Arc<Self> {
        let mut registry = Registry::new();
        registry.rebuild(&settings.house_codes);
        Arc::new_cyclic(|me| Engine {
            me: me.clone(),
            settings: Mutex::new(settings),
            active: RwLock::new(None),
            session: Mutex::new(Session::new()),
            ack: Condvar::new(),
            command_lock: Mutex::new(()),
            registry: Mutex::new(registry),
            dispatcher: Dispatcher::new(),
            io_error: AtomicBool::new(false),
            down_reported: AtomicBool::new(false),
        })
    }

    pub fn subscribe(&self, listener: Arc<dyn Listener>) {
        self.dispatcher.subscribe(listener);
    }

    pub fn settings(&self) -> Settings {
        self.settings.lock().unwrap().clone()
    }

    pub fn set_port_name(&self, name: String) {
        self.settings.lock().unwrap().port_name = name;
    }

    /// Replaces the monitored houses and repopulates the registry with
    /// units 1–16 for each.
    pub fn set_house_codes(&self, houses: Vec<HouseCode>) {
        self.registry.lock().unwrap().rebuild(&houses);
        self.settings.lock().unwrap().house_codes = houses;
    }

    // Link lifecycle -----------------------------------------------------

    pub fn attach(&self, transport: Arc<dyn Transport>, kind: ControllerKind) {
        *self.active.write().unwrap() = Some(Active { transport, kind });
    }

    pub fn detach(&self) {
        if let Some(active) = self.active.write().unwrap().take() {
            active.transport.close();
        }
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.active
            .read()
            .unwrap()
            .as_ref()
            .map(|active| Arc::clone(&active.transport))
    }

    pub fn kind(&self) -> Option<ControllerKind> {
        self.active.read().unwrap().as_ref().map(|active| active.kind)
    }

    pub fn has_io_error(&self) -> bool {
        self.io_error.load(Ordering::SeqCst)
    }

    pub fn mark_io_error(&self) {
        self.io_error.store(true, Ordering::SeqCst);
    }

    pub fn clear_io_error(&self) {
        self.io_error.store(false, Ordering::SeqCst);
        self.down_reported.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.active.read().unwrap().is_some() && !self.has_io_error()
    }

    /// Reports a dead link exactly once per error episode and clears the
    /// session so the next readiness indication is surfaced again.
    pub fn link_down(&self) {
        if self.down_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut session = self.session.lock().unwrap();
            session.state = ProtocolState::Ready;
            session.last_sent.clear();
            session.ready_seen = false;
        }
        self.ack.notify_all();
        self.dispatcher.emit(&Event::ConnectionStatus(false));
    }

    pub fn notify_connection(&self, connected: bool) {
        self.dispatcher.emit(&Event::ConnectionStatus(connected));
    }

    // Registry access ----------------------------------------------------

    pub fn modules(&self) -> Vec<Module> {
        self.registry.lock().unwrap().iter().cloned().collect()
    }

    pub fn module(&self, code: &str) -> Option<Module> {
        self.registry.lock().unwrap().get(code).cloned()
    }

    pub fn set_module_description(&self, code: &str, description: &str) -> bool {
        let mut registry = self.registry.lock().unwrap();
        match registry.get_mut(code) {
            Some(module) => {
                module.set_description(description);
                true
            }
            None => false,
        }
    }

    // Transmit path ------------------------------------------------------

    fn write_raw(&self, data: &[u8]) -> Result<()> {
        let transport = self.transport().ok_or(Error::DeviceUnavailable)?;
        match transport.write(data) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.mark_io_error();
                Err(e)
            }
        }
    }

    /// Writes a frame and waits for the controller's acknowledgement,
    /// resending once before giving up. Bare control bytes skip the
    /// acknowledgement exchange.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        if data.len() <= 1 {
            return self.write_raw(data);
        }
        let kind = self.kind().ok_or(Error::DeviceUnavailable)?;

        let mut session = self.session.lock().unwrap();
        loop {
            let since = match session.last_receive {
                Some(last) => last.elapsed(),
                None => break,
            };
            if since >= SEND_GAP {
                break;
            }
            let (guard, _) = self.ack.wait_timeout(session, SEND_GAP - since).unwrap();
            session = guard;
        }

        self.write_raw(data)?;
        session.last_sent = data.to_vec();
        session.wait_start = Instant::now();
        session.state = match kind {
            ControllerKind::Serial => {
                session.expected_checksum = data[0].wrapping_add(data[1]);
                ProtocolState::WaitingChecksum
            }
            ControllerKind::Usb => ProtocolState::WaitingAck,
        };

        let mut resent = 0;
        loop {
            if session.state == ProtocolState::Ready {
                return Ok(());
            }
            let waited = session.wait_start.elapsed();
            if waited >= ACK_TIMEOUT {
                if resent < RESEND_MAX {
                    resent += 1;
                    log::debug!("no acknowledgement for {:02X?}; resending", session.last_sent);
                    let again = session.last_sent.clone();
                    self.write_raw(&again)?;
                    session.wait_start = Instant::now();
                    session.state = match kind {
                        ControllerKind::Serial => ProtocolState::WaitingChecksum,
                        ControllerKind::Usb => ProtocolState::WaitingAck,
                    };
                } else {
                    session.last_sent.clear();
                    session.state = ProtocolState::Ready;
                    return Err(Error::ProtocolTimeout(ACK_TIMEOUT));
                }
            } else {
                let (guard, _) = self.ack.wait_timeout(session, ACK_TIMEOUT - waited).unwrap();
                session = guard;
            }
        }
    }

    /// Like [`send`](Self::send), but a missing acknowledgement is logged
    /// and tolerated; command effects are mirrored regardless.
    fn send_tolerant(&self, data: &[u8]) -> Result<()> {
        match self.send(data) {
            Err(Error::ProtocolTimeout(window)) => {
                log::warn!("command unacknowledged after {:?}; continuing", window);
                Ok(())
            }
            other => other,
        }
    }

    /// Sends the clock-set frame for the first monitored house.
    pub fn send_time(&self, clear_battery: bool) -> Result<()> {
        let kind = self.kind().ok_or(Error::DeviceUnavailable)?;
        let house = self
            .settings
            .lock()
            .unwrap()
            .house_codes
            .first()
            .copied()
            .unwrap_or(HouseCode::A);
        let now = Local::now().naive_local();
        let data = frame::time_set(house, clear_battery, kind == ControllerKind::Usb, &now);
        self.send_tolerant(&data)
    }

    /// USB controller initialization: clock, monitored houses, then a
    /// status request.
    pub fn cm15_init(&self) -> Result<()> {
        self.send_time(false)?;
        let houses = self.settings.lock().unwrap().house_codes.clone();
        self.send_tolerant(&frame::monitored_codes(&houses))?;
        self.write_raw(&[frame::STATUS_REQUEST])
    }

    // Commands -----------------------------------------------------------

    pub fn unit_on(&self, house: HouseCode, unit: UnitCode) -> Result<()> {
        {
            let _commands = self.command_lock.lock().unwrap();
            self.send_tolerant(&frame::address(house, unit))?;
            self.send_tolerant(&frame::function(house, Command::On))?;
        }
        self.mirror_level(house, unit, 1.0);
        Ok(())
    }

    pub fn unit_off(&self, house: HouseCode, unit: UnitCode) -> Result<()> {
        {
            let _commands = self.command_lock.lock().unwrap();
            self.send_tolerant(&frame::address(house, unit))?;
            self.send_tolerant(&frame::function(house, Command::Off))?;
        }
        self.mirror_level(house, unit, 0.0);
        Ok(())
    }

    pub fn dim(&self, house: HouseCode, unit: UnitCode, percent: u8) -> Result<()> {
        let delta = self.dim_step(house, unit, Command::Dim, percent)?;
        self.mirror_adjust(house, unit, -delta);
        Ok(())
    }

    pub fn bright(&self, house: HouseCode, unit: UnitCode, percent: u8) -> Result<()> {
        let delta = self.dim_step(house, unit, Command::Bright, percent)?;
        self.mirror_adjust(house, unit, delta);
        Ok(())
    }

    fn dim_step(
        &self,
        house: HouseCode,
        unit: UnitCode,
        command: Command,
        percent: u8,
    ) -> Result<f64> {
        let kind = self.kind().ok_or(Error::DeviceUnavailable)?;
        let (data, delta) = match kind {
            ControllerKind::Serial => (
                frame::dim_function_serial(house, command, percent).to_vec(),
                frame::percentage_value(frame::dim_value(percent)),
            ),
            ControllerKind::Usb => (
                frame::dim_function_usb(house, command, percent).to_vec(),
                f64::from(frame::dim_magnitude(percent)) / 210.0,
            ),
        };
        let _commands = self.command_lock.lock().unwrap();
        self.send_tolerant(&frame::address(house, unit))?;
        self.send_tolerant(&data)?;
        Ok(delta)
    }

    pub fn all_lights_on(&self, house: HouseCode) -> Result<()> {
        {
            let _commands = self.command_lock.lock().unwrap();
            self.send_tolerant(&frame::house_address(house))?;
            self.send_tolerant(&frame::function(house, Command::AllLightsOn))?;
        }
        self.mirror_house(house, 1.0);
        Ok(())
    }

    pub fn all_units_off(&self, house: HouseCode) -> Result<()> {
        {
            let _commands = self.command_lock.lock().unwrap();
            self.send_tolerant(&frame::house_address(house))?;
            self.send_tolerant(&frame::function(house, Command::AllUnitsOff))?;
        }
        self.mirror_house(house, 0.0);
        Ok(())
    }

    pub fn status_request(&self, house: HouseCode, unit: UnitCode) -> Result<()> {
        let _commands = self.command_lock.lock().unwrap();
        self.send_tolerant(&frame::address(house, unit))?;
        self.send_tolerant(&frame::function(house, Command::StatusRequest))
    }

    fn mirror_level(&self, house: HouseCode, unit: UnitCode, level: f64) {
        let mut events = Vec::new();
        {
            let mut registry = self.registry.lock().unwrap();
            let module = registry.get_or_insert(house, unit);
            if module.set_level(level) {
                events.push(Event::ModuleChanged(module.clone()));
            }
        }
        self.dispatcher.emit_all(&events);
    }

    fn mirror_adjust(&self, house: HouseCode, unit: UnitCode, delta: f64) {
        let mut events = Vec::new();
        {
            let mut registry = self.registry.lock().unwrap();
            let module = registry.get_or_insert(house, unit);
            if module.adjust_level(delta) {
                events.push(Event::ModuleChanged(module.clone()));
            }
        }
        self.dispatcher.emit_all(&events);
    }

    fn mirror_house(&self, house: HouseCode, level: f64) {
        let mut events = Vec::new();
        {
            let mut session = self.session.lock().unwrap();
            session.addressed.clear();
            let mut registry = self.registry.lock().unwrap();
            for module in registry.house_modules_mut(house) {
                if module.set_level(level) {
                    events.push(Event::ModuleChanged(module.clone()));
                }
            }
        }
        self.dispatcher.emit_all(&events);
    }

    // Receive path -------------------------------------------------------

    pub fn read_chunk(&self) -> Result<Vec<u8>> {
        let transport = self.transport().ok_or(Error::DeviceUnavailable)?;
        transport.read()
    }

    /// Dispatches one inbound chunk through the protocol rules.
    pub fn process(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let kind = match self.kind() {
            Some(kind) => kind,
            None => return,
        };
        let (strict, zero_limit, rf_window) = {
            let settings = self.settings.lock().unwrap();
            (
                settings.strict_checksum,
                settings.zero_checksum_limit,
                settings.rf_duplicate_window,
            )
        };

        let mut events: Vec<Event> = Vec::new();
        let mut reply: Option<Vec<u8>> = None;
        let mut send_time = false;
        let mut line_dead = false;

        let mut session = self.session.lock().unwrap();
        session.last_receive = Some(Instant::now());

        if session.state != ProtocolState::Ready && session.wait_start.elapsed() >= ACK_TIMEOUT {
            log::warn!(
                "acknowledgement window expired in state {:?}; forcing ready",
                session.state
            );
            session.state = ProtocolState::Ready;
        }

        let first = data[0];
        if session.state == ProtocolState::WaitingAck
            && first == frame::PLC_READY
            && data.len() <= 2
        {
            session.state = ProtocolState::Ready;
            session.last_sent.clear();
        } else if !session.ready_seen && (data.len() >= 13 || data == [0xFF, 0x00]) {
            session.ready_seen = true;
            session.state = ProtocolState::Ready;
            events.push(Event::ConnectionStatus(true));
            send_time = true;
        } else if session.state == ProtocolState::WaitingChecksum
            && data.len() == 2
            && data[1] == 0x00
        {
            // The echoed checksum is taken on faith unless strict mode
            // asks otherwise.
            if strict && data[0] != session.expected_checksum {
                log::warn!(
                    "checksum echo {:02X} does not match expected {:02X}; withholding ack",
                    data[0],
                    session.expected_checksum
                );
            } else {
                reply = Some(vec![0x00]);
                session.state = ProtocolState::WaitingAck;
            }
        } else if first == frame::MACRO {
            log::debug!("macro notification: {:02X?}", data);
        } else if first == frame::RF {
            self.receive_rf(&mut session, data, rf_window, &mut events);
        } else if first == frame::PLC_POLL && data.len() <= 2 {
            if !session.ready_seen {
                session.ready_seen = true;
                events.push(Event::ConnectionStatus(true));
            }
            session.state = ProtocolState::WaitingPollReply;
            reply = Some(vec![frame::PLC_REPLY_TO_POLL]);
        } else if first == frame::PLC_FILTER_FAIL_POLL && data.len() <= 2 {
            if !session.ready_seen {
                session.ready_seen = true;
                events.push(Event::ConnectionStatus(true));
            }
            reply = Some(vec![frame::PLC_FILTER_FAIL_POLL]);
        } else if first == frame::PLC_POLL && data.len() > 3 {
            let items = frame::decode_poll(data, kind == ControllerKind::Usb);
            self.apply_poll(&mut session, &items, &mut events);
            if session.state == ProtocolState::WaitingPollReply {
                session.state = ProtocolState::Ready;
            }
        } else if first == frame::PLC_TIME_REQUEST {
            send_time = true;
        } else if first == 0x00 {
            session.zero_count += 1;
            if zero_limit.map_or(false, |limit| session.zero_count > limit) {
                // A continuous zero stream is how a dropped line reads on
                // some platforms.
                log::warn!("flood of zero bytes; treating the link as dead");
                line_dead = true;
            }
        } else {
            session.zero_count = 0;
            reply = Some(vec![0x00]);
        }

        drop(session);
        self.ack.notify_all();

        if let Some(reply) = reply {
            if let Err(e) = self.write_raw(&reply) {
                log::warn!("failed to write protocol reply: {}", e);
            }
        }
        self.dispatcher.emit_all(&events);
        if line_dead {
            self.mark_io_error();
        }
        if send_time {
            self.spawn_time_send();
        }
    }

    /// Clock updates are requested from the receive path; a worker sends
    /// them so the reader stays free to collect the acknowledgement.
    fn spawn_time_send(&self) {
        let engine = match self.me.upgrade() {
            Some(engine) => engine,
            None => return,
        };
        thread::spawn(move || {
            if let Err(e) = engine.send_time(false) {
                log::warn!("clock update failed: {}", e);
            }
        });
    }

    fn receive_rf(
        &self,
        session: &mut Session,
        data: &[u8],
        window: Duration,
        events: &mut Vec<Event>,
    ) {
        enum Decoded {
            Standard(rf::StandardCommand),
            Security(rf::SecurityNotification),
        }
        let decoded = if data.len() == 6 && data[1] == rf::PREFIX_STANDARD {
            rf::decode_standard(data).map(Decoded::Standard)
        } else if data.len() == 8 && data[1] == rf::PREFIX_SECURITY {
            rf::decode_security(data).map(Decoded::Security)
        } else {
            Err(Error::Parse("unrecognized rf frame shape"))
        };
        let decoded = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                log::debug!("dropping rf frame {:02X?}: {}", data, e);
                return;
            }
        };

        let now = Instant::now();
        let duplicate = session.last_rf.as_slice() == data
            && session
                .last_rf_at
                .map_or(false, |at| now.duration_since(at) < window);
        session.last_rf = data.to_vec();
        session.last_rf_at = Some(now);
        if duplicate {
            log::debug!("suppressing repeated rf frame");
            return;
        }

        events.push(Event::RfData(data.to_vec()));
        match decoded {
            Decoded::Standard(command) => {
                events.push(Event::RfCommand(command.command, command.house, command.unit));
                self.apply_rf_command(session, &command, events);
            }
            Decoded::Security(notification) => {
                events.push(Event::RfSecurity(notification.event, notification.address));
            }
        }
    }

    fn apply_rf_command(
        &self,
        session: &mut Session,
        command: &rf::StandardCommand,
        events: &mut Vec<Event>,
    ) {
        let mut registry = self.registry.lock().unwrap();
        let step = f64::from(RF_DIM_STEP) / 210.0;
        match (command.command, command.unit) {
            (Command::On, Some(unit)) => {
                session.addressed.clear();
                session.addressed.push(module_code(command.house, unit));
                let module = registry.get_or_insert(command.house, unit);
                if module.set_level(1.0) {
                    events.push(Event::ModuleChanged(module.clone()));
                }
            }
            (Command::Off, Some(unit)) => {
                session.addressed.clear();
                session.addressed.push(module_code(command.house, unit));
                let module = registry.get_or_insert(command.house, unit);
                if module.set_level(0.0) {
                    events.push(Event::ModuleChanged(module.clone()));
                }
            }
            (Command::AllLightsOn, _) => {
                session.addressed.clear();
                Self::set_house_level(&mut registry, command.house, 1.0, events);
            }
            (Command::AllUnitsOff, _) => {
                session.addressed.clear();
                Self::set_house_level(&mut registry, command.house, 0.0, events);
            }
            (Command::Dim, _) => {
                Self::adjust_addressed(&mut registry, session, -step, events);
            }
            (Command::Bright, _) => {
                Self::adjust_addressed(&mut registry, session, step, events);
            }
            _ => {}
        }
    }

    fn apply_poll(&self, session: &mut Session, items: &[PlcItem], events: &mut Vec<Event>) {
        let mut registry = self.registry.lock().unwrap();
        for item in items {
            match *item {
                PlcItem::Address { house, unit } => {
                    if session.new_address_data {
                        session.addressed.clear();
                        session.new_address_data = false;
                    }
                    let module = registry.get_or_insert(house, unit);
                    let code = module.code();
                    if !session.addressed.contains(&code) {
                        session.addressed.push(code);
                    }
                    events.push(Event::PlcAddress(house, unit));
                }
                PlcItem::Function {
                    house,
                    command,
                    magnitude,
                } => {
                    let delta = f64::from(magnitude.unwrap_or(0)) / 210.0;
                    match command {
                        Command::On => {
                            Self::set_addressed(&mut registry, session, 1.0, events);
                        }
                        Command::Off => {
                            Self::set_addressed(&mut registry, session, 0.0, events);
                        }
                        Command::Dim => {
                            Self::adjust_addressed(&mut registry, session, -delta, events);
                        }
                        Command::Bright => {
                            Self::adjust_addressed(&mut registry, session, delta, events);
                        }
                        Command::AllLightsOn => {
                            session.addressed.clear();
                            Self::set_house_level(&mut registry, house, 1.0, events);
                        }
                        Command::AllUnitsOff => {
                            session.addressed.clear();
                            Self::set_house_level(&mut registry, house, 0.0, events);
                        }
                        _ => {}
                    }
                    events.push(Event::PlcFunction(command, house));
                    session.new_address_data = true;
                }
            }
        }
    }

    fn set_addressed(
        registry: &mut Registry,
        session: &Session,
        level: f64,
        events: &mut Vec<Event>,
    ) {
        for code in &session.addressed {
            if let Some(module) = registry.get_mut(code) {
                if module.set_level(level) {
                    events.push(Event::ModuleChanged(module.clone()));
                }
            }
        }
    }

    fn adjust_addressed(
        registry: &mut Registry,
        session: &Session,
        delta: f64,
        events: &mut Vec<Event>,
    ) {
        for code in &session.addressed {
            if let Some(module) = registry.get_mut(code) {
                if module.adjust_level(delta) {
                    events.push(Event::ModuleChanged(module.clone()));
                }
            }
        }
    }

    fn set_house_level(
        registry: &mut Registry,
        house: HouseCode,
        level: f64,
        events: &mut Vec<Event>,
    ) {
        // Applies to every module of the house; appliances are not yet
        // told apart from lights.
        for module in registry.house_modules_mut(house) {
            if module.set_level(level) {
                events.push(Event::ModuleChanged(module.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rf::SecurityEvent;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;
    use std::thread::JoinHandle;

    #[derive(Default)]
    struct FakeTransport {
        incoming: Mutex<VecDeque<Vec<u8>>>,
        outgoing: Mutex<Vec<Vec<u8>>>,
    }

    impl FakeTransport {
        fn writes(&self) -> Vec<Vec<u8>> {
            self.outgoing.lock().unwrap().clone()
        }
    }

    impl Transport for FakeTransport {
        fn open(&self) -> Result<()> {
            Ok(())
        }
        fn close(&self) {}
        fn read(&self) -> Result<Vec<u8>> {
            Ok(self.incoming.lock().unwrap().pop_front().unwrap_or_default())
        }
        fn write(&self, data: &[u8]) -> Result<()> {
            self.outgoing.lock().unwrap().push(data.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        connections: Mutex<Vec<bool>>,
        changes: Mutex<Vec<(String, f64)>>,
        plc_addresses: Mutex<Vec<(HouseCode, UnitCode)>>,
        plc_functions: Mutex<Vec<(Command, HouseCode)>>,
        rf_data: Mutex<Vec<Vec<u8>>>,
        rf_commands: Mutex<Vec<(Command, HouseCode, Option<UnitCode>)>>,
        rf_securities: Mutex<Vec<(SecurityEvent, u32)>>,
    }

    impl Listener for Recorder {
        fn connection_status(&self, connected: bool) {
            self.connections.lock().unwrap().push(connected);
        }
        fn module_changed(&self, module: &Module, _property: &str) {
            self.changes
                .lock()
                .unwrap()
                .push((module.code(), module.level()));
        }
        fn plc_address(&self, house: HouseCode, unit: UnitCode) {
            self.plc_addresses.lock().unwrap().push((house, unit));
        }
        fn plc_function(&self, command: Command, house: HouseCode) {
            self.plc_functions.lock().unwrap().push((command, house));
        }
        fn rf_data(&self, data: &[u8]) {
            self.rf_data.lock().unwrap().push(data.to_vec());
        }
        fn rf_command(&self, command: Command, house: HouseCode, unit: Option<UnitCode>) {
            self.rf_commands.lock().unwrap().push((command, house, unit));
        }
        fn rf_security(&self, event: SecurityEvent, address: u32) {
            self.rf_securities.lock().unwrap().push((event, address));
        }
    }

    fn engine_with(kind: ControllerKind) -> (Arc<Engine>, Arc<FakeTransport>, Arc<Recorder>) {
        let engine = Engine::new(Settings::default());
        let fake = Arc::new(FakeTransport::default());
        let recorder = Arc::new(Recorder::default());
        engine.attach(fake.clone(), kind);
        engine.subscribe(recorder.clone());
        (engine, fake, recorder)
    }

    fn wait_for<F: Fn() -> bool>(predicate: F) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !predicate() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Plays the controller's side of the acknowledgement exchange.
    fn spawn_acker(engine: Arc<Engine>, stop: Arc<AtomicBool>) -> JoinHandle<()> {
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                let (state, checksum) = {
                    let session = engine.session.lock().unwrap();
                    (session.state, session.expected_checksum)
                };
                match state {
                    ProtocolState::WaitingChecksum => engine.process(&[checksum, 0x00]),
                    ProtocolState::WaitingAck => engine.process(&[0x55]),
                    _ => {}
                }
                thread::sleep(Duration::from_millis(2));
            }
        })
    }

    #[test]
    fn serial_checksum_walk() {
        let (engine, fake, _) = engine_with(ControllerKind::Serial);
        let sender = {
            let engine = engine.clone();
            thread::spawn(move || engine.send(&[0x04, 0x25]))
        };
        wait_for(|| !fake.writes().is_empty());
        assert_eq!(fake.writes()[0], vec![0x04, 0x25]);
        assert_eq!(engine.session.lock().unwrap().expected_checksum, 0x29);

        engine.process(&[0x29, 0x00]);
        wait_for(|| fake.writes().len() == 2);
        assert_eq!(fake.writes()[1], vec![0x00]);
        assert_eq!(
            engine.session.lock().unwrap().state,
            ProtocolState::WaitingAck
        );

        engine.process(&[0x55]);
        sender.join().unwrap().unwrap();
        assert_eq!(engine.session.lock().unwrap().state, ProtocolState::Ready);
    }

    #[test]
    fn serial_on_command_sends_pair_and_mirrors() {
        let (engine, fake, _) = engine_with(ControllerKind::Serial);
        let stop = Arc::new(AtomicBool::new(false));
        let acker = spawn_acker(engine.clone(), stop.clone());
        engine.unit_on(HouseCode::C, UnitCode(7)).unwrap();
        stop.store(true, Ordering::SeqCst);
        acker.join().unwrap();

        let writes = fake.writes();
        assert_eq!(
            writes,
            vec![
                vec![0x04, 0x25],
                vec![0x00],
                vec![0x06, 0x22],
                vec![0x00],
            ]
        );
        assert_eq!(engine.module("C7").unwrap().level(), 1.0);
    }

    #[test]
    fn mirror_update_notifies_subscribers() {
        let (engine, _, recorder) = engine_with(ControllerKind::Usb);
        let stop = Arc::new(AtomicBool::new(false));
        let acker = spawn_acker(engine.clone(), stop.clone());
        engine.unit_on(HouseCode::A, UnitCode(3)).unwrap();
        stop.store(true, Ordering::SeqCst);
        acker.join().unwrap();
        assert_eq!(
            *recorder.changes.lock().unwrap(),
            vec![("A3".to_string(), 1.0)]
        );
    }

    #[test]
    fn usb_dim_sends_magnitude_and_clamps_mirror() {
        let (engine, fake, _) = engine_with(ControllerKind::Usb);
        let stop = Arc::new(AtomicBool::new(false));
        let acker = spawn_acker(engine.clone(), stop.clone());
        engine.dim(HouseCode::A, UnitCode(1), 50).unwrap();
        stop.store(true, Ordering::SeqCst);
        acker.join().unwrap();

        let writes = fake.writes();
        assert_eq!(writes, vec![vec![0x04, 0x66], vec![0x06, 0x64, 0x69]]);
        // Already dark; the mirror stays clamped at zero.
        assert_eq!(engine.module("A1").unwrap().level(), 0.0);
    }

    #[test]
    fn bright_mirror_accumulates() {
        let (engine, _, _) = engine_with(ControllerKind::Usb);
        let stop = Arc::new(AtomicBool::new(false));
        let acker = spawn_acker(engine.clone(), stop.clone());
        engine.bright(HouseCode::A, UnitCode(2), 30).unwrap();
        engine.bright(HouseCode::A, UnitCode(2), 30).unwrap();
        stop.store(true, Ordering::SeqCst);
        acker.join().unwrap();
        assert_eq!(engine.module("A2").unwrap().level(), 0.6);
    }

    #[test]
    fn status_request_sends_pair() {
        let (engine, fake, _) = engine_with(ControllerKind::Usb);
        let stop = Arc::new(AtomicBool::new(false));
        let acker = spawn_acker(engine.clone(), stop.clone());
        engine.status_request(HouseCode::C, UnitCode(7)).unwrap();
        stop.store(true, Ordering::SeqCst);
        acker.join().unwrap();
        assert_eq!(fake.writes(), vec![vec![0x04, 0x25], vec![0x06, 0x2F]]);
    }

    #[test]
    fn all_lights_on_uses_house_address_and_mass_mirror() {
        let (engine, fake, _) = engine_with(ControllerKind::Usb);
        let stop = Arc::new(AtomicBool::new(false));
        let acker = spawn_acker(engine.clone(), stop.clone());
        engine.all_lights_on(HouseCode::A).unwrap();
        stop.store(true, Ordering::SeqCst);
        acker.join().unwrap();

        assert_eq!(fake.writes(), vec![vec![0x04, 0x60], vec![0x06, 0x61]]);
        for module in engine.modules() {
            assert_eq!(module.level(), 1.0);
        }
    }

    #[test]
    fn plc_poll_replies_and_raises_connection_once() {
        let (engine, fake, recorder) = engine_with(ControllerKind::Serial);
        engine.process(&[0x5A]);
        assert_eq!(fake.writes(), vec![vec![0xC3]]);
        engine.process(&[0x5A]);
        assert_eq!(fake.writes(), vec![vec![0xC3], vec![0xC3]]);
        assert_eq!(*recorder.connections.lock().unwrap(), vec![true]);
    }

    #[test]
    fn filter_fail_poll_is_echoed() {
        let (engine, fake, _) = engine_with(ControllerKind::Serial);
        engine.process(&[0xF3]);
        assert_eq!(fake.writes(), vec![vec![0xF3]]);
    }

    #[test]
    fn rf_on_and_off_update_module() {
        let (engine, _, recorder) = engine_with(ControllerKind::Usb);
        engine.process(&[0x5D, 0x20, 0x60, 0x9F, 0x00, 0xFF]);
        assert_eq!(engine.module("A1").unwrap().level(), 1.0);
        assert_eq!(
            recorder.rf_commands.lock().unwrap().last(),
            Some(&(Command::On, HouseCode::A, Some(UnitCode(1))))
        );
        assert_eq!(
            recorder.rf_data.lock().unwrap().last(),
            Some(&vec![0x5D, 0x20, 0x60, 0x9F, 0x00, 0xFF])
        );

        engine.process(&[0x5D, 0x20, 0x60, 0x9F, 0x20, 0xDF]);
        assert_eq!(engine.module("A1").unwrap().level(), 0.0);
        assert_eq!(
            recorder.rf_commands.lock().unwrap().last(),
            Some(&(Command::Off, HouseCode::A, Some(UnitCode(1))))
        );
    }

    #[test]
    fn rf_duplicates_are_suppressed() {
        let (engine, _, recorder) = engine_with(ControllerKind::Usb);
        let data = [0x5D, 0x20, 0x60, 0x9F, 0x00, 0xFF];
        engine.process(&data);
        engine.process(&data);
        assert_eq!(recorder.rf_commands.lock().unwrap().len(), 1);
        assert_eq!(recorder.rf_data.lock().unwrap().len(), 1);
    }

    #[test]
    fn rf_invalid_frame_changes_nothing() {
        let (engine, _, recorder) = engine_with(ControllerKind::Usb);
        engine.process(&[0x5D, 0x20, 0x60, 0x9F, 0x00, 0xFE]);
        assert!(recorder.rf_commands.lock().unwrap().is_empty());
        assert_eq!(engine.module("A1").unwrap().level(), 0.0);
    }

    #[test]
    fn rf_dim_applies_step_to_addressed_module() {
        let (engine, _, _) = engine_with(ControllerKind::Usb);
        engine.process(&[0x5D, 0x20, 0x60, 0x9F, 0x00, 0xFF]);
        assert_eq!(engine.module("A1").unwrap().level(), 1.0);
        // One step is 0x0F on the 210 scale, 0.07 after rounding.
        engine.process(&[0x5D, 0x20, 0x60, 0x9F, 0x98, 0x67]);
        assert_eq!(engine.module("A1").unwrap().level(), 0.93);
    }

    #[test]
    fn rf_security_event_is_reported() {
        let (engine, _, recorder) = engine_with(ControllerKind::Usb);
        engine.process(&[0x5D, 0x29, 0x12, 0x1D, 0x0C, 0xF3, 0x34, 0x56]);
        assert_eq!(
            *recorder.rf_securities.lock().unwrap(),
            vec![(SecurityEvent::MotionAlert, 0x12_3456)]
        );
    }

    #[test]
    fn extended_poll_addresses_then_applies_function() {
        let (engine, _, recorder) = engine_with(ControllerKind::Serial);
        engine.process(&[0x5A, 0x03, 0x02, 0x66, 0x62]);
        assert_eq!(engine.module("A1").unwrap().level(), 1.0);
        assert_eq!(
            *recorder.plc_addresses.lock().unwrap(),
            vec![(HouseCode::A, UnitCode(1))]
        );
        assert_eq!(
            *recorder.plc_functions.lock().unwrap(),
            vec![(Command::On, HouseCode::A)]
        );

        // The addressed set survives until the next address byte, so a
        // following dim poll applies its magnitude to A1.
        engine.process(&[0x5A, 0x03, 0x03, 0x64, 0x69]);
        assert_eq!(engine.module("A1").unwrap().level(), 0.5);
    }

    #[test]
    fn interface_ready_triggers_clock_update() {
        let (engine, fake, recorder) = engine_with(ControllerKind::Serial);
        let stop = Arc::new(AtomicBool::new(false));
        let acker = spawn_acker(engine.clone(), stop.clone());
        engine.process(&[0u8; 14]);
        wait_for(|| fake.writes().iter().any(|w| w[0] == frame::TIME_SET));
        stop.store(true, Ordering::SeqCst);
        acker.join().unwrap();

        assert_eq!(*recorder.connections.lock().unwrap(), vec![true]);
        let time = fake
            .writes()
            .into_iter()
            .find(|w| w[0] == frame::TIME_SET)
            .unwrap();
        assert_eq!(time.len(), 7);
    }

    #[test]
    fn zero_flood_marks_the_link_dead() {
        let (engine, fake, _) = engine_with(ControllerKind::Serial);
        for _ in 0..10 {
            engine.process(&[0x00]);
        }
        assert!(!engine.has_io_error());
        engine.process(&[0x00]);
        assert!(engine.has_io_error());
        // Unknown traffic is acknowledged and resets the counter.
        engine.clear_io_error();
        engine.process(&[0x77]);
        assert_eq!(engine.session.lock().unwrap().zero_count, 0);
        assert_eq!(fake.writes().last(), Some(&vec![0x00]));
    }

    #[test]
    fn module_description_set_through_engine() {
        let (engine, _, _) = engine_with(ControllerKind::Serial);
        assert!(engine.set_module_description("A5", "hall lamp"));
        assert_eq!(engine.module("A5").unwrap().description(), "hall lamp");
        // Only configured or observed modules can be described.
        assert!(!engine.set_module_description("B2", "spare"));
    }

    #[test]
    fn stale_wait_state_is_forced_ready() {
        let (engine, _, _) = engine_with(ControllerKind::Serial);
        {
            let mut session = engine.session.lock().unwrap();
            session.state = ProtocolState::WaitingAck;
            session.wait_start = Instant::now() - ACK_TIMEOUT;
        }
        engine.process(&[0x5B, 0x01]);
        assert_eq!(engine.session.lock().unwrap().state, ProtocolState::Ready);
    }
}
