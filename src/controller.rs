//! The galvo controller: sequences buffered list commands and immediate
//! realtime commands to an LMC board and keeps the two correctly ordered.
//!
//! List commands accumulate into fixed 0xC00-byte packets which are flushed
//! when full or when a logical program ends. Realtime commands go out
//! immediately and never disturb a partially filled packet. A background
//! spooler thread drains submitted jobs, each invoked repeatedly until it
//! reports completion.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::codec;
use crate::connection::{Connection, MockConnection, UsbConnection};
use crate::consts::*;
use crate::correction::CorTable;
use crate::settings::{LaserSource, Settings};
use crate::spooler::Job;

/// Reply placeholder while sending is disabled or the link is down.
pub const OFFLINE_REPLY: [u16; 4] = [0xFFFF; 4];

const STATUS_POLL: Duration = Duration::from_millis(10);
const PAUSE_POLL: Duration = Duration::from_millis(300);
const RETRY_DELAY: Duration = Duration::from_millis(300);
const INPUT_POLL: Duration = Duration::from_millis(50);
const CONNECT_ATTEMPTS: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaserConfiguration {
    Initial,
    Marking,
    Lighting,
}

/// Optional overrides for [`GalvoController::set_with`]; anything left
/// `None` falls back to the configured default.
#[derive(Clone, Copy, Debug, Default)]
pub struct ParameterOverrides {
    pub mark_speed: Option<f64>,
    pub travel_speed: Option<f64>,
    pub power: Option<f64>,
    pub frequency: Option<f64>,
    pub pulse_width: Option<u16>,
    pub fpk: Option<f64>,
    pub delay_on: Option<f64>,
    pub delay_off: Option<f64>,
    pub delay_polygon: Option<f64>,
}

/// Last parameter values actually written to the list stream. `None`
/// forces the next setter call to emit unconditionally.
#[derive(Clone, Copy, Debug, Default)]
struct ParamCache {
    mark_speed: Option<f64>,
    travel_speed: Option<f64>,
    frequency: Option<f64>,
    power: Option<f64>,
    pulse_width: Option<u16>,
    fpk: Option<f64>,
    delay_jump: Option<f64>,
    delay_on: Option<f64>,
    delay_off: Option<f64>,
    delay_poly: Option<f64>,
}

/// List-building state. Guarded by one mutex so that nested emissions from
/// the mode machine and plot helpers stay atomic.
struct Machine {
    configuration: LaserConfiguration,
    last_x: u16,
    last_y: u16,
    port_bits: u16,
    active_list: Option<Box<[u8; LIST_PACKET_SIZE]>>,
    active_index: usize,
    list_executing: bool,
    list_packets: u32,
    cache: ParamCache,
}

/// The transport handle, locked separately so realtime traffic (status
/// polls, pause/resume) can proceed while a list flush sleeps.
struct Link {
    connection: Option<Box<dyn Connection>>,
}

struct SpoolerState {
    queue: Vec<Job>,
    current: Option<Job>,
    worker: Option<JoinHandle<()>>,
}

/// Driver for one LMC board.
///
/// All methods are callable from any thread; exactly one background thread
/// (the spooler) executes submitted jobs. The controller connects lazily on
/// the first command that needs the board.
pub struct GalvoController {
    settings: RwLock<Settings>,
    machine: Mutex<Machine>,
    link: Mutex<Link>,
    spooler: Mutex<SpoolerState>,
    spooler_cv: Condvar,

    sending: AtomicBool,
    shutdown: AtomicBool,
    paused: AtomicBool,
    aborting: AtomicBool,
    abort_open: AtomicBool,
    disable_connect: AtomicBool,
    connecting: AtomicBool,
}

impl GalvoController {
    pub fn new(settings: Settings) -> Arc<Self> {
        let machine = Machine {
            configuration: LaserConfiguration::Initial,
            last_x: settings.x,
            last_y: settings.y,
            port_bits: 0,
            active_list: None,
            active_index: 0,
            list_executing: false,
            list_packets: 0,
            cache: ParamCache::default(),
        };
        Arc::new(GalvoController {
            settings: RwLock::new(settings),
            machine: Mutex::new(machine),
            link: Mutex::new(Link { connection: None }),
            spooler: Mutex::new(SpoolerState {
                queue: Vec::new(),
                current: None,
                worker: None,
            }),
            spooler_cv: Condvar::new(),
            sending: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            aborting: AtomicBool::new(false),
            abort_open: AtomicBool::new(false),
            disable_connect: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
        })
    }

    pub fn from_settings_file(path: impl AsRef<std::path::Path>) -> io::Result<Arc<Self>> {
        Ok(Self::new(Settings::from_file(path)?))
    }

    /// Build a controller over a caller-supplied transport.
    pub fn with_connection(settings: Settings, connection: Box<dyn Connection>) -> Arc<Self> {
        let controller = Self::new(settings);
        controller.link.lock().unwrap().connection = Some(connection);
        controller
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().unwrap().clone()
    }

    /// Mutate the configuration in place. Changes apply to subsequent
    /// operations; the machine index is fixed once connected.
    pub fn configure(&self, f: impl FnOnce(&mut Settings)) {
        f(&mut self.settings.write().unwrap());
    }

    //
    // Spooler management
    //

    pub fn submit(self: &Arc<Self>, job: Job) {
        {
            let mut spooler = self.spooler.lock().unwrap();
            spooler.queue.push(job);
            self.spooler_cv.notify_all();
        }
        self.start();
    }

    /// Remove every queued occurrence of `job`, compared by identity.
    pub fn remove(&self, job: &Job) {
        let mut spooler = self.spooler.lock().unwrap();
        spooler.queue.retain(|queued| !Arc::ptr_eq(queued, job));
        self.spooler_cv.notify_all();
    }

    pub fn start(self: &Arc<Self>) {
        self.shutdown.store(false, Ordering::SeqCst);
        let mut spooler = self.spooler.lock().unwrap();
        if spooler.worker.is_none() {
            let controller = Arc::clone(self);
            let handle = thread::Builder::new()
                .name("lmc-spooler".into())
                .spawn(move || controller.spooler_run())
                .expect("spawn spooler thread");
            spooler.worker = Some(handle);
        }
    }

    /// Stop the spooler, drop all queued work and leave the board aborted
    /// in the initial configuration.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        {
            let mut spooler = self.spooler.lock().unwrap();
            spooler.queue.clear();
            spooler.current = None;
            self.spooler_cv.notify_all();
        }
        if let Err(e) = self.abort() {
            warn!("abort during shutdown failed: {e}");
        }
        let worker = self.spooler.lock().unwrap().worker.take();
        if let Some(handle) = worker {
            let _ = handle.join();
        }
    }

    /// Block until the queue has drained and no job is running.
    pub fn wait_for_machine_idle(&self) {
        let mut spooler = self.spooler.lock().unwrap();
        while !spooler.queue.is_empty() || spooler.current.is_some() {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let (guard, _) = self
                .spooler_cv
                .wait_timeout(spooler, Duration::from_millis(100))
                .unwrap();
            spooler = guard;
        }
    }

    pub fn current(&self) -> Option<Job> {
        self.spooler.lock().unwrap().current.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.spooler.lock().unwrap().queue.len()
    }

    pub fn can_spool(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst)
    }

    pub fn is_executing(&self) -> bool {
        self.can_spool() && self.queue_len() > 0
    }

    fn spooler_run(self: Arc<Self>) {
        while !self.shutdown.load(Ordering::SeqCst) {
            let program = {
                let mut spooler = self.spooler.lock().unwrap();
                loop {
                    if self.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    if let Some(job) = spooler.queue.first() {
                        break Arc::clone(job);
                    }
                    spooler.current = None;
                    self.spooler_cv.notify_all();
                    spooler = self.spooler_cv.wait(spooler).unwrap();
                }
            };
            self.spooler.lock().unwrap().current = Some(Arc::clone(&program));
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            // No locks are held while a job runs.
            match program(self.as_ref()) {
                Ok(true) => {
                    self.remove(&program);
                    let mut spooler = self.spooler.lock().unwrap();
                    spooler.current = None;
                    self.spooler_cv.notify_all();
                }
                Ok(false) => {}
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => {
                    warn!("transport unreachable, spooler exiting: {e}");
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    debug!("transport refused, spooler waiting: {e}");
                    if self.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    let spooler = self.spooler.lock().unwrap();
                    drop(self.spooler_cv.wait(spooler).unwrap());
                }
                Err(e) => {
                    warn!("job failed and was dropped: {e}");
                    self.remove(&program);
                    let mut spooler = self.spooler.lock().unwrap();
                    spooler.current = None;
                    self.spooler_cv.notify_all();
                }
            }
        }
    }

    /// Coarse machine state for UIs: (category, detail).
    pub fn state(&self) -> (&'static str, &'static str) {
        let configuration = self.machine.lock().unwrap().configuration;
        if configuration == LaserConfiguration::Initial {
            return ("idle", "idle");
        }
        if self.paused.load(Ordering::SeqCst) {
            return ("hold", "paused");
        }
        match configuration {
            LaserConfiguration::Lighting => ("busy", "lighting"),
            _ => ("busy", "marking"),
        }
    }

    pub fn laser_configuration(&self) -> LaserConfiguration {
        self.machine.lock().unwrap().configuration
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    //
    // Connection handling
    //

    pub fn is_connected(&self) -> bool {
        let index = self.settings.read().unwrap().machine_index;
        let link = self.link.lock().unwrap();
        link.connection
            .as_ref()
            .is_some_and(|conn| conn.is_open(index))
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::SeqCst)
    }

    /// False once automatic connects have latched off after repeated
    /// failures; [`disconnect`](Self::disconnect) clears the latch.
    pub fn is_connection_allowed(&self) -> bool {
        !self.disable_connect.load(Ordering::SeqCst)
    }

    pub fn abort_connect(&self) {
        self.abort_open.store(true, Ordering::SeqCst);
        info!("connect attempts aborted");
    }

    pub fn disconnect(&self) {
        let index = self.settings.read().unwrap().machine_index;
        let mut link = self.link.lock().unwrap();
        if let Some(mut connection) = link.connection.take() {
            connection.close(index);
        }
        // Allow another explicit attempt.
        self.disable_connect.store(false, Ordering::SeqCst);
    }

    fn connect_if_needed(&self, link: &mut Link) -> io::Result<()> {
        if self.disable_connect.load(Ordering::SeqCst) {
            self.abort_connect();
            link.connection = None;
            return Err(refused("LMC was unreachable, explicit connect required"));
        }
        if link.connection.is_none() {
            let mock = self.settings.read().unwrap().mock;
            link.connection = Some(if mock {
                Box::new(MockConnection::new())
            } else {
                Box::new(UsbConnection::new()?)
            });
        }
        let index = self.settings.read().unwrap().machine_index;
        if link.connection.as_ref().unwrap().is_open(index) {
            return Ok(());
        }

        self.connecting.store(true, Ordering::SeqCst);
        self.abort_open.store(false, Ordering::SeqCst);
        let mut count = 0;
        loop {
            if link.connection.as_ref().unwrap().is_open(index) {
                break;
            }
            let attempt = match link.connection.as_mut().unwrap().open(index) {
                Ok(()) => self.init_laser(link),
                Err(e) => Err(e),
            };
            let Err(e) = attempt else { continue };
            debug!("connect attempt {} failed: {e}", count + 1);
            thread::sleep(RETRY_DELAY);
            count += 1;
            if !self.sending.load(Ordering::SeqCst) || self.abort_open.load(Ordering::SeqCst) {
                self.connecting.store(false, Ordering::SeqCst);
                self.abort_open.store(false, Ordering::SeqCst);
                return Ok(());
            }
            if link.connection.as_ref().unwrap().is_open(index) {
                link.connection.as_mut().unwrap().close(index);
            }
            if count >= CONNECT_ATTEMPTS {
                self.connecting.store(false, Ordering::SeqCst);
                self.disable_connect.store(true, Ordering::SeqCst);
                warn!("could not connect to the LMC controller, automatic connections disabled");
                return Err(refused("could not connect to the LMC controller"));
            }
            thread::sleep(RETRY_DELAY);
        }
        self.connecting.store(false, Ordering::SeqCst);
        self.abort_open.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Full bring-up sequence run after each successful open.
    fn init_laser(&self, link: &mut Link) -> io::Result<()> {
        let s = self.settings.read().unwrap().clone();
        info!("initializing laser");
        let serial = self.raw_command(link, GET_SERIAL_NO, [0; 5], true)?;
        debug!("serial number: {serial:04x?}");
        let version = self.raw_command(link, GET_VERSION, [0; 5], true)?;
        debug!("version: {version:04x?}");
        self.raw_command(link, RESET, [0; 5], true)?;
        self.write_correction_table(link)?;
        self.raw_command(link, ENABLE_LASER, [0; 5], true)?;
        self.raw_command(link, SET_CONTROL_MODE, [s.control_mode, 0, 0, 0, 0], true)?;
        self.raw_command(link, SET_LASER_MODE, [s.laser_mode, 0, 0, 0, 0], true)?;
        self.raw_command(link, SET_DELAY_MODE, [s.delay_mode, 0, 0, 0, 0], true)?;
        self.raw_command(link, SET_TIMING, [s.timing_mode, 0, 0, 0, 0], true)?;
        self.raw_command(link, SET_STANDBY, [s.standby_p1, s.standby_p2, 0, 0, 0], true)?;
        self.raw_command(
            link,
            SET_FIRST_PULSE_KILLER,
            [s.first_pulse_killer, 0, 0, 0, 0],
            true,
        )?;
        self.raw_command(link, SET_PWM_HALF_PERIOD, [s.pwm_half_period, 0, 0, 0, 0], true)?;
        self.raw_command(link, SET_PWM_PULSE_WIDTH, [s.pwm_pulse_width, 0, 0, 0, 0], true)?;
        self.raw_command(link, FIBER_SET_MO, [0; 5], true)?;
        self.raw_command(
            link,
            SET_FPK_PARAM_2,
            [s.fpk2_max_voltage, s.fpk2_min_voltage, s.fpk2_t1, s.fpk2_t2, 0],
            true,
        )?;
        self.raw_command(
            link,
            SET_FLY_RES,
            [
                s.fly_resolution_1,
                s.fly_resolution_2,
                s.fly_resolution_3,
                s.fly_resolution_4,
                0,
            ],
            true,
        )?;
        self.raw_command(link, ENABLE_Z, [0; 5], true)?;
        self.raw_command(link, WRITE_ANALOG_PORT_1, [0x7FF, 0, 0, 0, 0], true)?;
        self.raw_command(link, ENABLE_Z, [0; 5], true)?;
        thread::sleep(Duration::from_millis(50));
        info!("laser ready");
        Ok(())
    }

    /// Upload the lens correction grid, or a blank table when no usable
    /// file is configured.
    fn write_correction_table(&self, link: &mut Link) -> io::Result<()> {
        let cor_file = self.settings.read().unwrap().cor_file.clone();
        let table = match &cor_file {
            Some(path) => match CorTable::from_file(path) {
                Ok(table) => Some(table),
                Err(e) => {
                    warn!("correction file {} unusable: {e}", path.display());
                    None
                }
            },
            None => None,
        };
        match table {
            Some(table) => {
                self.raw_command(link, WRITE_COR_TABLE, [1, 0, 0, 0, 0], true)?;
                for (i, &(dx, dy)) in table.entries().iter().enumerate() {
                    let non_first = if i == 0 { 0 } else { 1 };
                    self.raw_command(link, WRITE_COR_LINE, [dx, dy, non_first, 0, 0], false)?;
                }
                debug!("correction table uploaded");
            }
            None => {
                self.raw_command(link, WRITE_COR_TABLE, [0; 5], true)?;
            }
        }
        Ok(())
    }

    /// Direct write/read on an already-open link; errors propagate.
    fn raw_command(
        &self,
        link: &mut Link,
        op: u16,
        values: [u16; 5],
        read: bool,
    ) -> io::Result<[u16; 4]> {
        let index = self.settings.read().unwrap().machine_index;
        let connection = link
            .connection
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no connection"))?;
        connection.write(index, &codec::command(op, values))?;
        if read {
            let raw = connection.read(index)?;
            Ok(codec::reply_words(&raw))
        } else {
            Ok([0; 4])
        }
    }

    /// Send raw bytes, lazily connecting first. Link-level write/read
    /// trouble degrades to [`OFFLINE_REPLY`]; a refused connection
    /// propagates.
    fn send(&self, data: &[u8], read: bool) -> io::Result<[u16; 4]> {
        if !self.sending.load(Ordering::SeqCst) {
            return Ok(OFFLINE_REPLY);
        }
        let mut link = self.link.lock().unwrap();
        self.connect_if_needed(&mut link)?;
        let index = self.settings.read().unwrap().machine_index;
        let Some(connection) = link.connection.as_mut() else {
            return Ok(OFFLINE_REPLY);
        };
        if let Err(e) = connection.write(index, data) {
            debug!("write failed: {e}");
            return Ok(OFFLINE_REPLY);
        }
        if !read {
            return Ok([0; 4]);
        }
        match connection.read(index) {
            Ok(raw) => Ok(codec::reply_words(&raw)),
            Err(e) => {
                debug!("read failed: {e}");
                Ok(OFFLINE_REPLY)
            }
        }
    }

    fn send_realtime(&self, op: u16, values: [u16; 5], read: bool) -> io::Result<[u16; 4]> {
        trace!("realtime {} {values:04x?}", single_command_name(op));
        self.send(&codec::command(op, values), read)
    }

    //
    // Wait state commands
    //

    pub fn status(&self) -> io::Result<u16> {
        Ok(self.get_version()?[3])
    }

    pub fn is_busy(&self) -> io::Result<bool> {
        Ok(self.status()? & STATUS_BUSY != 0)
    }

    pub fn is_ready(&self) -> io::Result<bool> {
        Ok(self.status()? & STATUS_READY != 0)
    }

    pub fn is_ready_and_not_busy(&self) -> io::Result<bool> {
        let status = self.status()?;
        Ok(status & STATUS_READY != 0 && status & STATUS_BUSY == 0)
    }

    pub fn wait_ready(&self) -> io::Result<()> {
        while !self.is_ready()? {
            thread::sleep(STATUS_POLL);
            if !self.sending.load(Ordering::SeqCst) || self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
        Ok(())
    }

    pub fn wait_finished(&self) -> io::Result<()> {
        while !self.is_ready_and_not_busy()? {
            thread::sleep(STATUS_POLL);
            if !self.sending.load(Ordering::SeqCst) || self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
        Ok(())
    }

    pub fn wait_idle(&self) -> io::Result<()> {
        while self.is_busy()? {
            thread::sleep(STATUS_POLL);
            if !self.sending.load(Ordering::SeqCst) || self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
        Ok(())
    }

    //
    // Mode shifts
    //

    /// Finish and execute any outstanding list program, close the MO gate
    /// and return to the idle configuration.
    pub fn initial_configuration(&self) -> io::Result<()> {
        let mut machine = self.machine.lock().unwrap();
        self.initial_configuration_locked(&mut machine)
    }

    fn initial_configuration_locked(&self, m: &mut Machine) -> io::Result<()> {
        if m.configuration == LaserConfiguration::Initial {
            return Ok(());
        }
        // Terminate the logical program before flushing.
        self.list_write_locked(m, LIST_END_OF_LIST, [0; 5])?;
        self.list_end_locked(m)?;
        if !m.list_executing && m.list_packets > 0 {
            self.send_realtime(EXECUTE_LIST, [0; 5], true)?;
        }
        m.list_executing = false;
        m.list_packets = 0;
        self.wait_idle()?;
        self.send_realtime(FIBER_SET_MO, [0; 5], true)?;
        let laser_pin = self.settings.read().unwrap().laser_pin;
        m.port_bits &= !(1u16 << laser_pin);
        self.write_port_locked(m)?;
        let marktime = self.send_realtime(GET_MARK_TIME, [3, 0, 0, 0, 0], true)?;
        debug!("time taken for list execution: {marktime:?}");
        m.configuration = LaserConfiguration::Initial;
        Ok(())
    }

    /// Open the MO gate and prepare a list program for marking.
    pub fn marking_configuration(&self) -> io::Result<()> {
        let mut machine = self.machine.lock().unwrap();
        self.marking_configuration_locked(&mut machine)
    }

    fn marking_configuration_locked(&self, m: &mut Machine) -> io::Result<()> {
        if m.configuration == LaserConfiguration::Marking {
            return Ok(());
        }
        let s = self.settings.read().unwrap().clone();
        if m.configuration == LaserConfiguration::Lighting {
            m.configuration = LaserConfiguration::Marking;
            m.port_bits &= !(1u16 << s.light_pin);
            m.port_bits |= 1u16 << s.laser_pin;
            self.write_port_locked(m)?;
            self.send_realtime(FIBER_SET_MO, [1, 0, 0, 0, 0], true)?;
        } else {
            m.configuration = LaserConfiguration::Marking;
            self.send_realtime(RESET_LIST, [0; 5], true)?;
            m.port_bits |= 1u16 << s.laser_pin;
            self.write_port_locked(m)?;
            self.send_realtime(FIBER_SET_MO, [1, 0, 0, 0, 0], true)?;
            m.cache = ParamCache::default();
            self.list_write_locked(m, LIST_READY_MARK, [0; 5])?;
            if s.delay_open_mo > 0.0 {
                // ms in 10 us units
                let settle = (s.delay_open_mo * 100.0) as u16;
                self.list_write_locked(m, LIST_DELAY_TIME, [settle, 0, 0, 0, 0])?;
            }
            self.list_write_port_locked(m)?;
        }
        self.set_locked(m, ParameterOverrides::default())
    }

    /// Switch the guide beam on for laser-off tracing.
    pub fn lighting_configuration(&self) -> io::Result<()> {
        let mut machine = self.machine.lock().unwrap();
        self.lighting_configuration_locked(&mut machine)
    }

    fn lighting_configuration_locked(&self, m: &mut Machine) -> io::Result<()> {
        if m.configuration == LaserConfiguration::Lighting {
            return Ok(());
        }
        let s = self.settings.read().unwrap().clone();
        if m.configuration == LaserConfiguration::Marking {
            self.send_realtime(FIBER_SET_MO, [0; 5], true)?;
            m.port_bits &= !(1u16 << s.laser_pin);
            m.port_bits |= 1u16 << s.light_pin;
            self.write_port_locked(m)?;
        } else {
            m.cache = ParamCache::default();
            self.send_realtime(RESET_LIST, [0; 5], true)?;
            self.list_write_locked(m, LIST_READY_MARK, [0; 5])?;
            m.port_bits &= !(1u16 << s.laser_pin);
            m.port_bits |= 1u16 << s.light_pin;
            self.list_write_port_locked(m)?;
        }
        m.configuration = LaserConfiguration::Lighting;
        Ok(())
    }

    /// Run `f` in the marking configuration, restoring the initial
    /// configuration on every exit path.
    pub fn marking<T>(&self, f: impl FnOnce(&Self) -> io::Result<T>) -> io::Result<T> {
        self.marking_configuration()?;
        let _restore = RestoreInitial(self);
        f(self)
    }

    /// Run `f` in the lighting configuration, restoring the initial
    /// configuration on every exit path.
    pub fn lighting<T>(&self, f: impl FnOnce(&Self) -> io::Result<T>) -> io::Result<T> {
        self.lighting_configuration()?;
        let _restore = RestoreInitial(self);
        f(self)
    }

    //
    // Laser parameter set
    //

    /// Send the configured laser parameters through the cache; only values
    /// differing from the last transmission are emitted.
    pub fn set(&self) -> io::Result<()> {
        self.set_with(ParameterOverrides::default())
    }

    pub fn set_with(&self, overrides: ParameterOverrides) -> io::Result<()> {
        let mut machine = self.machine.lock().unwrap();
        self.set_locked(&mut machine, overrides)
    }

    fn set_locked(&self, m: &mut Machine, o: ParameterOverrides) -> io::Result<()> {
        let s = self.settings.read().unwrap().clone();
        let mark_speed = o.mark_speed.unwrap_or(s.mark_speed);
        let travel_speed = o.travel_speed.unwrap_or(s.travel_speed);
        let power = o.power.unwrap_or(s.power);
        let frequency = o.frequency.unwrap_or(s.frequency);
        let pulse_width = o.pulse_width.or(s.pulse_width);
        let fpk = o.fpk.unwrap_or(s.fpk);
        let delay_on = o.delay_on.unwrap_or(s.delay_laser_on);
        let delay_off = o.delay_off.unwrap_or(s.delay_laser_off);
        let delay_polygon = o.delay_polygon.unwrap_or(s.delay_polygon);

        if s.source == LaserSource::Fiber {
            if let Some(width) = pulse_width {
                self.set_pulse_width_locked(m, width)?;
            }
        }
        self.set_travel_speed_locked(m, travel_speed)?;
        // Frequency first: the CO2 power and fpk words embed the period.
        self.set_frequency_locked(m, frequency)?;
        self.set_power_locked(m, power)?;
        if s.source == LaserSource::Co2 {
            self.set_fpk_locked(m, fpk)?;
        }
        self.set_mark_speed_locked(m, mark_speed)?;
        self.set_delay_on_locked(m, delay_on)?;
        self.set_delay_off_locked(m, delay_off)?;
        self.set_delay_polygon_locked(m, delay_polygon)
    }

    pub fn set_travel_speed(&self, speed: f64) -> io::Result<()> {
        let mut machine = self.machine.lock().unwrap();
        self.set_travel_speed_locked(&mut machine, speed)
    }

    fn set_travel_speed_locked(&self, m: &mut Machine, speed: f64) -> io::Result<()> {
        if m.cache.travel_speed == Some(speed) || speed == 0.0 {
            return Ok(());
        }
        let galvos_per_mm = self.settings.read().unwrap().galvos_per_mm;
        m.cache.travel_speed = Some(speed);
        let converted = codec::speed_to_galvo(speed, galvos_per_mm);
        self.list_write_locked(m, LIST_JUMP_SPEED, [converted, 0, 0, 0, 0])
    }

    pub fn set_mark_speed(&self, speed: f64) -> io::Result<()> {
        let mut machine = self.machine.lock().unwrap();
        self.set_mark_speed_locked(&mut machine, speed)
    }

    fn set_mark_speed_locked(&self, m: &mut Machine, speed: f64) -> io::Result<()> {
        if m.cache.mark_speed == Some(speed) {
            return Ok(());
        }
        let galvos_per_mm = self.settings.read().unwrap().galvos_per_mm;
        m.cache.mark_speed = Some(speed);
        let converted = codec::speed_to_galvo(speed, galvos_per_mm);
        self.list_write_locked(m, LIST_MARK_SPEED, [converted, 0, 0, 0, 0])
    }

    pub fn set_power(&self, power: f64) -> io::Result<()> {
        let mut machine = self.machine.lock().unwrap();
        self.set_power_locked(&mut machine, power)
    }

    fn set_power_locked(&self, m: &mut Machine, power: f64) -> io::Result<()> {
        if m.cache.power == Some(power) {
            return Ok(());
        }
        let s = self.settings.read().unwrap().clone();
        m.cache.power = Some(power);
        match s.source {
            LaserSource::Fiber => {
                let ratio = codec::power_to_ratio(power);
                self.list_write_locked(m, LIST_MARK_CURRENT, [ratio, 0, 0, 0, 0])
            }
            LaserSource::Co2 => {
                let khz = m.cache.frequency.unwrap_or(s.frequency);
                let ratio = codec::co2_power_ratio(power, khz);
                self.list_write_locked(m, LIST_MARK_POWER_RATIO, [ratio, 0, 0, 0, 0])
            }
        }
    }

    pub fn set_frequency(&self, khz: f64) -> io::Result<()> {
        let mut machine = self.machine.lock().unwrap();
        self.set_frequency_locked(&mut machine, khz)
    }

    fn set_frequency_locked(&self, m: &mut Machine, khz: f64) -> io::Result<()> {
        if m.cache.frequency == Some(khz) {
            return Ok(());
        }
        let source = self.settings.read().unwrap().source;
        m.cache.frequency = Some(khz);
        match source {
            LaserSource::Fiber => {
                let period = codec::freq_to_qperiod(khz);
                self.list_write_locked(m, LIST_QSWITCH_PERIOD, [period, 0, 0, 0, 0])
            }
            LaserSource::Co2 => {
                // Period-derived words go stale with the frequency.
                m.cache.power = None;
                m.cache.fpk = None;
                let freq = codec::co2_mark_freq(khz);
                self.list_write_locked(m, LIST_MARK_FREQ, [freq, 0, 0, 0, 0])
            }
        }
    }

    /// CO2 first-pulse-killer as a percentage of the pulse period.
    pub fn set_fpk(&self, fpk: f64) -> io::Result<()> {
        let mut machine = self.machine.lock().unwrap();
        self.set_fpk_locked(&mut machine, fpk)
    }

    fn set_fpk_locked(&self, m: &mut Machine, fpk: f64) -> io::Result<()> {
        if m.cache.fpk == Some(fpk) {
            return Ok(());
        }
        let s = self.settings.read().unwrap().clone();
        if s.source != LaserSource::Co2 {
            return Ok(());
        }
        let khz = m.cache.frequency.unwrap_or(s.frequency);
        m.cache.fpk = Some(fpk);
        let value = codec::co2_fpk(fpk, khz);
        self.list_write_locked(m, LIST_SET_CO2_FPK, [value, 0, 0, 0, 0])
    }

    pub fn set_pulse_width(&self, width: u16) -> io::Result<()> {
        let mut machine = self.machine.lock().unwrap();
        self.set_pulse_width_locked(&mut machine, width)
    }

    fn set_pulse_width_locked(&self, m: &mut Machine, width: u16) -> io::Result<()> {
        if m.cache.pulse_width == Some(width) {
            return Ok(());
        }
        m.cache.pulse_width = Some(width);
        self.list_write_locked(m, LIST_FIBER_YLPM_PULSE_WIDTH, [width, 0, 0, 0, 0])
    }

    pub fn set_delay_on(&self, delay: f64) -> io::Result<()> {
        let mut machine = self.machine.lock().unwrap();
        self.set_delay_on_locked(&mut machine, delay)
    }

    fn set_delay_on_locked(&self, m: &mut Machine, delay: f64) -> io::Result<()> {
        if m.cache.delay_on == Some(delay) {
            return Ok(());
        }
        m.cache.delay_on = Some(delay);
        let (magnitude, sign) = codec::delay_words(delay);
        self.list_write_locked(m, LIST_LASER_ON_DELAY, [magnitude, sign, 0, 0, 0])
    }

    pub fn set_delay_off(&self, delay: f64) -> io::Result<()> {
        let mut machine = self.machine.lock().unwrap();
        self.set_delay_off_locked(&mut machine, delay)
    }

    fn set_delay_off_locked(&self, m: &mut Machine, delay: f64) -> io::Result<()> {
        if m.cache.delay_off == Some(delay) {
            return Ok(());
        }
        m.cache.delay_off = Some(delay);
        let (magnitude, sign) = codec::delay_words(delay);
        self.list_write_locked(m, LIST_LASER_OFF_DELAY, [magnitude, sign, 0, 0, 0])
    }

    pub fn set_delay_polygon(&self, delay: f64) -> io::Result<()> {
        let mut machine = self.machine.lock().unwrap();
        self.set_delay_polygon_locked(&mut machine, delay)
    }

    fn set_delay_polygon_locked(&self, m: &mut Machine, delay: f64) -> io::Result<()> {
        if m.cache.delay_poly == Some(delay) {
            return Ok(());
        }
        m.cache.delay_poly = Some(delay);
        let (magnitude, sign) = codec::delay_words(delay);
        self.list_write_locked(m, LIST_POLYGON_DELAY, [magnitude, sign, 0, 0, 0])
    }

    pub fn set_delay_jump(&self, delay: f64) -> io::Result<()> {
        let mut machine = self.machine.lock().unwrap();
        self.set_delay_jump_locked(&mut machine, delay)
    }

    fn set_delay_jump_locked(&self, m: &mut Machine, delay: f64) -> io::Result<()> {
        if m.cache.delay_jump == Some(delay) {
            return Ok(());
        }
        m.cache.delay_jump = Some(delay);
        let (magnitude, sign) = codec::delay_words(delay);
        self.list_write_locked(m, LIST_JUMP_DELAY, [magnitude, sign, 0, 0, 0])
    }

    //
    // Plot-like shortcuts
    //

    fn in_range(x: i32, y: i32) -> bool {
        (0..=0xFFFF).contains(&x) && (0..=0xFFFF).contains(&y)
    }

    fn at_position(m: &Machine, x: i32, y: i32) -> bool {
        x == m.last_x as i32 && y == m.last_y as i32
    }

    fn euclid(m: &Machine, x: u16, y: u16) -> f64 {
        let dx = x as f64 - m.last_x as f64;
        let dy = y as f64 - m.last_y as f64;
        (dx * dx + dy * dy).sqrt()
    }

    fn clamped_distance(m: &Machine, x: u16, y: u16) -> u16 {
        let distance = Self::euclid(m, x, y).round();
        if distance > 65535.0 { 0xFFFF } else { distance as u16 }
    }

    /// Laser-on move. Out-of-range targets and moves to the current
    /// position are silently dropped.
    pub fn mark(&self, x: i32, y: i32) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        if Self::at_position(&m, x, y) || !Self::in_range(x, y) {
            return Ok(());
        }
        self.list_mark_locked(&mut m, x as u16, y as u16, 0)
    }

    /// Laser-off move at travel speed.
    pub fn goto(&self, x: i32, y: i32) -> io::Result<()> {
        self.goto_with(x, y, None, None, None)
    }

    pub fn goto_with(
        &self,
        x: i32,
        y: i32,
        long: Option<f64>,
        short: Option<f64>,
        distance_limit: Option<f64>,
    ) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        if Self::at_position(&m, x, y) || !Self::in_range(x, y) {
            return Ok(());
        }
        let s = self.settings.read().unwrap().clone();
        if let Some(speed) = s.goto_speed {
            self.set_travel_speed_locked(&mut m, speed)?;
        }
        self.jump_with_delay(&mut m, x as u16, y as u16, long, short, distance_limit, &s)
    }

    /// Move with the guide beam lit, switching it on first if needed.
    pub fn light(&self, x: i32, y: i32) -> io::Result<()> {
        self.light_with(x, y, None, None, None)
    }

    pub fn light_with(
        &self,
        x: i32,
        y: i32,
        long: Option<f64>,
        short: Option<f64>,
        distance_limit: Option<f64>,
    ) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        if Self::at_position(&m, x, y) || !Self::in_range(x, y) {
            return Ok(());
        }
        let s = self.settings.read().unwrap().clone();
        if Self::port_bit_set(&mut m, s.light_pin, true) {
            self.list_write_port_locked(&mut m)?;
        }
        if let Some(speed) = s.light_speed {
            self.set_travel_speed_locked(&mut m, speed)?;
        }
        self.jump_with_delay(&mut m, x as u16, y as u16, long, short, distance_limit, &s)
    }

    /// Move with the guide beam dark, switching it off first if needed.
    pub fn dark(&self, x: i32, y: i32) -> io::Result<()> {
        self.dark_with(x, y, None, None, None)
    }

    pub fn dark_with(
        &self,
        x: i32,
        y: i32,
        long: Option<f64>,
        short: Option<f64>,
        distance_limit: Option<f64>,
    ) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        if Self::at_position(&m, x, y) || !Self::in_range(x, y) {
            return Ok(());
        }
        let s = self.settings.read().unwrap().clone();
        if Self::port_bit_set(&mut m, s.light_pin, false) {
            self.list_write_port_locked(&mut m)?;
        }
        if let Some(speed) = s.dark_speed {
            self.set_travel_speed_locked(&mut m, speed)?;
        }
        self.jump_with_delay(&mut m, x as u16, y as u16, long, short, distance_limit, &s)
    }

    #[allow(clippy::too_many_arguments)]
    fn jump_with_delay(
        &self,
        m: &mut Machine,
        x: u16,
        y: u16,
        long: Option<f64>,
        short: Option<f64>,
        distance_limit: Option<f64>,
        s: &Settings,
    ) -> io::Result<()> {
        let long = long.unwrap_or(s.delay_jump_long);
        let short = short.unwrap_or(s.delay_jump_short);
        let distance = Self::euclid(m, x, y);
        let delay = match distance_limit {
            Some(limit) if distance > limit => long,
            _ => short,
        };
        if delay != 0.0 {
            self.set_delay_jump_locked(m, delay)?;
        }
        self.list_jump_locked(m, x, y, 0)
    }

    /// Fire the laser in place. Chunks over 600 ms are split; the time is
    /// expressed to the board in 10 us units.
    pub fn dwell(&self, time_ms: f64) -> io::Result<()> {
        self.dwell_with(time_ms, true)
    }

    pub fn dwell_with(&self, time_ms: f64, delay_end: bool) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        let mut remaining = (time_ms * 100.0).round() as i64;
        while remaining > 0 {
            let chunk = remaining.min(60000);
            self.list_write_locked(&mut m, LIST_LASER_ON_POINT, [chunk as u16, 0, 0, 0, 0])?;
            remaining -= chunk;
        }
        if delay_end {
            let settle = (self.settings.read().unwrap().delay_end / 10.0) as u16;
            self.list_write_locked(&mut m, LIST_DELAY_TIME, [settle, 0, 0, 0, 0])?;
        }
        Ok(())
    }

    /// Pause the list program for the given time, laser off.
    pub fn wait(&self, time_ms: f64) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        let mut remaining = (time_ms * 100.0).round() as i64;
        while remaining > 0 {
            let chunk = remaining.min(60000);
            self.list_write_locked(&mut m, LIST_DELAY_TIME, [chunk as u16, 0, 0, 0, 0])?;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Drop to the initial configuration, poll the input port until the
    /// masked bits repeatedly match `value`, then enter marking.
    pub fn wait_for_input(&self, mask: u16, value: u16) -> io::Result<()> {
        self.initial_configuration()?;
        self.wait_for_input_protocol(mask, value)?;
        self.marking_configuration()
    }

    fn wait_for_input_protocol(&self, mask: u16, value: u16) -> io::Result<()> {
        let s = self.settings.read().unwrap().clone();
        let required = s.input_passes_required;
        let mut passes = 0;
        loop {
            if self.shutdown.load(Ordering::SeqCst) || self.aborting.load(Ordering::SeqCst) {
                return Ok(());
            }
            let bits = {
                let mut link = self.link.lock().unwrap();
                match link.connection.as_mut() {
                    None => return Ok(()),
                    Some(connection) if connection.is_shutdown() => return Ok(()),
                    Some(connection) => connection.read_port(s.machine_index)?[1],
                }
            };
            let mut all_matched = true;
            for i in 0..16 {
                if (mask >> i) & 1 == 0 {
                    continue;
                }
                if (value >> i) & 1 != (bits >> i) & 1 {
                    all_matched = false;
                    break;
                }
            }
            if all_matched {
                passes += 1;
                if passes >= required {
                    return Ok(());
                }
            } else {
                passes = 0;
                thread::sleep(INPUT_POLL);
            }
        }
    }

    /// Immediate reposition outside of list context.
    pub fn set_xy(&self, x: u16, y: u16) -> io::Result<[u16; 4]> {
        let mut m = self.machine.lock().unwrap();
        let distance = Self::clamped_distance(&m, x, y);
        self.goto_xy_locked(&mut m, x, y, 0, distance)
    }

    pub fn get_last_xy(&self) -> (u16, u16) {
        let m = self.machine.lock().unwrap();
        (m.last_x, m.last_y)
    }

    //
    // GPIO toggles
    //

    /// Returns whether the set actually changed anything.
    fn port_bit_set(m: &mut Machine, bit: u8, on: bool) -> bool {
        let mask = 1u16 << bit;
        let was_on = m.port_bits & mask != 0;
        if on {
            m.port_bits |= mask;
        } else {
            m.port_bits &= !mask;
        }
        was_on != on
    }

    /// Turn the guide beam bit on; true if the state changed.
    pub fn light_on(&self) -> bool {
        let pin = self.settings.read().unwrap().light_pin;
        let mut m = self.machine.lock().unwrap();
        Self::port_bit_set(&mut m, pin, true)
    }

    /// Turn the guide beam bit off; true if the state changed.
    pub fn light_off(&self) -> bool {
        let pin = self.settings.read().unwrap().light_pin;
        let mut m = self.machine.lock().unwrap();
        Self::port_bit_set(&mut m, pin, false)
    }

    pub fn is_port(&self, bit: u8) -> bool {
        self.machine.lock().unwrap().port_bits & (1u16 << bit) != 0
    }

    pub fn port_on(&self, bit: u8) {
        let mut m = self.machine.lock().unwrap();
        Self::port_bit_set(&mut m, bit, true);
    }

    pub fn port_off(&self, bit: u8) {
        let mut m = self.machine.lock().unwrap();
        Self::port_bit_set(&mut m, bit, false);
    }

    /// Replace the masked bits with `values`.
    pub fn port_set(&self, mask: u16, values: u16) {
        let mut m = self.machine.lock().unwrap();
        m.port_bits &= !mask;
        m.port_bits |= values & mask;
    }

    pub fn port_bits(&self) -> u16 {
        self.machine.lock().unwrap().port_bits
    }

    //
    // Abort / pause / resume
    //

    /// Stop execution, reset the list machinery and return to the initial
    /// configuration. A dummy packet is queued so the board observes a
    /// terminated program.
    pub fn abort(&self) -> io::Result<()> {
        self.abort_with(true)
    }

    pub fn abort_with(&self, dummy_packet: bool) -> io::Result<()> {
        self.aborting.store(true, Ordering::SeqCst);
        let mut m = self.machine.lock().unwrap();
        let result = self.abort_locked(&mut m, dummy_packet);
        self.aborting.store(false, Ordering::SeqCst);
        result
    }

    fn abort_locked(&self, m: &mut Machine, dummy_packet: bool) -> io::Result<()> {
        self.send_realtime(STOP_EXECUTE, [0; 5], true)?;
        self.send_realtime(FIBER_SET_MO, [0; 5], true)?;
        self.send_realtime(RESET_LIST, [0; 5], true)?;
        if dummy_packet {
            Self::list_new(m);
            self.list_write_locked(m, LIST_END_OF_LIST, [0; 5])?;
            self.list_end_locked(m)?;
            if !m.list_executing {
                self.send_realtime(EXECUTE_LIST, [0; 5], true)?;
            }
        }
        m.list_executing = false;
        m.list_packets = 0;
        self.send_realtime(FIBER_SET_MO, [0; 5], true)?;
        let laser_pin = self.settings.read().unwrap().laser_pin;
        m.port_bits &= !(1u16 << laser_pin);
        self.write_port_locked(m)?;
        m.configuration = LaserConfiguration::Initial;
        Ok(())
    }

    pub fn pause(&self) -> io::Result<()> {
        self.paused.store(true, Ordering::SeqCst);
        self.send_realtime(STOP_LIST, [0; 5], true)?;
        Ok(())
    }

    pub fn resume(&self) -> io::Result<()> {
        self.send_realtime(RESTART_LIST, [0; 5], true)?;
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    //
    // List management
    //

    fn list_new(m: &mut Machine) {
        let mut buf = Box::new([0u8; LIST_PACKET_SIZE]);
        for chunk in buf.chunks_exact_mut(COMMAND_SIZE) {
            chunk.copy_from_slice(&NOP_WORD);
        }
        m.active_list = Some(buf);
        m.active_index = 0;
    }

    fn list_write_locked(&self, m: &mut Machine, op: u16, values: [u16; 5]) -> io::Result<()> {
        if m.active_index >= LIST_PACKET_SIZE {
            self.list_end_locked(m)?;
        }
        if m.active_list.is_none() {
            Self::list_new(m);
        }
        trace!("list {} {values:04x?}", list_command_name(op));
        let index = m.active_index;
        let buf = m.active_list.as_mut().unwrap();
        buf[index..index + COMMAND_SIZE].copy_from_slice(&codec::command(op, values));
        m.active_index += COMMAND_SIZE;
        Ok(())
    }

    /// Flush the active packet: wait for READY, honor a pause, transmit
    /// the full 0xC00 bytes and seal it with `SetEndOfList`. Execution is
    /// kicked off once more than two packets have been queued.
    fn list_end_locked(&self, m: &mut Machine) -> io::Result<()> {
        if m.active_list.is_none() || m.active_index == 0 {
            return Ok(());
        }
        self.wait_ready()?;
        while self.paused.load(Ordering::SeqCst) {
            if !self.sending.load(Ordering::SeqCst) || self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(PAUSE_POLL);
        }
        let packet = m.active_list.take().unwrap();
        m.active_index = 0;
        self.send(&packet[..], false)?;
        self.send_realtime(SET_END_OF_LIST, [0; 5], true)?;
        m.list_packets += 1;
        if m.list_packets > 2 && !m.list_executing {
            self.send_realtime(EXECUTE_LIST, [0; 5], true)?;
            m.list_executing = true;
        }
        Ok(())
    }

    //
    // Raw list commands
    //

    pub fn list_jump(&self, x: u16, y: u16) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_jump_locked(&mut m, x, y, 0)
    }

    fn list_jump_locked(&self, m: &mut Machine, x: u16, y: u16, angle: u16) -> io::Result<()> {
        let distance = Self::clamped_distance(m, x, y);
        self.list_write_locked(m, LIST_JUMP_TO, [x, y, angle, distance, 0])?;
        m.last_x = x;
        m.last_y = y;
        Ok(())
    }

    pub fn list_mark(&self, x: u16, y: u16) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_mark_locked(&mut m, x, y, 0)
    }

    fn list_mark_locked(&self, m: &mut Machine, x: u16, y: u16, angle: u16) -> io::Result<()> {
        let distance = Self::clamped_distance(m, x, y);
        self.list_write_locked(m, LIST_MARK_TO, [x, y, angle, distance, 0])?;
        m.last_x = x;
        m.last_y = y;
        Ok(())
    }

    /// Terminating sentinel of a logical list program.
    pub fn list_end_of_list(&self) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_write_locked(&mut m, LIST_END_OF_LIST, [0; 5])
    }

    /// Dwell in 10 us units, at most 60000 per word.
    pub fn list_laser_on_point(&self, dwell_time: u16) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_write_locked(&mut m, LIST_LASER_ON_POINT, [dwell_time, 0, 0, 0, 0])
    }

    /// Delay in 10 us units.
    pub fn list_delay_time(&self, time: f64) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        let (magnitude, _) = codec::delay_words(time);
        self.list_write_locked(&mut m, LIST_DELAY_TIME, [magnitude, 0, 0, 0, 0])
    }

    pub fn list_jump_speed(&self, speed: u16) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_write_locked(&mut m, LIST_JUMP_SPEED, [speed, 0, 0, 0, 0])
    }

    pub fn list_mark_speed(&self, speed: u16) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_write_locked(&mut m, LIST_MARK_SPEED, [speed, 0, 0, 0, 0])
    }

    /// Laser-on delay in microseconds; negative values carry a sign word.
    pub fn list_laser_on_delay(&self, delay: f64) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        let (magnitude, sign) = codec::delay_words(delay);
        self.list_write_locked(&mut m, LIST_LASER_ON_DELAY, [magnitude, sign, 0, 0, 0])
    }

    /// Laser-off delay in microseconds.
    pub fn list_laser_off_delay(&self, delay: f64) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        let (magnitude, sign) = codec::delay_words(delay);
        self.list_write_locked(&mut m, LIST_LASER_OFF_DELAY, [magnitude, sign, 0, 0, 0])
    }

    pub fn list_jump_delay(&self, delay: f64) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        let (magnitude, sign) = codec::delay_words(delay);
        self.list_write_locked(&mut m, LIST_JUMP_DELAY, [magnitude, sign, 0, 0, 0])
    }

    pub fn list_polygon_delay(&self, delay: f64) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        let (magnitude, sign) = codec::delay_words(delay);
        self.list_write_locked(&mut m, LIST_POLYGON_DELAY, [magnitude, sign, 0, 0, 0])
    }

    /// Emit the current output port bits into the list stream.
    pub fn list_write_port(&self) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_write_port_locked(&mut m)
    }

    fn list_write_port_locked(&self, m: &mut Machine) -> io::Result<()> {
        let bits = m.port_bits;
        self.list_write_locked(m, LIST_WRITE_PORT, [bits, 0, 0, 0, 0])
    }

    /// CO2 mark frequency word.
    pub fn list_mark_frequency(&self, frequency: u16) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_write_locked(&mut m, LIST_MARK_FREQ, [frequency, 0, 0, 0, 0])
    }

    pub fn list_mark_power_ratio(&self, power_ratio: u16) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_write_locked(&mut m, LIST_MARK_POWER_RATIO, [power_ratio, 0, 0, 0, 0])
    }

    pub fn list_mark_current(&self, current: u16) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_write_locked(&mut m, LIST_MARK_CURRENT, [current, 0, 0, 0, 0])
    }

    /// Unknown semantics on all surveyed boards.
    pub fn list_mark_frequency_2(&self, _frequency: u16) -> io::Result<()> {
        Err(unsupported("listMarkFreq2"))
    }

    /// Unknown semantics on all surveyed boards.
    pub fn list_direct_laser_switch(&self) -> io::Result<()> {
        Err(unsupported("listDirectLaserSwitch"))
    }

    pub fn list_fly_enable(&self, enabled: u16) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_write_locked(&mut m, LIST_FLY_ENABLE, [enabled, 0, 0, 0, 0])
    }

    pub fn list_qswitch_period(&self, qswitch: u16) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_write_locked(&mut m, LIST_QSWITCH_PERIOD, [qswitch, 0, 0, 0, 0])
    }

    pub fn list_fly_delay(&self, delay: f64) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        let (magnitude, sign) = codec::delay_words(delay);
        self.list_write_locked(&mut m, LIST_FLY_DELAY, [magnitude, sign, 0, 0, 0])
    }

    pub fn list_set_co2_fpk(&self, fpk: u16) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_write_locked(&mut m, LIST_SET_CO2_FPK, [fpk, 0, 0, 0, 0])
    }

    pub fn list_fly_wait_input(&self) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_write_locked(&mut m, LIST_FLY_WAIT_INPUT, [0; 5])
    }

    /// Open (1) or close (0) the MO gate from within the list.
    pub fn list_fiber_open_mo(&self, open_mo: u16) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_write_locked(&mut m, LIST_FIBER_OPEN_MO, [open_mo, 0, 0, 0, 0])
    }

    pub fn list_wait_for_input(&self, wait_mask: u16, wait_level: u16) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_write_locked(&mut m, LIST_WAIT_FOR_INPUT, [wait_mask, wait_level, 0, 0, 0])
    }

    pub fn list_change_mark_count(&self, count: u16) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_write_locked(&mut m, LIST_CHANGE_MARK_COUNT, [count, 0, 0, 0, 0])
    }

    pub fn list_set_weld_power_wave(&self, wave: u16) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_write_locked(&mut m, LIST_SET_WELD_POWER_WAVE, [wave, 0, 0, 0, 0])
    }

    pub fn list_enable_weld_power_wave(&self, enabled: u16) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_write_locked(&mut m, LIST_ENABLE_WELD_POWER_WAVE, [enabled, 0, 0, 0, 0])
    }

    pub fn list_fiber_ylpm_pulse_width(&self, pulse_width: u16) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_write_locked(&mut m, LIST_FIBER_YLPM_PULSE_WIDTH, [pulse_width, 0, 0, 0, 0])
    }

    pub fn list_fly_encoder_count(&self, count: u16) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_write_locked(&mut m, LIST_FLY_ENCODER_COUNT, [count, 0, 0, 0, 0])
    }

    pub fn list_set_da_z_word(&self, word: u16) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_write_locked(&mut m, LIST_SET_DA_Z_WORD, [word, 0, 0, 0, 0])
    }

    pub fn list_jpt_set_param(&self, param: u16) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_write_locked(&mut m, LIST_JPT_SET_PARAM, [param, 0, 0, 0, 0])
    }

    /// Seen at the start of any new command list.
    pub fn list_ready(&self) -> io::Result<()> {
        let mut m = self.machine.lock().unwrap();
        self.list_write_locked(&mut m, LIST_READY_MARK, [0; 5])
    }

    //
    // Raw realtime commands
    //

    pub fn disable_laser(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(DISABLE_LASER, [0; 5], true)
    }

    pub fn enable_laser(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(ENABLE_LASER, [0; 5], true)
    }

    pub fn execute_list(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(EXECUTE_LIST, [0; 5], true)
    }

    pub fn set_pwm_pulse_width(&self, pulse_width: u16) -> io::Result<[u16; 4]> {
        self.send_realtime(SET_PWM_PULSE_WIDTH, [pulse_width, 0, 0, 0, 0], true)
    }

    pub fn get_version(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(GET_VERSION, [0; 5], true)
    }

    pub fn get_serial_number(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(GET_SERIAL_NO, [0; 5], true)
    }

    pub fn get_list_status(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(GET_LIST_STATUS, [0; 5], true)
    }

    pub fn get_position_xy(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(GET_POSITION_XY, [0; 5], true)
    }

    pub fn goto_xy(&self, x: u16, y: u16, angle: u16, distance: u16) -> io::Result<[u16; 4]> {
        let mut m = self.machine.lock().unwrap();
        self.goto_xy_locked(&mut m, x, y, angle, distance)
    }

    fn goto_xy_locked(
        &self,
        m: &mut Machine,
        x: u16,
        y: u16,
        angle: u16,
        distance: u16,
    ) -> io::Result<[u16; 4]> {
        m.last_x = x;
        m.last_y = y;
        self.send_realtime(GOTO_XY, [x, y, angle, distance, 0], true)
    }

    pub fn laser_signal_off(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(LASER_SIGNAL_OFF, [0; 5], true)
    }

    pub fn laser_signal_on(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(LASER_SIGNAL_ON, [0; 5], true)
    }

    pub fn write_cor_line(&self, dx: u16, dy: u16, non_first: u16) -> io::Result<()> {
        self.send_realtime(WRITE_COR_LINE, [dx, dy, non_first, 0, 0], false)
            .map(|_| ())
    }

    pub fn reset_list(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(RESET_LIST, [0; 5], true)
    }

    pub fn restart_list(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(RESTART_LIST, [0; 5], true)
    }

    pub fn write_cor_table(&self, have_table: bool) -> io::Result<[u16; 4]> {
        self.send_realtime(WRITE_COR_TABLE, [have_table as u16, 0, 0, 0, 0], true)
    }

    pub fn set_control_mode(&self, mode: u16) -> io::Result<[u16; 4]> {
        self.send_realtime(SET_CONTROL_MODE, [mode, 0, 0, 0, 0], true)
    }

    pub fn set_delay_mode(&self, mode: u16) -> io::Result<[u16; 4]> {
        self.send_realtime(SET_DELAY_MODE, [mode, 0, 0, 0, 0], true)
    }

    pub fn set_max_poly_delay(&self, delay: f64) -> io::Result<[u16; 4]> {
        let (magnitude, sign) = codec::delay_words(delay);
        self.send_realtime(SET_MAX_POLY_DELAY, [magnitude, sign, 0, 0, 0], true)
    }

    pub fn set_end_of_list(&self, end: u16) -> io::Result<[u16; 4]> {
        self.send_realtime(SET_END_OF_LIST, [end, 0, 0, 0, 0], true)
    }

    pub fn set_first_pulse_killer(&self, fpk: u16) -> io::Result<[u16; 4]> {
        self.send_realtime(SET_FIRST_PULSE_KILLER, [fpk, 0, 0, 0, 0], true)
    }

    pub fn set_laser_mode(&self, mode: u16) -> io::Result<[u16; 4]> {
        self.send_realtime(SET_LASER_MODE, [mode, 0, 0, 0, 0], true)
    }

    pub fn set_timing(&self, timing: u16) -> io::Result<[u16; 4]> {
        self.send_realtime(SET_TIMING, [timing, 0, 0, 0, 0], true)
    }

    pub fn set_standby(&self, standby1: u16, standby2: u16) -> io::Result<[u16; 4]> {
        self.send_realtime(SET_STANDBY, [standby1, standby2, 0, 0, 0], true)
    }

    pub fn set_pwm_half_period(&self, half_period: u16) -> io::Result<[u16; 4]> {
        self.send_realtime(SET_PWM_HALF_PERIOD, [half_period, 0, 0, 0, 0], true)
    }

    pub fn stop_execute(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(STOP_EXECUTE, [0; 5], true)
    }

    pub fn stop_list(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(STOP_LIST, [0; 5], true)
    }

    /// Push the current output port bits to the board.
    pub fn write_port(&self) -> io::Result<[u16; 4]> {
        let m = self.machine.lock().unwrap();
        self.write_port_locked(&m)
    }

    fn write_port_locked(&self, m: &Machine) -> io::Result<[u16; 4]> {
        self.send_realtime(WRITE_PORT, [m.port_bits, 0, 0, 0, 0], true)
    }

    pub fn write_analog_port_1(&self, port: u16) -> io::Result<[u16; 4]> {
        self.send_realtime(WRITE_ANALOG_PORT_1, [port, 0, 0, 0, 0], true)
    }

    pub fn write_analog_port_2(&self, port: u16) -> io::Result<[u16; 4]> {
        self.send_realtime(WRITE_ANALOG_PORT_2, [port, 0, 0, 0, 0], true)
    }

    pub fn write_analog_port_x(&self, port: u16) -> io::Result<[u16; 4]> {
        self.send_realtime(WRITE_ANALOG_PORT_X, [port, 0, 0, 0, 0], true)
    }

    pub fn read_port(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(READ_PORT, [0; 5], true)
    }

    pub fn set_axis_motion_param(&self, param: u16) -> io::Result<[u16; 4]> {
        self.send_realtime(SET_AXIS_MOTION_PARAM, [param, 0, 0, 0, 0], true)
    }

    pub fn set_axis_origin_param(&self, param: u16) -> io::Result<[u16; 4]> {
        self.send_realtime(SET_AXIS_ORIGIN_PARAM, [param, 0, 0, 0, 0], true)
    }

    pub fn axis_go_origin(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(AXIS_GO_ORIGIN, [0; 5], true)
    }

    pub fn move_axis_to(&self, position: u16) -> io::Result<[u16; 4]> {
        self.send_realtime(MOVE_AXIS_TO, [position, 0, 0, 0, 0], true)
    }

    pub fn get_axis_pos(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(GET_AXIS_POS, [0; 5], true)
    }

    pub fn get_fly_wait_count(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(GET_FLY_WAIT_COUNT, [0; 5], true)
    }

    pub fn get_mark_count(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(GET_MARK_COUNT, [0; 5], true)
    }

    pub fn set_fpk_param_2(&self, max_voltage: u16, min_voltage: u16, t1: u16, t2: u16) -> io::Result<[u16; 4]> {
        self.send_realtime(SET_FPK_PARAM_2, [max_voltage, min_voltage, t1, t2, 0], true)
    }

    pub fn set_fiber_mo(&self, mo: u16) -> io::Result<[u16; 4]> {
        self.send_realtime(FIBER_SET_MO, [mo, 0, 0, 0, 0], true)
    }

    pub fn get_fiber_st_mo_ap(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(FIBER_GET_ST_MO_AP, [0; 5], true)
    }

    pub fn enable_z(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(ENABLE_Z, [0; 5], true)
    }

    pub fn disable_z(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(DISABLE_Z, [0; 5], true)
    }

    pub fn set_z_data(&self, z_data: u16) -> io::Result<[u16; 4]> {
        self.send_realtime(SET_Z_DATA, [z_data, 0, 0, 0, 0], true)
    }

    pub fn set_spi_simmer_current(&self, current: u16) -> io::Result<[u16; 4]> {
        self.send_realtime(SET_SPI_SIMMER_CURRENT, [current, 0, 0, 0, 0], true)
    }

    pub fn set_fpk_param(&self, param: u16) -> io::Result<[u16; 4]> {
        self.send_realtime(SET_FPK_PARAM, [param, 0, 0, 0, 0], true)
    }

    pub fn reset(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(RESET, [0; 5], true)
    }

    pub fn get_fly_speed(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(GET_FLY_SPEED, [0; 5], true)
    }

    pub fn fiber_pulse_width(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(FIBER_PULSE_WIDTH, [0; 5], true)
    }

    pub fn get_fiber_config_extend(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(FIBER_GET_CONFIG_EXTEND, [0; 5], true)
    }

    pub fn input_port(&self, port: u16) -> io::Result<[u16; 4]> {
        self.send_realtime(INPUT_PORT, [port, 0, 0, 0, 0], true)
    }

    pub fn clear_lock_input_port(&self) -> io::Result<[u16; 4]> {
        self.input_port(0x04)
    }

    pub fn enable_lock_input_port(&self) -> io::Result<[u16; 4]> {
        self.input_port(0x02)
    }

    pub fn disable_lock_input_port(&self) -> io::Result<[u16; 4]> {
        self.input_port(0x01)
    }

    pub fn get_input_port(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(INPUT_PORT, [0; 5], true)
    }

    /// Payload 3 is the only value the board answers meaningfully.
    pub fn get_mark_time(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(GET_MARK_TIME, [3, 0, 0, 0, 0], true)
    }

    pub fn get_user_data(&self) -> io::Result<[u16; 4]> {
        self.send_realtime(GET_USER_DATA, [0; 5], true)
    }

    pub fn set_fly_res(&self, res1: u16, res2: u16, res3: u16, res4: u16) -> io::Result<[u16; 4]> {
        self.send_realtime(SET_FLY_RES, [res1, res2, res3, res4, 0], true)
    }
}

/// Drops back to the initial configuration when a scoped marking or
/// lighting block ends, however it ends.
struct RestoreInitial<'a>(&'a GalvoController);

impl Drop for RestoreInitial<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.0.initial_configuration() {
            warn!("failed to restore initial configuration: {e}");
        }
    }
}

fn refused(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionRefused, message)
}

fn unsupported(op: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, format!("{op} is not understood"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spooler::{Command, command_stream_job};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn mock_controller(settings: Settings) -> (Arc<GalvoController>, MockConnection) {
        let mock = MockConnection::new();
        let controller = GalvoController::with_connection(settings, Box::new(mock.clone()));
        (controller, mock)
    }

    fn flush(controller: &GalvoController) {
        let mut machine = controller.machine.lock().unwrap();
        controller.list_end_locked(&mut machine).unwrap();
    }

    fn count_op(words: &[[u16; 6]], op: u16) -> usize {
        words.iter().filter(|w| w[0] == op).count()
    }

    struct RefusingConnection;

    impl Connection for RefusingConnection {
        fn open(&mut self, _machine: usize) -> io::Result<()> {
            Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "nothing attached",
            ))
        }

        fn close(&mut self, _machine: usize) {}

        fn is_open(&self, _machine: usize) -> bool {
            false
        }

        fn write(&mut self, _machine: usize, _data: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::NotConnected, "not open"))
        }

        fn read(&mut self, _machine: usize) -> io::Result<[u8; REPLY_SIZE]> {
            Err(io::Error::new(io::ErrorKind::NotConnected, "not open"))
        }
    }

    #[test]
    fn init_laser_runs_fixed_sequence() {
        let (controller, mock) = mock_controller(Settings::default());
        controller.get_version().unwrap();
        let ops: Vec<u16> = mock.commands().iter().map(|w| w[0]).collect();
        let expected = [
            GET_SERIAL_NO,
            GET_VERSION,
            RESET,
            WRITE_COR_TABLE,
            ENABLE_LASER,
            SET_CONTROL_MODE,
            SET_LASER_MODE,
            SET_DELAY_MODE,
            SET_TIMING,
            SET_STANDBY,
            SET_FIRST_PULSE_KILLER,
            SET_PWM_HALF_PERIOD,
            SET_PWM_PULSE_WIDTH,
            FIBER_SET_MO,
            SET_FPK_PARAM_2,
            SET_FLY_RES,
            ENABLE_Z,
            WRITE_ANALOG_PORT_1,
            ENABLE_Z,
        ];
        assert_eq!(&ops[..expected.len()], &expected);
        // the command that triggered the lazy connect follows
        assert_eq!(ops[expected.len()], GET_VERSION);
    }

    #[test]
    fn mark_square_emits_one_jump_and_four_marks() {
        let (controller, mock) = mock_controller(Settings::default());
        controller
            .marking(|c| {
                c.goto(0x5000, 0x5000)?;
                c.mark(0x5000, 0xA000)?;
                c.mark(0xA000, 0xA000)?;
                c.mark(0x5000, 0xA000)?;
                c.mark(0x5000, 0x5000)
            })
            .unwrap();

        let words = mock.list_words();
        let jumps: Vec<_> = words.iter().filter(|w| w[0] == LIST_JUMP_TO).collect();
        let marks: Vec<_> = words.iter().filter(|w| w[0] == LIST_MARK_TO).collect();
        assert_eq!(jumps.len(), 1);
        assert_eq!(jumps[0][1], 0x5000);
        assert_eq!(jumps[0][2], 0x5000);
        let expected_jump_distance = (12288f64.hypot(12288.0)).round() as u16;
        assert_eq!(jumps[0][4], expected_jump_distance);
        assert_eq!(marks.len(), 4);
        for mark in &marks {
            assert_eq!(mark[4], 0x5000);
        }
        assert_eq!(mock.packets().len(), 1);
        let commands = mock.commands();
        assert_eq!(count_op(&commands, SET_END_OF_LIST), 1);
        assert_eq!(count_op(&commands, EXECUTE_LIST), 1);
    }

    #[test]
    fn redundant_and_out_of_range_moves_are_dropped() {
        let (controller, mock) = mock_controller(Settings::default());
        // pen starts at (0x8000, 0x8000)
        controller.mark(0x8000, 0x8000).unwrap();
        controller.mark(0x10000, 0x100).unwrap();
        controller.mark(-1, 0x100).unwrap();
        controller.goto(0x8000, 0x8000).unwrap();
        controller.light(0x8000, 0x8000).unwrap();
        controller.dark(0x8000, 0x8000).unwrap();
        flush(&controller);
        assert!(mock.packets().is_empty());
    }

    #[test]
    fn co2_source_emits_period_derived_words() {
        let mut settings = Settings::default();
        settings.source = LaserSource::Co2;
        settings.power = 20.0;
        settings.frequency = 10.0;
        settings.pulse_width = Some(4);
        let (controller, mock) = mock_controller(settings);
        controller.marking(|_| Ok(())).unwrap();

        let words = mock.list_words();
        assert!(words.iter().any(|w| w[0] == LIST_MARK_FREQ && w[1] == 0x03E8));
        assert!(
            words
                .iter()
                .any(|w| w[0] == LIST_MARK_POWER_RATIO && w[1] == 0x0190)
        );
        assert!(words.iter().any(|w| w[0] == LIST_SET_CO2_FPK && w[1] == 0x00C8));
        assert_eq!(count_op(&words, LIST_FIBER_YLPM_PULSE_WIDTH), 0);
        assert_eq!(count_op(&words, LIST_QSWITCH_PERIOD), 0);
        assert_eq!(count_op(&words, LIST_MARK_CURRENT), 0);
    }

    #[test]
    fn fiber_source_emits_qswitch_and_current() {
        let mut settings = Settings::default();
        settings.pulse_width = Some(4);
        let (controller, mock) = mock_controller(settings);
        controller.marking(|_| Ok(())).unwrap();

        let words = mock.list_words();
        assert!(
            words
                .iter()
                .any(|w| w[0] == LIST_QSWITCH_PERIOD && w[1] == 667)
        );
        assert!(words.iter().any(|w| w[0] == LIST_MARK_CURRENT && w[1] == 2048));
        assert!(
            words
                .iter()
                .any(|w| w[0] == LIST_FIBER_YLPM_PULSE_WIDTH && w[1] == 4)
        );
        assert_eq!(count_op(&words, LIST_MARK_FREQ), 0);
        assert_eq!(count_op(&words, LIST_MARK_POWER_RATIO), 0);
        assert_eq!(count_op(&words, LIST_SET_CO2_FPK), 0);
    }

    #[test]
    fn parameter_cache_elides_repeats() {
        let (controller, mock) = mock_controller(Settings::default());
        controller.set_travel_speed(500.0).unwrap();
        controller.set_travel_speed(500.0).unwrap();
        controller.set_travel_speed(250.0).unwrap();
        flush(&controller);
        let speeds: Vec<u16> = mock
            .list_words()
            .iter()
            .filter(|w| w[0] == LIST_JUMP_SPEED)
            .map(|w| w[1])
            .collect();
        assert_eq!(speeds, vec![250, 125]);
    }

    #[test]
    fn marking_configuration_is_idempotent() {
        let (controller, mock) = mock_controller(Settings::default());
        controller.marking_configuration().unwrap();
        controller.marking_configuration().unwrap();
        flush(&controller);
        assert_eq!(count_op(&mock.list_words(), LIST_READY_MARK), 1);
        controller.initial_configuration().unwrap();
        assert_eq!(controller.state(), ("idle", "idle"));
    }

    #[test]
    fn packet_boundary_flushes_full_packets() {
        let (controller, mock) = mock_controller(Settings::default());
        for _ in 0..257 {
            controller.list_delay_time(1.0).unwrap();
        }
        flush(&controller);

        let packets = mock.packets();
        assert_eq!(packets.len(), 2);
        assert!(packets.iter().all(|p| p.len() == LIST_PACKET_SIZE));
        assert_eq!(count_op(&mock.commands(), SET_END_OF_LIST), 2);
        // the second packet holds one word and NOP fill
        assert_eq!(&packets[1][12..24], &NOP_WORD);

        let machine = controller.machine.lock().unwrap();
        assert_eq!(machine.list_packets, 2);
        assert!(!machine.list_executing);
    }

    #[test]
    fn dwell_chunks_sum_to_requested_time() {
        let (controller, mock) = mock_controller(Settings::default());
        controller.dwell_with(700.0, false).unwrap();
        flush(&controller);
        let chunks: Vec<u16> = mock
            .list_words()
            .iter()
            .filter(|w| w[0] == LIST_LASER_ON_POINT)
            .map(|w| w[1])
            .collect();
        assert_eq!(chunks, vec![60000, 10000]);
        assert_eq!(chunks.iter().map(|&c| c as u64).sum::<u64>(), 70000);
    }

    #[test]
    fn dwell_appends_end_delay() {
        let (controller, mock) = mock_controller(Settings::default());
        controller.dwell(1.0).unwrap();
        flush(&controller);
        let words = mock.list_words();
        assert!(words.iter().any(|w| w[0] == LIST_LASER_ON_POINT && w[1] == 100));
        // delay_end 300 us emitted in 10 us units
        assert!(words.iter().any(|w| w[0] == LIST_DELAY_TIME && w[1] == 30));
    }

    #[test]
    fn wait_chunks_sum_to_requested_time() {
        let (controller, mock) = mock_controller(Settings::default());
        controller.wait(500.0).unwrap();
        controller.wait(1300.0).unwrap();
        flush(&controller);
        let delays: Vec<u16> = mock
            .list_words()
            .iter()
            .filter(|w| w[0] == LIST_DELAY_TIME)
            .map(|w| w[1])
            .collect();
        assert_eq!(delays, vec![50000, 60000, 60000, 10000]);
        assert!(delays.iter().all(|&d| d <= 60000));
    }

    #[test]
    fn laser_on_delay_sign_encoding() {
        let (controller, mock) = mock_controller(Settings::default());
        controller.list_laser_on_delay(-5.0).unwrap();
        controller.list_laser_on_delay(5.0).unwrap();
        flush(&controller);
        let delays: Vec<_> = mock
            .list_words()
            .iter()
            .filter(|w| w[0] == LIST_LASER_ON_DELAY)
            .map(|w| (w[1], w[2]))
            .collect();
        assert_eq!(delays, vec![(5, 0x8000), (5, 0x0000)]);
    }

    #[test]
    fn jump_distance_clamps_to_u16() {
        let mut settings = Settings::default();
        settings.x = 0;
        settings.y = 0;
        let (controller, mock) = mock_controller(settings);
        controller.list_jump(0xFFFF, 0xFFFF).unwrap();
        flush(&controller);
        let jump = mock
            .list_words()
            .into_iter()
            .find(|w| w[0] == LIST_JUMP_TO)
            .unwrap();
        assert_eq!(jump[4], 0xFFFF);
    }

    #[test]
    fn grid_of_lit_points() {
        let (controller, mock) = mock_controller(Settings::default());
        controller
            .lighting(|c| {
                for x in (0x1000..0xFFFF).step_by(0x1000) {
                    for y in (0x1000..0xFFFF).step_by(0x1000) {
                        c.dark(x, y)?;
                        c.light_on();
                        c.wait(500.0)?;
                    }
                }
                Ok(())
            })
            .unwrap();

        let words = mock.list_words();
        assert_eq!(count_op(&words, LIST_JUMP_TO), 225);
        let waits = words
            .iter()
            .filter(|w| w[0] == LIST_DELAY_TIME && w[1] == 50000)
            .count();
        assert_eq!(waits, 225);
        // one from the lighting preamble, one per dark()
        assert_eq!(count_op(&words, LIST_WRITE_PORT), 226);
        // the jump delay is cached after the first cell
        assert_eq!(count_op(&words, LIST_JUMP_DELAY), 1);
        // everything sent as full packets
        assert!(
            mock.writes()
                .iter()
                .filter(|w| w.len() > COMMAND_SIZE)
                .all(|w| w.len() == LIST_PACKET_SIZE)
        );
        assert_eq!(count_op(&mock.commands(), EXECUTE_LIST), 1);
    }

    #[test]
    fn abort_resets_to_initial_with_dummy_packet() {
        let (controller, mock) = mock_controller(Settings::default());
        controller.marking_configuration().unwrap();
        controller.mark(0x2000, 0x2000).unwrap();
        controller.abort().unwrap();

        assert_eq!(controller.state(), ("idle", "idle"));
        let commands = mock.commands();
        assert!(commands.iter().any(|w| w[0] == STOP_EXECUTE));
        assert!(commands.iter().any(|w| w[0] == RESET_LIST));
        assert!(commands.iter().any(|w| w[0] == EXECUTE_LIST));
        assert_eq!(mock.packets().len(), 1);

        let machine = controller.machine.lock().unwrap();
        assert_eq!(machine.list_packets, 0);
        assert!(!machine.list_executing);
    }

    #[test]
    fn scoped_marking_restores_initial_on_error() {
        let (controller, _mock) = mock_controller(Settings::default());
        let result: io::Result<()> = controller.marking(|_| Err(io::Error::other("boom")));
        assert!(result.is_err());
        assert_eq!(controller.state(), ("idle", "idle"));
    }

    #[test]
    fn pause_and_resume_toggle_hold_state() {
        let (controller, mock) = mock_controller(Settings::default());
        controller.lighting_configuration().unwrap();
        controller.pause().unwrap();
        assert_eq!(controller.state(), ("hold", "paused"));
        controller.resume().unwrap();
        assert_eq!(controller.state(), ("busy", "lighting"));
        let commands = mock.commands();
        assert!(commands.iter().any(|w| w[0] == STOP_LIST));
        assert!(commands.iter().any(|w| w[0] == RESTART_LIST));
        controller.initial_configuration().unwrap();
    }

    #[test]
    fn wait_for_input_matches_masked_bits() {
        let (controller, mock) = mock_controller(Settings::default());
        mock.set_input_bits(0b1010);
        controller.wait_for_input(0b1010, 0b1010).unwrap();
        assert_eq!(controller.state(), ("busy", "marking"));
        controller.initial_configuration().unwrap();
    }

    #[test]
    fn spooler_runs_and_removes_jobs() {
        let (controller, _mock) = mock_controller(Settings::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_job = Arc::clone(&calls);
        let job: Job = Arc::new(move |_c: &GalvoController| {
            calls_in_job.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(1));
            Ok(false)
        });

        controller.submit(Arc::clone(&job));
        thread::sleep(Duration::from_millis(100));
        assert!(calls.load(Ordering::SeqCst) > 0);
        assert!(
            controller
                .current()
                .is_some_and(|current| Arc::ptr_eq(&current, &job))
        );

        controller.remove(&job);
        let deadline = Instant::now() + Duration::from_secs(2);
        while controller.current().is_some() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(controller.current().is_none());
        assert_eq!(controller.queue_len(), 0);
        controller.shutdown();
    }

    #[test]
    fn wait_for_machine_idle_returns_after_completion() {
        let (controller, _mock) = mock_controller(Settings::default());
        let countdown = Arc::new(AtomicUsize::new(5));
        let counter = Arc::clone(&countdown);
        let job: Job =
            Arc::new(move |_c: &GalvoController| Ok(counter.fetch_sub(1, Ordering::SeqCst) == 1));
        controller.submit(job);
        controller.wait_for_machine_idle();
        assert_eq!(countdown.load(Ordering::SeqCst), 0);
        controller.shutdown();
    }

    #[test]
    fn command_stream_job_drains_through_spooler() {
        let (controller, mock) = mock_controller(Settings::default());
        let job = command_stream_job(vec![
            Command::MarkingConfiguration,
            Command::Goto(0x5000, 0x5000),
            Command::Mark(0x5000, 0xA000),
            Command::InitialConfiguration,
        ]);
        controller.submit(job);
        controller.wait_for_machine_idle();
        controller.shutdown();

        let words = mock.list_words();
        assert_eq!(count_op(&words, LIST_JUMP_TO), 1);
        assert_eq!(count_op(&words, LIST_MARK_TO), 1);
    }

    #[test]
    fn connect_failure_latches_and_disconnect_clears() {
        let controller =
            GalvoController::with_connection(Settings::default(), Box::new(RefusingConnection));
        let err = controller.enable_laser().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        assert!(!controller.is_connection_allowed());

        // the latch refuses without retrying
        let start = Instant::now();
        assert!(controller.enable_laser().is_err());
        assert!(start.elapsed() < Duration::from_secs(1));

        controller.disconnect();
        assert!(controller.is_connection_allowed());
    }
}
