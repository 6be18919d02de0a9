//! The device handle: open/close, the command lock, and the
//! master/slave synchronized-command protocol.

use crate::error::{DaqError, Result};
use crate::event::Timestamp;
use crate::gpio::{InterruptPin, PowerPin};
use crate::spi::{check_echo, Batch, SpiBus};
use crate::spidev::Spidev;
use padaq_board::bits::{join_dna, payload24};
use padaq_board::cmd::{self, CmdWord};
use padaq_board::regs::ReadoutMode;
use padaq_board::{regs, Family, DEFAULT_BUFFER_LENGTH, MAX_BOARDS};
use rustix::event::{eventfd, EventfdFlags};
use std::os::unix::io::OwnedFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Which physical board a command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Board {
    /// The board that arbitrates sync and owns logical event identity.
    Master,
    /// The optional chained second board.
    Slave,
}

impl Board {
    /// Index into per-board arrays (master first).
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Both slots in master-first order.
    pub(crate) const BOTH: [Self; MAX_BOARDS] = [Self::Master, Self::Slave];
}

/// Open-time configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Hardware generation of the attached boards.
    pub family: Family,
    /// SPI clock override; `None` uses the generation's rating.
    pub spi_clock_hz: Option<u32>,
    /// Toggle chip select between transfers.
    pub cs_change: bool,
    /// Delay between transfers, microseconds.
    pub delay_us: u16,
    /// Poll-mode status interval, microseconds; zero yields instead of
    /// sleeping.
    pub poll_interval_us: u32,
    /// Settle time after a global or almost-global reset (FPGA reload).
    pub reset_settle: Duration,
    /// Settle time after a retry-triggered ADC clock reset.
    pub adc_settle: Duration,
    /// How long the calibration loop waits for its forced trigger.
    pub trigger_wait: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self::for_family(Family::Bn)
    }
}

impl Options {
    /// Defaults for one hardware generation.
    #[must_use]
    pub fn for_family(family: Family) -> Self {
        Self {
            family,
            spi_clock_hz: None,
            cs_change: false,
            delay_us: 0,
            poll_interval_us: 500,
            reset_settle: Duration::from_secs(20),
            adc_settle: Duration::from_secs(1),
            trigger_wait: Duration::from_secs(1),
        }
    }
}

/// One board's bus plus the select-state shadow that lets redundant
/// mode/buffer switches be elided.
pub(crate) struct BoardIo {
    pub(crate) bus: Box<dyn SpiBus>,
    pub(crate) current_buf: Option<u8>,
    pub(crate) current_mode: Option<ReadoutMode>,
}

impl BoardIo {
    fn new(bus: Box<dyn SpiBus>) -> Self {
        Self {
            bus,
            current_buf: None,
            current_mode: None,
        }
    }

    /// Forget the cached selections (a reset invalidates them).
    pub(crate) fn invalidate_cache(&mut self) {
        self.current_buf = None;
        self.current_mode = None;
    }
}

impl std::fmt::Debug for BoardIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoardIo")
            .field("current_buf", &self.current_buf)
            .field("current_mode", &self.current_mode)
            .finish_non_exhaustive()
    }
}

/// Everything guarded by the command lock: the buses, the select-state
/// cache, and the readout bookkeeping that must stay coherent with the
/// on-wire order.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) master: BoardIo,
    pub(crate) slave: Option<BoardIo>,
    pub(crate) event_counter: u64,
    pub(crate) next_read_buffer: u8,
    pub(crate) hardware_next: u8,
    pub(crate) buffer_length: u16,
    pub(crate) pretrigger: u8,
    pub(crate) start_time: Timestamp,
    pub(crate) board_id: [u8; MAX_BOARDS],
    pub(crate) channel_read_mask: [u8; MAX_BOARDS],
    pub(crate) readout_number_offset: u64,
    pub(crate) cs_change: bool,
    pub(crate) delay_us: u16,
}

/// Verification-register responses from a synchronized command.
#[derive(Debug, Default)]
pub(crate) struct SyncReadback {
    pub(crate) master: Option<CmdWord>,
    pub(crate) slave: Option<CmdWord>,
}

impl Shared {
    pub(crate) fn has_slave(&self) -> bool {
        self.slave.is_some()
    }

    pub(crate) fn num_boards(&self) -> usize {
        1 + usize::from(self.has_slave())
    }

    pub(crate) fn board_mut(&mut self, which: Board) -> Result<&mut BoardIo> {
        match which {
            Board::Master => Ok(&mut self.master),
            Board::Slave => self
                .slave
                .as_mut()
                .ok_or_else(|| DaqError::transfer("no slave board attached")),
        }
    }

    /// Plain single-word write to every attached board, slave first so the
    /// master's copy lands last.
    pub(crate) fn write_each(&mut self, word: &CmdWord) -> Result<()> {
        if let Some(slave) = self.slave.as_mut() {
            slave.bus.write_word(word)?;
        }
        self.master.bus.write_word(word)
    }

    /// Read one register on one board.
    pub(crate) fn read_register(
        &mut self,
        family: Family,
        address: u8,
        which: Board,
    ) -> Result<CmdWord> {
        let io = self.board_mut(which)?;
        let mut out = [0u8; 4];
        let mut batch = Batch::new(&mut *io.bus, family);
        batch.read_register(address, &mut out)?;
        batch.flush()?;
        drop(batch);
        check_echo(address, &out)?;
        Ok(out)
    }

    /// Status register: ready mask plus the hardware next-to-read cursor.
    pub(crate) fn check_buffers(
        &mut self,
        family: Family,
        which: Board,
    ) -> Result<crate::event::BufferMask> {
        let word = self.read_register(family, family.status_reg(), which)?;
        self.hardware_next = regs::status::hardware_next(&word);
        Ok(crate::event::BufferMask::new(regs::status::buffer_mask(
            &word,
        )))
    }

    /// Apply one state-changing command to both boards at the same board
    /// clock: assert sync on the master, land the command on the slave,
    /// then land it on the master and release sync. Single-board devices
    /// take the direct path. Optionally reads a verification register on
    /// every board afterwards.
    pub(crate) fn synchronized_command(
        &mut self,
        family: Family,
        command: &CmdWord,
        verify: Option<u8>,
    ) -> Result<SyncReadback> {
        if self.slave.is_none() {
            let mut out = [0u8; 4];
            let mut batch = Batch::new(&mut *self.master.bus, family);
            batch.write(command)?;
            if let Some(reg) = verify {
                batch.read_register(reg, &mut out)?;
            }
            batch.flush()?;
            drop(batch);
            return Ok(SyncReadback {
                master: verify.map(|_| out),
                slave: None,
            });
        }

        {
            let mut master = Batch::new(&mut *self.master.bus, family);
            master.write(&cmd::SYNC_ON)?;
            master.flush()?;
        }
        {
            let slave = self.slave.as_mut().expect("slave checked above");
            let mut batch = Batch::new(&mut *slave.bus, family);
            batch.write(command)?;
            batch.flush()?;
        }
        {
            let mut master = Batch::new(&mut *self.master.bus, family);
            master.write(command)?;
            master.write(&cmd::SYNC_OFF)?;
            master.flush()?;
        }

        let mut readback = SyncReadback::default();
        if let Some(reg) = verify {
            readback.master = Some(self.read_register(family, reg, Board::Master)?);
            readback.slave = Some(self.read_register(family, reg, Board::Slave)?);
        }
        Ok(readback)
    }
}

/// Firmware version register fields.
#[derive(Debug, Clone, Copy)]
pub struct FwVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Board is strapped as the sync master.
    pub master: bool,
}

/// Firmware synthesis date.
#[derive(Debug, Clone, Copy)]
pub struct FwDate {
    /// Year.
    pub year: u16,
    /// Month.
    pub month: u8,
    /// Day.
    pub day: u8,
}

/// Firmware identity of one board.
#[derive(Debug, Clone, Copy)]
pub struct FwInfo {
    /// Version register fields.
    pub version: FwVersion,
    /// Synthesis date.
    pub date: FwDate,
    /// 57-bit device DNA.
    pub dna: u64,
}

static BOARD_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

fn next_board_id() -> u8 {
    (BOARD_ID_COUNTER.fetch_add(1, Ordering::Relaxed) & 0xff) as u8
}

/// Handle to one master board and its optional slave.
///
/// All state-changing traffic serializes through the command lock; the
/// wait primitive has its own single-waiter gate so configuration can
/// proceed while a thread blocks on the trigger.
#[derive(Debug)]
pub struct Device {
    pub(crate) family: Family,
    pub(crate) shared: Mutex<Shared>,
    pub(crate) wait_gate: Mutex<()>,
    pub(crate) cancel: AtomicBool,
    pub(crate) wakeup: OwnedFd,
    pub(crate) irq: Option<Mutex<InterruptPin>>,
    pub(crate) power: Option<Mutex<PowerPin>>,
    pub(crate) poll_interval_us: AtomicU32,
    pub(crate) options: Options,
}

impl Device {
    /// Open a device over spidev nodes: the master, an optional slave, an
    /// optional interrupt GPIO file, and an optional power-enable GPIO.
    ///
    /// Locks each node exclusively, configures SPI mode 0 at the
    /// generation's clock, releases the sync line, checks the firmware
    /// identity straps, and performs a counter reset.
    ///
    /// # Errors
    ///
    /// Returns an error if any node cannot be opened or locked, or if the
    /// initial reset fails.
    pub fn open(
        master: &Path,
        slave: Option<&Path>,
        irq: Option<&Path>,
        power_gpio: Option<u32>,
        options: Options,
    ) -> Result<Self> {
        let clock = options
            .spi_clock_hz
            .unwrap_or_else(|| options.family.default_spi_clock_hz());

        let master_bus = Spidev::open(master, clock, options.cs_change, options.delay_us)?;
        let slave_bus = match slave {
            Some(path) => Some(Box::new(Spidev::open(
                path,
                clock,
                options.cs_change,
                options.delay_us,
            )?) as Box<dyn SpiBus>),
            None => None,
        };
        let irq = irq.map(InterruptPin::open).transpose()?;
        let power = power_gpio.map(PowerPin::open).transpose()?;

        Self::from_buses(Box::new(master_bus), slave_bus, irq, power, options)
    }

    /// Build a device from already-open buses. This is the seam the
    /// simulator and the test suite come in through; `open` is a thin
    /// wrapper over it.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial sync release, identity check, or
    /// counter reset fails.
    pub fn from_buses(
        mut master: Box<dyn SpiBus>,
        slave: Option<Box<dyn SpiBus>>,
        irq: Option<InterruptPin>,
        power: Option<PowerPin>,
        options: Options,
    ) -> Result<Self> {
        // A previous run may have died with sync held.
        if slave.is_some() {
            master.write_word(&cmd::SYNC_OFF)?;
        }

        let has_slave = slave.is_some();
        let board_id = [
            next_board_id(),
            if has_slave { next_board_id() } else { 0 },
        ];

        let shared = Shared {
            master: BoardIo::new(master),
            slave: slave.map(BoardIo::new),
            event_counter: 0,
            next_read_buffer: 0,
            hardware_next: 0,
            buffer_length: DEFAULT_BUFFER_LENGTH,
            pretrigger: 0,
            start_time: Timestamp::now(),
            board_id,
            channel_read_mask: [0xff, if has_slave { 0x0f } else { 0 }],
            readout_number_offset: Timestamp::now().secs << 32,
            cs_change: options.cs_change,
            delay_us: options.delay_us,
        };

        let wakeup = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)
            .map_err(std::io::Error::from)?;

        let poll_interval_us = AtomicU32::new(options.poll_interval_us);
        let device = Self {
            family: options.family,
            shared: Mutex::new(shared),
            wait_gate: Mutex::new(()),
            cancel: AtomicBool::new(false),
            wakeup,
            irq: irq.map(Mutex::new),
            power: power.map(Mutex::new),
            poll_interval_us,
            options,
        };

        let fw = device.fwinfo(Board::Master)?;
        if !fw.version.master {
            tracing::warn!("the device chosen as master does not identify as master");
        }
        if has_slave {
            let fw = device.fwinfo(Board::Slave)?;
            if fw.version.master {
                tracing::warn!("the device chosen as slave does not identify as slave");
            }
        }

        device.reset(crate::reset::ResetLevel::Counters)?;

        tracing::info!(
            family = %device.family,
            boards = device.lock().num_boards(),
            "device open"
        );
        Ok(device)
    }

    /// Hardware generation of the attached boards.
    #[must_use]
    pub const fn family(&self) -> Family {
        self.family
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a slave board is attached.
    #[must_use]
    pub fn has_slave(&self) -> bool {
        self.lock().has_slave()
    }

    /// Board id of one board.
    #[must_use]
    pub fn board_id(&self, which: Board) -> u8 {
        self.lock().board_id[which.index()]
    }

    /// Assign a board id, keeping the process-wide counter ahead of it so
    /// later opens stay unique.
    pub fn set_board_id(&self, which: Board, id: u8) {
        BOARD_ID_COUNTER.fetch_max(u32::from(id) + 1, Ordering::Relaxed);
        self.lock().board_id[which.index()] = id;
    }

    /// Replace the upper-half readout-number offset.
    pub fn set_readout_number_offset(&self, offset: u64) {
        self.lock().readout_number_offset = offset;
    }

    /// Software shadow of the hardware event counter.
    #[must_use]
    pub fn event_counter(&self) -> u64 {
        self.lock().event_counter
    }

    /// Wall-clock anchor of the last counter reset.
    #[must_use]
    pub fn start_time(&self) -> Timestamp {
        self.lock().start_time
    }

    /// Read one register on one board.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure or a response that does not
    /// echo the requested address.
    pub fn read_register(&self, address: u8, which: Board) -> Result<CmdWord> {
        self.lock().read_register(self.family, address, which)
    }

    /// Write one raw word to every attached board.
    ///
    /// # Errors
    ///
    /// Returns an error on a short or failed write.
    pub fn write_word(&self, word: &CmdWord) -> Result<()> {
        self.lock().write_each(word)
    }

    /// Read one raw word from one board.
    ///
    /// # Errors
    ///
    /// Returns an error on a short or failed read.
    pub fn read_word(&self, which: Board) -> Result<CmdWord> {
        let mut sh = self.lock();
        let io = sh.board_mut(which)?;
        let mut word = [0u8; 4];
        io.bus.read_word(&mut word)?;
        Ok(word)
    }

    /// Ready-buffer mask from the status register.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure.
    pub fn check_buffers(&self, which: Board) -> Result<crate::event::BufferMask> {
        self.lock().check_buffers(self.family, which)
    }

    /// Force a software trigger; synchronized when a slave is attached.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure.
    pub fn sw_trigger(&self) -> Result<()> {
        let mut sh = self.lock();
        if sh.has_slave() {
            sh.synchronized_command(self.family, &cmd::FORCE_TRIGGER, None)?;
            Ok(())
        } else {
            sh.master.bus.write_word(&cmd::FORCE_TRIGGER)
        }
    }

    /// Set the calibration pulser state on every board.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure.
    pub fn calpulse(&self, state: u8) -> Result<()> {
        self.lock().write_each(&cmd::calpulse_word(state))
    }

    /// Drive the external power/enable GPIO, if one was bound.
    ///
    /// # Errors
    ///
    /// Returns an error if no power line is bound or the write fails.
    pub fn set_power(&self, on: bool) -> Result<()> {
        match &self.power {
            Some(pin) => pin
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .set(on),
            None => Err(DaqError::transfer("no power gpio bound")),
        }
    }

    /// Firmware identity of one board.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure.
    pub fn fwinfo(&self, which: Board) -> Result<FwInfo> {
        let mut sh = self.lock();
        let io = sh.board_mut(which)?;

        let mut version = [0u8; 4];
        let mut date = [0u8; 4];
        let mut dna_low = [0u8; 4];
        let mut dna_mid = [0u8; 4];
        let mut dna_high = [0u8; 4];

        let mut batch = Batch::new(&mut *io.bus, self.family);
        batch.read_register(regs::FIRMWARE_VER, &mut version)?;
        batch.read_register(regs::FIRMWARE_DATE, &mut date)?;
        batch.read_register(regs::CHIPID_LOW, &mut dna_low)?;
        batch.read_register(regs::CHIPID_MID, &mut dna_mid)?;
        batch.read_register(regs::CHIPID_HI, &mut dna_high)?;
        batch.flush()?;
        drop(batch);

        Ok(FwInfo {
            version: FwVersion {
                major: version[3] >> 4,
                minor: version[3] & 0x0f,
                master: version[1] & 1 != 0,
            },
            date: FwDate {
                year: u16::from(date[2] >> 4) | u16::from(date[1]) << 4,
                month: date[2] & 0x0f,
                day: date[3],
            },
            dna: join_dna(
                payload24(&dna_low),
                payload24(&dna_mid),
                payload24(&dna_high),
            ),
        })
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.cancel_wait();
        tracing::info!(family = %self.family, "device closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_ids_stay_unique_after_explicit_assignment() {
        let a = next_board_id();
        BOARD_ID_COUNTER.fetch_max(u32::from(a) + 10, Ordering::Relaxed);
        let b = next_board_id();
        assert!(b >= a + 9);
    }

    #[test]
    fn board_index_order() {
        assert_eq!(Board::Master.index(), 0);
        assert_eq!(Board::Slave.index(), 1);
        assert_eq!(Board::BOTH[0], Board::Master);
    }
}
