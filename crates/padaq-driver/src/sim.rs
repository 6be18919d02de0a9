//! Scripted in-memory board model.
//!
//! Implements [`SpiBus`] with a register file, buffer ring, and calpulser
//! behind the same wire protocol the hardware speaks, so the whole driver
//! stack runs against it unchanged. The test suite and CI use it in place
//! of hardware; a shared [`WireLog`] records every transmitted word across
//! both boards in global order for sequence assertions.
//!
//! The model is behavioral, not cycle-accurate: it serves the register
//! reads, buffer ring, waveform RAM, and calpulser peaks the driver
//! observes, and nothing more.

use crate::error::Result;
use crate::spi::{SpiBus, Transfer};
use padaq_board::bits::payload24;
use padaq_board::cmd::CmdWord;
use padaq_board::{
    regs, Family, BUF_MASK, MAX_WAVEFORM_LENGTH, NUM_ADC, NUM_BUFFER, NUM_CHAN, NUM_CHUNK,
    WORD_SIZE,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Sample RAM bytes per channel per buffer. Event readout starts at RAM
/// address 1, so one leading RAM word pads the front.
const RAM_BYTES: usize = MAX_WAVEFORM_LENGTH + NUM_CHUNK * WORD_SIZE;

/// Offset of waveform sample 0 within the RAM.
const SAMPLE_BASE: usize = NUM_CHUNK * WORD_SIZE;

/// Every word transmitted on any simulated bus, in global order.
#[derive(Debug, Clone, Default)]
pub struct WireLog(Arc<Mutex<Vec<(&'static str, CmdWord)>>>);

impl WireLog {
    /// A fresh, empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot and clear the log.
    #[must_use]
    pub fn take(&self) -> Vec<(&'static str, CmdWord)> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Clear the log without reading it.
    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn push(&self, label: &'static str, word: CmdWord) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((label, word));
    }
}

#[derive(Debug, Clone, Copy)]
enum Pending {
    Register(u8),
    Chunk(u8),
}

#[derive(Debug, Clone)]
struct Latched {
    event_counter: u64,
    trig_counter: u64,
    trig_time: u64,
    deadtime: u32,
    buffer: u8,
    calpulse: bool,
    data: Vec<[u8; RAM_BYTES]>,
}

impl Default for Latched {
    fn default() -> Self {
        Self {
            event_counter: 0,
            trig_counter: 0,
            trig_time: 0,
            deadtime: 0,
            buffer: 0,
            calpulse: false,
            data: vec![[0; RAM_BYTES]; NUM_CHAN],
        }
    }
}

#[derive(Debug)]
struct SimState {
    family: Family,
    is_master: bool,

    regfile: [u32; 256],
    pending: Option<Pending>,
    selected_buffer: u8,
    selected_channel: u8,
    ram_addr: u8,
    pick_scaler: u8,
    sync: bool,
    calpulse_state: u8,

    ready_mask: u8,
    next_write_buffer: u8,
    latched: [Latched; NUM_BUFFER],

    event_counter: u64,
    trig_counter: u64,
    next_trig_time: u64,
    trig_time_step: u64,
    trig_times: VecDeque<u64>,
    trig_time_offset: i64,

    peaks: [u16; NUM_CHAN],
    peak_amplitude: u8,
    peak_script: VecDeque<[u16; NUM_CHAN]>,
    clk_resets: u32,
    adc_delay_writes: Vec<(u8, u8)>,

    scaler_registers: Vec<u32>,
    ready_after: Option<(Instant, u8)>,
}

impl SimState {
    fn new(family: Family, is_master: bool) -> Self {
        Self {
            family,
            is_master,
            regfile: [0; 256],
            pending: None,
            selected_buffer: 0,
            selected_channel: 0,
            ram_addr: 0,
            pick_scaler: 0,
            sync: false,
            calpulse_state: 0,
            ready_mask: 0,
            next_write_buffer: 0,
            latched: Default::default(),
            event_counter: 0,
            trig_counter: 0,
            next_trig_time: 0,
            trig_time_step: 1000,
            trig_times: VecDeque::new(),
            trig_time_offset: 0,
            peaks: [100; NUM_CHAN],
            peak_amplitude: 60,
            peak_script: VecDeque::new(),
            clk_resets: 0,
            adc_delay_writes: Vec::new(),
            scaler_registers: vec![0; 64],
            ready_after: None,
        }
    }

    fn handle_word(&mut self, word: &CmdWord) {
        let op = word[0];
        let family = self.family;

        if op == family.set_read_reg() {
            self.pending = Some(Pending::Register(word[3]));
            return;
        }
        if op == regs::READ {
            // The MISO prompt; the response is already staged.
            return;
        }
        let chunk_base = family.chunk_reg();
        match family {
            Family::Bn if (chunk_base..chunk_base + NUM_CHUNK as u8).contains(&op) => {
                self.pending = Some(Pending::Chunk(op - chunk_base));
                return;
            }
            Family::Np if op == chunk_base => {
                self.pending = Some(Pending::Chunk(word[3]));
                return;
            }
            _ => {}
        }

        match op {
            regs::MODE => {}
            regs::BUFFER => self.selected_buffer = word[3] % NUM_BUFFER as u8,
            regs::CHANNEL => {
                self.selected_channel = match family {
                    Family::Bn => word[3].trailing_zeros() as u8,
                    Family::Np => word[3],
                } % NUM_CHAN as u8;
            }
            regs::RAM_ADDR => self.ram_addr = word[3],
            regs::FORCE_TRIG if word[3] == 1 => self.latch_trigger(),
            regs::CLEAR => {
                if word[2] & 1 != 0 {
                    self.next_write_buffer = 0;
                }
                self.ready_mask &= !(word[3] & BUF_MASK);
            }
            regs::CALPULSE => self.calpulse_state = word[3],
            regs::SYNC => self.sync = word[3] != 0,
            regs::RESET_COUNTER => {
                self.event_counter = 0;
                self.trig_counter = 0;
                self.next_trig_time = 0;
            }
            regs::RESET_ALL => {
                self.ready_mask = 0;
                self.next_write_buffer = 0;
                self.event_counter = 0;
                self.trig_counter = 0;
            }
            regs::ADC_CLK_RST => {
                self.clk_resets += 1;
                if let Some(peaks) = self.peak_script.pop_front() {
                    self.peaks = peaks;
                }
            }
            regs::UPDATE_SCALERS => {}
            regs::PICK_SCALER => self.pick_scaler = word[3],
            op if (regs::ADC_DELAYS..regs::ADC_DELAYS + NUM_ADC as u8).contains(&op) => {
                self.adc_delay_writes.push((op - regs::ADC_DELAYS, word[2] & 0x0f));
                self.regfile[op as usize] = payload24(word);
            }
            _ => self.regfile[op as usize] = payload24(word),
        }
    }

    fn fill_response(&mut self, out: &mut CmdWord) {
        match self.pending.take() {
            Some(Pending::Register(addr)) => {
                let value = self.register_value(addr);
                *out = [
                    addr,
                    ((value >> 16) & 0xff) as u8,
                    ((value >> 8) & 0xff) as u8,
                    (value & 0xff) as u8,
                ];
            }
            Some(Pending::Chunk(chunk)) => {
                let offset =
                    usize::from(self.ram_addr) * NUM_CHUNK * WORD_SIZE + usize::from(chunk) * WORD_SIZE;
                let data = &self.latched[self.selected_buffer as usize].data
                    [self.selected_channel as usize];
                for (i, byte) in out.iter_mut().enumerate() {
                    *byte = data.get(offset + i).copied().unwrap_or(0);
                }
            }
            None => *out = [0; 4],
        }
    }

    fn register_value(&mut self, addr: u8) -> u32 {
        let family = self.family;
        if addr == family.status_reg() {
            self.promote_delayed_ready();
            let next = if self.ready_mask == 0 {
                u32::from(self.next_write_buffer)
            } else {
                self.ready_mask.trailing_zeros()
            };
            return u32::from(self.ready_mask) | ((next & 0x3) << 12);
        }
        if addr == family.clear_status_reg() {
            return u32::from(self.ready_mask);
        }
        if addr == family.scaler_read_reg() {
            return self
                .scaler_registers
                .get(usize::from(self.pick_scaler))
                .copied()
                .unwrap_or(0);
        }
        if (family.thresholds_reg()..).contains(&addr) {
            return self.regfile[addr as usize];
        }

        let latched = &self.latched[self.selected_buffer as usize];
        match addr {
            regs::FIRMWARE_VER => u32::from(self.is_master) << 16 | 0x42,
            // 2024-06-01 in the packed date layout.
            regs::FIRMWARE_DATE => 0x01_8601,
            regs::CHIPID_LOW => 0x33_2211,
            regs::CHIPID_MID => 0x66_5544,
            regs::CHIPID_HI => 0x8877,
            regs::EVENT_COUNTER_LOW => (latched.event_counter & 0xff_ffff) as u32,
            regs::EVENT_COUNTER_HIGH => (latched.event_counter >> 24) as u32,
            regs::TRIG_COUNTER_LOW => (latched.trig_counter & 0xff_ffff) as u32,
            regs::TRIG_COUNTER_HIGH => (latched.trig_counter >> 24) as u32,
            regs::TRIG_TIME_LOW => (latched.trig_time & 0xff_ffff) as u32,
            regs::TRIG_TIME_HIGH => ((latched.trig_time >> 24) & 0xff_ffff) as u32,
            regs::DEADTIME => latched.deadtime,
            regs::TRIG_INFO => {
                u32::from(latched.buffer) << 22
                    | u32::from(latched.calpulse) << 21
                    | (self.regfile[regs::TRIG_POLARIZATION as usize] & 0xf)
            }
            regs::CH_MASKS => {
                let channel_mask = self.regfile[regs::CHANNEL_MASK as usize] & 0xff;
                let beam_mask = self.regfile[regs::TRIGGER_MASK as usize] & 0x7fff;
                channel_mask << 15 | beam_mask
            }
            _ => self.regfile[addr as usize],
        }
    }

    fn promote_delayed_ready(&mut self) {
        if let Some((due, buffer)) = self.ready_after {
            if Instant::now() >= due {
                self.ready_after = None;
                self.latch_into(buffer);
            }
        }
    }

    fn latch_trigger(&mut self) {
        if self.ready_mask == BUF_MASK {
            return;
        }
        let buffer = self.next_write_buffer;
        self.next_write_buffer = (buffer + 1) % NUM_BUFFER as u8;
        self.latch_into(buffer);
    }

    fn latch_into(&mut self, buffer: u8) {
        self.event_counter += 1;
        self.trig_counter += 1;
        let base = self
            .trig_times
            .pop_front()
            .unwrap_or(self.next_trig_time);
        self.next_trig_time = base + self.trig_time_step;
        let trig_time = base.saturating_add_signed(self.trig_time_offset);

        self.ready_mask |= 1 << buffer;
        let calpulse = self.calpulse_state != 0;
        let peaks = self.peaks;
        let amplitude = self.peak_amplitude;

        let latched = &mut self.latched[buffer as usize];
        latched.event_counter = self.event_counter;
        latched.trig_counter = self.trig_counter;
        latched.trig_time = trig_time;
        latched.deadtime = 17;
        latched.buffer = buffer;
        latched.calpulse = calpulse;
        for (chan, ram) in latched.data.iter_mut().enumerate() {
            if calpulse {
                ram.fill(0);
                let peak = SAMPLE_BASE + usize::from(peaks[chan]);
                if let Some(sample) = ram.get_mut(peak) {
                    *sample = amplitude;
                }
                if let Some(sample) = ram.get_mut(peak + 1) {
                    *sample = amplitude / 2;
                }
            } else {
                for (i, sample) in ram.iter_mut().enumerate() {
                    *sample = ((i + chan) % 251) as u8;
                }
            }
        }
    }
}

/// One simulated board on one simulated bus.
#[derive(Debug)]
pub struct SimBoard {
    state: Arc<Mutex<SimState>>,
    log: WireLog,
    label: &'static str,
}

impl SimBoard {
    /// A new board. `label` tags its words in the wire log (`"M"`, `"S"`).
    #[must_use]
    pub fn new(family: Family, label: &'static str, is_master: bool, log: &WireLog) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(family, is_master))),
            log: log.clone(),
            label,
        }
    }

    /// Scripting handle onto this board's state.
    #[must_use]
    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SpiBus for SimBoard {
    fn transfer(&mut self, xfers: &mut [Transfer<'_>]) -> Result<()> {
        let mut state = self.state();
        for xfer in xfers {
            if let Some(tx) = xfer.tx {
                self.log.push(self.label, *tx);
                state.handle_word(tx);
            }
            if let Some(rx) = xfer.rx.as_mut() {
                state.fill_response(rx);
            }
        }
        Ok(())
    }

    fn write_word(&mut self, word: &CmdWord) -> Result<()> {
        self.log.push(self.label, *word);
        self.state().handle_word(word);
        Ok(())
    }

    fn read_word(&mut self, word: &mut CmdWord) -> Result<()> {
        self.state().fill_response(word);
        Ok(())
    }
}

/// Scripting and inspection handle for one simulated board.
#[derive(Debug, Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set a raw register value served by plain register reads.
    pub fn set_register(&self, addr: u8, value: u32) {
        self.state().regfile[addr as usize] = value & 0xff_ffff;
    }

    /// Latch a trigger right now.
    pub fn trigger_now(&self) {
        self.state().latch_trigger();
    }

    /// Make `buffer` become ready once `delay` has elapsed (observed at
    /// the next status poll).
    pub fn make_ready_after(&self, delay: Duration, buffer: u8) {
        self.state().ready_after = Some((Instant::now() + delay, buffer));
    }

    /// Current ready mask.
    #[must_use]
    pub fn ready_mask(&self) -> u8 {
        self.state().ready_mask
    }

    /// Hardware event counter.
    #[must_use]
    pub fn event_counter(&self) -> u64 {
        self.state().event_counter
    }

    /// Shift this board's reported trigger times (drift injection).
    pub fn set_trig_time_offset(&self, clocks: i64) {
        self.state().trig_time_offset = clocks;
    }

    /// Queue an exact trigger time for the next trigger(s).
    pub fn push_trig_time(&self, time: u64) {
        self.state().trig_times.push_back(time);
    }

    /// Calpulser peak sample index per channel.
    pub fn set_peaks(&self, peaks: [u16; NUM_CHAN]) {
        self.state().peaks = peaks;
    }

    /// Peak sets applied one at a time after each ADC clock reset.
    pub fn push_peaks_after_clk_reset(&self, peaks: [u16; NUM_CHAN]) {
        self.state().peak_script.push_back(peaks);
    }

    /// Calpulser peak amplitude.
    pub fn set_peak_amplitude(&self, amplitude: u8) {
        self.state().peak_amplitude = amplitude;
    }

    /// ADC clock resets seen so far.
    #[must_use]
    pub fn clk_resets(&self) -> u32 {
        self.state().clk_resets
    }

    /// Delay-register writes seen so far, as `(adc, delay)` pairs.
    #[must_use]
    pub fn adc_delay_writes(&self) -> Vec<(u8, u8)> {
        self.state().adc_delay_writes.clone()
    }

    /// Whether the sync line is currently asserted.
    #[must_use]
    pub fn sync_asserted(&self) -> bool {
        self.state().sync
    }

    /// Load the packed scaler registers from flat 12-bit counter values.
    pub fn set_scalers(&self, flat: &[u16]) {
        let mut state = self.state();
        for (i, reg) in state.scaler_registers.iter_mut().enumerate() {
            let first = u32::from(flat.get(2 * i).copied().unwrap_or(0)) & 0xfff;
            let second = u32::from(flat.get(2 * i + 1).copied().unwrap_or(0)) & 0xfff;
            *reg = second << 12 | first;
        }
    }
}
