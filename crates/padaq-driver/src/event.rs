//! Event, header, and buffer-mask types filled by the readout path.

use padaq_board::{MAX_BOARDS, MAX_WAVEFORM_LENGTH, NUM_BUFFER, NUM_CHAN};

/// Seconds / nanoseconds wall-clock pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    /// Seconds since the epoch.
    pub secs: u64,
    /// Nanosecond remainder.
    pub nanos: u32,
}

impl Timestamp {
    /// Current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let d = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: d.as_secs(),
            nanos: d.subsec_nanos(),
        }
    }

    /// Midpoint of two timestamps, used to pin the counter-reset instant.
    #[must_use]
    pub fn midpoint(a: Self, b: Self) -> Self {
        let mut nanos = (a.nanos + b.nanos) / 2;
        let sum = a.secs + b.secs;
        let mut secs = sum / 2;
        if sum % 2 == 1 {
            nanos += 500_000_000;
        }
        if nanos >= 1_000_000_000 {
            secs += 1;
            nanos -= 1_000_000_000;
        }
        Self { secs, nanos }
    }
}

/// What fired the trigger, from bits 15..17 of the trigger-info word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TriggerType {
    /// Software-forced trigger.
    #[default]
    Software,
    /// RF (beamformed) trigger.
    Rf,
    /// External input trigger.
    External,
    /// Calibration pulser trigger.
    Calpulser,
}

impl TriggerType {
    /// Decode the two trigger-type bits.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            1 => Self::Rf,
            2 => Self::External,
            3 => Self::Calpulser,
            _ => Self::Software,
        }
    }
}

/// Set of ready event buffers (bits 0..4).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferMask(u8);

impl BufferMask {
    /// No buffers ready.
    pub const EMPTY: Self = Self(0);

    /// Mask from raw status bits.
    #[must_use]
    pub const fn new(bits: u8) -> Self {
        Self(bits & padaq_board::BUF_MASK)
    }

    /// Mask with a single buffer set.
    #[must_use]
    pub const fn single(buffer: u8) -> Self {
        Self::new(1 << buffer)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True when no buffer is ready.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether the given buffer is in the set.
    #[must_use]
    pub const fn contains(self, buffer: u8) -> bool {
        self.0 & (1 << buffer) != 0
    }

    /// Number of ready buffers.
    #[must_use]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Lowest ready buffer index, if any.
    #[must_use]
    pub const fn lowest(self) -> Option<u8> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as u8)
        }
    }
}

impl std::fmt::Display for BufferMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#03x}", self.0)
    }
}

/// Bits of [`EventHeader::sync_problem`].
pub mod sync_problem {
    /// Hardware buffer number disagreed with the software cursor, or the
    /// cursor had to resync to the ready mask.
    pub const BUFFER_MISMATCH: u8 = 1 << 0;
    /// Master and slave trigger numbers disagreed.
    pub const TRIG_NUMBER_MISMATCH: u8 = 1 << 1;
    /// Master and slave trigger times differed by more than two clocks.
    pub const TRIG_TIME_DRIFT: u8 = 1 << 2;
    /// Master and slave buffer numbers disagreed.
    pub const BUFFER_DRIFT: u8 = 1 << 3;
}

/// Per-event metadata, one record per buffer read.
///
/// Logical fields (event number, trigger number, masks) come from the
/// master; per-board arrays keep the slave's own readout time, trigger
/// time, deadtime, and board id so divergence stays observable.
#[derive(Debug, Clone, Default)]
pub struct EventHeader {
    /// Readout-offset-adjusted event number.
    pub event_number: u64,
    /// 48-bit hardware trigger counter.
    pub trig_number: u64,
    /// Samples per channel in this event.
    pub buffer_length: u16,
    /// Pretrigger window in samples.
    pub pretrigger_samples: u16,
    /// Wall-clock seconds at readout, per board.
    pub readout_time: [u64; MAX_BOARDS],
    /// Wall-clock nanoseconds at readout, per board.
    pub readout_time_ns: [u32; MAX_BOARDS],
    /// 48-bit board-clock latch at trigger, per board.
    pub trig_time: [u64; MAX_BOARDS],
    /// Trigger time projected onto the wall clock, seconds.
    pub approx_trigger_time: u64,
    /// Trigger time projected onto the wall clock, nanoseconds.
    pub approx_trigger_time_ns: u32,
    /// Beams participating in the trigger.
    pub triggered_beams: u32,
    /// Beam mask in force at trigger time.
    pub beam_mask: u32,
    /// Power of the triggering beam.
    pub beam_power: u32,
    /// Channel mask in force at trigger time (master).
    pub channel_mask: u8,
    /// Channels actually read out, per board.
    pub channel_read_mask: [u8; MAX_BOARDS],
    /// Trigger source.
    pub trig_type: TriggerType,
    /// Calpulser was firing.
    pub calpulser: bool,
    /// Deadtime counter, per board.
    pub deadtime: [u32; MAX_BOARDS],
    /// Buffer the event was read from.
    pub buffer_number: u8,
    /// Ready mask at the time of the read.
    pub buffer_mask: BufferMask,
    /// Board ids, master then slave.
    pub board_id: [u8; MAX_BOARDS],
    /// PPS counter latched at trigger.
    pub pps_counter: u32,
    /// Dynamic beam mask latched at trigger.
    pub dynamic_beam_mask: u32,
    /// Veto deadtime counter.
    pub veto_deadtime_counter: u32,
    /// Gate flag from the channel-mask word.
    pub gate_flag: bool,
    /// Polarization bits the trigger fired on.
    pub trig_pol: u8,
    /// Observed inconsistencies; see [`sync_problem`]. Zero when clean.
    pub sync_problem: u8,
}

/// Waveform samples for one event across both boards.
///
/// Channels outside the read mask, and the entire slave plane on a
/// single-board device, stay zero-filled. At 16 KiB this wants to live on
/// the heap; [`Event::boxed`] allocates one zeroed.
#[derive(Debug, Clone)]
pub struct Event {
    /// Matches [`EventHeader::event_number`].
    pub event_number: u64,
    /// Valid samples per channel.
    pub buffer_length: u16,
    /// Board ids, master then slave.
    pub board_id: [u8; MAX_BOARDS],
    /// 8-bit samples, `[board][channel][sample]`.
    pub data: [[[u8; MAX_WAVEFORM_LENGTH]; NUM_CHAN]; MAX_BOARDS],
}

impl Default for Event {
    fn default() -> Self {
        Self {
            event_number: 0,
            buffer_length: 0,
            board_id: [0; MAX_BOARDS],
            data: [[[0; MAX_WAVEFORM_LENGTH]; NUM_CHAN]; MAX_BOARDS],
        }
    }
}

impl Event {
    /// A zeroed event on the heap.
    #[must_use]
    pub fn boxed() -> Box<Self> {
        Box::default()
    }
}

/// Project a 48-bit trigger time onto the wall clock anchored at the last
/// counter reset, carrying nanosecond overflow into seconds.
#[must_use]
pub(crate) fn approx_trigger_time(start: Timestamp, trig_time: u64, clock_hz: u64) -> Timestamp {
    let mut secs = start.secs + trig_time / clock_hz;
    let rem = trig_time % clock_hz;
    let mut nanos = u64::from(start.nanos) + rem * 1_000_000_000 / clock_hz;
    if nanos >= 1_000_000_000 {
        secs += nanos / 1_000_000_000;
        nanos %= 1_000_000_000;
    }
    Timestamp {
        secs,
        nanos: nanos as u32,
    }
}

/// Buffers are a ring of [`NUM_BUFFER`]; the cursor wraps as an integer.
pub(crate) const fn next_buffer(current: u8) -> u8 {
    (current + 1) % NUM_BUFFER as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_basics() {
        let m = BufferMask::new(0b1010);
        assert!(!m.is_empty());
        assert_eq!(m.count(), 2);
        assert_eq!(m.lowest(), Some(1));
        assert!(m.contains(3));
        assert!(!m.contains(0));
        assert_eq!(BufferMask::EMPTY.lowest(), None);
        // Bits above the ring width are ignored.
        assert_eq!(BufferMask::new(0xf0).bits(), 0);
    }

    #[test]
    fn cursor_wraps_modulo_ring() {
        assert_eq!(next_buffer(0), 1);
        assert_eq!(next_buffer(3), 0);
    }

    #[test]
    fn midpoint_carries_odd_second() {
        let a = Timestamp {
            secs: 10,
            nanos: 900_000_000,
        };
        let b = Timestamp {
            secs: 11,
            nanos: 900_000_000,
        };
        let m = Timestamp::midpoint(a, b);
        assert_eq!(m.secs, 11);
        assert_eq!(m.nanos, 400_000_000);
    }

    #[test]
    fn trigger_time_projection_carries_nanoseconds() {
        // 0x0000_0112_3456 clocks at 31.25 MHz is 575_048_384 ns.
        let start = Timestamp {
            secs: 1_700_000_000,
            nanos: 0,
        };
        let t = approx_trigger_time(start, 0x0000_0112_3456, 31_250_000);
        assert_eq!(t.secs, 1_700_000_000);
        assert_eq!(t.nanos, 575_048_384);

        // A start-time nanosecond remainder that overflows carries over.
        let start = Timestamp {
            secs: 5,
            nanos: 600_000_000,
        };
        let t = approx_trigger_time(start, 31_250_000 / 2, 31_250_000);
        assert_eq!(t.secs, 6);
        assert_eq!(t.nanos, 100_000_000);
    }

    #[test]
    fn trigger_type_decodes() {
        assert_eq!(TriggerType::from_bits(0), TriggerType::Software);
        assert_eq!(TriggerType::from_bits(1), TriggerType::Rf);
        assert_eq!(TriggerType::from_bits(2), TriggerType::External);
        assert_eq!(TriggerType::from_bits(3), TriggerType::Calpulser);
    }
}
