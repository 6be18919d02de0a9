//! Precomputed SPI command words and configuration-register encoders.
//!
//! Every word on the wire is `[opcode, payload_hi, payload_mid, payload_lo]`.
//! The indexed tables exist so that batched transfers can point at shared
//! read-only words instead of encoding per call; they are const-built, one
//! set per hardware generation, and immutable for the life of the process.

use crate::bits::reverse_bits;
use crate::family::Family;
use crate::{regs, MAX_SCALER_REGISTERS, NUM_ADC, NUM_BUFFER, NUM_CHAN, NUM_CHUNK, NUM_MODE};

/// One 4-byte SPI command word.
pub type CmdWord = [u8; crate::WORD_SIZE];

// ── Fixed words ──────────────────────────────────────────────────────────

/// Assert the master/slave sync line.
pub const SYNC_ON: CmdWord = [regs::SYNC, 0, 0, 1];
/// Release the master/slave sync line.
pub const SYNC_OFF: CmdWord = [regs::SYNC, 0, 0, 0];
/// Full reset (FPGA reload).
pub const RESET_ALL: CmdWord = [regs::RESET_ALL, 0, 0, 1];
/// Almost-global reset (keeps the FPGA image).
pub const RESET_ALMOST_ALL: CmdWord = [regs::RESET_ALL, 0, 0, 2];
/// Reset the event / trigger-time counters.
pub const RESET_COUNTER: CmdWord = [regs::RESET_COUNTER, 0, 0, 1];
/// Realign the ADC sampling clocks.
pub const ADC_CLK_RST: CmdWord = [regs::ADC_CLK_RST, 0, 0, 0];
/// Latch staged attenuation values.
pub const ATTEN_APPLY: CmdWord = [regs::ATTEN_APPLY, 0, 0, 0];
/// Latch the scalers for readout.
pub const UPDATE_SCALERS: CmdWord = [regs::UPDATE_SCALERS, 0, 0, 1];
/// Prompt the device to drive the addressed register onto MISO.
pub const READ_PROMPT: CmdWord = [regs::READ, 0, 0, 0];
/// Clear all buffers.
pub const CLEAR_ALL_BUFFERS: CmdWord = [regs::CLEAR, 0, 0, crate::BUF_MASK];
/// Reset the buffer-ring pointers to zero.
pub const CLEAR_RING: CmdWord = [regs::CLEAR, 0, 1, 0];
/// Software trigger.
pub const FORCE_TRIGGER: CmdWord = [regs::FORCE_TRIG, 0, 0, 1];
/// Free-running timestamp mode.
pub const TIMESTAMP_FREE_RUN: CmdWord = [regs::TIMESTAMP_SELECT, 0, 0, 1];

// ── Indexed tables ───────────────────────────────────────────────────────

/// The full set of indexed command words for one hardware generation.
#[derive(Debug)]
pub struct CommandSet {
    /// Readout mode select, by [`regs::ReadoutMode`] index.
    pub mode: [CmdWord; NUM_MODE],
    /// Read-address select, by register address. NP hardware only decodes
    /// the first 128 entries.
    pub set_read_reg: [CmdWord; 256],
    /// Channel select. One-hot payload on BN, integer payload on NP.
    pub channel: [CmdWord; NUM_CHAN],
    /// Event-buffer select.
    pub buffer: [CmdWord; NUM_BUFFER],
    /// Chunk select. Opcode-indexed on BN, payload-indexed on NP.
    pub chunk: [CmdWord; NUM_CHUNK],
    /// Sample RAM address select. NP hardware only decodes the first 128.
    pub ram_addr: [CmdWord; 256],
    /// Buffer clear, by clear mask.
    pub clear: [CmdWord; 1 << NUM_BUFFER],
    /// Scaler pick, by latched register index.
    pub pick_scaler: [CmdWord; MAX_SCALER_REGISTERS],
}

const fn indexed<const N: usize>(opcode: u8) -> [CmdWord; N] {
    let mut table = [[0u8; 4]; N];
    let mut i = 0;
    while i < N {
        table[i] = [opcode, 0, 0, i as u8];
        i += 1;
    }
    table
}

impl CommandSet {
    const fn build(family: Family) -> Self {
        let mut channel = [[0u8; 4]; NUM_CHAN];
        let mut i = 0;
        while i < NUM_CHAN {
            let payload = match family {
                Family::Bn => 1 << i,
                Family::Np => i as u8,
            };
            channel[i] = [regs::CHANNEL, 0, 0, payload];
            i += 1;
        }

        let mut chunk = [[0u8; 4]; NUM_CHUNK];
        let mut i = 0;
        while i < NUM_CHUNK {
            chunk[i] = match family {
                Family::Bn => [family.chunk_reg() + i as u8, 0, 0, 0],
                Family::Np => [family.chunk_reg(), 0, 0, i as u8],
            };
            i += 1;
        }

        Self {
            mode: indexed(regs::MODE),
            set_read_reg: indexed(family.set_read_reg()),
            channel,
            buffer: indexed(regs::BUFFER),
            chunk,
            ram_addr: indexed(regs::RAM_ADDR),
            clear: indexed(regs::CLEAR),
            pick_scaler: indexed(regs::PICK_SCALER),
        }
    }
}

static NP_COMMANDS: CommandSet = CommandSet::build(Family::Np);
static BN_COMMANDS: CommandSet = CommandSet::build(Family::Bn);

impl Family {
    /// The command tables for this generation.
    #[must_use]
    pub fn commands(self) -> &'static CommandSet {
        match self {
            Self::Np => &NP_COMMANDS,
            Self::Bn => &BN_COMMANDS,
        }
    }
}

// ── Configuration encoders ───────────────────────────────────────────────

/// Threshold write for one beam. Values clamp to the 20-bit register width.
#[must_use]
pub fn threshold_word(family: Family, beam: usize, value: u32) -> CmdWord {
    let v = if value > 0xf_ffff { 0xf_ffff } else { value };
    [
        family.thresholds_reg() + beam as u8,
        ((v >> 16) & 0x0f) as u8,
        ((v >> 8) & 0xff) as u8,
        (v & 0xff) as u8,
    ]
}

/// Decode a threshold register response.
#[must_use]
pub fn threshold_from_word(word: &CmdWord) -> u32 {
    u32::from(word[3]) | u32::from(word[2]) << 8 | u32::from(word[1] & 0x0f) << 16
}

/// 24-bit beam trigger mask write.
#[must_use]
pub fn trigger_mask_word(mask: u32) -> CmdWord {
    [
        regs::TRIGGER_MASK,
        ((mask >> 16) & 0xff) as u8,
        ((mask >> 8) & 0xff) as u8,
        (mask & 0xff) as u8,
    ]
}

/// Per-board channel mask write.
#[must_use]
pub fn channel_mask_word(mask: u8) -> CmdWord {
    [regs::CHANNEL_MASK, 0, 0, mask]
}

/// Pretrigger write, in 128-sample blocks.
#[must_use]
pub fn pretrigger_word(pretrigger: u8) -> CmdWord {
    [regs::PRETRIGGER, 0, 0, pretrigger & 0x0f]
}

/// Calpulser control write.
#[must_use]
pub fn calpulse_word(state: u8) -> CmdWord {
    [regs::CALPULSE, 0, 0, state]
}

/// Phased-trigger readout on/off.
#[must_use]
pub fn phased_trigger_word(enabled: bool) -> CmdWord {
    [regs::PHASED_TRIGGER, 0, 0, u8::from(enabled)]
}

/// Trigger holdoff write, 12 bits.
#[must_use]
pub fn trigger_holdoff_word(holdoff: u16) -> CmdWord {
    [
        regs::TRIG_HOLDOFF,
        0,
        ((holdoff >> 8) & 0x0f) as u8,
        (holdoff & 0xff) as u8,
    ]
}

/// The three attenuation register writes for eight channel levels.
///
/// The attenuator serial interface shifts MSB first, so each payload byte
/// goes out bit-reversed; [`attenuation_from_words`] undoes it on readback.
#[must_use]
pub fn attenuation_words(levels: &[u8; NUM_CHAN]) -> [CmdWord; 3] {
    let pack = |reg: u8, a: u8, b: u8, c: u8| -> CmdWord {
        [reg, reverse_bits(a), reverse_bits(b), reverse_bits(c)]
    };
    [
        pack(regs::ATTEN_012, levels[2], levels[1], levels[0]),
        pack(regs::ATTEN_345, levels[5], levels[4], levels[3]),
        pack(regs::ATTEN_67, 0, levels[7], levels[6]),
    ]
}

/// Decode the three attenuation register responses back to channel levels.
#[must_use]
pub fn attenuation_from_words(words: &[CmdWord; 3]) -> [u8; NUM_CHAN] {
    let [w012, w345, w67] = words;
    [
        reverse_bits(w012[3]),
        reverse_bits(w012[2]),
        reverse_bits(w012[1]),
        reverse_bits(w345[3]),
        reverse_bits(w345[2]),
        reverse_bits(w345[1]),
        reverse_bits(w67[3]),
        reverse_bits(w67[2]),
    ]
}

/// The three trigger-delay register writes for eight per-channel delays.
#[must_use]
pub fn trigger_delay_words(delays: &[u8; NUM_CHAN]) -> [CmdWord; 3] {
    [
        [regs::TRIG_DELAY_012, delays[2], delays[1], delays[0]],
        [regs::TRIG_DELAY_345, delays[5], delays[4], delays[3]],
        [regs::TRIG_DELAY_67, 0, delays[7], delays[6]],
    ]
}

/// Decode the three trigger-delay register responses.
#[must_use]
pub fn trigger_delays_from_words(words: &[CmdWord; 3]) -> [u8; NUM_CHAN] {
    let [w012, w345, w67] = words;
    [
        w012[3], w012[2], w012[1], w345[3], w345[2], w345[1], w67[3], w67[2],
    ]
}

/// Per-ADC sample delay write. Bit 4 of each delay byte is the
/// delay-enable; the delay itself is four bits.
#[must_use]
pub fn adc_delay_word(adc: usize, delay: u8) -> CmdWord {
    let d = (delay & 0x0f) | 0x10;
    debug_assert!(adc < NUM_ADC);
    [regs::ADC_DELAYS + adc as u8, 0, d, d]
}

/// Dynamic-masking enable + threshold write.
#[must_use]
pub fn dyn_mask_word(enable: bool, threshold: u8) -> CmdWord {
    [regs::DYN_MASK, 0, u8::from(enable), threshold]
}

/// Dynamic-masking holdoff write, 16 bits.
#[must_use]
pub fn dyn_holdoff_word(holdoff: u16) -> CmdWord {
    [
        regs::DYN_HOLDOFF,
        0,
        (holdoff >> 8) as u8,
        (holdoff & 0xff) as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every table entry must match the live encoding for its index.
    #[test]
    fn table_invariance() {
        for family in [Family::Np, Family::Bn] {
            let t = family.commands();
            for (i, w) in t.mode.iter().enumerate() {
                assert_eq!(*w, [regs::MODE, 0, 0, i as u8]);
            }
            for (i, w) in t.set_read_reg.iter().enumerate() {
                assert_eq!(*w, [family.set_read_reg(), 0, 0, i as u8]);
            }
            for (i, w) in t.buffer.iter().enumerate() {
                assert_eq!(*w, [regs::BUFFER, 0, 0, i as u8]);
            }
            for (i, w) in t.ram_addr.iter().enumerate() {
                assert_eq!(*w, [regs::RAM_ADDR, 0, 0, i as u8]);
            }
            for (i, w) in t.clear.iter().enumerate() {
                assert_eq!(*w, [regs::CLEAR, 0, 0, i as u8]);
            }
            for (i, w) in t.pick_scaler.iter().enumerate() {
                assert_eq!(*w, [regs::PICK_SCALER, 0, 0, i as u8]);
            }
        }
    }

    /// Channel selects are one-hot on BN and integer on NP.
    #[test]
    fn channel_encoding_per_family() {
        for (i, w) in Family::Bn.commands().channel.iter().enumerate() {
            assert_eq!(*w, [regs::CHANNEL, 0, 0, 1 << i]);
        }
        for (i, w) in Family::Np.commands().channel.iter().enumerate() {
            assert_eq!(*w, [regs::CHANNEL, 0, 0, i as u8]);
        }
    }

    /// Chunk selects are opcode-indexed on BN and payload-indexed on NP.
    #[test]
    fn chunk_encoding_per_family() {
        for (i, w) in Family::Bn.commands().chunk.iter().enumerate() {
            assert_eq!(*w, [Family::Bn.chunk_reg() + i as u8, 0, 0, 0]);
        }
        for (i, w) in Family::Np.commands().chunk.iter().enumerate() {
            assert_eq!(*w, [Family::Np.chunk_reg(), 0, 0, i as u8]);
        }
    }

    #[test]
    fn threshold_clamps_to_20_bits() {
        let w = threshold_word(Family::Bn, 0, 0x1234_5678);
        assert_eq!(w, [Family::Bn.thresholds_reg(), 0x0f, 0xff, 0xff]);
        assert_eq!(threshold_from_word(&w), 0xf_ffff);
    }

    #[test]
    fn threshold_roundtrip() {
        for v in [0u32, 100, 0x1_2345, 0xf_ffff] {
            let w = threshold_word(Family::Bn, 3, v);
            assert_eq!(w[0], Family::Bn.thresholds_reg() + 3);
            assert_eq!(threshold_from_word(&w), v);
        }
    }

    #[test]
    fn attenuation_bit_reversal_is_symmetric() {
        let levels = [0x01, 0x3f, 0x2a, 0x15, 0x00, 0x07, 0x38, 0x1c];
        let words = attenuation_words(&levels);
        // 0x01 for channel 0 lands in byte 3 of the first register,
        // MSB-first on the wire.
        assert_eq!(words[0][3], 0x80);
        assert_eq!(attenuation_from_words(&words), levels);
    }

    #[test]
    fn adc_delay_sets_enable_bit() {
        assert_eq!(adc_delay_word(1, 2), [regs::ADC_DELAYS + 1, 0, 0x12, 0x12]);
        // Delay wider than four bits is truncated, enable stays set.
        assert_eq!(adc_delay_word(0, 0x1f), [regs::ADC_DELAYS, 0, 0x1f, 0x1f]);
    }

    #[test]
    fn trigger_mask_is_big_endian_payload() {
        assert_eq!(
            trigger_mask_word(0x00ab_cdef),
            [regs::TRIGGER_MASK, 0xab, 0xcd, 0xef]
        );
    }
}
