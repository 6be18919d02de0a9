//! Register map and bit-field layouts.
//!
//! Addresses shared by both generations live here as constants; the handful
//! that moved between generations (status, scaler read, read-address select,
//! chunk select, thresholds base) are methods on [`crate::Family`].
//!
//! Registers at 0x32 and above in the extended block exist only on BN
//! hardware unless noted.

// ── Identity ─────────────────────────────────────────────────────────────

/// Firmware version: byte 3 packs major/minor, byte 1 bit 0 is the
/// master strap.
pub const FIRMWARE_VER: u8 = 0x01;
/// Firmware synthesis date.
pub const FIRMWARE_DATE: u8 = 0x02;
/// Device DNA, low 24 bits.
pub const CHIPID_LOW: u8 = 0x04;
/// Device DNA, middle 24 bits.
pub const CHIPID_MID: u8 = 0x05;
/// Device DNA, high 16 bits.
pub const CHIPID_HI: u8 = 0x06;

// ── Event metadata ───────────────────────────────────────────────────────

/// Event counter, low 24 bits.
pub const EVENT_COUNTER_LOW: u8 = 0x0a;
/// Event counter, high 24 bits.
pub const EVENT_COUNTER_HIGH: u8 = 0x0b;
/// Trigger counter, low 24 bits.
pub const TRIG_COUNTER_LOW: u8 = 0x0c;
/// Trigger counter, high 24 bits.
pub const TRIG_COUNTER_HIGH: u8 = 0x0d;
/// Trigger time, low 24 bits of the 48-bit board clock latch.
pub const TRIG_TIME_LOW: u8 = 0x0e;
/// Trigger time, high 24 bits.
pub const TRIG_TIME_HIGH: u8 = 0x0f;
/// Deadtime counter.
pub const DEADTIME: u8 = 0x10;
/// Trigger info word; see [`trig_info`].
pub const TRIG_INFO: u8 = 0x11;
/// Channel mask / beam mask word; see [`ch_masks`].
pub const CH_MASKS: u8 = 0x12;
/// Beams participating in the last trigger.
pub const LAST_BEAM: u8 = 0x14;
/// Power of the triggering beam.
pub const TRIG_BEAM_POWER: u8 = 0x15;
/// PPS counter latched at trigger time.
pub const PPS_COUNTER: u8 = 0x16;
/// Dynamic beam mask latched at trigger time.
pub const HD_DYN_MASK: u8 = 0x17;
/// User-applied beam mask.
pub const USER_MASK: u8 = 0x18;
/// Veto deadtime counter.
pub const VETO_DEADTIME_CTR: u8 = 0x19;

// ── Status / scalers ─────────────────────────────────────────────────────

/// Live veto state (BN).
pub const VETO_STATUS: u8 = 0x21;
/// Dynamic beam mask, live value (BN).
pub const ST_DYN_MASK: u8 = 0x22;
/// Latch the scalers for readout.
pub const UPDATE_SCALERS: u8 = 0x28;
/// Select which latched scaler register [`Family::scaler_read_reg`] serves.
///
/// [`Family::scaler_read_reg`]: crate::Family::scaler_read_reg
pub const PICK_SCALER: u8 = 0x29;
/// Calibration pulser control.
pub const CALPULSE: u8 = 0x2a;
/// Latched PPS time, low 24 bits (BN).
pub const LATCHED_PPS_LOW: u8 = 0x2c;
/// Latched PPS time, high 24 bits (BN).
pub const LATCHED_PPS_HIGH: u8 = 0x2d;

// ── Readout plumbing ─────────────────────────────────────────────────────

/// Per-board channel mask.
pub const CHANNEL_MASK: u8 = 0x30;
/// Software trigger; write 1 to force an event.
pub const FORCE_TRIG: u8 = 0x40;
/// Select the channel whose RAM subsequent chunk reads serve.
pub const CHANNEL: u8 = 0x41;
/// Readout mode select; see [`ReadoutMode`].
pub const MODE: u8 = 0x42;
/// Sample RAM address select.
pub const RAM_ADDR: u8 = 0x45;
/// Prompt the device to drive the addressed value onto MISO (NP reads).
pub const READ: u8 = 0x47;
/// Pretrigger length in 128-sample blocks.
pub const PRETRIGGER: u8 = 0x4c;
/// Clear event buffers; payload bit per buffer. Payload byte 2 bit 0
/// resets the ring pointers.
pub const CLEAR: u8 = 0x4d;
/// Select the event buffer subsequent reads serve.
pub const BUFFER: u8 = 0x4e;

// ── Trigger configuration ────────────────────────────────────────────────

/// Which polarization(s) trigger: 0 = H, 1 = V, 2 = both (BN).
pub const TRIG_POLARIZATION: u8 = 0x4f;
/// 24-bit beam trigger mask.
pub const TRIGGER_MASK: u8 = 0x50;
/// Trigger holdoff, 12 bits.
pub const TRIG_HOLDOFF: u8 = 0x51;
/// Trigger source enables.
pub const TRIG_ENABLE: u8 = 0x52;
/// Trigger-output pulse shaping (BN).
pub const TRIGOUT_CONFIG: u8 = 0x53;
/// Phased-trigger readout on/off.
pub const PHASED_TRIGGER: u8 = 0x54;
/// Waveform verification mode (BN).
pub const VERIFICATION_MODE: u8 = 0x55;
/// Timestamp source select; 1 = free running.
pub const TIMESTAMP_SELECT: u8 = 0x58;
/// Trigger-path low-pass filter enable (BN).
pub const TRIGGER_LOWPASS: u8 = 0x5a;
/// Dynamic masking enable + threshold (BN).
pub const DYN_MASK: u8 = 0x5d;
/// Dynamic masking holdoff, 16 bits (BN).
pub const DYN_HOLDOFF: u8 = 0x5e;
/// Veto enables and pulse width (BN).
pub const TRIGGER_VETOS: u8 = 0x5f;
/// Saturation / CW / sideswipe cut values (BN).
pub const VETO_CUT_0: u8 = 0x60;
/// Extended cut value (BN).
pub const VETO_CUT_1: u8 = 0x61;

// ── Analog front end (BN) ────────────────────────────────────────────────

/// Attenuation for channels 0..2, bit-reversed per byte on the wire.
pub const ATTEN_012: u8 = 0x32;
/// Attenuation for channels 3..5.
pub const ATTEN_345: u8 = 0x33;
/// Attenuation for channels 6..7.
pub const ATTEN_67: u8 = 0x34;
/// Latch the staged attenuation values into the attenuators.
pub const ATTEN_APPLY: u8 = 0x35;
/// Reset the ADC sampling clocks (realigns per-ADC skew).
pub const ADC_CLK_RST: u8 = 0x37;
/// Per-ADC sample delay base; add the ADC pair index.
pub const ADC_DELAYS: u8 = 0x38;
/// Trigger delays, channels 0..2 (BN).
pub const TRIG_DELAY_012: u8 = 0x3d;
/// Trigger delays, channels 3..5 (BN).
pub const TRIG_DELAY_345: u8 = 0x3e;
/// Trigger delays, channels 6..7 (BN).
pub const TRIG_DELAY_67: u8 = 0x3f;

// ── External input / sync / resets ───────────────────────────────────────

/// External trigger input options (BN).
pub const EXT_INPUT_CONFIG: u8 = 0x4b;
/// Sync line; held high while a synchronized command lands on the slave.
pub const SYNC: u8 = 0x27;
/// Counter reset; write 1.
pub const RESET_COUNTER: u8 = 0x7e;
/// Global reset; 1 = full FPGA reload, 2 = almost-global.
pub const RESET_ALL: u8 = 0x7f;

/// Readout mode written to [`MODE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadoutMode {
    /// Register access.
    Register = 0,
    /// Waveform sample RAM.
    Waveforms = 1,
    /// Beamformed sums.
    Beams = 2,
    /// Power sums.
    PowerSum = 3,
}

impl ReadoutMode {
    /// Index into the mode command table.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Status register fields.
pub mod status {
    use crate::BUF_MASK;

    /// Ready-buffer mask from a status response word.
    #[must_use]
    pub const fn buffer_mask(word: &[u8; 4]) -> u8 {
        word[3] & BUF_MASK
    }

    /// Hardware next-to-read buffer index from a status response word.
    #[must_use]
    pub const fn hardware_next(word: &[u8; 4]) -> u8 {
        (word[2] >> 4) & 0x3
    }
}

/// Trigger-info word fields (24-bit payload of [`TRIG_INFO`]).
pub mod trig_info {
    /// Buffer the event landed in, bits 22..24.
    #[must_use]
    pub const fn buffer(v: u32) -> u8 {
        ((v >> 22) & 0x3) as u8
    }

    /// Calpulser flag, bit 21.
    #[must_use]
    pub const fn calpulser(v: u32) -> bool {
        (v >> 21) & 1 != 0
    }

    /// Trigger type, bits 15..17: 0 software, 1 RF, 2 external.
    #[must_use]
    pub const fn trig_type(v: u32) -> u8 {
        ((v >> 15) & 0x3) as u8
    }

    /// Polarization the trigger fired on, bits 0..4.
    #[must_use]
    pub const fn polarization(v: u32) -> u8 {
        (v & 0xf) as u8
    }
}

/// Channel-mask word fields (24-bit payload of [`CH_MASKS`]).
pub mod ch_masks {
    /// Gate flag, bit 23.
    #[must_use]
    pub const fn gate(v: u32) -> bool {
        (v >> 23) & 1 != 0
    }

    /// Channel mask, bits 15..23.
    #[must_use]
    pub const fn channel_mask(v: u32) -> u8 {
        ((v >> 15) & 0xff) as u8
    }

    /// Beam mask, bits 0..15.
    #[must_use]
    pub const fn beam_mask(v: u32) -> u32 {
        v & 0x7fff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trig_info_fields() {
        // Buffer 2, calpulser set, type RF, polarization V.
        let v = (2 << 22) | (1 << 21) | (1 << 15) | 0x1;
        assert_eq!(trig_info::buffer(v), 2);
        assert!(trig_info::calpulser(v));
        assert_eq!(trig_info::trig_type(v), 1);
        assert_eq!(trig_info::polarization(v), 1);
    }

    #[test]
    fn status_fields() {
        let word = [0x07, 0x00, 0x30, 0x0b];
        assert_eq!(status::buffer_mask(&word), 0xb);
        assert_eq!(status::hardware_next(&word), 3);
    }

    #[test]
    fn ch_masks_fields() {
        let v = (1 << 23) | (0xab << 15) | 0x155;
        assert!(ch_masks::gate(v));
        assert_eq!(ch_masks::channel_mask(v), 0xab);
        assert_eq!(ch_masks::beam_mask(v), 0x155);
    }
}
