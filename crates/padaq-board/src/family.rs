//! The two hardware generations and everything that differs between them.
//!
//! NP is the first-generation board: 7.5 MHz trigger clock, 15 beams, a
//! 128-entry register space, and a three-transfer register read (the READ
//! prompt word is required between the address select and the response).
//! BN is the second generation: 500 MHz / 16 trigger clock, 20 beams, 256
//! registers, two-transfer register reads, and the extended configuration
//! surface (attenuators, vetoes, dynamic masking, trigger delays, trigger
//! output, external input, polarization, per-ADC delay alignment).

use crate::{MAX_NUM_BEAMS, NUM_SCALERS};

/// Hardware generation of a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// First-generation board.
    Np,
    /// Second-generation board.
    Bn,
}

impl Family {
    /// Trigger/timestamp clock frequency in Hz.
    ///
    /// The 48-bit trigger time advances at this rate; BN runs the counter
    /// at 500 MHz divided by 16.
    #[must_use]
    pub const fn clock_hz(self) -> u64 {
        match self {
            Self::Np => 7_500_000,
            Self::Bn => 500_000_000 / 16,
        }
    }

    /// Number of formed beams the trigger evaluates.
    #[must_use]
    pub const fn num_beams(self) -> usize {
        match self {
            Self::Np => 15,
            Self::Bn => MAX_NUM_BEAMS,
        }
    }

    /// Size of the addressable register space.
    #[must_use]
    pub const fn num_registers(self) -> usize {
        match self {
            Self::Np => 128,
            Self::Bn => 256,
        }
    }

    /// Highest sample RAM address plus one.
    #[must_use]
    pub const fn address_max(self) -> usize {
        match self {
            Self::Np => 128,
            Self::Bn => 256,
        }
    }

    /// SPI clock the board is rated for, in Hz.
    #[must_use]
    pub const fn default_spi_clock_hz(self) -> u32 {
        match self {
            Self::Np => 10_000_000,
            Self::Bn => 20_000_000,
        }
    }

    /// Status register address (ready mask + hardware next-to-read).
    #[must_use]
    pub const fn status_reg(self) -> u8 {
        match self {
            Self::Np => 0x03,
            Self::Bn => 0x07,
        }
    }

    /// Scaler readout register address. Swapped with the status register
    /// between the two generations.
    #[must_use]
    pub const fn scaler_read_reg(self) -> u8 {
        match self {
            Self::Np => 0x07,
            Self::Bn => 0x03,
        }
    }

    /// Address-select register for two-phase register reads.
    #[must_use]
    pub const fn set_read_reg(self) -> u8 {
        match self {
            Self::Np => 0x00,
            Self::Bn => 0x6d,
        }
    }

    /// Chunk select. BN encodes the chunk index in the opcode
    /// (`chunk_reg() + i`); NP uses a fixed opcode with the index in the
    /// payload.
    #[must_use]
    pub const fn chunk_reg(self) -> u8 {
        match self {
            Self::Np => 0x49,
            Self::Bn => 0x23,
        }
    }

    /// Base address of the per-beam threshold registers.
    #[must_use]
    pub const fn thresholds_reg(self) -> u8 {
        match self {
            Self::Np => 0x56,
            Self::Bn => 0x81,
        }
    }

    /// Register read back after a buffer clear to confirm the bits dropped.
    /// NP has no dedicated clear-status register and re-reads status.
    #[must_use]
    pub const fn clear_status_reg(self) -> u8 {
        match self {
            Self::Np => 0x03,
            Self::Bn => 0x09,
        }
    }

    /// Whether register reads need the explicit READ prompt word between
    /// the address select and the response transfer.
    #[must_use]
    pub const fn prompted_read(self) -> bool {
        matches!(self, Self::Np)
    }

    /// Whether this generation carries the extended configuration surface
    /// (attenuation, vetoes, dynamic masking, trigger delays, trigger
    /// output, external input, polarization, ADC delay alignment).
    #[must_use]
    pub const fn has_extended_config(self) -> bool {
        matches!(self, Self::Bn)
    }

    /// Scaler registers latched per status snapshot for this generation.
    #[must_use]
    pub const fn scaler_registers(self) -> usize {
        1 + NUM_SCALERS * (1 + self.num_beams()) / 2
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Np => write!(f, "NP"),
            Self::Bn => write!(f, "BN"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clocks_differ_by_generation() {
        assert_eq!(Family::Np.clock_hz(), 7_500_000);
        assert_eq!(Family::Bn.clock_hz(), 31_250_000);
    }

    #[test]
    fn status_and_scaler_read_are_swapped() {
        assert_eq!(Family::Np.status_reg(), Family::Bn.scaler_read_reg());
        assert_eq!(Family::Bn.status_reg(), 0x07);
    }

    #[test]
    fn scaler_register_counts() {
        // 3 scalers over (1 global + beams) counters, two per register,
        // plus the pick-scaler padding entry.
        assert_eq!(Family::Bn.scaler_registers(), 32);
        assert_eq!(Family::Np.scaler_registers(), 25);
    }
}
