//! Scaler snapshot: trigger rates, latched PPS time, and veto state.

use crate::device::{Board, Device};
use crate::error::Result;
use crate::event::Timestamp;
use crate::spi::Batch;
use padaq_board::bits::{join48, payload24, scaler_pair};
use padaq_board::regs::{self, ReadoutMode};
use padaq_board::{cmd, MAX_NUM_BEAMS, NUM_SCALERS};

/// One latched snapshot of the board's rate counters and live state.
#[derive(Debug, Clone, Default)]
pub struct Status {
    /// Board the snapshot came from.
    pub board_id: u8,
    /// Global scalers, one per category.
    pub global_scalers: [u16; NUM_SCALERS],
    /// Per-beam scalers, `[category][beam]`. NP boards fill a prefix of
    /// the beam axis.
    pub beam_scalers: [[u16; MAX_NUM_BEAMS]; NUM_SCALERS],
    /// Per-beam trigger thresholds at snapshot time.
    pub trigger_thresholds: [u32; MAX_NUM_BEAMS],
    /// Accumulated deadtime.
    pub deadtime: u32,
    /// 48-bit PPS-latched board time (BN).
    pub latched_pps_time: u64,
    /// Live dynamic beam mask (BN).
    pub dynamic_beam_mask: u32,
    /// Live veto state bits (BN).
    pub veto_status: u8,
    /// Wall-clock seconds at snapshot.
    pub readout_time: u64,
    /// Wall-clock nanoseconds at snapshot.
    pub readout_time_ns: u32,
}

impl Device {
    /// Latch and read the full scaler snapshot from one board.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure.
    pub fn read_status(&self, which: Board) -> Result<Status> {
        let family = self.family;
        let commands = family.commands();
        let n_regs = family.scaler_registers();
        let extended = family.has_extended_config();

        let mut scaler_words = vec![[0u8; 4]; n_regs];
        let mut pps = [[0u8; 4]; 2];
        let mut dyn_mask = [0u8; 4];
        let mut veto = [0u8; 4];

        let mut status = Status {
            board_id: self.board_id(which),
            ..Status::default()
        };

        {
            let mut sh = self.lock();
            let io = sh.board_mut(which)?;
            let mut batch = Batch::new(&mut *io.bus, family);
            batch.write(&commands.mode[ReadoutMode::Register.index()])?;
            io.current_mode = Some(ReadoutMode::Register);
            batch.write(&cmd::UPDATE_SCALERS)?;
            for (i, word) in scaler_words.iter_mut().enumerate() {
                batch.write(&commands.pick_scaler[i])?;
                batch.read_register(family.scaler_read_reg(), word)?;
            }
            if extended {
                let (pps0, pps1) = pps.split_at_mut(1);
                batch.read_register(regs::LATCHED_PPS_LOW, &mut pps0[0])?;
                batch.read_register(regs::LATCHED_PPS_HIGH, &mut pps1[0])?;
                batch.read_register(regs::ST_DYN_MASK, &mut dyn_mask)?;
                batch.read_register(regs::VETO_STATUS, &mut veto)?;
            }
            let now = Timestamp::now();
            batch.flush()?;
            drop(batch);
            status.readout_time = now.secs;
            status.readout_time_ns = now.nanos;
        }

        let thresholds = self.thresholds()?;
        for (slot, value) in status.trigger_thresholds.iter_mut().zip(thresholds) {
            *slot = value;
        }

        // Each register packs two 12-bit counters; the flat sequence is
        // one global value followed by the per-beam values, per category.
        let beams = family.num_beams();
        let flat_len = NUM_SCALERS * (1 + beams);
        let mut flat = vec![0u16; flat_len];
        for (i, word) in scaler_words.iter().enumerate() {
            let (first, second) = scaler_pair(word);
            if 2 * i < flat_len {
                flat[2 * i] = first;
            }
            if 2 * i + 1 < flat_len {
                flat[2 * i + 1] = second;
            }
        }
        for (i, value) in flat.into_iter().enumerate() {
            let category = i / (1 + beams);
            let channel = i % (1 + beams);
            if channel == 0 {
                status.global_scalers[category] = value;
            } else {
                status.beam_scalers[category][channel - 1] = value;
            }
        }

        if extended {
            status.latched_pps_time = join48(payload24(&pps[0]), payload24(&pps[1]));
            status.dynamic_beam_mask = payload24(&dyn_mask);
            status.veto_status = veto[3] & 0x3;
        }

        Ok(status)
    }
}
