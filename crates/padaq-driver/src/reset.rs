//! Graded resets and the ADC sample-delay alignment procedure.

use crate::device::{Board, Device};
use crate::error::{DaqError, Result};
use crate::event::{Event, EventHeader, Timestamp};
use padaq_board::cmd;
use padaq_board::{MAX_WAVEFORM_LENGTH, NUM_ADC, NUM_CHAN};

/// Smallest per-channel peak amplitude the calpulser must produce before
/// delays are trusted.
const MIN_GOOD_MAX_V: u8 = 20;

/// Widest acceptable spread between per-channel peak positions; anything
/// larger than the delay registers can absorb forces a clock reset.
const MAX_PEAK_SPREAD: u16 = 16;

/// Alignment attempts before giving up.
const MAX_MISERY: u32 = 100;

/// What to reset, weakest first. Stronger levels imply the alignment and
/// counter-reset steps of the weaker ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResetLevel {
    /// Clear buffers and restart the event / trigger-time counters.
    Counters,
    /// Also realign the ADC sample delays against the calpulser.
    Calibrate,
    /// Board reset that keeps the FPGA image, then the above.
    AlmostGlobal,
    /// Full FPGA reload, then the above.
    Global,
}

impl Device {
    /// Perform a graded reset.
    ///
    /// Every level disables phased-trigger readout and clears the buffer
    /// ring first; the counter reset always runs last, bracketing the
    /// write with wall-clock samples whose midpoint becomes the new
    /// trigger-time anchor.
    ///
    /// # Errors
    ///
    /// Returns [`DaqError::ResetFailed`] if a mandatory step fails and
    /// [`DaqError::CalibrationFailed`] if delay alignment gives up.
    pub fn reset(&self, level: ResetLevel) -> Result<()> {
        match level {
            ResetLevel::Global => {
                let mut sh = self.lock();
                sh.synchronized_command(self.family, &cmd::RESET_ALL, None)
                    .map_err(|e| DaqError::reset_failed(format!("global reset write: {e}")))?;
                drop(sh);
                tracing::info!("full reset, waiting for the FPGA to come back");
                std::thread::sleep(self.options.reset_settle);
            }
            ResetLevel::AlmostGlobal => {
                self.lock()
                    .write_each(&cmd::RESET_ALMOST_ALL)
                    .map_err(|e| DaqError::reset_failed(format!("almost-global write: {e}")))?;
                tracing::info!("almost-global reset, waiting for the boards");
                std::thread::sleep(self.options.reset_settle);
            }
            ResetLevel::Calibrate | ResetLevel::Counters => {}
        }

        if self.family.has_extended_config() {
            self.set_phased_trigger_readout(false)
                .map_err(|e| DaqError::reset_failed(format!("disabling readout: {e}")))?;
        }

        {
            let mut sh = self.lock();
            sh.write_each(&cmd::CLEAR_ALL_BUFFERS)
                .and_then(|()| sh.write_each(&cmd::CLEAR_RING))
                .map_err(|e| DaqError::reset_failed(format!("clearing buffers: {e}")))?;
            sh.next_read_buffer = 0;
            sh.master.invalidate_cache();
            if let Some(slave) = sh.slave.as_mut() {
                slave.invalidate_cache();
            }
        }

        if level >= ResetLevel::Calibrate {
            if self.family.has_extended_config() {
                self.align_adc_delays()?;
            } else {
                tracing::debug!("no ADC delay registers on {} boards, skipping", self.family);
            }
        }

        // Counters last: free-running timestamps, then the reset itself.
        if self.family.has_extended_config() {
            self.lock()
                .write_each(&cmd::TIMESTAMP_FREE_RUN)
                .map_err(|e| DaqError::reset_failed(format!("timestamp select: {e}")))?;
        }

        let mut sh = self.lock();
        let before = Timestamp::now();
        let written = if sh.has_slave() {
            sh.synchronized_command(self.family, &cmd::RESET_COUNTER, None)
                .map(|_| ())
        } else {
            sh.master.bus.write_word(&cmd::RESET_COUNTER)
        };
        written.map_err(|e| DaqError::reset_failed(format!("counter reset: {e}")))?;
        let after = Timestamp::now();

        sh.start_time = Timestamp::midpoint(before, after);
        sh.event_counter = 0;
        Ok(())
    }

    /// Align the per-ADC sample delays using the on-board calpulser.
    ///
    /// Fires software triggers at the pulser and measures where each
    /// channel's peak lands; once all peaks sit within [`MAX_PEAK_SPREAD`]
    /// samples and above [`MIN_GOOD_MAX_V`] counts, writes each ADC pair's
    /// average offset from the earliest peak into the delay registers.
    /// Whatever happens, the pulser ends up off, the buffers cleared, and
    /// the previous buffer length and trigger enables restored.
    fn align_adc_delays(&self) -> Result<()> {
        let old_length = self.buffer_length();
        self.set_buffer_length(MAX_WAVEFORM_LENGTH as u16);

        let old_enables = self.trigger_enables(Board::Master)?;
        let mut quiet = old_enables;
        quiet.beamforming = false;
        self.set_trigger_enables(quiet, Board::Master)?;

        self.calpulse(3)?;
        let outcome = self.alignment_loop();

        // Cleanup runs on success and failure alike.
        self.set_buffer_length(old_length);
        if let Err(e) = self.calpulse(0) {
            tracing::warn!("could not disable calpulser after alignment: {e}");
        }
        if let Err(e) = self.lock().write_each(&cmd::CLEAR_ALL_BUFFERS) {
            tracing::warn!("could not clear buffers after alignment: {e}");
        }
        if let Err(e) = self.set_trigger_enables(old_enables, Board::Master) {
            tracing::warn!("could not restore trigger enables after alignment: {e}");
        }

        outcome
    }

    fn alignment_loop(&self) -> Result<()> {
        let mut header = EventHeader::default();
        let mut event = Event::boxed();
        let mut misery: u32 = 0;

        loop {
            if misery > 0 {
                if misery > MAX_MISERY {
                    tracing::error!("maximum misery reached, giving up on ADC alignment");
                    return Err(DaqError::CalibrationFailed { attempts: misery });
                }
                if misery > 3 {
                    tracing::warn!(misery, "ADC alignment still retrying");
                }
                {
                    let mut sh = self.lock();
                    if sh.has_slave() {
                        sh.synchronized_command(self.family, &cmd::ADC_CLK_RST, None)?;
                    } else {
                        sh.master.bus.write_word(&cmd::ADC_CLK_RST)?;
                    }
                }
                if misery > 1 {
                    std::thread::sleep(self.options.adc_settle);
                }
            }
            misery += 1;

            self.sw_trigger()?;
            let mask = self.wait(Some(self.options.trigger_wait))?;
            if mask.is_empty() {
                tracing::warn!("no buffer ready after a software trigger, retrying");
                continue;
            }
            if mask.count() > 1 {
                tracing::warn!(mask = %mask, "more than one buffer ready during alignment");
            }
            let Some(buffer) = mask.lowest() else { continue };
            self.read_single(buffer, &mut header, &mut event)?;

            // Locate each channel's peak.
            let (read_masks, boards) = {
                let sh = self.lock();
                (sh.channel_read_mask, sh.num_boards())
            };
            let mut peak_index = [[0u16; NUM_CHAN]; 2];
            let mut min_peak = u16::MAX;
            let mut max_peak = 0u16;
            let mut min_amplitude = u8::MAX;
            for ibd in 0..boards {
                for chan in 0..NUM_CHAN {
                    if read_masks[ibd] & (1 << chan) == 0 {
                        continue;
                    }
                    let (index, amplitude) = peak_of(&event.data[ibd][chan]);
                    peak_index[ibd][chan] = index;
                    min_peak = min_peak.min(index);
                    max_peak = max_peak.max(index);
                    min_amplitude = min_amplitude.min(amplitude);
                    tracing::debug!(board = ibd, chan, index, amplitude, "calpulser peak");
                }
            }

            if min_amplitude < MIN_GOOD_MAX_V {
                tracing::warn!(
                    min_amplitude,
                    "weak calpulser peak, did every channel see a pulse?"
                );
                continue;
            }
            if max_peak - min_peak > MAX_PEAK_SPREAD {
                tracing::warn!(spread = max_peak - min_peak, "peaks too far apart, retrying");
                continue;
            }

            // Two channels share each ADC; write their average offset.
            let mut sh = self.lock();
            for ibd in 0..boards {
                for adc in 0..NUM_ADC {
                    if read_masks[ibd] & (1 << (2 * adc)) == 0 {
                        continue;
                    }
                    let pair_sum = peak_index[ibd][2 * adc] + peak_index[ibd][2 * adc + 1];
                    let delay = (pair_sum - 2 * min_peak) / 2;
                    if delay > 0 {
                        let word = cmd::adc_delay_word(adc, delay as u8);
                        let which = Board::BOTH[ibd];
                        sh.board_mut(which)?.bus.write_word(&word)?;
                    }
                }
            }

            tracing::info!(attempts = misery, "ADC delays aligned");
            return Ok(());
        }
    }
}

/// Index and amplitude of the largest sample.
fn peak_of(samples: &[u8; MAX_WAVEFORM_LENGTH]) -> (u16, u8) {
    let mut index = 0u16;
    let mut amplitude = 0u8;
    for (i, &s) in samples.iter().enumerate() {
        if s > amplitude {
            amplitude = s;
            index = i as u16;
        }
    }
    (index, amplitude)
}
