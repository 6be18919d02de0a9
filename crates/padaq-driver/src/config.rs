//! Typed setters and getters for the configuration surface.
//!
//! Every setter goes through the transaction engine under the command
//! lock. Getters read the registers back rather than shadowing values in
//! software, so they see what the hardware actually latched. Operations in
//! the extended block are gated to BN hardware.

use crate::device::{Board, Device};
use crate::error::{DaqError, Result};
use crate::spi::{check_echo, Batch};
use padaq_board::bits::payload24;
use padaq_board::cmd::{self, CmdWord};
use padaq_board::{regs, MAX_PRETRIGGER, NUM_CHAN};

/// Trigger source enables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerEnables {
    /// Full beamforming trigger.
    pub beamforming: bool,
    /// 8-channel beam trigger.
    pub beam8: bool,
    /// First 4-channel beam trigger.
    pub beam4a: bool,
    /// Second 4-channel beam trigger.
    pub beam4b: bool,
}

impl TriggerEnables {
    fn word(self) -> CmdWord {
        [
            regs::TRIG_ENABLE,
            0,
            u8::from(self.beam8) | u8::from(self.beam4a) << 1 | u8::from(self.beam4b) << 2,
            u8::from(self.beamforming),
        ]
    }

    fn from_word(word: &CmdWord) -> Self {
        Self {
            beamforming: word[3] & 1 != 0,
            beam8: word[2] & 1 != 0,
            beam4a: word[2] >> 1 & 1 != 0,
            beam4b: word[2] >> 2 & 1 != 0,
        }
    }
}

/// Which polarization(s) the trigger fires on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Polarization {
    /// Horizontal only.
    #[default]
    Horizontal = 0,
    /// Vertical only.
    Vertical = 1,
    /// Either polarization.
    Both = 2,
}

impl Polarization {
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::Vertical,
            2 => Self::Both,
            _ => Self::Horizontal,
        }
    }
}

/// Trigger veto configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VetoOptions {
    /// Veto pulse width.
    pub pulse_width: u8,
    /// Cut on saturated waveforms.
    pub enable_saturation_cut: bool,
    /// Cut on continuous-wave contamination.
    pub enable_cw_cut: bool,
    /// Cut on side-swiping events.
    pub enable_sideswipe_cut: bool,
    /// Extended cut.
    pub enable_extended_cut: bool,
    /// Saturation cut value.
    pub saturation_cut_value: u8,
    /// CW cut value.
    pub cw_cut_value: u8,
    /// Sideswipe cut value.
    pub sideswipe_cut_value: u8,
    /// Extended cut value.
    pub extended_cut_value: u8,
}

impl VetoOptions {
    fn words(self) -> [CmdWord; 3] {
        [
            [
                regs::TRIGGER_VETOS,
                0,
                self.pulse_width,
                u8::from(self.enable_saturation_cut)
                    | u8::from(self.enable_cw_cut) << 1
                    | u8::from(self.enable_sideswipe_cut) << 2
                    | u8::from(self.enable_extended_cut) << 3,
            ],
            [
                regs::VETO_CUT_0,
                self.sideswipe_cut_value,
                self.cw_cut_value,
                self.saturation_cut_value,
            ],
            [regs::VETO_CUT_1, 0, 0, self.extended_cut_value],
        ]
    }

    fn from_words(vetos: &CmdWord, cut0: &CmdWord, cut1: &CmdWord) -> Self {
        Self {
            pulse_width: vetos[2],
            enable_saturation_cut: vetos[3] & 1 != 0,
            enable_cw_cut: vetos[3] >> 1 & 1 != 0,
            enable_sideswipe_cut: vetos[3] >> 2 & 1 != 0,
            enable_extended_cut: vetos[3] >> 3 & 1 != 0,
            saturation_cut_value: cut0[3],
            cw_cut_value: cut0[2],
            sideswipe_cut_value: cut0[1],
            extended_cut_value: cut1[3],
        }
    }
}

/// Trigger-output pulse shaping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerOutputConfig {
    /// Drive the trigger output.
    pub enable: bool,
    /// Output polarity.
    pub polarity: bool,
    /// Emit a 1 Hz heartbeat instead of triggers.
    pub send_1hz: bool,
    /// Pulse width.
    pub width: u8,
}

/// External trigger input options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtInputConfig {
    /// Treat the external input as a trigger source.
    pub use_as_trigger: bool,
    /// Delay applied to the external trigger, 16 bits.
    pub trig_delay: u16,
}

/// Dynamic beam-masking configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DynamicMasking {
    /// Masking enabled.
    pub enable: bool,
    /// Rate threshold.
    pub threshold: u8,
    /// Holdoff, 16 bits.
    pub holdoff: u16,
}

impl Device {
    fn require_extended(&self, what: &'static str) -> Result<()> {
        if self.family.has_extended_config() {
            Ok(())
        } else {
            Err(DaqError::unsupported(what, self.family))
        }
    }

    /// Samples read per channel per event.
    #[must_use]
    pub fn buffer_length(&self) -> u16 {
        self.lock().buffer_length
    }

    /// Change the per-event buffer length. Takes the command lock so the
    /// length cannot change under a readout in progress.
    pub fn set_buffer_length(&self, length: u16) {
        self.lock().buffer_length = length;
    }

    /// Pretrigger window in 128-sample blocks, as last set.
    #[must_use]
    pub fn pretrigger(&self) -> u8 {
        self.lock().pretrigger
    }

    /// Set the pretrigger window (128-sample blocks), synchronized across
    /// boards.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure.
    pub fn set_pretrigger(&self, pretrigger: u8) -> Result<()> {
        let clamped = pretrigger.min(MAX_PRETRIGGER);
        let word = cmd::pretrigger_word(clamped);
        let mut sh = self.lock();
        sh.synchronized_command(self.family, &word, None)?;
        sh.pretrigger = clamped;
        Ok(())
    }

    /// Set the master's channel mask.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure.
    pub fn set_channel_mask(&self, mask: u8) -> Result<()> {
        let word = cmd::channel_mask_word(mask);
        self.lock().master.bus.write_word(&word)
    }

    /// Channel masks of both boards, master in the low byte.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure.
    pub fn channel_mask(&self) -> Result<u16> {
        let master = self.read_register(regs::CHANNEL_MASK, Board::Master)?;
        let mut mask = u16::from(master[3]);
        if self.has_slave() {
            let slave = self.read_register(regs::CHANNEL_MASK, Board::Slave)?;
            mask |= u16::from(slave[3]) << 8;
        }
        Ok(mask)
    }

    /// Restrict which channels the readout path streams for one board.
    pub fn set_channel_read_mask(&self, which: Board, mask: u8) {
        self.lock().channel_read_mask[which.index()] = mask;
    }

    /// Set the 24-bit beam trigger mask.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure.
    pub fn set_trigger_mask(&self, mask: u32) -> Result<()> {
        let word = cmd::trigger_mask_word(mask);
        self.lock().master.bus.write_word(&word)
    }

    /// Current beam trigger mask.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure.
    pub fn trigger_mask(&self) -> Result<u32> {
        Ok(payload24(
            &self.read_register(regs::TRIGGER_MASK, Board::Master)?,
        ))
    }

    /// Write per-beam trigger thresholds. Values clamp to 20 bits; extra
    /// entries beyond the generation's beam count are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure.
    pub fn set_thresholds(&self, thresholds: &[u32]) -> Result<()> {
        let beams = self.family.num_beams().min(thresholds.len());
        let words: Vec<CmdWord> = thresholds[..beams]
            .iter()
            .enumerate()
            .map(|(beam, &value)| cmd::threshold_word(self.family, beam, value))
            .collect();

        let mut sh = self.lock();
        let mut batch = Batch::new(&mut *sh.master.bus, self.family);
        for word in &words {
            batch.write(word)?;
        }
        batch.flush()
    }

    /// Read back all per-beam trigger thresholds.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure.
    pub fn thresholds(&self) -> Result<Vec<u32>> {
        let beams = self.family.num_beams();
        let base = self.family.thresholds_reg();
        let mut words = vec![[0u8; 4]; beams];

        let mut sh = self.lock();
        let mut batch = Batch::new(&mut *sh.master.bus, self.family);
        for (beam, word) in words.iter_mut().enumerate() {
            batch.read_register(base + beam as u8, word)?;
        }
        batch.flush()?;
        drop(batch);
        drop(sh);

        words
            .iter()
            .enumerate()
            .map(|(beam, word)| {
                check_echo(base + beam as u8, word)?;
                Ok(cmd::threshold_from_word(word))
            })
            .collect()
    }

    /// Stage and apply attenuation levels for either board. `None` leaves
    /// a board untouched; the apply is synchronized.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure or on NP hardware.
    pub fn set_attenuation(
        &self,
        master: Option<&[u8; NUM_CHAN]>,
        slave: Option<&[u8; NUM_CHAN]>,
    ) -> Result<()> {
        self.require_extended("attenuation control")?;
        let mut sh = self.lock();

        if let Some(levels) = master {
            let words = cmd::attenuation_words(levels);
            let mut batch = Batch::new(&mut *sh.master.bus, self.family);
            for word in &words {
                batch.write(word)?;
            }
            batch.flush()?;
        }
        if let (Some(levels), true) = (slave, sh.has_slave()) {
            let words = cmd::attenuation_words(levels);
            let io = sh.board_mut(Board::Slave)?;
            let mut batch = Batch::new(&mut *io.bus, self.family);
            for word in &words {
                batch.write(word)?;
            }
            batch.flush()?;
        }

        sh.synchronized_command(self.family, &cmd::ATTEN_APPLY, None)?;
        Ok(())
    }

    /// Read back one board's attenuation levels.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure or on NP hardware.
    pub fn attenuation(&self, which: Board) -> Result<[u8; NUM_CHAN]> {
        self.require_extended("attenuation control")?;
        let mut words = [[0u8; 4]; 3];
        let addresses = [regs::ATTEN_012, regs::ATTEN_345, regs::ATTEN_67];

        let mut sh = self.lock();
        let io = sh.board_mut(which)?;
        let mut batch = Batch::new(&mut *io.bus, self.family);
        for (address, word) in addresses.iter().zip(words.iter_mut()) {
            batch.read_register(*address, word)?;
        }
        batch.flush()?;
        drop(batch);
        drop(sh);

        for (address, word) in addresses.iter().zip(words.iter()) {
            check_echo(*address, word)?;
        }
        Ok(cmd::attenuation_from_words(&words))
    }

    /// Set the trigger source enables on one board.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure.
    pub fn set_trigger_enables(&self, enables: TriggerEnables, which: Board) -> Result<()> {
        let word = enables.word();
        self.lock().board_mut(which)?.bus.write_word(&word)
    }

    /// Current trigger source enables on one board.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure.
    pub fn trigger_enables(&self, which: Board) -> Result<TriggerEnables> {
        Ok(TriggerEnables::from_word(
            &self.read_register(regs::TRIG_ENABLE, which)?,
        ))
    }

    /// Set which polarization(s) the trigger evaluates.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure or on NP hardware.
    pub fn set_trigger_polarization(&self, pol: Polarization) -> Result<()> {
        self.require_extended("trigger polarization")?;
        let word = [regs::TRIG_POLARIZATION, 0, 0, pol as u8];
        self.lock().master.bus.write_word(&word)
    }

    /// Current trigger polarization.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure or on NP hardware.
    pub fn trigger_polarization(&self) -> Result<Polarization> {
        self.require_extended("trigger polarization")?;
        let word = self.read_register(regs::TRIG_POLARIZATION, Board::Master)?;
        Ok(Polarization::from_bits(word[3] & 0x3))
    }

    /// Turn phased-trigger readout on or off on every board.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure or on NP hardware.
    pub fn set_phased_trigger_readout(&self, enabled: bool) -> Result<()> {
        self.require_extended("phased-trigger readout")?;
        self.lock().write_each(&cmd::phased_trigger_word(enabled))
    }

    /// Set the trigger holdoff.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure.
    pub fn set_trigger_holdoff(&self, holdoff: u16) -> Result<()> {
        let word = cmd::trigger_holdoff_word(holdoff);
        self.lock().master.bus.write_word(&word)
    }

    /// Current trigger holdoff.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure.
    pub fn trigger_holdoff(&self) -> Result<u16> {
        let word = self.read_register(regs::TRIG_HOLDOFF, Board::Master)?;
        Ok(u16::from(word[3]) | u16::from(word[2]) << 8)
    }

    /// Configure dynamic beam masking.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure or on NP hardware.
    pub fn set_dynamic_masking(&self, masking: DynamicMasking) -> Result<()> {
        self.require_extended("dynamic masking")?;
        let words = [
            cmd::dyn_mask_word(masking.enable, masking.threshold),
            cmd::dyn_holdoff_word(masking.holdoff),
        ];
        let mut sh = self.lock();
        let mut batch = Batch::new(&mut *sh.master.bus, self.family);
        for word in &words {
            batch.write(word)?;
        }
        batch.flush()
    }

    /// Current dynamic beam-masking configuration.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure or on NP hardware.
    pub fn dynamic_masking(&self) -> Result<DynamicMasking> {
        self.require_extended("dynamic masking")?;
        let mask = self.read_register(regs::DYN_MASK, Board::Master)?;
        let holdoff = self.read_register(regs::DYN_HOLDOFF, Board::Master)?;
        Ok(DynamicMasking {
            enable: mask[2] & 1 != 0,
            threshold: mask[3],
            holdoff: u16::from(holdoff[3]) | u16::from(holdoff[2]) << 8,
        })
    }

    /// Configure the trigger vetoes.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure or on NP hardware.
    pub fn set_veto_options(&self, options: VetoOptions) -> Result<()> {
        self.require_extended("trigger vetoes")?;
        let words = options.words();
        let mut sh = self.lock();
        let mut batch = Batch::new(&mut *sh.master.bus, self.family);
        for word in &words {
            batch.write(word)?;
        }
        batch.flush()
    }

    /// Current trigger veto configuration.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure or on NP hardware.
    pub fn veto_options(&self) -> Result<VetoOptions> {
        self.require_extended("trigger vetoes")?;
        let vetos = self.read_register(regs::TRIGGER_VETOS, Board::Master)?;
        let cut0 = self.read_register(regs::VETO_CUT_0, Board::Master)?;
        let cut1 = self.read_register(regs::VETO_CUT_1, Board::Master)?;
        Ok(VetoOptions::from_words(&vetos, &cut0, &cut1))
    }

    /// Write the eight per-channel trigger delays.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure or on NP hardware.
    pub fn set_trigger_delays(&self, delays: &[u8; NUM_CHAN]) -> Result<()> {
        self.require_extended("trigger delays")?;
        let words = cmd::trigger_delay_words(delays);
        let mut sh = self.lock();
        let mut batch = Batch::new(&mut *sh.master.bus, self.family);
        for word in &words {
            batch.write(word)?;
        }
        batch.flush()
    }

    /// Read back the eight per-channel trigger delays.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure or on NP hardware.
    pub fn trigger_delays(&self) -> Result<[u8; NUM_CHAN]> {
        self.require_extended("trigger delays")?;
        let mut words = [[0u8; 4]; 3];
        let addresses = [regs::TRIG_DELAY_012, regs::TRIG_DELAY_345, regs::TRIG_DELAY_67];

        let mut sh = self.lock();
        let mut batch = Batch::new(&mut *sh.master.bus, self.family);
        for (address, word) in addresses.iter().zip(words.iter_mut()) {
            batch.read_register(*address, word)?;
        }
        batch.flush()?;
        drop(batch);
        drop(sh);

        Ok(cmd::trigger_delays_from_words(&words))
    }

    /// Configure the trigger output pulse.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure or on NP hardware.
    pub fn configure_trigger_output(&self, config: TriggerOutputConfig) -> Result<()> {
        self.require_extended("trigger output")?;
        let word = [
            regs::TRIGOUT_CONFIG,
            0,
            config.width,
            u8::from(config.enable)
                | u8::from(config.polarity) << 1
                | u8::from(config.send_1hz) << 2,
        ];
        self.lock().master.bus.write_word(&word)
    }

    /// Current trigger-output configuration.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure or on NP hardware.
    pub fn trigger_output(&self) -> Result<TriggerOutputConfig> {
        self.require_extended("trigger output")?;
        let word = self.read_register(regs::TRIGOUT_CONFIG, Board::Master)?;
        Ok(TriggerOutputConfig {
            enable: word[3] & 1 != 0,
            polarity: word[3] >> 1 & 1 != 0,
            send_1hz: word[3] >> 2 & 1 != 0,
            width: word[2],
        })
    }

    /// Configure the external trigger input.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure or on NP hardware.
    pub fn configure_ext_input(&self, config: ExtInputConfig) -> Result<()> {
        self.require_extended("external input")?;
        let word = [
            regs::EXT_INPUT_CONFIG,
            (config.trig_delay >> 8) as u8,
            (config.trig_delay & 0xff) as u8,
            u8::from(config.use_as_trigger),
        ];
        self.lock().master.bus.write_word(&word)
    }

    /// Current external trigger input options.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure or on NP hardware.
    pub fn ext_input(&self) -> Result<ExtInputConfig> {
        self.require_extended("external input")?;
        let word = self.read_register(regs::EXT_INPUT_CONFIG, Board::Master)?;
        Ok(ExtInputConfig {
            use_as_trigger: word[3] & 1 != 0,
            trig_delay: u16::from(word[2]) | u16::from(word[1]) << 8,
        })
    }

    /// Enable or disable waveform verification mode.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure or on NP hardware.
    pub fn set_verification_mode(&self, enabled: bool) -> Result<()> {
        self.require_extended("verification mode")?;
        let word = [regs::VERIFICATION_MODE, 0, 0, u8::from(enabled)];
        self.lock().master.bus.write_word(&word)
    }

    /// Whether verification mode is active.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure or on NP hardware.
    pub fn verification_mode(&self) -> Result<bool> {
        self.require_extended("verification mode")?;
        let word = self.read_register(regs::VERIFICATION_MODE, Board::Master)?;
        Ok(word[3] & 1 != 0)
    }

    /// Enable or disable the trigger-path low-pass filter.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure or on NP hardware.
    pub fn set_trigger_lowpass(&self, enabled: bool) -> Result<()> {
        self.require_extended("trigger low-pass")?;
        let word = [regs::TRIGGER_LOWPASS, 0, 0, u8::from(enabled)];
        self.lock().master.bus.write_word(&word)
    }

    /// Whether the trigger-path low-pass filter is active.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure or on NP hardware.
    pub fn trigger_lowpass(&self) -> Result<bool> {
        self.require_extended("trigger low-pass")?;
        let word = self.read_register(regs::TRIGGER_LOWPASS, Board::Master)?;
        Ok(word[3] & 1 != 0)
    }

    /// Change the poll-mode status interval (microseconds; zero yields).
    pub fn set_poll_interval(&self, interval_us: u32) {
        self.poll_interval_us
            .store(interval_us, std::sync::atomic::Ordering::Relaxed);
    }

    /// Change the SPI clock on every bus, in MHz.
    ///
    /// # Errors
    ///
    /// Returns an error if an ioctl fails.
    pub fn set_spi_clock(&self, mhz: u32) -> Result<()> {
        let hz = mhz * 1_000_000;
        let mut sh = self.lock();
        sh.master.bus.set_clock(hz)?;
        if let Some(slave) = sh.slave.as_mut() {
            slave.bus.set_clock(hz)?;
        }
        Ok(())
    }

    /// Toggle chip-select deassertion between transfers.
    pub fn set_toggle_chipselect(&self, cs_change: bool) {
        let mut sh = self.lock();
        sh.cs_change = cs_change;
        let delay = sh.delay_us;
        sh.master.bus.set_transfer_settings(cs_change, delay);
        if let Some(slave) = sh.slave.as_mut() {
            slave.bus.set_transfer_settings(cs_change, delay);
        }
    }

    /// Set the inter-transfer delay in microseconds.
    pub fn set_transaction_delay(&self, delay_us: u16) {
        let mut sh = self.lock();
        sh.delay_us = delay_us;
        let cs = sh.cs_change;
        sh.master.bus.set_transfer_settings(cs, delay_us);
        if let Some(slave) = sh.slave.as_mut() {
            slave.bus.set_transfer_settings(cs, delay_us);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_enables_roundtrip() {
        let enables = TriggerEnables {
            beamforming: true,
            beam8: false,
            beam4a: true,
            beam4b: false,
        };
        let word = enables.word();
        assert_eq!(word, [regs::TRIG_ENABLE, 0, 0b010, 1]);
        assert_eq!(TriggerEnables::from_word(&word), enables);
    }

    #[test]
    fn veto_options_roundtrip() {
        let options = VetoOptions {
            pulse_width: 10,
            enable_saturation_cut: true,
            enable_cw_cut: false,
            enable_sideswipe_cut: true,
            enable_extended_cut: false,
            saturation_cut_value: 1,
            cw_cut_value: 2,
            sideswipe_cut_value: 3,
            extended_cut_value: 4,
        };
        let [vetos, cut0, cut1] = options.words();
        assert_eq!(vetos, [regs::TRIGGER_VETOS, 0, 10, 0b0101]);
        assert_eq!(cut0, [regs::VETO_CUT_0, 3, 2, 1]);
        assert_eq!(cut1, [regs::VETO_CUT_1, 0, 0, 4]);
        assert_eq!(VetoOptions::from_words(&vetos, &cut0, &cut1), options);
    }

    #[test]
    fn polarization_decodes() {
        assert_eq!(Polarization::from_bits(0), Polarization::Horizontal);
        assert_eq!(Polarization::from_bits(1), Polarization::Vertical);
        assert_eq!(Polarization::from_bits(2), Polarization::Both);
    }
}
