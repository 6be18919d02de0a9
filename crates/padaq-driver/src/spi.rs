//! The SPI transaction engine: the bus seam and the batching accumulator.
//!
//! All board traffic is fixed 4-byte words. Commands batch up to
//! [`MAX_XFERS`] transfers and go to the kernel as one multi-message ioctl;
//! the batch auto-flushes when full, so callers can append an arbitrarily
//! long sequence and global FIFO order is preserved.

use crate::error::{DaqError, Result};
use padaq_board::cmd::{CmdWord, READ_PROMPT};
use padaq_board::Family;

/// Most transfers one ioctl can carry. The spidev size field is 14 bits
/// and each transfer record is 32 bytes, so 511 is the ceiling.
pub const MAX_XFERS: usize = 511;

/// One transfer in a batch: an optional transmit word and an optional
/// receive destination. Half-duplex reads are rx-only transfers primed by
/// a preceding command word.
#[derive(Debug)]
pub struct Transfer<'a> {
    /// Word to clock out, if any.
    pub tx: Option<&'a CmdWord>,
    /// Destination for the word clocked in, if wanted.
    pub rx: Option<&'a mut CmdWord>,
}

/// A word-oriented SPI bus to one board.
///
/// The production implementation is [`crate::spidev::Spidev`]; the test
/// suite and CI drive the same driver code through
/// [`crate::sim::SimBoard`].
pub trait SpiBus: Send + std::fmt::Debug {
    /// Execute a batch of transfers in order, atomically with respect to
    /// other batches on the same bus.
    fn transfer(&mut self, xfers: &mut [Transfer<'_>]) -> Result<()>;

    /// Plain single-word write (no batching).
    fn write_word(&mut self, word: &CmdWord) -> Result<()>;

    /// Plain single-word read.
    fn read_word(&mut self, word: &mut CmdWord) -> Result<()>;

    /// Change the bus clock. No-op where the bus has no clock.
    fn set_clock(&mut self, hz: u32) -> Result<()> {
        let _ = hz;
        Ok(())
    }

    /// Change per-transfer chip-select toggling and inter-transfer delay.
    fn set_transfer_settings(&mut self, cs_change: bool, delay_us: u16) {
        let _ = (cs_change, delay_us);
    }
}

/// Accumulator of transfers for one board, flushed as single ioctls.
///
/// Lives for one command sequence under the command lock; receive
/// destinations are borrowed from the caller for the batch lifetime, so a
/// flush (explicit or automatic) always has somewhere to land the data.
pub(crate) struct Batch<'a> {
    bus: &'a mut dyn SpiBus,
    family: Family,
    xfers: Vec<Transfer<'a>>,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(bus: &'a mut dyn SpiBus, family: Family) -> Self {
        Self {
            bus,
            family,
            xfers: Vec::with_capacity(64),
        }
    }

    /// Append one transfer, flushing first if the batch is full.
    pub(crate) fn append(
        &mut self,
        tx: Option<&'a CmdWord>,
        rx: Option<&'a mut CmdWord>,
    ) -> Result<()> {
        if self.xfers.len() >= MAX_XFERS {
            self.flush()?;
        }
        self.xfers.push(Transfer { tx, rx });
        Ok(())
    }

    /// Append a transmit-only word.
    pub(crate) fn write(&mut self, tx: &'a CmdWord) -> Result<()> {
        self.append(Some(tx), None)
    }

    /// Append the generation-appropriate register-read sequence: address
    /// select, the READ prompt on NP, then the response transfer.
    pub(crate) fn read_register(&mut self, address: u8, out: &'a mut CmdWord) -> Result<()> {
        let select = &self.family.commands().set_read_reg[address as usize];
        self.write(select)?;
        if self.family.prompted_read() {
            self.write(&READ_PROMPT)?;
        }
        self.append(None, Some(out))
    }

    /// Send everything accumulated so far as one ioctl.
    pub(crate) fn flush(&mut self) -> Result<()> {
        if self.xfers.is_empty() {
            return Ok(());
        }
        let result = self.bus.transfer(&mut self.xfers);
        self.xfers.clear();
        result
    }

    /// Number of transfers currently pending.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.xfers.len()
    }
}

/// Verify that a register response echoes the address it was asked for.
pub(crate) fn check_echo(address: u8, word: &CmdWord) -> Result<()> {
    if word[0] == address {
        Ok(())
    } else {
        tracing::warn!(
            expected = format_args!("{address:#04x}"),
            got = format_args!("{:#04x}", word[0]),
            "register read echo mismatch"
        );
        Err(DaqError::transfer(format!(
            "register {address:#04x} echoed {:#04x}",
            word[0]
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Bus that records every flush as the list of tx opcodes it carried.
    #[derive(Debug, Default)]
    struct RecordingBus {
        flushes: Arc<Mutex<Vec<Vec<Option<u8>>>>>,
    }

    impl SpiBus for RecordingBus {
        fn transfer(&mut self, xfers: &mut [Transfer<'_>]) -> Result<()> {
            let ops = xfers.iter().map(|x| x.tx.map(|w| w[0])).collect();
            self.flushes.lock().unwrap().push(ops);
            Ok(())
        }

        fn write_word(&mut self, _word: &CmdWord) -> Result<()> {
            Ok(())
        }

        fn read_word(&mut self, _word: &mut CmdWord) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn flush_preserves_append_order() {
        let mut bus = RecordingBus::default();
        let flushes = bus.flushes.clone();
        let a = [0x11, 0, 0, 1];
        let b = [0x22, 0, 0, 2];
        let mut batch = Batch::new(&mut bus, Family::Bn);
        batch.write(&a).unwrap();
        batch.write(&b).unwrap();
        batch.flush().unwrap();

        let flushes = flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0], vec![Some(0x11), Some(0x22)]);
    }

    #[test]
    fn append_beyond_capacity_auto_flushes_in_order() {
        let mut bus = RecordingBus::default();
        let flushes = bus.flushes.clone();
        let w = [0x33, 0, 0, 0];
        let mut batch = Batch::new(&mut bus, Family::Bn);
        for _ in 0..MAX_XFERS + 3 {
            batch.write(&w).unwrap();
        }
        assert_eq!(batch.pending(), 3);
        batch.flush().unwrap();

        let flushes = flushes.lock().unwrap();
        assert_eq!(flushes.len(), 2);
        assert_eq!(flushes[0].len(), MAX_XFERS);
        assert_eq!(flushes[1].len(), 3);
    }

    #[test]
    fn register_read_shape_per_family() {
        for (family, expected) in [(Family::Bn, 2), (Family::Np, 3)] {
            let mut bus = RecordingBus::default();
            let mut out = [0u8; 4];
            let mut batch = Batch::new(&mut bus, family);
            batch.read_register(0x10, &mut out).unwrap();
            assert_eq!(batch.pending(), expected);
        }
    }

    #[test]
    fn echo_mismatch_is_an_error() {
        assert!(check_echo(0x10, &[0x10, 0, 0, 5]).is_ok());
        assert!(check_echo(0x10, &[0x11, 0, 0, 5]).is_err());
    }

    #[test]
    fn empty_flush_is_a_no_op() {
        let mut bus = RecordingBus::default();
        let flushes = bus.flushes.clone();
        let mut batch = Batch::new(&mut bus, Family::Np);
        batch.flush().unwrap();
        assert!(flushes.lock().unwrap().is_empty());
    }
}
