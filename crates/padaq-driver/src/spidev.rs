//! spidev bus implementation.
//!
//! Uses rustix for the advisory lock and plain word I/O, and libc for the
//! spidev ioctls, which are kernel-specific and not covered by rustix's
//! API. The ioctl records and request numbers are declared by hand from
//! the kernel ABI.

// spidev wants buffer addresses as u64 fields regardless of pointer width
#![allow(clippy::cast_possible_truncation)]

use crate::error::{DaqError, Result};
use crate::spi::{SpiBus, Transfer, MAX_XFERS};
use padaq_board::cmd::CmdWord;
use padaq_board::WORD_SIZE;
use rustix::fs::{flock, FlockOperation};
use rustix::io::{read, write};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Kernel `struct spi_ioc_transfer` (32 bytes).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    pad: u8,
}

// _IOW('k', 1, u8)
const SPI_IOC_WR_MODE: libc::c_ulong = 0x4001_6b01;
// _IOW('k', 4, u32)
const SPI_IOC_WR_MAX_SPEED_HZ: libc::c_ulong = 0x4004_6b04;

/// `SPI_IOC_MESSAGE(n)`: `_IOW('k', 0, char[n * 32])`. The 14-bit size
/// field caps a batch at [`MAX_XFERS`] transfers.
const fn spi_ioc_message(n: usize) -> libc::c_ulong {
    let size = (n * std::mem::size_of::<SpiIocTransfer>()) & 0x3fff;
    0x4000_0000 | ((size as libc::c_ulong) << 16) | (0x6b << 8)
}

/// One spidev character device, exclusively locked for the life of this
/// handle and configured for mode 0 at the requested clock.
#[derive(Debug)]
pub struct Spidev {
    file: File,
    path: PathBuf,
    cs_change: bool,
    delay_us: u16,
}

impl Spidev {
    /// Open and lock a spidev node and configure the SPI protocol.
    ///
    /// # Errors
    ///
    /// Returns [`DaqError::DeviceNotFound`] if the node does not exist,
    /// [`DaqError::DeviceLocked`] if another process holds the advisory
    /// lock, and [`DaqError::Io`] / [`DaqError::Transfer`] for open or
    /// ioctl failures.
    pub fn open(path: &Path, clock_hz: u32, cs_change: bool, delay_us: u16) -> Result<Self> {
        if !path.exists() {
            return Err(DaqError::DeviceNotFound {
                path: path.to_path_buf(),
            });
        }

        let file = OpenOptions::new().read(true).write(true).open(path)?;

        flock(&file, FlockOperation::NonBlockingLockExclusive).map_err(|_| {
            DaqError::DeviceLocked {
                path: path.to_path_buf(),
            }
        })?;

        let mut dev = Self {
            file,
            path: path.to_path_buf(),
            cs_change,
            delay_us,
        };

        // Mode 0, then the clock.
        let mode: u8 = 0;
        // SAFETY: SPI_IOC_WR_MODE reads one byte from the pointed-to mode
        // value; `mode` lives for the duration of the call and the fd is
        // open. Layout is the kernel's u8 mode word.
        let ret =
            unsafe { libc::ioctl(dev.file.as_raw_fd(), SPI_IOC_WR_MODE, std::ptr::addr_of!(mode)) };
        if ret < 0 {
            return Err(DaqError::transfer(format!(
                "SPI_IOC_WR_MODE on {}: {}",
                path.display(),
                std::io::Error::last_os_error()
            )));
        }
        dev.set_clock(clock_hz)?;

        tracing::info!(path = %path.display(), clock_hz, "opened spidev");
        Ok(dev)
    }

    /// Path this bus was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SpiBus for Spidev {
    fn transfer(&mut self, xfers: &mut [Transfer<'_>]) -> Result<()> {
        if xfers.is_empty() {
            return Ok(());
        }
        debug_assert!(xfers.len() <= MAX_XFERS);

        let records: Vec<SpiIocTransfer> = xfers
            .iter_mut()
            .map(|x| SpiIocTransfer {
                tx_buf: x.tx.map_or(0, |w| w.as_ptr() as u64),
                rx_buf: x.rx.as_mut().map_or(0, |w| w.as_mut_ptr() as u64),
                len: WORD_SIZE as u32,
                delay_usecs: self.delay_us,
                cs_change: u8::from(self.cs_change),
                ..Default::default()
            })
            .collect();

        // SAFETY: SPI_IOC_MESSAGE(n) reads n transfer records from the
        // pointed-to array. Every tx_buf/rx_buf is a live 4-byte borrow
        // held by `xfers` until this call returns, len is 4, and the
        // record layout matches the kernel struct. The fd is open.
        let ret = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                spi_ioc_message(records.len()),
                records.as_ptr(),
            )
        };

        let expected = (records.len() * WORD_SIZE) as libc::c_int;
        if ret < 0 {
            return Err(DaqError::transfer(format!(
                "SPI_IOC_MESSAGE({}) on {}: {}",
                records.len(),
                self.path.display(),
                std::io::Error::last_os_error()
            )));
        }
        if ret < expected {
            return Err(DaqError::transfer(format!(
                "short batch on {}: {ret} of {expected} bytes",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn write_word(&mut self, word: &CmdWord) -> Result<()> {
        let n = write(&self.file, word)?;
        if n != WORD_SIZE {
            return Err(DaqError::transfer(format!(
                "short write on {}: {n} of {WORD_SIZE} bytes",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn read_word(&mut self, word: &mut CmdWord) -> Result<()> {
        let n = read(&self.file, word)?;
        if n != WORD_SIZE {
            return Err(DaqError::transfer(format!(
                "short read on {}: {n} of {WORD_SIZE} bytes",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn set_clock(&mut self, hz: u32) -> Result<()> {
        // SAFETY: SPI_IOC_WR_MAX_SPEED_HZ reads one u32 from the pointed-to
        // value, which lives for the call; the fd is open.
        let ret = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                SPI_IOC_WR_MAX_SPEED_HZ,
                std::ptr::addr_of!(hz),
            )
        };
        if ret < 0 {
            return Err(DaqError::transfer(format!(
                "SPI_IOC_WR_MAX_SPEED_HZ on {}: {}",
                self.path.display(),
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn set_transfer_settings(&mut self, cs_change: bool, delay_us: u16) {
        self.cs_change = cs_change;
        self.delay_us = delay_us;
    }
}

impl Drop for Spidev {
    fn drop(&mut self) {
        // Best effort; closing the fd releases the lock regardless.
        let _ = flock(&self.file, FlockOperation::Unlock);
        tracing::debug!(path = %self.path.display(), "released spidev");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_record_matches_kernel_layout() {
        assert_eq!(std::mem::size_of::<SpiIocTransfer>(), 32);
    }

    #[test]
    fn message_request_numbers() {
        // _IOW('k', 0, char[32]) for one transfer.
        assert_eq!(spi_ioc_message(1), 0x4020_6b00);
        // The 511-transfer ceiling still fits the 14-bit size field.
        assert_eq!(spi_ioc_message(MAX_XFERS), 0x7fe0_6b00);
    }
}
