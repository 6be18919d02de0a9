//! GPIO wrappers: the interrupt-ready file and the power-enable line.
//!
//! The interrupt device follows the UIO convention: a blocking read
//! returns a 32-bit token once the line fires, and writing `1` re-arms it.
//! The power line is a plain sysfs GPIO value file.

use crate::error::{DaqError, Result};
use rustix::io::{read, write};
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::os::unix::io::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};

/// Interrupt-ready file descriptor.
#[derive(Debug)]
pub struct InterruptPin {
    file: File,
    path: PathBuf,
}

impl InterruptPin {
    /// Open the interrupt device and arm it.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be opened or armed.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DaqError::DeviceNotFound {
                path: path.to_path_buf(),
            });
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut pin = Self {
            file,
            path: path.to_path_buf(),
        };
        pin.arm()?;
        tracing::debug!(path = %pin.path.display(), "opened interrupt gpio");
        Ok(pin)
    }

    /// Re-arm the interrupt by writing `1`.
    ///
    /// # Errors
    ///
    /// Returns an error on a short or failed write.
    pub fn arm(&mut self) -> Result<()> {
        let one = 1u32.to_ne_bytes();
        let n = write(&self.file, &one)?;
        if n != one.len() {
            return Err(DaqError::transfer(format!(
                "short interrupt re-arm on {}",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Consume the pending interrupt token. Only meaningful once the fd
    /// polled readable.
    ///
    /// # Errors
    ///
    /// Returns an error on a short or failed read.
    pub fn take(&mut self) -> Result<u32> {
        let mut token = [0u8; 4];
        let n = read(&self.file, &mut token)?;
        if n != token.len() {
            return Err(DaqError::transfer(format!(
                "short interrupt read on {}",
                self.path.display()
            )));
        }
        Ok(u32::from_ne_bytes(token))
    }
}

impl AsFd for InterruptPin {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// Sysfs GPIO output used as an external power / enable control.
#[derive(Debug)]
pub struct PowerPin {
    value: File,
    number: u32,
}

impl PowerPin {
    /// Export and claim a sysfs GPIO as an output, initially low.
    ///
    /// # Errors
    ///
    /// Returns an error if the GPIO cannot be exported or configured.
    pub fn open(number: u32) -> Result<Self> {
        let base = PathBuf::from(format!("/sys/class/gpio/gpio{number}"));
        if !base.exists() {
            // Already-exported pins make this write fail; that is fine.
            if let Ok(mut f) = OpenOptions::new().write(true).open("/sys/class/gpio/export") {
                let _ = write!(f, "{number}");
            }
        }
        std::fs::write(base.join("direction"), "out")?;
        let value = OpenOptions::new().write(true).open(base.join("value"))?;
        let mut pin = Self { value, number };
        pin.set(false)?;
        Ok(pin)
    }

    /// Drive the line high or low.
    ///
    /// # Errors
    ///
    /// Returns an error if the value file cannot be written.
    pub fn set(&mut self, high: bool) -> Result<()> {
        let byte = if high { b"1" } else { b"0" };
        let n = write(&self.value, byte)?;
        if n != 1 {
            return Err(DaqError::transfer(format!(
                "short write to gpio{} value",
                self.number
            )));
        }
        Ok(())
    }
}
