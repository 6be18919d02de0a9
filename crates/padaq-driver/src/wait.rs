//! The trigger wait primitive and its cancellation.
//!
//! Only one thread may wait at a time; a second caller gets
//! [`DaqError::Busy`] immediately. Without an interrupt GPIO the wait
//! polls the status register at the configured interval. With one, it
//! blocks in `poll` on the GPIO descriptor together with an eventfd
//! wakeup token; `cancel_wait` posts the token from any thread to unwind
//! the blocked syscall.
//!
//! A cancellation that lands before the wait starts is consumed and
//! reported as [`DaqError::Cancelled`]; one that lands mid-wait is
//! [`DaqError::Interrupted`]. An exhausted timeout is not an error: the
//! wait returns successfully with an empty mask.

use crate::device::{Board, Device};
use crate::error::{DaqError, Result};
use crate::event::BufferMask;
use rustix::event::{poll, PollFd, PollFlags};
use std::sync::atomic::Ordering;
use std::sync::{PoisonError, TryLockError};
use std::time::{Duration, Instant};

impl Device {
    /// Cancel a pending (or imminent) wait from any thread.
    ///
    /// Safe to call at any time; a cancellation with no wait in flight is
    /// consumed by the next wait entry.
    pub fn cancel_wait(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        // Unblocks a poll-based wait stuck on the GPIO descriptor.
        let _ = rustix::io::write(&self.wakeup, &1u64.to_ne_bytes());
    }

    /// Wait until at least one event buffer is ready or the timeout
    /// elapses (`None` waits forever). Returns the ready mask; an empty
    /// mask means the timeout ran out.
    ///
    /// # Errors
    ///
    /// [`DaqError::Busy`] if another thread is already waiting,
    /// [`DaqError::Cancelled`] if the wait was cancelled before it
    /// started, [`DaqError::Interrupted`] if cancelled while blocked, or a
    /// transfer error from the status read.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<BufferMask> {
        self.wait_on(timeout, Board::Master)
    }

    /// [`Self::wait`] against a specific board's status register.
    ///
    /// # Errors
    ///
    /// See [`Self::wait`].
    pub fn wait_on(&self, timeout: Option<Duration>, which: Board) -> Result<BufferMask> {
        let _gate = match self.wait_gate.try_lock() {
            Ok(gate) => gate,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(DaqError::Busy),
        };

        if self.cancel.swap(false, Ordering::SeqCst) {
            self.drain_wakeup();
            return Err(DaqError::Cancelled);
        }

        if self.irq.is_some() {
            self.wait_interrupt(timeout, which)
        } else {
            self.wait_polling(timeout, which)
        }
    }

    fn wait_polling(&self, timeout: Option<Duration>, which: Board) -> Result<BufferMask> {
        let start = Instant::now();
        let mut mask = BufferMask::EMPTY;

        loop {
            mask = self.lock().check_buffers(self.family, which)?;
            if self.cancel.load(Ordering::SeqCst) || !mask.is_empty() {
                break;
            }
            if timeout.is_some_and(|t| start.elapsed() >= t) {
                break;
            }
            match self.poll_interval_us.load(Ordering::Relaxed) {
                0 => std::thread::yield_now(),
                us => std::thread::sleep(Duration::from_micros(u64::from(us))),
            }
        }

        if self.cancel.swap(false, Ordering::SeqCst) {
            self.drain_wakeup();
            return Err(DaqError::Interrupted);
        }
        Ok(mask)
    }

    fn wait_interrupt(&self, timeout: Option<Duration>, which: Board) -> Result<BufferMask> {
        let irq = self.irq.as_ref().expect("interrupt wait without irq");
        let mut pin = irq.lock().unwrap_or_else(PoisonError::into_inner);
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let timeout_ms: i32 = match deadline {
                None => -1,
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    i32::try_from(remaining.as_millis()).unwrap_or(i32::MAX)
                }
            };

            let (fired, woken) = {
                let mut fds = [
                    PollFd::new(&*pin, PollFlags::IN),
                    PollFd::new(&self.wakeup, PollFlags::IN),
                ];
                let n = poll(&mut fds, timeout_ms).map_err(std::io::Error::from)?;
                if n == 0 {
                    // Timed out with nothing pending.
                    self.cancel.store(false, Ordering::SeqCst);
                    return Ok(BufferMask::EMPTY);
                }
                (
                    fds[0].revents().contains(PollFlags::IN),
                    fds[1].revents().contains(PollFlags::IN),
                )
            };

            if woken {
                self.drain_wakeup();
                if self.cancel.swap(false, Ordering::SeqCst) {
                    return Err(DaqError::Interrupted);
                }
                // Stale token from an earlier consumed cancellation.
                continue;
            }

            if fired {
                pin.take()?;
                pin.arm()?;
                let mask = self.lock().check_buffers(self.family, which)?;
                self.cancel.store(false, Ordering::SeqCst);
                return Ok(mask);
            }
        }
    }

    fn drain_wakeup(&self) {
        let mut token = [0u8; 8];
        let _ = rustix::io::read(&self.wakeup, &mut token);
    }
}
