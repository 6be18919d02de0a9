//! Userspace driver for the phased-array trigger DAQ board family.
//!
//! One [`Device`] drives a master board and an optional slave over spidev,
//! with an optional GPIO interrupt line for the trigger wait. All wire
//! traffic is batched 4-byte command words; state-changing commands that
//! must land on both boards in the same clock go through the synchronized
//! sync-line protocol.
//!
//! # Quick start
//!
//! ```no_run
//! use padaq_driver::{Device, Options, Event, EventHeader};
//! use std::path::Path;
//!
//! # fn main() -> padaq_driver::Result<()> {
//! let dev = Device::open(
//!     Path::new("/dev/spidev1.0"),
//!     None,
//!     None,
//!     None,
//!     Options::default(),
//! )?;
//!
//! dev.set_thresholds(&[50_000; 20])?;
//! let mask = dev.wait(Some(std::time::Duration::from_secs(1)))?;
//! if !mask.is_empty() {
//!     let mut headers = vec![EventHeader::default(); mask.count() as usize];
//!     let mut events = vec![Event::default(); mask.count() as usize];
//!     let n = dev.read_events(mask, &mut headers, &mut events)?;
//!     println!("read {n} events, first trigger at {}", headers[0].trig_number);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Module map
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`device`] | Device handle, open/close, synchronized commands |
//! | [`spi`] | The bus seam and the batching transaction engine |
//! | [`spidev`] | The production spidev bus |
//! | [`event`] | Header / event records and the buffer mask |
//! | [`config`] | The typed configuration surface |
//! | [`status`] | Scaler snapshots |
//! | [`reset`] | Graded resets and ADC delay alignment |
//! | [`gpio`] | Interrupt and power GPIO wrappers |
//! | [`sim`] | Scripted board model for tests and CI |

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]

pub mod config;
pub mod device;
mod error;
pub mod event;
pub mod gpio;
mod reader;
pub mod reset;
pub mod sim;
pub mod spi;
pub mod spidev;
pub mod status;
mod wait;

pub use config::{
    DynamicMasking, ExtInputConfig, Polarization, TriggerEnables, TriggerOutputConfig, VetoOptions,
};
pub use device::{Board, Device, FwDate, FwInfo, FwVersion, Options};
pub use error::{DaqError, Result};
pub use event::{sync_problem, BufferMask, Event, EventHeader, Timestamp, TriggerType};
pub use reset::ResetLevel;
pub use status::Status;

pub use padaq_board::Family;
