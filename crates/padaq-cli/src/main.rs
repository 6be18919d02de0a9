//! `padaq`: operator command line for the phased-array DAQ boards.
//!
//! ```text
//! USAGE:
//!   padaq --device /dev/spidev1.0 info           Firmware identity
//!   padaq --device /dev/spidev1.0 status         Scaler snapshot
//!   padaq --device /dev/spidev1.0 trigger        Force a software trigger
//!   padaq --device /dev/spidev1.0 wait [-t SECS] Wait for a ready buffer
//!   padaq --device /dev/spidev1.0 reset LEVEL    Graded reset
//!   padaq --device /dev/spidev1.0 thresholds     Read thresholds
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use padaq_driver::{Board, Device, Family, Options, ResetLevel};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "padaq", about = "Phased-array DAQ board CLI", version)]
struct Cli {
    /// Master spidev node.
    #[arg(long, global = true, default_value = "/dev/spidev1.0")]
    device: PathBuf,

    /// Optional slave spidev node.
    #[arg(long, global = true)]
    slave: Option<PathBuf>,

    /// Optional interrupt GPIO file.
    #[arg(long, global = true)]
    gpio: Option<PathBuf>,

    /// Hardware generation.
    #[arg(long, global = true, value_enum, default_value = "bn")]
    family: FamilyArg,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Clone, Copy, ValueEnum)]
enum FamilyArg {
    /// First-generation board.
    Np,
    /// Second-generation board.
    Bn,
}

impl From<FamilyArg> for Family {
    fn from(arg: FamilyArg) -> Self {
        match arg {
            FamilyArg::Np => Family::Np,
            FamilyArg::Bn => Family::Bn,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ResetArg {
    Counters,
    Calibrate,
    AlmostGlobal,
    Global,
}

impl From<ResetArg> for ResetLevel {
    fn from(arg: ResetArg) -> Self {
        match arg {
            ResetArg::Counters => ResetLevel::Counters,
            ResetArg::Calibrate => ResetLevel::Calibrate,
            ResetArg::AlmostGlobal => ResetLevel::AlmostGlobal,
            ResetArg::Global => ResetLevel::Global,
        }
    }
}

#[derive(Subcommand)]
enum Cmd {
    /// Print firmware identity for each attached board.
    Info,
    /// Latch and print the scaler snapshot.
    Status,
    /// Force a software trigger.
    Trigger,
    /// Wait for a ready buffer.
    Wait {
        /// Give up after this many seconds (default: wait forever).
        #[arg(short, long)]
        timeout: Option<f64>,
    },
    /// Perform a graded reset.
    Reset {
        /// What to reset.
        #[arg(value_enum, default_value = "counters")]
        level: ResetArg,
    },
    /// Read the per-beam trigger thresholds.
    Thresholds,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    let device = Device::open(
        &cli.device,
        cli.slave.as_deref(),
        cli.gpio.as_deref(),
        None,
        Options::for_family(cli.family.into()),
    )?;

    match cli.command {
        Cmd::Info => cmd_info(&device)?,
        Cmd::Status => cmd_status(&device)?,
        Cmd::Trigger => device.sw_trigger()?,
        Cmd::Wait { timeout } => cmd_wait(&device, timeout)?,
        Cmd::Reset { level } => device.reset(level.into())?,
        Cmd::Thresholds => cmd_thresholds(&device)?,
    }

    Ok(())
}

fn cmd_info(device: &Device) -> Result<()> {
    let boards = if device.has_slave() {
        vec![Board::Master, Board::Slave]
    } else {
        vec![Board::Master]
    };
    for which in boards {
        let info = device.fwinfo(which)?;
        println!(
            "{which:?}: fw v{}.{} ({}) {:04}-{:02}-{:02}  dna {:#016x}  board id {}",
            info.version.major,
            info.version.minor,
            if info.version.master { "master" } else { "slave" },
            info.date.year,
            info.date.month,
            info.date.day,
            info.dna,
            device.board_id(which),
        );
    }
    Ok(())
}

fn cmd_status(device: &Device) -> Result<()> {
    let status = device.read_status(Board::Master)?;
    println!("board {}  veto {:#x}", status.board_id, status.veto_status);
    println!("latched pps {:#x}", status.latched_pps_time);
    println!("dynamic beam mask {:#08x}", status.dynamic_beam_mask);
    for (category, (global, beams)) in status
        .global_scalers
        .iter()
        .zip(status.beam_scalers.iter())
        .enumerate()
    {
        let beams = beams
            .iter()
            .take(device.family().num_beams())
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        println!("scaler[{category}]: global {global}  beams {beams}");
    }
    Ok(())
}

fn cmd_wait(device: &Device, timeout: Option<f64>) -> Result<()> {
    let timeout = timeout.map(Duration::from_secs_f64);
    let mask = device.wait(timeout)?;
    if mask.is_empty() {
        println!("timed out, no buffers ready");
    } else {
        println!("ready buffers: {mask}");
    }
    Ok(())
}

fn cmd_thresholds(device: &Device) -> Result<()> {
    for (beam, threshold) in device.thresholds()?.iter().enumerate() {
        println!("beam {beam:2}: {threshold}");
    }
    Ok(())
}
