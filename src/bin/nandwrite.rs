//! Write an image to NAND flash, skipping bad blocks and recovering from failed writes.
//!
//! The device is either a Linux MTD character device, or a file holding a simulated NAND (see
//! `--sim-layout`), which is handy for trying out options without real hardware.

use anyhow::{Context, Result};
use clap::{Args, Parser};
use log::{error, info};

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

#[cfg(target_os = "linux")]
use nandwrite::nand::mtd::MtdNand;
use nandwrite::{
    error::{ConfigError, WriteError},
    input::{InputSource, SeekableInput, StreamInput},
    nand::{Geometry, OobMode, SimNand},
    progress::{NoProgress, Progress},
    util::parse_int,
    write::{write_image, WritePolicy, WriteReport},
};

/// Parse a byte count or offset, which may not be negative
fn parse_offset(s: &str) -> Result<u64> {
    let value = parse_int(s)?;
    u64::try_from(value).map_err(|_| ConfigError::NegativeOffset(value).into())
}

fn parse_block_align(s: &str) -> Result<u32> {
    let value = parse_int(s)?;
    u32::try_from(value).map_err(|_| ConfigError::BlockAlign(value).into())
}

#[derive(Args, Debug)]
struct NandOptions {
    /// Look DEVICE up by name in /proc/mtd
    #[cfg(target_os = "linux")]
    #[clap(long, conflicts_with = "sim_layout")]
    named: bool,

    /// Treat DEVICE as the image file of a simulated NAND with this layout
    /// (BLOCKSxPAGESxBYTES[:OOB]); it is loaded if it exists and saved when done
    #[clap(long)]
    sim_layout: Option<Geometry>,
}

impl NandOptions {
    fn open(&self, device: &Path, oob_mode: OobMode) -> Result<NandImpl> {
        let nandimpl = if let Some(geometry) = self.sim_layout {
            let mut sim = SimNand::new(geometry);
            if device.exists() {
                sim.load(&mut File::open(device)?)
                    .with_context(|| format!("loading {}", device.display()))?;
            }

            NandImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let mut mtd = if self.named {
                    let name = device.to_str().context("MTD name is not valid UTF-8")?;
                    MtdNand::open_named(name)?
                } else {
                    MtdNand::open(device)
                        .with_context(|| format!("opening {}", device.display()))?
                };

                if oob_mode == OobMode::Raw {
                    mtd.set_raw_mode()?;
                }

                NandImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            anyhow::bail!("MTD devices are only supported on Linux; use --sim-layout")
        };

        Ok(nandimpl)
    }

    fn cleanup(&self, device: &Path, nand: NandImpl) -> Result<()> {
        if let NandImpl::Sim(sim_nand) = nand {
            sim_nand
                .save(&mut File::create(device)?)
                .with_context(|| format!("saving {}", device.display()))?;
        }

        Ok(())
    }
}

#[derive(Debug)]
enum NandImpl {
    Sim(SimNand),

    #[cfg(target_os = "linux")]
    Mtd(MtdNand),
}

impl NandImpl {
    fn write(
        &mut self,
        input: &mut dyn InputSource,
        policy: &WritePolicy,
        progress: &mut dyn Progress,
    ) -> Result<WriteReport, WriteError> {
        match self {
            NandImpl::Sim(nand) => write_image(nand, input, policy, progress),

            #[cfg(target_os = "linux")]
            NandImpl::Mtd(nand) => write_image(nand, input, policy, progress),
        }
    }
}

#[derive(Args, Debug)]
struct WriteOptions {
    /// Use auto OOB layout
    #[clap(short, long)]
    autoplace: bool,

    /// Mark blocks bad if a write to them fails
    #[clap(short, long)]
    markbad: bool,

    /// Write without ECC
    #[clap(short, long)]
    noecc: bool,

    /// Don't skip bad blocks
    #[clap(short = 'N', long)]
    noskipbad: bool,

    /// Input contains OOB data after every page
    #[clap(short, long)]
    oob: bool,

    /// Input contains OOB data after every page; only write the OOB part
    #[clap(short = 'O', long)]
    onlyoob: bool,

    /// Device offset to start writing at
    #[clap(short, long, default_value = "0", value_parser = parse_offset)]
    start: u64,

    /// Pad a short final page with 0xFF
    #[clap(short, long)]
    pad: bool,

    /// Treat this many erase blocks as one for alignment and bad-block skipping
    #[clap(short, long, default_value = "1", value_parser = parse_block_align)]
    blockalign: u32,

    /// Skip this many bytes of input before writing
    #[clap(long, default_value = "0", value_parser = parse_offset)]
    input_skip: u64,

    /// Only write this many bytes of input
    #[clap(long, value_parser = parse_offset)]
    input_size: Option<u64>,
}

impl WriteOptions {
    fn policy(&self, quiet: bool) -> Result<WritePolicy, ConfigError> {
        let mut policy = WritePolicy::new()
            .oob_mode(OobMode::from_flags(self.noecc, self.autoplace)?)
            .start(self.start)
            .block_align(self.blockalign)
            .input_skip(self.input_skip);

        if self.onlyoob {
            policy = policy.only_oob();
        } else if self.oob {
            policy = policy.oob();
        }
        if self.pad {
            policy = policy.pad();
        }
        if self.noskipbad {
            policy = policy.no_skip_bad();
        }
        if self.markbad {
            policy = policy.mark_bad();
        }
        if let Some(size) = self.input_size {
            policy = policy.input_size(size);
        }
        if quiet {
            policy = policy.quiet();
        }

        Ok(policy)
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The MTD device to write to (e.g. /dev/mtd0)
    device: PathBuf,

    /// The image to write; standard input if absent or "-"
    input: Option<PathBuf>,

    #[clap(flatten)]
    nand: NandOptions,

    #[clap(flatten)]
    write: WriteOptions,

    /// Don't display progress messages
    #[clap(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Report more details about the device and the write
    #[clap(short, long)]
    verbose: bool,
}

impl Cli {
    fn open_input(&self) -> Result<Box<dyn InputSource>> {
        let input: Box<dyn InputSource> = match &self.input {
            Some(path) if path.as_os_str() != "-" => {
                let file = File::open(path)
                    .with_context(|| format!("opening {}", path.display()))?;
                Box::new(SeekableInput(file))
            }
            _ => Box::new(StreamInput(io::stdin().lock())),
        };

        Ok(input)
    }
}

fn run(cli: &Cli) -> Result<()> {
    let policy = cli.write.policy(cli.quiet)?;
    let mut input = cli.open_input()?;
    let mut nand = cli.nand.open(&cli.device, policy.oob_mode)?;

    let mut rpt = (!cli.quiet).then(|| {
        howudoin::init(howudoin::consumers::TermLine::default());
        howudoin::new().label("Writing data").set_len(100u64)
    });
    let mut no_progress = NoProgress;
    let progress: &mut dyn Progress = match &mut rpt {
        Some(rpt) => rpt,
        None => &mut no_progress,
    };

    let result = nand.write(&mut *input, &policy, progress);

    if let Some(rpt) = rpt {
        if result.is_ok() {
            rpt.finish();
        }
        howudoin::disable();
        thread::sleep(Duration::from_millis(10)); // Give howudoin time to shut down
    }

    let cleanup = cli.nand.cleanup(&cli.device, nand);
    let report = result?;
    cleanup?;

    info!(
        "Wrote {} pages from {} input bytes, ending at {:#x}",
        report.pages_written, report.bytes_consumed, report.end_offset
    );
    if report.bad_blocks_skipped > 0 || report.write_failures > 0 {
        info!(
            "Skipped {} bad block(s), recovered from {} failed write(s)",
            report.bad_blocks_skipped, report.write_failures
        );
    }

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.quiet {
        "warn"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            if err
                .downcast_ref::<WriteError>()
                .is_some_and(WriteError::is_partial)
            {
                error!("Data was only partially written due to error");
            }
            ExitCode::FAILURE
        }
    }
}
