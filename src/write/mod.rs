//! This module implements logic to stream a raw image onto NAND flash.
//!
//! Writing proceeds one page at a time, in aligned blocks of one or more erase blocks:
//!
//! 1. On entering a new aligned block, every erase block in it is checked; if any is bad, the
//!    whole aligned block is skipped.
//! 2. The next page (and its OOB area, if the image carries OOB data) is read into the
//!    [StagingBuffer].
//! 3. The page is programmed. If the device reports an I/O error, the aligned block is erased
//!    (and optionally marked bad), and everything staged for it is replayed into the next good
//!    block.

mod scan;
mod staging;

pub use scan::{BadBlockScanner, Located};
pub use staging::{Fill, StagingBuffer};

use std::io::Read;

use log::{debug, error, info};

use crate::error::{ConfigError, WriteError};
use crate::input::{InputLength, InputSource};
use crate::nand::{Geometry, Nand, OobMode};
use crate::progress::Progress;

/// Everything about how an image should be written, decided once before writing starts.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WritePolicy {
    /// How the device should place OOB data and handle ECC
    pub oob_mode: OobMode,
    /// The input carries an OOB area after every page
    pub write_oob: bool,
    /// Write only the OOB areas; page data in the input is skipped over
    pub only_oob: bool,
    /// Pad a short final page with erased bytes
    pub pad: bool,
    /// Skip over bad blocks rather than writing into them
    pub skip_bad_blocks: bool,
    /// Mark a block bad when a write to it fails
    pub mark_bad_on_failure: bool,
    /// Device offset to begin writing at; must be page-aligned
    pub start_offset: u64,
    /// How many erase blocks are treated as one block for alignment and bad-block skipping
    pub block_align: u32,
    /// Bytes of input to discard before writing
    pub input_skip: u64,
    /// Only write this many bytes of input
    pub input_size: Option<u64>,
    /// Don't log per-block progress messages
    pub quiet: bool,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            oob_mode: OobMode::default(),
            write_oob: false,
            only_oob: false,
            pad: false,
            skip_bad_blocks: true,
            mark_bad_on_failure: false,
            start_offset: 0,
            block_align: 1,
            input_skip: 0,
            input_size: None,
            quiet: false,
        }
    }
}

impl WritePolicy {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn oob_mode(mut self, oob_mode: OobMode) -> Self {
        self.oob_mode = oob_mode;
        self
    }

    /// The input interleaves an OOB area after every page
    pub fn oob(mut self) -> Self {
        self.write_oob = true;
        self
    }

    /// The input interleaves OOB areas, and only those are written
    pub fn only_oob(mut self) -> Self {
        self.write_oob = true;
        self.only_oob = true;
        self
    }

    pub fn pad(mut self) -> Self {
        self.pad = true;
        self
    }

    pub fn no_skip_bad(mut self) -> Self {
        self.skip_bad_blocks = false;
        self
    }

    pub fn mark_bad(mut self) -> Self {
        self.mark_bad_on_failure = true;
        self
    }

    pub fn start(mut self, offset: u64) -> Self {
        self.start_offset = offset;
        self
    }

    pub fn block_align(mut self, block_align: u32) -> Self {
        self.block_align = block_align;
        self
    }

    pub fn input_skip(mut self, count: u64) -> Self {
        self.input_skip = count;
        self
    }

    pub fn input_size(mut self, count: u64) -> Self {
        self.input_size = Some(count);
        self
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Check this policy against the device's geometry, returning the aligned block size
    pub fn validate(&self, geometry: &Geometry) -> Result<u64, ConfigError> {
        geometry.validate()?;
        let aligned = geometry.aligned_block_size(self.block_align)?;

        if self.start_offset % u64::from(geometry.page_size) != 0 {
            return Err(ConfigError::StartNotAligned {
                offset: self.start_offset,
                page_size: geometry.page_size,
            });
        }

        if self.write_oob && geometry.oob_size == 0 {
            return Err(ConfigError::NoOobArea);
        }

        if self.pad && self.write_oob && !self.only_oob {
            return Err(ConfigError::PadWithOob);
        }

        Ok(aligned)
    }

    /// Bytes of input consumed for every page written
    fn record_size(&self, geometry: &Geometry) -> u64 {
        u64::from(geometry.page_size) + self.oob_len(geometry) as u64
    }

    fn oob_len(&self, geometry: &Geometry) -> usize {
        if self.write_oob {
            geometry.oob_size as usize
        } else {
            0
        }
    }
}

/// What a successful write did
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct WriteReport {
    /// Pages successfully programmed, including replayed ones
    pub pages_written: u64,
    /// Bytes taken from the input
    pub bytes_consumed: u64,
    /// Aligned blocks skipped for being bad
    pub bad_blocks_skipped: u32,
    /// Failed writes recovered from by moving to another block
    pub write_failures: u32,
    /// Device offset just past the last page written
    pub end_offset: u64,
}

/// How much input remains to be written
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Remaining {
    /// A finite image with this many bytes left, out of `total`
    Finite { left: u64, total: u64 },
    /// A stream that has not ended yet
    Streaming,
    /// A stream that has ended
    Ended,
}

impl Remaining {
    fn more(&self) -> bool {
        match *self {
            Remaining::Finite { left, .. } => left > 0,
            Remaining::Streaming => true,
            Remaining::Ended => false,
        }
    }

    fn left(&self) -> u64 {
        match *self {
            Remaining::Finite { left, .. } => left,
            _ => 0,
        }
    }

    /// Account for `consumed` bytes read, returning the new percent complete if known
    fn consume(&mut self, consumed: usize, eof: bool) -> Option<u8> {
        match self {
            Remaining::Finite { left, total } => {
                *left = left.saturating_sub(consumed as u64);
                let done = *total - *left;
                Some((u128::from(done) * 100 / u128::from(*total).max(1)) as u8)
            }
            Remaining::Streaming if eof => {
                *self = Remaining::Ended;
                None
            }
            _ => None,
        }
    }
}

/// Outcome of trying to program the page under the cursor
enum Step {
    /// The page was written
    Written,
    /// The device reported an I/O error writing the page
    Failed,
    /// The input is used up and nothing is left to write
    Done,
}

/// The write loop's state, owned for the duration of one [write_image] call
struct Writer<'a, N: Nand + ?Sized, R: Read, P: Progress + ?Sized> {
    nand: &'a mut N,
    input: R,
    progress: &'a mut P,
    policy: &'a WritePolicy,
    geometry: Geometry,
    aligned: u64,
    scanner: BadBlockScanner,
    staging: StagingBuffer,
    remaining: Remaining,
    report: WriteReport,
}

impl<N: Nand + ?Sized, R: Read, P: Progress + ?Sized> Writer<'_, N, R, P> {
    fn run(mut self) -> Result<WriteReport, WriteError> {
        let page_size = u64::from(self.geometry.page_size);
        let mut offset = self.policy.start_offset;
        let mut block_start = None;

        while (self.remaining.more() || self.staging.pending() > 0)
            && offset < self.geometry.device_size
        {
            // Entering a new aligned block (possibly by way of a failure or skipping bad ones)?
            if block_start != Some(self.scanner.block_start(offset)) {
                let located = self.enter_block(offset)?;
                offset = located.offset;
                block_start = Some(located.block_start);
                if offset >= self.geometry.device_size {
                    break;
                }
            }

            match self.write_page(offset)? {
                Step::Written => offset += page_size,
                Step::Failed => offset = self.recover(offset)?,
                Step::Done => break,
            }
        }

        self.report.end_offset = offset;

        // Anything left over means the image didn't make it onto the device in full
        let remaining = self.remaining.left();
        let unwritten = self.staging.pending();
        if remaining > 0 || unwritten > 0 {
            return Err(WriteError::Incomplete {
                remaining,
                unwritten,
            });
        }

        Ok(self.report)
    }

    /// Scan for a good aligned block at or after `offset`, and prepare the staging buffer for it
    fn enter_block(&mut self, offset: u64) -> Result<Located, WriteError> {
        // A rewound buffer is replayed into the new block rather than discarded
        if !self.staging.at_start() {
            self.staging.reset();
        }

        let located = self.scanner.locate(self.nand, offset)?;
        self.report.bad_blocks_skipped += located.skipped;

        if !self.policy.quiet && located.offset < self.geometry.device_size {
            info!(
                "Writing data to block {} at offset {:#x}",
                located.block_start / self.aligned,
                located.block_start
            );
        }

        Ok(located)
    }

    /// Stage and program the page at `offset`
    fn write_page(&mut self, offset: u64) -> Result<Step, WriteError> {
        let page_size = self.geometry.page_size as usize;
        let oob_len = self.policy.oob_len(&self.geometry);

        match self
            .staging
            .fill(&mut self.input, 0, page_size, self.policy.pad)?
        {
            Fill::Exhausted => {
                let left = self.remaining.left();
                if left > 0 {
                    return Err(WriteError::UnexpectedEof { missing: left });
                }
                self.remaining = Remaining::Ended;
                return Ok(Step::Done);
            }
            Fill::Ready { consumed, eof } => {
                self.report.bytes_consumed += consumed as u64;
                let percent = self.remaining.consume(consumed, eof);
                if let Some(percent) = percent.filter(|_| consumed > 0) {
                    self.progress.report(percent);
                }
            }
        }

        if oob_len > 0 {
            if let Fill::Ready { consumed, eof } =
                self.staging
                    .fill_oob(&mut self.input, page_size, oob_len)?
            {
                self.report.bytes_consumed += consumed as u64;
                self.remaining.consume(consumed, eof);
            }
        }

        let data = (!self.policy.only_oob).then(|| self.staging.staged(0, page_size));
        let oob = (oob_len > 0).then(|| self.staging.staged(page_size, oob_len));

        match self
            .nand
            .write_page(offset, data, oob, self.policy.oob_mode)
        {
            Ok(()) => {
                self.staging.advance(page_size + oob_len);
                self.report.pages_written += 1;
                Ok(Step::Written)
            }
            Err(source) if source.is_io() => {
                error!("Write failure at {offset:#x}: {source}");
                Ok(Step::Failed)
            }
            Err(source) => Err(WriteError::Write { offset, source }),
        }
    }

    /// Clean up after the page write at `failed` reported an I/O error.
    ///
    /// The whole aligned block is erased (and the failing erase block optionally marked bad), and
    /// the staging buffer is rewound so its contents go to the next block. Returns the offset to
    /// continue writing at.
    fn recover(&mut self, failed: u64) -> Result<u64, WriteError> {
        let block_start = self.scanner.block_start(failed);
        let block_end = block_start + self.aligned;
        let erase_block_size = u64::from(self.geometry.erase_block_size);

        self.staging.rewind();
        self.report.write_failures += 1;

        error!(
            "Erasing failed write from {block_start:#010x} to {:#010x}",
            block_end - 1
        );
        for sub in (block_start..block_end.min(self.geometry.device_size))
            .step_by(erase_block_size as usize)
        {
            if let Err(source) = self.nand.erase(self.geometry.block_of(sub)) {
                error!("Erase failure at {sub:#x}: {source}");
                if !source.is_io() {
                    return Err(WriteError::Erase {
                        offset: sub,
                        source,
                    });
                }
            }
        }

        if self.policy.mark_bad_on_failure {
            let bad = failed - failed % erase_block_size;
            error!("Marking block at {bad:#010x} bad");
            self.nand
                .mark_bad(self.geometry.block_of(failed))
                .map_err(|source| WriteError::MarkBad {
                    offset: bad,
                    source,
                })?;
        }

        if block_end >= self.geometry.device_size {
            return Err(WriteError::OutOfSpace);
        }

        Ok(block_end)
    }
}

/// Write an image to NAND flash.
///
/// The image is read from `input` and written starting at `policy.start_offset`, skipping bad
/// blocks and moving past blocks that fail to program. Percent-complete updates go to `progress`
/// when the input's length is known.
///
/// Returns an error if the image could not be written in full; depending on the error, part of
/// it may have been written already (see [WriteError::is_partial]).
pub fn write_image<N, I, P>(
    nand: &mut N,
    input: &mut I,
    policy: &WritePolicy,
    progress: &mut P,
) -> Result<WriteReport, WriteError>
where
    N: Nand + ?Sized,
    I: InputSource + ?Sized,
    P: Progress + ?Sized,
{
    let geometry = nand.geometry();
    let aligned = policy.validate(&geometry)?;
    let page_size = u64::from(geometry.page_size);
    let record = policy.record_size(&geometry);

    input.skip(policy.input_skip)?;
    let remaining = match (policy.input_size, input.length()?) {
        (Some(size), _) | (None, InputLength::Known(size)) => Remaining::Finite {
            left: size,
            total: size,
        },
        (None, InputLength::Streaming) => Remaining::Streaming,
    };

    // A stream of unknown length is checked as if it were a single page
    let image_len = match remaining {
        Remaining::Finite { total, .. } => total,
        _ => record,
    };

    if !policy.pad && image_len % record != 0 {
        return Err(ConfigError::NotPageAligned {
            len: image_len,
            record,
        }
        .into());
    }

    let too_large = || ConfigError::TooLarge {
        len: image_len,
        page_size: geometry.page_size,
        oob_size: geometry.oob_size,
        device_size: geometry.device_size,
        start: policy.start_offset,
    };
    let capacity = geometry
        .device_size
        .checked_sub(policy.start_offset)
        .ok_or_else(too_large)?;
    if image_len.div_ceil(record) * page_size > capacity {
        return Err(too_large().into());
    }

    let staging = StagingBuffer::new((aligned / page_size * record) as usize);
    debug!(
        "Writing {image_len} bytes in records of {record} bytes, {aligned:#x} bytes per block"
    );

    Writer {
        nand,
        input: input.take(policy.input_size.unwrap_or(u64::MAX)),
        progress,
        policy,
        geometry,
        aligned,
        scanner: BadBlockScanner::new(geometry, aligned, policy.skip_bad_blocks, policy.quiet),
        staging,
        remaining,
        report: WriteReport::default(),
    }
    .run()
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Cursor;

    use crate::input::{SeekableInput, StreamInput};
    use crate::nand::{Fault, PageUtil, SimNand, SimOp, TEST_GEOMETRY};
    use crate::progress::NoProgress;

    const PAGE: u64 = TEST_GEOMETRY.page_size as u64;
    const OOB: usize = TEST_GEOMETRY.oob_size as usize;
    const BLOCK: u64 = TEST_GEOMETRY.erase_block_size as u64;

    /// Generate an image with no erased pages in it
    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 251) as u8 & 0x7F).collect()
    }

    fn write(
        nand: &mut SimNand,
        image: &[u8],
        policy: &WritePolicy,
    ) -> Result<WriteReport, WriteError> {
        let mut input = SeekableInput(Cursor::new(image));
        write_image(nand, &mut input, &policy.clone().quiet(), &mut NoProgress)
    }

    fn read(nand: &SimNand, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        nand.read(offset, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_round_trip() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let data = image(3 * BLOCK as usize + 5 * PAGE as usize);

        let report = write(&mut nand, &data, &WritePolicy::new())?;
        assert_eq!(report.pages_written, 3 * 16 + 5);
        assert_eq!(report.bytes_consumed, data.len() as u64);
        assert_eq!(report.end_offset, data.len() as u64);
        assert_eq!(read(&nand, 0, data.len()), data);
        assert!(read(&nand, data.len() as u64, PAGE as usize).is_erased());
        Ok(())
    }

    #[test]
    fn test_empty_image() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let report = write(&mut nand, &[], &WritePolicy::new())?;
        assert_eq!(report.pages_written, 0);
        assert!(nand.history().is_empty());
        Ok(())
    }

    #[test]
    fn test_start_offset() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let data = image(BLOCK as usize);
        let start = BLOCK + 4 * PAGE;

        write(&mut nand, &data, &WritePolicy::new().start(start))?;
        assert!(read(&nand, 0, start as usize).is_erased());
        assert_eq!(read(&nand, start, data.len()), data);

        let misaligned = WritePolicy::new().start(100);
        assert!(matches!(
            write(&mut nand, &data, &misaligned),
            Err(WriteError::Config(ConfigError::StartNotAligned { .. }))
        ));
        Ok(())
    }

    #[test]
    fn test_replay_after_failure() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let data = image(3 * BLOCK as usize);
        nand.fail_write(BLOCK, Fault::Io);

        let report = write(&mut nand, &data, &WritePolicy::new().mark_bad())?;
        assert_eq!(report.write_failures, 1);
        assert_eq!(report.pages_written, 3 * 16);

        // Block 1 was erased and retired; its data went to block 2, byte for byte
        assert!(nand.is_bad(1)?);
        assert!(nand
            .history()
            .windows(3)
            .any(|x| x == [SimOp::Write(BLOCK), SimOp::Erase(1), SimOp::MarkBad(1)]));
        assert_eq!(read(&nand, 0, BLOCK as usize), data[..BLOCK as usize]);
        assert_eq!(
            read(&nand, 2 * BLOCK, 2 * BLOCK as usize),
            data[BLOCK as usize..]
        );
        Ok(())
    }

    #[test]
    fn test_replay_mid_block() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let data = image(2 * BLOCK as usize);
        nand.fail_write(3 * PAGE, Fault::Io);

        let mut progress = Vec::new();
        let mut input = SeekableInput(Cursor::new(&data));
        let policy = WritePolicy::new().quiet();
        write_image(&mut nand, &mut input, &policy, &mut progress)?;

        // Everything staged for block 0 is replayed from the start of block 1
        assert!(!nand.is_bad(0)?);
        assert!(read(&nand, 0, BLOCK as usize).is_erased());
        assert_eq!(read(&nand, BLOCK, data.len()), data);

        // Replayed pages don't count as progress
        assert_eq!(progress.len(), 32);
        assert_eq!(progress.last(), Some(&100));
        Ok(())
    }

    #[test]
    fn test_failure_in_last_block() {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let data = image(BLOCK as usize);
        let start = 7 * BLOCK;
        nand.fail_write(start, Fault::Io);

        assert!(matches!(
            write(&mut nand, &data, &WritePolicy::new().start(start)),
            Err(WriteError::OutOfSpace)
        ));
    }

    #[test]
    fn test_erase_failures() {
        // I/O errors while erasing are tolerated...
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let data = image(2 * BLOCK as usize);
        nand.fail_write(0, Fault::Io);
        nand.fail_erase(0, Fault::Io);
        assert!(write(&mut nand, &data, &WritePolicy::new()).is_ok());
        assert_eq!(read(&nand, BLOCK, data.len()), data);

        // ...anything else is not
        let mut nand = SimNand::new(TEST_GEOMETRY);
        nand.fail_write(0, Fault::Io);
        nand.fail_erase(0, Fault::Fatal);
        assert!(matches!(
            write(&mut nand, &data, &WritePolicy::new()),
            Err(WriteError::Erase { offset: 0, .. })
        ));
    }

    #[test]
    fn test_mark_bad_failure() {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let data = image(2 * BLOCK as usize);
        nand.fail_write(PAGE, Fault::Io);
        nand.fail_mark_bad(0, Fault::Fatal);

        assert!(matches!(
            write(&mut nand, &data, &WritePolicy::new().mark_bad()),
            Err(WriteError::MarkBad { offset: 0, .. })
        ));

        // Nothing is written once marking has failed
        assert_eq!(nand.history().last(), Some(&SimOp::MarkBad(0)));
        assert_eq!(nand.writes().count(), 2);
    }

    #[test]
    fn test_fatal_write_failure() {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let data = image(BLOCK as usize);
        nand.fail_write(2 * PAGE, Fault::Fatal);

        let result = write(&mut nand, &data, &WritePolicy::new());
        assert!(matches!(result, Err(WriteError::Write { offset, .. }) if offset == 2 * PAGE));
        assert!(!nand.history().iter().any(|x| matches!(x, SimOp::Erase(_))));
    }

    #[test]
    fn test_aligned_bad_block_skip() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        nand.set_bad(2);
        nand.set_bad(3);
        let data = image(4 * BLOCK as usize);

        let report = write(&mut nand, &data, &WritePolicy::new().block_align(4))?;
        assert_eq!(report.bad_blocks_skipped, 1);
        assert!(nand.writes().all(|offset| offset >= 4 * BLOCK));
        assert!(read(&nand, 0, 2 * BLOCK as usize).is_erased());
        assert_eq!(read(&nand, 4 * BLOCK, data.len()), data);
        Ok(())
    }

    #[test]
    fn test_no_skip_bad() {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        nand.set_bad(0);
        let data = image(BLOCK as usize);

        // The simulated device refuses writes into bad blocks outright
        assert!(matches!(
            write(&mut nand, &data, &WritePolicy::new().no_skip_bad()),
            Err(WriteError::Write { offset: 0, .. })
        ));
    }

    #[test]
    fn test_too_many_bad_blocks() {
        let mostly_bad = || {
            let mut nand = SimNand::new(TEST_GEOMETRY);
            for block in 1..TEST_GEOMETRY.blocks() {
                nand.set_bad(block);
            }
            nand
        };
        let data = image(2 * BLOCK as usize);
        let mut nand = mostly_bad();

        // The last bad block leaves the offset at the end of the device, with input left over
        let result = write(&mut nand, &data, &WritePolicy::new());
        assert!(matches!(
            result,
            Err(WriteError::Incomplete { remaining, unwritten: 0 }) if remaining == BLOCK
        ));

        // With aligned blocks hanging past the end, the scan itself runs out of space
        let mut nand = mostly_bad();
        let result = write(&mut nand, &data, &WritePolicy::new().block_align(3));
        assert!(matches!(result, Err(WriteError::OutOfSpace)));
    }

    #[test]
    fn test_padding() -> anyhow::Result<()> {
        let data = image(PAGE as usize - 1);

        let mut nand = SimNand::new(TEST_GEOMETRY);
        write(&mut nand, &data, &WritePolicy::new().pad())?;
        let page = read(&nand, 0, PAGE as usize);
        assert_eq!(page[..data.len()], data);
        assert_eq!(page[data.len()], 0xFF);

        // A finite image is rejected up front
        let mut nand = SimNand::new(TEST_GEOMETRY);
        assert!(matches!(
            write(&mut nand, &data, &WritePolicy::new()),
            Err(WriteError::Config(ConfigError::NotPageAligned { .. }))
        ));
        assert_eq!(nand.writes().count(), 0);

        // A stream is only found to be short once it ends
        let mut input = StreamInput(&data[..]);
        let result = write_image(&mut nand, &mut input, &WritePolicy::new(), &mut NoProgress);
        assert!(matches!(result, Err(WriteError::UnexpectedEof { missing: 1 })));
        assert_eq!(nand.writes().count(), 0);
        Ok(())
    }

    #[test]
    fn test_stream_round_trip() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let data = image(BLOCK as usize + 2 * PAGE as usize + 10);

        let mut input = StreamInput(&data[..]);
        let mut progress = Vec::new();
        let report = write_image(&mut nand, &mut input, &WritePolicy::new().pad(), &mut progress)?;
        assert_eq!(report.pages_written, 16 + 3);
        assert_eq!(read(&nand, 0, data.len()), data);
        assert!(progress.is_empty());
        Ok(())
    }

    #[test]
    fn test_device_boundary() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let data = image(TEST_GEOMETRY.device_size as usize);
        let report = write(&mut nand, &data, &WritePolicy::new())?;
        assert_eq!(report.bytes_consumed, TEST_GEOMETRY.device_size);
        assert_eq!(report.end_offset, TEST_GEOMETRY.device_size);

        let mut nand = SimNand::new(TEST_GEOMETRY);
        let data = image((TEST_GEOMETRY.device_size + PAGE) as usize);
        assert!(matches!(
            write(&mut nand, &data, &WritePolicy::new()),
            Err(WriteError::Config(ConfigError::TooLarge { .. }))
        ));
        assert!(nand.history().is_empty());
        Ok(())
    }

    /// An image of `pages` records, each a page followed by its OOB area
    fn oob_image(pages: usize) -> Vec<u8> {
        image(pages * (PAGE as usize + OOB))
    }

    #[test]
    fn test_write_oob() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let data = oob_image(4);

        write(&mut nand, &data, &WritePolicy::new().oob())?;
        for (i, record) in data.chunks(PAGE as usize + OOB).enumerate() {
            let offset = i as u64 * PAGE;
            assert_eq!(read(&nand, offset, PAGE as usize), record[..PAGE as usize]);
            assert_eq!(nand.read_oob(offset)?, &record[PAGE as usize..]);
        }

        assert!(matches!(
            WritePolicy::new().oob().pad().validate(&TEST_GEOMETRY),
            Err(ConfigError::PadWithOob)
        ));
        Ok(())
    }

    #[test]
    fn test_only_oob() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let data = oob_image(4);

        let report = write(&mut nand, &data, &WritePolicy::new().only_oob())?;
        assert_eq!(report.pages_written, 4);
        assert!(read(&nand, 0, 4 * PAGE as usize).is_erased());
        for (i, record) in data.chunks(PAGE as usize + OOB).enumerate() {
            assert_eq!(nand.read_oob(i as u64 * PAGE)?, &record[PAGE as usize..]);
        }
        Ok(())
    }

    #[test]
    fn test_oob_without_oob_area() {
        let geometry = Geometry {
            oob_size: 0,
            ..TEST_GEOMETRY
        };
        let mut nand = SimNand::new(geometry);
        let data = image(4 * PAGE as usize);

        for policy in [WritePolicy::new().oob(), WritePolicy::new().only_oob()] {
            let result = write(&mut nand, &data, &policy);
            assert!(matches!(
                result,
                Err(WriteError::Config(ConfigError::NoOobArea))
            ));
            assert!(!result.is_err_and(|err| err.is_partial()));
        }
        assert!(nand.history().is_empty());

        // Plain data writes don't need an OOB area
        assert!(write(&mut nand, &data, &WritePolicy::new()).is_ok());
    }

    #[test]
    fn test_only_oob_short() {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let mut data = oob_image(4);
        data.truncate(data.len() - 5);

        // Padding is allowed for the page data, but never for OOB
        let result = write(&mut nand, &data, &WritePolicy::new().only_oob().pad());
        assert!(matches!(result, Err(WriteError::UnexpectedOobEof { missing: 5 })));
        assert_eq!(nand.writes().count(), 3);
    }

    #[test]
    fn test_input_window() -> anyhow::Result<()> {
        use std::io::{Seek, Write};

        let data = image(5000);
        let mut file = tempfile::tempfile()?;
        file.write_all(&data)?;
        file.rewind()?;

        let mut nand = SimNand::new(TEST_GEOMETRY);
        let mut input = SeekableInput(file);
        let policy = WritePolicy::new().input_skip(100).input_size(2 * PAGE).quiet();
        let report = write_image(&mut nand, &mut input, &policy, &mut NoProgress)?;
        assert_eq!(report.pages_written, 2);
        assert_eq!(read(&nand, 0, 2 * PAGE as usize), data[100..][..2 * PAGE as usize]);

        let mut input = StreamInput(&data[..]);
        assert!(matches!(
            write_image(&mut nand, &mut input, &policy, &mut NoProgress),
            Err(WriteError::SkipUnsupported)
        ));
        Ok(())
    }

    #[test]
    fn test_input_size_past_end() {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let data = image(2 * PAGE as usize);

        let result = write(&mut nand, &data, &WritePolicy::new().input_size(4 * PAGE));
        assert!(matches!(result, Err(WriteError::UnexpectedEof { missing }) if missing == 2 * PAGE));
        assert_eq!(nand.writes().count(), 2);
    }
}
