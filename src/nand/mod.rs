//! Abstractions and code to access NAND flash

use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::ensure;

use crate::error::{ConfigError, FlashError};

#[cfg(target_os = "linux")]
pub mod mtd;

/// The byte value of an erased NAND cell
pub const ERASED_BYTE: u8 = 0xFF;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;

    /// Return this page to the all-1s bit pattern
    fn erase(&mut self);
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == ERASED_BYTE)
    }

    fn erase(&mut self) {
        self.fill(ERASED_BYTE)
    }
}

/// A pub-fields struct describing the geometry of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Geometry {
    /// Minimum I/O unit, in bytes
    pub page_size: u32,
    /// Bytes of out-of-band area per page
    pub oob_size: u32,
    /// Bytes per erase block
    pub erase_block_size: u32,
    /// Total bytes on the device
    pub device_size: u64,
}

impl Geometry {
    /// Check the internal consistency of this geometry
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bad = |msg: &str| Err(ConfigError::Geometry(msg.into()));

        if self.page_size == 0 || self.erase_block_size == 0 {
            return bad("page and erase block sizes must be nonzero");
        }
        if self.erase_block_size % self.page_size != 0 {
            return bad("erase block size is not a multiple of the page size");
        }
        if self.device_size % u64::from(self.erase_block_size) != 0 {
            return bad("device size is not a multiple of the erase block size");
        }

        Ok(())
    }

    /// How many erase blocks the device has
    pub fn blocks(&self) -> u32 {
        (self.device_size / u64::from(self.erase_block_size)) as u32
    }

    /// How many pages in each erase block
    pub fn pages_per_block(&self) -> u32 {
        self.erase_block_size / self.page_size
    }

    /// Size of the logical block made of `block_align` consecutive erase blocks
    pub fn aligned_block_size(&self, block_align: u32) -> Result<u64, ConfigError> {
        if block_align == 0 {
            return Err(ConfigError::BlockAlign(0));
        }

        let aligned = u64::from(self.erase_block_size) * u64::from(block_align);
        if aligned % u64::from(self.page_size) != 0 {
            return Err(ConfigError::AlignedBlock {
                aligned,
                page_size: self.page_size,
            });
        }

        Ok(aligned)
    }

    /// The erase block containing byte `offset`
    pub fn block_of(&self, offset: u64) -> u32 {
        (offset / u64::from(self.erase_block_size)) as u32
    }

    /// The byte offset at which erase block `block` begins
    pub fn block_base(&self, block: u32) -> u64 {
        u64::from(block) * u64::from(self.erase_block_size)
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES", optionally suffixed with ":OOB"
impl FromStr for Geometry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (layout, oob_size) = match s.split_once(':') {
            Some((layout, oob)) => (layout, oob.parse()?),
            None => (s, 0),
        };

        let [blocks, pages_per_block, page_size]: [&str; 3] = layout
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#[:#]"))?;
        let blocks: u32 = blocks.parse()?;
        let pages_per_block: u32 = pages_per_block.parse()?;
        let page_size: u32 = page_size.parse()?;

        let erase_block_size = pages_per_block
            .checked_mul(page_size)
            .ok_or(anyhow::anyhow!("erase block size overflows"))?;

        let geometry = Geometry {
            page_size,
            oob_size,
            erase_block_size,
            device_size: u64::from(blocks) * u64::from(erase_block_size),
        };
        geometry.validate()?;
        Ok(geometry)
    }
}

/// How the device should treat the OOB area (and ECC) when programming a page.
///
/// These mirror the kernel's `MTD_OPS_*` modes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum OobMode {
    /// OOB bytes are placed exactly where given, ECC is computed by the driver
    #[default]
    PlacedOob,
    /// OOB bytes go into the free bytes chosen by the driver's layout
    AutoPlacement,
    /// No ECC; data and OOB are written verbatim
    Raw,
}

impl OobMode {
    /// Resolve the user's `noecc`/`autoplace` switches into a mode
    pub fn from_flags(no_ecc: bool, autoplace: bool) -> Result<Self, ConfigError> {
        match (no_ecc, autoplace) {
            (true, true) => Err(ConfigError::AutoplaceWithoutEcc),
            (true, false) => Ok(Self::Raw),
            (false, true) => Ok(Self::AutoPlacement),
            (false, false) => Ok(Self::PlacedOob),
        }
    }
}

/// Represents a NAND flash device
///
/// Blocks are erase blocks, indexed from the start of the device.
pub trait Nand {
    /// Get the geometry of the NAND
    fn geometry(&self) -> Geometry;

    /// Is this block marked bad?
    fn is_bad(&mut self, block: u32) -> Result<bool, FlashError>;

    /// Mark a block as bad, so that it won't be used again.
    fn mark_bad(&mut self, block: u32) -> Result<(), FlashError>;

    /// Erase a block, making all of its pages writable again
    fn erase(&mut self, block: u32) -> Result<(), FlashError>;

    /// Program the page at byte `offset`.
    ///
    /// `data`, if given, must be exactly one page. `oob`, if given, is at most the OOB size. At
    /// least one of them must be given.
    fn write_page(
        &mut self,
        offset: u64,
        data: Option<&[u8]>,
        oob: Option<&[u8]>,
        mode: OobMode,
    ) -> Result<(), FlashError>;
}

impl<N: Nand + ?Sized> Nand for &mut N {
    fn geometry(&self) -> Geometry {
        (**self).geometry()
    }
    fn is_bad(&mut self, block: u32) -> Result<bool, FlashError> {
        (**self).is_bad(block)
    }
    fn mark_bad(&mut self, block: u32) -> Result<(), FlashError> {
        (**self).mark_bad(block)
    }
    fn erase(&mut self, block: u32) -> Result<(), FlashError> {
        (**self).erase(block)
    }
    fn write_page(
        &mut self,
        offset: u64,
        data: Option<&[u8]>,
        oob: Option<&[u8]>,
        mode: OobMode,
    ) -> Result<(), FlashError> {
        (**self).write_page(offset, data, oob, mode)
    }
}

/// A failure to inject into [SimNand]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Fault {
    /// The operation fails with a hardware I/O error
    Io,
    /// The operation fails with some other error
    Fatal,
}

impl Fault {
    fn raise(self, what: &str) -> FlashError {
        match self {
            Fault::Io => FlashError::Io(std::io::Error::other(format!("simulated {what} fault"))),
            Fault::Fatal => anyhow::anyhow!("simulated fatal {what} fault").into(),
        }
    }
}

/// A device operation recorded by [SimNand]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SimOp {
    /// Page write attempted at this byte offset
    Write(u64),
    /// Erase attempted on this block
    Erase(u32),
    /// Marking this block bad was attempted
    MarkBad(u32),
}

/// A simulated in-memory NAND flash, for testing purposes
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    geometry: Geometry,

    /// Offsets whose next write fails
    write_faults: HashMap<u64, Fault>,
    /// Blocks whose next erase fails
    erase_faults: HashMap<u32, Fault>,
    /// Blocks whose next mark-bad fails
    mark_bad_faults: HashMap<u32, Fault>,
    /// Blocks whose bad-block query fails
    query_faults: BTreeSet<u32>,

    history: Vec<SimOp>,
}

/// A block of SimNand
#[derive(Debug, Clone)]
struct SimBlock {
    /// Main data of every page in the block
    data: Vec<u8>,

    /// OOB area of every page in the block
    oob: Vec<u8>,

    /// Index of the first page that can still be programmed
    next_page: u32,

    /// Is this block marked bad?
    marked_bad: bool,
}

impl SimNand {
    /// Create an erased SimNand with the specified geometry
    pub fn new(geometry: Geometry) -> Self {
        let blocks = vec![SimBlock::new(geometry); geometry.blocks() as usize];
        let blocks = blocks.into_boxed_slice();

        Self {
            blocks,
            geometry,
            write_faults: HashMap::new(),
            erase_faults: HashMap::new(),
            mark_bad_faults: HashMap::new(),
            query_faults: BTreeSet::new(),
            history: Vec::new(),
        }
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let mut buf = vec![0; self.geometry.erase_block_size as usize];

        for block in self.blocks.iter_mut() {
            read.read_exact(&mut buf)?;
            block.marked_bad = false;
            block.data.copy_from_slice(&buf);
            block.next_page = 0;
        }

        Ok(())
    }

    /// Write the main data of this simulated NAND out to a writable stream (such as a File)
    ///
    /// Blocks marked bad are written as 0xBD.
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let mut buf = vec![0; self.geometry.erase_block_size as usize];

        for block in self.blocks.iter() {
            if block.marked_bad {
                buf.fill(0xBD);
            } else {
                buf.copy_from_slice(&block.data);
            }

            write.write_all(&buf)?;
        }

        Ok(())
    }

    /// Read main data starting at byte `offset`
    pub fn read(&self, offset: u64, content: &mut [u8]) -> anyhow::Result<()> {
        let end = offset + content.len() as u64;
        ensure!(end <= self.geometry.device_size, "read out of bounds");

        let block_size = self.geometry.erase_block_size as usize;
        let mut pos = 0;
        while pos < content.len() {
            let offset = offset + pos as u64;
            let block = &self.blocks[self.geometry.block_of(offset) as usize];
            let within = (offset % block_size as u64) as usize;
            let len = std::cmp::min(block_size - within, content.len() - pos);
            content[pos..pos + len].copy_from_slice(&block.data[within..within + len]);
            pos += len;
        }

        Ok(())
    }

    /// Read the OOB area of the page at byte `offset`
    pub fn read_oob(&self, offset: u64) -> anyhow::Result<&[u8]> {
        ensure!(offset < self.geometry.device_size, "read out of bounds");
        let (block, page) = self.locate_page(offset)?;
        let oob_size = self.geometry.oob_size as usize;
        let begin = page as usize * oob_size;
        Ok(&self.blocks[block as usize].oob[begin..begin + oob_size])
    }

    /// Mark a block bad from the factory, without recording it as an operation
    pub fn set_bad(&mut self, block: u32) {
        self.blocks[block as usize].marked_bad = true;
    }

    /// Make the next write to the page at `offset` fail
    pub fn fail_write(&mut self, offset: u64, fault: Fault) {
        self.write_faults.insert(offset, fault);
    }

    /// Make the next erase of `block` fail
    pub fn fail_erase(&mut self, block: u32, fault: Fault) {
        self.erase_faults.insert(block, fault);
    }

    /// Make the next attempt to mark `block` bad fail
    pub fn fail_mark_bad(&mut self, block: u32, fault: Fault) {
        self.mark_bad_faults.insert(block, fault);
    }

    /// Make every bad-block query on `block` fail
    pub fn fail_query(&mut self, block: u32) {
        self.query_faults.insert(block);
    }

    /// Every write, erase, and mark-bad performed so far, in order
    pub fn history(&self) -> &[SimOp] {
        &self.history
    }

    /// Byte offsets of every attempted page write, in order
    pub fn writes(&self) -> impl Iterator<Item = u64> + '_ {
        self.history.iter().filter_map(|op| match op {
            SimOp::Write(offset) => Some(*offset),
            _ => None,
        })
    }

    /// Split a page-aligned byte offset into block index and page index
    fn locate_page(&self, offset: u64) -> anyhow::Result<(u32, u32)> {
        let page_size = u64::from(self.geometry.page_size);
        ensure!(offset % page_size == 0, "offset {offset:#x} not page-aligned");
        ensure!(
            offset < self.geometry.device_size,
            "offset {offset:#x} out of range"
        );

        let block = self.geometry.block_of(offset);
        let page = ((offset - self.geometry.block_base(block)) / page_size) as u32;
        Ok((block, page))
    }

    /// Validate a page write, returning the block and page it lands on
    fn check_write(
        &self,
        offset: u64,
        data: Option<&[u8]>,
        oob: Option<&[u8]>,
    ) -> anyhow::Result<(u32, u32)> {
        let (block, page) = self.locate_page(offset)?;

        ensure!(data.is_some() || oob.is_some(), "nothing to write");
        if let Some(data) = data {
            ensure!(
                data.len() == self.geometry.page_size as usize,
                "content not page-sized"
            );
        }
        if let Some(oob) = oob {
            ensure!(
                oob.len() <= self.geometry.oob_size as usize,
                "OOB content too large"
            );
        }

        let sim_block = &self.blocks[block as usize];
        ensure!(!sim_block.marked_bad, "write to bad block {block}");
        ensure!(page >= sim_block.next_page, "write in already-written area");

        Ok((block, page))
    }

    fn check_block(&self, block: u32) -> anyhow::Result<&SimBlock> {
        self.blocks
            .get(block as usize)
            .ok_or(anyhow::anyhow!("block {block} out of range"))
    }
}

impl SimBlock {
    /// Construct an erased block within the given geometry
    fn new(geometry: Geometry) -> Self {
        let pages = geometry.pages_per_block() as usize;
        Self {
            data: vec![ERASED_BYTE; geometry.erase_block_size as usize],
            oob: vec![ERASED_BYTE; geometry.oob_size as usize * pages],
            next_page: 0,
            marked_bad: false,
        }
    }
}

impl Nand for SimNand {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn is_bad(&mut self, block: u32) -> Result<bool, FlashError> {
        if self.query_faults.contains(&block) {
            return Err(Fault::Fatal.raise("bad block query"));
        }
        Ok(self.check_block(block)?.marked_bad)
    }

    fn mark_bad(&mut self, block: u32) -> Result<(), FlashError> {
        self.check_block(block)?;
        self.history.push(SimOp::MarkBad(block));

        if let Some(fault) = self.mark_bad_faults.remove(&block) {
            return Err(fault.raise("mark bad"));
        }

        self.blocks[block as usize].marked_bad = true;
        Ok(())
    }

    fn erase(&mut self, block: u32) -> Result<(), FlashError> {
        self.check_block(block)?;
        self.history.push(SimOp::Erase(block));

        if let Some(fault) = self.erase_faults.remove(&block) {
            return Err(fault.raise("erase"));
        }

        let block = &mut self.blocks[block as usize];
        block.data.erase();
        block.oob.erase();
        block.next_page = 0;
        Ok(())
    }

    fn write_page(
        &mut self,
        offset: u64,
        data: Option<&[u8]>,
        oob: Option<&[u8]>,
        _mode: OobMode,
    ) -> Result<(), FlashError> {
        let (block_index, page) = self.check_write(offset, data, oob)?;
        let page_size = self.geometry.page_size as usize;
        let oob_size = self.geometry.oob_size as usize;

        self.history.push(SimOp::Write(offset));
        let block = &mut self.blocks[block_index as usize];

        if let Some(fault) = self.write_faults.remove(&offset) {
            return Err(fault.raise("write"));
        }

        // Writing fully-erased content is a no-op.
        if let Some(data) = data.filter(|x| !x.is_erased()) {
            let begin = page as usize * page_size;
            block.data[begin..begin + page_size].copy_from_slice(data);
        }
        if let Some(oob) = oob {
            let begin = page as usize * oob_size;
            block.oob[begin..begin + oob.len()].copy_from_slice(oob);
        }
        block.next_page = page + 1;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) const TEST_GEOMETRY: Geometry = Geometry {
    page_size: 256,
    oob_size: 16,
    erase_block_size: 256 * 16,
    device_size: 256 * 16 * 8,
};

#[test]
fn test_geometry_parse() -> anyhow::Result<()> {
    let geometry: Geometry = "8x16x256:16".parse()?;
    assert_eq!(geometry, TEST_GEOMETRY);

    let geometry: Geometry = "4x64x2048".parse()?;
    assert_eq!(geometry.oob_size, 0);
    assert_eq!(geometry.erase_block_size, 64 * 2048);
    assert_eq!(geometry.blocks(), 4);

    assert!("4x64".parse::<Geometry>().is_err());
    assert!("4x0x2048".parse::<Geometry>().is_err());
    Ok(())
}

#[test]
fn test_geometry_validate() {
    assert!(TEST_GEOMETRY.validate().is_ok());

    let odd_block = Geometry {
        erase_block_size: 1000,
        ..TEST_GEOMETRY
    };
    assert!(odd_block.validate().is_err());

    let odd_device = Geometry {
        device_size: TEST_GEOMETRY.device_size + 256,
        ..TEST_GEOMETRY
    };
    assert!(odd_device.validate().is_err());
}

#[test]
fn test_aligned_block_size() {
    assert_eq!(TEST_GEOMETRY.aligned_block_size(1).ok(), Some(4096));
    assert_eq!(TEST_GEOMETRY.aligned_block_size(4).ok(), Some(4 * 4096));
    assert!(TEST_GEOMETRY.aligned_block_size(0).is_err());

    // An erase block that doesn't hold a whole number of pages can never be aligned
    let broken = Geometry {
        erase_block_size: 1000,
        ..TEST_GEOMETRY
    };
    for align in 1..=4 {
        assert!(matches!(
            broken.aligned_block_size(align),
            Err(ConfigError::AlignedBlock { .. })
        ));
    }
}

#[test]
fn test_oob_mode_flags() {
    assert_eq!(OobMode::from_flags(false, false).ok(), Some(OobMode::PlacedOob));
    assert_eq!(OobMode::from_flags(true, false).ok(), Some(OobMode::Raw));
    assert_eq!(
        OobMode::from_flags(false, true).ok(),
        Some(OobMode::AutoPlacement)
    );
    assert!(OobMode::from_flags(true, true).is_err());
}

#[test]
fn test_sim_mark_bad() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_GEOMETRY);
    assert!(!nand.is_bad(0)?);
    nand.mark_bad(0)?;
    assert!(nand.is_bad(0)?);
    assert!(nand.is_bad(TEST_GEOMETRY.blocks()).is_err());
    Ok(())
}

#[test]
fn test_sim_read_write() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_GEOMETRY);
    let page = u64::from(TEST_GEOMETRY.page_size);

    let data_in = vec![0xA5u8; TEST_GEOMETRY.page_size as usize];
    let mut data_out = data_in.clone();

    nand.write_page(
        2 * page,
        Some(&data_in[..]),
        Some(&[1, 2, 3][..]),
        OobMode::PlacedOob,
    )?;
    assert!(nand
        .write_page(page, Some(&data_in[..]), None, OobMode::PlacedOob)
        .is_err());

    nand.read(page, &mut data_out)?;
    assert!(data_out.is_erased());

    nand.read(2 * page, &mut data_out)?;
    assert_eq!(data_out, data_in);
    assert_eq!(&nand.read_oob(2 * page)?[..4], &[1, 2, 3, 0xFF]);

    nand.read(3 * page, &mut data_out)?;
    assert!(data_out.is_erased());

    // Erasing makes the block writable from the start again
    nand.erase(0)?;
    nand.write_page(0, Some(&data_in[..]), None, OobMode::PlacedOob)?;
    Ok(())
}

#[test]
fn test_sim_faults() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_GEOMETRY);
    let data = vec![0u8; TEST_GEOMETRY.page_size as usize];

    nand.fail_write(0, Fault::Io);
    nand.fail_erase(0, Fault::Fatal);
    nand.fail_mark_bad(5, Fault::Io);
    nand.fail_query(3);

    assert!(matches!(
        nand.write_page(0, Some(&data[..]), None, OobMode::Raw),
        Err(FlashError::Io(_))
    ));
    // Faults only fire once
    nand.write_page(0, Some(&data[..]), None, OobMode::Raw)?;

    assert!(matches!(nand.erase(0), Err(FlashError::Other(_))));
    nand.erase(0)?;

    assert!(matches!(nand.mark_bad(5), Err(FlashError::Io(_))));
    assert!(!nand.is_bad(5)?);
    nand.mark_bad(5)?;
    assert!(nand.is_bad(5)?);

    assert!(nand.is_bad(3).is_err());
    assert_eq!(
        nand.history(),
        [
            SimOp::Write(0),
            SimOp::Write(0),
            SimOp::Erase(0),
            SimOp::Erase(0),
            SimOp::MarkBad(5),
            SimOp::MarkBad(5)
        ]
    );
    Ok(())
}

#[test]
fn test_sim_load_save() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_GEOMETRY);
    nand.load(&mut std::io::repeat(0x55u8))?;

    let mut buf = vec![0u8; TEST_GEOMETRY.erase_block_size as usize];
    nand.read(0, &mut buf)?;
    assert!(buf.iter().all(|&x| x == 0x55u8));

    nand.set_bad(1);
    let mut saved = Vec::new();
    nand.save(&mut saved)?;
    assert_eq!(saved.len() as u64, TEST_GEOMETRY.device_size);
    assert_eq!(saved[0], 0x55);
    assert_eq!(saved[TEST_GEOMETRY.erase_block_size as usize], 0xBD);
    Ok(())
}
