//! Error types for image writing.

use std::io;

use nix::errno::Errno;
use thiserror::Error;

/// An error reported by a flash device.
///
/// Only [FlashError::Io] is a hardware-reported failure of the operation itself; a page write or
/// erase failing this way can be recovered from by moving on to another block. Everything else
/// means the device (or the caller) is in a state that can't be trusted.
#[derive(Debug, Error)]
pub enum FlashError {
    /// The device reported an I/O error (EIO) for the operation
    #[error("flash I/O error: {0}")]
    Io(#[source] io::Error),

    /// Any other failure
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FlashError {
    /// Is this a hardware-reported I/O failure?
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl From<Errno> for FlashError {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::EIO => Self::Io(io::Error::from(errno)),
            errno => Self::Other(errno.into()),
        }
    }
}

/// Problems with the requested write, detected before the device is touched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid flash geometry: {0}")]
    Geometry(String),

    #[error("can't specify negative device offset: {0}")]
    NegativeOffset(i64),

    #[error("block alignment must be a positive number of eraseblocks, got {0}")]
    BlockAlign(i64),

    #[error("aligned block size {aligned:#x} is not a multiple of the page size {page_size:#x}")]
    AlignedBlock { aligned: u64, page_size: u32 },

    #[error("the start address {offset:#x} is not page-aligned (page size is {page_size:#x})")]
    StartNotAligned { offset: u64, page_size: u32 },

    #[error("autoplacement and no-ECC are mutually exclusive")]
    AutoplaceWithoutEcc,

    #[error("can't pad when OOB data is present")]
    PadWithOob,

    #[error("the device has no OOB area to write OOB data to")]
    NoOobArea,

    #[error("input of {len} bytes is not page-aligned ({record} bytes per page); use padding")]
    NotPageAligned { len: u64, record: u64 },

    #[error(
        "input does not fit into device: image {len} bytes, page {page_size} bytes, \
         OOB {oob_size} bytes, device {device_size} bytes, start {start:#x}"
    )]
    TooLarge {
        len: u64,
        page_size: u32,
        oob_size: u32,
        device_size: u64,
        start: u64,
    },
}

/// Everything that can make an image write fail.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("file I/O error on input")]
    Input(#[source] io::Error),

    #[error("seeking a streaming input is not supported")]
    SkipUnsupported,

    #[error("unexpected EOF, expecting at least {missing} more bytes; use the padding option")]
    UnexpectedEof { missing: u64 },

    #[error("unexpected EOF, expecting at least {missing} more bytes for OOB")]
    UnexpectedOobEof { missing: u64 },

    #[error("bad block query failed at offset {offset:#x}")]
    DeviceQuery {
        offset: u64,
        #[source]
        source: FlashError,
    },

    #[error("too many bad blocks, cannot complete request")]
    OutOfSpace,

    #[error("write failure at offset {offset:#x}")]
    Write {
        offset: u64,
        #[source]
        source: FlashError,
    },

    #[error("erase failure at offset {offset:#x}")]
    Erase {
        offset: u64,
        #[source]
        source: FlashError,
    },

    #[error("marking block at {offset:#x} bad failed")]
    MarkBad {
        offset: u64,
        #[source]
        source: FlashError,
    },

    #[error("{remaining} input bytes were left over and {unwritten} staged bytes were not written")]
    Incomplete { remaining: u64, unwritten: usize },
}

impl WriteError {
    /// Could anything have been written to the device before this error was raised?
    pub fn is_partial(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::SkipUnsupported)
    }
}

#[test]
fn test_errno_classification() {
    assert!(FlashError::from(Errno::EIO).is_io());
    assert!(!FlashError::from(Errno::EINVAL).is_io());
    assert!(!FlashError::Other(anyhow::anyhow!("nope")).is_io());
}
