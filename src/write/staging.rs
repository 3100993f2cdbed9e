//! The staging buffer: one aligned block's worth of page (and OOB) records, read from the input a
//! page at a time and kept around until the whole block has been programmed.
//!
//! Keeping the bytes is what makes recovery from a failed write possible: the buffer can be
//! rewound and replayed into the next good block without touching the input again, which is the
//! only option when the input is a pipe.

use std::io::Read;

use crate::error::WriteError;
use crate::nand::PageUtil;
use crate::util::ReadExt;

/// The result of topping up one region of the buffer
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Fill {
    /// The region is ready to be written
    Ready {
        /// How many new bytes were taken from the input
        consumed: usize,
        /// Did the input end while filling?
        eof: bool,
    },
    /// The input ended before a single byte of the region was available
    Exhausted,
}

#[derive(Debug)]
pub struct StagingBuffer {
    buf: Box<[u8]>,
    /// How many bytes at the front of `buf` hold staged data
    filled: usize,
    /// Start of the next record to be written
    cursor: usize,
}

impl StagingBuffer {
    /// Allocate an erased buffer of `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![crate::nand::ERASED_BYTE; capacity].into_boxed_slice(),
            filled: 0,
            cursor: 0,
        }
    }

    /// Drop all staged data and start over with an erased buffer
    pub fn reset(&mut self) {
        self.buf[..self.filled].erase();
        self.filled = 0;
        self.cursor = 0;
    }

    /// Move the cursor back to the start, so the staged records are written again
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Is the cursor at the start of the buffer?
    ///
    /// This is the case both for a freshly reset buffer and for one that has just been rewound.
    pub fn at_start(&self) -> bool {
        self.cursor == 0
    }

    /// How many staged bytes have not been written yet
    pub fn pending(&self) -> usize {
        self.filled.saturating_sub(self.cursor)
    }

    /// Make sure `len` bytes, `skip` bytes past the cursor, are staged.
    ///
    /// Bytes already staged there are kept; only the missing tail is read from `input`. A short
    /// read is padded with erased bytes if `pad` is set, and is otherwise an error.
    pub fn fill<R: Read + ?Sized>(
        &mut self,
        input: &mut R,
        skip: usize,
        len: usize,
        pad: bool,
    ) -> Result<Fill, WriteError> {
        let begin = self.cursor + skip;
        let end = begin + len;
        if end <= self.filled {
            return Ok(Fill::Ready {
                consumed: 0,
                eof: false,
            });
        }

        let already = self.filled.saturating_sub(begin);
        let got = already
            + input
                .read_fill(&mut self.buf[begin + already..end])
                .map_err(WriteError::Input)?;

        if got == 0 {
            return Ok(Fill::Exhausted);
        }

        if got < len {
            if !pad {
                return Err(WriteError::UnexpectedEof {
                    missing: (len - got) as u64,
                });
            }
            self.buf[begin + got..end].erase();
        }

        self.filled = end;
        Ok(Fill::Ready {
            consumed: got - already,
            eof: got < len,
        })
    }

    /// Like [StagingBuffer::fill], for an OOB area: never padded, and any shortfall is an error
    pub fn fill_oob<R: Read + ?Sized>(
        &mut self,
        input: &mut R,
        skip: usize,
        len: usize,
    ) -> Result<Fill, WriteError> {
        match self.fill(input, skip, len, false) {
            Err(WriteError::UnexpectedEof { missing }) => {
                Err(WriteError::UnexpectedOobEof { missing })
            }
            Ok(Fill::Exhausted) => Err(WriteError::UnexpectedOobEof {
                missing: len as u64,
            }),
            result => result,
        }
    }

    /// The `len` bytes staged `skip` bytes past the cursor
    pub fn staged(&self, skip: usize, len: usize) -> &[u8] {
        &self.buf[self.cursor + skip..][..len]
    }

    /// Move the cursor past one written record
    pub fn advance(&mut self, record: usize) {
        self.cursor += record;
    }
}
