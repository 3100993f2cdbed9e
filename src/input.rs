//! Sources of image data.
//!
//! An image either comes from something seekable with a known size (a regular file), or from a
//! stream whose length is only known once it ends (standard input, a pipe).

use std::io::{self, Read, Seek, SeekFrom};

use crate::error::WriteError;

/// How much data an input holds
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InputLength {
    /// This many bytes remain from the current position
    Known(u64),
    /// Unknown until the stream ends
    Streaming,
}

/// A readable image source
pub trait InputSource: Read {
    /// How much data remains to be read
    fn length(&mut self) -> Result<InputLength, WriteError>;

    /// Discard the next `count` bytes without reading them
    fn skip(&mut self, count: u64) -> Result<(), WriteError>;
}

/// An input with a known size that can be seeked past, such as a regular file
#[derive(Debug)]
pub struct SeekableInput<R>(pub R);

/// An input that can only be read front to back, such as standard input
#[derive(Debug)]
pub struct StreamInput<R>(pub R);

impl<R: Read> Read for SeekableInput<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<R: Read + Seek> InputSource for SeekableInput<R> {
    fn length(&mut self) -> Result<InputLength, WriteError> {
        let mut measure = || -> io::Result<u64> {
            let pos = self.0.stream_position()?;
            let end = self.0.seek(SeekFrom::End(0))?;
            self.0.seek(SeekFrom::Start(pos))?;
            Ok(end.saturating_sub(pos))
        };

        measure().map(InputLength::Known).map_err(WriteError::Input)
    }

    fn skip(&mut self, count: u64) -> Result<(), WriteError> {
        let count = i64::try_from(count)
            .map_err(|_| WriteError::Input(io::Error::other("skip length too large")))?;
        self.0
            .seek(SeekFrom::Current(count))
            .map(|_| ())
            .map_err(WriteError::Input)
    }
}

impl<R: Read> Read for StreamInput<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<R: Read> InputSource for StreamInput<R> {
    fn length(&mut self) -> Result<InputLength, WriteError> {
        Ok(InputLength::Streaming)
    }

    fn skip(&mut self, count: u64) -> Result<(), WriteError> {
        if count == 0 {
            Ok(())
        } else {
            Err(WriteError::SkipUnsupported)
        }
    }
}

impl<I: InputSource + ?Sized> InputSource for Box<I> {
    fn length(&mut self) -> Result<InputLength, WriteError> {
        (**self).length()
    }

    fn skip(&mut self, count: u64) -> Result<(), WriteError> {
        (**self).skip(count)
    }
}

#[test]
fn test_seekable_input() -> anyhow::Result<()> {
    use std::io::Write;

    let mut file = tempfile::tempfile()?;
    file.write_all(&[7u8; 1000])?;
    file.rewind()?;

    let mut input = SeekableInput(file);
    assert_eq!(input.length()?, InputLength::Known(1000));

    input.skip(400)?;
    assert_eq!(input.length()?, InputLength::Known(600));

    let mut rest = Vec::new();
    input.read_to_end(&mut rest)?;
    assert_eq!(rest.len(), 600);
    Ok(())
}

#[test]
fn test_stream_input() -> anyhow::Result<()> {
    let mut input = StreamInput(&b"abc"[..]);
    assert_eq!(input.length()?, InputLength::Streaming);
    input.skip(0)?;
    assert!(matches!(input.skip(1), Err(WriteError::SkipUnsupported)));
    Ok(())
}
