//! Useful traits and other utilities that don't really belong anywhere else.

use std::io::{self, Read};

pub trait ReadExt {
    /// Tries to fill `buf` completely, like `read_exact`, but unlike `read_exact`, is forgiving of
    /// unexpected EOF.
    ///
    /// Returns how many bytes were placed at the front of `buf`. Anything shorter than
    /// `buf.len()` means an EOF was encountered.
    fn read_fill(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<T: Read + ?Sized> ReadExt for T {
    fn read_fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut cursor = 0;
        while cursor < buf.len() {
            cursor += match self.read(&mut buf[cursor..]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(x) => return Err(x),
            };
        }

        Ok(cursor)
    }
}

/// Parse an integer the way C's `strtoll(.., 0)` does: `0x` prefix for hex, leading `0` for octal,
/// decimal otherwise.
pub fn parse_int(s: &str) -> anyhow::Result<i64> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };

    let value = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16)?
    } else if digits.len() > 1 && digits.starts_with('0') {
        i64::from_str_radix(&digits[1..], 8)?
    } else {
        digits.parse()?
    };

    Ok(if negative { -value } else { value })
}

#[test]
fn test_read_fill() -> io::Result<()> {
    let mut buf = [0u8; 4];
    assert_eq!(io::repeat(0xAA).read_fill(&mut buf)?, 4);
    assert_eq!(buf, [0xAA; 4]);

    assert_eq!((&[1, 2, 3][..]).read_fill(&mut buf)?, 3);
    assert_eq!(buf, [1, 2, 3, 0xAA]);

    assert_eq!(io::empty().read_fill(&mut buf)?, 0);
    Ok(())
}

#[test]
fn test_read_fill_short_reads() -> io::Result<()> {
    // A reader that hands out one byte per call, like a pipe under load
    struct Trickle<'a>(&'a [u8]);
    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = std::cmp::min(1, std::cmp::min(buf.len(), self.0.len()));
            buf[..n].copy_from_slice(&self.0[..n]);
            self.0 = &self.0[n..];
            Ok(n)
        }
    }

    let mut buf = [0u8; 8];
    assert_eq!(Trickle(b"hello").read_fill(&mut buf)?, 5);
    assert_eq!(&buf[..5], b"hello");
    Ok(())
}

#[test]
fn test_parse_int() -> anyhow::Result<()> {
    assert_eq!(parse_int("4096")?, 4096);
    assert_eq!(parse_int("0x20000")?, 0x20000);
    assert_eq!(parse_int("010")?, 8);
    assert_eq!(parse_int("0")?, 0);
    assert_eq!(parse_int("-1")?, -1);
    assert!(parse_int("12k").is_err());
    Ok(())
}
