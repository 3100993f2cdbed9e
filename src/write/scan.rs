//! This module contains the bad-block scan run whenever writing enters a new aligned block.

use log::warn;

use crate::error::WriteError;
use crate::nand::{Geometry, Nand};

/// Where writing should continue after a scan
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Located {
    /// The device offset to write at; moved forward if bad blocks were skipped
    pub offset: u64,
    /// Start of the aligned block containing `offset`
    pub block_start: u64,
    /// How many aligned blocks were skipped for being bad
    pub skipped: u32,
}

/// Finds the next aligned block that contains no bad erase blocks.
#[derive(Debug, Clone)]
pub struct BadBlockScanner {
    geometry: Geometry,
    aligned: u64,
    skip_bad: bool,
    quiet: bool,
}

impl BadBlockScanner {
    pub fn new(geometry: Geometry, aligned: u64, skip_bad: bool, quiet: bool) -> Self {
        Self {
            geometry,
            aligned,
            skip_bad,
            quiet,
        }
    }

    /// Start of the aligned block containing `offset`
    pub fn block_start(&self, offset: u64) -> u64 {
        offset - offset % self.aligned
    }

    /// Starting from `offset`, skip over every aligned block that contains a bad erase block.
    ///
    /// With bad-block skipping disabled, this only computes the block start.
    pub fn locate<N: Nand + ?Sized>(
        &self,
        nand: &mut N,
        mut offset: u64,
    ) -> Result<Located, WriteError> {
        let mut block_start = self.block_start(offset);
        let mut skipped = 0;

        if !self.skip_bad {
            return Ok(Located {
                offset,
                block_start,
                skipped,
            });
        }

        let erase_block_size = u64::from(self.geometry.erase_block_size);
        let mut sub = block_start;
        while sub < block_start + self.aligned {
            // Past the end of the device there's nothing to query; the caller stops there.
            if sub >= self.geometry.device_size {
                break;
            }

            let bad = nand
                .is_bad(self.geometry.block_of(sub))
                .map_err(|source| WriteError::DeviceQuery {
                    offset: sub,
                    source,
                })?;

            if bad {
                if !self.quiet {
                    warn!(
                        "Bad block at {sub:#x}, {} block(s) from {block_start:#x} will be skipped",
                        self.aligned / erase_block_size
                    );
                }

                offset = block_start + self.aligned;
                if offset > self.geometry.device_size {
                    return Err(WriteError::OutOfSpace);
                }

                skipped += 1;
                block_start = self.block_start(offset);
                sub = block_start;
                continue;
            }

            sub += erase_block_size;
        }

        Ok(Located {
            offset,
            block_start,
            skipped,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{SimNand, TEST_GEOMETRY};

    const BLOCK: u64 = TEST_GEOMETRY.erase_block_size as u64;

    #[test]
    fn test_no_bad_blocks() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let scanner = BadBlockScanner::new(TEST_GEOMETRY, BLOCK, true, true);

        let located = scanner.locate(&mut nand, BLOCK + 512)?;
        assert_eq!(
            located,
            Located {
                offset: BLOCK + 512,
                block_start: BLOCK,
                skipped: 0
            }
        );
        Ok(())
    }

    #[test]
    fn test_skip_consecutive_bad() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        nand.set_bad(1);
        nand.set_bad(2);
        let scanner = BadBlockScanner::new(TEST_GEOMETRY, BLOCK, true, true);

        let located = scanner.locate(&mut nand, BLOCK)?;
        assert_eq!(located.offset, 3 * BLOCK);
        assert_eq!(located.block_start, 3 * BLOCK);
        assert_eq!(located.skipped, 2);
        Ok(())
    }

    #[test]
    fn test_aligned_skip() -> anyhow::Result<()> {
        // Erase blocks 2 and 3 are bad, so all of aligned block 0..4 goes
        let mut nand = SimNand::new(TEST_GEOMETRY);
        nand.set_bad(2);
        nand.set_bad(3);
        let scanner = BadBlockScanner::new(TEST_GEOMETRY, 4 * BLOCK, true, true);

        let located = scanner.locate(&mut nand, 0)?;
        assert_eq!(located.offset, 4 * BLOCK);
        assert_eq!(located.block_start, 4 * BLOCK);
        Ok(())
    }

    #[test]
    fn test_no_skip() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        nand.set_bad(0);
        nand.fail_query(0);
        let scanner = BadBlockScanner::new(TEST_GEOMETRY, BLOCK, false, true);

        assert_eq!(scanner.locate(&mut nand, 256)?.offset, 256);
        Ok(())
    }

    #[test]
    fn test_query_failure() {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        nand.fail_query(1);
        let scanner = BadBlockScanner::new(TEST_GEOMETRY, BLOCK, true, true);

        assert!(matches!(
            scanner.locate(&mut nand, BLOCK),
            Err(WriteError::DeviceQuery { offset: BLOCK, .. })
        ));
    }

    #[test]
    fn test_out_of_space() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let blocks = TEST_GEOMETRY.blocks();
        let scanner = BadBlockScanner::new(TEST_GEOMETRY, 2 * BLOCK, true, true);

        // The last aligned block being bad leaves the offset exactly at the end of the device
        nand.set_bad(blocks - 1);
        let located = scanner.locate(&mut nand, u64::from(blocks - 2) * BLOCK)?;
        assert_eq!(located.offset, TEST_GEOMETRY.device_size);

        // An aligned block hanging off the end of the device can't be skipped past
        let scanner = BadBlockScanner::new(TEST_GEOMETRY, 3 * BLOCK, true, true);
        let start = 6 * BLOCK;
        nand.set_bad(6);
        assert!(matches!(
            scanner.locate(&mut nand, start),
            Err(WriteError::OutOfSpace)
        ));
        Ok(())
    }
}
