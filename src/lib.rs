//! Write raw images to NAND flash, the way `nandwrite` does: page by page, skipping bad blocks,
//! and moving on to the next good block when a write fails.

pub mod error;
pub mod input;
pub mod nand;
pub mod progress;
pub mod util;
pub mod write;
