//! NAND abstraction layer implementation over the Linux MTD subsystem

use super::{Geometry, Nand, OobMode};
use crate::error::FlashError;

use anyhow::{bail, ensure};
use log::debug;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::fd::AsRawFd;
use std::path::Path;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    geometry: Geometry,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(&path)?;
        let geometry: Geometry = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        debug!(
            "{}: page size {}, OOB size {}, erase block size {}, size {}",
            path.as_ref().display(),
            geometry.page_size,
            geometry.oob_size,
            geometry.erase_block_size,
            geometry.device_size
        );

        Ok(Self { file, geometry })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                if let Some(mtd_dev) = line.split(':').next() {
                    return Self::open(Path::new("/dev").join(mtd_dev));
                }
            }
        }

        bail!("MTD device {name} could not be found");
    }

    /// Switch the file descriptor into raw mode, bypassing ECC for all accesses
    pub fn set_raw_mode(&mut self) -> anyhow::Result<()> {
        match unsafe { ioctl::mtdfilemode(self.file.as_raw_fd(), ioctl::MTD_FILE_MODE_RAW) } {
            Ok(_) => Ok(()),
            Err(nix::errno::Errno::ENOTTY) => bail!("ioctl MTDFILEMODE is missing"),
            Err(errno) => Err(anyhow::Error::new(errno).context("MTDFILEMODE")),
        }
    }

    fn block_base(&self, block: u32) -> anyhow::Result<u64> {
        ensure!(block < self.geometry.blocks(), "block {block} out of range");
        Ok(self.geometry.block_base(block))
    }

    fn check_write(&self, offset: u64, has_payload: bool) -> anyhow::Result<()> {
        ensure!(
            offset < self.geometry.device_size,
            "offset {offset:#x} out of range"
        );
        ensure!(has_payload, "nothing to write");
        Ok(())
    }
}

impl Nand for MtdNand {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn is_bad(&mut self, block: u32) -> Result<bool, FlashError> {
        let block_base = self.block_base(block)?;
        let bad = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &block_base)? };
        Ok(bad != 0)
    }

    fn mark_bad(&mut self, block: u32) -> Result<(), FlashError> {
        let block_base = self.block_base(block)?;
        unsafe {
            ioctl::memsetbadblock(self.file.as_raw_fd(), &block_base)?;
        }
        Ok(())
    }

    fn erase(&mut self, block: u32) -> Result<(), FlashError> {
        let erase_info = ioctl::erase_info_user64 {
            start: self.block_base(block)?,
            length: u64::from(self.geometry.erase_block_size),
        };
        unsafe {
            ioctl::memerase64(self.file.as_raw_fd(), &erase_info)?;
        }
        Ok(())
    }

    fn write_page(
        &mut self,
        offset: u64,
        data: Option<&[u8]>,
        oob: Option<&[u8]>,
        mode: OobMode,
    ) -> Result<(), FlashError> {
        self.check_write(offset, data.is_some() || oob.is_some())?;

        let mut req = ioctl::mtd_write_req {
            start: offset,
            len: data.map_or(0, |x| x.len() as u64),
            ooblen: oob.map_or(0, |x| x.len() as u64),
            usr_data: data.map_or(0, |x| x.as_ptr() as u64),
            usr_oob: oob.map_or(0, |x| x.as_ptr() as u64),
            mode: match mode {
                OobMode::PlacedOob => ioctl::MTD_OPS_PLACE_OOB,
                OobMode::AutoPlacement => ioctl::MTD_OPS_AUTO_OOB,
                OobMode::Raw => ioctl::MTD_OPS_RAW,
            },
            padding: [0; 7],
        };
        unsafe {
            ioctl::memwrite(self.file.as_raw_fd(), &mut req)?;
        }
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::Geometry;

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_readwrite, ioctl_write_int_bad, ioctl_write_ptr, request_code_none};

    const MTD_IOC_MAGIC: u8 = b'M';

    pub const MTD_OPS_PLACE_OOB: u8 = 0;
    pub const MTD_OPS_AUTO_OOB: u8 = 1;
    pub const MTD_OPS_RAW: u8 = 2;

    pub const MTD_FILE_MODE_RAW: nix::libc::c_int = 3;

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<Geometry> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(self) -> anyhow::Result<Geometry> {
            ensure!(
                self.writesize != 0 && self.erasesize != 0,
                "MTD reports a zero writesize or erasesize"
            );
            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );

            let geometry = Geometry {
                page_size: self.writesize,
                oob_size: self.oobsize,
                erase_block_size: self.erasesize,
                device_size: u64::from(self.size),
            };
            geometry.validate()?;
            Ok(geometry)
        }
    }

    #[repr(C)]
    pub struct erase_info_user64 {
        pub start: u64,
        pub length: u64,
    }
    ioctl_write_ptr!(memerase64, MTD_IOC_MAGIC, 20, erase_info_user64);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);

    ioctl_write_int_bad!(mtdfilemode, request_code_none!(MTD_IOC_MAGIC, 19));

    #[repr(C)]
    pub struct mtd_write_req {
        pub start: u64,
        pub len: u64,
        pub ooblen: u64,
        pub usr_data: u64,
        pub usr_oob: u64,
        pub mode: u8,
        pub padding: [u8; 7],
    }
    ioctl_readwrite!(memwrite, MTD_IOC_MAGIC, 21, mtd_write_req);
}
