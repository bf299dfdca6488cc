//! NAND access over the Linux MTD subsystem
//!
//! Wraps an open `/dev/mtdX` character device. Page data moves through
//! positioned reads/writes (the MTD layer applies ECC on both paths);
//! erase, bad-block query and bad-block marking go through the MTD ioctls.

use super::{BlockIndex, Nand, NandLayout, PageIndex, PageUtil};
use crate::error::{Error, Result};

use anyhow::bail;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    layout: NandLayout,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let layout = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self { file, layout })
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
                let mtd_dev = line.split(':').next().unwrap();
                return Self::open(Path::new("/dev").join(mtd_dev));
            }
        }

        bail!("MTD device {name} could not be found");
    }

    fn page_offset(&self, page: PageIndex) -> u64 {
        (page as u64) << self.layout.log2_page_size
    }

    fn block_offset(&self, block: BlockIndex) -> u64 {
        (block as u64) << (self.layout.log2_page_size + self.layout.log2_ppb)
    }
}

impl Nand for MtdNand {
    fn layout(&self) -> NandLayout {
        self.layout
    }

    fn is_bad(&self, block: BlockIndex) -> bool {
        let base = self.block_offset(block);
        match unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &base) } {
            Ok(0) => false,
            // A failing query is treated the same as a bad mark; the
            // journal will route around the block.
            _ => true,
        }
    }

    fn mark_bad(&mut self, block: BlockIndex) {
        let base = self.block_offset(block);
        let _ = unsafe { ioctl::memsetbadblock(self.file.as_raw_fd(), &base) };
    }

    fn erase(&mut self, block: BlockIndex) -> Result<()> {
        let erase_info = ioctl::erase_info_user {
            start: self.block_offset(block) as u32,
            length: self.layout.block_size() as u32,
        };
        match unsafe { ioctl::memerase(self.file.as_raw_fd(), &erase_info) } {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::BadBlock),
        }
    }

    fn prog(&mut self, page: PageIndex, data: &[u8]) -> Result<()> {
        self.file
            .write_all_at(data, self.page_offset(page))
            .map_err(|_| Error::BadBlock)
    }

    fn is_free(&self, page: PageIndex) -> bool {
        // MTD has no cheap erased-page query; read the page and test for
        // the all-1s pattern. Imprecise for pages programmed with 0xFF,
        // which the journal tolerates.
        let mut buf = vec![0; self.layout.page_size()];
        match self.read(page, 0, &mut buf) {
            Ok(()) => buf.is_erased(),
            Err(_) => false,
        }
    }

    fn read(&self, page: PageIndex, offset: usize, out: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(out, self.page_offset(page) + offset as u64)
            .map_err(|_| Error::Ecc)
    }

    fn copy(&mut self, src: PageIndex, dst: PageIndex) -> Result<()> {
        let mut buf = vec![0; self.layout.page_size()];

        self.read(src, 0, &mut buf)?;
        self.prog(dst, &buf)
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::NandLayout;

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

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

    impl TryInto<NandLayout> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(self) -> anyhow::Result<NandLayout> {
            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );
            ensure!(
                self.writesize.is_power_of_two(),
                "MTD writesize not a power of two"
            );

            let blocks = self.size / self.erasesize;
            let pages_per_block = self.erasesize / self.writesize;
            ensure!(
                pages_per_block.is_power_of_two(),
                "MTD pages per block not a power of two"
            );

            Ok(NandLayout {
                log2_page_size: self.writesize.trailing_zeros() as u8,
                log2_ppb: pages_per_block.trailing_zeros() as u8,
                blocks,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);
}
