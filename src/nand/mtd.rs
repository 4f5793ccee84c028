//! MTD-backed flash access, through the Linux character device.

use super::{Flash, FlashInfo};

use anyhow::{bail, ensure, Context};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// One MTD partition, open read-write.
#[derive(Debug)]
pub struct MtdFlash {
    dev: File,
    info: FlashInfo,
}

impl MtdFlash {
    /// Open an MTD character device such as `/dev/mtd2`.
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let dev = File::options()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("cannot open {}", path.display()))?;

        let raw = unsafe {
            let mut raw = MaybeUninit::<ioctl::MtdInfo>::uninit();
            ioctl::mtd_info(dev.as_raw_fd(), raw.as_mut_ptr()).context("MEMGETINFO")?;
            raw.assume_init()
        };
        ensure!(
            raw.writesize > 0
                && raw.erasesize % raw.writesize == 0
                && raw.size % raw.erasesize == 0,
            "{} reports unusable geometry ({} bytes, {}-byte eraseblocks, {}-byte pages)",
            path.display(),
            raw.size,
            raw.erasesize,
            raw.writesize
        );

        Ok(Self {
            dev,
            info: FlashInfo {
                size: u64::from(raw.size),
                eb_size: raw.erasesize,
                min_io_size: raw.writesize,
            },
        })
    }

    /// Open an MTD partition by the name it carries in `/proc/mtd`.
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        let listing = BufReader::new(File::open("/proc/mtd")?);
        for line in listing.lines() {
            let line = line?;

            // Entries look like `mtd3: 07e00000 00020000 "ubi"`.
            let (dev, description) = match line.split_once(':') {
                Some(parts) => parts,
                None => continue,
            };
            if description.trim_end().ends_with(&format!("\"{name}\"")) {
                return Self::open(Path::new("/dev").join(dev));
            }
        }

        bail!("no MTD partition named \"{name}\"");
    }

    /// Byte position of an eraseblock within the device, bounds-checked.
    fn peb_start(&self, peb: u32) -> anyhow::Result<u64> {
        let start = u64::from(peb) * u64::from(self.info.eb_size);
        ensure!(start < self.info.size, "eraseblock {peb} out of range");
        Ok(start)
    }
}

impl Flash for MtdFlash {
    fn info(&self) -> FlashInfo {
        self.info
    }

    fn is_bad(&mut self, peb: u32) -> anyhow::Result<bool> {
        let start = self.peb_start(peb)?;
        let flagged = unsafe { ioctl::block_is_bad(self.dev.as_raw_fd(), &start) }
            .with_context(|| format!("MEMGETBADBLOCK on PEB {peb}"))?;
        Ok(flagged != 0)
    }

    fn erase(&mut self, peb: u32) -> anyhow::Result<()> {
        let span = ioctl::EraseSpan {
            start: self.peb_start(peb)? as u32,
            length: self.info.eb_size,
        };
        unsafe { ioctl::erase_block(self.dev.as_raw_fd(), &span) }
            .with_context(|| format!("MEMERASE on PEB {peb}"))?;
        Ok(())
    }

    fn write_page(
        &mut self,
        peb: u32,
        offset: u32,
        data: Option<&[u8]>,
        oob: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        ensure!(
            offset % self.info.min_io_size == 0 && offset < self.info.eb_size,
            "offset {offset} is not a page boundary"
        );
        let start = self.peb_start(peb)? + u64::from(offset);

        if let Some(data) = data {
            ensure!(
                data.len() == self.info.min_io_size as usize,
                "data is not one page"
            );
            self.dev
                .write_all_at(data, start)
                .with_context(|| format!("programming PEB {peb} at offset {offset}"))?;
        }

        if let Some(oob) = oob {
            let mut request = ioctl::OobBuf {
                start: start as u32,
                length: oob.len() as u32,
                ptr: oob.as_ptr() as *mut u8,
            };
            unsafe { ioctl::write_oob(self.dev.as_raw_fd(), &mut request) }
                .with_context(|| format!("MEMWRITEOOB on PEB {peb}"))?;
        }

        Ok(())
    }

    fn mark_bad(&mut self, peb: u32) -> anyhow::Result<()> {
        let start = self.peb_start(peb)?;
        unsafe { ioctl::block_mark_bad(self.dev.as_raw_fd(), &start) }
            .with_context(|| format!("MEMSETBADBLOCK on PEB {peb}"))?;
        Ok(())
    }
}

mod ioctl {
    //! Bindings for the handful of MTD ioctls these tools need, mirroring the layouts in
    //! the kernel's uapi/mtd/mtd-abi.h.

    use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

    const MTD_IOCTL: u8 = b'M';

    /// `struct mtd_info_user`
    #[repr(C)]
    pub struct MtdInfo {
        pub kind: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(mtd_info, MTD_IOCTL, 1, MtdInfo);

    /// `struct erase_info_user`
    #[repr(C)]
    pub struct EraseSpan {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(erase_block, MTD_IOCTL, 2, EraseSpan);

    /// `struct mtd_oob_buf`
    #[repr(C)]
    pub struct OobBuf {
        pub start: u32,
        pub length: u32,
        pub ptr: *mut u8,
    }
    ioctl_readwrite!(write_oob, MTD_IOCTL, 3, OobBuf);

    ioctl_write_ptr!(block_is_bad, MTD_IOCTL, 11, u64);
    ioctl_write_ptr!(block_mark_bad, MTD_IOCTL, 12, u64);
}
