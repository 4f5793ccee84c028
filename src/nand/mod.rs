//! Access to NAND flash, real and simulated.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use anyhow::ensure;

#[cfg(target_os = "linux")]
pub mod mtd;

/// Is this byte range still in the erased, all-ones state?
pub fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0xFF)
}

/// Geometry of an MTD partition, as the driver reports it.
#[derive(Debug, Copy, Clone)]
pub struct FlashInfo {
    /// Total size of the partition, in bytes.
    pub size: u64,

    /// Size of one physical eraseblock, in bytes.
    pub eb_size: u32,

    /// Write granularity: the size of one page, in bytes.
    pub min_io_size: u32,
}

impl FlashInfo {
    /// Number of eraseblocks in the partition.
    pub fn peb_count(&self) -> u32 {
        (self.size / u64::from(self.eb_size)) as u32
    }

    /// Number of pages in one eraseblock.
    pub fn pages_per_peb(&self) -> u32 {
        self.eb_size / self.min_io_size
    }
}

/// The slice of MTD capability the writer relies on.
///
/// Everything is keyed by physical eraseblock index, and pages are addressed by their byte
/// offset within the eraseblock, the same way the MTD character device addresses them.
pub trait Flash {
    /// The partition geometry.
    fn info(&self) -> FlashInfo;

    /// Whether an eraseblock carries a bad-block mark.
    fn is_bad(&mut self, peb: u32) -> anyhow::Result<bool>;

    /// Erase one eraseblock, returning every byte of it to 0xFF.
    fn erase(&mut self, peb: u32) -> anyhow::Result<()>;

    /// Program one page.
    ///
    /// `data`, when present, must be exactly `min_io_size` bytes; when absent, the main area
    /// of the page is left untouched. `oob` bytes land in the page's out-of-band area.
    /// The pages of an eraseblock may only be programmed in ascending order.
    fn write_page(
        &mut self,
        peb: u32,
        offset: u32,
        data: Option<&[u8]>,
        oob: Option<&[u8]>,
    ) -> anyhow::Result<()>;

    /// Put a persistent bad-block mark on an eraseblock.
    fn mark_bad(&mut self, peb: u32) -> anyhow::Result<()>;
}

/// An in-memory stand-in for an MTD partition, used by the test suite.
#[derive(Debug, Clone)]
pub struct SimFlash {
    info: FlashInfo,
    pebs: Vec<SimPeb>,
}

#[derive(Debug, Clone)]
struct SimPeb {
    /// Main-area bytes; pages that were never programmed stay at 0xFF.
    bytes: Vec<u8>,

    /// First page that may still be programmed. NAND pages burn in ascending order, so a
    /// write to page N puts pages 0..=N off limits until the next erase.
    write_floor: u32,

    /// Out-of-band bytes, for the pages that carry any.
    oob: BTreeMap<u32, Vec<u8>>,

    /// Whether the eraseblock carries a bad-block mark.
    bad: bool,
}

impl SimFlash {
    pub fn new(info: FlashInfo) -> Self {
        let peb = SimPeb {
            bytes: vec![0xFF; info.eb_size as usize],
            write_floor: 0,
            oob: BTreeMap::new(),
            bad: false,
        };

        Self {
            info,
            pebs: vec![peb; info.peb_count() as usize],
        }
    }

    fn peb(&mut self, index: u32) -> anyhow::Result<&mut SimPeb> {
        let count = self.pebs.len();
        self.pebs.get_mut(index as usize).ok_or(anyhow::anyhow!(
            "eraseblock {index} out of range (partition has {count})"
        ))
    }

    /// The current main-area contents of one eraseblock.
    pub fn contents(&self, peb: u32) -> &[u8] {
        &self.pebs[peb as usize].bytes
    }

    /// The out-of-band bytes of one page, if any were ever programmed.
    pub fn oob(&self, peb: u32, page: u32) -> Option<&[u8]> {
        self.pebs[peb as usize].oob.get(&page).map(Vec::as_slice)
    }

    /// Overwrite the whole partition with content from `read`, as if every page had been
    /// programmed and every bad-block mark scrubbed.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let pages = self.info.pages_per_peb();
        for peb in &mut self.pebs {
            read.read_exact(&mut peb.bytes)?;
            peb.write_floor = pages;
            peb.oob.clear();
            peb.bad = false;
        }
        Ok(())
    }

    /// Dump the partition to `write`, one eraseblock at a time.
    ///
    /// Bad eraseblocks dump as zeroes, which no on-flash header survives.
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let zeroes = vec![0u8; self.info.eb_size as usize];
        for peb in &self.pebs {
            write.write_all(if peb.bad { &zeroes } else { &peb.bytes })?;
        }
        Ok(())
    }
}

impl Flash for SimFlash {
    fn info(&self) -> FlashInfo {
        self.info
    }

    fn is_bad(&mut self, peb: u32) -> anyhow::Result<bool> {
        Ok(self.peb(peb)?.bad)
    }

    fn erase(&mut self, peb: u32) -> anyhow::Result<()> {
        let slot = self.peb(peb)?;
        ensure!(!slot.bad, "eraseblock {peb} is marked bad");

        slot.bytes.fill(0xFF);
        slot.write_floor = 0;
        slot.oob.clear();
        Ok(())
    }

    fn write_page(
        &mut self,
        peb: u32,
        offset: u32,
        data: Option<&[u8]>,
        oob: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        let info = self.info;
        ensure!(
            offset % info.min_io_size == 0 && offset < info.eb_size,
            "offset {offset} is not a page boundary"
        );
        let page = offset / info.min_io_size;

        let slot = self.peb(peb)?;
        ensure!(!slot.bad, "eraseblock {peb} is marked bad");

        if let Some(data) = data {
            ensure!(data.len() == info.min_io_size as usize, "data is not one page");
            ensure!(
                page >= slot.write_floor,
                "page {page} of eraseblock {peb} was already burned"
            );
            slot.bytes[offset as usize..][..data.len()].copy_from_slice(data);
            slot.write_floor = page + 1;
        }

        if let Some(oob) = oob {
            slot.oob.insert(page, oob.to_vec());
        }

        Ok(())
    }

    fn mark_bad(&mut self, peb: u32) -> anyhow::Result<()> {
        self.peb(peb)?.bad = true;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TEST_INFO: FlashInfo = FlashInfo {
        size: 8 * 8192,
        eb_size: 8192,
        min_io_size: 256,
    };

    #[test]
    fn test_geometry() {
        assert_eq!(TEST_INFO.peb_count(), 8);
        assert_eq!(TEST_INFO.pages_per_peb(), 32);
    }

    #[test]
    fn test_program_and_erase() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_INFO);
        let page = vec![0x5A; 256];

        flash.write_page(0, 512, Some(&page[..]), None)?;
        assert!(is_blank(&flash.contents(0)[..512]));
        assert_eq!(flash.contents(0)[512..768], page[..]);
        assert!(is_blank(&flash.contents(0)[768..]));

        // Pages burn in ascending order only; an erase resets the floor.
        assert!(flash.write_page(0, 512, Some(&page[..]), None).is_err());
        assert!(flash.write_page(0, 256, Some(&page[..]), None).is_err());
        flash.write_page(0, 768, Some(&page[..]), None)?;

        flash.erase(0)?;
        assert!(is_blank(flash.contents(0)));
        flash.write_page(0, 0, Some(&page[..]), None)?;

        // Page-sized, page-aligned writes only.
        assert!(flash.write_page(0, 300, Some(&page[..]), None).is_err());
        assert!(flash.write_page(0, 512, Some(&page[..100]), None).is_err());
        Ok(())
    }

    #[test]
    fn test_oob_without_data() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_INFO);

        flash.write_page(2, 0, None, Some(&[1, 2, 3][..]))?;
        assert_eq!(flash.oob(2, 0), Some(&[1u8, 2, 3][..]));
        assert_eq!(flash.oob(2, 1), None);
        assert!(is_blank(flash.contents(2)));

        // An OOB-only write does not burn the main area of the page.
        flash.write_page(2, 0, Some(&vec![0u8; 256][..]), None)?;

        flash.erase(2)?;
        assert_eq!(flash.oob(2, 0), None);
        Ok(())
    }

    #[test]
    fn test_bad_block_marking() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_INFO);
        assert!(!flash.is_bad(5)?);

        flash.mark_bad(5)?;
        assert!(flash.is_bad(5)?);
        assert!(flash.erase(5).is_err());
        assert!(flash.write_page(5, 0, Some(&vec![0u8; 256][..]), None).is_err());

        assert!(flash.is_bad(TEST_INFO.peb_count()).is_err());
        Ok(())
    }

    #[test]
    fn test_load_save() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_INFO);
        flash.load(&mut std::io::repeat(0x3C))?;
        assert!(flash.contents(7).iter().all(|&b| b == 0x3C));

        flash.mark_bad(1)?;
        let mut dump = Vec::new();
        flash.save(&mut dump)?;

        let eb = TEST_INFO.eb_size as usize;
        assert_eq!(dump.len(), TEST_INFO.size as usize);
        assert!(dump[..eb].iter().all(|&b| b == 0x3C));
        assert!(dump[eb..2 * eb].iter().all(|&b| b == 0));
        assert!(dump[2 * eb..].iter().all(|&b| b == 0x3C));
        Ok(())
    }
}
