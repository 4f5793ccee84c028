//! The device-facing half of the writer: the erase pass and the write pass.

use super::gen::BlockGen;
use crate::nand::{is_blank, Flash};

use std::ops::Range;

use anyhow::{bail, ensure};
use log::{debug, info, warn};

/// The JFFS2 clean marker, as written into the OOB area of a freshly-erased block's first page.
pub const JFFS2_CLEANMARKER: [u8; 8] = [0x19, 0x85, 0x20, 0x03, 0x00, 0x00, 0x00, 0x08];

/// Erase every good PEB in `window`, skipping the ones marked bad.
///
/// Trouble with a single PEB (an unreadable bad-block state, a failing erase) is reported and
/// does not stop the pass; the write pass has its own handling for blocks that misbehave.
pub fn erase_range<F: Flash>(flash: &mut F, window: Range<u32>) {
    let rpt = howudoin::new()
        .label("Erasing blocks")
        .set_len(u64::from(window.end - window.start));

    for peb in window {
        match flash.is_bad(peb) {
            Err(e) => warn!("PEB {peb}: cannot read bad-block state: {e:#}"),
            Ok(true) => debug!("PEB {peb} is marked bad, skipping"),
            Ok(false) => {
                if let Err(e) = flash.erase(peb) {
                    warn!("PEB {peb}: erase failed: {e:#}");
                }
            }
        }
        rpt.inc();
    }

    rpt.close();
}

/// Stream the blocks of `gen` into the good PEBs of `window`, in order.
///
/// A PEB that fails to program is erased (best effort), marked bad when the block that was
/// being written filled it exactly, and the same logical block is then retried on the next
/// PEB of the window. Running out of window with payload undelivered is an error.
pub fn write_image<F: Flash>(
    flash: &mut F,
    gen: &mut BlockGen,
    window: Range<u32>,
    cleanmarker: bool,
) -> anyhow::Result<()> {
    let eb_size = flash.info().eb_size as usize;
    let mut buf = vec![0xFFu8; eb_size];

    let rpt = howudoin::new()
        .label("Writing blocks")
        .set_len(u64::from(window.end - window.start));

    let mut peb = window.start;
    while peb < window.end && gen.want_more(cleanmarker) {
        let block = gen.next_block(&mut buf)?;
        let mut placed = false;

        while peb < window.end {
            let this = peb;
            peb += 1;
            rpt.inc();

            if flash.is_bad(this)? {
                debug!("PEB {this} is marked bad, skipping");
                continue;
            }

            match program_peb(flash, this, &buf, block.data_len, cleanmarker) {
                Ok(()) => {
                    placed = true;
                    break;
                }
                Err(e) => {
                    warn!("PEB {this}: write failed: {e:#}");
                    if let Err(e) = flash.erase(this) {
                        debug!("PEB {this}: post-failure erase also failed: {e:#}");
                    }
                    if block.data_len % eb_size == 0 {
                        info!("marking PEB {this} bad");
                        if let Err(e) = flash.mark_bad(this) {
                            warn!("PEB {this}: could not mark bad: {e:#}");
                        }
                    }
                }
            }
        }

        if !placed && block.essential {
            rpt.close();
            bail!("data only partially written due to error");
        }
    }

    rpt.close();

    ensure!(
        gen.payload_done(),
        "data only partially written due to error"
    );
    Ok(())
}

/// Program one generated block into a PEB, page by page.
///
/// Pages that are entirely in the erased state are passed over without programming their
/// main area. The clean marker, when requested, rides the first page's OOB area whether or
/// not that page carries data.
fn program_peb<F: Flash>(
    flash: &mut F,
    peb: u32,
    buf: &[u8],
    data_len: usize,
    cleanmarker: bool,
) -> anyhow::Result<()> {
    let page_size = flash.info().min_io_size as usize;

    // Round up to whole pages; the buffer past `data_len` is erased filler.
    let mut write_len = data_len + page_size - 1;
    write_len -= write_len % page_size;

    let mut pages = write_len / page_size;
    if cleanmarker {
        // The marker goes out even on an otherwise-empty eraseblock.
        pages = pages.max(1);
    }

    for page_no in 0..pages {
        let offset = page_no * page_size;
        let content = &buf[offset..offset + page_size];

        let data = (offset < write_len && !is_blank(content)).then_some(content);
        let oob = (cleanmarker && page_no == 0).then_some(&JFFS2_CLEANMARKER[..]);
        if data.is_none() && oob.is_none() {
            continue;
        }

        flash.write_page(peb, offset as u32, data, oob)?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::nand::{FlashInfo, SimFlash};
    use crate::ubi::gen::VolumeSpec;
    use crate::ubi::headers::{
        Ec, Vid, VolTableRecord, UBI_LAYOUT_VOLUME_ID, UBI_VTBL_RECORD_SIZE,
    };
    use crate::util::Source;

    use std::io::Cursor;

    const TEST_INFO: FlashInfo = FlashInfo {
        size: 16 * 32768,
        eb_size: 32768,
        min_io_size: 512,
    };

    fn bounded_source(bytes: Vec<u8>) -> Source {
        let budget = bytes.len() as u64;
        Source::new(Box::new(Cursor::new(bytes)), Some(budget))
    }

    /// A payload where no page is ever all-0xFF and every byte is position-dependent.
    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_erase_only() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_INFO);
        flash.load(&mut std::io::repeat(0xA5))?;

        erase_range(&mut flash, 0..TEST_INFO.peb_count());

        for peb in 0..TEST_INFO.peb_count() {
            assert!(is_blank(flash.contents(peb)));
        }
        Ok(())
    }

    #[test]
    fn test_erase_skips_bad() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_INFO);
        flash.mark_bad(3)?;

        erase_range(&mut flash, 0..TEST_INFO.peb_count());
        assert!(flash.is_bad(3)?);
        Ok(())
    }

    #[test]
    fn test_raw_write() -> anyhow::Result<()> {
        let eb_size = TEST_INFO.eb_size as usize;
        let mut flash = SimFlash::new(TEST_INFO);

        // Two full eraseblocks and then some.
        let payload_len = 2 * eb_size + 1000;
        let mut gen = BlockGen::raw(TEST_INFO, Some(bounded_source(vec![0xAA; payload_len])));

        erase_range(&mut flash, 0..TEST_INFO.peb_count());
        write_image(&mut flash, &mut gen, 0..TEST_INFO.peb_count(), false)?;

        assert!(flash.contents(0).iter().all(|&x| x == 0xAA));
        assert!(flash.contents(1).iter().all(|&x| x == 0xAA));

        let tail = flash.contents(2);
        assert!(tail[..1000].iter().all(|&x| x == 0xAA));
        assert!(is_blank(&tail[1000..]));

        for peb in 3..TEST_INFO.peb_count() {
            assert!(is_blank(flash.contents(peb)));
        }
        Ok(())
    }

    #[test]
    fn test_ubi_write() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_INFO);

        let spec = VolumeSpec {
            vol_id: 0,
            name: Some("rootfs".to_string()),
            lebs: 4,
        };
        let mut gen = BlockGen::ubi(
            TEST_INFO,
            spec,
            Some(bounded_source(vec![0xAA; 2 * (TEST_INFO.eb_size as usize - 1024)])),
        )?;
        let data_offset = gen.data_offset();

        erase_range(&mut flash, 0..TEST_INFO.peb_count());
        write_image(&mut flash, &mut gen, 0..TEST_INFO.peb_count(), false)?;

        let mut image_seq = None;
        for peb in 0..TEST_INFO.peb_count() {
            let buf = flash.contents(peb);

            let ec = Ec::decode(buf)?;
            assert_ne!(ec.image_seq, 0);
            assert_eq!(*image_seq.get_or_insert(ec.image_seq), ec.image_seq);

            let vid = Vid::decode(&buf[ec.vid_hdr_offset as usize..])?;
            match peb {
                0 | 1 => {
                    let vid = vid.unwrap();
                    assert_eq!(vid.vol_id, UBI_LAYOUT_VOLUME_ID);
                    assert_eq!(vid.lnum, peb);

                    let record =
                        VolTableRecord::decode(&buf[data_offset..][..UBI_VTBL_RECORD_SIZE])?
                            .unwrap();
                    assert_eq!(record.name, "rootfs");
                    assert_eq!(record.reserved_pebs, 4);
                }
                2 | 3 => {
                    let vid = vid.unwrap();
                    assert_eq!(vid.vol_id, 0);
                    assert_eq!(vid.lnum, peb - 2);
                    assert!(buf[data_offset..].iter().all(|&x| x == 0xAA));
                }
                4 | 5 => {
                    // Reserved but empty volume LEBs.
                    let vid = vid.unwrap();
                    assert_eq!(vid.lnum, peb - 2);
                    assert!(is_blank(&buf[data_offset..]));
                }
                _ => {
                    assert_eq!(vid, None);
                    assert!(is_blank(&buf[ec.vid_hdr_offset as usize..]));
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_bad_block_advances_without_losing_data() -> anyhow::Result<()> {
        let eb_size = TEST_INFO.eb_size as usize;
        let mut flash = SimFlash::new(TEST_INFO);
        flash.mark_bad(5)?;

        // Exactly fills the 15 good blocks of the window.
        let payload = patterned(15 * eb_size);
        let mut gen = BlockGen::raw(TEST_INFO, Some(bounded_source(payload.clone())));

        erase_range(&mut flash, 0..TEST_INFO.peb_count());
        write_image(&mut flash, &mut gen, 0..TEST_INFO.peb_count(), false)?;

        let mut readback = Vec::new();
        for peb in (0..TEST_INFO.peb_count()).filter(|&x| x != 5) {
            readback.extend_from_slice(flash.contents(peb));
        }
        assert_eq!(readback, payload);
        Ok(())
    }

    #[test]
    fn test_write_failure_marks_bad_and_retries() -> anyhow::Result<()> {
        let eb_size = TEST_INFO.eb_size as usize;
        let mut flash = SimFlash::new(TEST_INFO);
        erase_range(&mut flash, 0..TEST_INFO.peb_count());

        // Sabotage PEB 1: its first page is already burned, so the write pass's attempt to
        // program it will fail and trigger the retry path.
        let junk = vec![0x00u8; TEST_INFO.min_io_size as usize];
        flash.write_page(1, 0, Some(&junk[..]), None)?;

        let payload = patterned(3 * eb_size);
        let mut gen = BlockGen::raw(TEST_INFO, Some(bounded_source(payload.clone())));
        write_image(&mut flash, &mut gen, 0..TEST_INFO.peb_count(), false)?;

        // The failed block was fully populated, so it gets marked bad; the same logical
        // content lands on the next PEB instead.
        assert!(flash.is_bad(1)?);

        let mut readback = Vec::new();
        for peb in [0, 2, 3] {
            readback.extend_from_slice(flash.contents(peb));
        }
        assert_eq!(readback, payload);
        Ok(())
    }

    #[test]
    fn test_ubi_payload_exactly_fills_volume() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_INFO);

        let spec = VolumeSpec {
            vol_id: 0,
            name: Some("full".to_string()),
            lebs: 2,
        };
        let leb_size = TEST_INFO.eb_size as usize - 1024;
        let payload = patterned(2 * leb_size);
        let mut gen = BlockGen::ubi(TEST_INFO, spec, Some(bounded_source(payload.clone())))?;
        let data_offset = gen.data_offset();

        erase_range(&mut flash, 0..TEST_INFO.peb_count());
        write_image(&mut flash, &mut gen, 0..TEST_INFO.peb_count(), false)?;

        let mut readback = Vec::new();
        readback.extend_from_slice(&flash.contents(2)[data_offset..]);
        readback.extend_from_slice(&flash.contents(3)[data_offset..]);
        assert_eq!(readback, payload);

        // Nothing spills past the volume: the next PEB is EC-only.
        let tail = flash.contents(4);
        assert_eq!(Vid::decode(&tail[data_offset / 2..])?, None);
        Ok(())
    }

    #[test]
    fn test_partial_write_is_an_error() -> anyhow::Result<()> {
        let eb_size = TEST_INFO.eb_size as usize;
        let mut flash = SimFlash::new(TEST_INFO);

        let mut gen = BlockGen::raw(TEST_INFO, Some(bounded_source(vec![0x77; 3 * eb_size])));

        erase_range(&mut flash, 0..2);
        let result = write_image(&mut flash, &mut gen, 0..2, false);
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("partially written"), "{message}");
        Ok(())
    }

    #[test]
    fn test_cleanmarker_sweep() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_INFO);

        // No payload at all: the write pass only stamps clean markers.
        let mut gen = BlockGen::raw(TEST_INFO, None);
        erase_range(&mut flash, 0..TEST_INFO.peb_count());
        write_image(&mut flash, &mut gen, 0..TEST_INFO.peb_count(), true)?;

        for peb in 0..TEST_INFO.peb_count() {
            assert!(is_blank(flash.contents(peb)));
            assert_eq!(flash.oob(peb, 0), Some(&JFFS2_CLEANMARKER[..]));
            assert_eq!(flash.oob(peb, 1), None);
        }
        Ok(())
    }

    #[test]
    fn test_skip_ff_leaves_pages_erased() -> anyhow::Result<()> {
        let eb_size = TEST_INFO.eb_size as usize;
        let mut flash = SimFlash::new(TEST_INFO);

        // Middle eraseblock of the payload is all-0xFF; its PEB must read back erased.
        let mut payload = patterned(eb_size);
        payload.extend(vec![0xFF; eb_size]);
        payload.extend(patterned(eb_size));

        let mut gen = BlockGen::raw(TEST_INFO, Some(bounded_source(payload.clone())));
        erase_range(&mut flash, 0..TEST_INFO.peb_count());
        write_image(&mut flash, &mut gen, 0..TEST_INFO.peb_count(), false)?;

        assert_eq!(flash.contents(0), &payload[..eb_size]);
        assert!(is_blank(flash.contents(1)));
        assert_eq!(flash.contents(2), &payload[2 * eb_size..]);
        Ok(())
    }

    #[test]
    fn test_window_offset() -> anyhow::Result<()> {
        let eb_size = TEST_INFO.eb_size as usize;
        let mut flash = SimFlash::new(TEST_INFO);

        let payload = patterned(eb_size);
        let mut gen = BlockGen::raw(TEST_INFO, Some(bounded_source(payload.clone())));

        erase_range(&mut flash, 4..8);
        write_image(&mut flash, &mut gen, 4..8, false)?;

        assert!(is_blank(flash.contents(3)));
        assert_eq!(flash.contents(4), &payload[..]);
        assert!(is_blank(flash.contents(5)));
        Ok(())
    }
}
