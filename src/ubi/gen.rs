//! Logical-block generation for the writer.
//!
//! This turns a payload stream into the sequence of eraseblock-sized buffers that the write
//! pass delivers to flash: either the payload chopped up verbatim (raw mode), or the payload
//! wrapped in UBI metadata (EC headers on every block, the layout volume with its 128-record
//! table on the first two, VID headers on the volume's LEBs).

use super::headers::{
    Ec, Vid, VolTableRecord, VolType, UBI_EC_HDR_SIZE, UBI_LAYOUT_VOLUME_COMPAT,
    UBI_LAYOUT_VOLUME_EBS, UBI_LAYOUT_VOLUME_ID, UBI_MAX_VOLUMES, UBI_VID_HDR_SIZE,
    UBI_VOL_NAME_MAX, UBI_VTBL_RECORD_SIZE,
};
use crate::nand::FlashInfo;
use crate::util::Source;

use anyhow::ensure;
use rand::Rng;

/// The volume being created in UBI mode.
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    /// Volume ID, and the table slot the volume's record lands in.
    pub vol_id: u32,

    /// Name to publish in the volume table; `None` leaves every table slot unused.
    pub name: Option<String>,

    /// Size of the volume, in LEBs.
    pub lebs: u32,
}

#[derive(Debug)]
enum Mode {
    Raw,
    Ubi(VolumeSpec),
}

/// One generated block.
#[derive(Debug, Copy, Clone)]
pub struct GenBlock {
    /// How many leading bytes of the buffer are meaningful; the rest is erased filler.
    pub data_len: usize,

    /// Whether this block carries content that must not be dropped: payload bytes, or a copy
    /// of the volume table. Blocks that are headers-only may be sacrificed if the device runs
    /// out of good eraseblocks.
    pub essential: bool,
}

/// Generates the logical blocks of an image, one eraseblock-sized buffer at a time.
///
/// The generator owns all cross-block state: the logical block counter advances exactly once
/// per generated block (so a block that has to be rewritten elsewhere keeps its identity), and
/// UBI images get a single image sequence number chosen up front.
pub struct BlockGen {
    eb_size: usize,
    min_io_size: usize,
    mode: Mode,
    source: Option<Source>,
    blk_no: u32,
    image_seq: u32,
}

impl BlockGen {
    /// A generator that passes the payload through unmodified.
    pub fn raw(info: FlashInfo, source: Option<Source>) -> Self {
        Self {
            eb_size: info.eb_size as usize,
            min_io_size: info.min_io_size as usize,
            mode: Mode::Raw,
            source,
            blk_no: 0,
            image_seq: 0,
        }
    }

    /// A generator that wraps the payload in UBI metadata, creating the volume `spec`.
    pub fn ubi(info: FlashInfo, spec: VolumeSpec, source: Option<Source>) -> anyhow::Result<Self> {
        let eb_size = info.eb_size as usize;
        let min_io_size = info.min_io_size as usize;
        let vid_hdr_offset = min_io_size;
        let data_offset = 2 * min_io_size;

        ensure!(
            vid_hdr_offset >= UBI_EC_HDR_SIZE
                && data_offset >= vid_hdr_offset + UBI_VID_HDR_SIZE
                && data_offset < eb_size,
            "page size of {min_io_size} cannot host UBI headers in a {eb_size}-byte eraseblock"
        );
        ensure!(
            data_offset + UBI_MAX_VOLUMES * UBI_VTBL_RECORD_SIZE <= eb_size,
            "eraseblock of {eb_size} bytes too small for the {UBI_MAX_VOLUMES}-record volume table"
        );
        ensure!(
            spec.vol_id < UBI_MAX_VOLUMES as u32,
            "volume ID {} out of range (max {})",
            spec.vol_id,
            UBI_MAX_VOLUMES - 1
        );
        if let Some(name) = &spec.name {
            ensure!(
                !name.is_empty() && name.len() <= UBI_VOL_NAME_MAX,
                "volume name must be between 1 and {UBI_VOL_NAME_MAX} bytes"
            );
        }

        // Every block of one image is stamped with the same nonzero tag, so that a mix of
        // blocks surviving from an older image can be detected.
        let image_seq = rand::thread_rng().gen_range(1..=u32::MAX);

        Ok(Self {
            eb_size,
            min_io_size,
            mode: Mode::Ubi(spec),
            source,
            blk_no: 0,
            image_seq,
        })
    }

    /// Offset of the data area within each eraseblock.
    pub fn data_offset(&self) -> usize {
        2 * self.min_io_size
    }

    /// Bytes of payload one LEB holds.
    pub fn leb_size(&self) -> usize {
        self.eb_size - self.data_offset()
    }

    /// Total payload size, when known up front.
    pub fn payload_total(&self) -> Option<u64> {
        self.source.as_ref().and_then(Source::total)
    }

    /// Whether every payload byte has been handed out.
    pub fn payload_done(&self) -> bool {
        self.source.as_ref().map_or(true, Source::exhausted)
    }

    /// Whether the write pass should keep asking for blocks: there is payload left, or the
    /// whole window is owed metadata or clean markers.
    pub fn want_more(&self, cleanmarker: bool) -> bool {
        match self.mode {
            Mode::Ubi(_) => true,
            Mode::Raw => {
                cleanmarker || self.source.as_ref().map_or(false, |s| !s.exhausted())
            }
        }
    }

    /// Generate the next logical block into `buf`, which must be one eraseblock long.
    ///
    /// The buffer beyond the returned `data_len` is left in the erased (all-0xFF) state.
    pub fn next_block(&mut self, buf: &mut [u8]) -> anyhow::Result<GenBlock> {
        assert_eq!(buf.len(), self.eb_size);
        buf.fill(0xFF);

        let blk_no = self.blk_no;
        self.blk_no += 1;

        match self.mode {
            Mode::Raw => {
                let data_len = Self::read_payload(&mut self.source, buf)?;
                Ok(GenBlock {
                    data_len,
                    essential: data_len > 0,
                })
            }

            Mode::Ubi(ref spec) => {
                let vid_hdr_offset = self.min_io_size;
                let data_offset = 2 * self.min_io_size;

                let ec = Ec {
                    ec: 0,
                    vid_hdr_offset: vid_hdr_offset as u32,
                    data_offset: data_offset as u32,
                    image_seq: self.image_seq,
                };
                ec.encode(&mut buf[..UBI_EC_HDR_SIZE])?;

                if blk_no < UBI_LAYOUT_VOLUME_EBS {
                    // One of the two redundant layout-volume LEBs: VID header plus the table.
                    let vid = Vid {
                        vol_type: VolType::Dynamic,
                        compat: UBI_LAYOUT_VOLUME_COMPAT,
                        vol_id: UBI_LAYOUT_VOLUME_ID,
                        lnum: blk_no,
                        ..Default::default()
                    };
                    vid.encode(&mut buf[vid_hdr_offset..][..UBI_VID_HDR_SIZE])?;

                    let table_len = UBI_MAX_VOLUMES * UBI_VTBL_RECORD_SIZE;
                    Self::fill_vtbl(spec, &mut buf[data_offset..][..table_len]);

                    Ok(GenBlock {
                        data_len: data_offset + table_len,
                        essential: true,
                    })
                } else if blk_no - UBI_LAYOUT_VOLUME_EBS < spec.lebs
                    && !self.source.as_ref().map_or(false, Source::hit_eof)
                {
                    // A LEB of the volume proper.
                    let vid = Vid {
                        vol_type: VolType::Dynamic,
                        vol_id: spec.vol_id,
                        lnum: blk_no - UBI_LAYOUT_VOLUME_EBS,
                        ..Default::default()
                    };
                    vid.encode(&mut buf[vid_hdr_offset..][..UBI_VID_HDR_SIZE])?;

                    let read = Self::read_payload(&mut self.source, &mut buf[data_offset..])?;

                    Ok(GenBlock {
                        data_len: data_offset + read,
                        essential: read > 0,
                    })
                } else {
                    // Past the volume (or past an until-EOF payload): the EC header alone.
                    Ok(GenBlock {
                        data_len: UBI_EC_HDR_SIZE,
                        essential: false,
                    })
                }
            }
        }
    }

    fn read_payload(source: &mut Option<Source>, buf: &mut [u8]) -> anyhow::Result<usize> {
        match source {
            Some(source) => source.fill(buf),
            None => Ok(0),
        }
    }

    fn fill_vtbl(spec: &VolumeSpec, table: &mut [u8]) {
        for (slot, out) in table.chunks_exact_mut(UBI_VTBL_RECORD_SIZE).enumerate() {
            let bytes = match &spec.name {
                Some(name) if slot as u32 == spec.vol_id => VolTableRecord {
                    reserved_pebs: spec.lebs,
                    alignment: 1,
                    data_pad: 0,
                    vol_type: VolType::Dynamic,
                    upd_marker: false,
                    name: name.clone(),
                    flags: 0,
                }
                .into_bytes(),
                _ => VolTableRecord::empty_bytes(),
            };
            out.copy_from_slice(&bytes);
        }
    }
}
