//! Volume extraction from UBI image files.
//!
//! The image is walked twice: once to find the layout volume and resolve the requested volume
//! against its table, and once to copy every matching LEB into the output file at the offset
//! its logical number dictates (physical order in the image is not logical order).

use super::headers::{
    Ec, Vid, VolTableRecord, UBI_LAYOUT_VOLUME_ID, UBI_MAX_VOLUMES, UBI_VID_HDR_SIZE,
    UBI_VOL_NAME_MAX, UBI_VTBL_RECORD_SIZE,
};

use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::{bail, ensure, Context};
use log::{debug, info};

/// Which volume to pull out of the image.
#[derive(Debug, Clone)]
pub enum VolumeRef {
    /// A slot in the 128-record volume table.
    Index(u32),

    /// An exact volume name.
    Name(String),
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Size of one PEB in the image, in bytes.
    pub peb_size: u32,

    pub volume: VolumeRef,

    /// Skip PEBs whose headers fail validation, rather than aborting.
    pub skip_bad: bool,
}

/// Reconstruct one volume's data from a UBI image, writing it into `out`.
///
/// LEBs the image carries no data for are left as holes in the output.
pub fn extract_volume<F, W>(image: &mut F, out: &mut W, opts: &ExtractOptions) -> anyhow::Result<()>
where
    F: Read + Seek,
    W: Write + Seek,
{
    ensure!(opts.peb_size > 0, "PEB size must be nonzero");
    let peb_size = opts.peb_size as usize;

    let image_size = image.seek(SeekFrom::End(0))?;
    ensure!(
        image_size > 0 && image_size % u64::from(opts.peb_size) == 0,
        "image size of {image_size} bytes is not a positive multiple of the PEB size"
    );
    let peb_count = (image_size / u64::from(opts.peb_size)) as u32;

    let mut buf = vec![0u8; peb_size];

    let (vol_index, vol_name) = resolve_volume(image, &mut buf, peb_count, opts)?;
    info!("extracting volume {vol_index} ({vol_name})");

    let rpt = howudoin::new()
        .label("Extracting blocks")
        .set_len(u64::from(peb_count));

    // `data_offset` is uniform across an image, so the LEB size comes from the first PEB of
    // the volume we encounter.
    let mut leb_size = None;

    for peb in 0..peb_count {
        rpt.inc();
        read_peb(image, &mut buf, peb)?;

        let (ec, vid) = match parse_peb(&buf) {
            Ok(x) => x,
            Err(e) if opts.skip_bad => {
                debug!("PEB {peb}: {e:#}, skipping");
                continue;
            }
            Err(e) => return Err(e).with_context(|| format!("PEB {peb}")),
        };

        let vid = match vid {
            Some(vid) if vid.vol_id == vol_index => vid,
            _ => continue, // empty, or some other volume's
        };

        let data_offset = ec.data_offset as usize;
        let leb_size = *leb_size.get_or_insert(peb_size - data_offset);

        out.seek(SeekFrom::Start(u64::from(vid.lnum) * leb_size as u64))?;
        out.write_all(&buf[data_offset..])
            .with_context(|| format!("writing LEB {}", vid.lnum))?;
    }

    rpt.close();
    Ok(())
}

/// Walk the image until the layout volume turns up, then resolve the requested volume against
/// the table it carries. Returns the volume's table index and name.
fn resolve_volume<F: Read + Seek>(
    image: &mut F,
    buf: &mut [u8],
    peb_count: u32,
    opts: &ExtractOptions,
) -> anyhow::Result<(u32, String)> {
    for peb in 0..peb_count {
        read_peb(image, buf, peb)?;

        let (ec, vid) = match parse_peb(buf) {
            Ok(x) => x,
            Err(e) if opts.skip_bad => {
                debug!("PEB {peb}: {e:#}, skipping");
                continue;
            }
            Err(e) => return Err(e).with_context(|| format!("PEB {peb}")),
        };

        match vid {
            Some(vid) if vid.vol_id == UBI_LAYOUT_VOLUME_ID => (),
            _ => continue,
        }

        let data_offset = ec.data_offset as usize;
        let table = buf
            .get(data_offset..data_offset + UBI_MAX_VOLUMES * UBI_VTBL_RECORD_SIZE)
            .ok_or(anyhow::anyhow!(
                "PEB {peb}: volume table does not fit in the PEB"
            ))?;

        return lookup(table, &opts.volume);
    }

    bail!("no layout volume found in image");
}

/// Search the volume table for the requested volume.
fn lookup(table: &[u8], volume: &VolumeRef) -> anyhow::Result<(u32, String)> {
    let mut records = table.chunks_exact(UBI_VTBL_RECORD_SIZE);

    match volume {
        VolumeRef::Name(name) => {
            ensure!(
                name.len() <= UBI_VOL_NAME_MAX,
                "volume name longer than {UBI_VOL_NAME_MAX} bytes"
            );

            for (slot, bytes) in records.enumerate() {
                // A record that fails its CRC cannot be the one being asked for.
                if let Ok(Some(record)) = VolTableRecord::decode(bytes) {
                    if record.name == *name {
                        return Ok((slot as u32, record.name));
                    }
                }
            }
            bail!("volume \"{name}\" not found in volume table");
        }

        VolumeRef::Index(index) => {
            let bytes = records
                .nth(*index as usize)
                .ok_or(anyhow::anyhow!("volume index {index} out of range"))?;
            let record = VolTableRecord::decode(bytes)
                .with_context(|| format!("volume table record {index}"))?
                .ok_or(anyhow::anyhow!(
                    "volume {index} is not present in the volume table"
                ))?;
            Ok((*index, record.name))
        }
    }
}

/// Validate one PEB's headers and sanity-check the offsets the EC header advertises.
fn parse_peb(buf: &[u8]) -> anyhow::Result<(Ec, Option<Vid>)> {
    let ec = Ec::decode(buf).context("EC header")?;

    let vid_hdr_offset = ec.vid_hdr_offset as usize;
    let data_offset = ec.data_offset as usize;
    ensure!(
        vid_hdr_offset + UBI_VID_HDR_SIZE <= data_offset && data_offset < buf.len(),
        "EC header advertises impossible offsets (VID at {vid_hdr_offset}, data at {data_offset})"
    );

    let vid = Vid::decode(&buf[vid_hdr_offset..]).context("VID header")?;
    Ok((ec, vid))
}

fn read_peb<F: Read + Seek>(image: &mut F, buf: &mut [u8], peb: u32) -> anyhow::Result<()> {
    image.seek(SeekFrom::Start(u64::from(peb) * buf.len() as u64))?;
    image
        .read_exact(buf)
        .with_context(|| format!("reading PEB {peb}"))?;
    Ok(())
}
