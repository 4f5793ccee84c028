//! This module contains the code necessary to read, write, and manipulate EC/VID headers and
//! volume-table records, with CRC verification/computation.

use crc::{Crc, CRC_32_JAMCRC};
pub use deku::{DekuContainerRead, DekuContainerWrite};
use income::{EcHdr, VidHdr, VtblRecord, UBI_EC_HDR_MAGIC, UBI_VID_HDR_MAGIC};
use thiserror::Error;

/// CRC-32 exactly as UBI computes it: seeded with all-ones, reflected, no final xor.
pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);
const UBI_VERSION: u8 = 1;

/// On-flash size of an EC header.
pub const UBI_EC_HDR_SIZE: usize = 64;
/// On-flash size of a VID header.
pub const UBI_VID_HDR_SIZE: usize = 64;
/// On-flash size of one volume-table record.
pub const UBI_VTBL_RECORD_SIZE: usize = 0xAC;
/// Number of records in a volume table (and thus the highest usable volume ID + 1).
pub const UBI_MAX_VOLUMES: usize = 128;
/// Longest permitted volume name, in bytes.
pub const UBI_VOL_NAME_MAX: usize = 127;

/// The volume ID of the internal "layout volume", whose LEBs carry the volume table.
pub const UBI_LAYOUT_VOLUME_ID: u32 = 0x7FFFEFFF;
/// How many LEBs the layout volume occupies (two redundant table copies).
pub const UBI_LAYOUT_VOLUME_EBS: u32 = 2;
/// `compat` value of the layout volume ("reject": implementations that don't know it must not
/// attach the image).
pub const UBI_LAYOUT_VOLUME_COMPAT: u8 = 5;

/// The ways a header or volume-table record can fail to decode.
#[derive(Debug, Error, Eq, PartialEq, Copy, Clone)]
pub enum HeaderError {
    /// The buffer is too short to hold the structure.
    #[error("buffer too short")]
    Truncated,

    /// The magic bytes or version are not ones this codec speaks.
    #[error("bad magic")]
    BadMagic,

    /// The stored CRC does not match the CRC of the stored bytes.
    #[error("bad CRC")]
    BadCrc,

    /// The volume type field holds an undefined value.
    #[error("unsupported volume type {0}")]
    BadVolType(u8),

    /// The volume name is not valid UTF-8 or is overlong.
    #[error("bad volume name")]
    BadName,
}

/// Parsing UBI headers from byteslices, with magic and CRC verification.
pub trait ParseHeader<'a>: Sized + DekuContainerRead<'a> + ComputeCrc {
    fn get_magic() -> &'static [u8];
    fn get_hdr_magic(&self) -> &[u8];
    fn get_hdr_version(&self) -> u8;

    fn parse(buf: &'a [u8]) -> Result<Self, HeaderError> {
        let (_, header) = Self::from_bytes((buf, 0)).map_err(|_| HeaderError::Truncated)?;

        if (header.get_hdr_magic(), header.get_hdr_version()) != (Self::get_magic(), UBI_VERSION) {
            return Err(HeaderError::BadMagic);
        }

        if !header.check_crc() {
            return Err(HeaderError::BadCrc);
        }

        Ok(header)
    }
}

impl ParseHeader<'_> for EcHdr {
    fn get_magic() -> &'static [u8] {
        UBI_EC_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
}

impl ParseHeader<'_> for VidHdr {
    fn get_magic() -> &'static [u8] {
        UBI_VID_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
}

/// Computing the CRC that a header or record should carry.
///
/// The CRC field is always the trailing 4 bytes, and the covered range is everything before it.
pub trait ComputeCrc: DekuContainerWrite {
    fn compute_crc(&self) -> u32 {
        let header_bytes = self.to_bytes().unwrap();
        let header_len = header_bytes.len() - std::mem::size_of::<u32>();
        UBI_CRC.checksum(&header_bytes[..header_len])
    }

    fn check_crc(&self) -> bool {
        self.get_crc() == self.compute_crc()
    }

    fn fix_crc(&mut self) {
        self.set_crc(self.compute_crc())
    }

    fn get_crc(&self) -> u32;
    fn set_crc(&mut self, crc: u32);
}

impl ComputeCrc for EcHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl ComputeCrc for VidHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl ComputeCrc for VtblRecord {
    fn get_crc(&self) -> u32 {
        self.crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.crc = crc;
    }
}

/// The fields of an EC header that matter to these tools.
///
/// This is meant to be more ergonomic to work with than `EcHdr`, which represents the raw data.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
}

impl Ec {
    /// Convert from a byte slice
    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        EcHdr::parse(bytes).map(Into::into)
    }

    /// Write into a byte slice
    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let bytes = EcHdr::from(self).to_bytes()?;
        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or(anyhow::anyhow!("out_bytes too small"))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }
}

impl From<EcHdr> for Ec {
    fn from(value: EcHdr) -> Self {
        let EcHdr {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            ..
        } = value;

        Self {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        }
    }
}

impl From<Ec> for EcHdr {
    fn from(value: Ec) -> EcHdr {
        let Ec {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        } = value;

        let mut target = Self {
            magic: UBI_EC_HDR_MAGIC.try_into().unwrap(),
            version: UBI_VERSION,

            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
        };

        target.fix_crc();
        target
    }
}

/// These represent UBI volume types
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// A volume that may be read and written in random order
    #[default]
    Dynamic,

    /// A volume that is read-only after it is initially written, except for whole-volume updates
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = HeaderError;

    fn try_from(value: u8) -> Result<Self, HeaderError> {
        match value {
            1 => Ok(Self::Dynamic),
            2 => Ok(Self::Static),
            other => Err(HeaderError::BadVolType(other)),
        }
    }
}

/// The fields of a VID header that matter to these tools.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    /// The type of volume.
    pub vol_type: VolType,

    /// Whether this PEB was written as a copy of another, for wear-leveling purposes.
    pub copy_flag: bool,

    /// For internal volumes, flags indicating how UBI should handle the volume.
    pub compat: u8,

    /// The ID of the volume, and entry in the volume table.
    pub vol_id: u32,

    /// The offset of the LEB within this volume.
    pub lnum: u32,

    /// For `Static` volumes and copied LEBs, the number of bytes written at the same time as the
    /// VID header, which are thus included in `data_crc`; otherwise 0.
    pub data_size: u32,

    /// The number of LEBs used by this volume, or 0 if this volume is `Dynamic`
    pub used_ebs: u32,

    /// The number of bytes unused at the end of the PEB, to cut the LEB down to a multiple of the
    /// requested volume alignment size.
    pub data_pad: u32,

    /// The CRC of the first `data_size` bytes of the LEB, or 0 when unused.
    pub data_crc: u32,

    /// A unique counter greater than any other VID header written, for resolving `vol_id:lnum`
    /// collisions.
    pub sqnum: u64,
}

impl Vid {
    /// Convert from a byte slice.
    ///
    /// `Ok(None)` means the magic bytes read back in the erased (all-ones) state: the PEB was
    /// never written past its EC header.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, HeaderError> {
        let magic = bytes
            .get(..UBI_VID_HDR_MAGIC.len())
            .ok_or(HeaderError::Truncated)?;
        if magic.iter().all(|&x| x == 0xFF) {
            return Ok(None);
        }

        VidHdr::parse(bytes)?.try_into().map(Some)
    }

    /// Write into a byte slice
    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let bytes = VidHdr::from(self).to_bytes()?;
        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or(anyhow::anyhow!("out_bytes too small"))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }
}

impl TryFrom<VidHdr> for Vid {
    type Error = HeaderError;

    fn try_from(value: VidHdr) -> Result<Self, HeaderError> {
        let VidHdr {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            ..
        } = value;

        let vol_type = vol_type.try_into()?;
        let copy_flag = copy_flag != 0;

        Ok(Self {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        })
    }
}

impl From<Vid> for VidHdr {
    fn from(value: Vid) -> VidHdr {
        let Vid {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        } = value;

        let vol_type = vol_type.into();
        let copy_flag = copy_flag.into();

        let mut target = Self {
            magic: UBI_VID_HDR_MAGIC.try_into().unwrap(),
            version: UBI_VERSION,

            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
            padding3: Default::default(),
        };

        target.fix_crc();
        target
    }
}

/// The fields of a volume-table record that matter to these tools.
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct VolTableRecord {
    /// The total number of PEBs allocated to this volume.
    pub reserved_pebs: u32,

    /// All LEBs in this volume will be a multiple of this size.
    pub alignment: u32,

    /// The number of bytes reserved from the end of each PEB to ensure alignment.
    pub data_pad: u32,

    /// The type of volume.
    pub vol_type: VolType,

    /// Set to `true` during a whole-volume update, so that if interrupted, it's possible to detect
    /// that the volume is corrupt.
    pub upd_marker: bool,

    /// The name of the volume. This code supports any UTF-8 string, but as other UBI implementors
    /// might assume only ASCII, it's best to stick to that.
    pub name: String,

    /// Any flags set on this volume.
    pub flags: u8,
}

impl VolTableRecord {
    /// Convert from a byte slice.
    ///
    /// `Ok(None)` means the record is an unused slot: all-zero fields under a valid CRC.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, HeaderError> {
        let (_, record) =
            VtblRecord::from_bytes((bytes, 0)).map_err(|_| HeaderError::Truncated)?;
        if !record.check_crc() {
            return Err(HeaderError::BadCrc);
        }
        if record.vol_type == 0 && record.name_len == 0 {
            return Ok(None);
        }
        record.try_into().map(Some)
    }

    /// Write into a Vec<u8>
    pub fn into_bytes(self) -> Vec<u8> {
        VtblRecord::from(self).to_bytes().unwrap()
    }

    /// The encoding of an unused slot in the volume table
    pub fn empty_bytes() -> Vec<u8> {
        let mut record = VtblRecord {
            reserved_pebs: Default::default(),
            alignment: Default::default(),
            data_pad: Default::default(),
            vol_type: Default::default(),
            upd_marker: Default::default(),
            name: std::array::from_fn(|_| 0u8),
            name_len: Default::default(),
            flags: Default::default(),
            crc: Default::default(),
            padding: Default::default(),
        };
        record.fix_crc();
        record.to_bytes().unwrap()
    }
}

impl TryFrom<VtblRecord> for VolTableRecord {
    type Error = HeaderError;

    fn try_from(value: VtblRecord) -> Result<Self, HeaderError> {
        let VtblRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            name_len,
            flags,
            ..
        } = value;

        let vol_type = vol_type.try_into()?;
        let upd_marker = upd_marker != 0;
        let name = name
            .get(..name_len as usize)
            .ok_or(HeaderError::BadName)
            .and_then(|bytes| std::str::from_utf8(bytes).map_err(|_| HeaderError::BadName))?
            .to_string();

        Ok(Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            flags,
        })
    }
}

impl From<VolTableRecord> for VtblRecord {
    fn from(value: VolTableRecord) -> VtblRecord {
        let VolTableRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            flags,
        } = value;

        let vol_type = vol_type.into();
        let upd_marker = upd_marker.into();
        let name_len = name.len() as _;

        let name_bytes = name.as_bytes();
        let mut name = std::array::from_fn(|_| 0u8);
        name[..name_bytes.len()].copy_from_slice(name_bytes);

        let mut target = Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            name_len,
            flags,

            crc: Default::default(),
            padding: Default::default(),
        };

        target.fix_crc();
        target
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encode() -> anyhow::Result<()> {
        let ec = Ec {
            vid_hdr_offset: 2048,
            data_offset: 4096,
            image_seq: 0xDEAD_F00D,
            ..Default::default()
        };
        let vid = Vid {
            vol_id: 3,
            lnum: 17,
            ..Default::default()
        };
        let vtbl = VolTableRecord {
            reserved_pebs: 42,
            alignment: 1,
            name: "example".to_string(),
            ..Default::default()
        };

        let mut buf = vec![0u8; 1024];

        ec.encode(&mut buf)?;
        assert_eq!(Ec::decode(&buf), Ok(ec));

        vid.encode(&mut buf)?;
        assert_eq!(Vid::decode(&buf), Ok(Some(vid)));

        let vec = vtbl.clone().into_bytes();
        assert_eq!(VolTableRecord::decode(&vec), Ok(Some(vtbl)));

        Ok(())
    }

    #[test]
    fn test_encoded_layout() -> anyhow::Result<()> {
        let mut buf = vec![0u8; UBI_EC_HDR_SIZE];
        let ec = Ec {
            vid_hdr_offset: 512,
            data_offset: 1024,
            image_seq: 1,
            ..Default::default()
        };
        ec.encode(&mut buf)?;

        // Magic up front, big-endian fields, and the CRC (over everything before it) last.
        assert_eq!(&buf[..4], b"UBI#");
        assert_eq!(buf[16..20], 512u32.to_be_bytes());
        assert_eq!(buf[20..24], 1024u32.to_be_bytes());
        let crc = UBI_CRC.checksum(&buf[..UBI_EC_HDR_SIZE - 4]);
        assert_eq!(buf[UBI_EC_HDR_SIZE - 4..], crc.to_be_bytes());

        let mut buf = vec![0u8; UBI_VID_HDR_SIZE];
        Vid::default().encode(&mut buf)?;
        assert_eq!(&buf[..4], b"UBI!");
        let crc = UBI_CRC.checksum(&buf[..UBI_VID_HDR_SIZE - 4]);
        assert_eq!(buf[UBI_VID_HDR_SIZE - 4..], crc.to_be_bytes());

        assert_eq!(VolTableRecord::empty_bytes().len(), UBI_VTBL_RECORD_SIZE);

        Ok(())
    }

    #[test]
    fn test_decode_errors() -> anyhow::Result<()> {
        let mut buf = vec![0u8; UBI_EC_HDR_SIZE];
        Ec::default().encode(&mut buf)?;

        assert_eq!(Ec::decode(&buf[..10]), Err(HeaderError::Truncated));

        buf[40] ^= 0x01; // inside the CRC-covered padding
        assert_eq!(Ec::decode(&buf), Err(HeaderError::BadCrc));
        buf[40] ^= 0x01;

        buf[0] = b'X';
        assert_eq!(Ec::decode(&buf), Err(HeaderError::BadMagic));

        Ok(())
    }

    #[test]
    fn test_empty_vid() {
        let buf = vec![0xFFu8; UBI_VID_HDR_SIZE];
        assert_eq!(Vid::decode(&buf), Ok(None));

        // Anything else in the magic bytes is a real decode attempt, not "empty".
        let mut buf = buf;
        buf[0] = 0x00;
        assert!(Vid::decode(&buf).is_err());
    }

    #[test]
    fn test_vtbl_empty_slot() {
        let bytes = VolTableRecord::empty_bytes();
        assert_eq!(VolTableRecord::decode(&bytes), Ok(None));

        // Unused slots are all-zero apart from the trailing CRC, which must still verify.
        assert!(bytes[..UBI_VTBL_RECORD_SIZE - 4].iter().all(|&x| x == 0));
        let crc = UBI_CRC.checksum(&bytes[..UBI_VTBL_RECORD_SIZE - 4]);
        assert_eq!(bytes[UBI_VTBL_RECORD_SIZE - 4..], crc.to_be_bytes());

        let mut corrupt = bytes.clone();
        corrupt[0] = 1;
        assert_eq!(VolTableRecord::decode(&corrupt), Err(HeaderError::BadCrc));
    }
}
