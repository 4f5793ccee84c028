//! Tools for imaging NAND flash partitions with raw or UBI-formatted payloads, and for
//! pulling volume data back out of UBI image files.

pub mod nand;
pub mod ubi;
pub mod util;
