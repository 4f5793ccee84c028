//! UBI on-flash format support: the header codec, image generation, device writing, and
//! volume extraction.

pub mod extract;
pub mod gen;
pub mod headers;
pub mod write;
