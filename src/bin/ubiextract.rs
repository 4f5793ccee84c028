//! Extract one volume's data payload from a UBI image file.

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};

use std::fs::File;
use std::path::PathBuf;

use ubi_nand_tools::ubi::extract::{extract_volume, ExtractOptions, VolumeRef};
use ubi_nand_tools::util::ByteSize;

#[derive(Parser, Debug)]
#[clap(version, about)]
#[clap(group(ArgGroup::new("volume").required(true)))]
struct Cli {
    /// Where to write the reconstructed volume data
    #[clap(short = 'o', long = "output", value_name = "OUT")]
    output: PathBuf,

    /// Size of one PEB in the image, e.g. 131072 or 128KiB
    #[clap(short = 'p', long = "peb-size", value_name = "PEBSIZE")]
    peb_size: ByteSize,

    /// Index of the volume to extract
    #[clap(short = 'i', long = "vol-index", value_name = "IDX", group = "volume")]
    index: Option<u32>,

    /// Name of the volume to extract
    #[clap(short = 'n', long = "vol-name", value_name = "NAME", group = "volume")]
    name: Option<String>,

    /// Skip eraseblocks whose headers fail validation
    #[clap(short = 's', long = "skip-bad")]
    skip_bad: bool,

    /// Print per-eraseblock detail
    #[clap(short = 'v', long = "verbose")]
    verbose: bool,

    /// UBI image file
    #[clap(value_name = "IMAGE")]
    image: PathBuf,
}

fn main() -> Result<()> {
    let Cli {
        output,
        peb_size,
        index,
        name,
        skip_bad,
        verbose,
        image,
    } = Cli::parse();

    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    howudoin::init(howudoin::consumers::TermLine::default());

    let volume = match (index, name) {
        (Some(index), None) => VolumeRef::Index(index),
        (None, Some(name)) => VolumeRef::Name(name),
        _ => unreachable!(), // the arg group admits exactly one
    };
    let peb_size = u32::try_from(peb_size.0).context("PEB size out of range")?;

    let mut image_file =
        File::open(&image).with_context(|| format!("cannot open {}", image.display()))?;
    let mut out =
        File::create(&output).with_context(|| format!("cannot create {}", output.display()))?;

    extract_volume(
        &mut image_file,
        &mut out,
        &ExtractOptions {
            peb_size,
            volume,
            skip_bad,
        },
    )
}
