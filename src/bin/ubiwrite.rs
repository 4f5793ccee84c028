//! Erase a range of NAND eraseblocks and stream a payload into them, either verbatim or
//! wrapped in UBI metadata (EC/VID headers plus the volume table).

use anyhow::{ensure, Result};
use clap::Parser;
use log::info;

use std::path::PathBuf;

use ubi_nand_tools::nand::Flash;
use ubi_nand_tools::ubi::gen::{BlockGen, VolumeSpec};
use ubi_nand_tools::ubi::headers::UBI_LAYOUT_VOLUME_EBS;
use ubi_nand_tools::ubi::write::{erase_range, write_image};
use ubi_nand_tools::util::Source;

/// How many eraseblocks a sized-to-the-window volume leaves spare for bad-block handling.
const DEFAULT_SPARE_PEBS: i64 = 20;

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Cli {
    /// Number of eraseblocks to erase/write (default: up to the end of the device)
    #[clap(short = 'b', long = "blocks", value_name = "N")]
    count: Option<u32>,

    /// Write a JFFS2 clean marker into the OOB area of each written eraseblock's first page
    #[clap(short = 'c', long = "cleanmarker")]
    cleanmarker: bool,

    /// Read the payload from stdin
    #[clap(short = 'i', long = "stdin", conflicts_with = "input")]
    stdin: bool,

    /// Skip this many payload bytes before writing (not allowed with stdin)
    #[clap(
        short = 'k',
        long = "skip",
        value_name = "BYTES",
        conflicts_with = "stdin",
        default_value_t = 0
    )]
    skip: u64,

    /// Write at most this many payload bytes
    #[clap(short = 'l', long = "length", value_name = "BYTES")]
    length: Option<u64>,

    /// UBI volume ID
    #[clap(short = 'n', long = "vol-id", value_name = "ID", default_value_t = 0)]
    vol_id: u32,

    /// UBI volume name (required when writing a payload in UBI mode)
    #[clap(short = 'N', long = "vol-name", value_name = "NAME")]
    vol_name: Option<String>,

    /// First eraseblock of the window
    #[clap(short = 's', long = "start", value_name = "PEB", default_value_t = 0)]
    start: u32,

    /// Volume size in LEBs: positive = exact, 0 = whole window minus 20 spares,
    /// negative -k = whole window minus k
    #[clap(
        short = 'S',
        long = "vol-lebs",
        value_name = "N",
        default_value_t = 0,
        allow_negative_numbers = true
    )]
    vol_lebs: i64,

    /// Wrap the payload in UBI metadata
    #[clap(short = 'u', long = "ubi")]
    ubi: bool,

    /// Print only errors
    #[clap(short = 'q', long = "quiet", conflicts_with = "verbose")]
    quiet: bool,

    /// Print per-eraseblock detail
    #[clap(short = 'v', long = "verbose")]
    verbose: bool,

    /// MTD device path (e.g. /dev/mtd3) or partition name from /proc/mtd
    #[clap(value_name = "MTD_DEVICE")]
    device: String,

    /// Payload file
    #[clap(value_name = "INPUTFILE")]
    input: Option<PathBuf>,
}

fn run<F: Flash>(flash: &mut F, args: &Cli) -> Result<()> {
    let info = flash.info();
    let peb_count = info.peb_count();
    let eb_size = u64::from(info.eb_size);

    // Resolve and validate the eraseblock window up front; nothing is erased until every
    // check below has passed.
    ensure!(
        args.start < peb_count,
        "start PEB {} is past the end of the device ({peb_count} PEBs)",
        args.start
    );
    let count = args.count.unwrap_or(peb_count - args.start);
    ensure!(count > 0, "eraseblock window is empty");
    let end = args
        .start
        .checked_add(count)
        .filter(|&end| end <= peb_count)
        .ok_or(anyhow::anyhow!(
            "window of {count} PEBs at {} runs past the end of the device ({peb_count} PEBs)",
            args.start
        ))?;
    let window = args.start..end;

    let source = if args.stdin {
        Some(Source::from_stdin(args.length))
    } else if let Some(path) = &args.input {
        Some(Source::from_file(path, args.skip, args.length)?)
    } else {
        None
    };

    let (mut gen, capacity) = if args.ubi {
        let total_lebs = i64::from(count) - i64::from(UBI_LAYOUT_VOLUME_EBS);
        ensure!(
            total_lebs >= 0,
            "window of {count} PEBs cannot hold the {UBI_LAYOUT_VOLUME_EBS}-PEB layout volume"
        );

        let lebs = match args.vol_lebs {
            0 => total_lebs - DEFAULT_SPARE_PEBS,
            spare if spare < 0 => {
                ensure!(
                    spare <= -2,
                    "a negative volume size must reserve at least 2 eraseblocks"
                );
                total_lebs + spare
            }
            exact => exact,
        };
        ensure!(
            (0..=total_lebs).contains(&lebs),
            "volume size of {lebs} LEBs does not fit the window ({total_lebs} usable LEBs)"
        );

        if source.is_some() {
            ensure!(
                args.vol_name.is_some(),
                "a volume name (-N) is required to write a payload in UBI mode"
            );
        }

        let spec = VolumeSpec {
            vol_id: args.vol_id,
            name: args.vol_name.clone(),
            lebs: lebs as u32,
        };
        let gen = BlockGen::ubi(info, spec, source)?;
        let capacity = lebs as u64 * gen.leb_size() as u64;
        (gen, capacity)
    } else {
        (BlockGen::raw(info, source), u64::from(count) * eb_size)
    };

    if let Some(total) = gen.payload_total() {
        ensure!(
            total <= capacity,
            "payload of {total} bytes does not fit ({capacity} bytes available)"
        );
    }

    info!("erasing PEBs {}..{}", window.start, window.end);
    erase_range(flash, window.clone());

    if gen.want_more(args.cleanmarker) {
        info!("writing PEBs {}..{}", window.start, window.end);
        write_image(flash, &mut gen, window, args.cleanmarker)?;
    }

    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let level = match (args.quiet, args.verbose) {
        (true, _) => "error",
        (_, true) => "debug",
        _ => "info",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    if !args.quiet {
        howudoin::init(howudoin::consumers::TermLine::default());
    }

    #[cfg(not(target_os = "linux"))]
    anyhow::bail!("MTD devices are only supported on Linux");

    #[cfg(target_os = "linux")]
    {
        use ubi_nand_tools::nand::mtd::MtdFlash;

        // A path opens directly; anything else is looked up in /proc/mtd by name.
        let mut flash = if args.device.contains('/') {
            MtdFlash::open(&args.device)?
        } else {
            MtdFlash::open_named(&args.device)?
        };

        run(&mut flash, &args)
    }
}
